//! Continuous live monitor.
//!
//! One background thread measures a biased channel at a fixed rate and
//! appends into a bounded ring buffer (oldest samples evicted).  Readers poll
//! [`LiveMonitor::data`] / [`LiveMonitor::status`] at their own pace without
//! disturbing the measurement timing.
//!
//! Ticks that find the registry busy (a sweep holds it) are skipped rather
//! than queued.  Only one loop may run at a time.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use ivcore_hal::ChannelRegistry;
use ivcore_hal::calibration::Calibration;
use ivcore_types::{IvError, SourceMode};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub channel: u8,
    pub bias_voltage: f64,
    pub nplc: f64,
    /// Current compliance, amps.
    pub compliance: f64,
    pub rate_hz: f64,
    /// Ring buffer size.
    pub capacity: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            channel: 2,
            bias_voltage: 0.0,
            nplc: 1.0,
            compliance: 0.1,
            rate_hz: 10.0,
            capacity: 1000,
        }
    }
}

impl MonitorConfig {
    fn interval(&self) -> Result<Duration, IvError> {
        if !(self.rate_hz.is_finite() && self.rate_hz > 0.0) {
            return Err(IvError::InvalidArgument(format!(
                "monitor rate must be positive (got {} Hz)",
                self.rate_hz
            )));
        }
        if self.capacity == 0 {
            return Err(IvError::InvalidArgument("monitor buffer capacity must be > 0".into()));
        }
        Ok(Duration::from_secs_f64(1.0 / self.rate_hz))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MonitorSample {
    pub timestamp: DateTime<Utc>,
    pub voltage: Option<f64>,
    pub current: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub irradiance: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorStatus {
    pub running: bool,
    pub configured: bool,
    pub measurement_count: u64,
    pub skipped_ticks: u64,
    pub buffer_size: usize,
    pub last_value: Option<MonitorSample>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub config: Option<MonitorConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorData {
    #[serde(flatten)]
    pub status: MonitorStatus,
    pub data: Vec<MonitorSample>,
}

#[derive(Default)]
struct MonitorState {
    config: Option<MonitorConfig>,
    running: bool,
    buffer: VecDeque<MonitorSample>,
    last_value: Option<MonitorSample>,
    error: Option<String>,
    measurement_count: u64,
    skipped_ticks: u64,
    started_at: Option<DateTime<Utc>>,
}

impl MonitorState {
    fn status(&self) -> MonitorStatus {
        MonitorStatus {
            running: self.running,
            configured: self.config.is_some(),
            measurement_count: self.measurement_count,
            skipped_ticks: self.skipped_ticks,
            buffer_size: self.buffer.len(),
            last_value: self.last_value,
            error: self.error.clone(),
            started_at: self.started_at,
            config: self.config,
        }
    }

    fn push(&mut self, sample: MonitorSample, capacity: usize) {
        while self.buffer.len() >= capacity {
            self.buffer.pop_front();
        }
        self.buffer.push_back(sample);
        self.last_value = Some(sample);
        self.measurement_count += 1;
    }
}

struct Worker {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

pub struct LiveMonitor {
    registry: Arc<ChannelRegistry>,
    calibration: Option<Arc<dyn Calibration>>,
    state: Arc<Mutex<MonitorState>>,
    worker: Mutex<Option<Worker>>,
}

impl LiveMonitor {
    pub fn new(registry: Arc<ChannelRegistry>) -> Self {
        Self {
            registry,
            calibration: None,
            state: Arc::new(Mutex::new(MonitorState::default())),
            worker: Mutex::new(None),
        }
    }

    /// Convert each measured current to irradiance with `calibration`.
    pub fn with_calibration(mut self, calibration: Arc<dyn Calibration>) -> Self {
        self.calibration = Some(calibration);
        self
    }

    /// Program the channel for monitoring: compliance and NPLC, VOLT source
    /// mode, bias level.
    ///
    /// # Errors
    ///
    /// [`IvError::Busy`] while running, [`IvError::InvalidArgument`] for a
    /// bad rate or capacity, and any registry failure.
    pub fn configure(&self, config: MonitorConfig) -> Result<(), IvError> {
        if self.state.lock().running {
            return Err(IvError::Busy("cannot configure the monitor while it is running".into()));
        }
        config.interval()?;

        let ch = config.channel;
        let programmed = self
            .registry
            .configure(ch, config.compliance, SourceMode::Curr, config.nplc)
            .and_then(|()| self.registry.set_source_mode(ch, SourceMode::Volt))
            .and_then(|()| self.registry.set_value(ch, config.bias_voltage));

        let mut state = self.state.lock();
        match programmed {
            Ok(()) => {
                state.config = Some(config);
                state.error = None;
                info!(channel = ch, rate_hz = config.rate_hz, bias = config.bias_voltage, "monitor configured");
                Ok(())
            }
            Err(e) => {
                state.error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Enable output, clear the buffer and start the measurement thread.
    ///
    /// # Errors
    ///
    /// [`IvError::Busy`] if already running, [`IvError::InvalidArgument`] if
    /// never configured, and any failure enabling the output.
    pub fn start(&self) -> Result<(), IvError> {
        let mut worker = self.worker.lock();
        let config = {
            let state = self.state.lock();
            if state.running {
                return Err(IvError::Busy("monitor already running".into()));
            }
            state
                .config
                .ok_or_else(|| IvError::InvalidArgument("monitor not configured".into()))?
        };
        let interval = config.interval()?;

        self.registry.output_control(config.channel, true)?;

        {
            let mut state = self.state.lock();
            state.buffer.clear();
            state.buffer.reserve(config.capacity.min(4096));
            state.measurement_count = 0;
            state.skipped_ticks = 0;
            state.last_value = None;
            state.error = None;
            state.started_at = Some(Utc::now());
            state.running = true;
        }

        let (stop, stop_rx) = mpsc::channel();
        let registry = Arc::clone(&self.registry);
        let calibration = self.calibration.clone();
        let state = Arc::clone(&self.state);
        let spawned = std::thread::Builder::new()
            .name("ivcore-monitor".into())
            .spawn(move || {
                debug!(interval_ms = interval.as_secs_f64() * 1e3, "monitor loop started");
                let mut next = Instant::now();
                loop {
                    tick(&registry, calibration.as_deref(), &state, &config);
                    next += interval;
                    let now = Instant::now();
                    if next < now {
                        next = now;
                    }
                    match stop_rx.recv_timeout(next - now) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("monitor loop exited");
            });

        match spawned {
            Ok(handle) => {
                *worker = Some(Worker { stop, handle });
                info!(channel = config.channel, rate_hz = config.rate_hz, "monitor started");
                Ok(())
            }
            Err(e) => {
                self.state.lock().running = false;
                Err(IvError::InvalidArgument(format!("cannot spawn monitor thread: {e}")))
            }
        }
    }

    /// Stop the loop, wait for it and disable the output.  Returns the
    /// number of samples taken.
    ///
    /// # Errors
    ///
    /// [`IvError::InvalidArgument`] if not running; a failure to disable the
    /// output is returned after the loop has stopped.
    pub fn stop(&self) -> Result<u64, IvError> {
        let Some(worker) = self.worker.lock().take() else {
            return Err(IvError::InvalidArgument("monitor is not running".into()));
        };
        let _ = worker.stop.send(());
        if worker.handle.join().is_err() {
            error!("monitor thread panicked");
        }

        let (channel, count) = {
            let mut state = self.state.lock();
            state.running = false;
            (state.config.map(|c| c.channel), state.measurement_count)
        };
        info!(samples = count, "monitor stopped");
        if let Some(ch) = channel {
            self.registry.output_control(ch, false)?;
        }
        Ok(count)
    }

    /// Stop if running; used as an abort callback.
    pub fn halt(&self) -> Result<(), IvError> {
        if self.is_running() {
            warn!("abort: stopping live monitor");
            self.stop()?;
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    pub fn status(&self) -> MonitorStatus {
        self.state.lock().status()
    }

    /// Status plus the `last_n` most recent samples, oldest first.
    pub fn data(&self, last_n: usize) -> MonitorData {
        let state = self.state.lock();
        let skip = state.buffer.len().saturating_sub(last_n);
        MonitorData {
            status: state.status(),
            data: state.buffer.iter().skip(skip).copied().collect(),
        }
    }
}

impl Drop for LiveMonitor {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.stop.send(());
            let _ = worker.handle.join();
        }
    }
}

fn tick(
    registry: &ChannelRegistry,
    calibration: Option<&dyn Calibration>,
    state: &Mutex<MonitorState>,
    config: &MonitorConfig,
) {
    match registry.measure(config.channel) {
        Ok(reading) => {
            let irradiance = calibration
                .zip(reading.current)
                .and_then(|(cal, amps)| cal.current_to_irradiance(amps));
            let sample = MonitorSample {
                timestamp: Utc::now(),
                voltage: reading.voltage,
                current: reading.current,
                irradiance,
            };
            state.lock().push(sample, config.capacity);
        }
        Err(IvError::Busy(_)) => {
            debug!("monitor tick skipped: registry busy");
            state.lock().skipped_ticks += 1;
        }
        Err(e) => {
            warn!(error = %e, "monitor measurement failed");
            state.lock().error = Some(e.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ivcore_hal::calibration::LinearCalibration;
    use ivcore_hal::sim::ScriptedConnector;
    use ivcore_hal::{RegistryOptions, SmuFactory, SmuType};
    use ivcore_types::NeverAbort;

    fn registry() -> Arc<ChannelRegistry> {
        let registry = Arc::new(ChannelRegistry::new(
            SmuFactory::new(Arc::new(ScriptedConnector::new())),
            Arc::new(NeverAbort),
            RegistryOptions::default(),
        ));
        registry
            .connect("MOCK", Some(SmuType::KeysightB2902), true, 2)
            .unwrap();
        registry
    }

    fn fast(capacity: usize) -> MonitorConfig {
        MonitorConfig {
            bias_voltage: 0.5,
            rate_hz: 200.0,
            capacity,
            ..MonitorConfig::default()
        }
    }

    #[test]
    fn collects_samples_and_disables_output_on_stop() {
        let registry = registry();
        let monitor = LiveMonitor::new(registry.clone());
        monitor.configure(fast(100)).unwrap();
        monitor.start().unwrap();
        assert!(registry.channel_status(2).unwrap().output_enabled);
        std::thread::sleep(Duration::from_millis(100));

        let data = monitor.data(5);
        assert!(data.status.running);
        assert!(!data.data.is_empty() && data.data.len() <= 5);
        let current = data.data[0].current.unwrap();
        assert!((current - 0.5 / 5000.0).abs() < 1e-6, "{current}");

        let count = monitor.stop().unwrap();
        assert!(count > 0);
        assert!(!monitor.is_running());
        assert!(!registry.channel_status(2).unwrap().output_enabled);
    }

    #[test]
    fn ring_buffer_evicts_oldest() {
        let monitor = LiveMonitor::new(registry());
        monitor.configure(fast(3)).unwrap();
        monitor.start().unwrap();
        std::thread::sleep(Duration::from_millis(100));
        monitor.stop().unwrap();

        let status = monitor.status();
        assert_eq!(status.buffer_size, 3);
        assert!(status.measurement_count > 3);
        let data = monitor.data(10).data;
        assert_eq!(data.len(), 3);
        assert!(data.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        assert_eq!(data.last().copied(), status.last_value);
    }

    #[test]
    fn lifecycle_rules() {
        let monitor = LiveMonitor::new(registry());
        assert!(matches!(monitor.start(), Err(IvError::InvalidArgument(_))));
        assert!(monitor.stop().is_err());

        let mut bad = fast(10);
        bad.rate_hz = 0.0;
        assert!(monitor.configure(bad).is_err());

        monitor.configure(fast(10)).unwrap();
        monitor.start().unwrap();
        assert!(matches!(monitor.start(), Err(IvError::Busy(_))));
        assert!(matches!(monitor.configure(fast(10)), Err(IvError::Busy(_))));
        monitor.halt().unwrap();
        assert!(!monitor.is_running());
        monitor.halt().unwrap();
    }

    #[test]
    fn irradiance_uses_calibration() {
        let monitor = LiveMonitor::new(registry()).with_calibration(Arc::new(LinearCalibration {
            responsivity: 0.5,
            max_current: 1.0,
        }));
        monitor.configure(fast(10)).unwrap();
        monitor.start().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        monitor.stop().unwrap();
        let sample = monitor.status().last_value.unwrap();
        let expected = sample.current.unwrap().abs() / 0.5;
        assert_eq!(sample.irradiance, Some(expected));
    }

    #[test]
    fn unconnected_channel_fails_configure_and_records_error() {
        let registry = Arc::new(ChannelRegistry::new(
            SmuFactory::new(Arc::new(ScriptedConnector::new())),
            Arc::new(NeverAbort),
            RegistryOptions::default(),
        ));
        let monitor = LiveMonitor::new(registry);
        assert!(monitor.configure(MonitorConfig::default()).is_err());
        assert!(monitor.status().error.is_some());
        assert!(!monitor.status().configured);
    }
}
