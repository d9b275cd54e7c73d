//! [`InstrumentService`] – the operation surface handed to embedders.
//!
//! Wires one [`RunManager`], one [`ChannelRegistry`], the [`ProtocolEngine`],
//! the [`LiveMonitor`] and a [`ProtocolLoader`] together, registers the
//! abort-time shutdown callbacks, and turns every `Result` into a
//! serialisable `{success, message, ..}` response.
//!
//! | Operation | Response |
//! |---|---|
//! | `connect(address, type, mock, channel)` | `{success, message, channel, smu_type, shared_session}` |
//! | `disconnect()` | `{success, message}` |
//! | `configure` / `set_source_mode` / `set_value` / `output_control` / `set_current_limit` | `{success, message}` |
//! | `measure(channel)` | `{success, message, voltage, current}` |
//! | `sweep` / `list_sweep` | `{success, message, results, aborted}` |
//! | `run_protocol(steps)` | [`ProtocolResult`] |
//! | `abort()` | `{success, message}` |
//! | `get_status()` | [`ServiceStatus`] |

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ivcore_hal::calibration::Calibration;
use ivcore_hal::registry::{ConnectInfo, RegistryStatus};
use ivcore_hal::relay::RelayBoard;
use ivcore_hal::session::{Connector, TcpConnector};
use ivcore_hal::sink::{CsvSink, DataSink};
use ivcore_hal::{ChannelRegistry, ListSweepRequest, RegistryOptions, SmuFactory, SmuType, SweepRequest};
use ivcore_kernel::{RunManager, RunState, RunStatus};
use ivcore_types::{IvError, Reading, SourceMode, SweepResult};
use serde::Serialize;
use tracing::{info, warn};

use crate::engine::{EngineOptions, ProtocolEngine, ProtocolResult, StopReason};
use crate::loader::{ProtocolLoader, ProtocolSummary};
use crate::monitor::{LiveMonitor, MonitorConfig, MonitorData, MonitorStatus};
use crate::protocol::ProtocolStep;

// ─────────────────────────────────────────────────────────────────────────────
// Construction
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub registry: RegistryOptions,
    pub abort_poll_interval: Duration,
    pub connect_timeout: Duration,
    pub io_timeout: Duration,
    pub engine: EngineOptions,
    pub protocols_dir: PathBuf,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            registry: RegistryOptions::default(),
            abort_poll_interval: ivcore_kernel::run_manager::DEFAULT_POLL_INTERVAL,
            connect_timeout: Duration::from_secs(5),
            io_timeout: Duration::from_secs(20),
            engine: EngineOptions::default(),
            protocols_dir: PathBuf::from("protocols"),
        }
    }
}

/// Collaborators substituted in tests or by embedders.
pub struct ServiceParts {
    pub connector: Arc<dyn Connector>,
    pub sink: Arc<dyn DataSink>,
    pub calibration: Option<Arc<dyn Calibration>>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Responses
// ─────────────────────────────────────────────────────────────────────────────

/// `{success, message}` plus the operation's payload when it succeeded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response<T> {
    pub success: bool,
    pub message: String,
    #[serde(flatten)]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<IvError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct NoData {}

pub type Ack = Response<NoData>;

impl<T> Response<T> {
    fn from_result(result: Result<T, IvError>, ok_message: impl FnOnce(&T) -> String) -> Self {
        match result {
            Ok(data) => Self {
                success: true,
                message: ok_message(&data),
                data: Some(data),
                error: None,
            },
            Err(e) => {
                warn!(error = %e, "operation failed");
                Self {
                    success: false,
                    message: e.to_string(),
                    data: None,
                    error: Some(e),
                }
            }
        }
    }
}

impl Ack {
    fn ack(result: Result<(), IvError>, message: &str) -> Self {
        Response::from_result(result.map(|()| NoData {}), |_| message.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectData {
    pub channel: u8,
    pub smu_type: SmuType,
    pub shared_session: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StopData {
    pub total_measurements: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceStatus {
    pub state: RunState,
    pub run_duration: Option<f64>,
    pub abort_requested: bool,
    pub run: RunStatus,
    pub protocol_running: bool,
    /// `None` when the registry was busy.
    pub instrument: Option<RegistryStatus>,
    pub monitor: MonitorStatus,
}

// ─────────────────────────────────────────────────────────────────────────────
// Service
// ─────────────────────────────────────────────────────────────────────────────

pub struct InstrumentService {
    run_manager: Arc<RunManager>,
    registry: Arc<ChannelRegistry>,
    engine: Arc<ProtocolEngine>,
    monitor: Arc<LiveMonitor>,
    loader: ProtocolLoader,
}

impl InstrumentService {
    /// Service talking raw-socket SCPI and writing CSV files.
    pub fn new(options: ServiceOptions) -> Self {
        let parts = ServiceParts {
            connector: Arc::new(TcpConnector::new(options.connect_timeout, options.io_timeout)),
            sink: Arc::new(CsvSink::new()),
            calibration: None,
        };
        Self::with_parts(options, parts)
    }

    pub fn with_parts(options: ServiceOptions, parts: ServiceParts) -> Self {
        let run_manager = Arc::new(RunManager::with_poll_interval(options.abort_poll_interval));
        let registry = Arc::new(ChannelRegistry::new(
            SmuFactory::new(parts.connector),
            run_manager.clone(),
            options.registry,
        ));
        let engine = Arc::new(ProtocolEngine::new(
            registry.clone(),
            run_manager.clone(),
            parts.sink,
            options.engine,
        ));
        let mut monitor = LiveMonitor::new(registry.clone());
        if let Some(cal) = parts.calibration {
            monitor = monitor.with_calibration(cal);
        }
        let monitor = Arc::new(monitor);

        // Weak handles: the registry already holds the run manager.
        let weak_monitor = Arc::downgrade(&monitor);
        run_manager.register_shutdown_callback("live_monitor", move || {
            weak_monitor.upgrade().map_or(Ok(()), |m| m.halt())
        });
        let weak_registry = Arc::downgrade(&registry);
        run_manager.register_shutdown_callback("smu_outputs", move || {
            if let Some(r) = weak_registry.upgrade() {
                r.emergency_shutdown();
            }
            Ok(())
        });

        info!(protocols = %options.protocols_dir.display(), "instrument service ready");
        Self {
            run_manager,
            registry,
            engine,
            monitor,
            loader: ProtocolLoader::new(options.protocols_dir),
        }
    }

    pub fn run_manager(&self) -> &Arc<RunManager> {
        &self.run_manager
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    pub fn engine(&self) -> &Arc<ProtocolEngine> {
        &self.engine
    }

    pub fn loader(&self) -> &ProtocolLoader {
        &self.loader
    }

    pub fn register_board(&self, name: &str, board: Box<dyn RelayBoard>) {
        self.engine.register_board(name, board);
    }

    // ────────────────────────────────────────────────────────────────────────
    // Instrument operations
    // ────────────────────────────────────────────────────────────────────────

    /// `smu_type` is a type tag or `"auto"`.
    pub fn connect(&self, address: &str, smu_type: &str, mock: bool, channel: u8) -> Response<ConnectData> {
        let result = SmuType::parse_tag(smu_type)
            .and_then(|t| self.registry.connect(address, t, mock, channel));
        match result {
            Ok(ConnectInfo {
                channel,
                smu_type,
                shared_session,
                message,
            }) => Response {
                success: true,
                message,
                data: Some(ConnectData {
                    channel,
                    smu_type,
                    shared_session,
                }),
                error: None,
            },
            Err(e) => Response::from_result(Err(e), |_| String::new()),
        }
    }

    pub fn disconnect(&self) -> Ack {
        if self.monitor.is_running()
            && let Err(e) = self.monitor.stop()
        {
            warn!(error = %e, "stopping monitor before disconnect failed");
        }
        Ack::ack(self.registry.disconnect(), "Disconnected")
    }

    pub fn configure(&self, channel: u8, compliance: f64, compliance_type: SourceMode, nplc: f64) -> Ack {
        Ack::ack(
            self.registry.configure(channel, compliance, compliance_type, nplc),
            "Configured",
        )
    }

    pub fn set_source_mode(&self, channel: u8, mode: SourceMode) -> Ack {
        Ack::ack(self.registry.set_source_mode(channel, mode), "Source mode set")
    }

    pub fn set_value(&self, channel: u8, value: f64) -> Ack {
        Ack::ack(self.registry.set_value(channel, value), "Value set")
    }

    pub fn output_control(&self, channel: u8, enabled: bool) -> Ack {
        let msg = if enabled { "Output enabled" } else { "Output disabled" };
        Ack::ack(self.registry.output_control(channel, enabled), msg)
    }

    pub fn set_current_limit(&self, channel: u8, limit: Option<f64>) -> Ack {
        Ack::ack(self.registry.set_current_limit(channel, limit), "Current limit updated")
    }

    pub fn measure(&self, channel: u8) -> Response<Reading> {
        Response::from_result(self.registry.measure(channel), |_| "Measured".into())
    }

    pub fn sweep(&self, channel: u8, request: &SweepRequest) -> Response<SweepResult> {
        let result = self.bracketed(|| self.registry.sweep(channel, request));
        Response::from_result(result, sweep_message)
    }

    pub fn list_sweep(&self, channel: u8, request: &ListSweepRequest) -> Response<SweepResult> {
        let result = self.bracketed(|| self.registry.list_sweep(channel, request));
        Response::from_result(result, sweep_message)
    }

    /// Run a direct operation as its own IDLE → ARMED → RUNNING → IDLE cycle
    /// so the abort flag of an earlier run does not cut it short.  When a
    /// protocol already owns the cycle the operation simply joins it.
    fn bracketed<T>(&self, op: impl FnOnce() -> Result<T, IvError>) -> Result<T, IvError> {
        let rm = &self.run_manager;
        let owned = matches!(rm.state(), RunState::Idle | RunState::Error | RunState::Aborted)
            && rm.reset()
            && rm.arm()
            && rm.start();
        let result = op();
        if owned && rm.state() == RunState::Running {
            match &result {
                Ok(_) => rm.complete(),
                Err(e) => rm.set_error(&e.to_string()),
            };
        }
        result
    }

    // ────────────────────────────────────────────────────────────────────────
    // Protocols
    // ────────────────────────────────────────────────────────────────────────

    /// Blocks until the protocol ends; run it on a worker thread and poll
    /// [`get_status`][Self::get_status] for progress.
    pub fn run_protocol(&self, steps: &[ProtocolStep]) -> ProtocolResult {
        self.engine.run(steps)
    }

    /// Load protocol `id` from the protocols directory and run it.
    pub fn run_protocol_file(&self, id: &str) -> Response<ProtocolResult> {
        match self.loader.load(id) {
            Ok(loaded) => {
                let result = self.engine.run_document(&loaded.document);
                Response {
                    success: result.success,
                    message: match result.stop_reason {
                        StopReason::Completed => format!("Protocol '{id}' completed"),
                        StopReason::Aborted => format!("Protocol '{id}' aborted"),
                        StopReason::Failed => format!(
                            "Protocol '{id}' failed: {}",
                            result.error.as_deref().unwrap_or("unknown error")
                        ),
                    },
                    data: Some(result),
                    error: None,
                }
            }
            Err(e) => Response::from_result(Err(e), |_| String::new()),
        }
    }

    pub fn list_protocols(&self) -> Vec<ProtocolSummary> {
        self.loader.list()
    }

    // ────────────────────────────────────────────────────────────────────────
    // Run supervision
    // ────────────────────────────────────────────────────────────────────────

    pub fn abort(&self) -> Ack {
        self.run_manager.abort();
        Ack::ack(
            Ok(()),
            "Abort requested; outputs disabled or switching off at the next sweep point",
        )
    }

    /// Clear an ERROR state.
    pub fn reset(&self) -> Ack {
        if self.run_manager.reset() {
            Ack::ack(Ok(()), "Reset to IDLE")
        } else {
            Ack::ack(
                Err(IvError::Busy(format!(
                    "cannot reset while {}",
                    self.run_manager.state()
                ))),
                "",
            )
        }
    }

    pub fn get_status(&self) -> ServiceStatus {
        let run = self.run_manager.status();
        ServiceStatus {
            state: run.state,
            run_duration: run.run_duration_s,
            abort_requested: run.abort_requested,
            protocol_running: self.engine.is_running(),
            instrument: self.registry.status().ok(),
            monitor: self.monitor.status(),
            run,
        }
    }

    // ────────────────────────────────────────────────────────────────────────
    // Live monitor
    // ────────────────────────────────────────────────────────────────────────

    pub fn monitor_configure(&self, config: MonitorConfig) -> Ack {
        Ack::ack(self.monitor.configure(config), "Monitor configured")
    }

    pub fn monitor_start(&self) -> Ack {
        Ack::ack(self.monitor.start(), "Monitoring started")
    }

    pub fn monitor_stop(&self) -> Response<StopData> {
        Response::from_result(
            self.monitor
                .stop()
                .map(|total_measurements| StopData { total_measurements }),
            |d| format!("Stopped after {} measurements", d.total_measurements),
        )
    }

    pub fn monitor_data(&self, last_n: usize) -> MonitorData {
        self.monitor.data(last_n)
    }

    pub fn monitor_status(&self) -> MonitorStatus {
        self.monitor.status()
    }
}

fn sweep_message(result: &SweepResult) -> String {
    if result.aborted {
        format!("Sweep aborted after {} points", result.results.len())
    } else {
        format!("Sweep complete: {} points", result.results.len())
    }
}
