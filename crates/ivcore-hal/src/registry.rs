//! [`ChannelRegistry`] – the process-wide map from logical channel number to
//! driver, and the home of the sweep algorithms.
//!
//! Every operation takes the registry lock with a timeout
//! ([`RegistryOptions::lock_timeout`]) and fails with [`IvError::Busy`]
//! instead of queueing behind a long sweep.  Sweeps hold the lock for their
//! whole duration and watch the shared [`AbortSignal`] at every point
//! boundary.
//!
//! # Shared sessions
//!
//! A dual-channel instrument is one wire session.  The first channel to
//! connect opens it; any other channel on the same address is attached to
//! that session, either through an explicit `connect` or lazily the first
//! time an operation names it.  Attached channels skip `*RST` so the first
//! channel's configuration survives.
//!
//! # Sweep sequence
//!
//! 1. reject any CURR point above the software ceiling (nothing written yet)
//! 2. source mode → compliance on the partner quantity → optional NPLC
//! 3. enable output unless it is already on
//! 4. per point: abort check → set level → interruptible delay → measure
//! 5. disable output unless `keep_output_on`; always after abort or error

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use ivcore_types::{AbortSignal, IvError, Reading, Sample, SourceMode, SweepResult};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::factory::{SmuFactory, SmuType};
use crate::smu::{ChannelStatus, Smu};
use crate::sweep::{MAX_SWEEP_POINTS, SweepShape, generate_points};

/// Registry tuning.
#[derive(Debug, Clone, Copy)]
pub struct RegistryOptions {
    /// How long an operation waits for the registry lock before `Busy`.
    pub lock_timeout: Duration,
    /// Lock wait used by [`ChannelRegistry::emergency_shutdown`].
    pub shutdown_lock_timeout: Duration,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(2),
            shutdown_lock_timeout: Duration::from_millis(200),
        }
    }
}

/// Staircase sweep parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepRequest {
    #[serde(flatten)]
    pub shape: SweepShape,
    #[serde(default)]
    pub source_mode: SourceMode,
    /// Limit on the measured quantity.
    #[serde(default = "default_compliance")]
    pub compliance: f64,
    #[serde(default)]
    pub nplc: Option<f64>,
    #[serde(default = "default_delay")]
    pub delay_s: f64,
    #[serde(default)]
    pub keep_output_on: bool,
}

impl SweepRequest {
    pub fn new(shape: SweepShape) -> Self {
        Self {
            shape,
            source_mode: SourceMode::Volt,
            compliance: default_compliance(),
            nplc: None,
            delay_s: default_delay(),
            keep_output_on: false,
        }
    }
}

/// Arbitrary point-list sweep parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListSweepRequest {
    pub points: Vec<f64>,
    #[serde(default)]
    pub source_mode: SourceMode,
    #[serde(default = "default_compliance")]
    pub compliance: f64,
    #[serde(default)]
    pub nplc: Option<f64>,
    #[serde(default = "default_delay")]
    pub delay_s: f64,
    #[serde(default)]
    pub keep_output_on: bool,
}

fn default_compliance() -> f64 {
    0.01
}

fn default_delay() -> f64 {
    0.05
}

/// Outcome of a successful `connect`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectInfo {
    pub channel: u8,
    pub smu_type: SmuType,
    pub shared_session: bool,
    pub message: String,
}

/// Registry-wide snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistryStatus {
    pub connected: bool,
    pub address: Option<String>,
    pub smu_type: Option<SmuType>,
    pub mock: bool,
    pub channels: Vec<ChannelStatus>,
}

struct SweepPlan {
    points: Vec<f64>,
    source_mode: SourceMode,
    compliance: f64,
    nplc: Option<f64>,
    delay: Duration,
    keep_output_on: bool,
}

#[derive(Default)]
struct RegistryInner {
    address: Option<String>,
    smu_type: Option<SmuType>,
    mock: bool,
    channels: BTreeMap<u8, Box<dyn Smu>>,
}

/// Keyed map of logical channels to drivers.
///
/// ```rust
/// use std::sync::Arc;
/// use ivcore_hal::factory::SmuFactory;
/// use ivcore_hal::registry::{ChannelRegistry, RegistryOptions, SweepRequest};
/// use ivcore_hal::session::TcpConnector;
/// use ivcore_hal::sweep::SweepShape;
/// use ivcore_types::NeverAbort;
///
/// let registry = ChannelRegistry::new(
///     SmuFactory::new(Arc::new(TcpConnector::default())),
///     Arc::new(NeverAbort),
///     RegistryOptions::default(),
/// );
/// registry.connect("MOCK", None, true, 1).unwrap();
///
/// let mut req = SweepRequest::new(SweepShape::linear(0.0, 1.0, 3));
/// req.delay_s = 0.0;
/// let result = registry.sweep(1, &req).unwrap();
/// assert_eq!(result.results.len(), 3);
/// assert!(!result.aborted);
/// ```
pub struct ChannelRegistry {
    inner: Mutex<RegistryInner>,
    factory: SmuFactory,
    abort: Arc<dyn AbortSignal>,
    options: RegistryOptions,
}

impl ChannelRegistry {
    pub fn new(factory: SmuFactory, abort: Arc<dyn AbortSignal>, options: RegistryOptions) -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            factory,
            abort,
            options,
        }
    }

    fn lock(&self, operation: &str) -> Result<MutexGuard<'_, RegistryInner>, IvError> {
        self.inner
            .try_lock_for(self.options.lock_timeout)
            .ok_or_else(|| {
                warn!(operation, "registry lock not acquired");
                IvError::Busy(format!(
                    "instrument busy: {operation} could not acquire the registry within {} ms",
                    self.options.lock_timeout.as_millis()
                ))
            })
    }

    // ────────────────────────────────────────────────────────────────────────
    // Connection management
    // ────────────────────────────────────────────────────────────────────────

    /// Connect `channel` of the instrument at `address`.
    ///
    /// A new channel on the currently connected dual-channel address shares
    /// the open session.  Any other combination (different address, mock
    /// flag or type, or a channel that is already connected) first
    /// disconnects every existing channel.
    ///
    /// # Errors
    ///
    /// Propagates resolution, factory and driver connect failures; the
    /// registry is left empty when a fresh connect fails.
    pub fn connect(
        &self,
        address: &str,
        requested: Option<SmuType>,
        mock: bool,
        channel: u8,
    ) -> Result<ConnectInfo, IvError> {
        let mut inner = self.lock("connect")?;

        let shareable = inner.address.as_deref() == Some(address)
            && inner.mock == mock
            && !inner.channels.contains_key(&channel)
            && inner
                .smu_type
                .is_some_and(|t| t.is_dual_channel() && requested.is_none_or(|r| r == t));
        if shareable {
            let smu_type = attach_channel(&mut inner, &self.factory, channel)?;
            return Ok(ConnectInfo {
                channel,
                smu_type,
                shared_session: true,
                message: format!(
                    "Attached channel {channel} to {} at {address} (shared session)",
                    smu_type.description()
                ),
            });
        }

        if !inner.channels.is_empty() {
            info!(address, channel, "replacing existing connection");
            disconnect_all(&mut inner);
        }

        let smu_type = self.factory.resolve(address, requested, mock)?;
        let mut smu = self.factory.create(smu_type, address, channel, mock)?;
        smu.connect()?;

        inner.address = Some(address.to_string());
        inner.smu_type = Some(smu_type);
        inner.mock = mock;
        inner.channels.insert(channel, smu);
        info!(address, channel, smu = %smu_type, mock, "SMU connected");

        Ok(ConnectInfo {
            channel,
            smu_type,
            shared_session: false,
            message: format!(
                "Connected to {} at {address} (channel {channel}{})",
                smu_type.description(),
                if mock { ", mock" } else { "" }
            ),
        })
    }

    /// Disconnect every channel and forget the address.
    pub fn disconnect(&self) -> Result<(), IvError> {
        let mut inner = self.lock("disconnect")?;
        disconnect_all(&mut inner);
        info!("SMU disconnected");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.inner
            .try_lock_for(self.options.lock_timeout)
            .is_some_and(|inner| !inner.channels.is_empty())
    }

    // ────────────────────────────────────────────────────────────────────────
    // Per-channel operations
    // ────────────────────────────────────────────────────────────────────────

    fn with_channel<T>(
        &self,
        channel: u8,
        operation: &str,
        f: impl FnOnce(&mut dyn Smu) -> Result<T, IvError>,
    ) -> Result<T, IvError> {
        let mut inner = self.lock(operation)?;
        let smu = resolve_channel(&mut inner, &self.factory, channel)?;
        f(smu)
    }

    pub fn configure(
        &self,
        channel: u8,
        compliance: f64,
        compliance_type: SourceMode,
        nplc: f64,
    ) -> Result<(), IvError> {
        self.with_channel(channel, "configure", |smu| {
            smu.configure(compliance, compliance_type, nplc)
        })
    }

    pub fn set_source_mode(&self, channel: u8, mode: SourceMode) -> Result<(), IvError> {
        self.with_channel(channel, "set_source_mode", |smu| smu.set_source_mode(mode))
    }

    /// Command `value` in the channel's current source mode.
    pub fn set_value(&self, channel: u8, value: f64) -> Result<(), IvError> {
        self.with_channel(channel, "set_value", |smu| {
            let mode = smu.source_mode();
            smu.set_level(mode, value)
        })
    }

    pub fn output_control(&self, channel: u8, enabled: bool) -> Result<(), IvError> {
        self.with_channel(channel, "output_control", |smu| {
            if !enabled {
                smu.disable_output()
            } else if smu.output_enabled() {
                Ok(())
            } else {
                smu.enable_output()
            }
        })
    }

    pub fn measure(&self, channel: u8) -> Result<Reading, IvError> {
        self.with_channel(channel, "measure", |smu| smu.measure())
    }

    pub fn set_current_limit(&self, channel: u8, limit: Option<f64>) -> Result<(), IvError> {
        self.with_channel(channel, "set_current_limit", |smu| smu.set_current_limit(limit))
    }

    pub fn channel_status(&self, channel: u8) -> Result<ChannelStatus, IvError> {
        let inner = self.lock("channel_status")?;
        inner
            .channels
            .get(&channel)
            .map(|smu| smu.status())
            .ok_or(IvError::NotConnected { channel })
    }

    pub fn status(&self) -> Result<RegistryStatus, IvError> {
        let inner = self.lock("status")?;
        Ok(RegistryStatus {
            connected: !inner.channels.is_empty(),
            address: inner.address.clone(),
            smu_type: inner.smu_type,
            mock: inner.mock,
            channels: inner.channels.values().map(|smu| smu.status()).collect(),
        })
    }

    // ────────────────────────────────────────────────────────────────────────
    // Sweeps
    // ────────────────────────────────────────────────────────────────────────

    /// Linear or log staircase sweep, single or double.
    ///
    /// # Errors
    ///
    /// Invalid shapes fail before anything is commanded.  Driver errors end
    /// the sweep with output disabled.  An abort is not an error: the result
    /// carries `aborted = true` and the points taken so far.
    pub fn sweep(&self, channel: u8, request: &SweepRequest) -> Result<SweepResult, IvError> {
        let plan = SweepPlan {
            points: generate_points(&request.shape)?,
            source_mode: request.source_mode,
            compliance: request.compliance,
            nplc: request.nplc,
            delay: delay_from_secs(request.delay_s)?,
            keep_output_on: request.keep_output_on,
        };
        info!(
            channel,
            start = request.shape.start,
            stop = request.shape.stop,
            points = plan.points.len(),
            "starting sweep"
        );
        self.run_sweep(channel, &plan)
    }

    /// Sweep an explicit list of source values.
    ///
    /// # Errors
    ///
    /// As [`ChannelRegistry::sweep`]; an empty list is rejected.
    pub fn list_sweep(&self, channel: u8, request: &ListSweepRequest) -> Result<SweepResult, IvError> {
        if request.points.is_empty() {
            return Err(IvError::InvalidArgument("list sweep needs at least one point".into()));
        }
        if request.points.len() > MAX_SWEEP_POINTS {
            return Err(IvError::InvalidArgument(format!(
                "list sweep of {} points exceeds the limit of {MAX_SWEEP_POINTS}",
                request.points.len()
            )));
        }
        if let Some(bad) = request.points.iter().find(|p| !p.is_finite()) {
            return Err(IvError::InvalidArgument(format!("list sweep point {bad} is not finite")));
        }
        let plan = SweepPlan {
            points: request.points.clone(),
            source_mode: request.source_mode,
            compliance: request.compliance,
            nplc: request.nplc,
            delay: delay_from_secs(request.delay_s)?,
            keep_output_on: request.keep_output_on,
        };
        info!(channel, points = plan.points.len(), mode = %plan.source_mode, "starting list sweep");
        self.run_sweep(channel, &plan)
    }

    fn run_sweep(&self, channel: u8, plan: &SweepPlan) -> Result<SweepResult, IvError> {
        let mut inner = self.lock("sweep")?;
        let smu = resolve_channel(&mut inner, &self.factory, channel)?;

        if plan.source_mode == SourceMode::Curr {
            for &amps in &plan.points {
                smu.check_current_limit(amps)?;
            }
        }

        let mut result = SweepResult::default();
        let outcome = step_through(&mut *smu, self.abort.as_ref(), plan, &mut result);

        if result.aborted || outcome.is_err() || !plan.keep_output_on {
            if let Err(e) = smu.disable_output() {
                error!(channel, error = %e, "failed to disable output after sweep");
                if outcome.is_ok() {
                    return Err(e);
                }
            }
        }
        outcome?;

        if result.aborted {
            warn!(channel, points = result.results.len(), "sweep aborted");
        } else {
            info!(channel, points = result.results.len(), "sweep complete");
        }
        Ok(result)
    }

    // ────────────────────────────────────────────────────────────────────────
    // Safety
    // ────────────────────────────────────────────────────────────────────────

    /// Disable output on every connected channel, retrying each once.
    ///
    /// # Errors
    ///
    /// Returns the last failure after every channel has been attempted.
    pub fn disable_all_outputs(&self) -> Result<(), IvError> {
        let mut inner = self.lock("disable_all_outputs")?;
        let mut last_err = None;
        for (ch, smu) in inner.channels.iter_mut() {
            if let Err(first) = smu.disable_output() {
                warn!(channel = *ch, error = %first, "disable output failed, retrying");
                if let Err(e) = smu.disable_output() {
                    error!(channel = *ch, error = %e, "disable output failed twice");
                    last_err = Some(e);
                }
            }
        }
        last_err.map_or(Ok(()), Err)
    }

    /// Abort-time shutdown.  Waits only briefly for the lock: when a sweep
    /// holds it, that sweep's own abort path disables the output.
    pub fn emergency_shutdown(&self) {
        let Some(mut inner) = self.inner.try_lock_for(self.options.shutdown_lock_timeout) else {
            warn!("registry busy during emergency shutdown; running sweep will disable output");
            return;
        };
        for (ch, smu) in inner.channels.iter_mut() {
            if smu.output_enabled() {
                warn!(channel = *ch, "emergency shutdown: disabling output");
            }
            if let Err(e) = smu.disable_output() {
                error!(channel = *ch, error = %e, "emergency shutdown failed");
            }
        }
    }
}

fn delay_from_secs(secs: f64) -> Result<Duration, IvError> {
    Duration::try_from_secs_f64(secs)
        .map_err(|_| IvError::InvalidArgument(format!("invalid sweep delay {secs} s")))
}

fn step_through(
    smu: &mut dyn Smu,
    abort: &dyn AbortSignal,
    plan: &SweepPlan,
    result: &mut SweepResult,
) -> Result<(), IvError> {
    smu.set_source_mode(plan.source_mode)?;
    smu.set_compliance(plan.compliance, plan.source_mode.compliance_partner())?;
    if let Some(nplc) = plan.nplc {
        smu.set_nplc(nplc)?;
    }
    if !smu.output_enabled() {
        smu.enable_output()?;
    }

    for (i, &value) in plan.points.iter().enumerate() {
        if abort.is_abort_requested() {
            result.aborted = true;
            break;
        }
        smu.set_level(plan.source_mode, value)?;
        if !plan.delay.is_zero() && !abort.sleep(plan.delay) {
            result.aborted = true;
            break;
        }
        let reading = smu.measure()?;
        debug!(channel = smu.channel(), point = i, value, ?reading, "sweep point");
        result.results.push(Sample::new(value, reading));
    }
    Ok(())
}

fn resolve_channel<'a>(
    inner: &'a mut RegistryInner,
    factory: &SmuFactory,
    channel: u8,
) -> Result<&'a mut dyn Smu, IvError> {
    if !inner.channels.contains_key(&channel) {
        attach_channel(inner, factory, channel)?;
    }
    match inner.channels.get_mut(&channel) {
        Some(smu) => {
            let smu: &'a mut dyn Smu = smu.as_mut();
            Ok(smu)
        }
        None => Err(IvError::NotConnected { channel }),
    }
}

fn attach_channel(
    inner: &mut RegistryInner,
    factory: &SmuFactory,
    channel: u8,
) -> Result<SmuType, IvError> {
    let not_connected = IvError::NotConnected { channel };
    let (Some(address), Some(smu_type)) = (inner.address.clone(), inner.smu_type) else {
        return Err(not_connected);
    };
    if !smu_type.is_dual_channel() || channel == 0 || channel > smu_type.channel_count() {
        return Err(not_connected);
    }
    let session = inner.channels.values().find_map(|smu| smu.session());
    if session.is_none() && !inner.mock {
        return Err(not_connected);
    }

    let mut smu = factory.attach(smu_type, &address, channel, inner.mock, session)?;
    smu.connect()?;
    info!(address = %address, channel, "attached channel to shared session");
    inner.channels.insert(channel, smu);
    Ok(smu_type)
}

fn disconnect_all(inner: &mut RegistryInner) {
    // Attached channels go first so the owning driver closes the session last.
    let mut order: Vec<(bool, u8)> = inner
        .channels
        .iter()
        .map(|(ch, smu)| (!smu.status().shared_session, *ch))
        .collect();
    order.sort();
    for (_, ch) in order {
        if let Some(mut smu) = inner.channels.remove(&ch)
            && let Err(e) = smu.disconnect()
        {
            warn!(channel = ch, error = %e, "disconnect failed");
        }
    }
    inner.address = None;
    inner.smu_type = None;
    inner.mock = false;
}
