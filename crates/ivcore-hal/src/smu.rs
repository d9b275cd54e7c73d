//! The Instrument Driver Layer.
//!
//! [`Smu`] is the uniform capability interface every instrument family
//! implements.  [`ScpiSmu`] is the single SCPI implementation; what differs
//! between families is supplied by its [`Dialect`] type parameter, so each
//! family is a distinct concrete type ([`KeysightB2901`], [`KeysightB2902`],
//! [`Keithley2400`]).
//!
//! # Legal states
//!
//! | Operation | Allowed in | Ends in |
//! |---|---|---|
//! | `connect` | OFF, ERROR | IDLE |
//! | `set_source_mode`, `set_voltage`, `set_compliance`, `set_nplc`, `measure` | IDLE, CONFIGURED, ARMED, RUNNING | unchanged |
//! | `set_current` | IDLE, CONFIGURED, ARMED, RUNNING, ERROR | ERROR → IDLE |
//! | `configure` | IDLE, CONFIGURED, ARMED, RUNNING | CONFIGURED (RUNNING if output on) |
//! | `enable_output` | IDLE, CONFIGURED, ARMED, ERROR | RUNNING |
//! | `disable_output` | any | IDLE (no-op when OFF) |
//! | `disconnect` | any | OFF |
//!
//! A wire failure moves the driver to ERROR and surfaces
//! [`IvError::Communication`]; the caller must reconnect.

use std::sync::Arc;
use std::time::Duration;

use ivcore_types::{InstrumentState, IvError, Reading, SourceMode};
use rand::Rng;
use serde::Serialize;
use tracing::{debug, error, info, trace, warn};

use crate::dialect::{B2901Dialect, B2902Dialect, Dialect, Keithley2400Dialect, MeasureCommand};
use crate::factory::SmuType;
use crate::session::{Connector, SharedSession, share};

/// Tolerance applied to the software current ceiling.
pub const CURRENT_LIMIT_TOLERANCE: f64 = 1.001;

const IDN_RETRY_DELAY: Duration = Duration::from_millis(200);

const WORKING: &[InstrumentState] = &[
    InstrumentState::Idle,
    InstrumentState::Configured,
    InstrumentState::Armed,
    InstrumentState::Running,
];

/// Snapshot of one driver, as reported by registry status queries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelStatus {
    pub channel: u8,
    pub smu_type: SmuType,
    pub state: InstrumentState,
    pub output_enabled: bool,
    pub source_mode: SourceMode,
    pub voltage: f64,
    pub current: f64,
    pub current_compliance: f64,
    pub voltage_compliance: f64,
    pub nplc: f64,
    pub current_limit: Option<f64>,
    pub shared_session: bool,
    pub identity: Option<String>,
}

/// Uniform capability interface over one logical SMU channel.
pub trait Smu: Send {
    fn smu_type(&self) -> SmuType;
    fn address(&self) -> &str;
    fn channel(&self) -> u8;
    fn is_mock(&self) -> bool;
    fn state(&self) -> InstrumentState;
    fn output_enabled(&self) -> bool;
    fn source_mode(&self) -> SourceMode;
    fn status(&self) -> ChannelStatus;

    /// The open wire session, for attaching a sibling channel.
    fn session(&self) -> Option<SharedSession>;

    fn current_limit(&self) -> Option<f64>;

    /// Set (or clear with `None`) the software current ceiling.
    ///
    /// # Errors
    ///
    /// [`IvError::InvalidArgument`] if the limit is not a positive number.
    fn set_current_limit(&mut self, limit: Option<f64>) -> Result<(), IvError>;

    /// Reject `amps` if it exceeds the software ceiling.
    ///
    /// # Errors
    ///
    /// [`IvError::SafetyInterlock`] when `|amps| > limit × 1.001`.
    fn check_current_limit(&self, amps: f64) -> Result<(), IvError> {
        if let Some(limit) = self.current_limit()
            && amps.abs() > limit * CURRENT_LIMIT_TOLERANCE
        {
            return Err(IvError::SafetyInterlock {
                requested: amps,
                limit,
            });
        }
        Ok(())
    }

    fn connect(&mut self) -> Result<(), IvError>;
    fn disconnect(&mut self) -> Result<(), IvError>;
    fn set_source_mode(&mut self, mode: SourceMode) -> Result<(), IvError>;
    fn set_voltage(&mut self, volts: f64) -> Result<(), IvError>;
    fn set_current(&mut self, amps: f64) -> Result<(), IvError>;
    fn set_compliance(&mut self, limit: f64, limit_type: SourceMode) -> Result<(), IvError>;
    fn set_nplc(&mut self, nplc: f64) -> Result<(), IvError>;
    fn configure(
        &mut self,
        compliance: f64,
        compliance_type: SourceMode,
        nplc: f64,
    ) -> Result<(), IvError>;
    fn enable_output(&mut self) -> Result<(), IvError>;
    fn disable_output(&mut self) -> Result<(), IvError>;
    fn measure(&mut self) -> Result<Reading, IvError>;

    /// Command `value` in the given source mode.
    fn set_level(&mut self, mode: SourceMode, value: f64) -> Result<(), IvError> {
        match mode {
            SourceMode::Volt => self.set_voltage(value),
            SourceMode::Curr => self.set_current(value),
        }
    }
}

pub type KeysightB2901 = ScpiSmu<B2901Dialect>;
pub type KeysightB2902 = ScpiSmu<B2902Dialect>;
pub type Keithley2400 = ScpiSmu<Keithley2400Dialect>;

/// SCPI driver for one logical channel, parameterised by command dialect.
pub struct ScpiSmu<D: Dialect> {
    dialect: D,
    address: String,
    mock: bool,
    state: InstrumentState,
    connector: Option<Arc<dyn Connector>>,
    session: Option<SharedSession>,
    owns_session: bool,
    reset_on_connect: bool,
    identity: Option<String>,
    source_mode: SourceMode,
    voltage: f64,
    current: f64,
    current_compliance: f64,
    voltage_compliance: f64,
    nplc: f64,
    output_on: bool,
    current_limit: Option<f64>,
}

impl<D: Dialect> ScpiSmu<D> {
    /// A driver that opens (and later closes) its own session and resets the
    /// instrument on connect.
    pub fn new(dialect: D, address: impl Into<String>, mock: bool, connector: Arc<dyn Connector>) -> Self {
        Self::build(dialect, address.into(), mock, Some(connector), None, true, true)
    }

    /// A driver for a second logical channel of an instrument whose session
    /// is already open.  The session is never reset or closed by this driver.
    pub fn attach(dialect: D, address: impl Into<String>, mock: bool, session: Option<SharedSession>) -> Self {
        Self::build(dialect, address.into(), mock, None, session, false, false)
    }

    fn build(
        dialect: D,
        address: String,
        mock: bool,
        connector: Option<Arc<dyn Connector>>,
        session: Option<SharedSession>,
        owns_session: bool,
        reset_on_connect: bool,
    ) -> Self {
        Self {
            dialect,
            address,
            mock,
            state: InstrumentState::Off,
            connector,
            session,
            owns_session,
            reset_on_connect,
            identity: None,
            source_mode: SourceMode::Volt,
            voltage: 0.0,
            current: 0.0,
            current_compliance: 0.1,
            voltage_compliance: 21.0,
            nplc: 1.0,
            output_on: false,
            current_limit: None,
        }
    }

    /// Skip (or force) `*RST` on connect.
    pub fn with_reset_on_connect(mut self, reset: bool) -> Self {
        self.reset_on_connect = reset;
        self
    }

    fn transition(&mut self, to: InstrumentState) {
        if self.state != to {
            info!(
                smu = %self.dialect.smu_type(),
                channel = self.dialect.channel(),
                from = %self.state,
                to = %to,
                "driver state transition"
            );
            self.state = to;
        }
    }

    fn require(&self, operation: &str, allowed: &[InstrumentState]) -> Result<(), IvError> {
        if allowed.contains(&self.state) {
            return Ok(());
        }
        warn!(
            channel = self.dialect.channel(),
            operation,
            state = %self.state,
            "operation rejected in current state"
        );
        Err(IvError::NotPermitted {
            operation: operation.to_string(),
            state: self.state,
            allowed: allowed.to_vec(),
        })
    }

    fn fail(&mut self, err: IvError) -> IvError {
        error!(channel = self.dialect.channel(), error = %err, "driver fault");
        self.transition(InstrumentState::Error);
        err
    }

    fn session_handle(&self) -> Result<SharedSession, IvError> {
        self.session.clone().ok_or(IvError::NotConnected {
            channel: self.dialect.channel(),
        })
    }

    /// Write without state side effects.
    fn send(&self, command: &str) -> Result<(), IvError> {
        if self.mock {
            trace!(channel = self.dialect.channel(), command, "mock write");
            return Ok(());
        }
        let session = self.session_handle()?;
        let result = session.lock().write(command);
        result
    }

    fn write(&mut self, command: &str) -> Result<(), IvError> {
        self.send(command).map_err(|e| self.fail(e))
    }

    fn query(&mut self, command: &str) -> Result<String, IvError> {
        let session = self.session_handle().map_err(|e| self.fail(e))?;
        let result = session.lock().query(command);
        result.map_err(|e| self.fail(e))
    }

    fn identify(&mut self) -> Result<String, IvError> {
        let session = self.session_handle()?;
        if let Err(e) = session.lock().clear() {
            debug!(error = %e, "clear before *IDN? failed");
        }
        let first = session.lock().query("*IDN?");
        match first {
            Ok(idn) => Ok(idn),
            Err(e) => {
                warn!(error = %e, "*IDN? failed, retrying once");
                let mut guard = session.lock();
                let _ = guard.clear();
                std::thread::sleep(IDN_RETRY_DELAY);
                guard.query("*IDN?")
            }
        }
    }

    fn parse_value(&mut self, raw: &str) -> Result<f64, IvError> {
        raw.trim().parse::<f64>().map_err(|_| {
            let err = IvError::communication(
                self.address.clone(),
                format!("malformed numeric response '{raw}'"),
            );
            self.fail(err)
        })
    }

    fn mock_reading(&self) -> Reading {
        if !self.output_on {
            return Reading::from_raw(0.0, 0.0);
        }
        let load_ohms = if self.dialect.channel() == 1 { 1_000.0 } else { 5_000.0 };
        let mut rng = rand::thread_rng();
        let (v, i) = match self.source_mode {
            SourceMode::Volt => {
                let i = (self.voltage / load_ohms).clamp(-self.current_compliance, self.current_compliance);
                (self.voltage, i)
            }
            SourceMode::Curr => {
                let v = (self.current * load_ohms).clamp(-self.voltage_compliance, self.voltage_compliance);
                (v, self.current)
            }
        };
        Reading::from_raw(
            v + rng.gen_range(-1.0..1.0) * 1e-4,
            i + rng.gen_range(-1.0..1.0) * 1e-9,
        )
    }
}

impl<D: Dialect> Smu for ScpiSmu<D> {
    fn smu_type(&self) -> SmuType {
        self.dialect.smu_type()
    }

    fn address(&self) -> &str {
        &self.address
    }

    fn channel(&self) -> u8 {
        self.dialect.channel()
    }

    fn is_mock(&self) -> bool {
        self.mock
    }

    fn state(&self) -> InstrumentState {
        self.state
    }

    fn output_enabled(&self) -> bool {
        self.output_on
    }

    fn source_mode(&self) -> SourceMode {
        self.source_mode
    }

    fn status(&self) -> ChannelStatus {
        ChannelStatus {
            channel: self.dialect.channel(),
            smu_type: self.dialect.smu_type(),
            state: self.state,
            output_enabled: self.output_on,
            source_mode: self.source_mode,
            voltage: self.voltage,
            current: self.current,
            current_compliance: self.current_compliance,
            voltage_compliance: self.voltage_compliance,
            nplc: self.nplc,
            current_limit: self.current_limit,
            shared_session: !self.owns_session,
            identity: self.identity.clone(),
        }
    }

    fn session(&self) -> Option<SharedSession> {
        self.session.clone()
    }

    fn current_limit(&self) -> Option<f64> {
        self.current_limit
    }

    fn set_current_limit(&mut self, limit: Option<f64>) -> Result<(), IvError> {
        if let Some(l) = limit
            && !(l.is_finite() && l > 0.0)
        {
            return Err(IvError::InvalidArgument(format!(
                "current limit must be a positive number, got {l}"
            )));
        }
        info!(channel = self.dialect.channel(), ?limit, "software current limit set");
        self.current_limit = limit;
        Ok(())
    }

    fn connect(&mut self) -> Result<(), IvError> {
        self.require("connect", &[InstrumentState::Off, InstrumentState::Error])?;

        if self.mock {
            info!(smu = %self.dialect.smu_type(), channel = self.dialect.channel(), address = %self.address, "MOCK: connected");
            self.source_mode = SourceMode::Volt;
            self.transition(InstrumentState::Idle);
            return Ok(());
        }

        if self.owns_session {
            if let Some(old) = self.session.take() {
                let _ = old.lock().close();
            }
            let connector = self.connector.clone().ok_or_else(|| {
                IvError::communication(self.address.clone(), "no connector configured")
            })?;
            let raw = connector.open(&self.address).map_err(|e| self.fail(e))?;
            self.session = Some(share(raw));

            let idn = self.identify().map_err(|e| self.fail(e))?;
            info!(channel = self.dialect.channel(), identity = %idn, "connected");
            if let Err(details) = self.dialect.check_identity(&idn) {
                let err = IvError::Resolution(details);
                return Err(self.fail(err));
            }
            self.identity = Some(idn);
        } else if self.session.is_none() {
            let err = IvError::NotConnected {
                channel: self.dialect.channel(),
            };
            return Err(self.fail(err));
        } else {
            info!(channel = self.dialect.channel(), "using shared session");
        }

        if self.reset_on_connect {
            self.write("*RST")?;
        }
        let cmd = self.dialect.source_function(SourceMode::Volt);
        self.write(&cmd)?;
        self.source_mode = SourceMode::Volt;
        self.output_on = false;
        self.transition(InstrumentState::Idle);
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), IvError> {
        if !matches!(self.state, InstrumentState::Off | InstrumentState::Error)
            && let Err(e) = self.disable_output()
        {
            warn!(channel = self.dialect.channel(), error = %e, "disable on disconnect failed");
        }
        if let Some(session) = self.session.take()
            && self.owns_session
            && !self.mock
        {
            match session.lock().close() {
                Ok(()) => info!(address = %self.address, "closed SMU session"),
                Err(e) => warn!(address = %self.address, error = %e, "error closing session"),
            }
        }
        self.output_on = false;
        self.transition(InstrumentState::Off);
        Ok(())
    }

    fn set_source_mode(&mut self, mode: SourceMode) -> Result<(), IvError> {
        self.require("set_source_mode", WORKING)?;
        let cmd = self.dialect.source_function(mode);
        self.write(&cmd)?;
        self.source_mode = mode;
        Ok(())
    }

    fn set_voltage(&mut self, volts: f64) -> Result<(), IvError> {
        self.require("set_voltage", WORKING)?;
        if !volts.is_finite() {
            return Err(IvError::InvalidArgument(format!("voltage {volts} is not finite")));
        }
        let cmd = self.dialect.source_level(SourceMode::Volt, volts);
        self.write(&cmd)?;
        self.voltage = volts;
        debug!(channel = self.dialect.channel(), volts, "voltage set");
        Ok(())
    }

    fn set_current(&mut self, amps: f64) -> Result<(), IvError> {
        self.check_current_limit(amps)?;
        let mut allowed = WORKING.to_vec();
        allowed.push(InstrumentState::Error);
        self.require("set_current", &allowed)?;
        if !amps.is_finite() {
            return Err(IvError::InvalidArgument(format!("current {amps} is not finite")));
        }
        let function = self.dialect.source_function(SourceMode::Curr);
        self.write(&function)?;
        let level = self.dialect.source_level(SourceMode::Curr, amps);
        self.write(&level)?;
        self.source_mode = SourceMode::Curr;
        self.current = amps;
        if self.state == InstrumentState::Error {
            self.transition(InstrumentState::Idle);
        }
        debug!(channel = self.dialect.channel(), amps, "current set");
        Ok(())
    }

    fn set_compliance(&mut self, limit: f64, limit_type: SourceMode) -> Result<(), IvError> {
        self.require("set_compliance", WORKING)?;
        if !(limit.is_finite() && limit > 0.0) {
            return Err(IvError::InvalidArgument(format!(
                "compliance must be a positive number, got {limit}"
            )));
        }
        let cmd = self.dialect.protection(limit_type, limit);
        self.write(&cmd)?;
        match limit_type {
            SourceMode::Curr => self.current_compliance = limit,
            SourceMode::Volt => self.voltage_compliance = limit,
        }
        Ok(())
    }

    fn set_nplc(&mut self, nplc: f64) -> Result<(), IvError> {
        self.require("set_nplc", WORKING)?;
        if !(nplc.is_finite() && nplc > 0.0) {
            return Err(IvError::InvalidArgument(format!(
                "NPLC must be a positive number, got {nplc}"
            )));
        }
        for quantity in [SourceMode::Volt, SourceMode::Curr] {
            let cmd = self.dialect.nplc(quantity, nplc);
            self.write(&cmd)?;
        }
        self.nplc = nplc;
        Ok(())
    }

    fn configure(
        &mut self,
        compliance: f64,
        compliance_type: SourceMode,
        nplc: f64,
    ) -> Result<(), IvError> {
        self.require("configure", WORKING)?;
        self.set_compliance(compliance, compliance_type)?;
        self.set_nplc(nplc)?;
        if !self.output_on {
            self.transition(InstrumentState::Configured);
        }
        Ok(())
    }

    fn enable_output(&mut self) -> Result<(), IvError> {
        self.require(
            "enable_output",
            &[
                InstrumentState::Idle,
                InstrumentState::Configured,
                InstrumentState::Armed,
                InstrumentState::Error,
            ],
        )?;
        let cmd = self.dialect.output(true);
        self.write(&cmd)?;
        self.output_on = true;
        if !self.mock {
            let q = self.dialect.output_query();
            let resp = self.query(&q)?;
            if !(resp.contains('1') || resp.to_ascii_uppercase().contains("ON")) {
                warn!(channel = self.dialect.channel(), response = %resp, "output ON not confirmed");
            }
        }
        self.transition(InstrumentState::Running);
        Ok(())
    }

    fn disable_output(&mut self) -> Result<(), IvError> {
        if self.state == InstrumentState::Off {
            return Ok(());
        }
        if let Some(abort) = self.dialect.abort()
            && let Err(e) = self.send(&abort)
        {
            debug!(channel = self.dialect.channel(), error = %e, "abort before output off failed");
        }
        let cmd = self.dialect.output(false);
        self.write(&cmd)?;
        self.output_on = false;
        self.transition(InstrumentState::Idle);
        Ok(())
    }

    fn measure(&mut self) -> Result<Reading, IvError> {
        self.require("measure", WORKING)?;
        if self.mock {
            return Ok(self.mock_reading());
        }
        let (v, i) = match self.dialect.measure() {
            MeasureCommand::Separate { voltage, current } => {
                let v_raw = self.query(&voltage)?;
                let i_raw = self.query(&current)?;
                (self.parse_value(&v_raw)?, self.parse_value(&i_raw)?)
            }
            MeasureCommand::Combined { format, read } => {
                self.write(&format)?;
                let raw = self.query(&read)?;
                let mut fields = raw.split(',');
                let v_raw = fields.next().unwrap_or_default().to_string();
                let i_raw = fields.next().unwrap_or_default().to_string();
                (self.parse_value(&v_raw)?, self.parse_value(&i_raw)?)
            }
        };
        let reading = Reading::from_raw(v, i);
        trace!(channel = self.dialect.channel(), ?reading, "measured");
        Ok(reading)
    }
}
