use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Magnitude at or above which an instrument reading is an overload sentinel
/// (SCPI instruments report `9.91E+37` for "no valid reading").
pub const OVERLOAD_THRESHOLD: f64 = 1e37;

/// Which quantity a channel sources.  The other quantity is measured and
/// clamped by compliance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema)]
pub enum SourceMode {
    #[default]
    #[serde(rename = "VOLT", alias = "volt")]
    Volt,
    #[serde(rename = "CURR", alias = "curr")]
    Curr,
}

impl SourceMode {
    /// SCPI mnemonic (`VOLT` / `CURR`).
    pub fn as_scpi(self) -> &'static str {
        match self {
            SourceMode::Volt => "VOLT",
            SourceMode::Curr => "CURR",
        }
    }

    /// The measured quantity whose compliance protects the device while
    /// sourcing `self`.
    pub fn compliance_partner(self) -> SourceMode {
        match self {
            SourceMode::Volt => SourceMode::Curr,
            SourceMode::Curr => SourceMode::Volt,
        }
    }
}

impl fmt::Display for SourceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_scpi())
    }
}

impl FromStr for SourceMode {
    type Err = IvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "VOLT" => Ok(SourceMode::Volt),
            "CURR" => Ok(SourceMode::Curr),
            other => Err(IvError::InvalidArgument(format!(
                "invalid source mode '{other}', expected VOLT or CURR"
            ))),
        }
    }
}

/// Per-driver lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InstrumentState {
    Off,
    Idle,
    Configured,
    Armed,
    Running,
    Error,
}

impl fmt::Display for InstrumentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstrumentState::Off => "OFF",
            InstrumentState::Idle => "IDLE",
            InstrumentState::Configured => "CONFIGURED",
            InstrumentState::Armed => "ARMED",
            InstrumentState::Running => "RUNNING",
            InstrumentState::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// A spot measurement.  `None` means the instrument reported an overload
/// sentinel (or an unparseable value) for that quantity.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Reading {
    pub voltage: Option<f64>,
    pub current: Option<f64>,
}

impl Reading {
    /// Build a reading from raw instrument values, mapping overload
    /// sentinels to `None`.
    pub fn from_raw(voltage: f64, current: f64) -> Self {
        Self {
            voltage: sanitize(voltage),
            current: sanitize(current),
        }
    }
}

/// Map an instrument value to `None` when it is an overload sentinel or not
/// finite.
pub fn sanitize(value: f64) -> Option<f64> {
    if !value.is_finite() || value.abs() >= OVERLOAD_THRESHOLD {
        None
    } else {
        Some(value)
    }
}

/// One sweep point: the commanded value and what was measured there.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub set_value: f64,
    pub voltage: Option<f64>,
    pub current: Option<f64>,
}

impl Sample {
    pub fn new(set_value: f64, reading: Reading) -> Self {
        Self {
            set_value,
            voltage: reading.voltage,
            current: reading.current,
        }
    }
}

/// Outcome of a sweep.  `aborted` is set whenever the sweep stopped early
/// because of an operator abort; `results` then holds the points taken.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SweepResult {
    pub results: Vec<Sample>,
    pub aborted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum SweepScale {
    #[default]
    Linear,
    Log,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum SweepDirection {
    #[default]
    Forward,
    Backward,
}

/// `Double` appends the return leg to the forward leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum SweepKind {
    #[default]
    Single,
    Double,
}

/// Cooperative cancellation seen by every long-running loop.
///
/// The run manager implements this; the registry and protocol engine only
/// ever see the trait, so tests can substitute their own signal.
pub trait AbortSignal: Send + Sync {
    /// `true` once an abort has been requested and not yet cleared.
    fn is_abort_requested(&self) -> bool;

    /// Sleep for up to `duration`, waking early on abort.
    ///
    /// Returns `true` when the full duration elapsed and `false` when the
    /// wait was cut short by an abort request.
    fn sleep(&self, duration: Duration) -> bool;
}

/// An [`AbortSignal`] that is never raised.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverAbort;

impl AbortSignal for NeverAbort {
    fn is_abort_requested(&self) -> bool {
        false
    }

    fn sleep(&self, duration: Duration) -> bool {
        std::thread::sleep(duration);
        true
    }
}

/// Workspace-wide error type covering every failure class of the control
/// core.  Overload readings and operator aborts are outcomes, not errors,
/// and have no variant here.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IvError {
    #[error("Operation '{operation}' not permitted in state {state} (allowed: {allowed:?})")]
    NotPermitted {
        operation: String,
        state: InstrumentState,
        allowed: Vec<InstrumentState>,
    },

    #[error("Hardware communication error on {component}: {details}")]
    Communication { component: String, details: String },

    #[error("SAFETY: requested {requested:.3e} A exceeds software limit {limit:.3e} A")]
    SafetyInterlock { requested: f64, limit: f64 },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Instrument resolution failed: {0}")]
    Resolution(String),

    #[error("Instrument not connected on channel {channel}")]
    NotConnected { channel: u8 },

    #[error("Busy: {0}")]
    Busy(String),

    #[error("Protocol error at step {step}: {details}")]
    Protocol { step: String, details: String },

    #[error("Relay fault on {board}: {details}")]
    Relay { board: String, details: String },

    #[error("Persistence error: {0}")]
    Persistence(String),
}

impl IvError {
    pub fn communication(component: impl Into<String>, details: impl fmt::Display) -> Self {
        IvError::Communication {
            component: component.into(),
            details: details.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overload_sentinel_maps_to_none() {
        let r = Reading::from_raw(9.91e37, -1.0e-6);
        assert_eq!(r.voltage, None);
        assert_eq!(r.current, Some(-1.0e-6));

        assert_eq!(sanitize(-9.91e37), None);
        assert_eq!(sanitize(f64::NAN), None);
        assert_eq!(sanitize(9.9e36), Some(9.9e36));
    }

    #[test]
    fn source_mode_parses_case_insensitively() {
        assert_eq!("volt".parse::<SourceMode>().unwrap(), SourceMode::Volt);
        assert_eq!(" CURR ".parse::<SourceMode>().unwrap(), SourceMode::Curr);
        assert!(matches!(
            "amps".parse::<SourceMode>(),
            Err(IvError::InvalidArgument(_))
        ));
    }

    #[test]
    fn source_mode_serde_accepts_lowercase_alias() {
        let m: SourceMode = serde_json::from_str("\"curr\"").unwrap();
        assert_eq!(m, SourceMode::Curr);
        assert_eq!(serde_json::to_string(&SourceMode::Volt).unwrap(), "\"VOLT\"");
    }

    #[test]
    fn compliance_partner_is_the_other_quantity() {
        assert_eq!(SourceMode::Volt.compliance_partner(), SourceMode::Curr);
        assert_eq!(SourceMode::Curr.compliance_partner(), SourceMode::Volt);
    }

    #[test]
    fn sample_serializes_null_for_overload() {
        let s = Sample::new(1.0, Reading::from_raw(1.0, 1e38));
        let json = serde_json::to_string(&s).unwrap();
        assert!(json.contains("\"current\":null"));
    }

    #[test]
    fn error_display_mentions_state() {
        let err = IvError::NotPermitted {
            operation: "measure".into(),
            state: InstrumentState::Off,
            allowed: vec![InstrumentState::Idle],
        };
        let text = err.to_string();
        assert!(text.contains("measure"));
        assert!(text.contains("OFF"));

        let err = IvError::SafetyInterlock {
            requested: 2e-3,
            limit: 1e-3,
        };
        assert!(err.to_string().starts_with("SAFETY"));
    }

    #[test]
    fn sweep_enums_use_lowercase_names() {
        let scale: SweepScale = serde_json::from_str("\"log\"").unwrap();
        assert_eq!(scale, SweepScale::Log);
        let kind: SweepKind = serde_json::from_str("\"double\"").unwrap();
        assert_eq!(kind, SweepKind::Double);
        let dir: SweepDirection = serde_json::from_str("\"backward\"").unwrap();
        assert_eq!(dir, SweepDirection::Backward);
    }

    #[test]
    fn never_abort_sleeps_fully() {
        let signal = NeverAbort;
        assert!(!signal.is_abort_requested());
        assert!(signal.sleep(Duration::from_millis(1)));
    }
}
