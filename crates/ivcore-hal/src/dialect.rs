//! Wire-level command templates, one [`Dialect`] per instrument family.
//!
//! Everything that differs between instrument families lives here: where the
//! channel number goes (`SOUR2:VOLT` vs `MEAS:VOLT? (@2)` vs nowhere), how a
//! combined reading is requested, and which abort command is available.
//! [`ScpiSmu`][crate::smu::ScpiSmu] drives any dialect through the same
//! state machine.

use ivcore_types::SourceMode;

use crate::factory::SmuType;

/// How a dialect obtains a voltage/current pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeasureCommand {
    /// Two queries, one per quantity.
    Separate { voltage: String, current: String },
    /// A format setup write followed by one query answering `v,i[,...]`.
    Combined { format: String, read: String },
}

/// Command templates for one instrument family.
pub trait Dialect: Send + 'static {
    fn smu_type(&self) -> SmuType;

    /// Logical channel these commands address.
    fn channel(&self) -> u8;

    fn source_function(&self, mode: SourceMode) -> String;

    fn source_level(&self, mode: SourceMode, value: f64) -> String;

    fn protection(&self, limit_type: SourceMode, limit: f64) -> String;

    fn nplc(&self, quantity: SourceMode, nplc: f64) -> String;

    fn output(&self, enabled: bool) -> String;

    fn output_query(&self) -> String;

    fn measure(&self) -> MeasureCommand;

    /// Best-effort trigger abort sent before switching the output off.
    fn abort(&self) -> Option<String>;

    /// Reject identities this dialect cannot drive on its channel.
    fn check_identity(&self, _idn: &str) -> Result<(), String> {
        Ok(())
    }
}

/// Keysight B2901A/B2911A.
#[derive(Debug, Clone, Copy, Default)]
pub struct B2901Dialect;

impl Dialect for B2901Dialect {
    fn smu_type(&self) -> SmuType {
        SmuType::KeysightB2901
    }

    fn channel(&self) -> u8 {
        1
    }

    fn source_function(&self, mode: SourceMode) -> String {
        format!("SOUR:FUNC:MODE {mode}")
    }

    fn source_level(&self, mode: SourceMode, value: f64) -> String {
        format!("SOUR:{mode} {value}")
    }

    fn protection(&self, limit_type: SourceMode, limit: f64) -> String {
        format!("SENS:{limit_type}:PROT {limit}")
    }

    fn nplc(&self, quantity: SourceMode, nplc: f64) -> String {
        format!("SENS:{quantity}:NPLC {nplc}")
    }

    fn output(&self, enabled: bool) -> String {
        format!("OUTP {}", on_off(enabled))
    }

    fn output_query(&self) -> String {
        "OUTP?".to_string()
    }

    fn measure(&self) -> MeasureCommand {
        MeasureCommand::Separate {
            voltage: "MEAS:VOLT?".to_string(),
            current: "MEAS:CURR?".to_string(),
        }
    }

    fn abort(&self) -> Option<String> {
        Some("ABOR".to_string())
    }
}

/// Keysight B2902A/B2912A.  The channel is encoded in the command path for
/// source/sense/output and as a `(@n)` suffix for measurement queries.
#[derive(Debug, Clone, Copy)]
pub struct B2902Dialect {
    channel: u8,
}

impl B2902Dialect {
    pub fn new(channel: u8) -> Self {
        Self { channel }
    }
}

impl Dialect for B2902Dialect {
    fn smu_type(&self) -> SmuType {
        SmuType::KeysightB2902
    }

    fn channel(&self) -> u8 {
        self.channel
    }

    fn source_function(&self, mode: SourceMode) -> String {
        format!("SOUR{}:FUNC:MODE {mode}", self.channel)
    }

    fn source_level(&self, mode: SourceMode, value: f64) -> String {
        format!("SOUR{}:{mode} {value}", self.channel)
    }

    fn protection(&self, limit_type: SourceMode, limit: f64) -> String {
        format!("SENS{}:{limit_type}:PROT {limit}", self.channel)
    }

    fn nplc(&self, quantity: SourceMode, nplc: f64) -> String {
        format!("SENS{}:{quantity}:NPLC {nplc}", self.channel)
    }

    fn output(&self, enabled: bool) -> String {
        format!("OUTP{} {}", self.channel, on_off(enabled))
    }

    fn output_query(&self) -> String {
        format!("OUTP{}?", self.channel)
    }

    fn measure(&self) -> MeasureCommand {
        MeasureCommand::Separate {
            voltage: format!("MEAS:VOLT? (@{})", self.channel),
            current: format!("MEAS:CURR? (@{})", self.channel),
        }
    }

    fn abort(&self) -> Option<String> {
        Some(format!("ABOR:ALL (@{})", self.channel))
    }

    fn check_identity(&self, idn: &str) -> Result<(), String> {
        let single = idn.contains("B2901") || idn.contains("B2911");
        if single && self.channel != 1 {
            return Err(format!(
                "single-channel SMU detected; channel {} not available",
                self.channel
            ));
        }
        Ok(())
    }
}

/// Keithley 2400 series (2400/2410/2420/2430/2440).
#[derive(Debug, Clone, Copy, Default)]
pub struct Keithley2400Dialect;

impl Dialect for Keithley2400Dialect {
    fn smu_type(&self) -> SmuType {
        SmuType::Keithley2400
    }

    fn channel(&self) -> u8 {
        1
    }

    fn source_function(&self, mode: SourceMode) -> String {
        format!(":SOUR:FUNC {mode}")
    }

    fn source_level(&self, mode: SourceMode, value: f64) -> String {
        format!(":SOUR:{mode} {value}")
    }

    fn protection(&self, limit_type: SourceMode, limit: f64) -> String {
        format!(":SENS:{limit_type}:PROT {limit}")
    }

    fn nplc(&self, quantity: SourceMode, nplc: f64) -> String {
        format!(":SENS:{quantity}:NPLC {nplc}")
    }

    fn output(&self, enabled: bool) -> String {
        format!(":OUTP {}", on_off(enabled))
    }

    fn output_query(&self) -> String {
        ":OUTP?".to_string()
    }

    fn measure(&self) -> MeasureCommand {
        MeasureCommand::Combined {
            format: ":FORM:ELEM VOLT,CURR".to_string(),
            read: ":READ?".to_string(),
        }
    }

    fn abort(&self) -> Option<String> {
        None
    }
}

fn on_off(enabled: bool) -> &'static str {
    if enabled { "ON" } else { "OFF" }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn b2902_encodes_channel_in_path_and_suffix() {
        let d = B2902Dialect::new(2);
        assert_eq!(d.source_function(SourceMode::Curr), "SOUR2:FUNC:MODE CURR");
        assert_eq!(d.source_level(SourceMode::Volt, 0.5), "SOUR2:VOLT 0.5");
        assert_eq!(d.protection(SourceMode::Curr, 0.01), "SENS2:CURR:PROT 0.01");
        assert_eq!(d.output(true), "OUTP2 ON");
        assert_eq!(d.output_query(), "OUTP2?");
        assert_eq!(
            d.measure(),
            MeasureCommand::Separate {
                voltage: "MEAS:VOLT? (@2)".into(),
                current: "MEAS:CURR? (@2)".into(),
            }
        );
    }

    #[test]
    fn b2901_has_no_channel_number() {
        let d = B2901Dialect;
        assert_eq!(d.source_level(SourceMode::Curr, 1e-3), "SOUR:CURR 0.001");
        assert_eq!(d.nplc(SourceMode::Volt, 1.0), "SENS:VOLT:NPLC 1");
        assert_eq!(d.output(false), "OUTP OFF");
        assert_eq!(d.abort().as_deref(), Some("ABOR"));
    }

    #[test]
    fn keithley_uses_combined_read() {
        let d = Keithley2400Dialect;
        assert_eq!(d.source_function(SourceMode::Volt), ":SOUR:FUNC VOLT");
        assert!(matches!(d.measure(), MeasureCommand::Combined { .. }));
        assert!(d.abort().is_none());
    }

    #[test]
    fn b2902_rejects_channel_two_on_single_channel_identity() {
        let idn = "Keysight Technologies,B2901A,MY1,3.4";
        assert!(B2902Dialect::new(1).check_identity(idn).is_ok());
        assert!(B2902Dialect::new(2).check_identity(idn).is_err());
        assert!(
            B2902Dialect::new(2)
                .check_identity("Keysight Technologies,B2902A,MY1,3.4")
                .is_ok()
        );
    }
}
