//! Driver Factory and identity resolution.
//!
//! Given an address and either an explicit type tag or `"auto"`, the factory
//! decides which driver family to instantiate and builds it.  Auto-resolution
//! opens a transient session, asks the instrument for `*IDN?` and matches
//! manufacturer/model substrings:
//!
//! | Manufacturer | Model | Type |
//! |---|---|---|
//! | KEYSIGHT / AGILENT | B2901, B2911 | [`SmuType::KeysightB2901`] |
//! | KEYSIGHT / AGILENT | B2902, B2912 | [`SmuType::KeysightB2902`] |
//! | KEITHLEY / TEKTRONIX | 2400, 2410, 2420, 2430, 2440 | [`SmuType::Keithley2400`] |
//! | KEITHLEY / TEKTRONIX | 2600, 2601, 2602 | [`SmuType::Keithley2600`] (no driver) |
//!
//! In mock mode there is nothing to identify, so `"auto"` resolves to the
//! dual-channel B2902 with a warning.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use ivcore_types::IvError;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::dialect::{B2901Dialect, B2902Dialect, Keithley2400Dialect};
use crate::session::{Connector, SharedSession};
use crate::smu::{Keithley2400, KeysightB2901, KeysightB2902, Smu};

/// A supported (or at least recognised) instrument family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SmuType {
    KeysightB2901,
    KeysightB2902,
    Keithley2400,
    Keithley2600,
}

impl SmuType {
    pub const ALL: [SmuType; 4] = [
        SmuType::KeysightB2901,
        SmuType::KeysightB2902,
        SmuType::Keithley2400,
        SmuType::Keithley2600,
    ];

    /// Type tag used in configuration and requests.
    pub fn tag(self) -> &'static str {
        match self {
            SmuType::KeysightB2901 => "keysight_b2901",
            SmuType::KeysightB2902 => "keysight_b2902",
            SmuType::Keithley2400 => "keithley_2400",
            SmuType::Keithley2600 => "keithley_2600",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            SmuType::KeysightB2901 => "Keysight B2901A/B2911A single-channel SMU",
            SmuType::KeysightB2902 => "Keysight B2902A/B2912A dual-channel SMU",
            SmuType::Keithley2400 => "Keithley 2400 series single-channel SMU",
            SmuType::Keithley2600 => "Keithley 2600 series SMU",
        }
    }

    pub fn channel_count(self) -> u8 {
        match self {
            SmuType::KeysightB2902 | SmuType::Keithley2600 => 2,
            SmuType::KeysightB2901 | SmuType::Keithley2400 => 1,
        }
    }

    /// Whether two logical channels can share one open session.
    pub fn is_dual_channel(self) -> bool {
        self.channel_count() == 2
    }

    /// Parse a type tag; `"auto"` yields `None`.
    ///
    /// # Errors
    ///
    /// [`IvError::InvalidArgument`] for unknown tags.
    pub fn parse_tag(tag: &str) -> Result<Option<SmuType>, IvError> {
        if tag.trim().eq_ignore_ascii_case("auto") {
            return Ok(None);
        }
        tag.parse().map(Some)
    }
}

impl fmt::Display for SmuType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for SmuType {
    type Err = IvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        SmuType::ALL
            .into_iter()
            .find(|t| t.tag() == wanted)
            .ok_or_else(|| {
                IvError::InvalidArgument(format!(
                    "unknown SMU type '{s}' (expected auto, keysight_b2901, keysight_b2902, keithley_2400)"
                ))
            })
    }
}

/// Map an `*IDN?` response to an instrument family.
///
/// # Errors
///
/// [`IvError::Resolution`] when the identity matches no known family.
pub fn identify(idn: &str) -> Result<SmuType, IvError> {
    let upper = idn.to_ascii_uppercase();
    let any = |needles: &[&str]| needles.iter().any(|n| upper.contains(n));

    if any(&["KEYSIGHT", "AGILENT"]) {
        if any(&["B2901", "B2911"]) {
            return Ok(SmuType::KeysightB2901);
        }
        if any(&["B2902", "B2912"]) {
            return Ok(SmuType::KeysightB2902);
        }
    }
    if any(&["KEITHLEY", "TEKTRONIX"]) {
        if any(&["2400", "2410", "2420", "2430", "2440"]) {
            return Ok(SmuType::Keithley2400);
        }
        if any(&["2600", "2601", "2602"]) {
            return Ok(SmuType::Keithley2600);
        }
    }
    Err(IvError::Resolution(format!("Unknown SMU type: {}", idn.trim())))
}

/// Builds drivers for an address.
#[derive(Clone)]
pub struct SmuFactory {
    connector: Arc<dyn Connector>,
}

impl SmuFactory {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self { connector }
    }

    /// Decide which family to drive at `address`.
    ///
    /// # Errors
    ///
    /// [`IvError::Communication`] if probing fails and
    /// [`IvError::Resolution`] if the identity is not recognised.
    pub fn resolve(
        &self,
        address: &str,
        requested: Option<SmuType>,
        mock: bool,
    ) -> Result<SmuType, IvError> {
        if let Some(t) = requested {
            return Ok(t);
        }
        if mock {
            warn!(address, "auto type in mock mode, defaulting to {}", SmuType::KeysightB2902);
            return Ok(SmuType::KeysightB2902);
        }

        let mut session = self.connector.open(address)?;
        let _ = session.clear();
        let idn = session.query("*IDN?");
        if let Err(e) = session.close() {
            warn!(address, error = %e, "closing identification session failed");
        }
        let idn = idn?;
        let smu_type = identify(&idn)?;
        info!(address, identity = %idn, smu = %smu_type, "auto-detected SMU");
        Ok(smu_type)
    }

    /// Build a driver that owns its session.
    ///
    /// # Errors
    ///
    /// [`IvError::InvalidArgument`] when the channel does not exist on this
    /// family, [`IvError::Resolution`] for families without a driver.
    pub fn create(
        &self,
        smu_type: SmuType,
        address: &str,
        channel: u8,
        mock: bool,
    ) -> Result<Box<dyn Smu>, IvError> {
        check_channel(smu_type, channel)?;
        let connector = Arc::clone(&self.connector);
        let smu: Box<dyn Smu> = match smu_type {
            SmuType::KeysightB2901 => Box::new(KeysightB2901::new(B2901Dialect, address, mock, connector)),
            SmuType::KeysightB2902 => Box::new(KeysightB2902::new(
                B2902Dialect::new(channel),
                address,
                mock,
                connector,
            )),
            SmuType::Keithley2400 => {
                Box::new(Keithley2400::new(Keithley2400Dialect, address, mock, connector))
            }
            SmuType::Keithley2600 => return Err(no_driver(smu_type)),
        };
        Ok(smu)
    }

    /// Build a driver for another channel of an instrument whose session is
    /// already open.  The new driver skips `*RST` and never closes `session`.
    ///
    /// # Errors
    ///
    /// [`IvError::InvalidArgument`] if the family is single-channel.
    pub fn attach(
        &self,
        smu_type: SmuType,
        address: &str,
        channel: u8,
        mock: bool,
        session: Option<SharedSession>,
    ) -> Result<Box<dyn Smu>, IvError> {
        check_channel(smu_type, channel)?;
        match smu_type {
            SmuType::KeysightB2902 => Ok(Box::new(KeysightB2902::attach(
                B2902Dialect::new(channel),
                address,
                mock,
                session,
            ))),
            SmuType::Keithley2600 => Err(no_driver(smu_type)),
            single => Err(IvError::InvalidArgument(format!(
                "{single} is single-channel; cannot share a session"
            ))),
        }
    }
}

fn check_channel(smu_type: SmuType, channel: u8) -> Result<(), IvError> {
    if channel == 0 || channel > smu_type.channel_count() {
        return Err(IvError::InvalidArgument(format!(
            "channel {channel} not available on {}",
            smu_type.description()
        )));
    }
    Ok(())
}

fn no_driver(smu_type: SmuType) -> IvError {
    IvError::Resolution(format!("{} is recognised but has no driver", smu_type.description()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{ScriptedConnector, ScriptedSession};
    use ivcore_types::InstrumentState;

    #[test]
    fn identify_known_families() {
        let cases = [
            ("Keysight Technologies,B2901A,MY1,3.4", SmuType::KeysightB2901),
            ("Agilent Technologies,B2912A,MY1,2.0", SmuType::KeysightB2902),
            ("KEITHLEY INSTRUMENTS INC.,MODEL 2410,1,C30", SmuType::Keithley2400),
            ("Keithley Instruments Inc., Model 2602B, 1, 3.2", SmuType::Keithley2600),
        ];
        for (idn, expected) in cases {
            assert_eq!(identify(idn).unwrap(), expected, "{idn}");
        }
    }

    #[test]
    fn unknown_identity_is_a_resolution_error() {
        let err = identify("Rohde&Schwarz,NGU401,1,1.0").unwrap_err();
        assert!(matches!(err, IvError::Resolution(_)));
        assert!(err.to_string().contains("Unknown SMU type"));
    }

    #[test]
    fn type_tags_round_trip() {
        assert_eq!(SmuType::parse_tag("AUTO").unwrap(), None);
        assert_eq!(
            SmuType::parse_tag("keithley_2400").unwrap(),
            Some(SmuType::Keithley2400)
        );
        assert!(SmuType::parse_tag("hp_4156").is_err());
    }

    #[test]
    fn auto_in_mock_mode_defaults_to_dual_channel() {
        let factory = SmuFactory::new(Arc::new(ScriptedConnector::new()));
        assert_eq!(
            factory.resolve("MOCK", None, true).unwrap(),
            SmuType::KeysightB2902
        );
        assert_eq!(
            factory.resolve("MOCK", Some(SmuType::Keithley2400), true).unwrap(),
            SmuType::Keithley2400
        );
    }

    #[test]
    fn auto_queries_identity_and_closes_that_session() {
        let session = ScriptedSession::new("smu:5025");
        session.respond("*IDN?", "Keysight Technologies,B2901A,MY1,3.4");
        let factory = SmuFactory::new(Arc::new(ScriptedConnector::new().with("smu:5025", session.clone())));
        assert_eq!(
            factory.resolve("smu:5025", None, false).unwrap(),
            SmuType::KeysightB2901
        );
        assert!(session.is_closed());
    }

    #[test]
    fn single_channel_types_reject_channel_two() {
        let factory = SmuFactory::new(Arc::new(ScriptedConnector::new()));
        assert!(matches!(
            factory.create(SmuType::KeysightB2901, "MOCK", 2, true),
            Err(IvError::InvalidArgument(_))
        ));
        assert!(matches!(
            factory.attach(SmuType::Keithley2400, "MOCK", 1, true, None),
            Err(IvError::InvalidArgument(_))
        ));
        assert!(matches!(
            factory.create(SmuType::Keithley2600, "MOCK", 1, true),
            Err(IvError::Resolution(_))
        ));
    }

    #[test]
    fn created_mock_driver_connects() {
        let factory = SmuFactory::new(Arc::new(ScriptedConnector::new()));
        let mut smu = factory.create(SmuType::KeysightB2902, "MOCK", 2, true).unwrap();
        smu.connect().unwrap();
        assert_eq!(smu.channel(), 2);
        assert_eq!(smu.state(), InstrumentState::Idle);
    }
}
