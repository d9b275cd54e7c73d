//! In-process stand-ins for instrument wiring and relay fixtures.
//!
//! [`ScriptedSession`] records every command a driver sends and answers
//! queries from canned responses, so driver wire behaviour can be verified
//! without hardware.  Handles are cheap clones of the same log: box one
//! clone into a driver and keep another to inspect afterwards.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use ivcore_hal::dialect::B2902Dialect;
//! use ivcore_hal::sim::{ScriptedConnector, ScriptedSession};
//! use ivcore_hal::smu::{KeysightB2902, Smu};
//!
//! let session = ScriptedSession::new("10.0.0.5:5025");
//! session.respond("*IDN?", "Keysight Technologies,B2902A,MY1,3.4");
//! let connector = Arc::new(ScriptedConnector::new().with("10.0.0.5:5025", session.clone()));
//!
//! let mut smu = KeysightB2902::new(B2902Dialect::new(1), "10.0.0.5:5025", false, connector);
//! smu.connect().unwrap();
//! assert_eq!(session.writes(), vec!["*RST", "SOUR1:FUNC:MODE VOLT"]);
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use ivcore_types::IvError;
use parking_lot::Mutex;

use crate::relay::RelayBoard;
use crate::session::{Connector, ScpiSession};

// ────────────────────────────────────────────────────────────────────────────
// Scripted SCPI session
// ────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Script {
    writes: Vec<String>,
    queries: Vec<String>,
    responses: HashMap<String, String>,
    /// Remaining occurrences before a command fails.
    fail_countdown: HashMap<String, usize>,
    clears: usize,
    closed: bool,
}

/// A recording SCPI session.  Unscripted queries answer `"0"`.
#[derive(Clone)]
pub struct ScriptedSession {
    resource: String,
    script: Arc<Mutex<Script>>,
}

impl ScriptedSession {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            script: Arc::new(Mutex::new(Script::default())),
        }
    }

    /// Answer every future `command` query with `response`.
    pub fn respond(&self, command: &str, response: &str) {
        self.script
            .lock()
            .responses
            .insert(command.to_string(), response.to_string());
    }

    /// Fail the next write or query of exactly `command`.
    pub fn fail_next(&self, command: &str) {
        self.fail_nth(command, 1);
    }

    /// Fail the `n`-th future write or query of exactly `command`; earlier
    /// occurrences succeed.  `n` is 1-based.
    pub fn fail_nth(&self, command: &str, n: usize) {
        self.script
            .lock()
            .fail_countdown
            .insert(command.to_string(), n.max(1));
    }

    pub fn writes(&self) -> Vec<String> {
        self.script.lock().writes.clone()
    }

    pub fn queries(&self) -> Vec<String> {
        self.script.lock().queries.clone()
    }

    /// Total commands that reached the wire (writes plus queries).
    pub fn wire_calls(&self) -> usize {
        let script = self.script.lock();
        script.writes.len() + script.queries.len()
    }

    pub fn clears(&self) -> usize {
        self.script.lock().clears
    }

    /// Forget recorded traffic; scripted responses are kept.
    pub fn clear_log(&self) {
        let mut script = self.script.lock();
        script.writes.clear();
        script.queries.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.script.lock().closed
    }

    fn check_failure(&self, script: &mut Script, command: &str) -> Result<(), IvError> {
        let due = match script.fail_countdown.get_mut(command) {
            Some(left) => {
                *left -= 1;
                *left == 0
            }
            None => false,
        };
        if due {
            script.fail_countdown.remove(command);
            return Err(IvError::communication(
                self.resource.clone(),
                format!("scripted failure on '{command}'"),
            ));
        }
        if script.closed {
            return Err(IvError::communication(self.resource.clone(), "session closed"));
        }
        Ok(())
    }
}

impl ScpiSession for ScriptedSession {
    fn resource(&self) -> &str {
        &self.resource
    }

    fn write(&mut self, command: &str) -> Result<(), IvError> {
        let mut script = self.script.lock();
        script.writes.push(command.to_string());
        self.check_failure(&mut script, command)
    }

    fn query(&mut self, command: &str) -> Result<String, IvError> {
        let mut script = self.script.lock();
        script.queries.push(command.to_string());
        self.check_failure(&mut script, command)?;
        Ok(script
            .responses
            .get(command)
            .cloned()
            .unwrap_or_else(|| "0".to_string()))
    }

    fn clear(&mut self) -> Result<(), IvError> {
        self.script.lock().clears += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<(), IvError> {
        self.script.lock().closed = true;
        Ok(())
    }
}

/// Hands out [`ScriptedSession`] clones by address and counts opens.
#[derive(Default)]
pub struct ScriptedConnector {
    sessions: HashMap<String, ScriptedSession>,
    opens: AtomicUsize,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, address: impl Into<String>, session: ScriptedSession) -> Self {
        self.sessions.insert(address.into(), session);
        self
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl Connector for ScriptedConnector {
    fn open(&self, address: &str) -> Result<Box<dyn ScpiSession>, IvError> {
        let session = self
            .sessions
            .get(address)
            .ok_or_else(|| IvError::communication(address, "no instrument at this address"))?;
        self.opens.fetch_add(1, Ordering::SeqCst);
        let fresh = session.clone();
        fresh.script.lock().closed = false;
        Ok(Box::new(fresh))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Simulated relay board
// ────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct BoardLog {
    selected: Option<u32>,
    history: Vec<Option<u32>>,
    fail_all_off: bool,
    disconnected: bool,
}

/// A relay board that records selections.  Clones share state.
///
/// Boards start connected; after `disconnect` a selection fails until the
/// next `connect`.
#[derive(Clone)]
pub struct SimRelayBoard {
    id: String,
    channels: u32,
    log: Arc<Mutex<BoardLog>>,
}

impl SimRelayBoard {
    pub fn new(id: impl Into<String>, channels: u32) -> Self {
        Self {
            id: id.into(),
            channels,
            log: Arc::new(Mutex::new(BoardLog::default())),
        }
    }

    /// Currently closed relay, `None` when all are open.
    pub fn selected(&self) -> Option<u32> {
        self.log.lock().selected
    }

    /// Every selection made, `None` entries for `all_off`.
    pub fn history(&self) -> Vec<Option<u32>> {
        self.log.lock().history.clone()
    }

    pub fn is_connected(&self) -> bool {
        !self.log.lock().disconnected
    }

    /// Make every future `all_off` fail.
    pub fn fail_all_off(&self) {
        self.log.lock().fail_all_off = true;
    }
}

impl RelayBoard for SimRelayBoard {
    fn id(&self) -> &str {
        &self.id
    }

    fn channel_count(&self) -> u32 {
        self.channels
    }

    fn connect(&mut self) -> Result<(), IvError> {
        self.log.lock().disconnected = false;
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), IvError> {
        self.all_off()?;
        self.log.lock().disconnected = true;
        Ok(())
    }

    fn select(&mut self, index: u32) -> Result<(), IvError> {
        if !self.is_connected() {
            return Err(IvError::Relay {
                board: self.id.clone(),
                details: "not connected".to_string(),
            });
        }
        if index == 0 || index > self.channels {
            return Err(IvError::Relay {
                board: self.id.clone(),
                details: format!("relay {index} out of range 1..={}", self.channels),
            });
        }
        let mut log = self.log.lock();
        log.selected = Some(index);
        log.history.push(Some(index));
        Ok(())
    }

    fn all_off(&mut self) -> Result<(), IvError> {
        let mut log = self.log.lock();
        if log.fail_all_off {
            return Err(IvError::Relay {
                board: self.id.clone(),
                details: "simulated serial timeout".to_string(),
            });
        }
        log.selected = None;
        log.history.push(None);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_session_records_and_answers() {
        let session = ScriptedSession::new("sim");
        session.respond("OUTP?", "1");
        let mut boxed: Box<dyn ScpiSession> = Box::new(session.clone());

        boxed.write("OUTP ON").unwrap();
        assert_eq!(boxed.query("OUTP?").unwrap(), "1");
        assert_eq!(boxed.query("SYST:ERR?").unwrap(), "0");
        assert_eq!(session.wire_calls(), 3);

        session.fail_next("OUTP OFF");
        assert!(boxed.write("OUTP OFF").is_err());
        assert!(boxed.write("OUTP OFF").is_ok());
    }

    #[test]
    fn nth_failure_lets_earlier_occurrences_through() {
        let session = ScriptedSession::new("sim");
        let mut boxed: Box<dyn ScpiSession> = Box::new(session.clone());
        session.fail_nth("MEAS:VOLT?", 3);
        assert!(boxed.query("MEAS:VOLT?").is_ok());
        assert!(boxed.query("MEAS:CURR?").is_ok());
        assert!(boxed.query("MEAS:VOLT?").is_ok());
        assert!(boxed.query("MEAS:VOLT?").is_err());
        assert!(boxed.query("MEAS:VOLT?").is_ok());
    }

    #[test]
    fn connector_rejects_unknown_address() {
        let connector = ScriptedConnector::new().with("a", ScriptedSession::new("a"));
        assert!(connector.open("a").is_ok());
        assert!(connector.open("b").is_err());
        assert_eq!(connector.opens(), 1);
    }

    #[test]
    fn relay_board_tracks_selection() {
        let mut board = SimRelayBoard::new("pixel", 6);
        board.select(3).unwrap();
        assert_eq!(board.selected(), Some(3));
        assert!(board.select(7).is_err());
        board.all_off().unwrap();
        assert_eq!(board.selected(), None);
        assert_eq!(board.history(), vec![Some(3), None]);
    }

    #[test]
    fn relay_board_refuses_selection_while_disconnected() {
        let mut board = SimRelayBoard::new("led", 3);
        board.select(2).unwrap();
        board.disconnect().unwrap();
        assert!(!board.is_connected());
        assert_eq!(board.selected(), None);
        assert!(board.select(1).is_err());

        board.connect().unwrap();
        board.select(1).unwrap();
        assert_eq!(board.history(), vec![Some(2), None, Some(1)]);
    }
}
