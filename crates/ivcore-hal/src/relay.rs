//! `RelayBoard` trait for switched fixtures (pixel multiplexers, LED
//! channel selectors, ...).
//!
//! The serial protocol of a concrete board lives outside this crate; the
//! control core only needs to open and release the link, close one relay at
//! a time and open all of them during safety cleanup.

use ivcore_types::IvError;

/// A bank of relays of which at most one is closed.
///
/// Boards are registered with the protocol engine under a name; the cleanup
/// phase calls [`RelayBoard::all_off`] on every registered board.
pub trait RelayBoard: Send {
    /// Stable identifier for this board, e.g. `"pixel"`.
    fn id(&self) -> &str;

    /// Number of selectable relays, numbered from 1.
    fn channel_count(&self) -> u32;

    /// Open the link to the board.  Connecting an open board is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`IvError::Relay`] if the board cannot be reached.
    fn connect(&mut self) -> Result<(), IvError> {
        Ok(())
    }

    /// Open every relay, then release the link.
    ///
    /// # Errors
    ///
    /// Returns [`IvError::Relay`] if the relays could not be opened.
    fn disconnect(&mut self) -> Result<(), IvError> {
        self.all_off()
    }

    /// Close relay `index` (1-based), opening any other.
    ///
    /// # Errors
    ///
    /// Returns [`IvError::Relay`] if the index is out of range or the board
    /// does not acknowledge.
    fn select(&mut self, index: u32) -> Result<(), IvError>;

    /// Open every relay on the board.
    ///
    /// # Errors
    ///
    /// Returns [`IvError::Relay`] if the board does not acknowledge.
    fn all_off(&mut self) -> Result<(), IvError>;
}
