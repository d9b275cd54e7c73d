//! Instrument side of the IV control core: wire sessions, SMU drivers, the
//! driver factory, the channel registry with its sweep algorithms, and the
//! relay / persistence / calibration collaborator traits.

pub mod calibration;
pub mod dialect;
pub mod factory;
pub mod registry;
pub mod relay;
pub mod session;
pub mod sim;
pub mod sink;
pub mod smu;
pub mod sweep;

pub use factory::{SmuFactory, SmuType};
pub use registry::{ChannelRegistry, ListSweepRequest, RegistryOptions, SweepRequest};
pub use smu::Smu;
