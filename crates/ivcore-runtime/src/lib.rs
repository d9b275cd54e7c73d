//! `ivcore-runtime` – protocol execution and the operation surface.
//!
//! # Modules
//!
//! - [`protocol`] – [`ProtocolStep`][protocol::ProtocolStep] and
//!   [`ProtocolDocument`][protocol::ProtocolDocument], the declarative step
//!   format, plus the typed [`Action`][protocol::Action] set each step is
//!   parsed into once its `$name` references are resolved.
//! - [`template`] – [`resolve`][template::resolve]: one-pass `$name` /
//!   `{$name}` substitution against captured variables.
//! - [`engine`] – [`ProtocolEngine`][engine::ProtocolEngine]: sequential
//!   step execution with capture, loops, abort checks at every step boundary
//!   and an unconditional safety cleanup (outputs off, relays open).
//! - [`loader`] – [`ProtocolLoader`][loader::ProtocolLoader]: YAML/JSON
//!   protocol files from a directory tree, cached by id.
//! - [`monitor`] – [`LiveMonitor`][monitor::LiveMonitor]: fixed-rate
//!   background measurement into a bounded ring buffer.
//! - [`service`] – [`InstrumentService`][service::InstrumentService]: wires
//!   everything together and answers every operation with a serialisable
//!   `{success, message, ..}` response.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: installs the
//!   `tracing` subscriber with an optional OTLP span exporter.
//!
//! # Abort
//!
//! The run manager's abort flag is the only cancellation mechanism.  Sweeps,
//! waits and loops poll it; [`InstrumentService`] registers shutdown
//! callbacks so an abort also stops the live monitor and disables outputs.
//! Output shutdown is best effort: it waits only briefly for the channel
//! lock, and a sweep holding that lock turns its own output off when it
//! notices the abort, which can be after `abort()` has returned.

pub mod engine;
pub mod loader;
pub mod monitor;
pub mod protocol;
pub mod service;
pub mod telemetry;
pub mod template;

pub use engine::{EngineOptions, ProtocolEngine, ProtocolResult, StopReason};
pub use loader::{ProtocolLoader, ProtocolSummary};
pub use monitor::{LiveMonitor, MonitorConfig};
pub use protocol::{Action, ProtocolDocument, ProtocolStep};
pub use service::{InstrumentService, ServiceOptions, ServiceParts};
pub use telemetry::{TracerProviderGuard, init_tracing};
