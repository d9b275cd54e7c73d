//! `ivcore-kernel` – run supervision.
//!
//! - [`run_manager`] – [`RunManager`][run_manager::RunManager]: the single
//!   process-wide state machine (IDLE → ARMED → RUNNING → ABORTED/ERROR →
//!   IDLE) that gates long-running operations, carries the sticky abort flag
//!   and fans an abort out to registered shutdown callbacks.

pub mod run_manager;

pub use run_manager::{RunManager, RunState, RunStatus, ShutdownCallback};
