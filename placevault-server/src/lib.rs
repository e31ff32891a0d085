//! Process wiring for the `placevault` binary: backend selection from the
//! loaded configuration and logging setup.

pub mod bootstrap;
pub mod telemetry;

pub use bootstrap::{BackendSummary, build_ports};
