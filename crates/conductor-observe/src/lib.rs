//! Observability for Conductor: subscriber setup and a logger that turns
//! engine lifecycle events into structured log records.

pub mod event_log;
pub mod tracing_setup;
