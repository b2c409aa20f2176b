//! In-process runtime adapters for the orchestration ports.

mod event_bus;

pub use event_bus::*;
