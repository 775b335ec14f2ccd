//! Runtime events published by the router, monitor, and sequencer.
//!
//! ## Contents
//! - [`Event`] / [`EventKind`] — lifecycle events with a global sequence
//! - [`Bus`] — broadcast channel the supervisor components publish to
//! - [`LogWriter`] — renders every event through `tracing`
//!
//! ## Wiring
//! ```text
//! Router ───┐
//! Monitor ──┼── publish(Event) ──► Bus ──► LogWriter worker ──► tracing
//! Sequencer ┘
//! ```

mod bus;
mod event;
mod log;

pub use bus::Bus;
pub use event::{Event, EventKind};
pub use log::LogWriter;
