//! Worker-loop internals: the execute-code handler and credit settlement.
//!
//! The binary in `main.rs` wires production implementations; tests drive
//! [`handler::JobHandler`] with in-memory stores and scripted sandboxes.

pub mod handler;
pub mod settlement;

pub use handler::JobHandler;

/// Seconds granted to in-flight handlers after a shutdown signal before
/// pools are destroyed.
pub const SHUTDOWN_GRACE_SECS: u64 = 10;
