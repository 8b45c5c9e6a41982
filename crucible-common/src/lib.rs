//! Shared types for the Crucible code execution service.
//!
//! Everything that crosses a crate boundary lives here: the job model and
//! its error taxonomy, credit ledger types, the broker-neutral message
//! envelope, and the environment-driven worker configuration.

pub mod config;
pub mod credits;
pub mod envelope;
pub mod job;

pub use config::{ConfigError, QueueBackend, WorkerConfig};
pub use credits::{CreditDirection, CreditReason, LedgerEntry};
pub use envelope::Envelope;
pub use job::{Job, RunStatus, SandboxErrorKind};

/// Topic carrying code submission jobs from the API to the workers.
pub const EXECUTION_TOPIC: &str = "execution-tasks";

/// Consumer group shared by all execution workers.
pub const EXECUTION_GROUP: &str = "code-runner-group";
