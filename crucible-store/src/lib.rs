//! Persistence for Crucible: jobs, user credits with an append-only
//! ledger, and API-log terminal updates.
//!
//! The worker consumes these as traits; MongoDB backs them in production
//! and [`memory`] provides in-memory fakes for tests. The conditional
//! debit is a single guarded update at the storage layer, with no
//! application-level locking.

pub mod api_log;
pub mod credits;
pub mod jobs;
pub mod memory;
pub mod mongo;

pub use api_log::MongoApiLogStore;
pub use credits::MongoCreditStore;
pub use jobs::MongoJobStore;

use async_trait::async_trait;
use crucible_common::job::{Job, RunStatus, SandboxErrorKind};
use crucible_common::LedgerEntry;
use mongodb::bson::oid::ObjectId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("mongodb error: {0}")]
    Mongo(#[from] mongodb::error::Error),

    #[error("insufficient credits")]
    InsufficientCredits,

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("invalid stored document: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert or fully replace the job document keyed by its id.
    async fn save(&self, job: &Job) -> Result<()>;

    async fn find_by_id(&self, id: ObjectId) -> Result<Option<Job>>;

    async fn find_by_id_and_user(&self, id: ObjectId, user_id: ObjectId) -> Result<Option<Job>>;

    async fn delete(&self, id: ObjectId) -> Result<()>;

    async fn count_by_user(&self, user_id: ObjectId) -> Result<u64>;
}

#[async_trait]
pub trait CreditStore: Send + Sync {
    /// Debit `amount` iff the balance covers it, as one conditional
    /// update. Returns the new balance, or
    /// [`StoreError::InsufficientCredits`].
    async fn conditional_debit(&self, user_id: ObjectId, amount: i64) -> Result<i64>;

    /// Unconditionally credit `amount`; returns the new balance.
    async fn add(&self, user_id: ObjectId, amount: i64) -> Result<i64>;

    /// Append one ledger entry.
    async fn append_ledger(&self, entry: &LedgerEntry) -> Result<()>;

    /// Cheap pre-check used by the API path before enqueueing.
    async fn has_sufficient(&self, user_id: ObjectId, amount: i64) -> Result<bool>;
}

/// Terminal fields copied onto the API-log record of a finished job.
#[derive(Debug, Clone)]
pub struct ApiLogTerminal {
    pub status: RunStatus,
    pub error_kind: Option<SandboxErrorKind>,
    pub error_message: String,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
    pub queued_at: chrono::DateTime<chrono::Utc>,
}

#[async_trait]
pub trait ApiLogStore: Send + Sync {
    /// Update the log record the API collaborator wrote at submission
    /// time. A missing record is an error, not an upsert.
    async fn update_by_job_id(&self, job_id: ObjectId, terminal: &ApiLogTerminal) -> Result<()>;
}
