//! Job model and the sandbox error taxonomy.

use bson::oid::ObjectId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a job.
///
/// `Success` and `Failed` are terminal: once a job reaches either, no field
/// may change. `Failed` strictly means "no user result was produced";
/// user-visible outcomes such as a time limit or a compilation error are
/// `Success` with [`Job::error_kind`] set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Running,
    Success,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Success | RunStatus::Failed)
    }
}

/// Closed set of sandbox error classifications.
///
/// The wire names are kept short and stable; clients branch on these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SandboxErrorKind {
    #[serde(rename = "TLE")]
    TimeLimit,
    #[serde(rename = "MLE")]
    MemoryLimit,
    #[serde(rename = "CompilationError")]
    CompilationError,
    #[serde(rename = "RuntimeError")]
    RuntimeError,
    #[serde(rename = "SandboxError")]
    SandboxError,
    #[serde(rename = "InternalError")]
    InternalError,
}

impl SandboxErrorKind {
    /// Fixed user-facing message for this kind. Never includes host paths
    /// or other sandbox internals.
    pub fn message(self) -> &'static str {
        match self {
            SandboxErrorKind::TimeLimit => {
                "Time Limit Exceeded: the program ran longer than allowed."
            }
            SandboxErrorKind::MemoryLimit => {
                "Memory Limit Exceeded: the program used more memory than allowed."
            }
            SandboxErrorKind::CompilationError => "Compilation failed. See error details.",
            SandboxErrorKind::RuntimeError => {
                "Runtime Error: the program crashed during execution."
            }
            SandboxErrorKind::SandboxError => "Sandbox Error: execution environment failed.",
            SandboxErrorKind::InternalError => {
                "Internal Error: something went wrong on the server."
            }
        }
    }

    /// Kinds that mean the platform failed to produce a user result.
    /// These map to [`RunStatus::Failed`]; everything else is a legitimate
    /// executed outcome and maps to [`RunStatus::Success`].
    pub fn is_infrastructure(self) -> bool {
        matches!(
            self,
            SandboxErrorKind::SandboxError | SandboxErrorKind::InternalError
        )
    }
}

/// A unit of user code submission.
///
/// Serialized form is the queue wire format: JSON with 24-hex ids and
/// RFC 3339 UTC timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    #[serde(with = "hex_object_id")]
    pub id: ObjectId,
    #[serde(rename = "userId", with = "hex_object_id")]
    pub user_id: ObjectId,
    pub language: String,
    pub code: String,
    #[serde(default)]
    pub input: String,
    pub status: RunStatus,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(rename = "errorKind", default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<SandboxErrorKind>,
    #[serde(rename = "errorMessage", default)]
    pub error_message: String,
    #[serde(rename = "exitCode", default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    #[serde(rename = "queuedAt")]
    pub queued_at: DateTime<Utc>,
    #[serde(rename = "startedAt", default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(rename = "finishedAt", default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// A fresh queued job, as the API collaborator enqueues it.
    pub fn queued(user_id: ObjectId, language: impl Into<String>, code: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            id: ObjectId::new(),
            user_id,
            language: language.into(),
            code: code.into(),
            input: input.into(),
            status: RunStatus::Queued,
            stdout: String::new(),
            stderr: String::new(),
            error_kind: None,
            error_message: String::new(),
            exit_code: None,
            queued_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Transition to `Running`. Records `started_at`.
    pub fn mark_running(&mut self, now: DateTime<Utc>) {
        self.status = RunStatus::Running;
        self.started_at = Some(now);
    }

    /// Terminalize with an infrastructure failure. Used on paths where
    /// execution could not produce a user result.
    pub fn mark_failed(&mut self, kind: SandboxErrorKind, message: impl Into<String>, now: DateTime<Utc>) {
        self.status = RunStatus::Failed;
        self.error_kind = Some(kind);
        self.error_message = message.into();
        self.finished_at = Some(now);
    }
}

/// Serde adapter: `ObjectId` as a plain 24-hex string on the wire.
mod hex_object_id {
    use bson::oid::ObjectId;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(id: &ObjectId, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&id.to_hex())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<ObjectId, D::Error> {
        let hex = String::deserialize(deserializer)?;
        ObjectId::parse_str(&hex).map_err(serde::de::Error::custom)
    }
}
