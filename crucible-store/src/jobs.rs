//! MongoDB job repository.

use crate::{JobStore, Result, StoreError};
use async_trait::async_trait;
use crucible_common::job::{Job, RunStatus, SandboxErrorKind};
use mongodb::bson::oid::ObjectId;
use mongodb::bson::{doc, Bson, DateTime, Document};
use mongodb::{Collection, Database};

const COLLECTION: &str = "jobs";

pub struct MongoJobStore {
    coll: Collection<Document>,
}

impl MongoJobStore {
    pub fn new(db: &Database) -> Self {
        Self {
            coll: db.collection(COLLECTION),
        }
    }
}

#[async_trait]
impl JobStore for MongoJobStore {
    async fn save(&self, job: &Job) -> Result<()> {
        self.coll
            .replace_one(doc! { "_id": job.id }, job_to_doc(job))
            .upsert(true)
            .await?;
        Ok(())
    }

    async fn find_by_id(&self, id: ObjectId) -> Result<Option<Job>> {
        let found = self.coll.find_one(doc! { "_id": id }).await?;
        found.map(doc_to_job).transpose()
    }

    async fn find_by_id_and_user(&self, id: ObjectId, user_id: ObjectId) -> Result<Option<Job>> {
        let found = self
            .coll
            .find_one(doc! { "_id": id, "userId": user_id })
            .await?;
        found.map(doc_to_job).transpose()
    }

    async fn delete(&self, id: ObjectId) -> Result<()> {
        self.coll.delete_one(doc! { "_id": id }).await?;
        Ok(())
    }

    async fn count_by_user(&self, user_id: ObjectId) -> Result<u64> {
        Ok(self.coll.count_documents(doc! { "userId": user_id }).await?)
    }
}

fn job_to_doc(job: &Job) -> Document {
    let mut document = doc! {
        "_id": job.id,
        "userId": job.user_id,
        "language": &job.language,
        "code": &job.code,
        "input": &job.input,
        "status": status_str(job.status),
        "stdout": &job.stdout,
        "stderr": &job.stderr,
        "errorMessage": &job.error_message,
        "queuedAt": DateTime::from_chrono(job.queued_at),
    };

    if let Some(kind) = job.error_kind {
        document.insert("errorKind", kind_str(kind));
    }
    if let Some(code) = job.exit_code {
        document.insert("exitCode", code);
    }
    if let Some(at) = job.started_at {
        document.insert("startedAt", DateTime::from_chrono(at));
    }
    if let Some(at) = job.finished_at {
        document.insert("finishedAt", DateTime::from_chrono(at));
    }

    document
}

fn doc_to_job(document: Document) -> Result<Job> {
    let field = |name: &str| StoreError::Malformed(format!("job document missing '{name}'"));

    Ok(Job {
        id: document.get_object_id("_id").map_err(|_| field("_id"))?,
        user_id: document
            .get_object_id("userId")
            .map_err(|_| field("userId"))?,
        language: document
            .get_str("language")
            .map_err(|_| field("language"))?
            .to_string(),
        code: document.get_str("code").unwrap_or_default().to_string(),
        input: document.get_str("input").unwrap_or_default().to_string(),
        status: parse_status(document.get_str("status").map_err(|_| field("status"))?)?,
        stdout: document.get_str("stdout").unwrap_or_default().to_string(),
        stderr: document.get_str("stderr").unwrap_or_default().to_string(),
        error_kind: match document.get_str("errorKind") {
            Ok(raw) => Some(parse_kind(raw)?),
            Err(_) => None,
        },
        error_message: document
            .get_str("errorMessage")
            .unwrap_or_default()
            .to_string(),
        exit_code: match document.get("exitCode") {
            Some(Bson::Int64(code)) => Some(*code),
            Some(Bson::Int32(code)) => Some(i64::from(*code)),
            _ => None,
        },
        queued_at: document
            .get_datetime("queuedAt")
            .map_err(|_| field("queuedAt"))?
            .to_chrono(),
        started_at: document.get_datetime("startedAt").ok().map(|d| d.to_chrono()),
        finished_at: document.get_datetime("finishedAt").ok().map(|d| d.to_chrono()),
    })
}

pub(crate) fn status_str(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Queued => "queued",
        RunStatus::Running => "running",
        RunStatus::Success => "success",
        RunStatus::Failed => "failed",
    }
}

fn parse_status(raw: &str) -> Result<RunStatus> {
    match raw {
        "queued" => Ok(RunStatus::Queued),
        "running" => Ok(RunStatus::Running),
        "success" => Ok(RunStatus::Success),
        "failed" => Ok(RunStatus::Failed),
        other => Err(StoreError::Malformed(format!("unknown job status '{other}'"))),
    }
}

pub(crate) fn kind_str(kind: SandboxErrorKind) -> &'static str {
    match kind {
        SandboxErrorKind::TimeLimit => "TLE",
        SandboxErrorKind::MemoryLimit => "MLE",
        SandboxErrorKind::CompilationError => "CompilationError",
        SandboxErrorKind::RuntimeError => "RuntimeError",
        SandboxErrorKind::SandboxError => "SandboxError",
        SandboxErrorKind::InternalError => "InternalError",
    }
}

fn parse_kind(raw: &str) -> Result<SandboxErrorKind> {
    match raw {
        "TLE" => Ok(SandboxErrorKind::TimeLimit),
        "MLE" => Ok(SandboxErrorKind::MemoryLimit),
        "CompilationError" => Ok(SandboxErrorKind::CompilationError),
        "RuntimeError" => Ok(SandboxErrorKind::RuntimeError),
        "SandboxError" => Ok(SandboxErrorKind::SandboxError),
        "InternalError" => Ok(SandboxErrorKind::InternalError),
        other => Err(StoreError::Malformed(format!("unknown error kind '{other}'"))),
    }
}
