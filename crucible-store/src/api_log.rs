//! Terminal updates to the API-log record written at submission time.

use crate::jobs::{kind_str, status_str};
use crate::{ApiLogStore, ApiLogTerminal, Result, StoreError};
use async_trait::async_trait;
use mongodb::bson::oid::ObjectId;
use mongodb::bson::{doc, DateTime, Document};
use mongodb::{Collection, Database};

const COLLECTION: &str = "api_logs";

pub struct MongoApiLogStore {
    coll: Collection<Document>,
}

impl MongoApiLogStore {
    pub fn new(db: &Database) -> Self {
        Self {
            coll: db.collection(COLLECTION),
        }
    }
}

#[async_trait]
impl ApiLogStore for MongoApiLogStore {
    async fn update_by_job_id(&self, job_id: ObjectId, terminal: &ApiLogTerminal) -> Result<()> {
        let mut set = doc! {
            "status": status_str(terminal.status),
            "sandboxErrorMessage": &terminal.error_message,
            "queuedAt": DateTime::from_chrono(terminal.queued_at),
        };

        match terminal.error_kind {
            Some(kind) => set.insert("sandboxErrorType", kind_str(kind)),
            None => set.insert("sandboxErrorType", mongodb::bson::Bson::Null),
        };
        if let Some(at) = terminal.started_at {
            set.insert("startedAt", DateTime::from_chrono(at));
        }
        if let Some(at) = terminal.finished_at {
            set.insert("finishedAt", DateTime::from_chrono(at));
        }

        let result = self
            .coll
            .update_one(doc! { "jobId": job_id }, doc! { "$set": set })
            .await?;

        // The API wrote this record when it accepted the submission; a
        // missing row means the submission path is broken.
        if result.matched_count == 0 {
            return Err(StoreError::NotFound("api log"));
        }

        Ok(())
    }
}
