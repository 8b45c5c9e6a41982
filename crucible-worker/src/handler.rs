//! The execute-code message handler.
//!
//! One invocation drives a job end to end: decode, borrow a container,
//! persist `running`, execute, return or replace the container, persist
//! the terminal state, settle credits, and update the API log. Returning
//! `Ok` acknowledges the message; `Err` leaves it unacked for redelivery.
//! `Err` is reserved for persistence failures, where the redelivery check
//! at the top makes the retry safe.

use crate::settlement;
use chrono::Utc;
use crucible_common::credits::CreditReason;
use crucible_common::job::{Job, RunStatus, SandboxErrorKind};
use crucible_sandbox::registry::Language;
use crucible_sandbox::runner::SandboxRunner;
use crucible_sandbox::SandboxPools;
use crucible_store::{ApiLogStore, ApiLogTerminal, CreditStore, JobStore};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

pub struct JobHandler {
    pub pools: Arc<dyn SandboxPools>,
    pub runner: Arc<dyn SandboxRunner>,
    pub jobs: Arc<dyn JobStore>,
    pub credits: Arc<dyn CreditStore>,
    pub api_logs: Arc<dyn ApiLogStore>,
    /// Cancels a borrow blocked on pool exhaustion at shutdown, so the
    /// handler can terminalize within the grace window.
    pub shutdown: watch::Receiver<bool>,
}

impl JobHandler {
    /// Handle one message from the execution topic.
    pub async fn execute_code(&self, payload: Vec<u8>) -> anyhow::Result<()> {
        let mut job: Job = match serde_json::from_slice(&payload) {
            Ok(job) => job,
            Err(err) => {
                // Without a decodable id there is nothing to mark failed;
                // ack so the poison message does not loop forever.
                tracing::error!(error = %err, "malformed job payload; acking");
                return Ok(());
            }
        };

        // Redelivery of an already-terminal job: observe and ack without
        // re-execution.
        if let Ok(Some(stored)) = self.jobs.find_by_id(job.id).await {
            if stored.is_terminal() {
                tracing::info!(job_id = %job.id, status = ?stored.status, "job already terminal; acking redelivery");
                return Ok(());
            }
        }

        let language = match Language::parse(&job.language) {
            Some(language) => language,
            None => {
                tracing::error!(job_id = %job.id, language = %job.language, "unsupported language");
                self.fail_job(&mut job, SandboxErrorKind::InternalError, "unsupported language")
                    .await;
                return Ok(());
            }
        };

        let container_id = match self.pools.acquire(language, self.shutdown.clone()).await {
            Ok(id) => id,
            Err(err) => {
                tracing::error!(job_id = %job.id, error = %err, "failed to acquire container");
                self.fail_job(
                    &mut job,
                    SandboxErrorKind::InternalError,
                    "failed to acquire a container",
                )
                .await;
                return Ok(());
            }
        };

        // Mark running before execution. If this write fails the job never
        // entered `running`, so the message may stay unacked for retry,
        // but the container goes back first.
        job.mark_running(Utc::now());
        if let Err(err) = self.jobs.save(&job).await {
            tracing::error!(job_id = %job.id, error = %err, "failed to persist running state");
            self.pools.release(language, container_id).await;
            return Err(err.into());
        }

        tracing::info!(
            job_id = %job.id,
            language = %language,
            container = %container_id,
            "executing job"
        );

        let result = self
            .runner
            .run(
                &container_id,
                &format!("job_{}", job.id.to_hex()),
                &job.code,
                &job.input,
                language.tag(),
            )
            .await;

        // Container lifecycle depends on the execution outcome.
        if result.container_dirty {
            tracing::warn!(job_id = %job.id, container = %container_id, "destroying dirty container");
            self.pools.replace(language, container_id).await;
        } else {
            self.pools.release(language, container_id).await;
        }

        // Terminal state. TLE, MLE, compile, and runtime errors are
        // legitimate executed outcomes: status stays `success` and callers
        // branch on the error kind. `failed` means the platform produced
        // no result.
        job.finished_at = Some(Utc::now());
        job.stdout = result.stdout.clone();
        job.stderr = result.stderr.clone();
        job.error_kind = result.error_kind;
        job.error_message = result.error_message.clone();
        job.exit_code = result.exit_code;
        job.status = match result.error_kind {
            Some(kind) if kind.is_infrastructure() => RunStatus::Failed,
            _ => RunStatus::Success,
        };

        if let Err(err) = self.jobs.save(&job).await {
            // Leave the message unacked; the redelivery check above makes
            // the retry safe.
            tracing::error!(job_id = %job.id, error = %err, "failed to persist terminal state");
            return Err(err.into());
        }

        if result.error_kind.is_none() {
            self.settle_credits(&job, language, result.duration_ms).await;
        }

        self.update_api_log(&job).await;
        Ok(())
    }

    /// Debit the submission cost and append the ledger entry. Settlement
    /// problems are logged, never surfaced as a job failure: the user
    /// already has their result.
    async fn settle_credits(&self, job: &Job, language: Language, duration_ms: u64) {
        let amount = CreditReason::Submission.cost();

        let mut metadata: HashMap<String, serde_json::Value> = HashMap::new();
        metadata.insert("language".into(), serde_json::json!(language.tag()));
        metadata.insert("executionTimeMs".into(), serde_json::json!(duration_ms));
        if let Some(started) = job.started_at {
            let queue_ms = (started - job.queued_at).num_milliseconds();
            metadata.insert("queueTimeMs".into(), serde_json::json!(queue_ms));
        }

        if let Err(err) = settlement::debit_and_log(
            self.credits.as_ref(),
            job.user_id,
            amount,
            CreditReason::Submission,
            Some(job.id),
            metadata,
        )
        .await
        {
            tracing::warn!(job_id = %job.id, user = %job.user_id, error = %err, "credit settlement failed");
        }
    }

    async fn update_api_log(&self, job: &Job) {
        let terminal = ApiLogTerminal {
            status: job.status,
            error_kind: job.error_kind,
            error_message: job.error_message.clone(),
            started_at: job.started_at,
            finished_at: job.finished_at,
            queued_at: job.queued_at,
        };

        if let Err(err) = self.api_logs.update_by_job_id(job.id, &terminal).await {
            tracing::warn!(job_id = %job.id, error = %err, "api log update failed");
        }
    }

    /// Terminalize as `failed` with best-effort persistence.
    async fn fail_job(&self, job: &mut Job, kind: SandboxErrorKind, message: &str) {
        job.mark_failed(kind, message, Utc::now());
        if let Err(err) = self.jobs.save(job).await {
            tracing::error!(job_id = %job.id, error = %err, "failed to persist failure state");
        }
        self.update_api_log(job).await;
    }
}
