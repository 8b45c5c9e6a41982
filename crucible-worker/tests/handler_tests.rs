//! End-to-end handler tests against in-memory stores and scripted
//! sandboxes: the production `JobHandler` with every collaborator faked at
//! its trait seam.

use async_trait::async_trait;
use bson::oid::ObjectId;
use crucible_common::credits::CreditDirection;
use crucible_common::job::{Job, RunStatus, SandboxErrorKind};
use crucible_sandbox::registry::Language;
use crucible_sandbox::runner::{RunResult, SandboxRunner};
use crucible_sandbox::{SandboxError, SandboxPools};
use crucible_store::memory::{InMemoryApiLogStore, InMemoryCreditStore, InMemoryJobStore};
use crucible_worker::JobHandler;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// Pool fake: hands out container ids and records lifecycle calls.
#[derive(Default)]
struct FakePools {
    acquired: AtomicUsize,
    released: Mutex<Vec<String>>,
    replaced: Mutex<Vec<String>>,
    exhausted: bool,
}

impl FakePools {
    fn exhausted() -> Self {
        Self {
            exhausted: true,
            ..Self::default()
        }
    }

    fn released_count(&self) -> usize {
        self.released.lock().unwrap().len()
    }

    fn replaced_count(&self) -> usize {
        self.replaced.lock().unwrap().len()
    }
}

#[async_trait]
impl SandboxPools for FakePools {
    async fn acquire(
        &self,
        language: Language,
        _cancel: watch::Receiver<bool>,
    ) -> crucible_sandbox::Result<String> {
        if self.exhausted {
            return Err(SandboxError::PoolUnavailable {
                language: language.tag().to_string(),
                reason: "test pool exhausted".to_string(),
            });
        }
        let n = self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(format!("container-{n}"))
    }

    async fn release(&self, _language: Language, container_id: String) {
        self.released.lock().unwrap().push(container_id);
    }

    async fn replace(&self, _language: Language, container_id: String) {
        self.replaced.lock().unwrap().push(container_id);
    }
}

/// Runner fake returning a scripted result.
struct FakeRunner {
    result: RunResult,
    invocations: AtomicUsize,
}

impl FakeRunner {
    fn returning(result: RunResult) -> Self {
        Self {
            result,
            invocations: AtomicUsize::new(0),
        }
    }

    fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SandboxRunner for FakeRunner {
    async fn run(
        &self,
        _container_id: &str,
        _job_dir_name: &str,
        _code: &str,
        _input: &str,
        _language: &str,
    ) -> RunResult {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        self.result.clone()
    }
}

fn clean_result(stdout: &str) -> RunResult {
    RunResult {
        stdout: stdout.to_string(),
        stderr: String::new(),
        error_kind: None,
        error_message: String::new(),
        exit_code: Some(0),
        container_dirty: false,
        duration_ms: 12,
    }
}

fn kind_result(kind: SandboxErrorKind, exit_code: i64, dirty: bool) -> RunResult {
    RunResult {
        stdout: String::new(),
        stderr: String::new(),
        error_kind: Some(kind),
        error_message: kind.message().to_string(),
        exit_code: Some(exit_code),
        container_dirty: dirty,
        duration_ms: 3000,
    }
}

struct Harness {
    handler: JobHandler,
    pools: Arc<FakePools>,
    runner: Arc<FakeRunner>,
    jobs: Arc<InMemoryJobStore>,
    credits: Arc<InMemoryCreditStore>,
    api_logs: Arc<InMemoryApiLogStore>,
    // Keeps the handler's shutdown receiver connected.
    _shutdown: watch::Sender<bool>,
}

fn harness(pools: FakePools, runner: FakeRunner) -> Harness {
    let pools = Arc::new(pools);
    let runner = Arc::new(runner);
    let jobs = Arc::new(InMemoryJobStore::new());
    let credits = Arc::new(InMemoryCreditStore::new());
    let api_logs = Arc::new(InMemoryApiLogStore::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let handler = JobHandler {
        pools: pools.clone(),
        runner: runner.clone(),
        jobs: jobs.clone(),
        credits: credits.clone(),
        api_logs: api_logs.clone(),
        shutdown: shutdown_rx,
    };

    Harness {
        handler,
        pools,
        runner,
        jobs,
        credits,
        api_logs,
        _shutdown: shutdown_tx,
    }
}

fn payload_for(job: &Job) -> Vec<u8> {
    serde_json::to_vec(job).unwrap()
}

#[tokio::test]
async fn python_hello_world_succeeds_and_debits() {
    let h = harness(FakePools::default(), FakeRunner::returning(clean_result("hi\n")));
    let job = Job::queued(ObjectId::new(), "python", "print(\"hi\")", "");
    h.credits.set_balance(job.user_id, 100);

    h.handler.execute_code(payload_for(&job)).await.unwrap();

    let stored = h.jobs.get(job.id).unwrap();
    assert_eq!(stored.status, RunStatus::Success);
    assert_eq!(stored.error_kind, None);
    assert_eq!(stored.stdout, "hi\n");
    assert_eq!(stored.stderr, "");
    assert_eq!(stored.exit_code, Some(0));
    assert!(stored.queued_at <= stored.started_at.unwrap());
    assert!(stored.started_at.unwrap() <= stored.finished_at.unwrap());

    // Submission debit recorded with the job as reference.
    assert_eq!(h.credits.balance(job.user_id), 95);
    let entries = h.credits.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].direction, CreditDirection::Debit);
    assert_eq!(entries[0].amount, 5);
    assert_eq!(entries[0].reference_id, Some(job.id));
    assert_eq!(entries[0].balance_after, 95);

    // Container returned clean, api log terminalized.
    assert_eq!(h.pools.released_count(), 1);
    assert_eq!(h.pools.replaced_count(), 0);
    assert_eq!(h.api_logs.updates().len(), 1);
}

#[tokio::test]
async fn cpp_tle_is_success_with_kind_and_no_debit() {
    let h = harness(
        FakePools::default(),
        FakeRunner::returning(kind_result(SandboxErrorKind::TimeLimit, 124, false)),
    );
    let job = Job::queued(ObjectId::new(), "cpp", "int main(){while(true){}}", "");
    h.credits.set_balance(job.user_id, 100);

    h.handler.execute_code(payload_for(&job)).await.unwrap();

    let stored = h.jobs.get(job.id).unwrap();
    assert_eq!(stored.status, RunStatus::Success);
    assert_eq!(stored.error_kind, Some(SandboxErrorKind::TimeLimit));
    assert_eq!(stored.exit_code, Some(124));

    // Inner timeout: container stays clean and no credits move.
    assert_eq!(h.pools.released_count(), 1);
    assert_eq!(h.pools.replaced_count(), 0);
    assert_eq!(h.credits.balance(job.user_id), 100);
    assert!(h.credits.entries().is_empty());
}

#[tokio::test]
async fn java_compile_error_keeps_container_clean() {
    let mut result = kind_result(SandboxErrorKind::CompilationError, 1, false);
    result.stderr = "Main.java:2: error: ';' expected".to_string();
    let h = harness(FakePools::default(), FakeRunner::returning(result));
    let job = Job::queued(ObjectId::new(), "java", "class Main { broken }", "");
    h.credits.set_balance(job.user_id, 100);

    h.handler.execute_code(payload_for(&job)).await.unwrap();

    let stored = h.jobs.get(job.id).unwrap();
    assert_eq!(stored.status, RunStatus::Success);
    assert_eq!(stored.error_kind, Some(SandboxErrorKind::CompilationError));
    assert!(stored.stderr.contains("error:"));
    assert_ne!(stored.exit_code, Some(0));
    assert_eq!(h.pools.replaced_count(), 0);
    assert!(h.credits.entries().is_empty());
}

#[tokio::test]
async fn javascript_runtime_error_no_debit() {
    let mut result = kind_result(SandboxErrorKind::RuntimeError, 1, false);
    result.stdout = "TypeError: Cannot read properties of null".to_string();
    let h = harness(FakePools::default(), FakeRunner::returning(result));
    let job = Job::queued(ObjectId::new(), "javascript", "null.x", "");
    h.credits.set_balance(job.user_id, 100);

    h.handler.execute_code(payload_for(&job)).await.unwrap();

    let stored = h.jobs.get(job.id).unwrap();
    assert_eq!(stored.status, RunStatus::Success);
    assert_eq!(stored.error_kind, Some(SandboxErrorKind::RuntimeError));
    assert!(stored.stdout.contains("TypeError:"));
    assert_eq!(h.credits.balance(job.user_id), 100);
}

#[tokio::test]
async fn malformed_payload_acks_without_mutations() {
    let h = harness(FakePools::default(), FakeRunner::returning(clean_result("")));

    h.handler
        .execute_code(b"not-json".to_vec())
        .await
        .unwrap();

    assert!(h.jobs.all().is_empty());
    assert_eq!(h.pools.acquired.load(Ordering::SeqCst), 0);
    assert_eq!(h.runner.invocations(), 0);
    assert!(h.api_logs.updates().is_empty());
}

#[tokio::test]
async fn unsupported_language_fails_job_and_acks() {
    let h = harness(FakePools::default(), FakeRunner::returning(clean_result("")));
    let job = Job::queued(ObjectId::new(), "cobol", "DISPLAY 'HI'", "");

    h.handler.execute_code(payload_for(&job)).await.unwrap();

    let stored = h.jobs.get(job.id).unwrap();
    assert_eq!(stored.status, RunStatus::Failed);
    assert_eq!(stored.error_kind, Some(SandboxErrorKind::InternalError));
    assert_eq!(h.runner.invocations(), 0);
}

#[tokio::test]
async fn pool_exhaustion_fails_job_and_acks() {
    let h = harness(FakePools::exhausted(), FakeRunner::returning(clean_result("")));
    let job = Job::queued(ObjectId::new(), "python", "print(1)", "");

    h.handler.execute_code(payload_for(&job)).await.unwrap();

    let stored = h.jobs.get(job.id).unwrap();
    assert_eq!(stored.status, RunStatus::Failed);
    assert_eq!(stored.error_kind, Some(SandboxErrorKind::InternalError));
    assert_eq!(h.runner.invocations(), 0);
}

#[tokio::test]
async fn dirty_container_is_replaced_exactly_once() {
    let h = harness(
        FakePools::default(),
        FakeRunner::returning(kind_result(SandboxErrorKind::TimeLimit, 137, true)),
    );
    let job = Job::queued(ObjectId::new(), "python", "fork bomb", "");

    h.handler.execute_code(payload_for(&job)).await.unwrap();

    assert_eq!(h.pools.replaced_count(), 1);
    assert_eq!(h.pools.released_count(), 0);
}

#[tokio::test]
async fn sandbox_error_marks_job_failed() {
    let h = harness(
        FakePools::default(),
        FakeRunner::returning(kind_result(SandboxErrorKind::SandboxError, -1, true)),
    );
    let job = Job::queued(ObjectId::new(), "go", "package main", "");
    h.credits.set_balance(job.user_id, 100);

    h.handler.execute_code(payload_for(&job)).await.unwrap();

    let stored = h.jobs.get(job.id).unwrap();
    assert_eq!(stored.status, RunStatus::Failed);
    assert_eq!(stored.error_kind, Some(SandboxErrorKind::SandboxError));
    assert_eq!(h.credits.balance(job.user_id), 100);
}

#[tokio::test]
async fn ledger_append_failure_is_compensated_and_job_still_succeeds() {
    let h = harness(FakePools::default(), FakeRunner::returning(clean_result("ok\n")));
    let job = Job::queued(ObjectId::new(), "python", "print('ok')", "");
    h.credits.set_balance(job.user_id, 100);
    h.credits.fail_appends(true);

    h.handler.execute_code(payload_for(&job)).await.unwrap();

    // The debit was compensated; the job outcome is unaffected.
    let stored = h.jobs.get(job.id).unwrap();
    assert_eq!(stored.status, RunStatus::Success);
    assert_eq!(h.credits.balance(job.user_id), 100);
    assert!(h.credits.entries().is_empty());
}

#[tokio::test]
async fn insufficient_credits_does_not_fail_the_job() {
    let h = harness(FakePools::default(), FakeRunner::returning(clean_result("ok\n")));
    let job = Job::queued(ObjectId::new(), "python", "print('ok')", "");
    h.credits.set_balance(job.user_id, 0);

    h.handler.execute_code(payload_for(&job)).await.unwrap();

    let stored = h.jobs.get(job.id).unwrap();
    assert_eq!(stored.status, RunStatus::Success);
    assert_eq!(h.credits.balance(job.user_id), 0);
    assert!(h.credits.entries().is_empty());
}

#[tokio::test]
async fn terminal_redelivery_is_observed_and_acked() {
    let h = harness(FakePools::default(), FakeRunner::returning(clean_result("hi\n")));
    let mut job = Job::queued(ObjectId::new(), "python", "print('hi')", "");
    h.credits.set_balance(job.user_id, 100);

    // First delivery runs normally.
    h.handler.execute_code(payload_for(&job)).await.unwrap();
    assert_eq!(h.runner.invocations(), 1);
    let after_first = h.jobs.get(job.id).unwrap();

    // Redelivery of the original (still `queued`) payload.
    job.status = RunStatus::Queued;
    h.handler.execute_code(payload_for(&job)).await.unwrap();

    // No re-execution, no double debit, stored job unchanged.
    assert_eq!(h.runner.invocations(), 1);
    assert_eq!(h.credits.balance(job.user_id), 95);
    assert_eq!(h.credits.entries().len(), 1);
    let after_second = h.jobs.get(job.id).unwrap();
    assert_eq!(after_second.status, after_first.status);
    assert_eq!(after_second.finished_at, after_first.finished_at);
}

#[tokio::test]
async fn running_persist_failure_returns_container_and_leaves_unacked() {
    let h = harness(FakePools::default(), FakeRunner::returning(clean_result("")));
    let job = Job::queued(ObjectId::new(), "python", "print(1)", "");
    h.jobs.fail_saves(true);

    let outcome = h.handler.execute_code(payload_for(&job)).await;

    // Unacked for redelivery, container back in the pool, never executed.
    assert!(outcome.is_err());
    assert_eq!(h.pools.released_count(), 1);
    assert_eq!(h.runner.invocations(), 0);
}
