//! Per-job execution inside a borrowed sandbox container.
//!
//! Time enforcement is two-layered. BusyBox `timeout` inside the container
//! is authoritative: it SIGKILLs the job after [`RUN_SECS`](crate::RUN_SECS)
//! and the container survives for clean reuse. The outer deadline
//! ([`OUTER_SECS`](crate::OUTER_SECS)) only fires when the container itself
//! has lost control of the process, and that container is never reused.

use crate::classify;
use crate::docker::ContainerBackend;
use crate::registry::Language;
use crate::{MAX_OUTPUT_BYTES, OUTER_SECS, RUN_SECS};
use async_trait::async_trait;
use bollard::container::LogOutput;
use crucible_common::SandboxErrorKind;
use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Outcome of one job execution.
///
/// The runner always produces a result; infrastructure failures surface as
/// [`SandboxErrorKind::SandboxError`] / [`SandboxErrorKind::InternalError`]
/// rather than `Err`. The runner never touches the job store.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub stdout: String,
    pub stderr: String,
    /// `None` means a clean run.
    pub error_kind: Option<SandboxErrorKind>,
    pub error_message: String,
    pub exit_code: Option<i64>,
    /// When set, the container must be replaced instead of returned.
    pub container_dirty: bool,
    pub duration_ms: u64,
}

impl RunResult {
    fn fault(kind: SandboxErrorKind, dirty: bool, duration_ms: u64) -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            error_kind: Some(kind),
            error_message: kind.message().to_string(),
            exit_code: None,
            container_dirty: dirty,
            duration_ms,
        }
    }
}

/// Execution seam for the worker loop; tests substitute scripted fakes.
#[async_trait]
pub trait SandboxRunner: Send + Sync {
    /// Execute `code` with `input` inside `container_id`. `job_dir_name` is
    /// the per-job directory name under the shared runner directory (it
    /// appears as `/sandbox/<job_dir_name>` inside the container).
    async fn run(
        &self,
        container_id: &str,
        job_dir_name: &str,
        code: &str,
        input: &str,
        language: &str,
    ) -> RunResult;
}

pub struct Runner {
    docker: Arc<dyn ContainerBackend>,
    runner_dir: PathBuf,
}

impl Runner {
    pub fn new(docker: Arc<dyn ContainerBackend>, runner_dir: impl Into<PathBuf>) -> Self {
        Self {
            docker,
            runner_dir: runner_dir.into(),
        }
    }

    async fn exec_job(
        &self,
        container_id: &str,
        job_dir_name: &str,
        language: Language,
    ) -> RunResult {
        let started = Instant::now();
        let names = language.file_names();
        let template = language.run_command(&names);

        // The inner timeout is authoritative; `-s KILL` means the job
        // cannot ignore it.
        let shell = format!(
            "cd /sandbox/{job_dir_name} && timeout -s KILL {RUN_SECS} sh -c '{template}'"
        );
        let cmd = vec!["sh".to_string(), "-c".to_string(), shell];

        let exec_id = match self.docker.exec_create(container_id, cmd).await {
            Ok(id) => id,
            Err(err) => {
                tracing::error!(container = %container_id, error = %err, "exec create failed");
                return RunResult::fault(
                    SandboxErrorKind::SandboxError,
                    true,
                    started.elapsed().as_millis() as u64,
                );
            }
        };

        let mut output = match self.docker.exec_attach(&exec_id).await {
            Ok(stream) => stream,
            Err(err) => {
                tracing::error!(container = %container_id, error = %err, "exec attach failed");
                return RunResult::fault(
                    SandboxErrorKind::SandboxError,
                    true,
                    started.elapsed().as_millis() as u64,
                );
            }
        };

        let mut stdout_buf: Vec<u8> = Vec::new();
        let mut stderr_buf: Vec<u8> = Vec::new();

        let read_all = async {
            while let Some(chunk) = output.next().await {
                match chunk? {
                    LogOutput::StdOut { message } => push_capped(&mut stdout_buf, &message),
                    LogOutput::StdErr { message } => push_capped(&mut stderr_buf, &message),
                    _ => {}
                }
            }
            Ok::<(), bollard::errors::Error>(())
        };

        match tokio::time::timeout(Duration::from_secs(OUTER_SECS), read_all).await {
            // Outer deadline: the in-container timeout should have fired a
            // second ago and did not. The container is not trustworthy.
            Err(_) => {
                tracing::warn!(
                    container = %container_id,
                    "outer deadline fired; marking container dirty"
                );
                return RunResult::fault(
                    SandboxErrorKind::TimeLimit,
                    true,
                    started.elapsed().as_millis() as u64,
                );
            }
            Ok(Err(err)) => {
                tracing::error!(container = %container_id, error = %err, "exec output read failed");
                return RunResult::fault(
                    SandboxErrorKind::SandboxError,
                    false,
                    started.elapsed().as_millis() as u64,
                );
            }
            Ok(Ok(())) => {}
        }

        let exit_code = match self.docker.exec_exit_code(&exec_id).await {
            Ok(Some(code)) => code,
            Ok(None) => {
                tracing::error!(container = %container_id, "exec finished without an exit code");
                return RunResult::fault(
                    SandboxErrorKind::SandboxError,
                    false,
                    started.elapsed().as_millis() as u64,
                );
            }
            Err(err) => {
                tracing::error!(container = %container_id, error = %err, "exec inspect failed");
                return RunResult::fault(
                    SandboxErrorKind::SandboxError,
                    false,
                    started.elapsed().as_millis() as u64,
                );
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        finish(language, exit_code, stdout_buf, stderr_buf, duration_ms)
    }
}

/// Stage the job's source and stdin files on the host side of the
/// `/sandbox` bind mount.
async fn stage_files(
    job_dir: &Path,
    names: &crate::registry::FileNames,
    code: &str,
    input: &str,
) -> std::io::Result<()> {
    tokio::fs::create_dir_all(job_dir).await?;

    // Containers may run as arbitrary non-root users; permissive mode
    // keeps their writes (compiler output, binaries) from failing.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(job_dir, std::fs::Permissions::from_mode(0o777)).await?;
    }

    tokio::fs::write(job_dir.join(&names.full_name), code).await?;
    tokio::fs::write(job_dir.join("input.txt"), input).await?;
    Ok(())
}

/// Build the final result from a completed exec.
fn finish(
    language: Language,
    exit_code: i64,
    stdout_buf: Vec<u8>,
    stderr_buf: Vec<u8>,
    duration_ms: u64,
) -> RunResult {
    // Output of a SIGKILLed run is partial garbage; discard it.
    let (stdout, stderr) = if matches!(exit_code, 124 | 137) {
        (String::new(), String::new())
    } else {
        (
            classify::clean_output(&String::from_utf8_lossy(&stdout_buf)),
            classify::clean_output(&String::from_utf8_lossy(&stderr_buf)),
        )
    };

    let (error_kind, error_message) = match classify::classify(language, exit_code, &stdout, &stderr)
    {
        Some((kind, message)) => (Some(kind), message.to_string()),
        None => (None, String::new()),
    };

    RunResult {
        stdout,
        stderr,
        error_kind,
        error_message,
        exit_code: Some(exit_code),
        container_dirty: is_dirty_exit(exit_code),
        duration_ms,
    }
}

/// Exit codes after which the container cannot be trusted.
///
/// A normal TLE (BusyBox `timeout` exiting 124 after killing the job)
/// leaves the container reusable. 137 means the shell itself was
/// SIGKILLed (OOM killer or worse) and 139 means something segfaulted;
/// both leave unknown residue. Compile and runtime errors are clean.
fn is_dirty_exit(exit_code: i64) -> bool {
    matches!(exit_code, 137 | 139)
}

fn push_capped(buf: &mut Vec<u8>, chunk: &[u8]) {
    // Keep one byte past the cap so truncation marks the cut; drop the rest
    // on the floor while continuing to drain the stream.
    let room = (MAX_OUTPUT_BYTES + 1).saturating_sub(buf.len());
    if room > 0 {
        buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }
}

#[async_trait]
impl SandboxRunner for Runner {
    async fn run(
        &self,
        container_id: &str,
        job_dir_name: &str,
        code: &str,
        input: &str,
        language: &str,
    ) -> RunResult {
        let started = Instant::now();

        let language = match Language::parse(language) {
            Some(language) => language,
            None => {
                tracing::error!(language, "unsupported language reached the runner");
                return RunResult::fault(SandboxErrorKind::InternalError, false, 0);
            }
        };

        let job_dir = self.runner_dir.join(job_dir_name);
        let names = language.file_names();

        if let Err(err) = stage_files(&job_dir, &names, code, input).await {
            tracing::error!(dir = %job_dir.display(), error = %err, "failed to stage job files");
            return RunResult::fault(
                SandboxErrorKind::InternalError,
                false,
                started.elapsed().as_millis() as u64,
            );
        }

        let result = self.exec_job(container_id, job_dir_name, language).await;

        if let Err(err) = tokio::fs::remove_dir_all(&job_dir).await {
            tracing::warn!(dir = %job_dir.display(), error = %err, "job dir cleanup failed");
        }

        result
    }
}
