//! Thin wrapper over the Docker Engine API.
//!
//! Everything the pool and the runner need from Docker goes through here:
//! container lifecycle for warm sandboxes, exec create/attach/inspect for
//! job runs, and stats/inspect probes for the health loop.

use crate::error::Result;
use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions, StatsOptions,
};
use bollard::Docker;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::pin::Pin;
use uuid::Uuid;

/// Output stream of an attached exec.
pub type ExecOutputStream =
    Pin<Box<dyn futures_util::Stream<Item = std::result::Result<LogOutput, bollard::errors::Error>> + Send>>;

/// Idle-container liveness snapshot used by the pool health loop.
#[derive(Debug, Clone, Copy)]
pub struct ContainerProbe {
    pub running: bool,
    pub pids: u64,
    pub memory_bytes: u64,
}

/// Container lifecycle and exec operations as the pool and the runner
/// consume them. [`DockerClient`] is the production implementation; pool
/// tests script a fake.
#[async_trait]
pub trait ContainerBackend: Send + Sync {
    /// Create and start one warm sandbox container; returns its runtime id.
    async fn create_sandbox(&self, image: &str, runner_dir: &str) -> Result<String>;

    /// Force-remove a container, running or not.
    async fn force_remove(&self, container_id: &str) -> Result<()>;

    /// List containers (running and stopped) created from any of the given
    /// images. Used for orphan cleanup on startup.
    async fn list_by_ancestor_images(&self, images: &[&str]) -> Result<Vec<String>>;

    /// Liveness probe: running state plus pid and memory usage.
    async fn probe(&self, container_id: &str) -> Result<ContainerProbe>;

    /// Create an exec with stdout/stderr attached and stdin closed.
    async fn exec_create(&self, container_id: &str, cmd: Vec<String>) -> Result<String>;

    /// Start an exec and return its multiplexed output stream.
    async fn exec_attach(&self, exec_id: &str) -> Result<ExecOutputStream>;

    /// Exit code of a finished exec, if the runtime reported one.
    async fn exec_exit_code(&self, exec_id: &str) -> Result<Option<i64>>;
}

#[derive(Clone)]
pub struct DockerClient {
    docker: Docker,
}

impl DockerClient {
    /// Connect using the standard client environment (`DOCKER_HOST` et al).
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_defaults()?;
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerBackend for DockerClient {
    /// The container idles on `sleep infinity`, has no network, a tmpfs
    /// `/tmp`, and the shared per-worker runner directory bind-mounted at
    /// `/sandbox`.
    async fn create_sandbox(&self, image: &str, runner_dir: &str) -> Result<String> {
        let options = CreateContainerOptions {
            name: Some(format!("crucible-{}", Uuid::new_v4())),
            ..Default::default()
        };

        let config = ContainerCreateBody {
            image: Some(image.to_string()),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            working_dir: Some("/app".to_string()),
            host_config: Some(HostConfig {
                binds: Some(vec![format!("{runner_dir}:/sandbox")]),
                tmpfs: Some(HashMap::from([(
                    "/tmp".to_string(),
                    "rw,noexec,nosuid".to_string(),
                )])),
                network_mode: Some("none".to_string()),
                security_opt: Some(vec!["no-new-privileges:true".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let created = self.docker.create_container(Some(options), config).await?;
        self.docker
            .start_container(&created.id, None::<StartContainerOptions>)
            .await?;

        Ok(created.id)
    }

    async fn force_remove(&self, container_id: &str) -> Result<()> {
        self.docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await?;
        Ok(())
    }

    async fn list_by_ancestor_images(&self, images: &[&str]) -> Result<Vec<String>> {
        let filters = HashMap::from([(
            "ancestor".to_string(),
            images.iter().map(|i| i.to_string()).collect::<Vec<_>>(),
        )]);

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters: Some(filters),
                ..Default::default()
            }))
            .await?;

        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }

    async fn probe(&self, container_id: &str) -> Result<ContainerProbe> {
        let inspect = self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await?;
        let running = inspect
            .state
            .as_ref()
            .and_then(|s| s.running)
            .unwrap_or(false);

        let stats = self
            .docker
            .stats(
                container_id,
                Some(StatsOptions {
                    stream: false,
                    one_shot: true,
                }),
            )
            .next()
            .await
            .transpose()?;

        let pids = stats
            .as_ref()
            .and_then(|s| s.pids_stats.as_ref())
            .and_then(|p| p.current)
            .unwrap_or(0);
        let memory_bytes = stats
            .as_ref()
            .and_then(|s| s.memory_stats.as_ref())
            .and_then(|m| m.usage)
            .unwrap_or(0);

        Ok(ContainerProbe {
            running,
            pids,
            memory_bytes,
        })
    }

    async fn exec_create(&self, container_id: &str, cmd: Vec<String>) -> Result<String> {
        let exec = self
            .docker
            .create_exec(
                container_id,
                CreateExecOptions {
                    cmd: Some(cmd),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    attach_stdin: Some(false),
                    ..Default::default()
                },
            )
            .await?;
        Ok(exec.id)
    }

    async fn exec_attach(&self, exec_id: &str) -> Result<ExecOutputStream> {
        match self
            .docker
            .start_exec(exec_id, None::<StartExecOptions>)
            .await?
        {
            StartExecResults::Attached { output, .. } => Ok(output),
            StartExecResults::Detached => Err(bollard::errors::Error::IOError {
                err: std::io::Error::other("exec started detached with attach requested"),
            }
            .into()),
        }
    }

    async fn exec_exit_code(&self, exec_id: &str) -> Result<Option<i64>> {
        let inspect = self.docker.inspect_exec(exec_id).await?;
        Ok(inspect.exit_code)
    }
}
