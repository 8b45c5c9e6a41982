//! Scripted container backend for pool tests.

use crate::docker::{ContainerBackend, ContainerProbe, ExecOutputStream};
use crate::error::Result;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

/// In-memory stand-in for the Docker engine: containers are just ids, and
/// every lifecycle call is recorded for assertions.
#[derive(Default)]
pub(crate) struct FakeBackend {
    next_id: AtomicUsize,
    fail_creates: AtomicBool,
    fail_after: Mutex<Option<usize>>,
    created: Mutex<Vec<String>>,
    removed: Mutex<HashSet<String>>,
    probes: Mutex<HashMap<String, ContainerProbe>>,
    orphans: Mutex<Vec<String>>,
}

impl FakeBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `create_sandbox` fail.
    pub(crate) fn fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    /// Let the first `n` creations succeed, then fail the rest.
    pub(crate) fn fail_after(&self, n: usize) {
        *self.fail_after.lock().unwrap() = Some(n);
    }

    pub(crate) fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    pub(crate) fn was_removed(&self, container_id: &str) -> bool {
        self.removed.lock().unwrap().contains(container_id)
    }

    /// Script the probe result for one container. Unscripted containers
    /// probe as a healthy idle container (running, one pid, little memory).
    pub(crate) fn set_probe(&self, container_id: &str, probe: ContainerProbe) {
        self.probes
            .lock()
            .unwrap()
            .insert(container_id.to_string(), probe);
    }

    /// Pre-existing containers reported by the ancestor-image listing.
    pub(crate) fn seed_orphans(&self, ids: &[&str]) {
        self.orphans
            .lock()
            .unwrap()
            .extend(ids.iter().map(|id| id.to_string()));
    }
}

#[async_trait]
impl ContainerBackend for FakeBackend {
    async fn create_sandbox(&self, _image: &str, _runner_dir: &str) -> Result<String> {
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(std::io::Error::other("container engine unavailable").into());
        }
        if let Some(limit) = *self.fail_after.lock().unwrap() {
            if self.created.lock().unwrap().len() >= limit {
                return Err(std::io::Error::other("container engine unavailable").into());
            }
        }
        let id = format!("ctr-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.created.lock().unwrap().push(id.clone());
        Ok(id)
    }

    async fn force_remove(&self, container_id: &str) -> Result<()> {
        self.removed.lock().unwrap().insert(container_id.to_string());
        Ok(())
    }

    async fn list_by_ancestor_images(&self, _images: &[&str]) -> Result<Vec<String>> {
        Ok(self.orphans.lock().unwrap().clone())
    }

    async fn probe(&self, container_id: &str) -> Result<ContainerProbe> {
        Ok(self
            .probes
            .lock()
            .unwrap()
            .get(container_id)
            .copied()
            .unwrap_or(ContainerProbe {
                running: true,
                pids: 1,
                memory_bytes: 8 * 1024 * 1024,
            }))
    }

    async fn exec_create(&self, _container_id: &str, _cmd: Vec<String>) -> Result<String> {
        Ok("exec-0".to_string())
    }

    async fn exec_attach(&self, _exec_id: &str) -> Result<ExecOutputStream> {
        Ok(Box::pin(futures_util::stream::empty()))
    }

    async fn exec_exit_code(&self, _exec_id: &str) -> Result<Option<i64>> {
        Ok(Some(0))
    }
}
