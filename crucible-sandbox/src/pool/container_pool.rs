//! One language's pool of reusable sandbox containers.

use super::{PoolConfig, PoolHealth};
use crate::docker::ContainerBackend;
use crate::error::{Result, SandboxError};
use crate::registry::Language;
use futures_util::StreamExt;
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{watch, Mutex};

#[derive(Debug, Clone, Copy)]
struct HealthState {
    level: PoolHealth,
    last_check: Option<Instant>,
}

/// A warm set of containers for a single language.
///
/// Borrowing reads from the bounded `idle` queue; returning writes back to
/// it. Borrowed containers are not tracked individually; `release` and
/// `replace` are the only re-entry points.
pub struct ContainerPool {
    cfg: PoolConfig,
    docker: Arc<dyn ContainerBackend>,
    runner_dir: String,
    idle_tx: mpsc::Sender<String>,
    idle_rx: Mutex<mpsc::Receiver<String>>,
    /// Live containers, idle + in-use. Guarded separately from `idle` so
    /// the scale-up decision and the creation happen under one lock.
    total: Mutex<usize>,
    health: RwLock<HealthState>,
}

impl ContainerPool {
    pub(super) fn new(
        cfg: PoolConfig,
        docker: Arc<dyn ContainerBackend>,
        runner_dir: String,
    ) -> Self {
        let (idle_tx, idle_rx) = mpsc::channel(cfg.max_size.max(1));
        Self {
            cfg,
            docker,
            runner_dir,
            idle_tx,
            idle_rx: Mutex::new(idle_rx),
            total: Mutex::new(0),
            health: RwLock::new(HealthState {
                level: PoolHealth::Unknown,
                last_check: None,
            }),
        }
    }

    pub fn language(&self) -> Language {
        self.cfg.language
    }

    pub fn image(&self) -> &str {
        &self.cfg.image
    }

    pub(super) fn config(&self) -> &PoolConfig {
        &self.cfg
    }

    /// Live container count (idle + in-use).
    pub async fn total(&self) -> usize {
        *self.total.lock().await
    }

    /// Containers currently idle.
    pub async fn idle_len(&self) -> usize {
        self.idle_rx.lock().await.len()
    }

    pub fn health(&self) -> PoolHealth {
        self.health.read().expect("pool health lock").level
    }

    pub fn last_health_check(&self) -> Option<Instant> {
        self.health.read().expect("pool health lock").last_check
    }

    pub(super) fn set_health(&self, level: PoolHealth) {
        let mut state = self.health.write().expect("pool health lock");
        state.level = level;
        state.last_check = Some(Instant::now());
    }

    /// Eagerly create `init_size` containers.
    ///
    /// Zero warmed containers means the pool cannot function and fails
    /// startup; a partial warm logs and proceeds degraded.
    pub(super) async fn warm_up(&self) -> Result<()> {
        let mut warmed = 0usize;

        for i in 0..self.cfg.init_size {
            match self.new_container().await {
                Ok(id) => {
                    let _ = self.idle_tx.send(id).await;
                    *self.total.lock().await += 1;
                    warmed += 1;
                }
                Err(err) => {
                    tracing::warn!(
                        language = %self.cfg.language,
                        attempt = i + 1,
                        of = self.cfg.init_size,
                        error = %err,
                        "failed to warm container"
                    );
                }
            }
        }

        if warmed == 0 {
            return Err(SandboxError::WarmUpFailed {
                language: self.cfg.language.tag().to_string(),
            });
        }

        if warmed < self.cfg.init_size {
            tracing::warn!(
                language = %self.cfg.language,
                ready = warmed,
                wanted = self.cfg.init_size,
                "pool started in degraded mode"
            );
            self.set_health(PoolHealth::Degraded);
        } else {
            self.set_health(PoolHealth::Healthy);
        }

        Ok(())
    }

    /// Borrow a container.
    ///
    /// 1. Reuse an idle container if one is available.
    /// 2. Otherwise create a new one while `total < max_size`.
    /// 3. Otherwise wait for a return, racing `cancel`: when the flag
    ///    flips (or its sender is gone) the borrow fails with
    ///    [`SandboxError::PoolUnavailable`] instead of blocking past
    ///    shutdown.
    pub async fn acquire(&self, mut cancel: watch::Receiver<bool>) -> Result<String> {
        if *cancel.borrow_and_update() {
            return Err(self.unavailable("borrow cancelled"));
        }

        {
            let mut idle = self.idle_rx.lock().await;
            if let Ok(id) = idle.try_recv() {
                return Ok(id);
            }
        }

        {
            let mut total = self.total.lock().await;
            if *total < self.cfg.max_size {
                match self.new_container().await {
                    Ok(id) => {
                        tracing::info!(
                            language = %self.cfg.language,
                            total = *total + 1,
                            "scaling pool up"
                        );
                        *total += 1;
                        return Ok(id);
                    }
                    Err(err) => {
                        tracing::warn!(
                            language = %self.cfg.language,
                            error = %err,
                            "scale-up container creation failed"
                        );
                    }
                }
            }
        }

        let mut idle = tokio::select! {
            idle = self.idle_rx.lock() => idle,
            _ = cancelled(&mut cancel) => return Err(self.unavailable("borrow cancelled")),
        };
        tokio::select! {
            id = idle.recv() => id.ok_or_else(|| self.unavailable("idle queue closed")),
            _ = cancelled(&mut cancel) => Err(self.unavailable("borrow cancelled")),
        }
    }

    fn unavailable(&self, reason: &str) -> SandboxError {
        SandboxError::PoolUnavailable {
            language: self.cfg.language.tag().to_string(),
            reason: reason.to_string(),
        }
    }

    /// Return a container.
    ///
    /// If the idle queue is full and the pool is above `init_size`, the
    /// container is destroyed instead (scale down). The pool never scales
    /// below `init_size` voluntarily.
    pub async fn release(&self, container_id: String) {
        let container_id = match self.idle_tx.try_send(container_id) {
            Ok(()) => return,
            Err(TrySendError::Full(id)) | Err(TrySendError::Closed(id)) => id,
        };

        {
            let mut total = self.total.lock().await;
            if *total > self.cfg.init_size {
                tracing::info!(
                    language = %self.cfg.language,
                    total = *total - 1,
                    "scaling pool down"
                );
                *total -= 1;

                let docker = self.docker.clone();
                tokio::spawn(async move {
                    if let Err(err) = docker.force_remove(&container_id).await {
                        tracing::warn!(container = %container_id, error = %err, "scale-down removal failed");
                    }
                });
                return;
            }
        }

        let _ = self.idle_tx.send(container_id).await;
    }

    /// Remove a container regardless of state and best-effort create a
    /// replacement. On replacement failure the pool runs with reduced
    /// capacity until the borrow growth path restores it.
    pub async fn replace(&self, container_id: &str) {
        tracing::warn!(
            language = %self.cfg.language,
            container = %container_id,
            "replacing container"
        );

        if let Err(err) = self.docker.force_remove(container_id).await {
            tracing::warn!(container = %container_id, error = %err, "forced removal failed");
        }

        match self.new_container().await {
            Ok(new_id) => {
                let _ = self.idle_tx.send(new_id).await;
            }
            Err(err) => {
                tracing::warn!(
                    language = %self.cfg.language,
                    error = %err,
                    "failed to spawn replacement container"
                );
                let mut total = self.total.lock().await;
                *total = total.saturating_sub(1);
            }
        }
    }

    /// Drain the idle queue and force-remove everything. Borrowed
    /// containers are removed by the orphan cleanup of the next startup.
    pub(super) async fn destroy(&self) {
        let mut idle = self.idle_rx.lock().await;
        while let Ok(id) = idle.try_recv() {
            tracing::info!(language = %self.cfg.language, container = %id, "removing container");
            if let Err(err) = self.docker.force_remove(&id).await {
                tracing::warn!(container = %id, error = %err, "removal failed during destroy");
            }
            let mut total = self.total.lock().await;
            *total = total.saturating_sub(1);
        }
    }

    pub(super) async fn try_take_idle(&self) -> Option<String> {
        self.idle_rx.lock().await.try_recv().ok()
    }

    pub(super) async fn put_back_idle(&self, container_id: String) {
        let _ = self.idle_tx.send(container_id).await;
    }

    pub(super) async fn is_healthy(&self, container_id: &str) -> bool {
        let probe = match self.docker.probe(container_id).await {
            Ok(probe) => probe,
            Err(err) => {
                tracing::warn!(container = %container_id, error = %err, "health probe failed");
                return false;
            }
        };

        // An idle container holds exactly the `sleep` process; extra pids
        // or 50 MiB of resident memory mean a job leaked something.
        if !probe.running {
            return false;
        }
        if probe.pids > super::health::MAX_IDLE_PIDS {
            return false;
        }
        if probe.memory_bytes > super::health::MAX_IDLE_MEMORY_BYTES {
            return false;
        }

        if let Some(cmd) = &self.cfg.health_cmd {
            return self.run_health_cmd(container_id, cmd.clone()).await;
        }

        true
    }

    async fn run_health_cmd(&self, container_id: &str, cmd: Vec<String>) -> bool {
        let outcome = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            let exec_id = self.docker.exec_create(container_id, cmd).await?;
            let mut output = self.docker.exec_attach(&exec_id).await?;
            while let Some(chunk) = output.next().await {
                chunk?;
            }
            self.docker.exec_exit_code(&exec_id).await
        })
        .await;

        matches!(outcome, Ok(Ok(Some(0))))
    }

    async fn new_container(&self) -> Result<String> {
        self.docker
            .create_sandbox(&self.cfg.image, &self.runner_dir)
            .await
    }
}

/// Resolves once `cancel` reads true or its sender is gone.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::testutil::FakeBackend;
    use std::time::Duration;

    fn pool_with(init: usize, max: usize, backend: Arc<FakeBackend>) -> ContainerPool {
        ContainerPool::new(
            PoolConfig {
                language: Language::Python,
                image: "python:3.12-alpine".into(),
                init_size: init,
                max_size: max,
                health_cmd: None,
                health_interval: Duration::ZERO,
            },
            backend,
            "/tmp/runner".into(),
        )
    }

    fn no_cancel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    #[tokio::test]
    async fn warm_up_fills_idle_to_init_size() {
        let backend = Arc::new(FakeBackend::new());
        let pool = pool_with(2, 4, Arc::clone(&backend));

        pool.warm_up().await.unwrap();

        assert_eq!(pool.total().await, 2);
        assert_eq!(pool.idle_len().await, 2);
        assert!(pool.idle_len().await <= pool.total().await);
        assert!(pool.total().await <= 4);
        assert_eq!(pool.health(), PoolHealth::Healthy);
    }

    #[tokio::test]
    async fn warm_up_with_zero_containers_fails() {
        let backend = Arc::new(FakeBackend::new());
        backend.fail_creates(true);
        let pool = pool_with(2, 4, backend);

        assert!(matches!(
            pool.warm_up().await,
            Err(SandboxError::WarmUpFailed { .. })
        ));
    }

    #[tokio::test]
    async fn partial_warm_enters_degraded_mode() {
        let backend = Arc::new(FakeBackend::new());
        backend.fail_after(1);
        let pool = pool_with(3, 4, backend);

        pool.warm_up().await.unwrap();

        assert_eq!(pool.total().await, 1);
        assert_eq!(pool.health(), PoolHealth::Degraded);
    }

    #[tokio::test]
    async fn acquire_prefers_idle_over_creating() {
        let backend = Arc::new(FakeBackend::new());
        let pool = pool_with(1, 2, Arc::clone(&backend));
        pool.warm_up().await.unwrap();
        let (_tx, cancel) = no_cancel();

        let id = pool.acquire(cancel).await.unwrap();

        assert_eq!(id, "ctr-0");
        assert_eq!(backend.created_count(), 1);
        assert_eq!(pool.total().await, 1);
        assert_eq!(pool.idle_len().await, 0);
    }

    #[tokio::test]
    async fn acquire_grows_to_max_then_blocks_until_release() {
        let backend = Arc::new(FakeBackend::new());
        let pool = Arc::new(pool_with(1, 2, Arc::clone(&backend)));
        pool.warm_up().await.unwrap();
        let (_tx, cancel) = no_cancel();

        let first = pool.acquire(cancel.clone()).await.unwrap();
        let second = pool.acquire(cancel.clone()).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(pool.total().await, 2);

        // At max capacity the next borrow must wait for a return.
        let waiter = {
            let pool = Arc::clone(&pool);
            let cancel = cancel.clone();
            tokio::spawn(async move { pool.acquire(cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        assert_eq!(pool.total().await, 2);

        pool.release(first.clone()).await;
        let third = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(third, first);
        assert_eq!(pool.total().await, 2);
    }

    #[tokio::test]
    async fn acquire_fails_when_already_cancelled() {
        let backend = Arc::new(FakeBackend::new());
        let pool = pool_with(1, 1, backend);
        pool.warm_up().await.unwrap();
        let (tx, cancel) = no_cancel();

        let _held = pool.acquire(cancel.clone()).await.unwrap();

        tx.send(true).unwrap();
        assert!(matches!(
            pool.acquire(cancel).await,
            Err(SandboxError::PoolUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn blocked_acquire_unblocks_on_cancellation() {
        let backend = Arc::new(FakeBackend::new());
        let pool = Arc::new(pool_with(1, 1, backend));
        pool.warm_up().await.unwrap();
        let (tx, cancel) = no_cancel();

        let _held = pool.acquire(cancel.clone()).await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire(cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        tx.send(true).unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            outcome,
            Err(SandboxError::PoolUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn release_with_full_idle_scales_down_above_init() {
        let backend = Arc::new(FakeBackend::new());
        let pool = pool_with(1, 2, Arc::clone(&backend));
        pool.warm_up().await.unwrap();
        let (_tx, cancel) = no_cancel();

        let first = pool.acquire(cancel.clone()).await.unwrap();
        let second = pool.acquire(cancel).await.unwrap();
        pool.release(first).await;
        pool.release(second).await;
        assert_eq!(pool.idle_len().await, 2);

        // Idle is full; returning one more container triggers scale-down.
        pool.release("ghost".to_string()).await;
        assert_eq!(pool.total().await, 1);
        // Removal happens on a background task.
        for _ in 0..50 {
            if backend.was_removed("ghost") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(backend.was_removed("ghost"));
    }

    #[tokio::test]
    async fn replace_removes_and_spawns_replacement() {
        let backend = Arc::new(FakeBackend::new());
        let pool = pool_with(1, 2, Arc::clone(&backend));
        pool.warm_up().await.unwrap();
        let (_tx, cancel) = no_cancel();

        let dirty = pool.acquire(cancel.clone()).await.unwrap();
        pool.replace(&dirty).await;

        assert!(backend.was_removed(&dirty));
        assert_eq!(pool.total().await, 1);
        assert_eq!(pool.idle_len().await, 1);
        let fresh = pool.acquire(cancel).await.unwrap();
        assert_ne!(fresh, dirty);
    }

    #[tokio::test]
    async fn failed_replacement_releases_capacity_for_growth() {
        let backend = Arc::new(FakeBackend::new());
        let pool = pool_with(1, 1, Arc::clone(&backend));
        pool.warm_up().await.unwrap();
        let (_tx, cancel) = no_cancel();

        let dirty = pool.acquire(cancel.clone()).await.unwrap();
        backend.fail_creates(true);
        pool.replace(&dirty).await;
        assert_eq!(pool.total().await, 0);

        // With capacity freed, the next borrow grows a fresh container.
        backend.fail_creates(false);
        let fresh = pool.acquire(cancel).await.unwrap();
        assert_ne!(fresh, dirty);
        assert_eq!(pool.total().await, 1);
    }

    #[tokio::test]
    async fn destroy_then_warm_up_matches_fresh_start() {
        let backend = Arc::new(FakeBackend::new());
        let pool = pool_with(2, 4, Arc::clone(&backend));
        pool.warm_up().await.unwrap();

        pool.destroy().await;
        assert_eq!(pool.total().await, 0);
        assert_eq!(pool.idle_len().await, 0);
        assert!(backend.was_removed("ctr-0"));
        assert!(backend.was_removed("ctr-1"));

        // Destroying again finds nothing to remove.
        pool.destroy().await;

        pool.warm_up().await.unwrap();
        assert_eq!(pool.total().await, 2);
        assert_eq!(pool.idle_len().await, 2);
        assert_eq!(pool.health(), PoolHealth::Healthy);
    }
}
