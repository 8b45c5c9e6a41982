//! Per-language warm container pools.
//!
//! The pool manager owns one [`ContainerPool`] per registered language,
//! pre-warms them at startup, and destroys them on shutdown. There is no
//! process-global manager: the worker entry point builds one, shares it
//! behind an `Arc`, and tests inject fakes through [`SandboxPools`].

mod container_pool;
mod health;
#[cfg(test)]
pub(crate) mod testutil;

pub use container_pool::ContainerPool;

use crate::docker::ContainerBackend;
use crate::error::{Result, SandboxError};
use crate::registry::Language;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Aggregated health of one pool, derived from the periodic idle probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolHealth {
    /// Not evaluated yet (startup).
    Unknown,
    Healthy,
    Degraded,
    Unhealthy,
}

/// Configuration for one language pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub language: Language,
    pub image: String,
    /// Containers created eagerly at startup; the pool never voluntarily
    /// scales below this.
    pub init_size: usize,
    /// Hard cap on live containers (idle + in-use).
    pub max_size: usize,
    /// Optional command executed inside idle containers during health
    /// checks; healthy iff it exits 0.
    pub health_cmd: Option<Vec<String>>,
    /// Zero or unset means the 2-minute default.
    pub health_interval: Duration,
}

impl PoolConfig {
    /// Compile-time pool list: one pool per supported language, images from
    /// the registry.
    pub fn defaults() -> Vec<PoolConfig> {
        Language::ALL
            .into_iter()
            .map(|language| PoolConfig {
                language,
                image: language.image().to_string(),
                init_size: 1,
                max_size: 2,
                health_cmd: None,
                health_interval: Duration::ZERO,
            })
            .collect()
    }

    pub(crate) fn effective_health_interval(&self) -> Duration {
        if self.health_interval.is_zero() {
            Duration::from_secs(120)
        } else {
            self.health_interval
        }
    }
}

/// What the worker loop needs from the pool layer. `PoolManager` is the
/// production implementation; tests substitute scripted fakes.
#[async_trait]
pub trait SandboxPools: Send + Sync {
    /// Borrow a container for the language, blocking until one is free or
    /// `cancel` fires.
    async fn acquire(&self, language: Language, cancel: watch::Receiver<bool>) -> Result<String>;

    /// Return a clean container to its pool.
    async fn release(&self, language: Language, container_id: String);

    /// Remove a dirty container and best-effort spawn a replacement.
    async fn replace(&self, language: Language, container_id: String);
}

pub struct PoolManager {
    docker: Arc<dyn ContainerBackend>,
    runner_dir: String,
    pools: HashMap<Language, Arc<ContainerPool>>,
    health_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PoolManager {
    pub fn new(docker: Arc<dyn ContainerBackend>, runner_dir: impl Into<String>) -> Self {
        Self {
            docker,
            runner_dir: runner_dir.into(),
            pools: HashMap::new(),
            health_tasks: Mutex::new(Vec::new()),
        }
    }

    /// Record a pool's configuration. Idempotent; the last registration for
    /// a language wins. No I/O happens here.
    pub fn register(&mut self, cfg: PoolConfig) {
        let pool = ContainerPool::new(
            cfg.clone(),
            Arc::clone(&self.docker),
            self.runner_dir.clone(),
        );
        self.pools.insert(cfg.language, Arc::new(pool));
    }

    pub fn pool(&self, language: Language) -> Option<Arc<ContainerPool>> {
        self.pools.get(&language).cloned()
    }

    /// Pre-warm every registered pool and start its health loop.
    ///
    /// A pool that warms zero containers fails startup. A partially warmed
    /// pool logs a warning and starts degraded; capacity recovers through
    /// the borrow growth path.
    pub async fn init_all(&self) -> Result<()> {
        self.cleanup_orphans().await;

        for pool in self.pools.values() {
            tracing::info!(language = %pool.language(), "pre-warming container pool");
            pool.warm_up().await?;

            let handle = tokio::spawn(health::health_loop(Arc::clone(pool)));
            self.health_tasks.lock().expect("health task list").push(handle);
        }

        Ok(())
    }

    /// Force-remove every container in every pool. Safe to call repeatedly;
    /// a second call finds nothing to remove.
    pub async fn destroy_all(&self) {
        for handle in self.health_tasks.lock().expect("health task list").drain(..) {
            handle.abort();
        }

        tracing::info!("destroying all warm containers");
        for pool in self.pools.values() {
            pool.destroy().await;
        }
    }

    /// Remove containers left behind by a crashed worker: anything created
    /// from a registered pool image is ours.
    async fn cleanup_orphans(&self) {
        let images: Vec<&str> = self.pools.values().map(|p| p.image()).collect();
        if images.is_empty() {
            return;
        }

        let orphans = match self.docker.list_by_ancestor_images(&images).await {
            Ok(ids) => ids,
            Err(err) => {
                tracing::warn!(error = %err, "orphan container listing failed");
                return;
            }
        };

        if orphans.is_empty() {
            return;
        }

        tracing::info!(count = orphans.len(), "removing orphaned sandbox containers");
        for id in orphans {
            if let Err(err) = self.docker.force_remove(&id).await {
                tracing::warn!(container = %id, error = %err, "failed to remove orphan");
            }
        }
    }
}

#[async_trait]
impl SandboxPools for PoolManager {
    async fn acquire(&self, language: Language, cancel: watch::Receiver<bool>) -> Result<String> {
        match self.pool(language) {
            Some(pool) => pool.acquire(cancel).await,
            None => Err(SandboxError::NoPool(language.tag().to_string())),
        }
    }

    async fn release(&self, language: Language, container_id: String) {
        if let Some(pool) = self.pool(language) {
            pool.release(container_id).await;
        }
    }

    async fn replace(&self, language: Language, container_id: String) {
        if let Some(pool) = self.pool(language) {
            pool.replace(&container_id).await;
        }
    }
}
