//! Background health loop for idle containers.
//!
//! Only idle containers are ever probed; in-use containers are left alone
//! and judged by the runner's dirty heuristic when the job finishes.

use super::{ContainerPool, PoolHealth};
use std::sync::Arc;
use tokio::time::MissedTickBehavior;

/// An idle container holds the single `sleep` process.
pub(super) const MAX_IDLE_PIDS: u64 = 5;

/// Resident memory above this in an idle container means a previous job
/// leaked.
pub(super) const MAX_IDLE_MEMORY_BYTES: u64 = 50 * 1024 * 1024;

pub(super) async fn health_loop(pool: Arc<ContainerPool>) {
    let mut ticker = tokio::time::interval(pool.config().effective_health_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // interval fires immediately; the pool was just warmed, skip that one.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        check_idle(&pool).await;
    }
}

/// Probe every container that is idle right now.
///
/// The count is snapshotted up front so containers re-enqueued as healthy
/// are not probed twice in one pass. Healthy containers go back to the
/// idle queue; unhealthy ones are replaced.
async fn check_idle(pool: &ContainerPool) {
    let n = pool.idle_len().await;
    if n == 0 {
        return;
    }

    let mut healthy = 0usize;
    let mut probed = 0usize;

    for _ in 0..n {
        let id = match pool.try_take_idle().await {
            Some(id) => id,
            // A borrower raced us; the remaining containers are in use.
            None => break,
        };
        probed += 1;

        if pool.is_healthy(&id).await {
            healthy += 1;
            pool.put_back_idle(id).await;
        } else {
            pool.replace(&id).await;
        }
    }

    if probed == 0 {
        return;
    }

    let ratio = healthy as f64 / probed as f64;
    let level = if ratio >= 0.8 {
        PoolHealth::Healthy
    } else if ratio >= 0.4 {
        PoolHealth::Degraded
    } else {
        PoolHealth::Unhealthy
    };

    tracing::debug!(
        language = %pool.language(),
        probed,
        healthy,
        health = ?level,
        "idle health pass complete"
    );
    pool.set_health(level);
}
