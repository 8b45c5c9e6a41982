//! Per-key serialized dispatch of handler work.
//!
//! The broker delivers messages in order per routing key, but running each
//! handler on its own task would let two same-key jobs execute
//! concurrently and finish out of order. Lanes restore the guarantee:
//! every key gets one in-order queue drained by one task, so handler
//! invocations for a key run in delivery order while distinct keys still
//! run concurrently up to the subscriber's semaphore bound.
//!
//! Lanes live for the subscriber's lifetime. The key space is the set of
//! routing keys, which for the execution topic is the language tag: small
//! and fixed.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

/// One unit of handler work, ready to run. The semaphore permit and the
/// backend's ack travel inside the future.
pub(crate) type Work = Pin<Box<dyn Future<Output = ()> + Send>>;

pub(crate) struct KeyLanes {
    state: Mutex<LaneState>,
}

struct LaneState {
    senders: HashMap<String, mpsc::UnboundedSender<Work>>,
    tasks: JoinSet<()>,
    closed: bool,
}

impl KeyLanes {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(LaneState {
                senders: HashMap::new(),
                tasks: JoinSet::new(),
                closed: false,
            }),
        }
    }

    /// Queue work on `key`'s lane, creating the lane on first use.
    ///
    /// After [`shutdown`](Self::shutdown) has begun the work is dropped
    /// unrun; its message was never acknowledged and redelivers.
    pub(crate) fn dispatch(&self, key: &str, work: Work) {
        let mut state = self.state.lock().expect("lane state");
        if state.closed {
            return;
        }

        let work = if let Some(tx) = state.senders.get(key) {
            match tx.send(work) {
                Ok(()) => return,
                Err(mpsc::error::SendError(work)) => work,
            }
        } else {
            work
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<Work>();
        let _ = tx.send(work);
        state.senders.insert(key.to_string(), tx);
        state.tasks.spawn(async move {
            while let Some(work) = rx.recv().await {
                work.await;
            }
        });
    }

    /// Stop accepting work and wait for every lane to finish what it has
    /// queued. The caller bounds this with its grace window.
    pub(crate) async fn shutdown(&self) {
        let mut tasks = {
            let mut state = self.state.lock().expect("lane state");
            state.closed = true;
            // Dropping the senders lets each lane drain and exit.
            state.senders.clear();
            std::mem::take(&mut state.tasks)
        };

        while tasks.join_next().await.is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_work_runs_in_dispatch_order() {
        let lanes = KeyLanes::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..20u32 {
            let seen = Arc::clone(&seen);
            lanes.dispatch(
                "python",
                Box::pin(async move {
                    // Later work sleeping less would expose reordering.
                    tokio::time::sleep(Duration::from_millis(u64::from(20 - i) % 5)).await;
                    seen.lock().unwrap().push(i);
                }),
            );
        }

        lanes.shutdown().await;
        assert_eq!(*seen.lock().unwrap(), (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn distinct_keys_run_concurrently() {
        let lanes = KeyLanes::new();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let (entered_tx, entered_rx) = tokio::sync::oneshot::channel::<()>();

        // The "cpp" lane blocks until the "python" lane proves it ran.
        lanes.dispatch(
            "cpp",
            Box::pin(async move {
                let _ = entered_tx.send(());
                let _ = release_rx.await;
            }),
        );
        lanes.dispatch(
            "python",
            Box::pin(async move {
                // Only reachable while the cpp work is still parked.
            }),
        );

        entered_rx.await.unwrap();
        lanes.dispatch(
            "python",
            Box::pin(async move {
                let _ = release_tx.send(());
            }),
        );

        // Drains only if the python lane ran while cpp was blocked.
        tokio::time::timeout(Duration::from_secs(5), lanes.shutdown())
            .await
            .expect("lanes drained");
    }

    #[tokio::test]
    async fn shutdown_drains_queued_work() {
        let lanes = KeyLanes::new();
        let count = Arc::new(Mutex::new(0u32));

        for _ in 0..5 {
            let count = Arc::clone(&count);
            lanes.dispatch(
                "java",
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    *count.lock().unwrap() += 1;
                }),
            );
        }

        lanes.shutdown().await;
        assert_eq!(*count.lock().unwrap(), 5);
    }

    #[tokio::test]
    async fn dispatch_after_shutdown_is_dropped() {
        let lanes = KeyLanes::new();
        lanes.shutdown().await;

        let ran = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&ran);
        lanes.dispatch(
            "go",
            Box::pin(async move {
                *flag.lock().unwrap() = true;
            }),
        );

        lanes.shutdown().await;
        assert!(!*ran.lock().unwrap());
    }
}
