//! At-least-once pub/sub for Crucible.
//!
//! Two behaviorally equivalent backends sit behind the [`Publisher`] and
//! [`Subscriber`] traits: a partitioned-log backend (Kafka) and a stream
//! backend (Redis streams with consumer groups). Both acknowledge a
//! message only after its handler returns successfully, and both run
//! handlers for messages sharing a routing key serially in delivery
//! order (distinct keys run concurrently up to the configured bound).

mod dispatch;
pub mod factory;
pub mod kafka;
pub mod redis_stream;

use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

/// Broker publish deadline. A publish that has not been durably accepted
/// within this window fails back to the caller.
pub const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

pub type Result<T> = std::result::Result<T, MessagingError>;

#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("publish to '{topic}' timed out")]
    PublishTimeout { topic: String },

    #[error("messaging configuration error: {0}")]
    Config(String),
}

/// Future returned by a message handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// Per-message callback. An `Err` leaves the message unacknowledged so the
/// backend redelivers it.
pub type Handler = Arc<dyn Fn(Vec<u8>) -> HandlerFuture + Send + Sync>;

/// Durable message publication. Implementations are thread-safe and shared
/// as one instance per process.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish `payload` to `topic`, routed by `key`. Returns only after
    /// the backend has durably accepted the message.
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<()>;
}

/// Long-running message consumption with bounded concurrency.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Consume until `shutdown` flips to `true`, then drain in-flight
    /// handlers before returning (the caller bounds the drain with its
    /// grace window).
    ///
    /// Each message is dispatched to `handler` under a semaphore of
    /// `max_concurrent` slots (`0` = unbounded) and acknowledged only after
    /// the handler returns `Ok`. Messages sharing a routing key are
    /// handled serially in delivery order. Handler panics are caught and
    /// logged; the slot is released on every path.
    async fn consume_controlled(
        &self,
        shutdown: watch::Receiver<bool>,
        handler: Handler,
        max_concurrent: usize,
    );
}

/// Convenience for building a [`Handler`] from an async closure.
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |payload| Box::pin(f(payload)))
}

pub(crate) fn semaphore_for(max_concurrent: usize) -> Option<Arc<tokio::sync::Semaphore>> {
    if max_concurrent == 0 {
        None
    } else {
        Some(Arc::new(tokio::sync::Semaphore::new(max_concurrent)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_means_unbounded() {
        assert!(semaphore_for(0).is_none());
        let sem = semaphore_for(4).unwrap();
        assert_eq!(sem.available_permits(), 4);
    }

    #[tokio::test]
    async fn handler_adapter_invokes_closure() {
        let seen = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let handler = {
            let seen = Arc::clone(&seen);
            handler(move |payload: Vec<u8>| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.lock().await.push(payload);
                    Ok(())
                }
            })
        };

        handler(b"abc".to_vec()).await.unwrap();
        assert_eq!(seen.lock().await.as_slice(), &[b"abc".to_vec()]);
    }
}
