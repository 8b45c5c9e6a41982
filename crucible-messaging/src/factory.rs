//! Backend selection and consumer wiring.
//!
//! The worker entry point calls these once and passes the resulting
//! objects by reference; there is no process-global publisher or
//! subscriber registry.

use crate::kafka::{KafkaPublisher, KafkaSubscriber};
use crate::redis_stream::{RedisStreamPublisher, RedisStreamSubscriber};
use crate::{Handler, Publisher, Result, Subscriber};
use crucible_common::{QueueBackend, WorkerConfig};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Build the process publisher for the configured backend.
pub async fn publisher(cfg: &WorkerConfig) -> Result<Arc<dyn Publisher>> {
    match cfg.queue_backend {
        QueueBackend::Kafka => Ok(Arc::new(KafkaPublisher::new(&cfg.kafka_broker)?)),
        QueueBackend::Redis => Ok(Arc::new(
            RedisStreamPublisher::connect(&redis_url(cfg)).await?,
        )),
    }
}

/// Build a subscriber for `(group, topic)` on the configured backend.
pub async fn subscriber(
    cfg: &WorkerConfig,
    group: &str,
    topic: &str,
) -> Result<Arc<dyn Subscriber>> {
    match cfg.queue_backend {
        QueueBackend::Kafka => Ok(Arc::new(KafkaSubscriber::new(
            &cfg.kafka_broker,
            group,
            topic,
        )?)),
        QueueBackend::Redis => {
            let consumer_name = format!("{}-{}", cfg.service_name, Uuid::new_v4());
            Ok(Arc::new(
                RedisStreamSubscriber::connect(&redis_url(cfg), group, topic, &consumer_name)
                    .await?,
            ))
        }
    }
}

/// Subscribe and dispatch messages to `handler` until shutdown, on a
/// background task.
pub async fn start_consumer(
    cfg: &WorkerConfig,
    topic: &str,
    group: &str,
    max_concurrent: usize,
    shutdown: watch::Receiver<bool>,
    handler: Handler,
) -> Result<JoinHandle<()>> {
    let sub = subscriber(cfg, group, topic).await?;
    tracing::info!(topic, group, "worker listening");

    Ok(tokio::spawn(async move {
        sub.consume_controlled(shutdown, handler, max_concurrent).await;
    }))
}

/// Redis connection URL with the optional password applied.
fn redis_url(cfg: &WorkerConfig) -> String {
    let addr = cfg.redis_addr.clone();
    match &cfg.redis_password {
        Some(password) if !addr.contains('@') => {
            let rest = addr.strip_prefix("redis://").unwrap_or(&addr);
            format!("redis://:{password}@{rest}")
        }
        _ => addr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> WorkerConfig {
        WorkerConfig {
            mongo_uri: "mongodb://localhost:27017".into(),
            mongo_db_name: "crucible".into(),
            queue_backend: QueueBackend::Redis,
            kafka_broker: "localhost:9092".into(),
            redis_addr: "redis://127.0.0.1:6379".into(),
            redis_password: None,
            log_queue_name: "service-logs".into(),
            service_name: "crucible-worker".into(),
            environment: "dev".into(),
            runner_dir: "/tmp/runner".into(),
            max_concurrent: 8,
        }
    }

    #[test]
    fn redis_url_without_password() {
        let cfg = base_config();
        assert_eq!(redis_url(&cfg), "redis://127.0.0.1:6379");
    }

    #[test]
    fn redis_url_injects_password() {
        let cfg = WorkerConfig {
            redis_password: Some("s3cret".into()),
            ..base_config()
        };
        assert_eq!(redis_url(&cfg), "redis://:s3cret@127.0.0.1:6379");
    }

    #[test]
    fn redis_url_keeps_existing_userinfo() {
        let cfg = WorkerConfig {
            redis_addr: "redis://user:pw@10.0.0.5:6379".into(),
            redis_password: Some("ignored".into()),
            ..base_config()
        };
        assert_eq!(redis_url(&cfg), "redis://user:pw@10.0.0.5:6379");
    }
}
