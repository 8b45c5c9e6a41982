//! Stream backend: Redis streams with consumer-group semantics.
//!
//! Delivery is `XREADGROUP` with a blocking read; acknowledgement is
//! `XACK` followed by `XDEL` after the handler succeeds. Entries left
//! pending (handler failure, crash, panic) are redelivered to the group,
//! preserving the at-least-once contract. Per-key lanes keep handler
//! execution in delivery order for entries sharing a routing key.

use crate::dispatch::KeyLanes;
use crate::{semaphore_for, Handler, Publisher, Result, Subscriber, MessagingError, PUBLISH_TIMEOUT};
use async_trait::async_trait;
use crucible_common::Envelope;
use futures_util::FutureExt;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use std::sync::Arc;
use tokio::sync::watch;

/// Blocking-read window; shutdown is observed between reads.
const READ_BLOCK_MS: usize = 5000;

pub struct RedisStreamPublisher {
    conn: ConnectionManager,
}

impl RedisStreamPublisher {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl Publisher for RedisStreamPublisher {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<()> {
        let mut conn = self.conn.clone();

        let added = tokio::time::timeout(PUBLISH_TIMEOUT, async {
            let id: String = conn
                .xadd(topic, "*", &[("key", key.as_bytes()), ("value", payload)])
                .await?;
            Ok::<String, redis::RedisError>(id)
        })
        .await
        .map_err(|_| MessagingError::PublishTimeout {
            topic: topic.to_string(),
        })??;

        tracing::debug!(topic, key, id = %added, "redis stream message delivered");
        Ok(())
    }
}

pub struct RedisStreamSubscriber {
    conn: ConnectionManager,
    stream: String,
    group: String,
    consumer_name: String,
}

impl RedisStreamSubscriber {
    /// Connect and ensure the consumer group exists (`MKSTREAM`).
    ///
    /// `consumer_name` must be stable enough for pending-entry ownership
    /// but unique per worker process.
    pub async fn connect(url: &str, group: &str, stream: &str, consumer_name: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let mut conn = ConnectionManager::new(client).await?;

        let created: std::result::Result<String, redis::RedisError> =
            conn.xgroup_create_mkstream(stream, group, "$").await;
        if let Err(err) = created {
            // The group surviving a restart is the normal case.
            if err.code() != Some("BUSYGROUP") {
                return Err(err.into());
            }
        }

        tracing::info!(group, stream, consumer = consumer_name, "redis consumer initialized");
        Ok(Self {
            conn,
            stream: stream.to_string(),
            group: group.to_string(),
            consumer_name: consumer_name.to_string(),
        })
    }

    async fn read_batch(&self) -> std::result::Result<StreamReadReply, redis::RedisError> {
        let mut conn = self.conn.clone();
        let options = StreamReadOptions::default()
            .group(&self.group, &self.consumer_name)
            .count(1)
            .block(READ_BLOCK_MS);
        conn.xread_options(&[&self.stream], &[">"], &options).await
    }
}

#[async_trait]
impl Subscriber for RedisStreamSubscriber {
    async fn consume_controlled(
        &self,
        mut shutdown: watch::Receiver<bool>,
        handler: Handler,
        max_concurrent: usize,
    ) {
        let semaphore = semaphore_for(max_concurrent);
        let lanes = KeyLanes::new();
        tracing::info!(
            stream = %self.stream,
            limit = max_concurrent,
            "redis consumer loop started"
        );

        loop {
            let permit = match &semaphore {
                Some(sem) => {
                    let sem = Arc::clone(sem);
                    tokio::select! {
                        permit = sem.acquire_owned() => permit.ok(),
                        _ = shutdown.changed() => break,
                    }
                }
                None => None,
            };

            let reply = tokio::select! {
                reply = self.read_batch() => reply,
                _ = shutdown.changed() => break,
            };

            let reply = match reply {
                Ok(reply) => reply,
                Err(err) => {
                    tracing::warn!(stream = %self.stream, error = %err, "redis stream read error");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    continue;
                }
            };

            let mut permit = permit;

            for stream_key in reply.keys {
                for entry in stream_key.ids {
                    let payload = match entry.map.get("value") {
                        Some(redis::Value::BulkString(data)) => data.clone(),
                        _ => {
                            tracing::warn!(
                                stream = %self.stream,
                                id = %entry.id,
                                "stream entry without value field; acking and skipping"
                            );
                            let mut conn = self.conn.clone();
                            let _: std::result::Result<i64, _> =
                                conn.xack(&self.stream, &self.group, &[&entry.id]).await;
                            continue;
                        }
                    };
                    let key = match entry.map.get("key") {
                        Some(redis::Value::BulkString(key)) => {
                            String::from_utf8_lossy(key).into_owned()
                        }
                        _ => String::new(),
                    };
                    let envelope = Envelope::new(self.stream.clone(), key, payload)
                        .with_delivery_id(entry.id.clone());

                    let group = self.group.clone();
                    let conn = self.conn.clone();
                    let handler = Arc::clone(&handler);
                    let task_permit = permit.take();

                    let lane_key = envelope.key.clone();
                    lanes.dispatch(&lane_key, Box::pin(async move {
                        let _permit = task_permit;
                        let Envelope {
                            topic,
                            key,
                            payload,
                            delivery_id,
                        } = envelope;

                        let outcome = std::panic::AssertUnwindSafe(handler(payload))
                            .catch_unwind()
                            .await;

                        match outcome {
                            Ok(Ok(())) => {
                                let mut conn = conn;
                                if let Err(err) = conn
                                    .xack::<_, _, _, i64>(&topic, &group, &[&delivery_id])
                                    .await
                                {
                                    tracing::warn!(id = %delivery_id, error = %err, "xack failed");
                                }
                                if let Err(err) =
                                    conn.xdel::<_, _, i64>(&topic, &[&delivery_id]).await
                                {
                                    tracing::warn!(id = %delivery_id, error = %err, "xdel failed");
                                }
                            }
                            Ok(Err(err)) => {
                                tracing::error!(id = %delivery_id, key = %key, error = %err, "handler failed; entry left pending");
                            }
                            Err(_) => {
                                tracing::error!(id = %delivery_id, key = %key, "handler panicked; entry left pending");
                            }
                        }
                    }));
                }
            }

            // A blocking read that returned nothing still holds a permit;
            // give it back before the next iteration.
            drop(permit);
        }

        // Drain before returning so the caller's grace window covers
        // in-flight handlers, not just the read loop.
        tracing::info!(stream = %self.stream, "redis consumer draining in-flight handlers");
        lanes.shutdown().await;
    }
}
