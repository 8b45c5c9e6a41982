//! Partitioned-log backend.
//!
//! Messages are keyed by routing key and hash-partitioned, so per-key FIFO
//! comes from partition ordering; per-key lanes keep handler *execution*
//! in that order too. Offsets are committed only after the handler
//! succeeds; a fresh consumer group starts from the latest offset.

use crate::dispatch::KeyLanes;
use crate::{semaphore_for, Handler, MessagingError, Publisher, Result, Subscriber, PUBLISH_TIMEOUT};
use async_trait::async_trait;
use futures_util::FutureExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use std::sync::Arc;
use tokio::sync::watch;

pub struct KafkaPublisher {
    producer: FutureProducer,
}

impl KafkaPublisher {
    pub fn new(broker: &str) -> Result<Self> {
        let producer = ClientConfig::new()
            .set("bootstrap.servers", broker)
            .set("acks", "all")
            .set("message.timeout.ms", "5000")
            .create()?;
        Ok(Self { producer })
    }
}

#[async_trait]
impl Publisher for KafkaPublisher {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<()> {
        let record = FutureRecord::to(topic).key(key).payload(payload);

        self.producer
            .send(record, Timeout::After(PUBLISH_TIMEOUT))
            .await
            .map_err(|(err, _)| MessagingError::Kafka(err))?;

        tracing::debug!(topic, key, "kafka message delivered");
        Ok(())
    }
}

pub struct KafkaSubscriber {
    consumer: Arc<StreamConsumer>,
    topic: String,
}

impl KafkaSubscriber {
    pub fn new(broker: &str, group: &str, topic: &str) -> Result<Self> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", broker)
            .set("group.id", group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "latest")
            .set("session.timeout.ms", "6000")
            .create()?;

        consumer.subscribe(&[topic])?;
        tracing::info!(group, topic, "kafka consumer subscribed");

        Ok(Self {
            consumer: Arc::new(consumer),
            topic: topic.to_string(),
        })
    }
}

#[async_trait]
impl Subscriber for KafkaSubscriber {
    async fn consume_controlled(
        &self,
        mut shutdown: watch::Receiver<bool>,
        handler: Handler,
        max_concurrent: usize,
    ) {
        let semaphore = semaphore_for(max_concurrent);
        let lanes = KeyLanes::new();
        tracing::info!(
            topic = %self.topic,
            limit = max_concurrent,
            "kafka consumer loop started"
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

            let message = tokio::select! {
                message = self.consumer.recv() => message,
                _ = shutdown.changed() => break,
            };

            let message = match message {
                Ok(message) => message,
                Err(err) => {
                    tracing::warn!(topic = %self.topic, error = %err, "kafka read error");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    continue;
                }
            };

            let key = message
                .key()
                .map(|key| String::from_utf8_lossy(key).into_owned())
                .unwrap_or_default();
            let payload = message.payload().unwrap_or_default().to_vec();
            let partition = message.partition();
            let offset = message.offset();
            let topic = self.topic.clone();
            let consumer = Arc::clone(&self.consumer);
            let handler = Arc::clone(&handler);

            lanes.dispatch(
                &key,
                Box::pin(async move {
                    let _permit = permit;

                    let outcome = std::panic::AssertUnwindSafe(handler(payload))
                        .catch_unwind()
                        .await;

                    match outcome {
                        Ok(Ok(())) => {
                            let mut tpl = TopicPartitionList::new();
                            if tpl
                                .add_partition_offset(&topic, partition, Offset::Offset(offset + 1))
                                .is_ok()
                            {
                                if let Err(err) = consumer.commit(&tpl, CommitMode::Async) {
                                    tracing::warn!(topic = %topic, partition, offset, error = %err, "offset commit failed");
                                }
                            }
                        }
                        Ok(Err(err)) => {
                            tracing::error!(topic = %topic, partition, offset, error = %err, "handler failed; message left uncommitted");
                        }
                        Err(_) => {
                            tracing::error!(topic = %topic, partition, offset, "handler panicked; message left uncommitted");
                        }
                    }
                }),
            );
        }

        // Drain before returning so the caller's grace window covers
        // in-flight handlers, not just the read loop.
        tracing::info!(topic = %self.topic, "kafka consumer draining in-flight handlers");
        lanes.shutdown().await;
    }
}
