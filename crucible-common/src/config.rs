//! Environment-driven worker configuration.
//!
//! The worker reads everything it needs from the process environment once,
//! at startup, and passes the resulting [`WorkerConfig`] by reference. No
//! module re-reads env vars later.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(&'static str),

    #[error("invalid value for {var}: {value}")]
    InvalidVar { var: &'static str, value: String },
}

/// Which pub/sub backend carries the execution topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    Kafka,
    Redis,
}

impl QueueBackend {
    fn parse(value: &str) -> Result<Self, ConfigError> {
        match value {
            "kafka" => Ok(QueueBackend::Kafka),
            // Redis is the default backend when unset.
            "redis" | "" => Ok(QueueBackend::Redis),
            other => Err(ConfigError::InvalidVar {
                var: "QUEUE_SERVICE",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub mongo_uri: String,
    pub mongo_db_name: String,
    pub queue_backend: QueueBackend,
    pub kafka_broker: String,
    pub redis_addr: String,
    pub redis_password: Option<String>,
    pub log_queue_name: String,
    pub service_name: String,
    pub environment: String,
    /// Host directory bind-mounted into every sandbox container as `/sandbox`.
    pub runner_dir: String,
    /// Upper bound on concurrently handled jobs.
    pub max_concurrent: usize,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let get = |var: &'static str| std::env::var(var).unwrap_or_default();

        let mongo_uri = std::env::var("MONGO_URI").map_err(|_| ConfigError::MissingVar("MONGO_URI"))?;
        let mongo_db_name =
            std::env::var("MONGO_DB_NAME").map_err(|_| ConfigError::MissingVar("MONGO_DB_NAME"))?;

        let queue_backend = QueueBackend::parse(&get("QUEUE_SERVICE"))?;

        let max_concurrent = match get("WORKER_MAX_CONCURRENT").as_str() {
            "" => default_max_concurrent(),
            raw => raw.parse().map_err(|_| ConfigError::InvalidVar {
                var: "WORKER_MAX_CONCURRENT",
                value: raw.to_string(),
            })?,
        };

        Ok(Self {
            mongo_uri,
            mongo_db_name,
            queue_backend,
            kafka_broker: or_default(get("KAFKA_BROKER"), "localhost:9092"),
            redis_addr: or_default(get("REDIS_ADDR"), "redis://127.0.0.1:6379"),
            redis_password: std::env::var("REDIS_PASSWORD").ok().filter(|p| !p.is_empty()),
            log_queue_name: or_default(get("LOG_QUEUE_NAME"), "service-logs"),
            service_name: or_default(get("SERVICE_NAME"), "crucible-worker"),
            environment: or_default(get("ENV"), "dev"),
            runner_dir: or_default(get("RUNNER_DIR"), "/tmp/runner"),
            max_concurrent,
        })
    }

    pub fn is_production(&self) -> bool {
        self.environment == "prod"
    }
}

fn or_default(value: String, default: &str) -> String {
    if value.is_empty() {
        default.to_string()
    } else {
        value
    }
}

fn default_max_concurrent() -> usize {
    8
}
