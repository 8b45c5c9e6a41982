use anyhow::Result;
use clap::Parser;
use crucible_common::{WorkerConfig, EXECUTION_GROUP, EXECUTION_TOPIC};
use crucible_messaging::factory;
use crucible_sandbox::docker::{ContainerBackend, DockerClient};
use crucible_sandbox::{PoolConfig, PoolManager, Runner};
use crucible_store::memory;
use crucible_store::{MongoApiLogStore, MongoCreditStore, MongoJobStore};
use crucible_worker::{JobHandler, SHUTDOWN_GRACE_SECS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "crucible-worker")]
#[command(about = "Crucible execution worker")]
#[command(version)]
struct Cli {
    /// Override WORKER_MAX_CONCURRENT
    #[arg(long)]
    max_concurrent: Option<usize>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Run against in-memory stores (no MongoDB); for local smoke tests
    #[arg(long)]
    dry_stores: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let mut cfg = WorkerConfig::from_env()?;
    if let Some(max) = cli.max_concurrent {
        cfg.max_concurrent = max;
    }
    tracing::info!(
        service = %cfg.service_name,
        env = %cfg.environment,
        backend = ?cfg.queue_backend,
        max_concurrent = cfg.max_concurrent,
        "starting worker"
    );

    // Stores.
    let (jobs, credits, api_logs): (
        Arc<dyn crucible_store::JobStore>,
        Arc<dyn crucible_store::CreditStore>,
        Arc<dyn crucible_store::ApiLogStore>,
    ) = if cli.dry_stores {
        tracing::warn!("running with in-memory stores; nothing will persist");
        (
            Arc::new(memory::InMemoryJobStore::new()),
            Arc::new(memory::InMemoryCreditStore::new()),
            Arc::new(memory::InMemoryApiLogStore::new()),
        )
    } else {
        let db = crucible_store::mongo::connect(&cfg).await?;
        (
            Arc::new(MongoJobStore::new(&db)),
            Arc::new(MongoCreditStore::new(&db)),
            Arc::new(MongoApiLogStore::new(&db)),
        )
    };

    // Sandbox pools, warmed before consuming anything.
    let docker: Arc<dyn ContainerBackend> = Arc::new(DockerClient::connect()?);
    let mut manager = PoolManager::new(Arc::clone(&docker), cfg.runner_dir.clone());
    for pool_cfg in PoolConfig::defaults() {
        manager.register(pool_cfg);
    }
    let manager = Arc::new(manager);
    manager.init_all().await?;
    tracing::info!("container pools warmed and ready");

    let runner = Arc::new(Runner::new(docker, cfg.runner_dir.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let handler = Arc::new(JobHandler {
        pools: manager.clone(),
        runner,
        jobs,
        credits,
        api_logs,
        shutdown: shutdown_rx.clone(),
    });

    let message_handler = crucible_messaging::handler({
        let handler = Arc::clone(&handler);
        move |payload| {
            let handler = Arc::clone(&handler);
            async move { handler.execute_code(payload).await }
        }
    });

    let consumer = factory::start_consumer(
        &cfg,
        EXECUTION_TOPIC,
        EXECUTION_GROUP,
        cfg.max_concurrent,
        shutdown_rx,
        message_handler,
    )
    .await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received; draining in-flight jobs");
    let _ = shutdown_tx.send(true);

    // In-flight handlers get the grace window; unfinished messages stay
    // unacked and redeliver on the next start.
    if tokio::time::timeout(Duration::from_secs(SHUTDOWN_GRACE_SECS), consumer)
        .await
        .is_err()
    {
        tracing::warn!("consumer did not stop within grace period");
    }

    manager.destroy_all().await;
    tracing::info!("worker stopped");
    Ok(())
}
