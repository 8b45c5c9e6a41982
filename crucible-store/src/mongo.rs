//! MongoDB connection bootstrap.

use crate::Result;
use crucible_common::WorkerConfig;
use mongodb::{Client, Database};

/// Connect and select the configured database. Called once from the
/// worker entry point; the [`Database`] handle is cheap to clone.
pub async fn connect(cfg: &WorkerConfig) -> Result<Database> {
    let client = Client::with_uri_str(&cfg.mongo_uri).await?;
    let db = client.database(&cfg.mongo_db_name);

    // Fail fast on bad credentials or an unreachable server instead of at
    // the first job.
    db.run_command(mongodb::bson::doc! { "ping": 1 }).await?;

    tracing::info!(db = %cfg.mongo_db_name, "mongodb connected");
    Ok(db)
}
