//! Recovery worker daemon
//!
//! ```text
//! ┌──────────┐    ┌────────────┐    ┌─────────────┐
//! │  Config  │───▶│  PgStore   │───▶│  Recovery   │──▶ cancel stuck
//! │  (YAML)  │    │ (accounts, │    │   Worker    │    transactions
//! └──────────┘    │  txns)     │    └─────────────┘
//!                 └────────────┘
//! ```
//!
//! Usage: `tpc_transfer [--env dev] [--once]`

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use tpc_transfer::config::AppConfig;
use tpc_transfer::logging::init_logging;
use tpc_transfer::transfer::{PgStore, RecoveryWorker, TransferCoordinator};

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

fn run_once() -> bool {
    std::env::args().any(|a| a == "--once")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let config = AppConfig::load(&env)?;
    let _guard = init_logging(&config);

    let database_url = config
        .postgres_url
        .clone()
        .context("postgres_url must be set to run the recovery worker")?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await
        .context("Failed to connect to PostgreSQL")?;
    info!("PostgreSQL connection pool established");

    let store = Arc::new(PgStore::new(pool));
    store.ensure_schema().await?;

    let coordinator = Arc::new(TransferCoordinator::with_config(
        store.clone(),
        store,
        config.coordinator.to_config(),
    ));
    let worker = RecoveryWorker::new(coordinator, config.recovery.to_worker_config());

    if run_once() {
        let report = worker.scan_and_recover().await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    info!(env = %env, "Recovery worker starting");
    worker.run().await
}
