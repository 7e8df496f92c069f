// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Hearth Orchestrator - game server provisioning
//!
//! Runs the background loops:
//! - Job worker pool (PROVISION and RECONCILE jobs)
//! - Job audit worker (archives completed jobs)
//! - Reconciliation scheduler (orphan sweeps)
//!
//! Provider clients are the in-memory mocks unless the orchestrator is
//! embedded through [`hearth_orchestrator::runtime::OrchestratorRuntime`].

use std::str::FromStr;
use std::sync::Arc;

use hearth_core::persistence::{Persistence, PostgresPersistence, SqlitePersistence};
use hearth_orchestrator::config::Config;
use hearth_orchestrator::providers::Providers;
use hearth_orchestrator::runtime::OrchestratorRuntime;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hearth_orchestrator=info,hearth_core=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        dns_zone = %config.steps.dns_zone,
        pool_size = config.worker.pool_size,
        "Starting Hearth Orchestrator"
    );

    let persistence = connect(&config.database_url).await?;
    if !persistence.health_check_db().await? {
        anyhow::bail!("database health check failed");
    }

    let (providers, _mocks) = Providers::mock();
    warn!("No provider clients configured, using in-memory providers");

    let runtime = OrchestratorRuntime::builder()
        .persistence(persistence)
        .providers(providers)
        .config(&config)
        .build()?
        .start()
        .await?;

    info!("Hearth Orchestrator ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("Hearth Orchestrator shut down");

    Ok(())
}

/// Connect to the database named by `url` and bring its schema up to date.
async fn connect(url: &str) -> anyhow::Result<Arc<dyn Persistence>> {
    if url.starts_with("postgres") {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        hearth_core::migrations::run_postgres(&pool).await?;
        info!("Connected to PostgreSQL, migrations applied");
        Ok(Arc::new(PostgresPersistence::new(pool)))
    } else {
        let options = sqlx::sqlite::SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        hearth_core::migrations::run_sqlite(&pool).await?;
        info!("Connected to SQLite, migrations applied");
        Ok(Arc::new(SqlitePersistence::new(pool)))
    }
}
