// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database migrations for hearth-core.
//!
//! Hosts embedding the orchestrator call these to set up the schema before
//! constructing a persistence backend.
//!
//! # Example
//!
//! ```ignore
//! use sqlx::PgPool;
//! use hearth_core::migrations;
//!
//! let pool = PgPool::connect(&database_url).await?;
//! migrations::run_postgres(&pool).await?;
//! ```

use sqlx::migrate::MigrateError;

/// PostgreSQL migrator with all schema migrations embedded.
pub static POSTGRES: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/postgresql");

/// SQLite migrator with all schema migrations embedded.
pub static SQLITE: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// Run PostgreSQL migrations. Already-applied migrations are skipped.
pub async fn run_postgres(pool: &sqlx::PgPool) -> Result<(), MigrateError> {
    POSTGRES.run(pool).await
}

/// Run SQLite migrations. Already-applied migrations are skipped.
pub async fn run_sqlite(pool: &sqlx::SqlitePool) -> Result<(), MigrateError> {
    SQLITE.run(pool).await
}
