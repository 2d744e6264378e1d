//! Database module
//!
//! - `schema`: versioned migrations
//! - `models`: rows, request shapes and owner views
//! - `repository`: queries, including the conditional updates sweeps and
//!   check-ins race on

pub mod models;
pub mod repository;
pub mod schema;

pub use models::*;
pub use repository::Repository;
pub use schema::initialize_database;

use crate::config::{DB_BUSY_TIMEOUT, DB_POOL_SIZE};
use crate::error::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;

fn sqlite_options(db_path: &Path) -> SqliteConnectOptions {
    SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(DB_BUSY_TIMEOUT)
        .foreign_keys(true)
}

/// Open the switch database, migrating it first.
///
/// Migrations get their own single connection, closed before the shared
/// pool opens, so no pooled connection holds a pre-migration schema.
pub async fn create_pool(db_path: &Path) -> Result<SqlitePool> {
    if let Some(dir) = db_path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    tracing::info!("Opening database {:?}", db_path);

    let migrator = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(sqlite_options(db_path))
        .await?;
    initialize_database(&migrator).await?;
    migrator.close().await;

    let pool = SqlitePoolOptions::new()
        .max_connections(DB_POOL_SIZE)
        .connect_with(sqlite_options(db_path))
        .await?;

    tracing::debug!("Database pool ready ({} connections)", DB_POOL_SIZE);
    Ok(pool)
}

/// Single-connection in-memory database for unit tests
#[cfg(test)]
pub(crate) async fn test_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    initialize_database(&pool).await.unwrap();
    pool
}
