//! Database schema and migrations
//!
//! Migrations are numbered SQL files compiled into the binary. Each runs in
//! its own transaction together with the row recording it, so a failed
//! migration leaves the version untouched.

use crate::error::Result;
use sqlx::sqlite::SqlitePool;

const MIGRATIONS: &[(i64, &str)] = &[
    (1, include_str!("migrations/001_initial_schema.sql")),
    (2, include_str!("migrations/002_webhook_deliveries.sql")),
];

/// Bring the schema up to the latest migration
pub async fn initialize_database(pool: &SqlitePool) -> Result<()> {
    sqlx::query("PRAGMA foreign_keys = ON").execute(pool).await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS migrations (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    let applied: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM migrations")
        .fetch_one(pool)
        .await?;

    let pending: Vec<_> = MIGRATIONS.iter().filter(|(v, _)| *v > applied).collect();
    if pending.is_empty() {
        tracing::debug!("Schema up to date at version {}", applied);
        return Ok(());
    }

    for (version, sql) in pending {
        let mut tx = pool.begin().await?;
        for statement in sql.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        sqlx::query("INSERT INTO migrations (version) VALUES (?)")
            .bind(version)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::info!("Applied schema migration {}", version);
    }

    Ok(())
}
