//! Postgres repositories
//!
//! Queries are built at runtime with `sqlx::query` so the crate compiles without a
//! live database.

mod audit;
mod counter;
mod fingerprint;
mod inventory;
mod quarantine;
mod session;
mod upload;

pub use audit::PgAuditRepository;
pub use counter::PgCounterRepository;
pub use fingerprint::PgFingerprintRepository;
pub use inventory::PgInventoryRepository;
pub use quarantine::PgQuarantineRepository;
pub use session::PgSessionRepository;
pub use upload::PgUploadRepository;

use std::time::Duration;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tally_core::BaseConfig;

/// Open a connection pool using the shared base configuration.
pub async fn connect(config: &BaseConfig) -> anyhow::Result<PgPool> {
    let url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL is not configured")?;

    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .acquire_timeout(Duration::from_secs(config.db_timeout_seconds))
        .connect(url)
        .await
        .context("Failed to connect to database")?;

    tracing::info!(max_connections = config.db_max_connections, "Database pool ready");
    Ok(pool)
}

/// Apply the SQL migrations shipped with the workspace.
pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("../../migrations")
        .run(pool)
        .await
        .context("Failed to run database migrations")?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use sqlx::PgPool;

    /// Pool against `TEST_DATABASE_URL` with migrations applied, or `None` when unset.
    pub async fn test_pool() -> Option<PgPool> {
        let url = std::env::var("TEST_DATABASE_URL").ok()?;
        let pool = PgPool::connect(&url).await.ok()?;
        super::run_migrations(&pool).await.ok()?;
        Some(pool)
    }
}
