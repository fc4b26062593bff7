//! Database connection management

use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::config::PoolConfig;

/// Ledger schema, applied idempotently by [`Database::apply_schema`]
pub const LEDGER_SCHEMA: &str = include_str!("../../migrations/0001_ledger.sql");

/// PostgreSQL database connection pool
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool
    pub async fn connect(database_url: &str, config: &PoolConfig) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout())
            .connect(database_url)
            .await?;

        tracing::info!(
            max_connections = config.max_connections,
            "PostgreSQL connection pool established"
        );
        Ok(Self { pool })
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health
    pub async fn health_check(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Create ledger tables and indexes if they do not exist yet
    pub async fn apply_schema(&self) -> Result<(), sqlx::Error> {
        sqlx::raw_sql(LEDGER_SCHEMA).execute(&self.pool).await?;
        tracing::info!("Ledger schema applied");
        Ok(())
    }
}
