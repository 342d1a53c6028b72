//! Database client: connection pooling and liveness.

use anyhow::{Context, Result};
use automation_config::DatabaseConfig;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone)]
pub struct DatabaseClient {
    pool: PgPool,
}

impl DatabaseClient {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        info!(host = %config.host, port = config.port, "connecting to database");

        let pool = PgPoolOptions::new()
            .min_connections(config.pool_min)
            .max_connections(config.pool_max)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_seconds)))
            .max_lifetime(Some(Duration::from_secs(config.max_lifetime_seconds)))
            .connect(&config.database_url())
            .await
            .context("failed to create database connection pool")?;

        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .context("failed to verify database connection")?;

        info!("database connection established");
        Ok(Self { pool })
    }

    /// Build a client around an existing pool, e.g. one shared with other
    /// services or one set up by a test harness against a throwaway
    /// database.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}
