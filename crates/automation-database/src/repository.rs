//! The Repository Layer. One `Repository` per process, cloned
//! cheaply (it only wraps a `PgPool`) and shared across the Scheduler,
//! Run-Orchestrator, and every worker.

use crate::client::DatabaseClient;
use sqlx::PgPool;

#[derive(Debug, Clone)]
pub struct Repository {
    pub(crate) pool: PgPool,
}

impl Repository {
    pub fn new(client: &DatabaseClient) -> Self {
        Self {
            pool: client.pool().clone(),
        }
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid stored payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("not found: {0}")]
    NotFound(String),
}

impl From<RepositoryError> for automation_contracts::AutomationError {
    fn from(value: RepositoryError) -> Self {
        automation_contracts::AutomationError::Repository(value.to_string())
    }
}
