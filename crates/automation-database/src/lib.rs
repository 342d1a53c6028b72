//! The Repository Layer: a thin, typed facade over Postgres that every
//! other service-level crate depends on instead of touching `sqlx`
//! directly.

pub mod audit_config;
pub mod audits;
pub mod checkpoint;
pub mod client;
pub mod fiches;
pub mod migrations;
pub mod models;
pub mod repository;
pub mod runs;
pub mod schedules;

pub use client::DatabaseClient;
pub use migrations::MigrationManager;
pub use repository::{Repository, RepositoryError};
