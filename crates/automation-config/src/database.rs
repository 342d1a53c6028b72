//! Postgres connection configuration: pool bounds, timeouts, and a
//! `database_url()` builder.

use crate::env::{var_or, var_or_string};
use crate::validation::ConfigError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    pub pool_min: u32,
    pub pool_max: u32,
    pub connect_timeout_seconds: u64,
    pub idle_timeout_seconds: u64,
    pub max_lifetime_seconds: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: "automation".to_string(),
            username: "postgres".to_string(),
            password: String::new(),
            pool_min: 2,
            pool_max: 20,
            connect_timeout_seconds: 30,
            idle_timeout_seconds: 600,
            max_lifetime_seconds: 3600,
        }
    }
}

impl DatabaseConfig {
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            host: var_or_string("AUTOMATION_DATABASE_HOST", &default.host),
            port: var_or("AUTOMATION_DATABASE_PORT", default.port),
            database: var_or_string("AUTOMATION_DATABASE_NAME", &default.database),
            username: var_or_string("AUTOMATION_DATABASE_USER", &default.username),
            password: var_or_string("AUTOMATION_DATABASE_PASSWORD", &default.password),
            pool_min: var_or("AUTOMATION_DATABASE_POOL_MIN", default.pool_min),
            pool_max: var_or("AUTOMATION_DATABASE_POOL_MAX", default.pool_max),
            connect_timeout_seconds: var_or(
                "AUTOMATION_DATABASE_CONNECT_TIMEOUT_SECONDS",
                default.connect_timeout_seconds,
            ),
            idle_timeout_seconds: var_or(
                "AUTOMATION_DATABASE_IDLE_TIMEOUT_SECONDS",
                default.idle_timeout_seconds,
            ),
            max_lifetime_seconds: var_or(
                "AUTOMATION_DATABASE_MAX_LIFETIME_SECONDS",
                default.max_lifetime_seconds,
            ),
        }
    }

    pub fn database_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.username, self.password, self.host, self.port, self.database
        )
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::new("database host cannot be empty"));
        }
        if self.pool_min == 0 {
            return Err(ConfigError::new("database pool_min must be at least 1"));
        }
        if self.pool_min > self.pool_max {
            return Err(ConfigError::new(
                "database pool_min cannot exceed pool_max",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_url_has_expected_shape() {
        let config = DatabaseConfig {
            username: "u".into(),
            password: "p".into(),
            host: "h".into(),
            port: 1234,
            database: "d".into(),
            ..DatabaseConfig::default()
        };
        assert_eq!(config.database_url(), "postgres://u:p@h:1234/d");
    }

    #[test]
    fn rejects_pool_min_greater_than_max() {
        let config = DatabaseConfig {
            pool_min: 10,
            pool_max: 5,
            ..DatabaseConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
