//! Environment-driven configuration for the automation orchestrator.
//!
//! Loading layers: typed defaults -> environment variables, one for every
//! `AUTOMATION_*` variable. No secrets-manager layer: this service
//! holds no secrets of its own (CRM/transcription/audit credentials belong
//! to those collaborators' clients, injected by the caller).

mod database;
mod env;
mod orchestration;
mod validation;

pub use database::DatabaseConfig;
pub use orchestration::{OrchestrationConfig, StageGateConfig};
pub use validation::ConfigError;

use serde::{Deserialize, Serialize};

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub orchestration: OrchestrationConfig,
}

impl AppConfig {
    /// Load configuration from environment variables, falling back to
    /// documented defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self {
            database: DatabaseConfig::from_env(),
            orchestration: OrchestrationConfig::from_env(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.database.validate()?;
        self.orchestration.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        let config = AppConfig {
            database: DatabaseConfig::default(),
            orchestration: OrchestrationConfig::default(),
        };
        assert!(config.validate().is_ok());
    }
}
