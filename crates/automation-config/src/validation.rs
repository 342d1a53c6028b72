use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid configuration: {0}")]
pub struct ConfigError(String);

impl ConfigError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<ConfigError> for automation_contracts::AutomationError {
    fn from(value: ConfigError) -> Self {
        automation_contracts::AutomationError::Config(value.0)
    }
}
