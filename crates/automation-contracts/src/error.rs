//! Error taxonomy shared across every crate.
//!
//! `AutomationError` is the single enum every crate converts into at its
//! public boundary. `is_retriable` drives `automation-resilience::retry`;
//! `is_terminal_not_found` drives fiche-outcome attribution in the
//! orchestrator.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AutomationError {
    /// Non-retriable: missing/inactive schedule, missing required cron
    /// fields, invalid cron, invalid id formats. Fails the Run immediately.
    #[error("config error: {0}")]
    Config(String),

    /// Terminal-success: no dates or no fiches matched the selection.
    #[error("selection produced no work: {0}")]
    SelectionEmpty(String),

    /// CRM/transcription/LLM timeouts or 5xx. Retried per-stage with
    /// exponential backoff up to 3 attempts.
    #[error("transient external failure calling {service}: {message}")]
    TransientExternal { service: String, message: String },

    /// CRM returned the NOT_FOUND marker for a fiche.
    #[error("fiche not found (404)")]
    TerminalNotFound,

    /// A fan-in gate timed out or stalled 3 polls in a row with no progress.
    #[error("stage incomplete: {0}")]
    StageIncomplete(String),

    /// A `running` Run exceeded the stale threshold.
    #[error("run marked stale by scheduler after {minutes}m")]
    StaleRun { minutes: i64 },

    /// Infrastructure failure in the Repository Layer.
    #[error("repository error: {0}")]
    Repository(String),

    /// Infrastructure failure publishing/consuming events.
    #[error("event bus error: {0}")]
    EventBus(String),
}

impl AutomationError {
    /// Whether a local retry loop should attempt this operation again.
    /// Only `TransientExternal` failures are retried; everything else
    /// either terminates the fiche (`TerminalNotFound`), the stage
    /// (`StageIncomplete`), or the run (`Config`, `StaleRun`).
    pub fn is_retriable(&self) -> bool {
        matches!(self, AutomationError::TransientExternal { .. })
    }

    pub fn is_terminal_not_found(&self) -> bool {
        matches!(self, AutomationError::TerminalNotFound)
    }

    /// The fixed NOT_FOUND marker persisted verbatim on
    /// `FicheCache.detailsMessage`.
    pub const NOT_FOUND_MARKER: &'static str = "NOT_FOUND";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_external_is_retriable() {
        assert!(AutomationError::TransientExternal {
            service: "crm".into(),
            message: "timeout".into()
        }
        .is_retriable());
        assert!(!AutomationError::TerminalNotFound.is_retriable());
        assert!(!AutomationError::Config("bad".into()).is_retriable());
    }
}
