//! The `AUTOMATION_*` environment variables.

use crate::env::{bool_var_or, opt_var, var_or};
use crate::validation::ConfigError;
use serde::{Deserialize, Serialize};

/// A single fan-in gate's poll/wait parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StageGateConfig {
    pub max_wait_ms: i64,
    pub poll_interval_seconds: u64,
}

impl StageGateConfig {
    pub fn max_polls(&self) -> u64 {
        let interval_ms = (self.poll_interval_seconds.max(1) * 1000) as i64;
        (self.max_wait_ms / interval_ms).max(1) as u64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationConfig {
    /// Default cron tick cadence for the Scheduler itself (runs on a cron
    /// tick, default every minute, configurable).
    pub scheduler_cron: String,
    /// Trailing window, in minutes, within which a cron fire time counts as
    /// due (minimum 5).
    pub scheduler_window_minutes: u32,
    /// Grace added on top of the sum of the three gates' `max_wait_ms` when
    /// computing the stale-Run threshold. See DESIGN.md for why the default
    /// yields 5h30m overall.
    pub scheduler_stale_grace_ms: i64,

    pub day_concurrency: u32,
    pub fiche_worker_concurrency: u32,
    pub day_batch_size: u32,
    pub fiche_batch_size: u32,
    pub send_event_chunk_size: u32,

    pub fiche_details_gate: StageGateConfig,
    pub transcription_gate: StageGateConfig,
    pub audit_gate: StageGateConfig,

    /// Hard ceiling 50.
    pub max_recordings_per_fiche: u32,

    pub debug_log_to_file: bool,

    /// CRM sales-list revalidation concurrency, batched in waves of 2
    /// concurrent calls by default.
    pub crm_revalidation_concurrency: u32,
    /// Workflow `finish` timeout, new architecture (default 5h).
    pub workflow_finish_timeout_ms: i64,

    /// Two API-mode architectures are possible without a single obvious
    /// default: (a) dispatch whole Day-Workers, or (b) fan out
    /// Fiche-Workers directly through the fan-in gates. We default to (a)
    /// — see DESIGN.md — and expose this flag only so an operator can fall
    /// back to the gate-based path while migrating.
    pub use_legacy_dispatch: bool,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        let fiche_details_gate = StageGateConfig {
            max_wait_ms: 10 * 60 * 1000,
            poll_interval_seconds: 20,
        };
        let transcription_gate = StageGateConfig {
            max_wait_ms: 20 * 60 * 1000,
            poll_interval_seconds: 30,
        };
        let audit_gate = StageGateConfig {
            max_wait_ms: 30 * 60 * 1000,
            poll_interval_seconds: 30,
        };
        Self {
            scheduler_cron: "* * * * *".to_string(),
            scheduler_window_minutes: 20,
            // fiche(10m) + transcription(20m) + audit(30m) + grace(270m) = 330m = 5h30m.
            scheduler_stale_grace_ms: 270 * 60 * 1000,
            day_concurrency: 3,
            fiche_worker_concurrency: 5,
            day_batch_size: 3,
            fiche_batch_size: 5,
            send_event_chunk_size: 200,
            fiche_details_gate,
            transcription_gate,
            audit_gate,
            max_recordings_per_fiche: 50,
            debug_log_to_file: false,
            crm_revalidation_concurrency: 2,
            workflow_finish_timeout_ms: 5 * 60 * 60 * 1000,
            use_legacy_dispatch: false,
        }
    }
}

impl OrchestrationConfig {
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            scheduler_cron: opt_var("AUTOMATION_SCHEDULER_CRON")
                .unwrap_or(default.scheduler_cron),
            scheduler_window_minutes: var_or(
                "AUTOMATION_SCHEDULER_WINDOW_MINUTES",
                default.scheduler_window_minutes,
            ),
            scheduler_stale_grace_ms: var_or(
                "AUTOMATION_SCHEDULER_STALE_GRACE_MS",
                default.scheduler_stale_grace_ms,
            ),
            day_concurrency: var_or("AUTOMATION_DAY_CONCURRENCY", default.day_concurrency),
            fiche_worker_concurrency: var_or(
                "AUTOMATION_FICHE_WORKER_CONCURRENCY",
                default.fiche_worker_concurrency,
            ),
            day_batch_size: var_or("AUTOMATION_DAY_BATCH_SIZE", default.day_batch_size),
            fiche_batch_size: var_or("AUTOMATION_FICHE_BATCH_SIZE", default.fiche_batch_size),
            send_event_chunk_size: var_or(
                "AUTOMATION_SEND_EVENT_CHUNK_SIZE",
                default.send_event_chunk_size,
            ),
            fiche_details_gate: StageGateConfig {
                max_wait_ms: var_or(
                    "AUTOMATION_FICHE_DETAILS_MAX_WAIT_MS",
                    default.fiche_details_gate.max_wait_ms,
                ),
                poll_interval_seconds: var_or(
                    "AUTOMATION_FICHE_DETAILS_POLL_INTERVAL_SECONDS",
                    default.fiche_details_gate.poll_interval_seconds,
                ),
            },
            transcription_gate: StageGateConfig {
                max_wait_ms: var_or(
                    "AUTOMATION_TRANSCRIPTION_MAX_WAIT_MS",
                    default.transcription_gate.max_wait_ms,
                ),
                poll_interval_seconds: var_or(
                    "AUTOMATION_TRANSCRIPTION_POLL_INTERVAL_SECONDS",
                    default.transcription_gate.poll_interval_seconds,
                ),
            },
            audit_gate: StageGateConfig {
                max_wait_ms: var_or(
                    "AUTOMATION_AUDIT_MAX_WAIT_MS",
                    default.audit_gate.max_wait_ms,
                ),
                poll_interval_seconds: var_or(
                    "AUTOMATION_AUDIT_POLL_INTERVAL_SECONDS",
                    default.audit_gate.poll_interval_seconds,
                ),
            },
            max_recordings_per_fiche: var_or(
                "AUTOMATION_MAX_RECORDINGS_PER_FICHE",
                default.max_recordings_per_fiche,
            )
            .min(50),
            debug_log_to_file: bool_var_or(
                "AUTOMATION_DEBUG_LOG_TO_FILE",
                default.debug_log_to_file,
            ),
            crm_revalidation_concurrency: default.crm_revalidation_concurrency,
            workflow_finish_timeout_ms: default.workflow_finish_timeout_ms,
            use_legacy_dispatch: bool_var_or(
                "AUTOMATION_USE_LEGACY_DISPATCH",
                default.use_legacy_dispatch,
            ),
        }
    }

    /// Stale threshold: sum of per-stage max waits plus grace.
    pub fn stale_threshold_ms(&self) -> i64 {
        self.fiche_details_gate.max_wait_ms
            + self.transcription_gate.max_wait_ms
            + self.audit_gate.max_wait_ms
            + self.scheduler_stale_grace_ms
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler_window_minutes < 5 {
            return Err(ConfigError::new(
                "AUTOMATION_SCHEDULER_WINDOW_MINUTES must be >= 5",
            ));
        }
        if self.max_recordings_per_fiche == 0 || self.max_recordings_per_fiche > 50 {
            return Err(ConfigError::new(
                "AUTOMATION_MAX_RECORDINGS_PER_FICHE must be in 1..=50",
            ));
        }
        if self.day_concurrency == 0 || self.fiche_worker_concurrency == 0 {
            return Err(ConfigError::new("worker concurrency must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_stale_threshold_is_five_hours_thirty_minutes() {
        let config = OrchestrationConfig::default();
        assert_eq!(config.stale_threshold_ms(), 5 * 60 * 60 * 1000 + 30 * 60 * 1000);
    }

    #[test]
    fn rejects_window_below_five_minutes() {
        let config = OrchestrationConfig {
            scheduler_window_minutes: 1,
            ..OrchestrationConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_recordings_ceiling_above_fifty() {
        let config = OrchestrationConfig {
            max_recordings_per_fiche: 200,
            ..OrchestrationConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn max_polls_rounds_down_to_at_least_one() {
        let gate = StageGateConfig {
            max_wait_ms: 5000,
            poll_interval_seconds: 20,
        };
        assert_eq!(gate.max_polls(), 1);
    }
}
