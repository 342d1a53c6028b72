//! `Run` and `RunLog` entities.

use crate::ids::{RunId, ScheduleId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Partial,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// One fiche's terminal outcome, recorded with its reason so the Run's
/// `resultSummary` can report why each fiche landed where it did, keeping
/// one error message per fiche.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FicheOutcome {
    pub fiche_id: String,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultSummary {
    pub successful: Vec<FicheOutcome>,
    pub failed: Vec<FicheOutcome>,
    pub ignored: Vec<FicheOutcome>,
}

impl ResultSummary {
    /// Outcome accounting: dedup by `ficheId`, first error wins.
    /// Recording a fiche into one bucket removes it from the others, so a
    /// later-arriving authoritative verdict (e.g. a stall marks it failed
    /// after an earlier stage had tentatively called it successful) doesn't
    /// leave the fiche double-counted.
    pub fn record_successful(&mut self, fiche_id: impl Into<String>) {
        let fiche_id = fiche_id.into();
        self.remove(&fiche_id);
        self.successful.push(FicheOutcome {
            fiche_id,
            reason: None,
        });
    }

    pub fn record_failed(&mut self, fiche_id: impl Into<String>, reason: impl Into<String>) {
        let fiche_id = fiche_id.into();
        if self.failed.iter().any(|o| o.fiche_id == fiche_id) {
            return;
        }
        self.remove(&fiche_id);
        self.failed.push(FicheOutcome {
            fiche_id,
            reason: Some(reason.into()),
        });
    }

    pub fn record_ignored(&mut self, fiche_id: impl Into<String>, reason: impl Into<String>) {
        let fiche_id = fiche_id.into();
        if self.ignored.iter().any(|o| o.fiche_id == fiche_id) {
            return;
        }
        self.remove(&fiche_id);
        self.ignored.push(FicheOutcome {
            fiche_id,
            reason: Some(reason.into()),
        });
    }

    fn remove(&mut self, fiche_id: &str) {
        self.successful.retain(|o| o.fiche_id != fiche_id);
        self.ignored.retain(|o| o.fiche_id != fiche_id);
    }

    pub fn total(&self) -> usize {
        self.successful.len() + self.failed.len() + self.ignored.len()
    }

    /// Resolves the Run's terminal status from outcome counts and the
    /// schedule's `failurePolicy.continueOnError`.
    ///
    /// `completed` requires zero failures *and* zero ignored fiches — a run
    /// where every fiche landed as `ignored` (e.g. all NOT_FOUND) still
    /// reports `partial`, not `completed`, so it surfaces for review even
    /// though nothing technically errored. `failed` covers both "nothing
    /// succeeded" and, when `continue_on_error` is false, "anything failed
    /// at all": the failure policy's "otherwise the whole Run fails"
    /// contract overrides what would otherwise be a `partial` outcome.
    /// Everything else is `partial`.
    pub fn derive_status(&self, continue_on_error: bool) -> RunStatus {
        if self.total() == 0 {
            return RunStatus::Completed;
        }
        if self.successful.is_empty() {
            return RunStatus::Failed;
        }
        if !self.failed.is_empty() && !continue_on_error {
            return RunStatus::Failed;
        }
        if self.failed.is_empty() && self.ignored.is_empty() {
            RunStatus::Completed
        } else {
            RunStatus::Partial
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub schedule_id: ScheduleId,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub total_fiches: i32,
    pub successful_fiches: i32,
    pub failed_fiches: i32,
    pub ignored_fiches: i32,
    pub transcriptions_run: i32,
    pub audits_run: i32,
    pub error_message: Option<String>,
    pub result_summary: ResultSummary,
    pub payload_snapshot: serde_json::Value,
}

impl Run {
    /// Invariant: `successful + failed + ignored <= total`.
    pub fn counts_are_consistent(&self) -> bool {
        self.successful_fiches + self.failed_fiches + self.ignored_fiches <= self.total_fiches
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLog {
    pub run_id: RunId,
    pub level: LogLevel,
    pub message: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_status_completed_when_empty() {
        assert_eq!(ResultSummary::default().derive_status(true), RunStatus::Completed);
    }

    #[test]
    fn derive_status_partial_with_mixed_outcomes() {
        let mut s = ResultSummary::default();
        s.record_successful("A");
        s.record_failed("B", "boom");
        assert_eq!(s.derive_status(true), RunStatus::Partial);
    }

    #[test]
    fn derive_status_failed_when_nothing_succeeded() {
        let mut s = ResultSummary::default();
        s.record_failed("A", "boom");
        s.record_ignored("B", "not found");
        assert_eq!(s.derive_status(true), RunStatus::Failed);
    }

    /// Spec scenario: 1 success, 0 failed, 1 ignored (e.g. NOT_FOUND)
    /// resolves to `partial`, not `completed`, regardless of continueOnError.
    #[test]
    fn derive_status_partial_when_ignored_without_any_failure() {
        let mut s = ResultSummary::default();
        s.record_successful("A");
        s.record_ignored("B", "not found");
        assert_eq!(s.derive_status(true), RunStatus::Partial);
        assert_eq!(s.derive_status(false), RunStatus::Partial);
    }

    #[test]
    fn derive_status_forces_failed_when_continue_on_error_is_false() {
        let mut s = ResultSummary::default();
        s.record_successful("A");
        s.record_failed("B", "boom");
        assert_eq!(s.derive_status(false), RunStatus::Failed);
    }

    #[test]
    fn recording_dedupes_by_fiche_id_first_error_wins() {
        let mut s = ResultSummary::default();
        s.record_failed("A", "first error");
        s.record_failed("A", "second error");
        assert_eq!(s.failed.len(), 1);
        assert_eq!(s.failed[0].reason.as_deref(), Some("first error"));
    }

    #[test]
    fn a_later_authoritative_outcome_moves_the_fiche_between_buckets() {
        let mut s = ResultSummary::default();
        s.record_successful("A");
        s.record_failed("A", "stalled later");
        assert!(s.successful.is_empty());
        assert_eq!(s.failed.len(), 1);
    }
}
