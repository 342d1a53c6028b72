//! Per-step execution policy: `concurrency(limit)`, `retries(n)`,
//! `timeouts.finish(duration)`.

use std::time::Duration;

/// Attached to a logical step name when constructing a [`crate::step::StepContext`]
/// child invocation. Concurrency is enforced by the caller (Day-Worker,
/// Fiche-Worker) via a `tokio::sync::Semaphore` sized from
/// `automation_config::OrchestrationConfig`; this struct just carries the
/// declared limits through to logging/telemetry.
#[derive(Debug, Clone, Copy)]
pub struct StepPolicy {
    pub concurrency_limit: Option<u32>,
    pub retries: u32,
    pub finish_timeout: Option<Duration>,
}

impl StepPolicy {
    pub fn new() -> Self {
        Self {
            concurrency_limit: None,
            retries: 0,
            finish_timeout: None,
        }
    }

    pub fn concurrency(mut self, limit: u32) -> Self {
        self.concurrency_limit = Some(limit);
        self
    }

    pub fn retries(mut self, n: u32) -> Self {
        self.retries = n;
        self
    }

    pub fn finish_timeout(mut self, duration: Duration) -> Self {
        self.finish_timeout = Some(duration);
        self
    }
}

impl Default for StepPolicy {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_fields() {
        let policy = StepPolicy::new().concurrency(5).retries(3);
        assert_eq!(policy.concurrency_limit, Some(5));
        assert_eq!(policy.retries, 3);
    }
}
