//! Retry with exponential backoff and jitter.
//!
//! Day-Worker's CRM sales-list fetch uses bounded retries (up to 3
//! attempts, exponential backoff 2s/4s) — that is exactly
//! [`RetryConfig::crm_default`]. A `TransientExternal` error is retried
//! per-stage with exponential backoff up to 3 attempts.

use automation_contracts::AutomationError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    /// CRM sales-list fetch: up to 3 attempts, exponential backoff 2s/4s.
    pub fn crm_default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 2000,
            max_delay_ms: 4000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let mut delay_ms =
            self.initial_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32 - 1);
        delay_ms = delay_ms.min(self.max_delay_ms as f64);
        if self.jitter_factor > 0.0 {
            let jitter_range = delay_ms * self.jitter_factor;
            let jitter = rand::thread_rng().gen_range(0.0..=jitter_range);
            delay_ms = (delay_ms - jitter).max(0.0);
        }
        Duration::from_millis(delay_ms as u64)
    }
}

/// Execute `operation`, retrying per `config` while the error is retriable
/// (`AutomationError::is_retriable`). Non-retriable errors return
/// immediately on the first attempt.
pub async fn retry<F, Fut, T>(
    operation_name: &str,
    config: RetryConfig,
    mut operation: F,
) -> Result<T, AutomationError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AutomationError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    info!(operation_name, attempt, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) => {
                if !error.is_retriable() || attempt >= config.max_attempts {
                    warn!(
                        operation_name,
                        attempt,
                        error = %error,
                        "giving up after retries exhausted or non-retriable error"
                    );
                    return Err(error);
                }
                let delay = config.delay_for_attempt(attempt);
                warn!(
                    operation_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "retrying after transient failure"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn retries_transient_errors_up_to_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let result: Result<(), AutomationError> = retry(
            "test",
            RetryConfig {
                max_attempts: 3,
                initial_delay_ms: 1,
                max_delay_ms: 1,
                backoff_multiplier: 1.0,
                jitter_factor: 0.0,
            },
            move || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(AutomationError::TransientExternal {
                        service: "crm".into(),
                        message: "timeout".into(),
                    })
                }
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_non_retriable_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let result: Result<(), AutomationError> = retry(
            "test",
            RetryConfig::default(),
            move || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(AutomationError::TerminalNotFound)
                }
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn succeeds_without_retry_when_first_attempt_works() {
        let result = retry("test", RetryConfig::default(), || async { Ok::<_, AutomationError>(42) })
            .await
            .unwrap();
        assert_eq!(result, 42);
    }
}
