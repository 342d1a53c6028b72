//! Circuit breaker protecting the three external collaborators (CRM,
//! transcription engine, LLM audit engine) from cascading retry storms when
//! one of them is down.
//!
//! States: CLOSED (normal) -> OPEN (reject fast) -> HALF_OPEN (probe) ->
//! CLOSED | OPEN.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u64,
    pub success_threshold: u64,
    pub reset_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub failure_count: u64,
    pub success_count: u64,
    pub total_requests: u64,
}

#[derive(Debug, thiserror::Error)]
#[error("circuit breaker '{name}' is open")]
pub struct CircuitOpenError {
    pub name: String,
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: AtomicU8,
    failure_count: AtomicU64,
    success_count: AtomicU64,
    total_requests: AtomicU64,
    next_attempt: Arc<RwLock<Instant>>,
}

const CLOSED: u8 = 0;
const OPEN: u8 = 1;
const HALF_OPEN: u8 = 2;

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: AtomicU8::new(CLOSED),
            failure_count: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            total_requests: AtomicU64::new(0),
            next_attempt: Arc::new(RwLock::new(Instant::now())),
        }
    }

    pub fn state(&self) -> CircuitState {
        match self.state.load(Ordering::Relaxed) {
            OPEN => CircuitState::Open,
            HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        CircuitBreakerStats {
            state: self.state(),
            failure_count: self.failure_count.load(Ordering::Relaxed),
            success_count: self.success_count.load(Ordering::Relaxed),
            total_requests: self.total_requests.load(Ordering::Relaxed),
        }
    }

    /// Execute `operation` if the circuit allows it, otherwise return
    /// [`CircuitOpenError`] without invoking `operation` at all — this is
    /// the "fail fast" behavior that stops many concurrent Day-Workers from
    /// each independently exhausting their own retries against a down CRM.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitCallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        if self.state.load(Ordering::Relaxed) == OPEN {
            let next_attempt = *self.next_attempt.read().await;
            if Instant::now() < next_attempt {
                return Err(CircuitCallError::Open(CircuitOpenError {
                    name: self.name.clone(),
                }));
            }
            self.state.store(HALF_OPEN, Ordering::Relaxed);
            self.success_count.store(0, Ordering::Relaxed);
            info!(circuit = %self.name, "transitioning to half-open to probe recovery");
        }

        match operation().await {
            Ok(value) => {
                self.on_success().await;
                Ok(value)
            }
            Err(error) => {
                self.on_failure().await;
                Err(CircuitCallError::Operation(error))
            }
        }
    }

    async fn on_success(&self) {
        match self.state.load(Ordering::Relaxed) {
            HALF_OPEN => {
                let successes = self.success_count.fetch_add(1, Ordering::Relaxed) + 1;
                if successes >= self.config.success_threshold {
                    self.state.store(CLOSED, Ordering::Relaxed);
                    self.failure_count.store(0, Ordering::Relaxed);
                    info!(circuit = %self.name, "closing circuit after successful probes");
                }
            }
            _ => {
                self.failure_count.store(0, Ordering::Relaxed);
            }
        }
    }

    async fn on_failure(&self) {
        if self.state.load(Ordering::Relaxed) == HALF_OPEN {
            self.open().await;
            return;
        }
        let failures = self.failure_count.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= self.config.failure_threshold {
            self.open().await;
        }
    }

    async fn open(&self) {
        self.state.store(OPEN, Ordering::Relaxed);
        let mut next_attempt = self.next_attempt.write().await;
        *next_attempt = Instant::now() + Duration::from_millis(self.config.reset_timeout_ms);
        warn!(circuit = %self.name, "circuit opened");
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CircuitCallError<E: std::fmt::Debug + std::fmt::Display> {
    #[error(transparent)]
    Open(#[from] CircuitOpenError),
    #[error("{0}")]
    Operation(E),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_after_failure_threshold_and_rejects_fast() {
        let breaker = CircuitBreaker::new(
            "crm",
            CircuitBreakerConfig {
                failure_threshold: 2,
                success_threshold: 1,
                reset_timeout_ms: 60_000,
            },
        );

        for _ in 0..2 {
            let _: Result<(), _> = breaker.call(|| async { Err::<(), _>("boom") }).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let result = breaker.call(|| async { Ok::<_, &str>(1) }).await;
        assert!(matches!(result, Err(CircuitCallError::Open(_))));
    }

    #[tokio::test]
    async fn closes_again_after_successful_half_open_probes() {
        let breaker = CircuitBreaker::new(
            "crm",
            CircuitBreakerConfig {
                failure_threshold: 1,
                success_threshold: 1,
                reset_timeout_ms: 0,
            },
        );
        let _: Result<(), _> = breaker.call(|| async { Err::<(), _>("boom") }).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        let result = breaker.call(|| async { Ok::<_, &str>(1) }).await;
        assert!(result.is_ok());
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}
