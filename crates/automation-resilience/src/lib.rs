//! Resilience helpers shared by every external call the orchestrator makes:
//! retry with backoff, circuit breakers, and sanitized structured logging.

pub mod circuit_breaker;
pub mod retry;
pub mod structured_logging;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitCallError, CircuitState};
pub use retry::{retry, RetryConfig};
pub use structured_logging::{log_run_event, sanitize_metadata};
