//! # Conveyor Resilience
//!
//! Retry with backoff and circuit breaking for async operations. The queue
//! engine wraps its auto-complete and auto-abandon calls in these policies;
//! they are equally usable around any fallible async action.

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use retry::{RetryPolicy, RetryPolicyBuilder};
