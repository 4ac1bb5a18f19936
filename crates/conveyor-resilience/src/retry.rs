//! Retry policy with backoff.
//!
//! Wraps an async operation in bounded retries with a configurable delay
//! schedule, an optional overall deadline, and an optional circuit breaker.

use crate::circuit_breaker::CircuitBreaker;
use conveyor_core::{Error, ErrorKind, Result};
use rand::Rng;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Delay schedule between attempts. `attempt` is 1-based.
#[derive(Clone)]
enum DelaySchedule {
    Fixed(Duration),
    /// `base × 2^(attempt−1)`
    Exponential { base: Duration },
    Custom(Arc<dyn Fn(u32) -> Duration + Send + Sync>),
}

type RetryPredicate = Arc<dyn Fn(u32, &Error) -> bool + Send + Sync>;

/// Retry policy for async operations.
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    delay: DelaySchedule,
    max_delay: Option<Duration>,
    jitter: bool,
    timeout: Option<Duration>,
    unhandled: HashSet<ErrorKind>,
    should_retry: Option<RetryPredicate>,
    circuit_breaker: Option<Arc<CircuitBreaker>>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicyBuilder::new().build()
    }
}

impl RetryPolicy {
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::new()
    }

    /// Fixed-delay policy, the common inline configuration.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        RetryPolicyBuilder::new()
            .max_attempts(max_attempts)
            .fixed_delay(delay)
            .build()
    }

    /// Delay before the retry following `attempt` (1-based), after cap and
    /// jitter are applied.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let raw = match &self.delay {
            DelaySchedule::Fixed(delay) => *delay,
            DelaySchedule::Exponential { base } => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1).min(31));
                base.saturating_mul(factor)
            }
            DelaySchedule::Custom(get_delay) => get_delay(attempt),
        };

        let capped = match self.max_delay {
            Some(max) => raw.min(max),
            None => raw,
        };

        if self.jitter && !capped.is_zero() {
            // ±25%
            let factor = rand::thread_rng().gen_range(0.75..=1.25);
            capped.mul_f64(factor)
        } else {
            capped
        }
    }

    /// Drive `operation` through the policy. The operation is retried until
    /// it succeeds, the attempt budget is spent, an unhandled error kind
    /// surfaces, or the overall deadline elapses.
    pub async fn run<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match self.timeout {
            Some(deadline) => match tokio::time::timeout(deadline, self.run_attempts(operation)).await
            {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout { elapsed: deadline }),
            },
            None => self.run_attempts(operation).await,
        }
    }

    async fn run_attempts<F, Fut, T>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1u32;

        loop {
            if let Some(breaker) = &self.circuit_breaker {
                breaker.check()?;
            }

            match operation().await {
                Ok(value) => {
                    if let Some(breaker) = &self.circuit_breaker {
                        breaker.record_success();
                    }
                    return Ok(value);
                }
                Err(err) => {
                    if let Some(breaker) = &self.circuit_breaker {
                        breaker.record_failure();
                    }

                    // A broken circuit is never retried, regardless of the
                    // configured predicate.
                    let retryable = !matches!(err.kind(), ErrorKind::BrokenCircuit)
                        && attempt < self.max_attempts
                        && !self.unhandled.contains(&err.kind())
                        && self
                            .should_retry
                            .as_ref()
                            .map(|predicate| predicate(attempt, &err))
                            .unwrap_or(true);

                    if !retryable {
                        return Err(err);
                    }

                    let delay = self.delay_for(attempt);
                    tracing::warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "operation failed, retrying"
                    );

                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
            }
        }
    }
}

/// Builder for [`RetryPolicy`].
pub struct RetryPolicyBuilder {
    max_attempts: u32,
    delay: DelaySchedule,
    max_delay: Option<Duration>,
    jitter: bool,
    timeout: Option<Duration>,
    unhandled: HashSet<ErrorKind>,
    should_retry: Option<RetryPredicate>,
    circuit_breaker: Option<Arc<CircuitBreaker>>,
}

impl RetryPolicyBuilder {
    pub fn new() -> Self {
        Self {
            max_attempts: 3,
            delay: DelaySchedule::Exponential {
                base: Duration::from_secs(1),
            },
            max_delay: None,
            jitter: false,
            timeout: None,
            unhandled: HashSet::new(),
            should_retry: None,
            circuit_breaker: None,
        }
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn fixed_delay(mut self, delay: Duration) -> Self {
        self.delay = DelaySchedule::Fixed(delay);
        self
    }

    pub fn exponential_backoff(mut self, base: Duration) -> Self {
        self.delay = DelaySchedule::Exponential { base };
        self
    }

    /// Custom delay schedule; receives the 1-based attempt number.
    pub fn delay_fn(mut self, get_delay: impl Fn(u32) -> Duration + Send + Sync + 'static) -> Self {
        self.delay = DelaySchedule::Custom(Arc::new(get_delay));
        self
    }

    pub fn max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    pub fn jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    /// Overall deadline across all attempts and delays.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Error kinds that bypass retries and surface immediately.
    pub fn unhandled(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.unhandled.extend(kinds);
        self
    }

    pub fn should_retry(
        mut self,
        predicate: impl Fn(u32, &Error) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.should_retry = Some(Arc::new(predicate));
        self
    }

    pub fn circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.circuit_breaker = Some(breaker);
        self
    }

    pub fn build(self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            delay: self.delay,
            max_delay: self.max_delay,
            jitter: self.jitter,
            timeout: self.timeout,
            unhandled: self.unhandled,
            should_retry: self.should_retry,
            circuit_breaker: self.circuit_breaker,
        }
    }
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}
