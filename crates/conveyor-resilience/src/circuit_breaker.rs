//! Circuit breaker with a sliding sampling window.
//!
//! State transitions are compare-and-swap on a single atomic word, so
//! concurrent callers agree on exactly one winner for each transition; in
//! particular, the Open→HalfOpen probe is admitted to exactly one caller.

use chrono::{DateTime, Utc};
use conveyor_core::{Clock, Error, Result, SystemClock};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls are rejected until the break duration elapses.
    Open,
    /// One probe call is in flight; everyone else is rejected.
    HalfOpen,
    /// Opened by the admin API; only [`CircuitBreaker::close`] recovers.
    ManuallyOpen,
}

const CLOSED: u8 = 0;
const OPEN: u8 = 1;
const HALF_OPEN: u8 = 2;
const MANUALLY_OPEN: u8 = 3;

fn state_from_word(word: u8) -> CircuitState {
    match word {
        OPEN => CircuitState::Open,
        HALF_OPEN => CircuitState::HalfOpen,
        MANUALLY_OPEN => CircuitState::ManuallyOpen,
        _ => CircuitState::Closed,
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Window over which call outcomes are sampled.
    pub sampling_duration: Duration,
    /// Failure ratio (0.0..=1.0) that opens the circuit.
    pub failure_ratio: f64,
    /// Minimum calls inside the window before the ratio is evaluated.
    pub minimum_calls: u32,
    /// How long the circuit stays open before admitting a probe.
    pub break_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            sampling_duration: Duration::from_secs(60),
            failure_ratio: 0.5,
            minimum_calls: 10,
            break_duration: Duration::from_secs(30),
        }
    }
}

/// Circuit breaker. Shared across callers via `Arc`.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    state: AtomicU8,
    /// Timestamped call outcomes (true = failure) inside the sampling window.
    window: Mutex<VecDeque<(DateTime<Utc>, bool)>>,
    open_until: Mutex<Option<DateTime<Utc>>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            state: AtomicU8::new(CLOSED),
            window: Mutex::new(VecDeque::new()),
            open_until: Mutex::new(None),
        }
    }

    /// Current state, accounting for an elapsed break duration.
    pub fn state(&self) -> CircuitState {
        state_from_word(self.state.load(Ordering::Acquire))
    }

    /// Gate a call. `Ok(())` means the caller may proceed and must report the
    /// outcome through [`record_success`](Self::record_success) or
    /// [`record_failure`](Self::record_failure).
    pub fn check(&self) -> Result<()> {
        match self.state.load(Ordering::Acquire) {
            CLOSED => Ok(()),
            MANUALLY_OPEN => Err(Error::BrokenCircuit),
            HALF_OPEN => Err(Error::BrokenCircuit),
            _ => {
                let expired = {
                    let open_until = self.open_until.lock();
                    matches!(*open_until, Some(until) if self.clock.now() >= until)
                };
                if expired
                    && self
                        .state
                        .compare_exchange(OPEN, HALF_OPEN, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                {
                    tracing::debug!("circuit breaker admitting half-open probe");
                    return Ok(());
                }
                Err(Error::BrokenCircuit)
            }
        }
    }

    /// Report a successful call.
    pub fn record_success(&self) {
        match self.state.load(Ordering::Acquire) {
            HALF_OPEN => {
                if self
                    .state
                    .compare_exchange(HALF_OPEN, CLOSED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    tracing::info!("circuit breaker closed after successful probe");
                    self.window.lock().clear();
                    *self.open_until.lock() = None;
                }
            }
            CLOSED => {
                self.push_outcome(false);
            }
            _ => {}
        }
    }

    /// Report a failed call.
    pub fn record_failure(&self) {
        match self.state.load(Ordering::Acquire) {
            HALF_OPEN => {
                if self
                    .state
                    .compare_exchange(HALF_OPEN, OPEN, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    tracing::warn!("circuit breaker probe failed, reopening");
                    self.arm_break();
                }
            }
            CLOSED => {
                self.push_outcome(true);
                if self.should_open() {
                    if self
                        .state
                        .compare_exchange(CLOSED, OPEN, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        tracing::warn!(
                            failure_ratio = self.config.failure_ratio,
                            "circuit breaker opened"
                        );
                        self.arm_break();
                    }
                }
            }
            _ => {}
        }
    }

    /// Admin API: force the circuit open until [`close`](Self::close).
    pub fn open(&self) {
        self.state.store(MANUALLY_OPEN, Ordering::Release);
        tracing::warn!("circuit breaker manually opened");
    }

    /// Admin API: force the circuit closed and reset the sampling window.
    pub fn close(&self) {
        self.state.store(CLOSED, Ordering::Release);
        self.window.lock().clear();
        *self.open_until.lock() = None;
        tracing::info!("circuit breaker manually closed");
    }

    fn arm_break(&self) {
        let until = self.clock.now()
            + chrono::Duration::from_std(self.config.break_duration)
                .unwrap_or(chrono::Duration::zero());
        *self.open_until.lock() = Some(until);
    }

    fn push_outcome(&self, failed: bool) {
        let now = self.clock.now();
        let mut window = self.window.lock();
        window.push_back((now, failed));
        self.trim(&mut window, now);
    }

    fn trim(&self, window: &mut VecDeque<(DateTime<Utc>, bool)>, now: DateTime<Utc>) {
        let cutoff = now
            - chrono::Duration::from_std(self.config.sampling_duration)
                .unwrap_or(chrono::Duration::zero());
        while matches!(window.front(), Some((at, _)) if *at < cutoff) {
            window.pop_front();
        }
    }

    fn should_open(&self) -> bool {
        let now = self.clock.now();
        let mut window = self.window.lock();
        self.trim(&mut window, now);

        let calls = window.len() as u32;
        if calls < self.config.minimum_calls {
            return false;
        }
        let failures = window.iter().filter(|(_, failed)| *failed).count();
        failures as f64 / calls as f64 >= self.config.failure_ratio
    }
}
