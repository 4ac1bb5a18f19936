//! Clock abstraction for injectable time.
//!
//! The engine records every timestamp through an injected [`Clock`] so tests
//! can drive time deterministically. All instants are UTC.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// A source of "now" and cancellable delays.
#[async_trait]
pub trait Clock: Send + Sync {
    /// The current instant in UTC.
    fn now(&self) -> DateTime<Utc>;

    /// Completes after `duration` elapses or `cancel` trips, whichever comes
    /// first. Never returns an error; callers that care about cancellation
    /// check the token themselves.
    async fn delay(&self, duration: Duration, cancel: &CancellationToken);
}

/// Production clock backed by the system time and the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn delay(&self, duration: Duration, cancel: &CancellationToken) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = cancel.cancelled() => {}
        }
    }
}

/// Controllable clock for tests. "Now" only moves when [`TestClock::advance`]
/// or [`TestClock::set`] is called; pending delays resolve as soon as the
/// clock passes their deadline.
#[derive(Clone)]
pub struct TestClock {
    now: Arc<Mutex<DateTime<Utc>>>,
    wake: Arc<Notify>,
}

impl TestClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
            wake: Arc::new(Notify::new()),
        }
    }

    /// Move the clock forward, waking any delay whose deadline has passed.
    pub fn advance(&self, duration: Duration) {
        {
            let mut now = self.now.lock();
            *now = *now + chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::zero());
        }
        self.wake.notify_waiters();
    }

    /// Jump the clock to an absolute instant.
    pub fn set(&self, instant: DateTime<Utc>) {
        *self.now.lock() = instant;
        self.wake.notify_waiters();
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

#[async_trait]
impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }

    async fn delay(&self, duration: Duration, cancel: &CancellationToken) {
        let deadline =
            *self.now.lock() + chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::zero());
        loop {
            // Register interest before re-checking, so an advance between the
            // check and the await cannot be missed.
            let woken = self.wake.notified();
            if *self.now.lock() >= deadline {
                return;
            }
            tokio::select! {
                _ = woken => {}
                _ = cancel.cancelled() => return,
            }
        }
    }
}
