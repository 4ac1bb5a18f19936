//! Scheduled timer that runs an async callback at a requested instant.
//!
//! A single task owns the callback, so invocations never overlap; the
//! callback's return value requests the next fire. `schedule_next` keeps the
//! earliest pending instant and ignores later or duplicate requests.

use chrono::{DateTime, Utc};
use conveyor_core::{Clock, Result};
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Scheduled instants within this tolerance of "now" still fire.
const FIRE_TOLERANCE: Duration = Duration::from_millis(15);

/// Minimum spacing between consecutive callback runs.
const MIN_INTERVAL: Duration = Duration::from_millis(100);

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::max_value())
}

type TimerCallback =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Result<Option<DateTime<Utc>>>> + Send>> + Send + Sync>;

struct TimerShared {
    clock: Arc<dyn Clock>,
    next: Mutex<Option<DateTime<Utc>>>,
    wake: Notify,
}

impl TimerShared {
    /// Adopt `at` as the next fire unless an earlier fire is already pending.
    /// Instants in the past coalesce to "fire soon"; the max-value sentinel
    /// means "no next fire".
    fn merge_next(&self, at: DateTime<Utc>) {
        if at == DateTime::<Utc>::MAX_UTC {
            return;
        }
        let target = at.max(self.clock.now());
        let mut next = self.next.lock();
        match *next {
            Some(pending) if pending <= target => {}
            _ => {
                *next = Some(target);
                self.wake.notify_one();
            }
        }
    }
}

/// Reschedulable one-shot timer driving a maintenance callback.
pub struct ScheduledTimer {
    shared: Arc<TimerShared>,
    token: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ScheduledTimer {
    pub fn new<F, Fut>(clock: Arc<dyn Clock>, callback: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<DateTime<Utc>>>> + Send + 'static,
    {
        let shared = Arc::new(TimerShared {
            clock,
            next: Mutex::new(None),
            wake: Notify::new(),
        });
        let callback: TimerCallback = Arc::new(move || Box::pin(callback()));
        let token = CancellationToken::new();

        let task = tokio::spawn(Self::run(shared.clone(), callback, token.clone()));

        Self {
            shared,
            token,
            task: Mutex::new(Some(task)),
        }
    }

    /// Request a fire at `at`. Earlier pending fires win; `at` in the past
    /// fires soon; `DateTime::<Utc>::MAX_UTC` is ignored (no next fire).
    pub fn schedule_next(&self, at: DateTime<Utc>) {
        self.shared.merge_next(at);
    }

    /// Cancel pending fires and stop the timer task.
    pub async fn dispose(&self) {
        self.token.cancel();
        self.shared.wake.notify_one();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    async fn run(shared: Arc<TimerShared>, callback: TimerCallback, token: CancellationToken) {
        let mut last_fired: Option<DateTime<Utc>> = None;

        loop {
            if token.is_cancelled() {
                break;
            }

            // Register for wake-ups before reading the schedule so a
            // concurrent schedule_next cannot be missed.
            let woken = shared.wake.notified();
            let pending = *shared.next.lock();

            let Some(at) = pending else {
                tokio::select! {
                    _ = woken => {}
                    _ = token.cancelled() => break,
                }
                continue;
            };

            let at = match last_fired {
                Some(last) => at.max(last + to_chrono(MIN_INTERVAL)),
                None => at,
            };

            let now = shared.clock.now();
            if at <= now + to_chrono(FIRE_TOLERANCE) {
                {
                    let mut next = shared.next.lock();
                    // Only consume the fire we observed; a newer earlier
                    // request stays pending.
                    if *next == pending {
                        *next = None;
                    }
                }

                last_fired = Some(now);
                match callback().await {
                    Ok(Some(next_at)) => shared.merge_next(next_at),
                    Ok(None) => {}
                    Err(e) => {
                        tracing::error!(error = %e, "scheduled timer callback failed");
                    }
                }
                continue;
            }

            let wait = (at - now).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = woken => {}
                _ = shared.clock.delay(wait, &token) => {}
                _ = token.cancelled() => break,
            }
        }
    }
}

impl Drop for ScheduledTimer {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl std::fmt::Debug for ScheduledTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledTimer")
            .field("next", &*self.shared.next.lock())
            .finish()
    }
}
