//! In-memory queue engine.
//!
//! The reference implementation of the [`Queue`] contract: FIFO pending
//! entries, a leased map keyed by entry id, a dead-letter queue, a bounded
//! completed history, and a maintenance timer that abandons expired leases.

use crate::behavior::{AttachContext, BehaviorHandle, QueueBehavior};
use crate::entry::{QueueEntry, Settlement};
use crate::queue::{
    short_type_name, EnqueueOptions, EnqueuingArgs, EntryEventArgs, Queue, QueueEvents,
    QueueOptions, QueueStats, WorkerHandler, WorkerOptions,
};
use crate::timer::ScheduledTimer;
use crate::worker;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conveyor_core::{id, Clock, Error, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Internal dequeue waits are sliced so cancellation and deletion are
/// observed promptly.
const WAIT_SLICE: Duration = Duration::from_secs(10);

/// Worker join grace during dispose.
const WORKER_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::max_value())
}

/// Correlation inherited from the ambient trace when the producer supplies
/// none.
fn ambient_trace_id() -> Option<String> {
    tracing::Span::current()
        .id()
        .map(|span_id| format!("{:016x}", span_id.into_u64()))
}

pub(crate) struct QueueInner<T: Clone + Send + Sync + 'static> {
    name: String,
    queue_id: String,
    retries: u32,
    retry_delay: Duration,
    retry_multipliers: Vec<u32>,
    work_item_timeout: Duration,
    dequeue_timeout: Duration,
    completed_retention_limit: usize,
    clock: Arc<dyn Clock>,
    events: Arc<QueueEvents<T>>,

    pending: Mutex<VecDeque<Arc<QueueEntry<T>>>>,
    pending_count: AtomicU64,
    leased: DashMap<String, Arc<QueueEntry<T>>>,
    dead_letter: Mutex<VecDeque<Arc<QueueEntry<T>>>>,
    dead_letter_count: AtomicU64,
    completed_history: Mutex<VecDeque<Arc<QueueEntry<T>>>>,

    enqueued_total: AtomicU64,
    dequeued_total: AtomicU64,
    completed_total: AtomicU64,
    abandoned_total: AtomicU64,
    worker_errors_total: AtomicU64,
    lease_timeouts_total: AtomicU64,
    last_enqueue_activity: Mutex<Option<DateTime<Utc>>>,
    last_dequeue_activity: Mutex<Option<DateTime<Utc>>>,

    item_available: Notify,
    lifetime: CancellationToken,
    /// Bumped by delete_queue; in-flight delayed admissions and retries from
    /// an older generation are dropped silently.
    generation: AtomicU64,
    maintenance: OnceLock<ScheduledTimer>,
    behaviors: Mutex<Vec<(String, BehaviorHandle)>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    weak_self: OnceLock<Weak<QueueInner<T>>>,
}

impl<T: Clone + Send + Sync + 'static> QueueInner<T> {
    pub(crate) fn queue_id(&self) -> &str {
        &self.queue_id
    }

    pub(crate) fn lifetime(&self) -> &CancellationToken {
        &self.lifetime
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.lifetime.is_cancelled()
    }

    pub(crate) fn is_leased(&self, entry_id: &str) -> bool {
        self.leased.contains_key(entry_id)
    }

    pub(crate) fn record_worker_error(&self) {
        self.worker_errors_total.fetch_add(1, Ordering::SeqCst);
    }

    fn stats_snapshot(&self) -> QueueStats {
        QueueStats {
            pending: self.pending_count.load(Ordering::SeqCst),
            leased: self.leased.len() as u64,
            dead_letter: self.dead_letter_count.load(Ordering::SeqCst),
            enqueued: self.enqueued_total.load(Ordering::SeqCst),
            dequeued: self.dequeued_total.load(Ordering::SeqCst),
            completed: self.completed_total.load(Ordering::SeqCst),
            abandoned: self.abandoned_total.load(Ordering::SeqCst),
            worker_errors: self.worker_errors_total.load(Ordering::SeqCst),
            lease_timeouts: self.lease_timeouts_total.load(Ordering::SeqCst),
            last_enqueue_activity: *self.last_enqueue_activity.lock(),
            last_dequeue_activity: *self.last_dequeue_activity.lock(),
        }
    }

    async fn enqueue_with_options(
        &self,
        value: T,
        options: EnqueueOptions,
    ) -> Result<Option<String>> {
        if self.is_disposed() {
            return Err(Error::Canceled);
        }

        let correlation_id = options.correlation_id.clone().or_else(ambient_trace_id);

        let enqueuing = Arc::new(EnqueuingArgs::new(value.clone(), options.clone()));
        if self.events.enqueuing.invoke(enqueuing).await {
            tracing::debug!(queue = %self.queue_id, "enqueue canceled by behavior");
            return Ok(None);
        }

        let entry_id = id::entry_id();
        let entry = Arc::new(QueueEntry::new(
            entry_id.clone(),
            value,
            correlation_id,
            options.properties,
            self.clock.now(),
        ));

        match options.delivery_delay {
            Some(delay) if !delay.is_zero() => {
                self.schedule_delayed_admission(entry, delay);
            }
            _ => self.admit(entry).await,
        }

        Ok(Some(entry_id))
    }

    /// Append to the pending tail, stamp activity, and fire Enqueued.
    async fn admit(&self, entry: Arc<QueueEntry<T>>) {
        let now = self.clock.now();
        self.pending.lock().push_back(entry.clone());
        self.pending_count.fetch_add(1, Ordering::SeqCst);
        self.enqueued_total.fetch_add(1, Ordering::SeqCst);
        *self.last_enqueue_activity.lock() = Some(now);
        self.item_available.notify_one();

        tracing::debug!(queue = %self.queue_id, entry_id = %entry.id(), "entry enqueued");
        self.events
            .enqueued
            .invoke(Arc::new(EntryEventArgs { entry }))
            .await;
    }

    /// Re-enter the pending tail after an abandon. Counts and the Enqueued
    /// event belong to the original admission, not the retry.
    async fn re_admit(&self, entry: Arc<QueueEntry<T>>) {
        entry.reset_for_retry();
        self.pending.lock().push_back(entry.clone());
        self.pending_count.fetch_add(1, Ordering::SeqCst);
        self.item_available.notify_one();
        tracing::debug!(
            queue = %self.queue_id,
            entry_id = %entry.id(),
            attempts = entry.attempts(),
            "entry re-enqueued for retry"
        );
    }

    fn schedule_delayed_admission(&self, entry: Arc<QueueEntry<T>>, delay: Duration) {
        let weak = self.weak_self.get().cloned().unwrap_or_default();
        let generation = self.generation.load(Ordering::SeqCst);
        let token = self.lifetime.clone();
        let clock = self.clock.clone();

        tokio::spawn(async move {
            clock.delay(delay, &token).await;
            if token.is_cancelled() {
                return;
            }
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            inner.admit(entry).await;
        });
    }

    fn schedule_retry(&self, entry: Arc<QueueEntry<T>>, delay: Duration) {
        let weak = self.weak_self.get().cloned().unwrap_or_default();
        let generation = self.generation.load(Ordering::SeqCst);
        let token = self.lifetime.clone();
        let clock = self.clock.clone();

        tokio::spawn(async move {
            clock.delay(delay, &token).await;
            if token.is_cancelled() {
                return;
            }
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            inner.re_admit(entry).await;
        });
    }

    fn pop_pending(&self) -> Option<Arc<QueueEntry<T>>> {
        let popped = self.pending.lock().pop_front();
        if popped.is_some() {
            self.pending_count.fetch_sub(1, Ordering::SeqCst);
        }
        popped
    }

    /// Blocking dequeue shared by the timeout and cancellation variants.
    pub(crate) async fn dequeue_inner(
        &self,
        timeout: Option<Duration>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<Arc<QueueEntry<T>>>> {
        let deadline = timeout.map(|t| self.clock.now() + chrono_duration(t));

        loop {
            // Register for the signal before checking state so an enqueue
            // between the check and the await cannot be missed.
            let notified = self.item_available.notified();

            if self.is_disposed() {
                return Ok(None);
            }
            if matches!(cancel, Some(token) if token.is_cancelled()) {
                return Ok(None);
            }

            if let Some(entry) = self.pop_pending() {
                return Ok(Some(self.transition_to_leased(entry).await));
            }

            let wait = match deadline {
                Some(deadline) => {
                    let now = self.clock.now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    (deadline - now)
                        .to_std()
                        .unwrap_or(Duration::ZERO)
                        .min(WAIT_SLICE)
                }
                None => WAIT_SLICE,
            };

            match cancel {
                Some(token) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = self.clock.delay(wait, &self.lifetime) => {}
                        _ = token.cancelled() => return Ok(None),
                        _ = self.lifetime.cancelled() => return Ok(None),
                    }
                }
                None => {
                    tokio::select! {
                        _ = notified => {}
                        _ = self.clock.delay(wait, &self.lifetime) => {}
                        _ = self.lifetime.cancelled() => return Ok(None),
                    }
                }
            }
        }
    }

    async fn transition_to_leased(&self, entry: Arc<QueueEntry<T>>) -> Arc<QueueEntry<T>> {
        let now = self.clock.now();
        entry.record_dequeue(now);
        self.leased.insert(entry.id().to_string(), entry.clone());

        if let Some(timer) = self.maintenance.get() {
            timer.schedule_next(now + chrono_duration(self.work_item_timeout));
        }

        self.dequeued_total.fetch_add(1, Ordering::SeqCst);
        *self.last_dequeue_activity.lock() = Some(now);

        let span = tracing::info_span!(
            "ProcessQueueEntry",
            queue_name = %self.name,
            entry_id = %entry.id(),
            entry_type = %short_type_name::<T>(),
            attempt = entry.attempts(),
        );
        entry.set_span(span);

        tracing::debug!(
            queue = %self.queue_id,
            entry_id = %entry.id(),
            attempt = entry.attempts(),
            "entry dequeued"
        );

        let args = Arc::new(EntryEventArgs {
            entry: entry.clone(),
        });
        self.events.lock_renewed.invoke(args.clone()).await;
        self.events.dequeued.invoke(args).await;

        entry
    }

    async fn renew_lock(&self, entry: &QueueEntry<T>) -> Result<()> {
        let Some(stored) = self.leased.get(entry.id()).map(|e| e.value().clone()) else {
            // Idempotent: a lease that already moved on is a no-op.
            return Ok(());
        };

        stored.record_renewal(self.clock.now());
        tracing::debug!(queue = %self.queue_id, entry_id = %stored.id(), "lock renewed");
        self.events
            .lock_renewed
            .invoke(Arc::new(EntryEventArgs { entry: stored }))
            .await;
        Ok(())
    }

    pub(crate) async fn complete_entry(&self, entry: &QueueEntry<T>) -> Result<()> {
        entry.try_settle(Settlement::Completed)?;

        let Some((_, stored)) = self.leased.remove(entry.id()) else {
            entry.clear_settled();
            return Err(Error::not_leased(entry.id()));
        };

        let now = self.clock.now();
        stored.finalize(now, true);

        {
            let mut history = self.completed_history.lock();
            history.push_back(stored.clone());
            while history.len() > self.completed_retention_limit {
                history.pop_front();
            }
        }
        self.completed_total.fetch_add(1, Ordering::SeqCst);
        drop(stored.take_span());

        tracing::debug!(queue = %self.queue_id, entry_id = %stored.id(), "entry completed");
        self.events
            .completed
            .invoke(Arc::new(EntryEventArgs { entry: stored }))
            .await;
        Ok(())
    }

    pub(crate) async fn abandon_entry(
        &self,
        entry: &QueueEntry<T>,
        lease_expired: bool,
    ) -> Result<()> {
        entry.try_settle(Settlement::Abandoned)?;

        let Some((_, stored)) = self.leased.remove(entry.id()) else {
            entry.clear_settled();
            return Err(Error::not_leased(entry.id()));
        };

        let now = self.clock.now();
        stored.finalize(now, false);
        self.abandoned_total.fetch_add(1, Ordering::SeqCst);
        if lease_expired {
            self.lease_timeouts_total.fetch_add(1, Ordering::SeqCst);
            tracing::warn!(
                queue = %self.queue_id,
                entry_id = %stored.id(),
                "lease expired, entry abandoned"
            );
        }
        drop(stored.take_span());

        // Observers see the Abandoned event before the entry re-enters the
        // pipeline or rests in the dead-letter queue.
        self.events
            .abandoned
            .invoke(Arc::new(EntryEventArgs {
                entry: stored.clone(),
            }))
            .await;

        if stored.attempts() > self.retries {
            self.dead_letter.lock().push_back(stored.clone());
            self.dead_letter_count.fetch_add(1, Ordering::SeqCst);
            tracing::warn!(
                queue = %self.queue_id,
                entry_id = %stored.id(),
                attempts = stored.attempts(),
                "entry dead-lettered"
            );
        } else {
            let delay = self.retry_delay_for(stored.attempts());
            if delay.is_zero() {
                self.re_admit(stored).await;
            } else {
                self.schedule_retry(stored, delay);
            }
        }

        Ok(())
    }

    /// `delay_i = base_delay × multipliers[min(attempts−1, len−1)]`
    fn retry_delay_for(&self, attempts: u32) -> Duration {
        if self.retry_delay.is_zero() {
            return Duration::ZERO;
        }
        let index = (attempts.saturating_sub(1) as usize).min(self.retry_multipliers.len() - 1);
        self.retry_delay * self.retry_multipliers[index]
    }

    /// Abandon expired leases; returns the next lease deadline to watch.
    async fn do_maintenance(&self) -> Option<DateTime<Utc>> {
        let now = self.clock.now();
        let timeout = chrono_duration(self.work_item_timeout);

        let mut expired = Vec::new();
        let mut next_deadline: Option<DateTime<Utc>> = None;

        for item in self.leased.iter() {
            let renewed_at = item.renewed_at().unwrap_or_else(|| item.enqueued_at());
            let deadline = renewed_at + timeout;
            if deadline <= now {
                expired.push(item.value().clone());
            } else {
                next_deadline = Some(match next_deadline {
                    Some(current) => current.min(deadline),
                    None => deadline,
                });
            }
        }

        for entry in expired {
            match self.abandon_entry(&entry, true).await {
                Ok(()) => {}
                // Lost the race against a worker settling the entry.
                Err(Error::AlreadySettled { .. }) | Err(Error::NotLeased { .. }) => {}
                Err(e) => {
                    tracing::error!(queue = %self.queue_id, error = %e, "maintenance abandon failed");
                }
            }
        }

        next_deadline
    }

    fn start_working(
        &self,
        handler: WorkerHandler<T>,
        options: WorkerOptions,
        cancel: CancellationToken,
    ) {
        let Some(strong) = self.weak_self.get().and_then(|weak| weak.upgrade()) else {
            return;
        };

        let worker_count = options.worker_count.max(1);
        let mut workers = self.workers.lock();
        for index in 0..worker_count {
            let task = tokio::spawn(worker::worker_loop(
                strong.clone(),
                handler.clone(),
                options.auto_complete,
                cancel.clone(),
                index,
            ));
            workers.push(task);
        }
    }

    async fn delete_queue(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);

        self.pending.lock().clear();
        self.pending_count.store(0, Ordering::SeqCst);
        self.leased.clear();
        self.dead_letter.lock().clear();
        self.dead_letter_count.store(0, Ordering::SeqCst);
        self.completed_history.lock().clear();

        self.enqueued_total.store(0, Ordering::SeqCst);
        self.dequeued_total.store(0, Ordering::SeqCst);
        self.completed_total.store(0, Ordering::SeqCst);
        self.abandoned_total.store(0, Ordering::SeqCst);
        self.worker_errors_total.store(0, Ordering::SeqCst);
        self.lease_timeouts_total.store(0, Ordering::SeqCst);
        *self.last_enqueue_activity.lock() = None;
        *self.last_dequeue_activity.lock() = None;

        tracing::info!(queue = %self.queue_id, "queue deleted");
    }

    async fn dispose(&self) {
        self.lifetime.cancel();
        self.item_available.notify_waiters();

        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for handle in workers {
            if tokio::time::timeout(WORKER_SHUTDOWN_GRACE, handle).await.is_err() {
                tracing::warn!(queue = %self.queue_id, "worker did not stop within the shutdown grace");
            }
        }

        if let Some(timer) = self.maintenance.get() {
            timer.dispose().await;
        }

        self.pending.lock().clear();
        self.pending_count.store(0, Ordering::SeqCst);
        self.leased.clear();
        self.dead_letter.lock().clear();
        self.dead_letter_count.store(0, Ordering::SeqCst);
        self.completed_history.lock().clear();
        self.behaviors.lock().clear();

        tracing::debug!(queue = %self.queue_id, "queue disposed");
    }
}

/// In-memory work queue.
pub struct InMemoryQueue<T: Clone + Send + Sync + 'static> {
    inner: Arc<QueueInner<T>>,
}

impl<T: Clone + Send + Sync + 'static> InMemoryQueue<T> {
    pub fn new(options: QueueOptions<T>) -> Self {
        let name = if options.name.trim().is_empty() {
            "default".to_string()
        } else {
            options.name
        };
        let retry_multipliers = if options.retry_multipliers.is_empty() {
            vec![1]
        } else {
            options.retry_multipliers
        };

        let inner = Arc::new(QueueInner {
            queue_id: id::queue_id(&name),
            name,
            retries: options.retries,
            retry_delay: options.retry_delay,
            retry_multipliers,
            work_item_timeout: options.work_item_timeout,
            dequeue_timeout: options.dequeue_timeout,
            completed_retention_limit: options.completed_retention_limit,
            clock: options.clock.clone(),
            events: Arc::new(QueueEvents::new()),
            pending: Mutex::new(VecDeque::new()),
            pending_count: AtomicU64::new(0),
            leased: DashMap::new(),
            dead_letter: Mutex::new(VecDeque::new()),
            dead_letter_count: AtomicU64::new(0),
            completed_history: Mutex::new(VecDeque::new()),
            enqueued_total: AtomicU64::new(0),
            dequeued_total: AtomicU64::new(0),
            completed_total: AtomicU64::new(0),
            abandoned_total: AtomicU64::new(0),
            worker_errors_total: AtomicU64::new(0),
            lease_timeouts_total: AtomicU64::new(0),
            last_enqueue_activity: Mutex::new(None),
            last_dequeue_activity: Mutex::new(None),
            item_available: Notify::new(),
            lifetime: CancellationToken::new(),
            generation: AtomicU64::new(0),
            maintenance: OnceLock::new(),
            behaviors: Mutex::new(Vec::new()),
            workers: Mutex::new(Vec::new()),
            weak_self: OnceLock::new(),
        });

        let _ = inner.weak_self.set(Arc::downgrade(&inner));

        let weak = Arc::downgrade(&inner);
        let timer = ScheduledTimer::new(options.clock, move || {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(inner) => Ok(inner.do_maintenance().await),
                    None => Ok(None),
                }
            }
        });
        let _ = inner.maintenance.set(timer);

        let queue = Self { inner };
        for behavior in options.behaviors {
            queue.attach_behavior_sync(behavior.as_ref());
        }
        queue
    }

    fn attach_context(&self) -> AttachContext<T> {
        let weak = Arc::downgrade(&self.inner);
        AttachContext::new(
            self.inner.name.clone(),
            self.inner.queue_id.clone(),
            self.inner.events.clone(),
            self.inner.clock.clone(),
            Arc::new(move || {
                weak.upgrade()
                    .map(|inner| inner.stats_snapshot())
                    .unwrap_or_default()
            }),
        )
    }

    fn attach_behavior_sync(&self, behavior: &dyn QueueBehavior<T>) {
        let ctx = self.attach_context();
        let handle = behavior.attach(&ctx);
        tracing::debug!(queue = %self.inner.queue_id, behavior = behavior.name(), "behavior attached");
        self.inner
            .behaviors
            .lock()
            .push((behavior.name().to_string(), handle));
    }

    /// Recently completed entries retained for diagnostics, oldest first.
    pub fn completed_history(&self) -> Vec<Arc<QueueEntry<T>>> {
        self.inner.completed_history.lock().iter().cloned().collect()
    }
}

impl<T: Clone + Send + Sync + 'static> Default for InMemoryQueue<T> {
    fn default() -> Self {
        Self::new(QueueOptions::default())
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> Queue<T> for InMemoryQueue<T> {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn queue_id(&self) -> &str {
        &self.inner.queue_id
    }

    fn events(&self) -> Arc<QueueEvents<T>> {
        self.inner.events.clone()
    }

    async fn ensure_created(&self) -> Result<()> {
        Ok(())
    }

    async fn enqueue(&self, value: T) -> Result<Option<String>> {
        self.inner
            .enqueue_with_options(value, EnqueueOptions::default())
            .await
    }

    async fn enqueue_with_options(
        &self,
        value: T,
        options: EnqueueOptions,
    ) -> Result<Option<String>> {
        self.inner.enqueue_with_options(value, options).await
    }

    async fn dequeue(&self, timeout: Option<Duration>) -> Result<Option<Arc<QueueEntry<T>>>> {
        let timeout = timeout.unwrap_or(self.inner.dequeue_timeout);
        self.inner.dequeue_inner(Some(timeout), None).await
    }

    async fn dequeue_with_cancellation(
        &self,
        cancel: CancellationToken,
    ) -> Result<Option<Arc<QueueEntry<T>>>> {
        self.inner.dequeue_inner(None, Some(&cancel)).await
    }

    async fn renew_lock(&self, entry: &QueueEntry<T>) -> Result<()> {
        self.inner.renew_lock(entry).await
    }

    async fn complete(&self, entry: &QueueEntry<T>) -> Result<()> {
        self.inner.complete_entry(entry).await
    }

    async fn abandon(&self, entry: &QueueEntry<T>) -> Result<()> {
        self.inner.abandon_entry(entry, false).await
    }

    async fn get_dead_letter_items(&self) -> Result<Vec<T>> {
        Ok(self
            .inner
            .dead_letter
            .lock()
            .iter()
            .map(|entry| entry.value())
            .collect())
    }

    async fn get_stats(&self) -> QueueStats {
        self.inner.stats_snapshot()
    }

    async fn start_working(
        &self,
        handler: WorkerHandler<T>,
        options: WorkerOptions,
        cancel: CancellationToken,
    ) -> Result<()> {
        self.inner.start_working(handler, options, cancel);
        Ok(())
    }

    async fn attach_behavior(&self, behavior: Arc<dyn QueueBehavior<T>>) {
        self.attach_behavior_sync(behavior.as_ref());
    }

    async fn delete_queue(&self) -> Result<()> {
        self.inner.delete_queue().await;
        Ok(())
    }

    async fn dispose(&self) {
        self.inner.dispose().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue_with(retries: u32, retry_delay: Duration) -> InMemoryQueue<String> {
        InMemoryQueue::new(
            QueueOptions::new("test")
                .retries(retries)
                .retry_delay(retry_delay),
        )
    }

    #[tokio::test]
    async fn test_enqueue_dequeue_is_fifo() {
        let queue = queue_with(2, Duration::ZERO);

        for payload in ["a", "b", "c"] {
            queue.enqueue(payload.to_string()).await.unwrap().unwrap();
        }

        for expected in ["a", "b", "c"] {
            let entry = queue
                .dequeue(Some(Duration::from_millis(100)))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(entry.value(), expected);
            queue.complete(&entry).await.unwrap();
        }

        let stats = queue.get_stats().await;
        assert_eq!(stats.enqueued, 3);
        assert_eq!(stats.dequeued, 3);
        assert_eq!(stats.completed, 3);
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.leased, 0);
    }

    #[tokio::test]
    async fn test_entry_id_shape_and_queue_id() {
        let queue = queue_with(0, Duration::ZERO);
        let id = queue.enqueue("x".to_string()).await.unwrap().unwrap();
        assert_eq!(id.len(), 32);
        assert!(queue.queue_id().starts_with("test-"));
        assert_eq!(queue.queue_id().len(), "test-".len() + 22);
    }

    #[tokio::test]
    async fn test_dequeue_empty_times_out() {
        let queue = queue_with(0, Duration::ZERO);
        let entry = queue.dequeue(Some(Duration::from_millis(50))).await.unwrap();
        assert!(entry.is_none());
    }

    #[tokio::test]
    async fn test_dequeue_increments_attempts_before_handing_out() {
        let queue = queue_with(2, Duration::ZERO);
        queue.enqueue("x".to_string()).await.unwrap();

        let entry = queue
            .dequeue(Some(Duration::from_millis(100)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.attempts(), 1);
        assert!(entry.dequeued_at().is_some());
        assert_eq!(entry.renewed_at(), entry.dequeued_at());
    }

    #[tokio::test]
    async fn test_complete_twice_is_already_settled() {
        let queue = queue_with(2, Duration::ZERO);
        queue.enqueue("x".to_string()).await.unwrap();
        let entry = queue
            .dequeue(Some(Duration::from_millis(100)))
            .await
            .unwrap()
            .unwrap();

        queue.complete(&entry).await.unwrap();
        let err = queue.complete(&entry).await.unwrap_err();
        assert!(matches!(err, Error::AlreadySettled { .. }));
    }

    #[tokio::test]
    async fn test_complete_stale_handle_reports_already_settled() {
        let queue = queue_with(2, Duration::ZERO);
        queue.enqueue("x".to_string()).await.unwrap();
        let entry = queue
            .dequeue(Some(Duration::from_millis(100)))
            .await
            .unwrap()
            .unwrap();
        queue.abandon(&entry).await.unwrap();

        // Re-dequeue the retried entry and settle it; completing through the
        // stale handle now reports the earlier settlement.
        let retried = queue
            .dequeue(Some(Duration::from_millis(100)))
            .await
            .unwrap()
            .unwrap();
        queue.complete(&retried).await.unwrap();

        let err = queue.complete(&entry).await.unwrap_err();
        assert!(matches!(err, Error::AlreadySettled { .. }));
    }

    #[tokio::test]
    async fn test_complete_pending_retry_is_not_leased() {
        let queue = queue_with(2, Duration::ZERO);
        queue.enqueue("x".to_string()).await.unwrap();
        let entry = queue
            .dequeue(Some(Duration::from_millis(100)))
            .await
            .unwrap()
            .unwrap();
        queue.abandon(&entry).await.unwrap();

        // The retry is back in pending; a terminal op on it is rejected and
        // leaves the entry dequeuable.
        let err = queue.complete(&entry).await.unwrap_err();
        assert!(matches!(err, Error::NotLeased { .. }));

        let retried = queue
            .dequeue(Some(Duration::from_millis(100)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(retried.attempts(), 2);
    }

    #[tokio::test]
    async fn test_abandon_retries_to_pending_tail() {
        let queue = queue_with(2, Duration::ZERO);
        queue.enqueue("first".to_string()).await.unwrap();
        let entry = queue
            .dequeue(Some(Duration::from_millis(100)))
            .await
            .unwrap()
            .unwrap();
        queue.enqueue("second".to_string()).await.unwrap();

        queue.abandon(&entry).await.unwrap();

        // The retried entry joins behind items enqueued in the meantime.
        let next = queue
            .dequeue(Some(Duration::from_millis(100)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.value(), "second");
        let retried = queue
            .dequeue(Some(Duration::from_millis(100)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(retried.value(), "first");
        assert_eq!(retried.attempts(), 2);
    }

    #[tokio::test]
    async fn test_retries_exhausted_goes_to_dead_letter() {
        let queue = queue_with(1, Duration::ZERO);
        queue.enqueue("doomed".to_string()).await.unwrap();

        for _ in 0..2 {
            let entry = queue
                .dequeue(Some(Duration::from_millis(100)))
                .await
                .unwrap()
                .unwrap();
            queue.abandon(&entry).await.unwrap();
        }

        let stats = queue.get_stats().await;
        assert_eq!(stats.dead_letter, 1);
        assert_eq!(stats.abandoned, 2);
        assert_eq!(stats.pending, 0);

        let items = queue.get_dead_letter_items().await.unwrap();
        assert_eq!(items, vec!["doomed".to_string()]);
    }

    #[tokio::test]
    async fn test_renew_lock_is_idempotent() {
        let queue = queue_with(2, Duration::ZERO);
        queue.enqueue("x".to_string()).await.unwrap();
        let entry = queue
            .dequeue(Some(Duration::from_millis(100)))
            .await
            .unwrap()
            .unwrap();

        queue.renew_lock(&entry).await.unwrap();
        queue.complete(&entry).await.unwrap();
        // No longer leased: a no-op, not an error.
        queue.renew_lock(&entry).await.unwrap();
    }

    #[tokio::test]
    async fn test_completed_history_is_bounded() {
        let queue: InMemoryQueue<String> = InMemoryQueue::new(
            QueueOptions::new("test").completed_retention_limit(2),
        );

        for i in 0..4 {
            queue.enqueue(format!("p{}", i)).await.unwrap();
            let entry = queue
                .dequeue(Some(Duration::from_millis(100)))
                .await
                .unwrap()
                .unwrap();
            queue.complete(&entry).await.unwrap();
        }

        let history = queue.completed_history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].value(), "p2");
        assert_eq!(history[1].value(), "p3");
        assert_eq!(queue.get_stats().await.completed, 4);
    }

    #[tokio::test]
    async fn test_delete_queue_clears_state_and_counters() {
        let queue = queue_with(2, Duration::ZERO);
        queue.enqueue("a".to_string()).await.unwrap();
        queue.enqueue("b".to_string()).await.unwrap();
        let _leased = queue
            .dequeue(Some(Duration::from_millis(100)))
            .await
            .unwrap()
            .unwrap();

        queue.delete_queue().await.unwrap();

        let stats = queue.get_stats().await;
        assert_eq!(stats, QueueStats::default());

        // The queue remains usable.
        queue.enqueue("c".to_string()).await.unwrap();
        assert_eq!(queue.get_stats().await.enqueued, 1);
    }

    #[tokio::test]
    async fn test_pending_retry_is_dropped_by_delete_queue() {
        let queue = queue_with(2, Duration::from_millis(50));
        queue.enqueue("x".to_string()).await.unwrap();
        let entry = queue
            .dequeue(Some(Duration::from_millis(100)))
            .await
            .unwrap()
            .unwrap();
        queue.abandon(&entry).await.unwrap();

        queue.delete_queue().await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        let stats = queue.get_stats().await;
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test]
    async fn test_delivery_delay_holds_back_admission() {
        let queue = queue_with(2, Duration::ZERO);
        queue
            .enqueue_with_options(
                "later".to_string(),
                EnqueueOptions::new().delivery_delay(Duration::from_millis(100)),
            )
            .await
            .unwrap()
            .unwrap();

        let early = queue.dequeue(Some(Duration::from_millis(50))).await.unwrap();
        assert!(early.is_none());

        let entry = queue
            .dequeue(Some(Duration::from_millis(500)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.value(), "later");
    }

    #[tokio::test]
    async fn test_worker_payload_mutation_does_not_leak_into_retry() {
        let queue = queue_with(2, Duration::ZERO);
        queue.enqueue("pristine".to_string()).await.unwrap();

        let entry = queue
            .dequeue(Some(Duration::from_millis(100)))
            .await
            .unwrap()
            .unwrap();
        let mut copy = entry.value();
        copy.push_str("-dirty");
        queue.abandon(&entry).await.unwrap();

        let retried = queue
            .dequeue(Some(Duration::from_millis(100)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(retried.value(), "pristine");
    }

    #[tokio::test]
    async fn test_enqueue_after_dispose_is_canceled() {
        let queue = queue_with(2, Duration::ZERO);
        queue.dispose().await;

        let err = queue.enqueue("x".to_string()).await.unwrap_err();
        assert!(err.is_canceled());
    }

    #[tokio::test]
    async fn test_dispose_releases_waiting_dequeue() {
        let queue = Arc::new(queue_with(2, Duration::ZERO));

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue(Some(Duration::from_secs(30))).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        queue.dispose().await;
        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(result.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_properties_and_correlation_are_carried() {
        let queue = queue_with(2, Duration::ZERO);
        queue
            .enqueue_with_options(
                "x".to_string(),
                EnqueueOptions::new()
                    .correlation_id("corr-42")
                    .property("tenant", "acme"),
            )
            .await
            .unwrap();

        let entry = queue
            .dequeue(Some(Duration::from_millis(100)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.correlation_id(), Some("corr-42"));
        assert_eq!(entry.property("tenant"), Some("acme".to_string()));
    }
}
