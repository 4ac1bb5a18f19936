//! Queue contract, configuration, statistics, and lifecycle event args.

use crate::behavior::QueueBehavior;
use crate::entry::QueueEntry;
use crate::events::{AsyncEvent, Cancelable, CancelableEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conveyor_core::{Clock, Result, SystemClock};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Options for a single enqueue.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Correlates the entry with an originating operation; when absent the
    /// engine inherits the ambient trace id.
    pub correlation_id: Option<String>,
    /// Producer-set, case-sensitive properties copied onto the entry.
    pub properties: HashMap<String, String>,
    /// Hold the entry back from the pending queue until this delay elapses.
    pub delivery_delay: Option<Duration>,
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn delivery_delay(mut self, delay: Duration) -> Self {
        self.delivery_delay = Some(delay);
        self
    }
}

/// Worker dispatch options.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Complete the entry after the handler returns successfully.
    pub auto_complete: bool,
    /// Number of independent worker routines to spawn.
    pub worker_count: usize,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            auto_complete: false,
            worker_count: 1,
        }
    }
}

/// Queue configuration.
#[derive(Clone)]
pub struct QueueOptions<T: Clone + Send + Sync + 'static> {
    /// Queue name; the instance id appends a random suffix.
    pub name: String,
    /// Retries after the first failed attempt before dead-lettering.
    pub retries: u32,
    /// Base retry delay; zero retries immediately.
    pub retry_delay: Duration,
    /// Per-attempt delay multipliers; the last one repeats.
    pub retry_multipliers: Vec<u32>,
    /// Lease duration granted by a dequeue or renewal.
    pub work_item_timeout: Duration,
    /// Default dequeue wait.
    pub dequeue_timeout: Duration,
    /// Completed entries retained for diagnostics.
    pub completed_retention_limit: usize,
    /// Behaviors attached at construction.
    pub behaviors: Vec<Arc<dyn QueueBehavior<T>>>,
    /// Clock used for every recorded timestamp and delay.
    pub clock: Arc<dyn Clock>,
}

impl<T: Clone + Send + Sync + 'static> Default for QueueOptions<T> {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            retries: 2,
            retry_delay: Duration::from_secs(1),
            retry_multipliers: vec![1, 3, 5, 10],
            work_item_timeout: Duration::from_secs(300),
            dequeue_timeout: Duration::from_secs(30),
            completed_retention_limit: 100,
            behaviors: Vec::new(),
            clock: Arc::new(SystemClock),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> QueueOptions<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn retry_multipliers(mut self, multipliers: Vec<u32>) -> Self {
        self.retry_multipliers = multipliers;
        self
    }

    pub fn work_item_timeout(mut self, timeout: Duration) -> Self {
        self.work_item_timeout = timeout;
        self
    }

    pub fn dequeue_timeout(mut self, timeout: Duration) -> Self {
        self.dequeue_timeout = timeout;
        self
    }

    pub fn completed_retention_limit(mut self, limit: usize) -> Self {
        self.completed_retention_limit = limit;
        self
    }

    pub fn behavior(mut self, behavior: Arc<dyn QueueBehavior<T>>) -> Self {
        self.behaviors.push(behavior);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// Point-in-time queue statistics. Counters are monotonic between
/// `delete_queue` calls; reads are atomic loads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: u64,
    pub leased: u64,
    pub dead_letter: u64,
    pub enqueued: u64,
    pub dequeued: u64,
    pub completed: u64,
    pub abandoned: u64,
    pub worker_errors: u64,
    pub lease_timeouts: u64,
    pub last_enqueue_activity: Option<DateTime<Utc>>,
    pub last_dequeue_activity: Option<DateTime<Utc>>,
}

/// Args for the cancelable Enqueuing event.
pub struct EnqueuingArgs<T: Clone> {
    value: T,
    pub options: EnqueueOptions,
    canceled: AtomicBool,
}

impl<T: Clone> EnqueuingArgs<T> {
    pub(crate) fn new(value: T, options: EnqueueOptions) -> Self {
        Self {
            value,
            options,
            canceled: AtomicBool::new(false),
        }
    }

    /// The payload about to be enqueued.
    pub fn value(&self) -> &T {
        &self.value
    }
}

impl<T: Clone> Cancelable for EnqueuingArgs<T> {
    fn cancel(&self) {
        self.canceled.store(true, Ordering::Release);
    }

    fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }
}

/// Args for the entry lifecycle events.
pub struct EntryEventArgs<T: Clone> {
    pub entry: Arc<QueueEntry<T>>,
}

/// The lifecycle event slots a queue exposes to behaviors and callers.
pub struct QueueEvents<T: Clone + Send + Sync + 'static> {
    /// Sequential and cancelable; fires before an entry is admitted.
    pub enqueuing: CancelableEvent<EnqueuingArgs<T>>,
    pub enqueued: AsyncEvent<EntryEventArgs<T>>,
    pub dequeued: AsyncEvent<EntryEventArgs<T>>,
    pub lock_renewed: AsyncEvent<EntryEventArgs<T>>,
    pub completed: AsyncEvent<EntryEventArgs<T>>,
    pub abandoned: AsyncEvent<EntryEventArgs<T>>,
}

impl<T: Clone + Send + Sync + 'static> QueueEvents<T> {
    pub(crate) fn new() -> Self {
        Self {
            enqueuing: CancelableEvent::new(),
            enqueued: AsyncEvent::new(),
            dequeued: AsyncEvent::new(),
            lock_renewed: AsyncEvent::new(),
            completed: AsyncEvent::new(),
            abandoned: AsyncEvent::new(),
        }
    }
}

/// Lowercased unqualified type name, e.g. `OrderCreated` → `ordercreated`.
/// Used for metric names and the processing span.
pub(crate) fn short_type_name<T>() -> String {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_lowercase()
}

/// Worker handler invoked for each dequeued entry.
pub type WorkerHandler<T> = Arc<
    dyn Fn(Arc<QueueEntry<T>>, CancellationToken) -> Pin<Box<dyn Future<Output = Result<()>> + Send>>
        + Send
        + Sync,
>;

/// Wrap an async closure as a [`WorkerHandler`].
pub fn worker_handler<T, F, Fut>(handler: F) -> WorkerHandler<T>
where
    T: Clone + Send + Sync + 'static,
    F: Fn(Arc<QueueEntry<T>>, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |entry, token| Box::pin(handler(entry, token)))
}

/// Storage-backend contract for a work queue. The in-memory engine is the
/// reference implementation; other backends must preserve the same state
/// invariants.
#[async_trait]
pub trait Queue<T: Clone + Send + Sync + 'static>: Send + Sync {
    /// Configured queue name.
    fn name(&self) -> &str;

    /// Instance identity: the name plus a random suffix.
    fn queue_id(&self) -> &str;

    /// The lifecycle event slots behaviors subscribe to.
    fn events(&self) -> Arc<QueueEvents<T>>;

    /// Prepare backing resources. No-op for the in-memory engine.
    async fn ensure_created(&self) -> Result<()>;

    /// Enqueue a payload; returns the entry id, or `None` when an Enqueuing
    /// handler canceled the operation.
    async fn enqueue(&self, value: T) -> Result<Option<String>>;

    async fn enqueue_with_options(
        &self,
        value: T,
        options: EnqueueOptions,
    ) -> Result<Option<String>>;

    /// Wait up to `timeout` (default configured dequeue timeout) for an
    /// entry; FIFO over pending.
    async fn dequeue(&self, timeout: Option<Duration>) -> Result<Option<Arc<QueueEntry<T>>>>;

    /// Wait until an entry is available or `cancel` trips.
    async fn dequeue_with_cancellation(
        &self,
        cancel: CancellationToken,
    ) -> Result<Option<Arc<QueueEntry<T>>>>;

    /// Extend the lease; no-op when the entry is no longer leased.
    async fn renew_lock(&self, entry: &QueueEntry<T>) -> Result<()>;

    /// Terminal success.
    async fn complete(&self, entry: &QueueEntry<T>) -> Result<()>;

    /// Release the lease without success; retries or dead-letters.
    async fn abandon(&self, entry: &QueueEntry<T>) -> Result<()>;

    /// Payloads currently resting in the dead-letter queue.
    async fn get_dead_letter_items(&self) -> Result<Vec<T>>;

    async fn get_stats(&self) -> QueueStats;

    /// Launch worker routines pulling from this queue.
    async fn start_working(
        &self,
        handler: WorkerHandler<T>,
        options: WorkerOptions,
        cancel: CancellationToken,
    ) -> Result<()>;

    /// Attach a behavior after construction.
    async fn attach_behavior(&self, behavior: Arc<dyn QueueBehavior<T>>);

    /// Drop every entry and reset counters. Safe while workers exist; they
    /// observe the cleared state and idle.
    async fn delete_queue(&self) -> Result<()>;

    /// Cancel the engine lifetime, drain workers, and release resources.
    async fn dispose(&self);
}
