//! Queue entry record and its lifecycle state.
//!
//! An entry is a pure data record shared between the engine and the worker
//! holding its lease (`Arc`). The engine owns every transition; handlers and
//! behaviors may read the entry and mutate its properties.

use chrono::{DateTime, Utc};
use conveyor_core::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::time::Duration;

const SETTLED_NONE: u8 = 0;
const SETTLED_COMPLETED: u8 = 1;
const SETTLED_ABANDONED: u8 = 2;

/// Terminal disposition of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Settlement {
    Completed,
    Abandoned,
}

#[derive(Debug, Default)]
struct EntryTimings {
    dequeued_at: Option<DateTime<Utc>>,
    renewed_at: Option<DateTime<Utc>>,
    processing_time: Option<Duration>,
    total_time: Option<Duration>,
}

/// A single enqueued message with its metadata and lifecycle state.
///
/// The payload type doubles as its own deep-clone capability: `Clone` must
/// produce an independent copy (plain-old-data trees).
pub struct QueueEntry<T: Clone> {
    id: String,
    correlation_id: Option<String>,
    properties: RwLock<HashMap<String, String>>,
    value: Mutex<T>,
    /// Untouched ingress copy, used to reset `value` on retry.
    original_value: T,
    enqueued_at: DateTime<Utc>,
    timings: Mutex<EntryTimings>,
    attempts: AtomicU32,
    settled: AtomicU8,
    span: Mutex<Option<tracing::Span>>,
}

impl<T: Clone> QueueEntry<T> {
    pub(crate) fn new(
        id: String,
        value: T,
        correlation_id: Option<String>,
        properties: HashMap<String, String>,
        enqueued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            correlation_id,
            properties: RwLock::new(properties),
            original_value: value.clone(),
            value: Mutex::new(value),
            enqueued_at,
            timings: Mutex::new(EntryTimings::default()),
            attempts: AtomicU32::new(0),
            settled: AtomicU8::new(SETTLED_NONE),
            span: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// A deep copy of the current payload.
    pub fn value(&self) -> T {
        self.value.lock().clone()
    }

    pub fn property(&self, key: &str) -> Option<String> {
        self.properties.read().get(key).cloned()
    }

    pub fn set_property(&self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.write().insert(key.into(), value.into());
    }

    pub fn properties(&self) -> HashMap<String, String> {
        self.properties.read().clone()
    }

    pub fn enqueued_at(&self) -> DateTime<Utc> {
        self.enqueued_at
    }

    pub fn dequeued_at(&self) -> Option<DateTime<Utc>> {
        self.timings.lock().dequeued_at
    }

    pub fn renewed_at(&self) -> Option<DateTime<Utc>> {
        self.timings.lock().renewed_at
    }

    /// Dequeue attempts so far; incremented at each dequeue.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Acquire)
    }

    /// Time between dequeue and the terminal transition.
    pub fn processing_time(&self) -> Option<Duration> {
        self.timings.lock().processing_time
    }

    /// Time between enqueue and completion.
    pub fn total_time(&self) -> Option<Duration> {
        self.timings.lock().total_time
    }

    pub fn is_completed(&self) -> bool {
        self.settled.load(Ordering::Acquire) == SETTLED_COMPLETED
    }

    pub fn is_abandoned(&self) -> bool {
        self.settled.load(Ordering::Acquire) == SETTLED_ABANDONED
    }

    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire) != SETTLED_NONE
    }

    /// Record a dequeue: bump attempts and stamp the lease instants.
    pub(crate) fn record_dequeue(&self, now: DateTime<Utc>) {
        self.attempts.fetch_add(1, Ordering::AcqRel);
        let mut timings = self.timings.lock();
        timings.dequeued_at = Some(now);
        timings.renewed_at = Some(now);
    }

    /// Record a lease renewal; the lease deadline becomes
    /// `renewed_at + work_item_timeout`.
    pub(crate) fn record_renewal(&self, now: DateTime<Utc>) {
        self.timings.lock().renewed_at = Some(now);
    }

    /// Claim the terminal transition. Exactly one caller wins; everyone else
    /// sees `AlreadySettled`.
    pub(crate) fn try_settle(&self, settlement: Settlement) -> Result<()> {
        let target = match settlement {
            Settlement::Completed => SETTLED_COMPLETED,
            Settlement::Abandoned => SETTLED_ABANDONED,
        };
        self.settled
            .compare_exchange(SETTLED_NONE, target, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| Error::already_settled(self.id.clone()))
    }

    /// Roll back a terminal claim that could not be carried out.
    pub(crate) fn clear_settled(&self) {
        self.settled.store(SETTLED_NONE, Ordering::Release);
    }

    /// Stamp terminal durations.
    pub(crate) fn finalize(&self, now: DateTime<Utc>, completed: bool) {
        let mut timings = self.timings.lock();
        if let Some(dequeued_at) = timings.dequeued_at {
            timings.processing_time = (now - dequeued_at).to_std().ok();
        }
        if completed {
            timings.total_time = (now - self.enqueued_at).to_std().ok();
        }
    }

    /// Prepare the entry to re-enter the pending queue: restore the ingress
    /// payload and clear the terminal flag.
    pub(crate) fn reset_for_retry(&self) {
        *self.value.lock() = self.original_value.clone();
        self.settled.store(SETTLED_NONE, Ordering::Release);
    }

    pub(crate) fn set_span(&self, span: tracing::Span) {
        *self.span.lock() = Some(span);
    }

    pub(crate) fn take_span(&self) -> Option<tracing::Span> {
        self.span.lock().take()
    }

    pub(crate) fn processing_span(&self) -> Option<tracing::Span> {
        self.span.lock().clone()
    }
}

impl<T: Clone> std::fmt::Debug for QueueEntry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueEntry")
            .field("id", &self.id)
            .field("correlation_id", &self.correlation_id)
            .field("attempts", &self.attempts())
            .field("is_completed", &self.is_completed())
            .field("is_abandoned", &self.is_abandoned())
            .finish()
    }
}
