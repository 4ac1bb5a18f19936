//! Behavior pipeline.
//!
//! A behavior implements a cross-cutting concern by subscribing to the
//! queue's lifecycle events. Attachment hands back a handle bundling the
//! subscriptions (and any timers); dropping the handle detaches everything.

use crate::events::EventSubscription;
use crate::queue::{QueueEvents, QueueStats};
use crate::timer::ScheduledTimer;
use conveyor_core::Clock;
use std::sync::Arc;

/// Everything a behavior can reach at attach time.
pub struct AttachContext<T: Clone + Send + Sync + 'static> {
    pub queue_name: String,
    pub queue_id: String,
    pub events: Arc<QueueEvents<T>>,
    pub clock: Arc<dyn Clock>,
    stats: Arc<dyn Fn() -> QueueStats + Send + Sync>,
}

impl<T: Clone + Send + Sync + 'static> AttachContext<T> {
    pub(crate) fn new(
        queue_name: String,
        queue_id: String,
        events: Arc<QueueEvents<T>>,
        clock: Arc<dyn Clock>,
        stats: Arc<dyn Fn() -> QueueStats + Send + Sync>,
    ) -> Self {
        Self {
            queue_name,
            queue_id,
            events,
            clock,
            stats,
        }
    }

    /// Snapshot of the queue's statistics.
    pub fn stats(&self) -> QueueStats {
        (self.stats)()
    }

    /// A clonable accessor for use inside long-lived tasks.
    pub fn stats_fn(&self) -> Arc<dyn Fn() -> QueueStats + Send + Sync> {
        self.stats.clone()
    }
}

/// Owns a behavior's event subscriptions and timers; dropping detaches.
#[derive(Default)]
pub struct BehaviorHandle {
    subscriptions: Vec<EventSubscription>,
    timers: Vec<ScheduledTimer>,
}

impl BehaviorHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscription(mut self, subscription: EventSubscription) -> Self {
        self.subscriptions.push(subscription);
        self
    }

    pub fn timer(mut self, timer: ScheduledTimer) -> Self {
        self.timers.push(timer);
        self
    }

    /// Detach all subscriptions and cancel all timers.
    pub fn detach(self) {}
}

impl std::fmt::Debug for BehaviorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BehaviorHandle")
            .field("subscriptions", &self.subscriptions.len())
            .field("timers", &self.timers.len())
            .finish()
    }
}

/// A middleware that subscribes to queue lifecycle events.
pub trait QueueBehavior<T: Clone + Send + Sync + 'static>: Send + Sync {
    fn name(&self) -> &str;

    /// Subscribe to the events this behavior cares about.
    fn attach(&self, ctx: &AttachContext<T>) -> BehaviorHandle;
}
