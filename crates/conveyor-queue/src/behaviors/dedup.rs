//! Deduplication behavior.
//!
//! Rejects re-enqueues of payloads whose unique identifier was seen within
//! the TTL window. The identifier is released again when the entry is
//! dequeued, so a legitimate later enqueue goes through.

use crate::behavior::{AttachContext, BehaviorHandle, QueueBehavior};
use crate::events::Cancelable;
use crate::queue::{EnqueuingArgs, EntryEventArgs};
use conveyor_cache::CacheClient;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

/// Payloads that carry a deduplication identifier.
pub trait UniqueIdentifier {
    /// Identifier used for deduplication; `None` opts the payload out.
    fn unique_id(&self) -> Option<String>;
}

/// Cancels enqueues of recently-seen payloads.
pub struct DeduplicationBehavior<T> {
    cache: Arc<dyn CacheClient>,
    ttl: Duration,
    _payload: PhantomData<fn() -> T>,
}

impl<T> DeduplicationBehavior<T>
where
    T: Clone + Send + Sync + UniqueIdentifier + 'static,
{
    pub fn new(cache: Arc<dyn CacheClient>) -> Self {
        Self::with_ttl(cache, Duration::from_secs(600))
    }

    pub fn with_ttl(cache: Arc<dyn CacheClient>, ttl: Duration) -> Self {
        Self {
            cache,
            ttl,
            _payload: PhantomData,
        }
    }
}

impl<T> QueueBehavior<T> for DeduplicationBehavior<T>
where
    T: Clone + Send + Sync + UniqueIdentifier + 'static,
{
    fn name(&self) -> &str {
        "deduplication"
    }

    fn attach(&self, ctx: &AttachContext<T>) -> BehaviorHandle {
        let mut handle = BehaviorHandle::new();

        {
            let cache = self.cache.clone();
            let ttl = self.ttl;
            handle = handle.subscription(ctx.events.enqueuing.add_handler(
                move |args: Arc<EnqueuingArgs<T>>| {
                    let cache = cache.clone();
                    async move {
                        let Some(key) = args.value().unique_id() else {
                            return;
                        };
                        match cache.add(&key, ttl).await {
                            Ok(true) => {}
                            Ok(false) => {
                                tracing::debug!(key = %key, "duplicate entry rejected");
                                args.cancel();
                            }
                            Err(e) => {
                                // The cache being unavailable must not stall
                                // producers; admit the entry.
                                tracing::warn!(key = %key, error = %e, "dedup cache add failed");
                            }
                        }
                    }
                },
            ));
        }

        {
            let cache = self.cache.clone();
            handle = handle.subscription(ctx.events.dequeued.add_handler(
                move |args: Arc<EntryEventArgs<T>>| {
                    let cache = cache.clone();
                    async move {
                        let Some(key) = args.entry.value().unique_id() else {
                            return;
                        };
                        if let Err(e) = cache.remove(&key).await {
                            tracing::warn!(key = %key, error = %e, "dedup cache remove failed");
                        }
                    }
                },
            ));
        }

        handle
    }
}
