//! Async event hub.
//!
//! Two variants back the queue lifecycle events: [`AsyncEvent`] joins all
//! handlers concurrently, [`CancelableEvent`] runs them sequentially in
//! registration order and stops once a handler cancels the operation.

use parking_lot::RwLock;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

type HandlerFn<A> =
    Arc<dyn Fn(Arc<A>) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

type HandlerList<A> = Arc<RwLock<Vec<(u64, HandlerFn<A>)>>>;

/// Disposer for a registered handler; detaches on drop.
pub struct EventSubscription {
    detach: Option<Box<dyn FnOnce() + Send>>,
}

impl EventSubscription {
    fn new<A: Send + Sync + 'static>(handlers: &HandlerList<A>, id: u64) -> Self {
        let weak: Weak<RwLock<Vec<(u64, HandlerFn<A>)>>> = Arc::downgrade(handlers);
        Self {
            detach: Some(Box::new(move || {
                if let Some(handlers) = weak.upgrade() {
                    handlers.write().retain(|(handler_id, _)| *handler_id != id);
                }
            })),
        }
    }

    /// Explicitly detach the handler.
    pub fn detach(mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl std::fmt::Debug for EventSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSubscription").finish()
    }
}

/// Event slot whose handlers run concurrently; `invoke` completes when all
/// handlers complete.
pub struct AsyncEvent<A> {
    handlers: HandlerList<A>,
    next_id: AtomicU64,
}

impl<A: Send + Sync + 'static> AsyncEvent<A> {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(RwLock::new(Vec::new())),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn add_handler<F, Fut>(&self, handler: F) -> EventSubscription
    where
        F: Fn(Arc<A>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handler: HandlerFn<A> = Arc::new(move |args| Box::pin(handler(args)));
        self.handlers.write().push((id, handler));
        EventSubscription::new(&self.handlers, id)
    }

    pub async fn invoke(&self, args: Arc<A>) {
        let handlers: Vec<HandlerFn<A>> = self
            .handlers
            .read()
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();
        futures::future::join_all(handlers.iter().map(|handler| handler(args.clone()))).await;
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }
}

impl<A: Send + Sync + 'static> Default for AsyncEvent<A> {
    fn default() -> Self {
        Self::new()
    }
}

/// Implemented by event args that carry a cancel flag.
pub trait Cancelable {
    fn cancel(&self);
    fn is_canceled(&self) -> bool;
}

/// Event slot whose handlers run sequentially in registration order; a
/// handler that cancels the args stops further invocation.
pub struct CancelableEvent<A> {
    handlers: HandlerList<A>,
    next_id: AtomicU64,
}

impl<A: Cancelable + Send + Sync + 'static> CancelableEvent<A> {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(RwLock::new(Vec::new())),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn add_handler<F, Fut>(&self, handler: F) -> EventSubscription
    where
        F: Fn(Arc<A>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handler: HandlerFn<A> = Arc::new(move |args| Box::pin(handler(args)));
        self.handlers.write().push((id, handler));
        EventSubscription::new(&self.handlers, id)
    }

    /// Invoke handlers in order; returns `true` if the operation was
    /// canceled.
    pub async fn invoke(&self, args: Arc<A>) -> bool {
        if args.is_canceled() {
            return true;
        }

        let handlers: Vec<HandlerFn<A>> = self
            .handlers
            .read()
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();

        for handler in handlers {
            handler(args.clone()).await;
            if args.is_canceled() {
                return true;
            }
        }
        false
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }
}

impl<A: Cancelable + Send + Sync + 'static> Default for CancelableEvent<A> {
    fn default() -> Self {
        Self::new()
    }
}
