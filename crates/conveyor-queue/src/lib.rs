//! # Conveyor Queue
//!
//! In-process work queue with at-least-once delivery to a pool of worker
//! routines: lease-based ownership, bounded retries with backoff,
//! dead-lettering, delayed delivery, deduplication, and observable lifecycle
//! events.
//!
//! ```no_run
//! use conveyor_queue::{worker_handler, InMemoryQueue, Queue, QueueOptions, WorkerOptions};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> conveyor_core::Result<()> {
//! let queue: InMemoryQueue<String> = InMemoryQueue::new(QueueOptions::new("emails"));
//! queue.enqueue("hello".to_string()).await?;
//!
//! queue
//!     .start_working(
//!         worker_handler(|entry, _token| async move {
//!             println!("processing {}", entry.value());
//!             Ok(())
//!         }),
//!         WorkerOptions {
//!             auto_complete: true,
//!             ..Default::default()
//!         },
//!         CancellationToken::new(),
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod behavior;
pub mod behaviors;
pub mod entry;
pub mod events;
pub mod memory;
pub mod queue;
pub mod timer;

mod worker;

pub use behavior::{AttachContext, BehaviorHandle, QueueBehavior};
pub use behaviors::{DeduplicationBehavior, MetricsBehavior, MetricsBehaviorOptions, UniqueIdentifier};
pub use entry::QueueEntry;
pub use events::{AsyncEvent, Cancelable, CancelableEvent, EventSubscription};
pub use memory::InMemoryQueue;
pub use queue::{
    worker_handler, EnqueueOptions, EnqueuingArgs, EntryEventArgs, Queue, QueueEvents,
    QueueOptions, QueueStats, WorkerHandler, WorkerOptions,
};
pub use timer::ScheduledTimer;
