//! Worker dispatch loop.
//!
//! Each routine pulls entries from the engine and invokes the user handler.
//! Handler failures abandon the entry through a resilience policy and never
//! terminate the routine.

use crate::memory::QueueInner;
use crate::queue::WorkerHandler;
use conveyor_core::ErrorKind;
use conveyor_resilience::RetryPolicy;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// A token canceled when either `lifetime` or `caller` cancels.
pub(crate) fn linked_token(
    lifetime: &CancellationToken,
    caller: &CancellationToken,
) -> CancellationToken {
    let linked = lifetime.child_token();
    let watcher = linked.clone();
    let caller = caller.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = caller.cancelled() => watcher.cancel(),
            _ = watcher.cancelled() => {}
        }
    });
    linked
}

pub(crate) async fn worker_loop<T: Clone + Send + Sync + 'static>(
    queue: Arc<QueueInner<T>>,
    handler: WorkerHandler<T>,
    auto_complete: bool,
    cancel: CancellationToken,
    index: usize,
) {
    // Terminal-state errors mean the entry was settled elsewhere; retrying a
    // settle cannot succeed.
    let settled_kinds = [ErrorKind::AlreadySettled, ErrorKind::NotLeased];
    let complete_policy = RetryPolicy::builder().unhandled(settled_kinds).build();
    let abandon_policy = RetryPolicy::builder()
        .max_attempts(3)
        .fixed_delay(Duration::ZERO)
        .unhandled(settled_kinds)
        .build();

    let handler_token = linked_token(queue.lifetime(), &cancel);
    tracing::debug!(queue = %queue.queue_id(), worker = index, "queue worker started");

    loop {
        if queue.is_disposed() || cancel.is_cancelled() {
            break;
        }

        let entry = match queue.dequeue_inner(None, Some(&cancel)).await {
            Ok(Some(entry)) => entry,
            Ok(None) => continue,
            Err(e) => {
                if !e.is_canceled() {
                    tracing::error!(queue = %queue.queue_id(), error = %e, "dequeue failed");
                }
                continue;
            }
        };

        let span = entry.processing_span().unwrap_or_else(tracing::Span::none);
        let result = handler(entry.clone(), handler_token.clone())
            .instrument(span)
            .await;

        match result {
            Ok(()) => {
                if auto_complete && !entry.is_settled() && queue.is_leased(entry.id()) {
                    if let Err(e) = complete_policy
                        .run(|| async { queue.complete_entry(&entry).await })
                        .await
                    {
                        if settled_kinds.contains(&e.kind()) {
                            tracing::debug!(entry_id = %entry.id(), error = %e, "auto-complete skipped");
                        } else {
                            tracing::error!(entry_id = %entry.id(), error = %e, "auto-complete failed");
                        }
                    }
                }
            }
            Err(e) => {
                queue.record_worker_error();
                if e.is_canceled() {
                    tracing::debug!(entry_id = %entry.id(), "handler canceled");
                } else {
                    tracing::error!(entry_id = %entry.id(), error = %e, "queue worker handler failed");
                }

                if queue.is_leased(entry.id()) {
                    if let Err(abandon_err) = abandon_policy
                        .run(|| async { queue.abandon_entry(&entry, false).await })
                        .await
                    {
                        if settled_kinds.contains(&abandon_err.kind()) {
                            tracing::debug!(entry_id = %entry.id(), error = %abandon_err, "abandon skipped");
                        } else {
                            tracing::warn!(entry_id = %entry.id(), error = %abandon_err, "abandon failed");
                        }
                    }
                }
            }
        }
    }

    tracing::debug!(queue = %queue.queue_id(), worker = index, "queue worker stopped");
}
