//! End-to-end queue scenarios: round trips, retries with backoff,
//! dead-lettering, lease timeouts, delayed delivery, and deduplication.

use conveyor_cache::InMemoryCacheClient;
use conveyor_core::{Error, InMemoryMetricsClient};
use conveyor_queue::{
    worker_handler, DeduplicationBehavior, InMemoryQueue, MetricsBehavior, Queue, QueueOptions,
    QueueStats, UniqueIdentifier, WorkerOptions,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

async fn wait_until<F>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

async fn wait_for_stats<T, F>(queue: &InMemoryQueue<T>, mut predicate: F, timeout: Duration) -> QueueStats
where
    T: Clone + Send + Sync + 'static,
    F: FnMut(&QueueStats) -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        let stats = queue.get_stats().await;
        if predicate(&stats) || Instant::now() >= deadline {
            return stats;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn round_trip_preserves_fifo_order() {
    let queue: InMemoryQueue<String> = InMemoryQueue::new(
        QueueOptions::new("roundtrip")
            .retries(2)
            .retry_delay(Duration::ZERO),
    );

    for payload in ["A", "B", "C"] {
        let id = queue.enqueue(payload.to_string()).await.unwrap();
        assert!(id.is_some());
    }

    let mut order = Vec::new();
    for _ in 0..3 {
        let entry = queue
            .dequeue(Some(Duration::from_millis(200)))
            .await
            .unwrap()
            .unwrap();
        order.push(entry.value());
        queue.complete(&entry).await.unwrap();
    }
    assert_eq!(order, vec!["A", "B", "C"]);

    let stats = queue.get_stats().await;
    assert_eq!(stats.enqueued, 3);
    assert_eq!(stats.dequeued, 3);
    assert_eq!(stats.completed, 3);
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.leased, 0);
    assert_eq!(stats.dead_letter, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn retry_with_backoff_then_success() {
    init_tracing();
    let queue: InMemoryQueue<String> = InMemoryQueue::new(
        QueueOptions::new("retry")
            .retries(2)
            .retry_delay(Duration::from_millis(10))
            .retry_multipliers(vec![1, 3, 5, 10]),
    );

    let invocations: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));
    let final_attempts = Arc::new(Mutex::new(0u32));

    let handler = {
        let invocations = invocations.clone();
        let final_attempts = final_attempts.clone();
        worker_handler(move |entry, _token| {
            let invocations = invocations.clone();
            let final_attempts = final_attempts.clone();
            async move {
                invocations.lock().push(Instant::now());
                *final_attempts.lock() = entry.attempts();
                if entry.attempts() < 3 {
                    Err(Error::handler_failed("boom"))
                } else {
                    Ok(())
                }
            }
        })
    };

    queue
        .start_working(
            handler,
            WorkerOptions {
                auto_complete: true,
                worker_count: 1,
            },
            CancellationToken::new(),
        )
        .await
        .unwrap();

    queue.enqueue("flaky".to_string()).await.unwrap();

    let stats = wait_for_stats(&queue, |s| s.completed == 1, Duration::from_secs(5)).await;
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.abandoned, 2);
    assert_eq!(stats.worker_errors, 2);
    assert_eq!(stats.dead_letter, 0);
    assert_eq!(*final_attempts.lock(), 3);

    let times = invocations.lock().clone();
    assert_eq!(times.len(), 3);
    // delay_i = base × multipliers[attempts−1]: 10 ms, then 30 ms.
    assert!(times[1] - times[0] >= Duration::from_millis(10));
    assert!(times[2] - times[1] >= Duration::from_millis(30));

    queue.dispose().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exhausted_retries_dead_letter_the_entry() {
    init_tracing();
    let queue: InMemoryQueue<String> = InMemoryQueue::new(
        QueueOptions::new("deadletter")
            .retries(1)
            .retry_delay(Duration::ZERO),
    );

    queue
        .start_working(
            worker_handler(|_entry, _token| async { Err(Error::handler_failed("always")) }),
            WorkerOptions::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    queue.enqueue("poison".to_string()).await.unwrap();

    let stats = wait_for_stats(&queue, |s| s.dead_letter == 1, Duration::from_secs(5)).await;
    assert_eq!(stats.dead_letter, 1);
    assert_eq!(stats.abandoned, 2);
    assert_eq!(stats.completed, 0);

    let items = queue.get_dead_letter_items().await.unwrap();
    assert_eq!(items, vec!["poison".to_string()]);

    queue.dispose().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn expired_lease_is_abandoned_by_maintenance() {
    init_tracing();
    let queue: InMemoryQueue<String> = InMemoryQueue::new(
        QueueOptions::new("leases")
            .retries(2)
            .retry_delay(Duration::ZERO)
            .work_item_timeout(Duration::from_millis(50)),
    );

    queue.enqueue("slow".to_string()).await.unwrap();
    let entry = queue
        .dequeue(Some(Duration::from_millis(200)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.attempts(), 1);

    // Hold the lease past the timeout without renewing or completing.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let stats = wait_for_stats(&queue, |s| s.lease_timeouts == 1, Duration::from_secs(5)).await;
    assert_eq!(stats.lease_timeouts, 1);
    assert_eq!(stats.abandoned, 1);

    let retried = queue
        .dequeue(Some(Duration::from_millis(500)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(retried.attempts(), 2);

    queue.dispose().await;
}

#[tokio::test]
async fn delivery_delay_defers_availability() {
    let queue: InMemoryQueue<String> =
        InMemoryQueue::new(QueueOptions::new("delayed").retries(2));

    queue
        .enqueue_with_options(
            "later".to_string(),
            conveyor_queue::EnqueueOptions::new().delivery_delay(Duration::from_millis(100)),
        )
        .await
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

#[derive(Debug, Clone, PartialEq)]
struct Notification {
    dedup_key: String,
    body: String,
}

impl UniqueIdentifier for Notification {
    fn unique_id(&self) -> Option<String> {
        Some(self.dedup_key.clone())
    }
}

#[tokio::test]
async fn duplicate_enqueue_is_rejected() {
    let cache = Arc::new(InMemoryCacheClient::new());
    let queue: InMemoryQueue<Notification> = InMemoryQueue::new(
        QueueOptions::new("dedup").behavior(Arc::new(DeduplicationBehavior::with_ttl(
            cache,
            Duration::from_secs(1),
        ))),
    );

    let enqueued_events = Arc::new(Mutex::new(0u32));
    let _subscription = {
        let enqueued_events = enqueued_events.clone();
        queue.events().enqueued.add_handler(move |_args| {
            let enqueued_events = enqueued_events.clone();
            async move {
                *enqueued_events.lock() += 1;
            }
        })
    };

    let first = queue
        .enqueue(Notification {
            dedup_key: "n-1".into(),
            body: "first".into(),
        })
        .await
        .unwrap();
    assert!(first.is_some());

    tokio::time::sleep(Duration::from_millis(100)).await;

    let second = queue
        .enqueue(Notification {
            dedup_key: "n-1".into(),
            body: "second".into(),
        })
        .await
        .unwrap();
    assert!(second.is_none());

    assert_eq!(*enqueued_events.lock(), 1);
    assert_eq!(queue.get_stats().await.enqueued, 1);

    // Dequeueing releases the identifier for legitimate re-enqueues.
    let entry = queue
        .dequeue(Some(Duration::from_millis(200)))
        .await
        .unwrap()
        .unwrap();
    queue.complete(&entry).await.unwrap();

    let third = queue
        .enqueue(Notification {
            dedup_key: "n-1".into(),
            body: "third".into(),
        })
        .await
        .unwrap();
    assert!(third.is_some());
}

#[tokio::test]
async fn lifecycle_events_fire_in_transition_order() {
    let queue: InMemoryQueue<String> =
        InMemoryQueue::new(QueueOptions::new("events").retries(2));
    let events = queue.events();

    let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let subscriptions = vec![
        {
            let log = log.clone();
            events.enqueued.add_handler(move |_| {
                let log = log.clone();
                async move { log.lock().push("enqueued") }
            })
        },
        {
            let log = log.clone();
            events.lock_renewed.add_handler(move |_| {
                let log = log.clone();
                async move { log.lock().push("lock_renewed") }
            })
        },
        {
            let log = log.clone();
            events.dequeued.add_handler(move |_| {
                let log = log.clone();
                async move { log.lock().push("dequeued") }
            })
        },
        {
            let log = log.clone();
            events.completed.add_handler(move |_| {
                let log = log.clone();
                async move { log.lock().push("completed") }
            })
        },
    ];

    queue.enqueue("x".to_string()).await.unwrap();
    let entry = queue
        .dequeue(Some(Duration::from_millis(200)))
        .await
        .unwrap()
        .unwrap();
    queue.renew_lock(&entry).await.unwrap();
    queue.complete(&entry).await.unwrap();

    assert_eq!(
        *log.lock(),
        vec!["enqueued", "lock_renewed", "dequeued", "lock_renewed", "completed"]
    );
    drop(subscriptions);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_workers_never_share_an_entry() {
    init_tracing();
    let queue: InMemoryQueue<u32> = InMemoryQueue::new(
        QueueOptions::new("pool")
            .retries(0)
            .retry_delay(Duration::ZERO),
    );

    let seen: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
    let handler = {
        let seen = seen.clone();
        worker_handler(move |entry, _token| {
            let seen = seen.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                seen.lock().push(entry.value());
                Ok(())
            }
        })
    };

    queue
        .start_working(
            handler,
            WorkerOptions {
                auto_complete: true,
                worker_count: 3,
            },
            CancellationToken::new(),
        )
        .await
        .unwrap();

    for i in 0..20u32 {
        queue.enqueue(i).await.unwrap();
    }

    let stats = wait_for_stats(&queue, |s| s.completed == 20, Duration::from_secs(10)).await;
    assert_eq!(stats.completed, 20);

    let mut processed = seen.lock().clone();
    processed.sort_unstable();
    processed.dedup();
    assert_eq!(processed.len(), 20);

    queue.dispose().await;
}

#[tokio::test]
async fn metrics_behavior_counts_transitions() {
    let metrics = Arc::new(InMemoryMetricsClient::new());
    let queue: InMemoryQueue<String> = InMemoryQueue::new(
        QueueOptions::new("metered")
            .retries(2)
            .retry_delay(Duration::ZERO)
            .behavior(Arc::new(MetricsBehavior::new(metrics.clone()))),
    );

    for payload in ["a", "b"] {
        queue.enqueue(payload.to_string()).await.unwrap();
    }
    let first = queue
        .dequeue(Some(Duration::from_millis(200)))
        .await
        .unwrap()
        .unwrap();
    queue.complete(&first).await.unwrap();
    let second = queue
        .dequeue(Some(Duration::from_millis(200)))
        .await
        .unwrap()
        .unwrap();
    queue.abandon(&second).await.unwrap();

    assert!(
        wait_until(
            || {
                metrics.get_counter("queue.string.enqueued") == 2
                    && metrics.get_counter("queue.string.dequeued") == 2
                    && metrics.get_counter("queue.string.completed") == 1
                    && metrics.get_counter("queue.string.abandoned") == 1
            },
            Duration::from_secs(2),
        )
        .await
    );
    assert!(metrics.get_timing("queue.string.queuetime").is_some());
    assert!(metrics.get_timing("queue.string.processtime").is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stopping_the_worker_token_idles_the_pool() {
    let queue: InMemoryQueue<String> =
        InMemoryQueue::new(QueueOptions::new("stoppable").retries(0));
    let token = CancellationToken::new();

    let processed = Arc::new(Mutex::new(0u32));
    let handler = {
        let processed = processed.clone();
        worker_handler(move |_entry, _token| {
            let processed = processed.clone();
            async move {
                *processed.lock() += 1;
                Ok(())
            }
        })
    };

    queue
        .start_working(
            handler,
            WorkerOptions {
                auto_complete: true,
                worker_count: 1,
            },
            token.clone(),
        )
        .await
        .unwrap();

    queue.enqueue("one".to_string()).await.unwrap();
    assert!(wait_until(|| *processed.lock() == 1, Duration::from_secs(2)).await);

    token.cancel();
    tokio::time::sleep(Duration::from_millis(100)).await;

    queue.enqueue("two".to_string()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(*processed.lock(), 1);
    assert_eq!(queue.get_stats().await.pending, 1);

    queue.dispose().await;
}
