//! Metrics behavior.
//!
//! Emits counters for each lifecycle transition, timers for queue time
//! (enqueue→dequeue) and process time (dequeue→terminal), and periodically
//! samples pending/working/dead-letter gauges through a scheduled timer.

use crate::behavior::{AttachContext, BehaviorHandle, QueueBehavior};
use crate::queue::{short_type_name, EntryEventArgs};
use crate::timer::ScheduledTimer;
use conveyor_core::MetricsClient;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

/// Metrics behavior configuration.
#[derive(Debug, Clone)]
pub struct MetricsBehaviorOptions {
    /// Metric name prefix, e.g. `queue` yields `queue.order.enqueued`.
    pub prefix: String,
    /// Gauge sampling interval.
    pub sampling_interval: Duration,
    /// Gate for the gauge sampling timer.
    pub polling_enabled: bool,
}

impl Default for MetricsBehaviorOptions {
    fn default() -> Self {
        Self {
            prefix: "queue".to_string(),
            sampling_interval: Duration::from_secs(30),
            polling_enabled: true,
        }
    }
}

/// Emits queue metrics through a [`MetricsClient`].
pub struct MetricsBehavior<T> {
    metrics: Arc<dyn MetricsClient>,
    options: MetricsBehaviorOptions,
    _payload: PhantomData<fn() -> T>,
}

impl<T: Clone + Send + Sync + 'static> MetricsBehavior<T> {
    pub fn new(metrics: Arc<dyn MetricsClient>) -> Self {
        Self::with_options(metrics, MetricsBehaviorOptions::default())
    }

    pub fn with_options(metrics: Arc<dyn MetricsClient>, options: MetricsBehaviorOptions) -> Self {
        Self {
            metrics,
            options,
            _payload: PhantomData,
        }
    }

    fn metric_name(&self, suffix: &str) -> String {
        format!("{}.{}.{}", self.options.prefix, short_type_name::<T>(), suffix)
    }
}

impl<T: Clone + Send + Sync + 'static> QueueBehavior<T> for MetricsBehavior<T> {
    fn name(&self) -> &str {
        "metrics"
    }

    fn attach(&self, ctx: &AttachContext<T>) -> BehaviorHandle {
        let mut handle = BehaviorHandle::new();

        let enqueued_name = self.metric_name("enqueued");
        let dequeued_name = self.metric_name("dequeued");
        let completed_name = self.metric_name("completed");
        let abandoned_name = self.metric_name("abandoned");
        let queuetime_name = self.metric_name("queuetime");
        let processtime_name = self.metric_name("processtime");

        {
            let metrics = self.metrics.clone();
            let name = enqueued_name;
            handle = handle.subscription(ctx.events.enqueued.add_handler(
                move |_args: Arc<EntryEventArgs<T>>| {
                    let metrics = metrics.clone();
                    let name = name.clone();
                    async move {
                        metrics.counter(&name, 1);
                    }
                },
            ));
        }

        {
            let metrics = self.metrics.clone();
            let counter_name = dequeued_name;
            let timer_name = queuetime_name;
            handle = handle.subscription(ctx.events.dequeued.add_handler(
                move |args: Arc<EntryEventArgs<T>>| {
                    let metrics = metrics.clone();
                    let counter_name = counter_name.clone();
                    let timer_name = timer_name.clone();
                    async move {
                        metrics.counter(&counter_name, 1);
                        if let Some(dequeued_at) = args.entry.dequeued_at() {
                            if let Ok(queue_time) =
                                (dequeued_at - args.entry.enqueued_at()).to_std()
                            {
                                metrics.timer(&timer_name, queue_time);
                            }
                        }
                    }
                },
            ));
        }

        {
            let metrics = self.metrics.clone();
            let counter_name = completed_name;
            let timer_name = processtime_name.clone();
            handle = handle.subscription(ctx.events.completed.add_handler(
                move |args: Arc<EntryEventArgs<T>>| {
                    let metrics = metrics.clone();
                    let counter_name = counter_name.clone();
                    let timer_name = timer_name.clone();
                    async move {
                        metrics.counter(&counter_name, 1);
                        if let Some(process_time) = args.entry.processing_time() {
                            metrics.timer(&timer_name, process_time);
                        }
                    }
                },
            ));
        }

        {
            let metrics = self.metrics.clone();
            let counter_name = abandoned_name;
            let timer_name = processtime_name;
            handle = handle.subscription(ctx.events.abandoned.add_handler(
                move |args: Arc<EntryEventArgs<T>>| {
                    let metrics = metrics.clone();
                    let counter_name = counter_name.clone();
                    let timer_name = timer_name.clone();
                    async move {
                        metrics.counter(&counter_name, 1);
                        if let Some(process_time) = args.entry.processing_time() {
                            metrics.timer(&timer_name, process_time);
                        }
                    }
                },
            ));
        }

        if self.options.polling_enabled {
            let metrics = self.metrics.clone();
            let stats = ctx.stats_fn();
            let clock = ctx.clock.clone();
            let interval = self.options.sampling_interval;
            let count_name = self.metric_name("count");
            let working_name = self.metric_name("working");
            let deadletter_name = self.metric_name("deadletter");

            let timer = ScheduledTimer::new(ctx.clock.clone(), move || {
                let metrics = metrics.clone();
                let stats = stats.clone();
                let clock = clock.clone();
                let count_name = count_name.clone();
                let working_name = working_name.clone();
                let deadletter_name = deadletter_name.clone();
                async move {
                    let snapshot = stats();
                    metrics.gauge(&count_name, snapshot.pending as f64);
                    metrics.gauge(&working_name, snapshot.leased as f64);
                    metrics.gauge(&deadletter_name, snapshot.dead_letter as f64);
                    Ok(Some(
                        clock.now()
                            + chrono::Duration::from_std(interval)
                                .unwrap_or(chrono::Duration::seconds(30)),
                    ))
                }
            });
            timer.schedule_next(
                ctx.clock.now()
                    + chrono::Duration::from_std(interval).unwrap_or(chrono::Duration::seconds(30)),
            );
            handle = handle.timer(timer);
        }

        handle
    }
}
