//! Reference behaviors: metrics and deduplication.

pub mod dedup;
pub mod metrics;

pub use dedup::{DeduplicationBehavior, UniqueIdentifier};
pub use metrics::{MetricsBehavior, MetricsBehaviorOptions};
