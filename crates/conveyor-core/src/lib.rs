//! # Conveyor Core
//!
//! Contracts shared by every conveyor crate: the unified error type, the
//! injectable clock, id generation, the metrics client seam, and the
//! serializer contract consumed by persistence backends.

pub mod clock;
pub mod error;
pub mod id;
pub mod metrics;
pub mod serializer;

pub use clock::{Clock, SystemClock, TestClock};
pub use error::{Error, ErrorKind, Result};
pub use metrics::{InMemoryMetricsClient, MetricsClient, NullMetricsClient};
pub use serializer::{JsonSerializer, Serializer, SerializerExt};
