//! Unified error types for conveyor using thiserror.
//!
//! Terminal engine-state errors (`AlreadySettled`, `NotLeased`) are surfaced
//! to the caller; transient operational errors are recovered locally by the
//! resilience policy; `Canceled` is surfaced without error-level logging.

use std::time::Duration;
use thiserror::Error;

/// The unified error type for conveyor operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("Entry {entry_id} was already completed or abandoned")]
    AlreadySettled { entry_id: String },

    #[error("Entry {entry_id} is not currently leased")]
    NotLeased { entry_id: String },

    #[error("Operation canceled")]
    Canceled,

    #[error("Operation timed out after {elapsed:?}")]
    Timeout { elapsed: Duration },

    #[error("Circuit breaker is open")]
    BrokenCircuit,

    #[error("Handler failed: {message}")]
    HandlerFailed {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Backend error: {message}")]
    Backend {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Storage error: {message}")]
    Storage {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("Serialization error: {message}")]
    Serialization { message: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias used across all conveyor crates
pub type Result<T> = std::result::Result<T, Error>;

/// Discriminant of [`Error`], used by retry policies to classify failures
/// without inspecting payload fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    AlreadySettled,
    NotLeased,
    Canceled,
    Timeout,
    BrokenCircuit,
    HandlerFailed,
    Backend,
    Storage,
    FileNotFound,
    Serialization,
    Other,
}

impl Error {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn already_settled(entry_id: impl Into<String>) -> Self {
        Self::AlreadySettled {
            entry_id: entry_id.into(),
        }
    }

    pub fn not_leased(entry_id: impl Into<String>) -> Self {
        Self::NotLeased {
            entry_id: entry_id.into(),
        }
    }

    pub fn handler_failed(message: impl Into<String>) -> Self {
        Self::HandlerFailed {
            message: message.into(),
            source: None,
        }
    }

    pub fn handler_failed_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::HandlerFailed {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
            source: None,
        }
    }

    pub fn backend_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Backend {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// The kind of this error, for retry classification.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Error::AlreadySettled { .. } => ErrorKind::AlreadySettled,
            Error::NotLeased { .. } => ErrorKind::NotLeased,
            Error::Canceled => ErrorKind::Canceled,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::BrokenCircuit => ErrorKind::BrokenCircuit,
            Error::HandlerFailed { .. } => ErrorKind::HandlerFailed,
            Error::Backend { .. } => ErrorKind::Backend,
            Error::Storage { .. } => ErrorKind::Storage,
            Error::FileNotFound { .. } => ErrorKind::FileNotFound,
            Error::Serialization { .. } => ErrorKind::Serialization,
            Error::Other(_) => ErrorKind::Other,
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Error::Canceled)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization {
            message: e.to_string(),
        }
    }
}
