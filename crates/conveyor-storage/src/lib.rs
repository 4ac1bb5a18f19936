//! # Conveyor Storage
//!
//! File storage contract shared by queue collaborators that spill payloads or
//! artifacts to blob storage, plus the local-filesystem implementation.

pub mod local;

pub use local::LocalFileStorage;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use conveyor_core::Result;

/// Metadata for a stored file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Path relative to the storage root, platform-native separators.
    pub path: String,
    pub size: u64,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

/// File storage contract.
///
/// Paths are resolved against an implementation root; escaping the root
/// (`..`) and absolute inputs are rejected with `InvalidArgument`.
#[async_trait]
pub trait FileStorage: Send + Sync {
    /// Read the full contents of a file.
    async fn get_stream(&self, path: &str) -> Result<Bytes>;

    /// Metadata for a file; `FileNotFound` if absent.
    async fn get_info(&self, path: &str) -> Result<FileInfo>;

    async fn exists(&self, path: &str) -> Result<bool>;

    /// Write `content` to `path`, creating intermediate directories.
    async fn save(&self, path: &str, content: Bytes) -> Result<()>;

    /// Move a file. Creates missing intermediate directories of the target
    /// and is serialized against concurrent rename/copy/delete.
    async fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// Copy a file, with the same directory and serialization guarantees as
    /// [`rename`](Self::rename).
    async fn copy(&self, from: &str, to: &str) -> Result<()>;

    /// Delete a file; returns `false` if it did not exist. Serialized
    /// against concurrent rename/copy.
    async fn delete(&self, path: &str) -> Result<bool>;

    /// List files matching a glob-style pattern (`*`, `?`), skipping `skip`
    /// entries and returning at most `limit`.
    async fn list(&self, pattern: Option<&str>, skip: usize, limit: usize) -> Result<Vec<FileInfo>>;
}
