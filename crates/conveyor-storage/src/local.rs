//! Local filesystem storage backend.

use crate::{FileInfo, FileStorage};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use conveyor_core::{Error, Result};
use std::path::{Component, Path, PathBuf};
use tokio::sync::Mutex;

/// File storage rooted at a local directory.
///
/// All paths are resolved against the root and normalized to the platform
/// separator; inputs may use `/` or `\` interchangeably.
pub struct LocalFileStorage {
    root: PathBuf,
    /// Serializes rename, copy, and delete against each other.
    transfer_lock: Mutex<()>,
}

impl LocalFileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            transfer_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Normalize a relative path and resolve it under the root. Rejects
    /// empty, absolute, and root-escaping inputs.
    fn resolve(&self, path: &str) -> Result<PathBuf> {
        if path.trim().is_empty() {
            return Err(Error::invalid_argument("path must not be empty"));
        }

        let normalized: PathBuf = path
            .split(['/', '\\'])
            .filter(|segment| !segment.is_empty())
            .collect();

        for component in normalized.components() {
            match component {
                Component::Normal(_) => {}
                Component::CurDir => {}
                _ => {
                    return Err(Error::invalid_argument(format!(
                        "path must stay inside the storage root: {}",
                        path
                    )))
                }
            }
        }

        if Path::new(path).is_absolute() {
            return Err(Error::invalid_argument(format!(
                "path must be relative: {}",
                path
            )));
        }

        Ok(self.root.join(normalized))
    }

    fn relative_display(&self, full: &Path) -> String {
        full.strip_prefix(&self.root)
            .unwrap_or(full)
            .to_string_lossy()
            .to_string()
    }

    async fn ensure_parent(&self, full: &Path) -> Result<()> {
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::storage_with_source("failed to create directory", e))?;
        }
        Ok(())
    }

    fn info_from_metadata(&self, full: &Path, metadata: &std::fs::Metadata) -> FileInfo {
        let modified = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        let created = metadata
            .created()
            .map(DateTime::<Utc>::from)
            .unwrap_or(modified);

        FileInfo {
            path: self.relative_display(full),
            size: metadata.len(),
            created,
            modified,
        }
    }

    /// Collect every file under the root, relative paths with `/` separators
    /// for pattern matching.
    async fn walk(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut directories = vec![self.root.clone()];

        while let Some(dir) = directories.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(Error::storage_with_source("failed to list directory", e)),
            };

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| Error::storage_with_source("failed to read directory entry", e))?
            {
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| Error::storage_with_source("failed to stat entry", e))?;
                if file_type.is_dir() {
                    directories.push(entry.path());
                } else if file_type.is_file() {
                    files.push(entry.path());
                }
            }
        }

        files.sort();
        Ok(files)
    }
}

/// Translate a glob-style pattern (`*`, `?`) into an anchored regex over
/// `/`-separated relative paths.
fn pattern_to_regex(pattern: &str) -> Result<regex::Regex> {
    let mut expr = String::with_capacity(pattern.len() * 2 + 2);
    expr.push('^');
    for c in pattern.chars() {
        match c {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            '\\' | '/' => expr.push('/'),
            c => expr.push_str(&regex::escape(&c.to_string())),
        }
    }
    expr.push('$');
    regex::Regex::new(&expr)
        .map_err(|e| Error::invalid_argument(format!("invalid list pattern: {}", e)))
}

#[async_trait]
impl FileStorage for LocalFileStorage {
    async fn get_stream(&self, path: &str) -> Result<Bytes> {
        let full = self.resolve(path)?;
        let content = tokio::fs::read(&full).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::FileNotFound {
                    path: path.to_string(),
                }
            } else {
                Error::storage_with_source("failed to read file", e)
            }
        })?;
        Ok(Bytes::from(content))
    }

    async fn get_info(&self, path: &str) -> Result<FileInfo> {
        let full = self.resolve(path)?;
        let metadata = tokio::fs::metadata(&full).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::FileNotFound {
                    path: path.to_string(),
                }
            } else {
                Error::storage_with_source("failed to stat file", e)
            }
        })?;
        Ok(self.info_from_metadata(&full, &metadata))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let full = self.resolve(path)?;
        Ok(tokio::fs::try_exists(&full).await.unwrap_or(false))
    }

    async fn save(&self, path: &str, content: Bytes) -> Result<()> {
        let full = self.resolve(path)?;
        self.ensure_parent(&full).await?;
        tokio::fs::write(&full, &content)
            .await
            .map_err(|e| Error::storage_with_source("failed to write file", e))?;
        tracing::debug!(path = %path, size = content.len(), "file saved");
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from_full = self.resolve(from)?;
        let to_full = self.resolve(to)?;

        let _guard = self.transfer_lock.lock().await;
        self.ensure_parent(&to_full).await?;
        tokio::fs::rename(&from_full, &to_full).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::FileNotFound {
                    path: from.to_string(),
                }
            } else {
                Error::storage_with_source("failed to rename file", e)
            }
        })?;
        tracing::debug!(from = %from, to = %to, "file renamed");
        Ok(())
    }

    async fn copy(&self, from: &str, to: &str) -> Result<()> {
        let from_full = self.resolve(from)?;
        let to_full = self.resolve(to)?;

        let _guard = self.transfer_lock.lock().await;
        self.ensure_parent(&to_full).await?;
        tokio::fs::copy(&from_full, &to_full).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::FileNotFound {
                    path: from.to_string(),
                }
            } else {
                Error::storage_with_source("failed to copy file", e)
            }
        })?;
        tracing::debug!(from = %from, to = %to, "file copied");
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<bool> {
        let full = self.resolve(path)?;

        let _guard = self.transfer_lock.lock().await;
        match tokio::fs::remove_file(&full).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::storage_with_source("failed to delete file", e)),
        }
    }

    async fn list(&self, pattern: Option<&str>, skip: usize, limit: usize) -> Result<Vec<FileInfo>> {
        let matcher = pattern.map(pattern_to_regex).transpose()?;
        let mut results = Vec::new();

        for full in self.walk().await? {
            let relative = full
                .strip_prefix(&self.root)
                .unwrap_or(&full)
                .components()
                .filter_map(|c| match c {
                    Component::Normal(s) => Some(s.to_string_lossy()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("/");

            if let Some(matcher) = &matcher {
                if !matcher.is_match(&relative) {
                    continue;
                }
            }
            results.push(full);
        }

        let mut infos = Vec::new();
        for full in results.into_iter().skip(skip).take(limit) {
            let metadata = tokio::fs::metadata(&full)
                .await
                .map_err(|e| Error::storage_with_source("failed to stat file", e))?;
            infos.push(self.info_from_metadata(&full, &metadata));
        }

        Ok(infos)
    }
}
