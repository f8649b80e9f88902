//! Object storage for case attachments.
//!
//! A small trait with a local-filesystem backend. Objects live under a
//! configured root at `{case_id}/{millis}-{uuid}.{ext}`; callers never hand
//! in raw paths, they ask [`generate_object_path`] for one. No resumable
//! uploads, chunking, or conflict handling.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::error::StorageError;

pub const FALLBACK_FILE_NAME: &str = "document";

/// Reduce an uploaded filename to a safe basename: strip any directory
/// part, keep alphanumerics plus `. - _` and spaces, collapse an empty
/// result to a default. Prevents path traversal via the filename header.
pub fn sanitize_file_name(raw: &str) -> String {
    let base = raw
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(FALLBACK_FILE_NAME);
    let safe: String = base
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '.' | '-' | '_' | ' '))
        .collect();
    let trimmed = safe.trim().trim_matches('.');
    if trimmed.is_empty() {
        FALLBACK_FILE_NAME.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Unique storage path for an upload, scoped under its case.
pub fn generate_object_path(case_id: Uuid, file_name: &str) -> String {
    let millis = Utc::now().timestamp_millis();
    let unique = Uuid::new_v4();
    match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => {
            format!("{case_id}/{millis}-{unique}.{ext}")
        }
        _ => format!("{case_id}/{millis}-{unique}"),
    }
}

/// Guess a content type from the filename when the upload did not carry one.
pub fn content_type_for(file_name: &str) -> String {
    mime_guess::from_path(file_name)
        .first_or_octet_stream()
        .to_string()
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn put(&self, path: &str, data: &[u8]) -> Result<(), StorageError>;
    async fn read(&self, path: &str) -> Result<Vec<u8>, StorageError>;
    async fn delete(&self, path: &str) -> Result<(), StorageError>;
}

/// Filesystem-backed object storage rooted at one directory.
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve an object path under the root, rejecting absolute paths and
    /// parent-directory components.
    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(path);
        if relative.is_absolute() {
            return Err(StorageError::InvalidPath(path.to_string()));
        }
        let mut resolved = self.root.clone();
        for component in relative.components() {
            match component {
                Component::Normal(segment) => resolved.push(segment),
                Component::CurDir => {}
                _ => return Err(StorageError::InvalidPath(path.to_string())),
            }
        }
        Ok(resolved)
    }
}

#[async_trait]
impl ObjectStorage for LocalStorage {
    async fn put(&self, path: &str, data: &[u8]) -> Result<(), StorageError> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| StorageError::Io {
                    path: path.to_string(),
                    source,
                })?;
        }
        tokio::fs::write(&target, data)
            .await
            .map_err(|source| StorageError::Io {
                path: path.to_string(),
                source,
            })
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let target = self.resolve(path)?;
        match tokio::fs::read(&target).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StorageError::NotFound {
                path: path.to_string(),
            }),
            Err(source) => Err(StorageError::Io {
                path: path.to_string(),
                source,
            }),
        }
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        let target = self.resolve(path)?;
        match tokio::fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            // Already gone; deletion is idempotent.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StorageError::Io {
                path: path.to_string(),
                source,
            }),
        }
    }
}
