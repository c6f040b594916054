//! Blob storage for uploaded PDFs.
//!
//! Keys are always [`crate::model::Document::blob_key_for`] of the document
//! id (`documents/<id>.pdf`); lookups are exact, never by filename.

use crate::error::TranscribeError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), TranscribeError>;

    /// [`TranscribeError::BlobNotFound`] when nothing is stored under `key`.
    async fn get(&self, key: &str) -> Result<Vec<u8>, TranscribeError>;
}

/// Process-local blob store.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop a blob; lets tests simulate a missing upload.
    pub fn remove(&self, key: &str) -> Option<Vec<u8>> {
        self.blobs.lock().ok()?.remove(key)
    }
}

fn poisoned() -> TranscribeError {
    TranscribeError::Storage("blob store lock poisoned".into())
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), TranscribeError> {
        self.blobs
            .lock()
            .map_err(|_| poisoned())?
            .insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, TranscribeError> {
        self.blobs
            .lock()
            .map_err(|_| poisoned())?
            .get(key)
            .cloned()
            .ok_or_else(|| TranscribeError::BlobNotFound {
                key: key.to_string(),
            })
    }
}

/// Blobs as files under a root directory, key = relative path.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Keys are relative paths without `..`, so a key can never escape the root.
    fn path_for(&self, key: &str) -> Result<PathBuf, TranscribeError> {
        let rel = Path::new(key);
        let safe = !key.is_empty()
            && rel
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(TranscribeError::Storage(format!("invalid blob key '{key}'")));
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), TranscribeError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| TranscribeError::Io {
                    path: parent.display().to_string(),
                    source: e,
                })?;
        }
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| TranscribeError::Io {
                path: path.display().to_string(),
                source: e,
            })?;
        debug!("Stored blob {} ({} bytes)", key, bytes.len());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, TranscribeError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(TranscribeError::BlobNotFound {
                key: key.to_string(),
            }),
            Err(e) => Err(TranscribeError::Io {
                path: path.display().to_string(),
                source: e,
            }),
        }
    }
}
