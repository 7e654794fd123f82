//! Image sinks used when extracting
//!
//! Extracted images are never written into the restored tree; each unique
//! digest is handed once to an [`ImageSink`].

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

/// Failure reported by an image sink
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct SinkError {
    pub message: String,
}

impl SinkError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Consumer of extracted images (a runtime, a local store, ...)
#[async_trait]
pub trait ImageSink: Send + Sync {
    async fn load(&self, digest: &str, blob: &[u8]) -> Result<(), SinkError>;
}

/// Sink that discards every image
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

#[async_trait]
impl ImageSink for NullSink {
    async fn load(&self, digest: &str, blob: &[u8]) -> Result<(), SinkError> {
        tracing::debug!(digest, size = blob.len(), "discarding image");
        Ok(())
    }
}

/// Sink writing each image to `<dir>/<algorithm>-<hex>.tar`
///
/// OCI layout tarballs written here can be loaded with `podman load` or
/// `docker load`.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Target file for a digest
    pub fn path_for(&self, digest: &str) -> Result<PathBuf, SinkError> {
        let (algorithm, hex) = digest
            .split_once(':')
            .ok_or_else(|| SinkError::new(format!("invalid digest {}", digest)))?;
        let valid = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric());
        if !valid(algorithm) || !valid(hex) {
            return Err(SinkError::new(format!("invalid digest {}", digest)));
        }
        Ok(self.dir.join(format!("{}-{}.tar", algorithm, hex)))
    }
}

#[async_trait]
impl ImageSink for DirectorySink {
    async fn load(&self, digest: &str, blob: &[u8]) -> Result<(), SinkError> {
        let path = self.path_for(digest)?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| SinkError::new(format!("{}: {}", self.dir.display(), e)))?;
        tokio::fs::write(&path, blob)
            .await
            .map_err(|e| SinkError::new(format!("{}: {}", path.display(), e)))?;
        tracing::info!(digest, path = %path.display(), "image written");
        Ok(())
    }
}
