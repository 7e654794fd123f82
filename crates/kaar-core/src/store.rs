//! Content-addressed image store
//!
//! Maps normalized image references to digests and keeps exactly one blob
//! per digest. Each normalized reference owns a `OnceCell`, so concurrent
//! resolutions of equivalent references share a single fetch; the blob map
//! insert is a single locked check-then-insert keyed by digest.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use thiserror::Error;
use tokio::sync::OnceCell;

use crate::cancel::CancelToken;
use crate::config::KaarConfig;
use crate::error::{KaarError, Result};
use crate::format::is_storable_digest;
use crate::reference::ImageReference;

/// Failure reported by an image source
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct SourceError {
    pub message: String,
}

impl SourceError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Image content as handed over by a source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedImage {
    /// Content digest (`sha256:<hex>`)
    pub digest: String,
    /// Serialized image (manifest, config and layers)
    pub blob: Vec<u8>,
}

/// Where images come from when packing
///
/// This is the only suspending operation of the packing pipeline.
#[async_trait]
pub trait ImageSource: Send + Sync {
    async fn fetch(
        &self,
        reference: &ImageReference,
    ) -> std::result::Result<FetchedImage, SourceError>;
}

/// Source that refuses every fetch, for fully offline packing
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineSource;

#[async_trait]
impl ImageSource for OfflineSource {
    async fn fetch(
        &self,
        reference: &ImageReference,
    ) -> std::result::Result<FetchedImage, SourceError> {
        Err(SourceError::new(format!(
            "{} is not available offline",
            reference
        )))
    }
}

/// One embedded image, stored once per digest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageBlob {
    pub digest: String,
    /// Normalized references that resolved to this digest
    pub references: BTreeSet<String>,
    pub data: Arc<Vec<u8>>,
}

impl ImageBlob {
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Outcome of resolving one raw reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub raw: String,
    /// Normalized form, `None` when the reference did not parse
    pub normalized: Option<String>,
    /// Digest on success, message on failure
    pub outcome: std::result::Result<String, String>,
}

type Cached = std::result::Result<String, String>;

/// Deduplicating, concurrency-safe image cache
pub struct ImageStore {
    source: Arc<dyn ImageSource>,
    default_registry: String,
    fetch_timeout: Option<Duration>,
    fetch_concurrency: usize,
    cancel: CancelToken,
    resolutions: Mutex<HashMap<String, Arc<OnceCell<Cached>>>>,
    blobs: Mutex<BTreeMap<String, ImageBlob>>,
    fetches: AtomicUsize,
}

impl ImageStore {
    pub fn new(source: Arc<dyn ImageSource>, config: &KaarConfig, cancel: CancelToken) -> Self {
        Self {
            source,
            default_registry: config.default_registry.clone(),
            fetch_timeout: config.fetch_timeout,
            fetch_concurrency: config.fetch_concurrency.max(1),
            cancel,
            resolutions: Mutex::new(HashMap::new()),
            blobs: Mutex::new(BTreeMap::new()),
            fetches: AtomicUsize::new(0),
        }
    }

    /// Resolve a raw reference to a digest, fetching at most once per
    /// normalized reference
    ///
    /// Only cancellation is returned as an error; fetch failures are part of
    /// the [`Resolution`].
    pub async fn resolve(&self, raw: &str) -> Result<Resolution> {
        let reference = match ImageReference::parse_with_registry(raw, &self.default_registry) {
            Ok(reference) => reference,
            Err(message) => {
                return Ok(Resolution {
                    raw: raw.to_string(),
                    normalized: None,
                    outcome: Err(message),
                });
            }
        };
        let normalized = reference.normalized();

        let cell = {
            let mut resolutions = self
                .resolutions
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            resolutions.entry(normalized.clone()).or_default().clone()
        };

        let cached = cell
            .get_or_try_init(|| self.fetch_and_store(&reference))
            .await?;

        Ok(Resolution {
            raw: raw.to_string(),
            normalized: Some(normalized),
            outcome: cached.clone(),
        })
    }

    /// Resolve many references on a bounded pool, in input order
    pub async fn resolve_all<I>(&self, references: I) -> Result<Vec<Resolution>>
    where
        I: IntoIterator<Item = String>,
    {
        let results: Vec<Result<Resolution>> = stream::iter(references)
            .map(|raw| async move { self.resolve(&raw).await })
            .buffered(self.fetch_concurrency)
            .collect()
            .await;
        results.into_iter().collect()
    }

    async fn fetch_and_store(&self, reference: &ImageReference) -> Result<Cached> {
        if self.cancel.is_cancelled() {
            return Err(KaarError::Cancelled);
        }
        self.fetches.fetch_add(1, Ordering::SeqCst);
        tracing::info!(reference = %reference, "fetching image");

        let fetch = async {
            match self.fetch_timeout {
                Some(limit) => tokio::time::timeout(limit, self.source.fetch(reference))
                    .await
                    .unwrap_or_else(|_| {
                        Err(SourceError::new(format!("fetch timed out after {:?}", limit)))
                    }),
                None => self.source.fetch(reference).await,
            }
        };

        let fetched = tokio::select! {
            result = fetch => result,
            _ = self.cancel.cancelled() => return Err(KaarError::Cancelled),
        };

        match fetched {
            Ok(image) if !is_storable_digest(&image.digest) => {
                tracing::warn!(
                    reference = %reference,
                    digest = %image.digest,
                    "source returned an invalid digest"
                );
                Ok(Err(format!(
                    "image source returned invalid digest '{}'",
                    image.digest
                )))
            }
            Ok(image) => {
                let digest = image.digest.clone();
                self.insert_blob(image, reference.normalized());
                tracing::debug!(reference = %reference, digest = %digest, "image resolved");
                Ok(Ok(digest))
            }
            Err(err) => {
                tracing::warn!(reference = %reference, error = %err, "unable to fetch image");
                Ok(Err(err.message))
            }
        }
    }

    /// Store a blob unless its digest is already present
    fn insert_blob(&self, image: FetchedImage, reference: String) {
        let mut blobs = self.blobs.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = blobs.get(&image.digest) {
            if existing.data.as_slice() != image.blob.as_slice() {
                tracing::warn!(
                    reference = %reference,
                    digest = %image.digest,
                    "source returned different bytes for a stored digest, keeping the first"
                );
            }
        }
        let blob = blobs
            .entry(image.digest.clone())
            .or_insert_with(|| ImageBlob {
                digest: image.digest,
                references: BTreeSet::new(),
                data: Arc::new(image.blob),
            });
        blob.references.insert(reference);
    }

    /// Number of fetches issued to the source
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn blob_count(&self) -> usize {
        self.blobs.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Hand over every stored blob, ordered by digest
    pub fn into_blobs(self) -> BTreeMap<String, ImageBlob> {
        self.blobs.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}
