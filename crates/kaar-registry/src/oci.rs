//! OCI registry image source
//!
//! Pulls an image's manifest, config and layers with `oci-distribution`
//! and hands it to the image store as a deterministic OCI layout tarball.
//! The registry's manifest digest is the image digest.

use async_trait::async_trait;
use kaar_core::format::sha256_hex;
use kaar_core::{FetchedImage, ImageReference, ImageSource, SourceError};
use oci_distribution::Reference;
use oci_distribution::client::{Client, ClientConfig, ClientProtocol, ImageData};

use crate::credentials::DockerConfig;
use crate::error::{RegistryError, Result};
use crate::layout::{LayoutImage, OCI_MANIFEST_MEDIA_TYPE, build_layout};

/// Layer media types accepted when pulling
pub mod media_types {
    pub const OCI_LAYER: &str = "application/vnd.oci.image.layer.v1.tar";
    pub const OCI_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
    pub const OCI_LAYER_ZSTD: &str = "application/vnd.oci.image.layer.v1.tar+zstd";
    pub const DOCKER_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar";
    pub const DOCKER_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

    pub const ALL: &[&str] = &[
        OCI_LAYER,
        OCI_LAYER_GZIP,
        OCI_LAYER_ZSTD,
        DOCKER_LAYER,
        DOCKER_LAYER_GZIP,
    ];
}

/// Image source backed by OCI registries
pub struct OciImageSource {
    client: Client,
    credentials: DockerConfig,
}

impl OciImageSource {
    pub fn new(credentials: DockerConfig) -> Self {
        Self::with_protocol(credentials, ClientProtocol::Https)
    }

    /// Plain HTTP for the given registries (local test registries)
    pub fn with_insecure(credentials: DockerConfig, registries: Vec<String>) -> Self {
        Self::with_protocol(credentials, ClientProtocol::HttpsExcept(registries))
    }

    fn with_protocol(credentials: DockerConfig, protocol: ClientProtocol) -> Self {
        let config = ClientConfig {
            protocol,
            ..Default::default()
        };
        Self {
            client: Client::new(config),
            credentials,
        }
    }

    /// Source using credentials from the local Docker config
    pub fn from_docker_config() -> Result<Self> {
        Ok(Self::new(DockerConfig::load()?))
    }

    /// Pull an image and serialize it as an OCI layout tarball
    pub async fn pull(&self, reference: &ImageReference) -> Result<FetchedImage> {
        let normalized = reference.normalized();
        let oci_reference = to_oci_reference(reference)?;
        let auth = self.credentials.auth_for(&reference.registry)?;

        tracing::debug!(reference = %normalized, "pulling image");
        let image = self
            .client
            .pull(&oci_reference, &auth, media_types::ALL.to_vec())
            .await
            .map_err(|e| RegistryError::PullFailed {
                reference: normalized.clone(),
                message: e.to_string(),
            })?;

        let fetched = package_image(&normalized, &image)?;
        tracing::info!(
            reference = %normalized,
            digest = %fetched.digest,
            layers = image.layers.len(),
            size = fetched.blob.len(),
            "image pulled"
        );
        Ok(fetched)
    }
}

/// Serialize pulled image data as a layout tarball keyed by manifest digest
///
/// `reference` only names the image in errors; the blob does not depend on it.
pub fn package_image(reference: &str, image: &ImageData) -> Result<FetchedImage> {
    let manifest = image
        .manifest
        .as_ref()
        .ok_or_else(|| RegistryError::MissingManifest {
            reference: reference.to_string(),
        })?;
    // Round-trip through `Value` so map keys serialize in sorted order
    let manifest_bytes = serde_json::to_vec(&serde_json::to_value(manifest)?)?;
    let media_type = manifest
        .media_type
        .clone()
        .unwrap_or_else(|| OCI_MANIFEST_MEDIA_TYPE.to_string());

    let blob = build_layout(&LayoutImage {
        manifest: &manifest_bytes,
        manifest_media_type: &media_type,
        config: &image.config.data,
        layers: image.layers.iter().map(|layer| layer.data.as_slice()).collect(),
    })?;

    let digest = image
        .digest
        .clone()
        .unwrap_or_else(|| format!("sha256:{}", sha256_hex(&manifest_bytes)));
    Ok(FetchedImage { digest, blob })
}

#[async_trait]
impl ImageSource for OciImageSource {
    async fn fetch(
        &self,
        reference: &ImageReference,
    ) -> std::result::Result<FetchedImage, SourceError> {
        self.pull(reference)
            .await
            .map_err(|e| SourceError::new(e.to_string()))
    }
}

/// Convert a normalized reference into an `oci-distribution` reference
pub fn to_oci_reference(reference: &ImageReference) -> Result<Reference> {
    let normalized = reference.normalized();
    Reference::try_from(normalized.as_str()).map_err(|e| RegistryError::InvalidReference {
        reference: normalized.clone(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use kaar_core::{CancelToken, ImageStore, KaarConfig};
    use oci_distribution::client::{Config, ImageLayer};
    use oci_distribution::manifest::OciImageManifest;

    use super::*;

    const MANIFEST_DIGEST: &str =
        "sha256:0d4e0c1b0e7bcbd9a1f1e1d9e2b4e8c3a7f6b5d4c3b2a1908f7e6d5c4b3a2910";

    fn layer(data: &[u8]) -> ImageLayer {
        ImageLayer::new(data.to_vec(), media_types::OCI_LAYER_GZIP.to_string(), None)
    }

    fn pulled_image() -> ImageData {
        ImageData {
            layers: vec![layer(b"layer-one"), layer(b"layer-two")],
            digest: Some(MANIFEST_DIGEST.to_string()),
            config: Config::new(
                br#"{"architecture":"amd64"}"#.to_vec(),
                "application/vnd.oci.image.config.v1+json".to_string(),
                None,
            ),
            manifest: Some(OciImageManifest::default()),
        }
    }

    /// Registry stand-in that packages like `OciImageSource`, slower for one tag
    struct PackagingSource {
        slow_tag: &'static str,
    }

    #[async_trait]
    impl ImageSource for PackagingSource {
        async fn fetch(
            &self,
            reference: &ImageReference,
        ) -> std::result::Result<FetchedImage, SourceError> {
            if reference.tag.as_deref() == Some(self.slow_tag) {
                tokio::time::sleep(Duration::from_millis(30)).await;
            }
            package_image(&reference.normalized(), &pulled_image())
                .map_err(|e| SourceError::new(e.to_string()))
        }
    }

    async fn stored_bytes(slow_tag: &'static str) -> Vec<u8> {
        let store = ImageStore::new(
            Arc::new(PackagingSource { slow_tag }),
            &KaarConfig::default(),
            CancelToken::never(),
        );
        store
            .resolve_all(vec!["nginx:1.25".to_string(), "nginx:stable".to_string()])
            .await
            .unwrap();
        let blobs = store.into_blobs();
        assert_eq!(blobs.len(), 1);
        let blob = &blobs[MANIFEST_DIGEST];
        assert_eq!(blob.references.len(), 2);
        blob.data.as_ref().clone()
    }

    #[test]
    fn test_tags_of_one_image_package_identically() {
        let stable = package_image("docker.io/library/nginx:stable", &pulled_image()).unwrap();
        let pinned = package_image("docker.io/library/nginx:1.25", &pulled_image()).unwrap();

        assert_eq!(stable.digest, MANIFEST_DIGEST);
        assert_eq!(stable, pinned);
    }

    #[test]
    fn test_digest_falls_back_to_manifest_hash() {
        let mut image = pulled_image();
        image.digest = None;
        let fetched = package_image("docker.io/library/nginx:1.25", &image).unwrap();

        let value = serde_json::to_value(OciImageManifest::default()).unwrap();
        let manifest = serde_json::to_vec(&value).unwrap();
        assert_eq!(fetched.digest, format!("sha256:{}", sha256_hex(&manifest)));
    }

    #[test]
    fn test_missing_manifest_names_reference() {
        let mut image = pulled_image();
        image.manifest = None;
        let err = package_image("docker.io/library/nginx:1.25", &image).unwrap_err();
        assert!(err.to_string().contains("docker.io/library/nginx:1.25"), "{}", err);
    }

    #[tokio::test]
    async fn test_stored_blob_independent_of_fetch_order() {
        let first = stored_bytes("stable").await;
        let second = stored_bytes("1.25").await;
        assert_eq!(first, second);
    }

    #[test]
    fn test_reference_conversion() {
        let reference = ImageReference::parse("nginx:1.25").unwrap();
        let oci = to_oci_reference(&reference).unwrap();

        assert_eq!(oci.repository(), "library/nginx");
        assert_eq!(oci.tag(), Some("1.25"));
    }

    #[test]
    fn test_digest_reference_conversion() {
        let digest = format!("sha256:{}", "a".repeat(64));
        let reference = ImageReference::parse(&format!("ghcr.io/org/app@{}", digest)).unwrap();
        let oci = to_oci_reference(&reference).unwrap();

        assert_eq!(oci.registry(), "ghcr.io");
        assert_eq!(oci.repository(), "org/app");
        assert_eq!(oci.digest(), Some(digest.as_str()));
    }

    #[test]
    fn test_private_registry_with_port() {
        let reference = ImageReference::parse("localhost:5000/team/api:v2").unwrap();
        let oci = to_oci_reference(&reference).unwrap();

        assert_eq!(oci.registry(), "localhost:5000");
        assert_eq!(oci.repository(), "team/api");
    }

    #[tokio::test]
    async fn test_unreachable_registry_is_a_source_error() {
        let source =
            OciImageSource::with_insecure(DockerConfig::default(), vec!["127.0.0.1:1".to_string()]);
        let reference = ImageReference::parse("127.0.0.1:1/app:1").unwrap();

        let err = source.fetch(&reference).await.unwrap_err();
        assert!(err.message.contains("127.0.0.1:1/app:1"), "{}", err);
    }
}
