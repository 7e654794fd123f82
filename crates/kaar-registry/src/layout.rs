//! Deterministic OCI image-layout tarballs
//!
//! A pulled image is stored as an OCI layout (`oci-layout`, `index.json`,
//! `blobs/sha256/<hex>`) so it can be handed to `podman load` or
//! `docker load` after extraction. Entries are sorted and headers
//! normalized, and nothing about the requested reference is recorded, so
//! the bytes are a function of the manifest, config and layers alone. Tags
//! that point at one image therefore share one blob; the references live in
//! the kaarball's manifest index.

use std::collections::BTreeMap;

use kaar_core::format::{append_bytes, sha256_hex};
use serde_json::json;

use crate::error::Result;

pub const OCI_LAYOUT_VERSION: &str = "1.0.0";
pub const OCI_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

/// Pieces of one pulled image
#[derive(Debug, Clone)]
pub struct LayoutImage<'a> {
    pub manifest: &'a [u8],
    pub manifest_media_type: &'a str,
    pub config: &'a [u8],
    pub layers: Vec<&'a [u8]>,
}

/// Serialize an image as an OCI layout tarball
pub fn build_layout(image: &LayoutImage<'_>) -> Result<Vec<u8>> {
    let mut blobs: BTreeMap<String, &[u8]> = BTreeMap::new();
    for blob in [image.manifest, image.config]
        .into_iter()
        .chain(image.layers.iter().copied())
    {
        blobs.insert(sha256_hex(blob), blob);
    }

    let index = json!({
        "schemaVersion": 2,
        "manifests": [{
            "mediaType": image.manifest_media_type,
            "digest": format!("sha256:{}", sha256_hex(image.manifest)),
            "size": image.manifest.len(),
        }],
    });
    let index = serde_json::to_vec(&index)?;
    let layout = serde_json::to_vec(&json!({ "imageLayoutVersion": OCI_LAYOUT_VERSION }))?;

    let mut builder = tar::Builder::new(Vec::new());
    for (hex, data) in &blobs {
        append_bytes(&mut builder, &format!("blobs/sha256/{}", hex), data, 0o644)?;
    }
    append_bytes(&mut builder, "index.json", &index, 0o644)?;
    append_bytes(&mut builder, "oci-layout", &layout, 0o644)?;
    Ok(builder.into_inner()?)
}
