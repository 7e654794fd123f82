//! Atomic kaarball writer
//!
//! The artifact is assembled in a temporary file next to the destination,
//! synced, then renamed into place. A failure or cancellation drops the
//! temporary file, so the destination either holds a complete kaarball or
//! is left untouched.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;

use crate::archive::FileEntry;
use crate::cancel::CancelToken;
use crate::error::{IoContext, KaarError, Result};
use crate::format::{self, ManifestIndex, TopIndex, sections};
use crate::store::ImageBlob;

/// Encoded sections, in on-disk order
pub struct EncodedArchive {
    pub files: Vec<u8>,
    pub manifests: Vec<u8>,
    pub images: Vec<u8>,
}

impl EncodedArchive {
    pub fn encode(
        files: &BTreeMap<String, FileEntry>,
        directories: &BTreeSet<String>,
        index: &ManifestIndex,
        images: &BTreeMap<String, ImageBlob>,
    ) -> std::io::Result<Self> {
        Ok(Self {
            files: format::encode_files(files, directories)?,
            manifests: format::encode_manifest_index(index)?,
            images: format::encode_images(images)?,
        })
    }

    pub fn top_index(&self) -> TopIndex {
        TopIndex::for_sections(&[
            (sections::FILES, &self.files),
            (sections::MANIFESTS, &self.manifests),
            (sections::IMAGES, &self.images),
        ])
    }
}

/// Write a kaarball to `dest`, returning its size in bytes
pub fn write_archive(
    dest: &Path,
    files: &BTreeMap<String, FileEntry>,
    directories: &BTreeSet<String>,
    index: &ManifestIndex,
    images: &BTreeMap<String, ImageBlob>,
    cancel: &CancelToken,
) -> Result<u64> {
    let encoded = EncodedArchive::encode(files, directories, index, images).at(dest)?;
    let header = format::encode_header(&encoded.top_index()).at(dest)?;

    let parent = match dest.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(parent).at(parent)?;

    let file = tmp.as_file_mut();
    for chunk in [
        header.as_slice(),
        encoded.files.as_slice(),
        encoded.manifests.as_slice(),
        encoded.images.as_slice(),
    ] {
        file.write_all(chunk).at(dest)?;
    }
    file.sync_all().at(dest)?;
    set_readable(file).at(dest)?;

    if cancel.is_cancelled() {
        tracing::debug!(path = %dest.display(), "cancelled, discarding temporary file");
        return Err(KaarError::Cancelled);
    }

    tmp.persist(dest).map_err(|e| KaarError::io(dest, e.error))?;

    let size = (header.len() + encoded.files.len() + encoded.manifests.len() + encoded.images.len())
        as u64;
    tracing::info!(path = %dest.display(), size, "kaarball written");
    Ok(size)
}

/// Temporary files are created owner-only; a kaarball is a normal file
#[cfg(unix)]
fn set_readable(file: &std::fs::File) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(std::fs::Permissions::from_mode(0o644))
}

#[cfg(not(unix))]
fn set_readable(_file: &std::fs::File) -> std::io::Result<()> {
    Ok(())
}
