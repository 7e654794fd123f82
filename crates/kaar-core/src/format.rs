//! Kaarball container format
//!
//! ```text
//! 0      8  magic "KAARBALL"
//! 8      4  format version, u32 little-endian
//! 12     4  index length N, u32 little-endian
//! 16     N  top-level index (JSON)
//! 16+N   ..  sections: files, manifests, images
//! ```
//!
//! Section offsets in the index are relative to the first byte after the
//! index. Every section carries its SHA-256 so the reader can reject a
//! truncated or tampered artifact before trusting any of it.
//!
//! - `files`: gzip-compressed tar of every original file, plus directory
//!   entries for directories that hold no archived file
//! - `manifests`: YAML [`ManifestIndex`] for inspection without re-decoding
//! - `images`: uncompressed tar of `<algorithm>/<hex>` blobs, one per digest
//!
//! All tar headers use mtime 0 and uid/gid 0, so packing an unchanged
//! directory twice produces identical bytes.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::{Read, Write};
use std::path::{Component, Path};
use std::sync::Arc;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tar::{EntryType, Header};

use crate::archive::{FileEntry, ImageRef};
use crate::error::{KaarError, Result};
use crate::store::ImageBlob;

/// Leading magic bytes
pub const MAGIC: [u8; 8] = *b"KAARBALL";

/// Current container format version
pub const FORMAT_VERSION: u32 = 1;

/// Magic + version + index length
pub const HEADER_LEN: u64 = 16;

/// Upper bound on the top-level index, which only lists three sections
pub const MAX_INDEX_LEN: u32 = 64 * 1024;

/// Section names, in on-disk order
pub mod sections {
    pub const FILES: &str = "files";
    pub const MANIFESTS: &str = "manifests";
    pub const IMAGES: &str = "images";

    pub const ALL: [&str; 3] = [FILES, MANIFESTS, IMAGES];
}

const MODE_FILE: u32 = 0o644;
const MODE_EXECUTABLE: u32 = 0o755;
const MODE_DIRECTORY: u32 = 0o755;

/// Decoded `files` section
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileTree {
    pub files: BTreeMap<String, FileEntry>,
    /// Directories that hold no archived file, so extraction recreates them
    pub directories: BTreeSet<String>,
}

/// Location and checksum of one section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionEntry {
    pub name: String,
    /// Relative to the end of the top-level index
    pub offset: u64,
    pub length: u64,
    pub sha256: String,
}

/// Top-level index of a kaarball
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopIndex {
    pub sections: Vec<SectionEntry>,
}

impl TopIndex {
    /// Lay out sections back to back in the given order
    pub fn for_sections(parts: &[(&str, &[u8])]) -> Self {
        let mut offset = 0;
        let sections = parts
            .iter()
            .map(|(name, data)| {
                let entry = SectionEntry {
                    name: name.to_string(),
                    offset,
                    length: data.len() as u64,
                    sha256: sha256_hex(data),
                };
                offset += data.len() as u64;
                entry
            })
            .collect();
        Self { sections }
    }

    pub fn section(&self, name: &str) -> Option<&SectionEntry> {
        self.sections.iter().find(|s| s.name == name)
    }

    /// Check the index against the size of the data area that follows it
    pub fn validate(&self, data_len: u64) -> Result<()> {
        for name in sections::ALL {
            let count = self.sections.iter().filter(|s| s.name == name).count();
            if count != 1 {
                return Err(KaarError::corrupt(format!(
                    "index lists section '{}' {} times",
                    name, count
                )));
            }
        }
        if let Some(unknown) = self
            .sections
            .iter()
            .find(|s| !sections::ALL.contains(&s.name.as_str()))
        {
            return Err(KaarError::corrupt(format!(
                "index lists unknown section '{}'",
                unknown.name
            )));
        }

        let mut ranges = Vec::with_capacity(self.sections.len());
        for section in &self.sections {
            let end = section.offset.checked_add(section.length).ok_or_else(|| {
                KaarError::corrupt(format!("section '{}' length overflows", section.name))
            })?;
            if end > data_len {
                return Err(KaarError::corrupt(format!(
                    "section '{}' ends at byte {} but only {} bytes follow the index",
                    section.name, end, data_len
                )));
            }
            ranges.push((section.offset, end, section.name.as_str()));
        }

        ranges.sort();
        for pair in ranges.windows(2) {
            if pair[1].0 < pair[0].1 {
                return Err(KaarError::corrupt(format!(
                    "sections '{}' and '{}' overlap",
                    pair[0].2, pair[1].2
                )));
            }
        }
        Ok(())
    }
}

/// File entry as listed in the manifest index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub path: String,
    pub size: u64,
    pub sha256: String,
    pub manifest: bool,
}

/// Manifest metadata for quick inspection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestRecord {
    pub path: String,
    pub document: usize,
    pub api_version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub images: BTreeMap<String, ImageRef>,
}

/// Embedded image listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRecord {
    pub digest: String,
    pub size: u64,
    pub references: BTreeSet<String>,
}

/// Contents of the `manifests` section
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestIndex {
    #[serde(default)]
    pub version: String,
    pub files: Vec<FileRecord>,
    pub manifests: Vec<ManifestRecord>,
    pub images: Vec<ImageRecord>,
}

impl ManifestIndex {
    /// References whose slots were not embedded
    pub fn unresolved(&self) -> BTreeSet<&str> {
        self.manifests
            .iter()
            .flat_map(|m| m.images.values())
            .filter(|image| image.digest().is_none())
            .map(|image| image.reference.as_deref().unwrap_or(&image.raw))
            .collect()
    }
}

impl fmt::Display for ManifestIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "files:")?;
        for file in &self.files {
            let marker = if file.manifest { "  manifest" } else { "" };
            writeln!(f, "  {} ({} bytes){}", file.path, file.size, marker)?;
        }
        writeln!(f, "manifests:")?;
        for manifest in &self.manifests {
            let name = match (&manifest.namespace, &manifest.name) {
                (Some(ns), Some(name)) => format!("{}/{}", ns, name),
                (None, Some(name)) => name.clone(),
                _ => "<unnamed>".to_string(),
            };
            writeln!(
                f,
                "  {}#{} {} {} {}",
                manifest.path, manifest.document, manifest.api_version, manifest.kind, name
            )?;
            for (slot, image) in &manifest.images {
                writeln!(f, "    {} {} -> {}", slot, image.raw, image.status)?;
            }
        }
        writeln!(f, "images:")?;
        for image in &self.images {
            let references: Vec<&str> = image.references.iter().map(String::as_str).collect();
            writeln!(
                f,
                "  {} ({} bytes) {}",
                image.digest,
                image.size,
                references.join(", ")
            )?;
        }
        Ok(())
    }
}

/// SHA-256 of bytes as lowercase hex
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Magic, version and top-level index
pub fn encode_header(index: &TopIndex) -> std::io::Result<Vec<u8>> {
    let json = serde_json::to_vec(index).map_err(std::io::Error::other)?;
    let len = u32::try_from(json.len())
        .ok()
        .filter(|len| *len <= MAX_INDEX_LEN)
        .ok_or_else(|| std::io::Error::other("top-level index too large"))?;

    let mut out = Vec::with_capacity(HEADER_LEN as usize + json.len());
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&json);
    Ok(out)
}

/// Parse the fixed header, returning the index length
pub fn decode_header(header: &[u8; HEADER_LEN as usize]) -> Result<u32> {
    if header[..8] != MAGIC {
        return Err(KaarError::corrupt("not a kaarball (bad magic)"));
    }
    let version = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
    if version != FORMAT_VERSION {
        return Err(KaarError::corrupt(format!(
            "unsupported format version {}",
            version
        )));
    }
    let len = u32::from_le_bytes([header[12], header[13], header[14], header[15]]);
    if len > MAX_INDEX_LEN {
        return Err(KaarError::corrupt(format!(
            "top-level index claims {} bytes",
            len
        )));
    }
    Ok(len)
}

pub fn decode_index(data: &[u8]) -> Result<TopIndex> {
    serde_json::from_slice(data)
        .map_err(|e| KaarError::corrupt(format!("unreadable top-level index: {}", e)))
}

/// Gzip-compressed tar of the empty directories, then every file, each in
/// path order
pub fn encode_files(
    files: &BTreeMap<String, FileEntry>,
    directories: &BTreeSet<String>,
) -> std::io::Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for path in directories {
        append_directory(&mut builder, path)?;
    }
    for entry in files.values() {
        let mode = if entry.executable {
            MODE_EXECUTABLE
        } else {
            MODE_FILE
        };
        append_bytes(&mut builder, &entry.path, &entry.content, mode)?;
    }
    builder.into_inner()?.finish()
}

/// Decode the `files` section; manifest flags are filled in from the index
pub fn decode_files(data: &[u8]) -> Result<FileTree> {
    let mut archive = tar::Archive::new(GzDecoder::new(data));
    let mut tree = FileTree::default();

    let entries = archive.entries().map_err(corrupt_section(sections::FILES))?;
    for entry in entries {
        let mut entry = entry.map_err(corrupt_section(sections::FILES))?;
        let entry_type = entry.header().entry_type();
        if !entry_type.is_file() && !entry_type.is_dir() {
            return Err(KaarError::corrupt(format!(
                "files section holds unsupported entry type {:?}",
                entry_type
            )));
        }

        let path = {
            let raw = entry.path().map_err(corrupt_section(sections::FILES))?;
            safe_relative_path(&raw)?
        };
        if entry_type.is_dir() {
            tree.directories.insert(path);
            continue;
        }

        let executable = entry
            .header()
            .mode()
            .map(|mode| mode & 0o111 != 0)
            .unwrap_or(false);
        let mut content = Vec::new();
        entry
            .read_to_end(&mut content)
            .map_err(corrupt_section(sections::FILES))?;

        if tree.files.contains_key(&path) {
            return Err(KaarError::corrupt(format!("duplicate file entry {}", path)));
        }
        tree.files.insert(
            path.clone(),
            FileEntry {
                path,
                content,
                is_manifest: false,
                executable,
            },
        );
    }
    Ok(tree)
}

/// Uncompressed tar of `<algorithm>/<hex>` blobs, in digest order
pub fn encode_images(images: &BTreeMap<String, ImageBlob>) -> std::io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    for blob in images.values() {
        let name = digest_to_entry(&blob.digest).ok_or_else(|| {
            std::io::Error::other(format!("invalid image digest {}", blob.digest))
        })?;
        append_bytes(&mut builder, &name, &blob.data, MODE_FILE)?;
    }
    builder.into_inner()
}

/// Decode the `images` section, attaching references from the index
pub fn decode_images(data: &[u8], index: &ManifestIndex) -> Result<BTreeMap<String, ImageBlob>> {
    let references: BTreeMap<&str, &BTreeSet<String>> = index
        .images
        .iter()
        .map(|record| (record.digest.as_str(), &record.references))
        .collect();

    let mut archive = tar::Archive::new(data);
    let mut images = BTreeMap::new();
    let entries = archive.entries().map_err(corrupt_section(sections::IMAGES))?;
    for entry in entries {
        let mut entry = entry.map_err(corrupt_section(sections::IMAGES))?;
        let name = entry
            .path()
            .map_err(corrupt_section(sections::IMAGES))?
            .to_string_lossy()
            .to_string();
        let digest = entry_to_digest(&name)
            .ok_or_else(|| KaarError::corrupt(format!("unexpected image entry {}", name)))?;

        let mut content = Vec::new();
        entry
            .read_to_end(&mut content)
            .map_err(corrupt_section(sections::IMAGES))?;

        let refs = references
            .get(digest.as_str())
            .map(|refs| (*refs).clone())
            .unwrap_or_default();
        if images.contains_key(&digest) {
            return Err(KaarError::corrupt(format!("duplicate image {}", digest)));
        }
        images.insert(
            digest.clone(),
            ImageBlob {
                digest,
                references: refs,
                data: Arc::new(content),
            },
        );
    }
    Ok(images)
}

pub fn encode_manifest_index(index: &ManifestIndex) -> std::io::Result<Vec<u8>> {
    serde_yaml::to_string(index)
        .map(String::into_bytes)
        .map_err(std::io::Error::other)
}

pub fn decode_manifest_index(data: &[u8]) -> Result<ManifestIndex> {
    serde_yaml::from_slice(data)
        .map_err(|e| KaarError::corrupt(format!("unreadable manifest index: {}", e)))
}

/// `sha256:<hex>` -> `sha256/<hex>`
/// Whether a digest can be stored in the images section (`<algorithm>:<alnum>`)
pub fn is_storable_digest(digest: &str) -> bool {
    digest_to_entry(digest).is_some()
}

fn digest_to_entry(digest: &str) -> Option<String> {
    let (algorithm, hex) = digest.split_once(':')?;
    let valid = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric());
    (valid(algorithm) && valid(hex)).then(|| format!("{}/{}", algorithm, hex))
}

fn entry_to_digest(name: &str) -> Option<String> {
    let (algorithm, hex) = name.split_once('/')?;
    digest_to_entry(&format!("{}:{}", algorithm, hex))?;
    Some(format!("{}:{}", algorithm, hex))
}

/// Reject absolute paths and `..` so extraction stays inside the destination
fn safe_relative_path(path: &Path) -> Result<String> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str().ok_or_else(|| {
                KaarError::corrupt(format!("non UTF-8 path {}", path.display()))
            })?),
            Component::CurDir => {}
            _ => {
                return Err(KaarError::corrupt(format!(
                    "unsafe path {} in files section",
                    path.display()
                )));
            }
        }
    }
    if parts.is_empty() {
        return Err(KaarError::corrupt("empty path in files section"));
    }
    Ok(parts.join("/"))
}

/// Append a regular file with a normalized header (mtime 0, uid/gid 0)
pub fn append_bytes<W: Write>(
    builder: &mut tar::Builder<W>,
    path: &str,
    content: &[u8],
    mode: u32,
) -> std::io::Result<()> {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_size(content.len() as u64);
    header.set_mode(mode);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_cksum();
    builder.append_data(&mut header, path, content)
}

fn append_directory<W: Write>(builder: &mut tar::Builder<W>, path: &str) -> std::io::Result<()> {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Directory);
    header.set_size(0);
    header.set_mode(MODE_DIRECTORY);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_cksum();
    builder.append_data(&mut header, format!("{}/", path), std::io::empty())
}

fn corrupt_section(section: &'static str) -> impl Fn(std::io::Error) -> KaarError {
    move |e| KaarError::corrupt(format!("{} section: {}", section, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, content: &[u8]) -> FileEntry {
        FileEntry {
            path: path.to_string(),
            content: content.to_vec(),
            is_manifest: false,
            executable: false,
        }
    }

    #[test]
    fn test_header_layout() {
        let index = TopIndex::for_sections(&[
            ("files", b"abc"),
            ("manifests", b""),
            ("images", b"xy"),
        ]);
        let header = encode_header(&index).unwrap();

        assert_eq!(&header[..8], b"KAARBALL");
        let fixed: [u8; 16] = header[..16].try_into().unwrap();
        let len = decode_header(&fixed).unwrap();
        assert_eq!(len as usize, header.len() - 16);

        let parsed = decode_index(&header[16..]).unwrap();
        assert_eq!(parsed, index);
        assert_eq!(parsed.section("images").unwrap().offset, 3);
        assert_eq!(parsed.section("images").unwrap().length, 2);
    }

    #[test]
    fn test_bad_magic_and_version() {
        let mut fixed = [0u8; 16];
        assert!(matches!(decode_header(&fixed), Err(KaarError::CorruptArchive { .. })));

        fixed[..8].copy_from_slice(&MAGIC);
        fixed[8..12].copy_from_slice(&99u32.to_le_bytes());
        assert!(matches!(decode_header(&fixed), Err(KaarError::CorruptArchive { .. })));
    }

    #[test]
    fn test_index_validation() {
        let index = TopIndex::for_sections(&[
            ("files", b"abc"),
            ("manifests", b"d"),
            ("images", b""),
        ]);
        assert!(index.validate(4).is_ok());

        // Past the end of the data area
        let err = index.validate(3).unwrap_err();
        assert!(err.to_string().contains("section 'manifests' ends at byte 4"));

        let mut overlapping = index.clone();
        overlapping.sections[1].offset = 1;
        assert!(overlapping.validate(4).is_err());

        let mut missing = index.clone();
        missing.sections.pop();
        assert!(missing.validate(4).is_err());

        let mut overflow = index;
        overflow.sections[0].length = u64::MAX;
        assert!(overflow.validate(4).is_err());
    }

    #[test]
    fn test_files_section_is_deterministic() {
        let mut files = BTreeMap::new();
        files.insert("b/deploy.yaml".to_string(), entry("b/deploy.yaml", b"kind: x"));
        files.insert("README.md".to_string(), entry("README.md", b"hello"));

        let first = encode_files(&files, &BTreeSet::new()).unwrap();
        let second = encode_files(&files, &BTreeSet::new()).unwrap();
        assert_eq!(first, second);

        let decoded = decode_files(&first).unwrap().files;
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded["README.md"].content, b"hello");
        assert_eq!(decoded["b/deploy.yaml"].content, b"kind: x");
    }

    #[test]
    fn test_empty_directories_survive() {
        let mut files = BTreeMap::new();
        files.insert("README.md".to_string(), entry("README.md", b"hello"));
        let directories: BTreeSet<String> =
            ["cache", "empty/nested"].iter().map(|d| d.to_string()).collect();

        let data = encode_files(&files, &directories).unwrap();
        assert_eq!(data, encode_files(&files, &directories).unwrap());

        let tree = decode_files(&data).unwrap();
        assert_eq!(tree.directories, directories);
        assert_eq!(tree.files.len(), 1);
        assert!(tree.files.contains_key("README.md"));
    }

    #[test]
    fn test_executable_bit_survives() {
        let mut files = BTreeMap::new();
        let mut script = entry("run.sh", b"#!/bin/sh\n");
        script.executable = true;
        files.insert("run.sh".to_string(), script);

        let decoded = decode_files(&encode_files(&files, &BTreeSet::new()).unwrap()).unwrap();
        assert!(decoded.files["run.sh"].executable);
    }

    #[test]
    fn test_long_paths() {
        let long = format!("{}/deploy.yaml", "nested".repeat(30));
        let mut files = BTreeMap::new();
        files.insert(long.clone(), entry(&long, b"x"));

        let decoded = decode_files(&encode_files(&files, &BTreeSet::new()).unwrap()).unwrap();
        assert!(decoded.files.contains_key(&long));
    }

    #[test]
    fn test_unsafe_paths_rejected() {
        assert!(safe_relative_path(Path::new("../etc/passwd")).is_err());
        assert!(safe_relative_path(Path::new("/etc/passwd")).is_err());
        assert_eq!(safe_relative_path(Path::new("./a/b")).unwrap(), "a/b");
    }

    #[test]
    fn test_digest_entry_names() {
        assert_eq!(digest_to_entry("sha256:abc").as_deref(), Some("sha256/abc"));
        assert_eq!(entry_to_digest("sha256/abc").as_deref(), Some("sha256:abc"));
        assert!(digest_to_entry("sha256:../x").is_none());
        assert!(digest_to_entry("nodigest").is_none());
        assert!(entry_to_digest("sha256/a/b").is_none());
    }

    #[test]
    fn test_truncated_files_section() {
        let mut files = BTreeMap::new();
        files.insert("a.txt".to_string(), entry("a.txt", &[7u8; 4096]));
        let data = encode_files(&files, &BTreeSet::new()).unwrap();

        let err = decode_files(&data[..data.len() / 2]).unwrap_err();
        assert!(matches!(err, KaarError::CorruptArchive { .. }));
    }
}
