//! The archive aggregate and the pack/unpack pipelines
//!
//! An [`Archive`] owns every file, manifest and image blob of one pack or
//! unpack session and moves through a fixed set of states:
//!
//! ```text
//! Empty -> Loaded -> Resolved -> Written      (create)
//! Empty -> Read -> Extracted                  (extract)
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::cancel::CancelToken;
use crate::codec::{KubeCodec, KubeObject, ObjectCodec};
use crate::config::{KaarConfig, resolve_path};
use crate::error::{IoContext, KaarError, Result};
use crate::format::{FileRecord, FileTree, ImageRecord, ManifestIndex, ManifestRecord, sections};
use crate::images::resolve_images;
use crate::parser::{ParsedFile, parse_file, split_documents};
use crate::reader::ArchiveReader;
use crate::reference::ImageReference;
use crate::report::{ImageIssue, Report, SinkIssue};
use crate::sink::ImageSink;
use crate::store::{ImageBlob, ImageSource, ImageStore};
use crate::walker::{DirWalker, WalkEntry, WalkedFile};

/// One original file, manifest or not
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Relative path, unique within an archive
    pub path: String,
    pub content: Vec<u8>,
    /// At least one document decoded into a Kubernetes object
    pub is_manifest: bool,
    pub executable: bool,
}

/// Resolution state of one image slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum ImageStatus {
    /// Not resolved yet
    Pending,
    Resolved { digest: String },
    Failed { error: String },
    /// Embedding was turned off
    Skipped,
}

impl fmt::Display for ImageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageStatus::Pending => write!(f, "pending"),
            ImageStatus::Resolved { digest } => write!(f, "{}", digest),
            ImageStatus::Failed { error } => write!(f, "unresolved: {}", error),
            ImageStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Image used by one container slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    /// Reference as written in the manifest
    pub raw: String,
    /// Normalized reference, absent when `raw` does not parse
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    pub status: ImageStatus,
}

impl ImageRef {
    pub fn digest(&self) -> Option<&str> {
        match &self.status {
            ImageStatus::Resolved { digest } => Some(digest),
            _ => None,
        }
    }
}

/// One decoded document
#[derive(Debug, Clone)]
pub struct Manifest {
    /// Source file; several manifests may share one
    pub path: String,
    /// Document position within the file
    pub document: usize,
    pub object: KubeObject,
    /// Slot id to image
    pub images: BTreeMap<String, ImageRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveState {
    Empty,
    Loaded,
    Resolved,
    Written,
    Read,
    Extracted,
}

impl ArchiveState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArchiveState::Empty => "empty",
            ArchiveState::Loaded => "loaded",
            ArchiveState::Resolved => "resolved",
            ArchiveState::Written => "written",
            ArchiveState::Read => "read",
            ArchiveState::Extracted => "extracted",
        }
    }
}

impl fmt::Display for ArchiveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate root for one pack or unpack session
#[derive(Debug)]
pub struct Archive {
    path: PathBuf,
    state: ArchiveState,
    version: String,
    files: BTreeMap<String, FileEntry>,
    /// Directories with no archived file below them
    directories: BTreeSet<String>,
    manifests: Vec<Manifest>,
    images: BTreeMap<String, ImageBlob>,
    report: Report,
}

impl Archive {
    /// Empty archive that will be written to `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: ArchiveState::Empty,
            version: String::new(),
            files: BTreeMap::new(),
            directories: BTreeSet::new(),
            manifests: Vec::new(),
            images: BTreeMap::new(),
            report: Report::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> ArchiveState {
        self.state
    }

    pub fn files(&self) -> &BTreeMap<String, FileEntry> {
        &self.files
    }

    pub fn directories(&self) -> &BTreeSet<String> {
        &self.directories
    }

    pub fn manifests(&self) -> &[Manifest] {
        &self.manifests
    }

    pub fn images(&self) -> &BTreeMap<String, ImageBlob> {
        &self.images
    }

    pub fn report(&self) -> &Report {
        &self.report
    }

    fn expect_state(&self, expected: ArchiveState) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(KaarError::InvalidState {
                expected: expected.as_str(),
                actual: self.state.as_str(),
            })
        }
    }

    /// Walk `root` and decode every candidate manifest
    ///
    /// Parsing runs on the blocking pool, at most `config.jobs` files at a
    /// time; results are merged in walk order.
    pub async fn load(
        &mut self,
        root: &Path,
        config: &KaarConfig,
        codec: Arc<dyn ObjectCodec>,
        cancel: &CancelToken,
    ) -> Result<()> {
        self.expect_state(ArchiveState::Empty)?;
        self.version = config.version.clone();

        let walker = DirWalker::new(root)?.exclude(self.path.clone());
        let entries = tokio::task::spawn_blocking(move || {
            let entries: Vec<WalkEntry> = walker.entries().collect();
            entries
        })
        .await
        .map_err(task_failed)?;

        let mut walked = Vec::new();
        let mut directories = Vec::new();
        for entry in entries {
            match entry {
                WalkEntry::Dir(path) => directories.push(path),
                WalkEntry::File(file) => walked.push(file),
                WalkEntry::Skipped(path) => self.report.skipped.push(path),
                WalkEntry::Failed(issue) => {
                    tracing::warn!(
                        path = %issue.path,
                        error = %issue.message,
                        "unable to read entry"
                    );
                    self.report.walk_errors.push(issue);
                }
            }
        }
        self.directories = childless_directories(directories, &walked);

        let jobs = config.jobs.max(1);
        let mut parsed = stream::iter(walked)
            .map(|file| {
                let codec = codec.clone();
                tokio::task::spawn_blocking(move || parse_walked(file, codec.as_ref()))
            })
            .buffered(jobs);

        while let Some(result) = parsed.next().await {
            if cancel.is_cancelled() {
                return Err(KaarError::Cancelled);
            }
            let (file, parsed) = result.map_err(task_failed)?;
            self.merge_file(file, parsed, &config.default_registry);
        }

        tracing::info!(
            files = self.files.len(),
            manifests = self.manifests.len(),
            "directory loaded"
        );
        self.state = ArchiveState::Loaded;
        Ok(())
    }

    fn merge_file(&mut self, file: WalkedFile, parsed: Option<ParsedFile>, default_registry: &str) {
        let executable = is_executable(&file.metadata);
        let mut entry = FileEntry {
            path: file.path,
            content: file.content,
            is_manifest: false,
            executable,
        };

        if let Some(parsed) = parsed {
            entry.is_manifest = parsed.has_manifests();
            self.report.decode_errors.extend(parsed.errors);
            for doc in parsed.documents {
                let images = resolve_images(&doc.object)
                    .iter()
                    .map(|(slot, raw)| {
                        let reference = ImageReference::parse_with_registry(raw, default_registry)
                            .ok()
                            .map(|r| r.normalized());
                        let image = ImageRef {
                            raw: raw.to_string(),
                            reference,
                            status: ImageStatus::Pending,
                        };
                        (slot.to_string(), image)
                    })
                    .collect();
                self.manifests.push(Manifest {
                    path: entry.path.clone(),
                    document: doc.index,
                    object: doc.object,
                    images,
                });
            }
        }

        self.files.insert(entry.path.clone(), entry);
    }

    /// Fetch and embed every referenced image
    ///
    /// Unresolvable references are recorded in the report and on their
    /// slots; only cancellation aborts.
    pub async fn resolve_images(
        &mut self,
        source: Arc<dyn ImageSource>,
        config: &KaarConfig,
        cancel: CancelToken,
    ) -> Result<()> {
        self.expect_state(ArchiveState::Loaded)?;

        if !config.embed_images {
            for image in self.slots_mut() {
                image.status = ImageStatus::Skipped;
            }
            self.state = ArchiveState::Resolved;
            return Ok(());
        }

        let references: BTreeSet<String> = self
            .manifests
            .iter()
            .flat_map(|m| m.images.values().map(|image| image.raw.clone()))
            .collect();

        let store = ImageStore::new(source, config, cancel);
        let resolutions = store.resolve_all(references).await?;
        tracing::info!(
            references = resolutions.len(),
            fetches = store.fetch_count(),
            blobs = store.blob_count(),
            "images resolved"
        );

        let by_raw: BTreeMap<&str, _> = resolutions.iter().map(|r| (r.raw.as_str(), r)).collect();
        let mut failures = BTreeMap::new();
        for manifest in &mut self.manifests {
            for image in manifest.images.values_mut() {
                let Some(resolution) = by_raw.get(image.raw.as_str()) else {
                    continue;
                };
                image.reference = resolution.normalized.clone();
                image.status = match &resolution.outcome {
                    Ok(digest) => ImageStatus::Resolved {
                        digest: digest.clone(),
                    },
                    Err(error) => {
                        let key = image.reference.clone().unwrap_or_else(|| image.raw.clone());
                        failures.entry(key).or_insert_with(|| error.clone());
                        ImageStatus::Failed {
                            error: error.clone(),
                        }
                    }
                };
            }
        }

        self.report
            .image_errors
            .extend(failures.into_iter().map(|(reference, message)| ImageIssue {
                reference,
                message,
            }));
        self.images = store.into_blobs();
        self.state = ArchiveState::Resolved;
        Ok(())
    }

    fn slots_mut(&mut self) -> impl Iterator<Item = &mut ImageRef> {
        self.manifests.iter_mut().flat_map(|m| m.images.values_mut())
    }

    /// Check the aggregate invariants
    pub fn validate(&self) -> Result<()> {
        for manifest in &self.manifests {
            if !self.files.contains_key(&manifest.path) {
                return Err(KaarError::corrupt(format!(
                    "manifest {}#{} has no file entry",
                    manifest.path, manifest.document
                )));
            }
            for (slot, image) in &manifest.images {
                if let Some(digest) = image.digest() {
                    if !self.images.contains_key(digest) {
                        return Err(KaarError::corrupt(format!(
                            "{}#{} slot {} points to missing image {}",
                            manifest.path, manifest.document, slot, digest
                        )));
                    }
                }
            }
        }
        for (digest, blob) in &self.images {
            if digest != &blob.digest {
                return Err(KaarError::corrupt(format!(
                    "image stored under {} claims digest {}",
                    digest, blob.digest
                )));
            }
        }
        Ok(())
    }

    /// Manifest index describing this archive
    pub fn manifest_index(&self) -> ManifestIndex {
        let files = self
            .files
            .values()
            .map(|file| FileRecord {
                path: file.path.clone(),
                size: file.content.len() as u64,
                sha256: crate::format::sha256_hex(&file.content),
                manifest: file.is_manifest,
            })
            .collect();
        let manifests = self
            .manifests
            .iter()
            .map(|m| ManifestRecord {
                path: m.path.clone(),
                document: m.document,
                api_version: m.object.api_version().to_string(),
                kind: m.object.kind().to_string(),
                name: m.object.name().map(str::to_string),
                namespace: m.object.namespace().map(str::to_string),
                images: m.images.clone(),
            })
            .collect();
        let images = self
            .images
            .values()
            .map(|blob| ImageRecord {
                digest: blob.digest.clone(),
                size: blob.size(),
                references: blob.references.clone(),
            })
            .collect();

        ManifestIndex {
            version: self.version.clone(),
            files,
            manifests,
            images,
        }
    }

    /// Serialize to the archive path
    pub fn write(&mut self, cancel: &CancelToken) -> Result<u64> {
        self.expect_state(ArchiveState::Resolved)?;
        self.validate()?;

        let size = crate::writer::write_archive(
            &self.path,
            &self.files,
            &self.directories,
            &self.manifest_index(),
            &self.images,
            cancel,
        )?;
        self.state = ArchiveState::Written;
        Ok(size)
    }

    /// Load a kaarball, re-decoding each indexed manifest from its file
    pub fn read(path: impl Into<PathBuf>, codec: &dyn ObjectCodec) -> Result<Self> {
        let path = path.into();
        let mut reader = ArchiveReader::open(&path)?;
        let index = reader.manifest_index()?;
        let FileTree {
            mut files,
            directories,
        } = crate::format::decode_files(&reader.section(sections::FILES)?)?;
        let images = crate::format::decode_images(&reader.section(sections::IMAGES)?, &index)?;

        for record in &index.files {
            let file = files.get_mut(&record.path).ok_or_else(|| {
                KaarError::corrupt(format!("indexed file {} is missing", record.path))
            })?;
            if crate::format::sha256_hex(&file.content) != record.sha256 {
                return Err(KaarError::corrupt(format!(
                    "file {} does not match its checksum",
                    record.path
                )));
            }
            file.is_manifest = record.manifest;
        }

        let mut manifests = Vec::with_capacity(index.manifests.len());
        for record in &index.manifests {
            let file = files.get(&record.path).ok_or_else(|| {
                KaarError::corrupt(format!("manifest source {} is missing", record.path))
            })?;
            let object = decode_document(file, record.document, codec)?;
            manifests.push(Manifest {
                path: record.path.clone(),
                document: record.document,
                object,
                images: record.images.clone(),
            });
        }

        let archive = Self {
            path,
            state: ArchiveState::Read,
            version: index.version,
            files,
            directories,
            manifests,
            images,
            report: Report::default(),
        };
        archive.validate()?;
        tracing::debug!(
            path = %archive.path.display(),
            files = archive.files.len(),
            manifests = archive.manifests.len(),
            images = archive.images.len(),
            "kaarball read"
        );
        Ok(archive)
    }

    /// Restore every file under `dir` and hand each image to `sink`
    ///
    /// Conflicts are detected for all files before anything is written.
    /// Files are replaced atomically; if extraction fails or is cancelled,
    /// everything this call created or replaced under `dir` is put back.
    pub async fn extract(
        &mut self,
        dir: &Path,
        sink: &dyn ImageSink,
        config: &KaarConfig,
        cancel: &CancelToken,
    ) -> Result<()> {
        self.expect_state(ArchiveState::Read)?;

        let files = std::mem::take(&mut self.files);
        let directories = std::mem::take(&mut self.directories);
        let task = {
            let dir = dir.to_path_buf();
            let cancel = cancel.clone();
            let overwrite = config.overwrite;
            tokio::task::spawn_blocking(move || {
                let restored = restore_tree(&dir, &files, &directories, overwrite, &cancel);
                (files, directories, restored)
            })
        };
        let (files, directories, restored) = task.await.map_err(task_failed)?;
        self.files = files;
        self.directories = directories;
        let journal = restored?;

        for blob in self.images.values() {
            let outcome = tokio::select! {
                outcome = sink.load(&blob.digest, &blob.data) => Some(outcome),
                _ = cancel.cancelled() => None,
            };
            match outcome {
                None => return Err(journal.rollback_cancelled().await),
                Some(Ok(())) => {}
                Some(Err(err)) => {
                    tracing::warn!(digest = %blob.digest, error = %err, "unable to load image");
                    self.report.sink_errors.push(SinkIssue {
                        digest: blob.digest.clone(),
                        message: err.message,
                    });
                }
            }
        }
        if cancel.is_cancelled() {
            return Err(journal.rollback_cancelled().await);
        }

        tracing::info!(dir = %dir.display(), files = self.files.len(), "kaarball extracted");
        self.state = ArchiveState::Extracted;
        Ok(())
    }
}

fn task_failed(err: tokio::task::JoinError) -> KaarError {
    KaarError::Task {
        message: err.to_string(),
    }
}

/// Directories with nothing below them; any other directory is recreated
/// from the paths it contains
fn childless_directories(directories: Vec<String>, files: &[WalkedFile]) -> BTreeSet<String> {
    directories
        .iter()
        .filter(|dir| {
            let prefix = format!("{}/", dir);
            !files.iter().any(|file| file.path.starts_with(&prefix))
                && !directories.iter().any(|other| other.starts_with(&prefix))
        })
        .cloned()
        .collect()
}

fn parse_walked(file: WalkedFile, codec: &dyn ObjectCodec) -> (WalkedFile, Option<ParsedFile>) {
    let parsed = file
        .is_manifest_candidate()
        .then(|| parse_file(&file.path, &file.content, codec));
    (file, parsed)
}

fn decode_document(
    file: &FileEntry,
    document: usize,
    codec: &dyn ObjectCodec,
) -> Result<KubeObject> {
    let raw = split_documents(&file.content)
        .into_iter()
        .find(|doc| doc.index == document)
        .ok_or_else(|| {
            KaarError::corrupt(format!("{} has no document {}", file.path, document))
        })?;
    match codec.decode(raw.content) {
        Ok(Some(object)) => Ok(object),
        Ok(None) => Err(KaarError::corrupt(format!(
            "{} document {} is empty",
            file.path, document
        ))),
        Err(err) => Err(KaarError::corrupt(format!(
            "{} document {} no longer decodes: {}",
            file.path, document, err
        ))),
    }
}

/// Everything extraction will change under the destination
#[derive(Debug, Default)]
struct ExtractionPlan<'a> {
    directories: Vec<&'a str>,
    writes: Vec<PlannedWrite<'a>>,
}

#[derive(Debug)]
struct PlannedWrite<'a> {
    file: &'a FileEntry,
    /// Content and exec bit of the file being overwritten
    previous: Option<(Vec<u8>, bool)>,
}

/// Check every target for conflicts before anything is written
fn plan_extraction<'a>(
    dir: &Path,
    files: &'a BTreeMap<String, FileEntry>,
    directories: &'a BTreeSet<String>,
    overwrite: bool,
) -> Result<ExtractionPlan<'a>> {
    let mut plan = ExtractionPlan::default();
    let mut conflicts = Vec::new();

    for path in directories {
        if let Some(blocked) = blocked_ancestor(dir, path)? {
            conflicts.push(blocked);
            continue;
        }
        let target = dir.join(path);
        match std::fs::symlink_metadata(&target) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => plan.directories.push(path),
            Err(e) => return Err(KaarError::io(&target, e)),
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => conflicts.push(target),
        }
    }

    for file in files.values() {
        if let Some(blocked) = blocked_ancestor(dir, &file.path)? {
            conflicts.push(blocked);
            continue;
        }
        let target = dir.join(&file.path);
        match std::fs::symlink_metadata(&target) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => plan.writes.push(PlannedWrite {
                file,
                previous: None,
            }),
            Err(e) => return Err(KaarError::io(&target, e)),
            Ok(meta) if meta.is_file() => {
                let existing = std::fs::read(&target).at(&target)?;
                if existing == file.content {
                    tracing::debug!(path = %file.path, "identical file already present");
                } else if overwrite {
                    plan.writes.push(PlannedWrite {
                        file,
                        previous: Some((existing, is_executable(&meta))),
                    });
                } else {
                    conflicts.push(target);
                }
            }
            Ok(_) => conflicts.push(target),
        }
    }

    match conflicts.into_iter().next() {
        Some(path) => Err(KaarError::Conflict { path }),
        None => Ok(plan),
    }
}

/// First ancestor of `relative` below `dir` that exists but is not a directory
fn blocked_ancestor(dir: &Path, relative: &str) -> Result<Option<PathBuf>> {
    let mut ancestor = dir.to_path_buf();
    let components: Vec<&str> = relative.split('/').collect();
    for part in &components[..components.len().saturating_sub(1)] {
        ancestor.push(part);
        match std::fs::symlink_metadata(&ancestor) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Ok(Some(ancestor)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(KaarError::io(&ancestor, e)),
        }
    }
    Ok(None)
}

/// Changes made under the destination, undone when extraction does not finish
#[derive(Debug, Default)]
struct Journal {
    created_dirs: Vec<PathBuf>,
    created_files: Vec<PathBuf>,
    /// Overwritten files with their previous content and exec bit
    replaced: Vec<(PathBuf, Vec<u8>, bool)>,
}

impl Journal {
    /// Create `path` and its missing ancestors, remembering each one
    fn create_dir_all(&mut self, path: &Path) -> Result<()> {
        let missing: Vec<&Path> = path
            .ancestors()
            .take_while(|p| !p.as_os_str().is_empty() && std::fs::symlink_metadata(p).is_err())
            .collect();
        for dir in missing.into_iter().rev() {
            match std::fs::create_dir(dir) {
                Ok(()) => self.created_dirs.push(dir.to_path_buf()),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(KaarError::io(dir, e)),
            }
        }
        Ok(())
    }

    fn rollback(self) {
        for path in self.created_files.iter().rev() {
            if let Err(err) = std::fs::remove_file(path) {
                tracing::warn!(path = %path.display(), error = %err, "unable to remove file");
            }
        }
        for (path, content, executable) in &self.replaced {
            if let Err(err) = write_file(path, content, *executable) {
                tracing::warn!(path = %path.display(), error = %err, "unable to restore file");
            }
        }
        for dir in self.created_dirs.iter().rev() {
            if let Err(err) = std::fs::remove_dir(dir) {
                tracing::warn!(path = %dir.display(), error = %err, "unable to remove directory");
            }
        }
        tracing::debug!("destination restored");
    }

    /// Roll back on the blocking pool, yielding the cancellation error
    async fn rollback_cancelled(self) -> KaarError {
        tracing::warn!("extraction cancelled, restoring destination");
        match tokio::task::spawn_blocking(move || self.rollback()).await {
            Ok(()) => KaarError::Cancelled,
            Err(err) => task_failed(err),
        }
    }
}

/// Plan and write the file tree, undoing partial work on failure
fn restore_tree(
    dir: &Path,
    files: &BTreeMap<String, FileEntry>,
    directories: &BTreeSet<String>,
    overwrite: bool,
    cancel: &CancelToken,
) -> Result<Journal> {
    let plan = plan_extraction(dir, files, directories, overwrite)?;
    if cancel.is_cancelled() {
        return Err(KaarError::Cancelled);
    }

    let mut journal = Journal::default();
    match apply_plan(dir, plan, cancel, &mut journal) {
        Ok(()) => Ok(journal),
        Err(err) => {
            tracing::warn!(
                dir = %dir.display(),
                error = %err,
                "extraction failed, restoring destination"
            );
            journal.rollback();
            Err(err)
        }
    }
}

fn apply_plan(
    dir: &Path,
    plan: ExtractionPlan<'_>,
    cancel: &CancelToken,
    journal: &mut Journal,
) -> Result<()> {
    journal.create_dir_all(dir)?;
    for path in plan.directories {
        journal.create_dir_all(&dir.join(path))?;
    }

    for write in plan.writes {
        if cancel.is_cancelled() {
            return Err(KaarError::Cancelled);
        }
        let target = dir.join(&write.file.path);
        if let Some(parent) = target.parent() {
            journal.create_dir_all(parent)?;
        }
        write_file(&target, &write.file.content, write.file.executable)?;
        match write.previous {
            Some((content, executable)) => journal.replaced.push((target, content, executable)),
            None => journal.created_files.push(target),
        }
        tracing::debug!(path = %write.file.path, "file restored");
    }
    Ok(())
}

/// Replace `target` atomically through a temporary file beside it
fn write_file(target: &Path, content: &[u8], executable: bool) -> Result<()> {
    let parent = target.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(parent).at(parent)?;
    tmp.write_all(content).at(target)?;
    tmp.as_file().sync_all().at(target)?;
    set_executable(tmp.path(), executable).at(target)?;
    tmp.persist(target).map_err(|e| KaarError::io(target, e.error))?;
    Ok(())
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &std::fs::Metadata) -> bool {
    false
}

#[cfg(unix)]
fn set_executable(path: &Path, executable: bool) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mode = if executable { 0o755 } else { 0o644 };
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_executable(_path: &Path, _executable: bool) -> std::io::Result<()> {
    Ok(())
}

/// Pack `dir` into a kaarball at `archive_path`
pub async fn create(
    dir: &Path,
    archive_path: &Path,
    config: &KaarConfig,
    source: Arc<dyn ImageSource>,
    cancel: CancelToken,
) -> Result<Archive> {
    config.validate()?;
    let dir = resolve_path(dir);
    let archive_path = resolve_path(archive_path);

    let mut archive = Archive::new(&archive_path);
    archive
        .load(&dir, config, Arc::new(KubeCodec), &cancel)
        .await?;
    archive.resolve_images(source, config, cancel.clone()).await?;
    archive.write(&cancel)?;
    Ok(archive)
}

/// Unpack the kaarball at `archive_path` into `dir`
pub async fn extract(
    archive_path: &Path,
    dir: &Path,
    config: &KaarConfig,
    sink: &dyn ImageSink,
    cancel: CancelToken,
) -> Result<Archive> {
    config.validate()?;
    let archive_path = resolve_path(archive_path);
    let dir = resolve_path(dir);

    let mut archive = tokio::task::spawn_blocking(move || Archive::read(&archive_path, &KubeCodec))
        .await
        .map_err(task_failed)??;
    archive.extract(&dir, sink, config, &cancel).await?;
    Ok(archive)
}

/// Read only the manifest index of a kaarball
pub fn list(archive_path: &Path) -> Result<ManifestIndex> {
    let mut reader = ArchiveReader::open(resolve_path(archive_path))?;
    reader.manifest_index()
}

/// Recompute every section checksum without extracting
pub fn verify(archive_path: &Path) -> Result<()> {
    let mut reader = ArchiveReader::open(resolve_path(archive_path))?;
    reader.verify()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::OfflineSource;
    use tempfile::TempDir;

    const DEPLOYMENT: &str = "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: web\nspec:\n  selector:\n    matchLabels: {app: web}\n  template:\n    spec:\n      containers:\n        - name: nginx\n          image: nginx:1.25\n";

    fn file(path: &str, content: &[u8]) -> FileEntry {
        FileEntry {
            path: path.to_string(),
            content: content.to_vec(),
            is_manifest: false,
            executable: false,
        }
    }

    async fn loaded(dir: &Path, archive: &Path) -> Archive {
        let mut archive = Archive::new(archive);
        archive
            .load(dir, &KaarConfig::default(), Arc::new(KubeCodec), &CancelToken::never())
            .await
            .unwrap();
        archive
    }

    #[tokio::test]
    async fn test_load_keeps_only_empty_leaf_directories() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("conf")).unwrap();
        std::fs::create_dir_all(temp.path().join("empty/nested")).unwrap();
        std::fs::write(temp.path().join("conf/app.yaml"), b"key: value\n").unwrap();

        let archive = loaded(temp.path(), &temp.path().join("out.kaar")).await;
        let dirs: Vec<&str> = archive.directories().iter().map(String::as_str).collect();
        assert_eq!(dirs, vec!["empty/nested"]);
    }

    #[tokio::test]
    async fn test_load_builds_manifests_and_pending_slots() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("deploy.yaml"), DEPLOYMENT).unwrap();
        std::fs::write(temp.path().join("notes.txt"), "apiVersion: v1").unwrap();

        let archive = loaded(temp.path(), &temp.path().join("out.kaar")).await;

        assert_eq!(archive.state(), ArchiveState::Loaded);
        assert_eq!(archive.files().len(), 2);
        assert!(archive.files()["deploy.yaml"].is_manifest);
        assert!(!archive.files()["notes.txt"].is_manifest);

        let manifest = &archive.manifests()[0];
        let image = &manifest.images["spec.template.spec.containers.nginx"];
        assert_eq!(image.reference.as_deref(), Some("docker.io/library/nginx:1.25"));
        assert_eq!(image.status, ImageStatus::Pending);
    }

    #[tokio::test]
    async fn test_archive_path_excluded_from_walk() {
        let temp = TempDir::new().unwrap();
        let archive_path = temp.path().join("app.kaar");
        std::fs::write(&archive_path, b"stale").unwrap();
        std::fs::write(temp.path().join("a.txt"), b"a").unwrap();

        let archive = loaded(temp.path(), &archive_path).await;
        assert_eq!(archive.files().keys().collect::<Vec<_>>(), vec!["a.txt"]);
    }

    #[tokio::test]
    async fn test_state_machine_rejects_out_of_order_calls() {
        let temp = TempDir::new().unwrap();
        let mut archive = Archive::new(temp.path().join("a.kaar"));

        let err = archive.write(&CancelToken::never()).unwrap_err();
        assert!(matches!(
            err,
            KaarError::InvalidState {
                expected: "resolved",
                actual: "empty"
            }
        ));

        let err = archive
            .resolve_images(Arc::new(OfflineSource), &KaarConfig::default(), CancelToken::never())
            .await
            .unwrap_err();
        assert!(matches!(err, KaarError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_images_skipped_when_embedding_disabled() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("deploy.yaml"), DEPLOYMENT).unwrap();
        let mut archive = loaded(temp.path(), &temp.path().join("out.kaar")).await;

        let config = KaarConfig {
            embed_images: false,
            ..Default::default()
        };
        archive
            .resolve_images(Arc::new(OfflineSource), &config, CancelToken::never())
            .await
            .unwrap();

        let image = archive.manifests()[0].images.values().next().unwrap();
        assert_eq!(image.status, ImageStatus::Skipped);
        assert!(archive.report().is_clean());
        assert!(archive.images().is_empty());
    }

    #[tokio::test]
    async fn test_offline_resolution_records_failures() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("a.yaml"), DEPLOYMENT).unwrap();
        let api = DEPLOYMENT.replace("name: web", "name: api");
        std::fs::write(temp.path().join("b.yaml"), api).unwrap();
        let mut archive = loaded(temp.path(), &temp.path().join("out.kaar")).await;

        archive
            .resolve_images(Arc::new(OfflineSource), &KaarConfig::default(), CancelToken::never())
            .await
            .unwrap();

        // One report entry per reference, not per slot
        assert_eq!(archive.report().image_errors.len(), 1);
        assert_eq!(
            archive.report().image_errors[0].reference,
            "docker.io/library/nginx:1.25"
        );
        for manifest in archive.manifests() {
            let image = manifest.images.values().next().unwrap();
            assert!(matches!(image.status, ImageStatus::Failed { .. }));
        }
    }

    #[test]
    fn test_plan_detects_conflicts() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("same.txt"), b"same").unwrap();
        std::fs::write(temp.path().join("changed.txt"), b"old").unwrap();
        std::fs::create_dir(temp.path().join("dir.txt")).unwrap();
        std::fs::write(temp.path().join("blocker"), b"file").unwrap();

        let mut files = BTreeMap::new();
        files.insert("same.txt".to_string(), file("same.txt", b"same"));
        files.insert("new.txt".to_string(), file("new.txt", b"new"));
        let none = BTreeSet::new();
        let plan = plan_extraction(temp.path(), &files, &none, false).unwrap();
        let written: Vec<&str> = plan.writes.iter().map(|w| w.file.path.as_str()).collect();
        assert_eq!(written, vec!["new.txt"]);

        let mut changed = BTreeMap::new();
        changed.insert("changed.txt".to_string(), file("changed.txt", b"new"));
        let err = plan_extraction(temp.path(), &changed, &none, false).unwrap_err();
        assert!(matches!(err, KaarError::Conflict { .. }));
        let plan = plan_extraction(temp.path(), &changed, &none, true).unwrap();
        assert_eq!(plan.writes.len(), 1);
        assert_eq!(plan.writes[0].previous, Some((b"old".to_vec(), false)));

        // A directory is never replaced, even with overwrite
        let mut dir = BTreeMap::new();
        dir.insert("dir.txt".to_string(), file("dir.txt", b"x"));
        assert!(plan_extraction(temp.path(), &dir, &none, true).is_err());

        // A file where a parent directory is needed
        let mut nested = BTreeMap::new();
        nested.insert("blocker/inner.txt".to_string(), file("blocker/inner.txt", b"x"));
        let err = plan_extraction(temp.path(), &nested, &none, true).unwrap_err();
        match err {
            KaarError::Conflict { path } => assert_eq!(path, temp.path().join("blocker")),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_plan_directories() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir(temp.path().join("present")).unwrap();
        std::fs::write(temp.path().join("taken"), b"file").unwrap();

        let files = BTreeMap::new();
        let dirs: BTreeSet<String> = ["present", "empty/nested"]
            .iter()
            .map(|d| d.to_string())
            .collect();
        let plan = plan_extraction(temp.path(), &files, &dirs, false).unwrap();
        assert_eq!(plan.directories, vec!["empty/nested"]);

        let blocked: BTreeSet<String> = ["taken"].iter().map(|d| d.to_string()).collect();
        let err = plan_extraction(temp.path(), &files, &blocked, true).unwrap_err();
        assert!(matches!(err, KaarError::Conflict { .. }));
    }

    #[test]
    fn test_failed_write_rolls_back() {
        let temp = TempDir::new().unwrap();
        let out = temp.path().join("out");
        std::fs::create_dir(&out).unwrap();
        std::fs::write(out.join("keep.txt"), b"old").unwrap();

        let mut files = BTreeMap::new();
        files.insert("a/new.txt".to_string(), file("a/new.txt", b"new"));
        files.insert("keep.txt".to_string(), file("keep.txt", b"replaced"));
        let none = BTreeSet::new();
        let plan = plan_extraction(&out, &files, &none, true).unwrap();

        // Fail the second write by cancelling between steps
        let (handle, token) = CancelToken::pair();
        let mut journal = Journal::default();
        journal.create_dir_all(&out).unwrap();
        let mut writes = plan.writes.into_iter();
        let first = ExtractionPlan {
            directories: Vec::new(),
            writes: writes.by_ref().take(1).collect(),
        };
        apply_plan(&out, first, &token, &mut journal).unwrap();
        handle.cancel();
        let rest = ExtractionPlan {
            directories: Vec::new(),
            writes: writes.collect(),
        };
        let err = apply_plan(&out, rest, &token, &mut journal).unwrap_err();
        assert!(matches!(err, KaarError::Cancelled));
        assert!(out.join("a/new.txt").exists());

        journal.rollback();
        assert!(!out.join("a").exists());
        assert_eq!(std::fs::read(out.join("keep.txt")).unwrap(), b"old");
        assert_eq!(std::fs::read_dir(&out).unwrap().count(), 1);
    }

    #[test]
    fn test_overwritten_file_restored_on_rollback() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("keep.txt"), b"old").unwrap();

        let mut files = BTreeMap::new();
        files.insert("keep.txt".to_string(), file("keep.txt", b"replaced"));
        let journal = restore_tree(
            temp.path(),
            &files,
            &BTreeSet::new(),
            true,
            &CancelToken::never(),
        )
        .unwrap();
        assert_eq!(std::fs::read(temp.path().join("keep.txt")).unwrap(), b"replaced");

        journal.rollback();
        assert_eq!(std::fs::read(temp.path().join("keep.txt")).unwrap(), b"old");
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_validate_catches_dangling_digest() {
        let mut archive = Archive::new("x.kaar");
        archive.files.insert("a.yaml".to_string(), file("a.yaml", DEPLOYMENT.as_bytes()));
        let object = KubeCodec.decode(DEPLOYMENT.as_bytes()).unwrap().unwrap();
        let mut images = BTreeMap::new();
        images.insert(
            "spec.template.spec.containers.nginx".to_string(),
            ImageRef {
                raw: "nginx:1.25".to_string(),
                reference: Some("docker.io/library/nginx:1.25".to_string()),
                status: ImageStatus::Resolved {
                    digest: "sha256:missing".to_string(),
                },
            },
        );
        archive.manifests.push(Manifest {
            path: "a.yaml".to_string(),
            document: 0,
            object,
            images,
        });

        let err = archive.validate().unwrap_err();
        assert!(err.to_string().contains("sha256:missing"));
    }

    #[test]
    fn test_image_status_serialization() {
        let image = ImageRef {
            raw: "nginx".to_string(),
            reference: Some("docker.io/library/nginx:latest".to_string()),
            status: ImageStatus::Failed {
                error: "not found".to_string(),
            },
        };
        let yaml = serde_yaml::to_string(&image).unwrap();
        assert!(yaml.contains("state: failed"));
        assert!(yaml.contains("error: not found"));

        let back: ImageRef = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back, image);
    }
}
