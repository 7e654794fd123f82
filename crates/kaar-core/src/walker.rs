//! Recursive directory enumeration
//!
//! Walks a directory depth-first in lexical order and yields every
//! subdirectory and regular file with its path relative to the root.
//! Symlinks are never followed and never archived: they are reported as
//! skipped entries regardless of platform.

use std::fs::Metadata;
use std::path::{Component, Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{IoContext, KaarError, Result};
use crate::report::WalkIssue;

/// Extensions treated as candidate manifest files
const MANIFEST_EXTENSIONS: &[&str] = &["yaml", "yml", "json"];

/// A regular file found under the root
#[derive(Debug)]
pub struct WalkedFile {
    /// Relative path, `/`-separated on every platform
    pub path: String,
    pub metadata: Metadata,
    pub content: Vec<u8>,
}

impl WalkedFile {
    /// Whether the file should be handed to the manifest parser
    pub fn is_manifest_candidate(&self) -> bool {
        is_manifest_candidate(&self.path)
    }
}

/// One step of the walk
#[derive(Debug)]
pub enum WalkEntry {
    /// A subdirectory, yielded before its contents
    Dir(String),
    File(WalkedFile),
    /// A symlink left out of the archive
    Skipped(String),
    /// A sub-entry that could not be read; siblings are unaffected
    Failed(WalkIssue),
}

/// Restartable walker over a directory snapshot
#[derive(Debug, Clone)]
pub struct DirWalker {
    root: PathBuf,
    exclude: Vec<PathBuf>,
}

impl DirWalker {
    /// Create a walker, failing if the root is missing or unreadable
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let metadata = std::fs::metadata(&root).at(&root)?;
        if !metadata.is_dir() {
            return Err(KaarError::io(
                &root,
                std::io::Error::new(std::io::ErrorKind::NotADirectory, "not a directory"),
            ));
        }
        // Surface permission problems on the root itself up front
        std::fs::read_dir(&root).at(&root)?;

        Ok(Self {
            root,
            exclude: Vec::new(),
        })
    }

    /// Leave a path out of the walk (e.g. the kaarball being written)
    pub fn exclude(mut self, path: impl Into<PathBuf>) -> Self {
        self.exclude.push(path.into());
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Start a fresh lazy pass over the directory
    pub fn entries(&self) -> impl Iterator<Item = WalkEntry> + '_ {
        WalkDir::new(&self.root)
            .follow_links(false)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_map(move |entry| match entry {
                Ok(entry) => self.visit(entry.path(), entry.file_type()),
                Err(err) => {
                    let path = err
                        .path()
                        .map(|p| self.relative(p).unwrap_or_else(|| p.display().to_string()))
                        .unwrap_or_default();
                    Some(WalkEntry::Failed(WalkIssue {
                        path,
                        message: err.to_string(),
                    }))
                }
            })
    }

    fn visit(&self, path: &Path, file_type: std::fs::FileType) -> Option<WalkEntry> {
        if self.exclude.iter().any(|e| e == path) {
            return None;
        }

        let Some(relative) = self.relative(path) else {
            return Some(WalkEntry::Failed(WalkIssue {
                path: path.display().to_string(),
                message: "path is not valid UTF-8".to_string(),
            }));
        };

        if file_type.is_dir() {
            return Some(WalkEntry::Dir(relative));
        }

        if file_type.is_symlink() {
            tracing::debug!(path = %relative, "skipping symlink");
            return Some(WalkEntry::Skipped(relative));
        }
        if !file_type.is_file() {
            tracing::debug!(path = %relative, "skipping special file");
            return Some(WalkEntry::Skipped(relative));
        }

        let read = std::fs::symlink_metadata(path)
            .and_then(|metadata| std::fs::read(path).map(|content| (metadata, content)));
        match read {
            Ok((metadata, content)) => Some(WalkEntry::File(WalkedFile {
                path: relative,
                metadata,
                content,
            })),
            Err(err) => {
                tracing::warn!(path = %relative, error = %err, "unable to read file");
                Some(WalkEntry::Failed(WalkIssue {
                    path: relative,
                    message: err.to_string(),
                }))
            }
        }
    }

    /// Relative `/`-joined path, `None` if any component is not UTF-8
    fn relative(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let mut parts = Vec::new();
        for component in rel.components() {
            match component {
                Component::Normal(part) => parts.push(part.to_str()?),
                _ => return None,
            }
        }
        Some(parts.join("/"))
    }
}

/// Whether a relative path names a candidate manifest file
pub fn is_manifest_candidate(path: &str) -> bool {
    Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            MANIFEST_EXTENSIONS
                .iter()
                .any(|candidate| ext.eq_ignore_ascii_case(candidate))
        })
        .unwrap_or(false)
}
