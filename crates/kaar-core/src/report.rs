//! Aggregated per-file, per-document and per-image problems
//!
//! Non-fatal failures are collected here and attached to the archive
//! instead of aborting the operation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;

use crate::error::KaarError;

/// A file the walker could not read
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalkIssue {
    pub path: String,
    pub message: String,
}

/// A YAML document that did not decode into a Kubernetes object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodeIssue {
    pub path: String,
    pub index: usize,
    pub bytes: Range<usize>,
    pub message: String,
}

/// An image reference that could not be fetched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageIssue {
    pub reference: String,
    pub message: String,
}

/// An embedded image the sink refused
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkIssue {
    pub digest: String,
    pub message: String,
}

/// Structured report of everything that went wrong without aborting
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub walk_errors: Vec<WalkIssue>,
    pub decode_errors: Vec<DecodeIssue>,
    pub image_errors: Vec<ImageIssue>,
    pub sink_errors: Vec<SinkIssue>,
    /// Entries deliberately left out (symlinks)
    pub skipped: Vec<String>,
}

impl Report {
    /// Check if nothing went wrong
    pub fn is_clean(&self) -> bool {
        self.problem_count() == 0
    }

    /// Number of recorded problems (skipped entries are not problems)
    pub fn problem_count(&self) -> usize {
        self.walk_errors.len()
            + self.decode_errors.len()
            + self.image_errors.len()
            + self.sink_errors.len()
    }

    /// Short one-line summary
    pub fn summary(&self) -> String {
        let mut parts = Vec::with_capacity(5);
        if !self.walk_errors.is_empty() {
            parts.push(format!("{} unreadable file(s)", self.walk_errors.len()));
        }
        if !self.decode_errors.is_empty() {
            parts.push(format!("{} undecodable document(s)", self.decode_errors.len()));
        }
        if !self.image_errors.is_empty() {
            parts.push(format!("{} unresolved image(s)", self.image_errors.len()));
        }
        if !self.sink_errors.is_empty() {
            parts.push(format!("{} image load failure(s)", self.sink_errors.len()));
        }
        if !self.skipped.is_empty() {
            parts.push(format!("{} skipped", self.skipped.len()));
        }
        if parts.is_empty() {
            "no problems".to_string()
        } else {
            parts.join(", ")
        }
    }

}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.summary())?;
        for issue in &self.walk_errors {
            writeln!(f, "  file {}: {}", issue.path, issue.message)?;
        }
        for issue in &self.decode_errors {
            writeln!(f, "  {}", KaarError::from(issue))?;
        }
        for issue in &self.image_errors {
            writeln!(f, "  {}", KaarError::from(issue))?;
        }
        for issue in &self.sink_errors {
            writeln!(f, "  {}", KaarError::from(issue))?;
        }
        for path in &self.skipped {
            writeln!(f, "  skipped {}", path)?;
        }
        Ok(())
    }
}
