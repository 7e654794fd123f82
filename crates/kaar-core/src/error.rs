//! Core error types

use std::ops::Range;
use std::path::PathBuf;

use thiserror::Error;

use crate::report::{DecodeIssue, ImageIssue, SinkIssue};

#[derive(Error, Debug)]
pub enum KaarError {
    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "failed to decode {path} document {index} (bytes {}..{}): {message}",
        .bytes.start,
        .bytes.end
    )]
    Decode {
        path: String,
        index: usize,
        bytes: Range<usize>,
        message: String,
    },

    #[error("unable to resolve image {reference}: {message}")]
    ImageResolution { reference: String, message: String },

    #[error("corrupt kaarball: {message}")]
    CorruptArchive { message: String },

    #[error("destination already contains {path}")]
    Conflict { path: PathBuf },

    #[error("archive is {actual}, expected {expected}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("image sink failed for {digest}: {message}")]
    Sink { digest: String, message: String },

    #[error("invalid configuration: {message}")]
    Config { message: String },

    #[error("worker task failed: {message}")]
    Task { message: String },

    #[error("operation cancelled")]
    Cancelled,
}

impl KaarError {
    /// Attach a path to an IO error
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::CorruptArchive {
            message: message.into(),
        }
    }

}

// Recorded problems render through the same messages as raised errors

impl From<&DecodeIssue> for KaarError {
    fn from(issue: &DecodeIssue) -> Self {
        Self::Decode {
            path: issue.path.clone(),
            index: issue.index,
            bytes: issue.bytes.clone(),
            message: issue.message.clone(),
        }
    }
}

impl From<&ImageIssue> for KaarError {
    fn from(issue: &ImageIssue) -> Self {
        Self::ImageResolution {
            reference: issue.reference.clone(),
            message: issue.message.clone(),
        }
    }
}

impl From<&SinkIssue> for KaarError {
    fn from(issue: &SinkIssue) -> Self {
        Self::Sink {
            digest: issue.digest.clone(),
            message: issue.message.clone(),
        }
    }
}

pub type Result<T> = std::result::Result<T, KaarError>;

/// Extension for attaching a path to `std::io::Result`
pub(crate) trait IoContext<T> {
    fn at(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn at(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|e| KaarError::io(path, e))
    }
}
