//! Error types for registry operations

use std::path::PathBuf;

use thiserror::Error;

/// Registry operation errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Invalid image reference {reference}: {message}")]
    InvalidReference { reference: String, message: String },

    #[error("Failed to pull {reference}: {message}")]
    PullFailed { reference: String, message: String },

    #[error("Registry returned no manifest for {reference}")]
    MissingManifest { reference: String },

    #[error("Unable to read Docker config {path}: {message}")]
    DockerConfig { path: PathBuf, message: String },

    #[error("Invalid credentials for {registry}: {message}")]
    InvalidCredentials { registry: String, message: String },

    #[error("Unable to build image layout: {0}")]
    Layout(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RegistryError>;
