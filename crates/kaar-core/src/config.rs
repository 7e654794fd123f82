//! Operation configuration
//!
//! Every pack/unpack call receives a [`KaarConfig`] value instead of
//! reading process-wide settings. Defaults can be overridden from
//! `~/.config/kaar/config.yaml`; command line flags override the file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{IoContext, KaarError, Result};

/// Default registry for references without an explicit registry host
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// Configuration for a single archive operation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct KaarConfig {
    /// Worker pool width for manifest parsing
    pub jobs: usize,

    /// Maximum number of concurrent image fetches
    pub fetch_concurrency: usize,

    /// Optional per-image fetch timeout, handed to the image source wrapper
    #[serde(with = "humantime_serde")]
    pub fetch_timeout: Option<Duration>,

    /// Replace conflicting files when extracting
    pub overwrite: bool,

    /// Fetch and embed container images when packing
    pub embed_images: bool,

    /// Registry assumed for references without a registry host
    pub default_registry: String,

    /// Emit the full aggregated report
    #[serde(skip)]
    pub verbose: bool,

    /// Version string recorded by the caller
    #[serde(skip)]
    pub version: String,
}

impl Default for KaarConfig {
    fn default() -> Self {
        Self {
            jobs: std::thread::available_parallelism()
                .map(usize::from)
                .unwrap_or(4),
            fetch_concurrency: 4,
            fetch_timeout: None,
            overwrite: false,
            embed_images: true,
            default_registry: DEFAULT_REGISTRY.to_string(),
            verbose: false,
            version: String::new(),
        }
    }
}

impl KaarConfig {
    /// Load configuration from the default location, falling back to defaults
    pub fn load() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).at(path)?;
        let config: Self = serde_yaml::from_str(&content).map_err(|e| KaarError::Config {
            message: format!("{}: {}", path.display(), e),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Default configuration path
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("kaar").join("config.yaml"))
    }

    /// Reject values that would stall the worker pools
    pub fn validate(&self) -> Result<()> {
        if self.jobs == 0 {
            return Err(KaarError::Config {
                message: "jobs must be at least 1".to_string(),
            });
        }
        if self.fetch_concurrency == 0 {
            return Err(KaarError::Config {
                message: "fetchConcurrency must be at least 1".to_string(),
            });
        }
        if self.default_registry.trim().is_empty() {
            return Err(KaarError::Config {
                message: "defaultRegistry must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

/// Expand `~` and make a path absolute against the current directory
pub fn resolve_path(path: &Path) -> PathBuf {
    let expanded = match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    };

    if expanded.is_absolute() {
        return expanded;
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(expanded),
        Err(_) => expanded,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_valid() {
        let config = KaarConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.embed_images);
        assert_eq!(config.default_registry, "docker.io");
        assert!(config.fetch_timeout.is_none());
    }

    #[test]
    fn test_load_from_yaml() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.yaml");
        std::fs::write(
            &path,
            "jobs: 2\nfetchConcurrency: 8\nfetchTimeout: 30s\noverwrite: true\n",
        )
        .unwrap();

        let config = KaarConfig::load_from(&path).unwrap();
        assert_eq!(config.jobs, 2);
        assert_eq!(config.fetch_concurrency, 8);
        assert_eq!(config.fetch_timeout, Some(Duration::from_secs(30)));
        assert!(config.overwrite);
        // Unset keys keep their defaults
        assert!(config.embed_images);
    }

    #[test]
    fn test_zero_jobs_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.yaml");
        std::fs::write(&path, "jobs: 0\n").unwrap();

        let err = KaarConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, KaarError::Config { .. }));
    }

    #[test]
    fn test_resolve_path_absolute_unchanged() {
        let path = Path::new("/tmp/app");
        assert_eq!(resolve_path(path), PathBuf::from("/tmp/app"));
    }

    #[test]
    fn test_resolve_path_relative_becomes_absolute() {
        let resolved = resolve_path(Path::new("app"));
        assert!(resolved.is_absolute());
        assert!(resolved.ends_with("app"));
    }

    #[test]
    fn test_resolve_path_tilde() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(resolve_path(Path::new("~/app")), home.join("app"));
        }
    }
}
