//! Registry credentials from Docker's `config.json`
//!
//! Only static `auths` entries are read; credential helpers are not run.
//! Registries without an entry are accessed anonymously.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use oci_distribution::secrets::RegistryAuth;
use serde::{Deserialize, Serialize};

use crate::error::{RegistryError, Result};

/// Keys Docker uses for Docker Hub in `config.json`
const DOCKER_HUB_KEYS: &[&str] = &[
    "https://index.docker.io/v1/",
    "index.docker.io",
    "registry-1.docker.io",
    "docker.io",
];

/// Docker config.json format
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DockerConfig {
    #[serde(default)]
    pub auths: HashMap<String, DockerAuth>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DockerAuth {
    /// base64 of `username:password`
    #[serde(default)]
    pub auth: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl DockerConfig {
    /// Load from `~/.docker/config.json`, or `$DOCKER_CONFIG/config.json`
    ///
    /// A missing file yields an empty config.
    pub fn load() -> Result<Self> {
        match Self::default_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn default_path() -> Option<PathBuf> {
        if let Some(dir) = std::env::var_os("DOCKER_CONFIG") {
            return Some(PathBuf::from(dir).join("config.json"));
        }
        dirs::home_dir().map(|home| home.join(".docker").join("config.json"))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| RegistryError::DockerConfig {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        serde_json::from_str(&content).map_err(|e| RegistryError::DockerConfig {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Auth entry for a registry host
    fn entry_for(&self, registry: &str) -> Option<&DockerAuth> {
        let candidates: Vec<String> = if DOCKER_HUB_KEYS.contains(&registry) {
            DOCKER_HUB_KEYS.iter().map(|k| k.to_string()).collect()
        } else {
            vec![
                registry.to_string(),
                format!("https://{}", registry),
                format!("http://{}", registry),
                format!("https://{}/v1/", registry),
            ]
        };
        candidates.iter().find_map(|key| self.auths.get(key))
    }

    /// Registry auth for a host, anonymous when no entry exists
    pub fn auth_for(&self, registry: &str) -> Result<RegistryAuth> {
        let Some(entry) = self.entry_for(registry) else {
            return Ok(RegistryAuth::Anonymous);
        };

        if let (Some(username), Some(password)) = (&entry.username, &entry.password) {
            return Ok(RegistryAuth::Basic(username.clone(), password.clone()));
        }

        let Some(encoded) = &entry.auth else {
            return Ok(RegistryAuth::Anonymous);
        };
        let invalid = |message: String| RegistryError::InvalidCredentials {
            registry: registry.to_string(),
            message,
        };
        let decoded = STANDARD
            .decode(encoded.trim())
            .map_err(|e| invalid(e.to_string()))?;
        let decoded = String::from_utf8(decoded).map_err(|e| invalid(e.to_string()))?;
        let (username, password) = decoded
            .split_once(':')
            .ok_or_else(|| invalid("expected username:password".to_string()))?;
        Ok(RegistryAuth::Basic(username.to_string(), password.to_string()))
    }
}
