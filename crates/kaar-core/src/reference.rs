//! Container image reference normalization
//!
//! Two spellings of the same image (`nginx`, `nginx:latest`,
//! `docker.io/library/nginx:latest`) normalize to one string, which is the
//! identity the image store deduplicates on.

use std::fmt;

use crate::config::DEFAULT_REGISTRY;

/// Tag assumed when a reference has neither tag nor digest
pub const DEFAULT_TAG: &str = "latest";

/// Docker Hub namespace for single-segment repositories
const OFFICIAL_NAMESPACE: &str = "library";

/// Hosts that all mean Docker Hub
const DOCKER_HUB_ALIASES: &[&str] = &["docker.io", "index.docker.io", "registry-1.docker.io"];

/// Parsed and normalized image reference
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageReference {
    /// Registry hostname, with port if any
    pub registry: String,
    /// Repository path (e.g. `library/nginx`)
    pub repository: String,
    /// Tag, absent when the reference is pinned by digest
    pub tag: Option<String>,
    /// Digest (`algorithm:hex`)
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse against the default registry
    pub fn parse(raw: &str) -> Result<Self, String> {
        Self::parse_with_registry(raw, DEFAULT_REGISTRY)
    }

    /// Parse a raw reference, filling in `default_registry` when none is given
    pub fn parse_with_registry(raw: &str, default_registry: &str) -> Result<Self, String> {
        let reference = raw.trim();
        if reference.is_empty() {
            return Err("empty image reference".to_string());
        }
        if reference.chars().any(char::is_whitespace) {
            return Err(format!("image reference '{}' contains whitespace", reference));
        }

        let (name_tag, digest) = match reference.split_once('@') {
            Some((name_tag, digest)) => {
                validate_digest(digest)?;
                (name_tag, Some(digest.to_string()))
            }
            None => (reference, None),
        };

        // A tag colon only counts after the last slash, otherwise it is a port
        let (name, tag) = match name_tag.rfind(':') {
            Some(colon) if !name_tag[colon..].contains('/') => {
                let tag = &name_tag[colon + 1..];
                if tag.is_empty() {
                    return Err(format!("image reference '{}' has an empty tag", reference));
                }
                (&name_tag[..colon], Some(tag.to_string()))
            }
            _ => (name_tag, None),
        };

        let (registry, repository) = split_registry(name, default_registry);
        if repository.is_empty() || repository.split('/').any(str::is_empty) {
            return Err(format!("image reference '{}' has an empty path component", reference));
        }
        if repository.chars().any(|c| c.is_ascii_uppercase()) {
            return Err(format!(
                "repository '{}' must be lowercase",
                repository
            ));
        }

        // A digest pins content, so the tag no longer identifies anything
        let tag = match (&digest, tag) {
            (Some(_), _) => None,
            (None, Some(tag)) => Some(tag),
            (None, None) => Some(DEFAULT_TAG.to_string()),
        };

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Canonical string form used as the deduplication key
    pub fn normalized(&self) -> String {
        self.to_string()
    }

    /// Repository with registry, without tag or digest
    pub fn name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)
        } else if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)
        } else {
            Ok(())
        }
    }
}

fn split_registry(name: &str, default_registry: &str) -> (String, String) {
    let (registry, repository) = match name.split_once('/') {
        Some((first, rest)) if is_registry_host(first) => (first.to_string(), rest.to_string()),
        _ => (default_registry.to_string(), name.to_string()),
    };

    if DOCKER_HUB_ALIASES.contains(&registry.as_str()) {
        let repository = if repository.contains('/') {
            repository
        } else {
            format!("{}/{}", OFFICIAL_NAMESPACE, repository)
        };
        return (DEFAULT_REGISTRY.to_string(), repository);
    }
    (registry, repository)
}

fn is_registry_host(segment: &str) -> bool {
    segment.contains('.') || segment.contains(':') || segment == "localhost"
}

fn validate_digest(digest: &str) -> Result<(), String> {
    let Some((algorithm, hex)) = digest.split_once(':') else {
        return Err(format!("invalid digest '{}': expected algorithm:hex", digest));
    };
    if algorithm.is_empty() || hex.is_empty() {
        return Err(format!("invalid digest '{}': expected algorithm:hex", digest));
    }
    if algorithm == "sha256" && (hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit())) {
        return Err(format!("invalid sha256 digest '{}'", digest));
    }
    Ok(())
}
