//! Kaar Registry - OCI registry image source
//!
//! This crate provides the network side of packing:
//! - `OciImageSource`: pulls images with `oci-distribution`
//! - `DockerConfig`: credentials from Docker's `config.json`
//! - `build_layout`: deterministic OCI layout tarballs

pub mod credentials;
pub mod error;
pub mod layout;
pub mod oci;

pub use credentials::{DockerAuth, DockerConfig};
pub use error::{RegistryError, Result};
pub use layout::{LayoutImage, build_layout};
pub use oci::{OciImageSource, package_image, to_oci_reference};
