//! Kaar Core - archive engine for the Kubernetes application archiver
//!
//! This crate packs a directory of Kubernetes manifests and supporting
//! files into a single kaarball and unpacks it again:
//! - `DirWalker`: deterministic, symlink-free directory enumeration
//! - `KubeCodec`: multi-document YAML decoding into typed objects
//! - `resolve_images`: container image discovery over pod templates
//! - `ImageStore`: deduplicating, content-addressed image embedding
//! - `Archive`: the pack/unpack aggregate, writer and reader

pub mod archive;
pub mod cancel;
pub mod codec;
pub mod config;
pub mod error;
pub mod format;
pub mod images;
pub mod parser;
pub mod reader;
pub mod reference;
pub mod report;
pub mod sink;
pub mod store;
pub mod walker;
pub mod writer;

pub use archive::{
    Archive, ArchiveState, FileEntry, ImageRef, ImageStatus, Manifest, create, extract, list,
    verify,
};
pub use cancel::{CancelHandle, CancelToken};
pub use codec::{CodecError, DynamicObject, KubeCodec, KubeObject, ObjectCodec};
pub use config::{KaarConfig, resolve_path};
pub use error::{KaarError, Result};
pub use format::{ImageRecord, ManifestIndex, ManifestRecord};
pub use images::{ContainerImages, resolve_images};
pub use parser::{ParsedFile, parse_file, split_documents};
pub use reader::ArchiveReader;
pub use reference::ImageReference;
pub use report::Report;
pub use sink::{DirectorySink, ImageSink, NullSink, SinkError};
pub use store::{FetchedImage, ImageBlob, ImageSource, ImageStore, OfflineSource, SourceError};
pub use walker::DirWalker;
