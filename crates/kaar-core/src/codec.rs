//! Kubernetes object codec
//!
//! Decodes a single YAML document into a [`KubeObject`]. Well-known
//! workload and config kinds are decoded into typed `k8s-openapi` structs;
//! any other `apiVersion`/`kind` pair is kept as a [`DynamicObject`] so that
//! custom resources still take part in image discovery.

use k8s_openapi::Resource;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{
    ConfigMap, Namespace, Pod, PodTemplate, ReplicationController, Secret, Service,
    ServiceAccount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use thiserror::Error;

/// Why a document is not a usable Kubernetes object
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct CodecError {
    pub message: String,
}

impl CodecError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Supplied object decoder
///
/// `Ok(None)` means the document carried no content (whitespace, comments
/// or an explicit null) and is skipped silently.
pub trait ObjectCodec: Send + Sync {
    fn decode(&self, document: &[u8]) -> Result<Option<KubeObject>, CodecError>;
}

/// A Kubernetes object of a kind the codec does not know statically
#[derive(Debug, Clone, PartialEq)]
pub struct DynamicObject {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    /// Full document, including `apiVersion`, `kind` and `metadata`
    pub body: serde_json::Value,
}

macro_rules! kube_objects {
    ($($variant:ident => $ty:ty),* $(,)?) => {
        /// A decoded Kubernetes API object
        #[derive(Debug, Clone, PartialEq)]
        pub enum KubeObject {
            $($variant(Box<$ty>),)*
            Dynamic(Box<DynamicObject>),
        }

        impl KubeObject {
            /// Decode into a typed struct when `apiVersion`/`kind` is well known
            fn decode_typed(
                api_version: &str,
                kind: &str,
                value: serde_yaml::Value,
            ) -> Option<Result<Self, serde_yaml::Error>> {
                $(
                    if api_version == <$ty as Resource>::API_VERSION
                        && kind == <$ty as Resource>::KIND
                    {
                        return Some(
                            serde_yaml::from_value::<$ty>(value)
                                .map(|obj| KubeObject::$variant(Box::new(obj))),
                        );
                    }
                )*
                None
            }

            pub fn api_version(&self) -> &str {
                match self {
                    $(KubeObject::$variant(_) => <$ty as Resource>::API_VERSION,)*
                    KubeObject::Dynamic(obj) => &obj.api_version,
                }
            }

            pub fn kind(&self) -> &str {
                match self {
                    $(KubeObject::$variant(_) => <$ty as Resource>::KIND,)*
                    KubeObject::Dynamic(obj) => &obj.kind,
                }
            }

            pub fn metadata(&self) -> &ObjectMeta {
                match self {
                    $(KubeObject::$variant(obj) => &obj.metadata,)*
                    KubeObject::Dynamic(obj) => &obj.metadata,
                }
            }
        }
    };
}

kube_objects! {
    Pod => Pod,
    PodTemplate => PodTemplate,
    ReplicationController => ReplicationController,
    Deployment => Deployment,
    ReplicaSet => ReplicaSet,
    StatefulSet => StatefulSet,
    DaemonSet => DaemonSet,
    Job => Job,
    CronJob => CronJob,
    Service => Service,
    ConfigMap => ConfigMap,
    Secret => Secret,
    ServiceAccount => ServiceAccount,
    Namespace => Namespace,
}

impl KubeObject {
    pub fn name(&self) -> Option<&str> {
        self.metadata().name.as_deref()
    }

    pub fn namespace(&self) -> Option<&str> {
        self.metadata().namespace.as_deref()
    }

    /// `Kind/name` for logs
    pub fn display_name(&self) -> String {
        format!("{}/{}", self.kind(), self.name().unwrap_or("unnamed"))
    }
}

/// Default codec backed by `serde_yaml` and `k8s-openapi`
#[derive(Debug, Clone, Copy, Default)]
pub struct KubeCodec;

impl ObjectCodec for KubeCodec {
    fn decode(&self, document: &[u8]) -> Result<Option<KubeObject>, CodecError> {
        let text = std::str::from_utf8(document)
            .map_err(|e| CodecError::new(format!("document is not valid UTF-8: {}", e)))?;
        if is_blank_document(text) {
            return Ok(None);
        }

        let value: serde_yaml::Value = serde_yaml::from_str(text)
            .map_err(|e| CodecError::new(format!("YAML parse error: {}", e)))?;

        let mapping = match &value {
            serde_yaml::Value::Null => return Ok(None),
            serde_yaml::Value::Mapping(mapping) => mapping,
            _ => return Err(CodecError::new("not a Kubernetes object: expected a mapping")),
        };

        let api_version = string_field(mapping, "apiVersion")?;
        let kind = string_field(mapping, "kind")?;

        if let Some(typed) = KubeObject::decode_typed(&api_version, &kind, value.clone()) {
            return typed
                .map(Some)
                .map_err(|e| CodecError::new(format!("invalid {}: {}", kind, e)));
        }

        let body = serde_json::to_value(&value)
            .map_err(|e| CodecError::new(format!("unsupported YAML content: {}", e)))?;
        let metadata = match body.get("metadata") {
            Some(meta) => serde_json::from_value::<ObjectMeta>(meta.clone())
                .map_err(|e| CodecError::new(format!("invalid metadata: {}", e)))?,
            None => ObjectMeta::default(),
        };

        Ok(Some(KubeObject::Dynamic(Box::new(DynamicObject {
            api_version,
            kind,
            metadata,
            body,
        }))))
    }
}

fn string_field(mapping: &serde_yaml::Mapping, key: &str) -> Result<String, CodecError> {
    match mapping.get(key) {
        Some(serde_yaml::Value::String(s)) if !s.trim().is_empty() => Ok(s.clone()),
        Some(_) => Err(CodecError::new(format!(
            "not a Kubernetes object: {} must be a non-empty string",
            key
        ))),
        None => Err(CodecError::new(format!(
            "not a Kubernetes object: missing {}",
            key
        ))),
    }
}

/// Whitespace, comments and document end markers only
pub fn is_blank_document(text: &str) -> bool {
    text.lines().all(|line| {
        let line = line.trim();
        line.is_empty() || line.starts_with('#') || line == "..."
    })
}
