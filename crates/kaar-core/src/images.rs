//! Container image discovery
//!
//! Collects every `image` used by a decoded object. Typed workloads are
//! inspected through their pod template; anything else is searched
//! structurally for `containers`, `initContainers` and
//! `ephemeralContainers` lists, so new workload kinds need no code change.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::PodSpec;

use crate::codec::KubeObject;

/// Pod spec fields that hold container lists
const CONTAINER_FIELDS: &[&str] = &["containers", "initContainers", "ephemeralContainers"];

/// Images used by one object, keyed by slot id
///
/// A slot id is the dotted location of the container inside the object,
/// e.g. `spec.template.spec.initContainers.migrate`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerImages {
    slots: BTreeMap<String, String>,
}

impl ContainerImages {
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Slot id and raw reference pairs
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.slots.iter().map(|(slot, image)| (slot.as_str(), image.as_str()))
    }

    /// Distinct raw references (duplicates within the object collapsed)
    pub fn references(&self) -> BTreeSet<&str> {
        self.slots.values().map(String::as_str).collect()
    }

    fn insert(&mut self, slot: String, image: &str) {
        let image = image.trim();
        if !image.is_empty() {
            self.slots.insert(slot, image.to_string());
        }
    }
}

/// Find every container image referenced by an object
pub fn resolve_images(object: &KubeObject) -> ContainerImages {
    let mut images = ContainerImages::default();
    match object {
        KubeObject::Dynamic(dynamic) => visit_value(&dynamic.body, "", &mut images),
        typed => {
            if let Some((prefix, spec)) = pod_spec(typed) {
                collect_pod_spec(prefix, spec, &mut images);
            }
        }
    }
    images
}

/// Pod-template-shaped substructure of a typed object, with its location
fn pod_spec(object: &KubeObject) -> Option<(&'static str, &PodSpec)> {
    match object {
        KubeObject::Pod(pod) => Some(("spec", pod.spec.as_ref()?)),
        KubeObject::PodTemplate(tpl) => {
            Some(("template.spec", tpl.template.as_ref()?.spec.as_ref()?))
        }
        KubeObject::ReplicationController(rc) => Some((
            "spec.template.spec",
            rc.spec.as_ref()?.template.as_ref()?.spec.as_ref()?,
        )),
        KubeObject::Deployment(d) => {
            Some(("spec.template.spec", d.spec.as_ref()?.template.spec.as_ref()?))
        }
        KubeObject::ReplicaSet(rs) => Some((
            "spec.template.spec",
            rs.spec.as_ref()?.template.as_ref()?.spec.as_ref()?,
        )),
        KubeObject::StatefulSet(s) => {
            Some(("spec.template.spec", s.spec.as_ref()?.template.spec.as_ref()?))
        }
        KubeObject::DaemonSet(ds) => {
            Some(("spec.template.spec", ds.spec.as_ref()?.template.spec.as_ref()?))
        }
        KubeObject::Job(job) => {
            Some(("spec.template.spec", job.spec.as_ref()?.template.spec.as_ref()?))
        }
        KubeObject::CronJob(cj) => Some((
            "spec.jobTemplate.spec.template.spec",
            cj.spec.as_ref()?.job_template.spec.as_ref()?.template.spec.as_ref()?,
        )),
        _ => None,
    }
}

fn collect_pod_spec(prefix: &str, spec: &PodSpec, images: &mut ContainerImages) {
    for c in &spec.containers {
        if let Some(image) = &c.image {
            images.insert(format!("{}.containers.{}", prefix, c.name), image);
        }
    }
    for c in spec.init_containers.iter().flatten() {
        if let Some(image) = &c.image {
            images.insert(format!("{}.initContainers.{}", prefix, c.name), image);
        }
    }
    for c in spec.ephemeral_containers.iter().flatten() {
        if let Some(image) = &c.image {
            images.insert(format!("{}.ephemeralContainers.{}", prefix, c.name), image);
        }
    }
}

fn visit_value(value: &serde_json::Value, path: &str, images: &mut ContainerImages) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, child) in map {
                let child_path = join(path, key);
                match child {
                    serde_json::Value::Array(items) if CONTAINER_FIELDS.contains(&key.as_str()) => {
                        collect_container_list(&child_path, items, images);
                    }
                    _ => visit_value(child, &child_path, images),
                }
            }
        }
        serde_json::Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                visit_value(item, &format!("{}[{}]", path, i), images);
            }
        }
        _ => {}
    }
}

fn collect_container_list(path: &str, items: &[serde_json::Value], images: &mut ContainerImages) {
    for (i, item) in items.iter().enumerate() {
        let Some(image) = item.get("image").and_then(|v| v.as_str()) else {
            continue;
        };
        let name = item
            .get("name")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| i.to_string());
        images.insert(format!("{}.{}", path, name), image);
    }
}

fn join(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", path, key)
    }
}
