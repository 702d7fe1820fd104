//! Patch catalog for component images.
//!
//! A [`Patch`] is a list of set-operations on a machine configuration
//! document. Applying a patch twice leaves the document as after the first
//! application, which is what makes re-applying a step after a crash safe.

use semver::Version;
use serde_json::{Map, Value};

use crate::config::ImageRepositories;
use crate::controller::component::Component;
use crate::controller::error::Result;

/// Image reference for a component: a release tag or a pre-resolved digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ImageRef {
    /// Release version, rendered as `repo:v1.31.4`.
    Tag(Version),
    /// Content digest (e.g., `sha256:...`), rendered as `repo@sha256:...`.
    Digest(String),
}

impl ImageRef {
    /// Full image reference within a repository.
    pub fn image(&self, repository: &str) -> String {
        match self {
            ImageRef::Tag(v) => format!("{repository}:v{v}"),
            ImageRef::Digest(d) => format!("{repository}@{d}"),
        }
    }
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageRef::Tag(v) => write!(f, "v{v}"),
            ImageRef::Digest(d) => f.write_str(d),
        }
    }
}

/// Set `path` to `value` in a configuration document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchOp {
    /// Dot-separated document path (e.g., `cluster.apiServer.image`).
    pub path: String,
    pub value: Value,
}

impl PatchOp {
    /// Apply the operation; returns whether the document changed.
    fn apply(&self, doc: &mut Value) -> bool {
        let mut node = doc;
        let mut segments = self.path.split('.').peekable();
        while let Some(segment) = segments.next() {
            if !node.is_object() {
                *node = Value::Object(Map::new());
            }
            let Some(map) = node.as_object_mut() else {
                return false;
            };
            if segments.peek().is_none() {
                if map.get(segment) == Some(&self.value) {
                    return false;
                }
                map.insert(segment.to_string(), self.value.clone());
                return true;
            }
            node = map
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
        }
        false
    }
}

/// Named, idempotent configuration mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patch {
    pub name: String,
    pub ops: Vec<PatchOp>,
    /// Images the patched configuration will pull.
    pub used_images: Vec<String>,
}

impl Patch {
    /// Apply every operation in order; returns whether the document changed.
    pub fn apply(&self, doc: &mut Value) -> bool {
        self.ops
            .iter()
            .fold(false, |changed, op| op.apply(doc) | changed)
    }

    /// Fold several patches into one, keeping operation order.
    pub fn compose<I>(patches: I) -> Patch
    where
        I: IntoIterator<Item = Patch>,
    {
        let mut names = Vec::new();
        let mut ops = Vec::new();
        let mut used_images = Vec::new();
        for patch in patches {
            names.push(patch.name);
            ops.extend(patch.ops);
            used_images.extend(patch.used_images);
        }
        Patch {
            name: names.join("+"),
            ops,
            used_images,
        }
    }

    /// Apply on top of an existing YAML document and render the result.
    ///
    /// Returns `None` when the document already contains the patch.
    pub fn apply_to_yaml(&self, existing: &str) -> Result<Option<String>> {
        let mut doc: Value = if existing.trim().is_empty() {
            Value::Object(Map::new())
        } else {
            serde_yaml::from_str(existing)?
        };
        if !self.apply(&mut doc) {
            return Ok(None);
        }
        Ok(Some(serde_yaml::to_string(&doc)?))
    }
}

/// Produces component image patches from configured repositories.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchCatalog {
    repositories: ImageRepositories,
}

impl PatchCatalog {
    pub fn new(repositories: ImageRepositories) -> Self {
        Self { repositories }
    }

    /// Document path holding a component's image.
    pub fn path(component: Component) -> &'static str {
        match component {
            Component::ApiServer => "cluster.apiServer.image",
            Component::ControllerManager => "cluster.controllerManager.image",
            Component::Scheduler => "cluster.scheduler.image",
            Component::KubeProxy => "cluster.proxy.image",
            Component::Kubelet => "machine.kubelet.image",
        }
    }

    /// Full image reference for a component.
    pub fn image(&self, component: Component, image: &ImageRef) -> String {
        image.image(self.repositories.for_component(component))
    }

    /// Patch that moves a component to the given image.
    pub fn patch_for(&self, component: Component, image: &ImageRef) -> Patch {
        let reference = self.image(component, image);
        Patch {
            name: format!("{component}-{image}"),
            ops: vec![PatchOp {
                path: Self::path(component).to_string(),
                value: Value::String(reference.clone()),
            }],
            used_images: vec![reference],
        }
    }
}
