//! KubernetesStatus Custom Resource Definition.
//!
//! Snapshot of the live cluster as collected from its API server: node
//! readiness with kubelet versions, and control-plane/proxy pods with their
//! versions. Produced by a separate collector; may be stale or partial.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// KubernetesStatus is the observed state of a cluster's Kubernetes components.
///
/// The object name matches the name of the `Cluster` it describes.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "upgrade.kubeops.io",
    version = "v1alpha1",
    kind = "KubernetesStatus",
    plural = "kubernetesstatuses",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesStatusSpec {
    /// Nodes reported by the cluster.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<NodeStatus>,

    /// Component pods reported by the cluster.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pods: Vec<PodStatus>,
}

/// Status of one Kubernetes node.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    /// Node name.
    pub node_name: String,

    /// Kubelet version (e.g., "v1.31.4").
    #[serde(default)]
    pub kubelet_version: String,

    /// Whether the node reports Ready.
    #[serde(default)]
    pub ready: bool,
}

/// Status of one component pod.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PodStatus {
    /// Node the pod runs on.
    pub node_name: String,

    /// Application name (e.g., "kube-apiserver").
    pub app: String,

    /// Version of the pod's image (e.g., "v1.31.4").
    #[serde(default)]
    pub version: String,

    /// Whether the pod reports Ready.
    #[serde(default)]
    pub ready: bool,
}
