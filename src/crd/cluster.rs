//! Cluster membership resources.
//!
//! These resources are produced by other controllers (cluster lifecycle,
//! machine provisioning, cluster health) and are only read by this operator.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{ANNOTATION_LOCKED, LABEL_ROLE};

// ============================================================================
// Cluster
// ============================================================================

/// Cluster is a managed Kubernetes cluster.
///
/// Example:
/// ```yaml
/// apiVersion: upgrade.kubeops.io/v1alpha1
/// kind: Cluster
/// metadata:
///   name: prod
/// spec:
///   kubernetesVersion: 1.31.4
///   talosVersion: 1.9.1
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "upgrade.kubeops.io",
    version = "v1alpha1",
    kind = "Cluster",
    plural = "clusters",
    status = "ClusterStatus",
    namespaced,
    printcolumn = r#"{"name":"Kubernetes", "type":"string", "jsonPath":".spec.kubernetesVersion"}"#,
    printcolumn = r#"{"name":"Talos", "type":"string", "jsonPath":".spec.talosVersion"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Desired Kubernetes version (e.g., "1.31.4").
    pub kubernetes_version: String,

    /// Desired Talos version of the member machines.
    #[serde(default)]
    pub talos_version: String,
}

/// Health of a cluster as reported by the cluster health subsystem.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// Lifecycle phase of the cluster.
    #[serde(default)]
    pub phase: ClusterPhase,

    /// Whether every member machine reports ready.
    #[serde(default)]
    pub ready: bool,
}

/// Lifecycle phase of a cluster.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum ClusterPhase {
    /// Phase not reported yet.
    #[default]
    Unknown,
    /// Machines are being added.
    ScalingUp,
    /// Machines are being removed.
    ScalingDown,
    /// All machines are running.
    Running,
    /// Cluster is being torn down.
    Destroying,
}

impl std::fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterPhase::Unknown => write!(f, "Unknown"),
            ClusterPhase::ScalingUp => write!(f, "ScalingUp"),
            ClusterPhase::ScalingDown => write!(f, "ScalingDown"),
            ClusterPhase::Running => write!(f, "Running"),
            ClusterPhase::Destroying => write!(f, "Destroying"),
        }
    }
}

impl Cluster {
    /// Check whether the cluster health subsystem reports the cluster as running and ready.
    pub fn is_running_and_ready(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.ready && s.phase == ClusterPhase::Running)
    }
}

// ============================================================================
// ClusterMachine
// ============================================================================

/// ClusterMachine records membership of one machine in a cluster.
///
/// The object name is the machine ID. The cluster and role are carried as
/// labels; an administrative lock is carried as an annotation.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "upgrade.kubeops.io",
    version = "v1alpha1",
    kind = "ClusterMachine",
    plural = "clustermachines",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterMachineSpec {}

/// Role of a machine in the cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MachineRole {
    /// Runs the control-plane static pods.
    ControlPlane,
    /// Runs workloads only.
    Worker,
}

impl MachineRole {
    /// Label value for this role.
    pub fn as_label(&self) -> &'static str {
        match self {
            MachineRole::ControlPlane => "controlplane",
            MachineRole::Worker => "worker",
        }
    }

    /// Parse a role label value.
    pub fn from_label(value: &str) -> Option<Self> {
        match value {
            "controlplane" => Some(MachineRole::ControlPlane),
            "worker" => Some(MachineRole::Worker),
            _ => None,
        }
    }
}

impl std::fmt::Display for MachineRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_label())
    }
}

impl ClusterMachine {
    /// Role from the role label; machines without a recognised label are workers.
    pub fn role(&self) -> MachineRole {
        self.labels()
            .get(LABEL_ROLE)
            .and_then(|v| MachineRole::from_label(v))
            .unwrap_or(MachineRole::Worker)
    }

    /// Whether the machine carries the lock annotation.
    pub fn is_locked(&self) -> bool {
        self.annotations().contains_key(ANNOTATION_LOCKED)
    }
}

// ============================================================================
// ClusterMachineIdentity
// ============================================================================

/// ClusterMachineIdentity maps a machine ID to the node name the live cluster reports.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "upgrade.kubeops.io",
    version = "v1alpha1",
    kind = "ClusterMachineIdentity",
    plural = "clustermachineidentities",
    namespaced,
    printcolumn = r#"{"name":"Node", "type":"string", "jsonPath":".spec.nodeName"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterMachineIdentitySpec {
    /// Kubernetes node name of the machine.
    #[serde(default)]
    pub node_name: String,
}
