//! Custom Resource Definitions (CRDs) for kube-upgrade-operator.
//!
//! - `Cluster`, `ClusterMachine`, `ClusterMachineIdentity`: cluster membership (read-only)
//! - `KubernetesStatus`: observed per-node component state (read-only)
//! - `KubernetesUpgradeStatus`: upgrade progress reported by this operator
//! - `ConfigPatch`: per-machine configuration patches written by this operator
//! - `ImagePullRequest` / `ImagePullStatus`: contract with the image pull subsystem

mod cluster;
mod config_patch;
mod image_pull;
mod kubernetes_status;
mod upgrade_status;

pub use cluster::*;
pub use config_patch::*;
pub use image_pull::*;
pub use kubernetes_status::*;
pub use upgrade_status::*;

/// API group shared by every resource in this crate.
pub const API_GROUP: &str = "upgrade.kubeops.io";

/// Label carrying the name of the cluster an object belongs to.
pub const LABEL_CLUSTER: &str = "upgrade.kubeops.io/cluster";

/// Label carrying the machine ID an object targets.
pub const LABEL_MACHINE: &str = "upgrade.kubeops.io/machine";

/// Label carrying the machine role (`controlplane` or `worker`).
pub const LABEL_ROLE: &str = "upgrade.kubeops.io/role";

/// Label naming the controller that owns an object.
pub const LABEL_OWNER: &str = "upgrade.kubeops.io/owner";

/// Annotation marking a machine as administratively locked against changes.
pub const ANNOTATION_LOCKED: &str = "upgrade.kubeops.io/locked";
