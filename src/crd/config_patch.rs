//! ConfigPatch Custom Resource Definition.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// ConfigPatch is a YAML document merged into a machine's configuration.
///
/// Patches written by the upgrade controller are named deterministically per
/// cluster and machine (see [`ConfigPatch::upgrade_patch_name`]) and carry the
/// cluster, machine and owner labels so they can be found on teardown.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "upgrade.kubeops.io",
    version = "v1alpha1",
    kind = "ConfigPatch",
    plural = "configpatches",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ConfigPatchSpec {
    /// Patch document in YAML.
    #[serde(default)]
    pub data: String,
}

impl ConfigPatch {
    /// Name of the Kubernetes upgrade patch for a machine of a cluster.
    pub fn upgrade_patch_name(cluster: &str, machine_id: &str) -> String {
        format!("{}-{}-kubernetes-upgrade", cluster, machine_id)
    }
}
