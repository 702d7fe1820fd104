//! KubernetesUpgradeStatus Custom Resource Definition.
//!
//! The only externally visible contract of the upgrade orchestrator. UIs and
//! CLIs read this object; they never need to inspect `ConfigPatch` objects.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// ============================================================================
// KubernetesUpgradeStatus CRD
// ============================================================================

/// KubernetesUpgradeStatus reports Kubernetes upgrade progress for one cluster.
///
/// The object name matches the name of the `Cluster`. It is written
/// exclusively by the upgrade controller.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "upgrade.kubeops.io",
    version = "v1alpha1",
    kind = "KubernetesUpgradeStatus",
    plural = "kubernetesupgradestatuses",
    shortname = "kus",
    derive = "PartialEq",
    namespaced,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".spec.phase"}"#,
    printcolumn = r#"{"name":"Last","type":"string","jsonPath":".spec.lastUpgradeVersion"}"#,
    printcolumn = r#"{"name":"Current","type":"string","jsonPath":".spec.currentUpgradeVersion"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".spec.status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesUpgradeStatusSpec {
    /// Current phase of the upgrade.
    #[serde(default)]
    pub phase: UpgradePhase,

    /// Description of the step being executed.
    #[serde(default)]
    pub step: String,

    /// Human-readable progress (e.g., "pre-pulling images (3/10)").
    #[serde(default)]
    pub status: String,

    /// Last error observed, if any.
    #[serde(default)]
    pub error: String,

    /// Version the cluster is moving to while an upgrade or revert is in flight.
    #[serde(default)]
    pub current_upgrade_version: String,

    /// Last version the cluster fully converged on.
    #[serde(default)]
    pub last_upgrade_version: String,

    /// Versions the cluster may be upgraded to next.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub upgrade_versions: Vec<String>,

    /// Timestamp of the last phase change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_changed_at: Option<String>,
}

/// Phase of the Kubernetes upgrade.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "PascalCase")]
pub enum UpgradePhase {
    /// Initial or fallback state.
    #[default]
    Unknown,

    /// Moving forward to a new version, one step at a time.
    Upgrading,

    /// Rolling back to the last converged version.
    Reverting,

    /// Cluster converged on the desired version.
    Done,
}

impl std::fmt::Display for UpgradePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpgradePhase::Unknown => write!(f, "Unknown"),
            UpgradePhase::Upgrading => write!(f, "Upgrading"),
            UpgradePhase::Reverting => write!(f, "Reverting"),
            UpgradePhase::Done => write!(f, "Done"),
        }
    }
}

impl UpgradePhase {
    /// All phases, in declaration order.
    pub const ALL: [UpgradePhase; 4] = [
        UpgradePhase::Unknown,
        UpgradePhase::Upgrading,
        UpgradePhase::Reverting,
        UpgradePhase::Done,
    ];

    /// Check if this is a terminal phase.
    pub fn is_terminal(&self) -> bool {
        matches!(self, UpgradePhase::Done)
    }

    /// Check if patches are being rolled out in this phase.
    pub fn is_in_progress(&self) -> bool {
        matches!(self, UpgradePhase::Upgrading | UpgradePhase::Reverting)
    }
}

// ============================================================================
// Tests
// ============================================================================
