//! Upgrade path planning.
//!
//! [`calculate_upgrade_path`] compares the observed component versions of a
//! cluster with the target version and returns the ordered list of
//! per-node, per-component steps still to apply. It performs no I/O, so the
//! same inputs always produce the same path.

use std::collections::{BTreeMap, HashMap, HashSet};

use semver::Version;

use crate::controller::component::{Component, ComponentPriority};
use crate::controller::patches::{ImageRef, Patch, PatchCatalog};
use crate::controller::topology::Topology;
use crate::crd::KubernetesStatusSpec;

/// Maximum number of outstanding components listed in `not_ready_status`.
const MAX_NOT_READY_LISTED: usize = 5;

// ============================================================================
// Observed state
// ============================================================================

/// Version and readiness of one component on one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedComponent {
    /// Reported version with any leading `v` removed; empty if unknown.
    pub version: String,
    pub ready: bool,
}

impl ObservedComponent {
    /// Whether the reported version is the target version.
    ///
    /// Build metadata is ignored (`1.31.4+build.1` matches `1.31.4`).
    pub fn is_at(&self, target: &Version) -> bool {
        Version::parse(&self.version).is_ok_and(|v| {
            v.major == target.major
                && v.minor == target.minor
                && v.patch == target.patch
                && v.pre == target.pre
        })
    }
}

/// Observed component state keyed by node name and component.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObservedState {
    components: HashMap<(String, Component), ObservedComponent>,
}

/// Strip whitespace and a leading `v` from a reported version.
pub fn normalize_version(version: &str) -> String {
    let trimmed = version.trim();
    trimmed.strip_prefix('v').unwrap_or(trimmed).to_string()
}

impl ObservedState {
    /// Map a `KubernetesStatus` report onto the topology.
    ///
    /// Nodes the topology does not know and pods of unrelated applications
    /// are dropped. When several pods of the same component run on a node
    /// (mid-rollout), the component only counts as ready and at a version if
    /// all of them agree.
    pub fn from_kubernetes_status(status: &KubernetesStatusSpec, topology: &Topology) -> Self {
        let mut state = Self::default();

        for node in &status.nodes {
            if topology.by_node(&node.node_name).is_none() {
                continue;
            }
            state.record(
                &node.node_name,
                Component::Kubelet,
                &node.kubelet_version,
                node.ready,
            );
        }

        for pod in &status.pods {
            let Some(component) = Component::from_name(&pod.app) else {
                continue;
            };
            if component == Component::Kubelet || topology.by_node(&pod.node_name).is_none() {
                continue;
            }
            state.record(&pod.node_name, component, &pod.version, pod.ready);
        }

        state
    }

    /// Record one observation, merging with any earlier one for the same pair.
    pub fn record(&mut self, node: &str, component: Component, version: &str, ready: bool) {
        let version = normalize_version(version);
        self.components
            .entry((node.to_string(), component))
            .and_modify(|existing| {
                if existing.version != version {
                    existing.version.clear();
                }
                existing.ready &= ready;
            })
            .or_insert(ObservedComponent { version, ready });
    }

    pub fn get(&self, node: &str, component: Component) -> Option<&ObservedComponent> {
        self.components.get(&(node.to_string(), component))
    }

    /// Treat every component as not ready.
    pub fn mark_all_not_ready(&mut self) {
        for observed in self.components.values_mut() {
            observed.ready = false;
        }
    }
}

// ============================================================================
// Upgrade path
// ============================================================================

/// One component change on one machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeStep {
    pub machine_id: String,
    /// Node name of the machine.
    pub node: String,
    pub component: Component,
    /// Human-readable summary shown in the upgrade status.
    pub description: String,
    pub patch: Patch,
    /// The machine is locked; the step must wait.
    pub blocked: bool,
}

impl UpgradeStep {
    /// Ordering key: component priority, then unblocked first, then node name.
    pub fn sort_key(&self, priority: &ComponentPriority) -> (usize, bool, &str) {
        (priority.rank(self.component), self.blocked, &self.node)
    }
}

/// Planned steps for one cluster plus the readiness summary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpgradePath {
    /// Steps in application order.
    pub steps: Vec<UpgradeStep>,
    /// Every component on every node reports ready.
    pub all_components_ready: bool,
    /// Summary of outstanding components when not all are ready.
    pub not_ready_status: String,
    pub cluster_id: String,
    /// Every node of the cluster, sorted.
    pub all_nodes: Vec<String>,
    /// Target images each node needs, for pre-pulling.
    pub all_nodes_to_required_images: BTreeMap<String, Vec<String>>,
}

impl UpgradePath {
    /// The step to apply next.
    pub fn head(&self) -> Option<&UpgradeStep> {
        self.steps.first()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Steps on machines that are not locked.
    pub fn unblocked_steps(&self) -> impl Iterator<Item = &UpgradeStep> {
        self.steps.iter().filter(|s| !s.blocked)
    }

    /// Number of steps waiting on a locked machine.
    pub fn blocked_count(&self) -> usize {
        self.steps.iter().filter(|s| s.blocked).count()
    }
}

/// Compute the steps that move a cluster to `target`.
///
/// Every (node, component) pair known to the topology is compared with the
/// observed state. A missing or mismatching version yields a step; a missing
/// or unready component clears `all_components_ready`. Observed entries for
/// nodes outside the topology are ignored.
pub fn calculate_upgrade_path(
    cluster_id: &str,
    topology: &Topology,
    observed: &ObservedState,
    target: &Version,
    catalog: &PatchCatalog,
    priority: &ComponentPriority,
) -> UpgradePath {
    let image = ImageRef::Tag(target.clone());
    let mut steps = Vec::new();
    let mut seen = HashSet::new();
    let mut not_ready = Vec::new();
    let mut required_images: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for (machine, component) in topology.component_pairs() {
        required_images
            .entry(machine.node_name.clone())
            .or_default()
            .push(catalog.image(component, &image));

        let current = observed.get(&machine.node_name, component);
        if !current.is_some_and(|c| c.ready) {
            not_ready.push(format!("{} on {}", component, machine.node_name));
        }
        if current.is_some_and(|c| c.is_at(target)) {
            continue;
        }
        if !seen.insert((machine.machine_id.clone(), component)) {
            continue;
        }
        steps.push(UpgradeStep {
            machine_id: machine.machine_id.clone(),
            node: machine.node_name.clone(),
            component,
            description: format!(
                "upgrading {} on {} to v{}",
                component, machine.node_name, target
            ),
            patch: catalog.patch_for(component, &image),
            blocked: machine.locked,
        });
    }

    steps.sort_by(|a, b| a.sort_key(priority).cmp(&b.sort_key(priority)));

    let all_components_ready = not_ready.is_empty();
    let not_ready_status = if all_components_ready {
        String::new()
    } else {
        summarize_not_ready(&not_ready)
    };

    UpgradePath {
        steps,
        all_components_ready,
        not_ready_status,
        cluster_id: cluster_id.to_string(),
        all_nodes: topology.node_names(),
        all_nodes_to_required_images: required_images,
    }
}

fn summarize_not_ready(pending: &[String]) -> String {
    let listed: Vec<&str> = pending
        .iter()
        .take(MAX_NOT_READY_LISTED)
        .map(String::as_str)
        .collect();
    let mut status = format!("waiting for components to be ready: {}", listed.join(", "));
    if pending.len() > MAX_NOT_READY_LISTED {
        status.push_str(&format!(
            " and {} more",
            pending.len() - MAX_NOT_READY_LISTED
        ));
    }
    status
}
