//! Node/machine topology of a cluster.
//!
//! The live cluster reports node names; the configuration side is keyed by
//! machine ID. [`Topology`] joins `ClusterMachine` and
//! `ClusterMachineIdentity` objects so either key can be resolved to the
//! other.
//!
//! # Example
//!
//! ```ignore
//! let topology = Topology::build(store, "default", "prod").await?;
//!
//! let machine = topology.by_node("cp-1")?;
//! for node in topology.control_planes() {
//!     println!("{} -> {}", node.node_name, node.machine_id);
//! }
//! ```

use std::collections::HashMap;

use kube::ResourceExt;
use tracing::debug;

use crate::controller::component::Component;
use crate::controller::error::Result;
use crate::crd::{ClusterMachine, ClusterMachineIdentity, LABEL_CLUSTER, MachineRole};
use crate::store::{LabelQuery, Store};

// ============================================================================
// Types
// ============================================================================

/// One member machine with its node identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineInfo {
    pub machine_id: String,
    /// Node name reported by the live cluster.
    pub node_name: String,
    pub role: MachineRole,
    /// Administrative lock: no patches may be applied to this machine.
    pub locked: bool,
}

impl MachineInfo {
    /// Components this machine hosts.
    pub fn components(&self) -> &'static [Component] {
        Component::for_role(self.role)
    }
}

/// Bidirectional node-name / machine-ID mapping for one cluster.
///
/// Built once per reconciliation and not cached across reconciliations.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    /// Machines sorted by node name.
    machines: Vec<MachineInfo>,

    // Pre-built indexes for fast lookups
    node_index: HashMap<String, usize>,
    machine_index: HashMap<String, usize>,
}

impl Topology {
    /// Build the topology of a cluster from the store.
    ///
    /// Machines without an identity (not joined yet) are left out, as are
    /// identities without a machine.
    pub async fn build<S: Store>(store: &S, namespace: &str, cluster: &str) -> Result<Self> {
        let query = LabelQuery::new().equals(LABEL_CLUSTER, cluster);
        let machines: Vec<ClusterMachine> = store.list(namespace, &query).await?;
        let identities: Vec<ClusterMachineIdentity> = store.list(namespace, &query).await?;

        let node_names: HashMap<String, String> = identities
            .into_iter()
            .filter(|i| !i.spec.node_name.is_empty())
            .map(|i| (i.name_any(), i.spec.node_name))
            .collect();

        let mut infos = Vec::with_capacity(machines.len());
        for machine in &machines {
            let machine_id = machine.name_any();
            let Some(node_name) = node_names.get(&machine_id) else {
                debug!(cluster = %cluster, machine = %machine_id, "Machine has no node identity yet, skipping");
                continue;
            };
            infos.push(MachineInfo {
                machine_id,
                node_name: node_name.clone(),
                role: machine.role(),
                locked: machine.is_locked(),
            });
        }

        Ok(Self::from_machines(infos))
    }

    /// Build the topology from already-known machines (without store access).
    ///
    /// If two machines claim the same node name, the first one (by machine ID)
    /// wins.
    pub fn from_machines(mut machines: Vec<MachineInfo>) -> Self {
        machines.sort_by(|a, b| a.machine_id.cmp(&b.machine_id));
        let mut seen_nodes = std::collections::HashSet::new();
        machines.retain(|m| seen_nodes.insert(m.node_name.clone()));
        machines.sort_by(|a, b| a.node_name.cmp(&b.node_name));

        let mut node_index = HashMap::with_capacity(machines.len());
        let mut machine_index = HashMap::with_capacity(machines.len());
        for (idx, machine) in machines.iter().enumerate() {
            node_index.insert(machine.node_name.clone(), idx);
            machine_index.insert(machine.machine_id.clone(), idx);
        }

        Self {
            machines,
            node_index,
            machine_index,
        }
    }

    // =========================================================================
    // Lookup methods
    // =========================================================================

    /// Look up a machine by node name.
    pub fn by_node(&self, node_name: &str) -> Option<&MachineInfo> {
        self.node_index
            .get(node_name)
            .and_then(|&idx| self.machines.get(idx))
    }

    /// Look up a machine by machine ID.
    pub fn by_machine(&self, machine_id: &str) -> Option<&MachineInfo> {
        self.machine_index
            .get(machine_id)
            .and_then(|&idx| self.machines.get(idx))
    }

    // =========================================================================
    // Filtered views
    // =========================================================================

    /// All machines, sorted by node name.
    pub fn machines(&self) -> impl Iterator<Item = &MachineInfo> {
        self.machines.iter()
    }

    pub fn control_planes(&self) -> impl Iterator<Item = &MachineInfo> {
        self.machines
            .iter()
            .filter(|m| m.role == MachineRole::ControlPlane)
    }

    pub fn workers(&self) -> impl Iterator<Item = &MachineInfo> {
        self.machines
            .iter()
            .filter(|m| m.role == MachineRole::Worker)
    }

    /// Every (machine, component) pair the cluster is expected to run.
    pub fn component_pairs(&self) -> impl Iterator<Item = (&MachineInfo, Component)> {
        self.machines
            .iter()
            .flat_map(|m| m.components().iter().map(move |c| (m, *c)))
    }

    /// Node names, sorted.
    pub fn node_names(&self) -> Vec<String> {
        self.machines.iter().map(|m| m.node_name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.machines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }
}
