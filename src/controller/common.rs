//! Shared controller helpers.
//!
//! Labels and owner references stamped on every object the upgrade
//! controller writes for a cluster.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};

use crate::crd::{Cluster, LABEL_CLUSTER, LABEL_MACHINE, LABEL_OWNER};
use crate::store::LabelQuery;

/// Value of the owner label on objects written by this controller.
pub const OWNER: &str = "kubernetes-upgrade-controller";

/// Namespace of an object, `default` when unset.
pub fn namespace_of<K: Resource>(obj: &K) -> String {
    obj.namespace().unwrap_or_else(|| "default".to_string())
}

/// Labels identifying an object owned by this controller for a cluster.
pub fn owned_labels(cluster: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_CLUSTER.to_string(), cluster.to_string()),
        (LABEL_OWNER.to_string(), OWNER.to_string()),
    ])
}

/// Query matching everything this controller owns for a cluster.
pub fn owned_query(cluster: &str) -> LabelQuery {
    LabelQuery::new()
        .equals(LABEL_CLUSTER, cluster)
        .equals(LABEL_OWNER, OWNER)
}

/// Controller owner reference to the cluster, if it has been persisted.
pub fn cluster_owner_reference(cluster: &Cluster) -> Option<OwnerReference> {
    cluster.controller_owner_ref(&())
}

/// Stamp ownership labels and the cluster owner reference onto metadata.
///
/// Existing labels are kept; `machine` adds the machine label.
pub fn mark_owned(meta: &mut ObjectMeta, cluster: &Cluster, machine: Option<&str>) {
    let labels = meta.labels.get_or_insert_with(BTreeMap::new);
    labels.extend(owned_labels(&cluster.name_any()));
    if let Some(machine) = machine {
        labels.insert(LABEL_MACHINE.to_string(), machine.to_string());
    }
    if let Some(owner) = cluster_owner_reference(cluster) {
        let refs = meta.owner_references.get_or_insert_with(Vec::new);
        if !refs.iter().any(|r| r.uid == owner.uid) {
            refs.push(owner);
        }
    }
}
