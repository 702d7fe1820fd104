//! End-to-end reconciliation scenarios.
//!
//! Each test stages a managed cluster in memory, runs the real reconciler
//! and inspects the objects it wrote: upgrade status, config patches, the
//! image pull request and published events.

use std::sync::Arc;
use std::time::Duration;

use kube::ResourceExt;
use kube::runtime::controller::Action;

use crate::mock_state::{MockCluster, NS};
use kube_upgrade_operator::controller::common::mark_owned;
use kube_upgrade_operator::controller::component::Component;
use kube_upgrade_operator::controller::error::Error;
use kube_upgrade_operator::controller::upgrade_reconciler::{
    UPGRADE_FINALIZER, error_policy, reconcile,
};
use kube_upgrade_operator::crd::{
    Cluster, ConfigPatch, ConfigPatchSpec, ImagePullStatusSpec, KubernetesUpgradeStatus,
    LABEL_CLUSTER, UpgradePhase,
};
use kube_upgrade_operator::store::Store;

const FROM: &str = "1.30.8";
const TO: &str = "1.31.4";

/// Reconcile, satisfy the pre-pull and restart patched machines `n` times.
async fn run_rounds(cluster: &mut MockCluster, version: &str, n: usize) {
    for _ in 0..n {
        cluster.reconcile().await;
        if cluster.pull_request().await.is_some() {
            cluster.satisfy_pulls().await;
        }
        cluster.restart_patched(version).await;
    }
}

/// A standard cluster converged at `FROM` that now wants `TO`.
async fn upgrading_cluster() -> MockCluster {
    let cluster = MockCluster::standard("prod", FROM).await;
    cluster.reconcile().await;
    cluster.set_desired_version(TO).await;
    cluster
}

// ============================================================================
// Preconditions
// ============================================================================

#[tokio::test]
async fn test_skips_cluster_without_kubernetes_status() {
    let cluster = MockCluster::new("prod", TO).await;

    let action = cluster.reconcile().await;

    assert_eq!(action, Action::await_change());
    assert!(cluster.upgrade_status().await.is_none());
    assert!(
        cluster
            .cluster()
            .await
            .finalizers()
            .contains(&UPGRADE_FINALIZER.to_string())
    );
}

#[tokio::test]
async fn test_invalid_version_is_reported_in_status() {
    let cluster = MockCluster::standard("prod", FROM).await;
    cluster.set_desired_version("latest").await;

    let action = cluster.reconcile().await;

    assert_eq!(action, Action::await_change());
    let status = cluster.status().await;
    assert!(status.error.contains("invalid Kubernetes version \"latest\""));
    assert!(cluster.pull_request().await.is_none());
}

#[tokio::test]
async fn test_waits_for_cluster_ready_before_upgrading() {
    let cluster = upgrading_cluster().await;
    cluster.set_cluster_ready(false).await;

    cluster.reconcile().await;

    let status = cluster.status().await;
    assert_eq!(status.status, "waiting for the cluster to be ready");
    assert_eq!(status.phase, UpgradePhase::Done);
    assert!(cluster.pull_request().await.is_none());
    assert!(cluster.patch_data("m-cp1").await.is_none());
}

// ============================================================================
// Convergence
// ============================================================================

#[tokio::test]
async fn test_fresh_cluster_converges_without_changes() {
    let cluster = MockCluster::standard("prod", FROM).await;

    cluster.reconcile().await;

    let status = cluster.status().await;
    assert_eq!(status.phase, UpgradePhase::Done);
    assert_eq!(status.last_upgrade_version, FROM);
    assert!(status.step.is_empty());
    assert!(status.phase_changed_at.is_some());
    assert_eq!(status.upgrade_versions, vec!["1.31.0", "1.31.4"]);
    assert!(cluster.patch_data("m-cp1").await.is_none());
    assert!(cluster.event_reasons().await.is_empty());
}

#[tokio::test]
async fn test_converged_cluster_is_not_rewritten() {
    let cluster = MockCluster::standard("prod", FROM).await;
    cluster.reconcile().await;
    let before = cluster.upgrade_status().await.unwrap();
    let writes = cluster.store().writes();

    cluster.reconcile().await;
    cluster.reconcile().await;

    assert_eq!(cluster.store().writes(), writes);
    assert_eq!(cluster.upgrade_status().await.unwrap(), before);
}

// ============================================================================
// Forward upgrade
// ============================================================================

#[tokio::test]
async fn test_images_are_pre_pulled_before_first_step() {
    let cluster = upgrading_cluster().await;

    cluster.reconcile().await;

    let status = cluster.status().await;
    assert_eq!(status.status, "pre-pulling images (0/7)");
    assert_eq!(status.phase, UpgradePhase::Done);
    assert!(cluster.patch_data("m-cp1").await.is_none());

    let request = cluster.pull_request().await.unwrap();
    assert_eq!(request.spec.node_image_list.len(), 2);
    assert_eq!(request.spec.total_pulls(), 7);

    cluster.satisfy_pulls().await;
    cluster.reconcile().await;

    let status = cluster.status().await;
    assert_eq!(status.phase, UpgradePhase::Upgrading);
    assert_eq!(status.step, "upgrading kube-apiserver on cp-1 to v1.31.4");
    assert_eq!(status.status, "waiting for a restart");
    assert_eq!(status.current_upgrade_version, TO);
    assert!(status.error.is_empty());

    let data = cluster.patch_data("m-cp1").await.unwrap();
    assert!(data.contains("registry.k8s.io/kube-apiserver:v1.31.4"));
    assert!(!data.contains("kube-controller-manager"));
    assert!(cluster.patch_data("m-w1").await.is_none());
    assert_eq!(cluster.event_reasons().await, vec!["UpgradeStepApplied"]);
}

#[tokio::test]
async fn test_first_reconcile_of_outdated_cluster_steps_forward() {
    let cluster = MockCluster::standard("prod", FROM).await;
    cluster.set_desired_version(TO).await;

    cluster.reconcile().await;

    let status = cluster.status().await;
    assert!(status.last_upgrade_version.is_empty());
    assert_eq!(status.status, "pre-pulling images (0/7)");
    assert_ne!(status.phase, UpgradePhase::Reverting);
    assert!(cluster.pull_request().await.is_some());
    assert!(cluster.store().names::<ConfigPatch>(NS).await.is_empty());

    cluster.satisfy_pulls().await;
    cluster.reconcile().await;

    let status = cluster.status().await;
    assert_eq!(status.phase, UpgradePhase::Upgrading);
    assert_eq!(status.step, "upgrading kube-apiserver on cp-1 to v1.31.4");
    assert_eq!(
        cluster.store().names::<ConfigPatch>(NS).await,
        vec![ConfigPatch::upgrade_patch_name("prod", "m-cp1")]
    );
    let data = cluster.patch_data("m-cp1").await.unwrap();
    assert!(data.contains("registry.k8s.io/kube-apiserver:v1.31.4"));
    assert!(!data.contains("kube-scheduler"));
    assert_eq!(cluster.event_reasons().await, vec!["UpgradeStepApplied"]);
}

#[tokio::test]
async fn test_pull_failure_is_reported_once() {
    let cluster = upgrading_cluster().await;
    cluster.reconcile().await;
    let request = cluster.pull_request().await.unwrap();

    cluster
        .set_pull_status(ImagePullStatusSpec {
            request_version: request.resource_version().unwrap(),
            processed_count: 1,
            total_count: 7,
            last_processed_node: "w-1".to_string(),
            last_processed_image: "ghcr.io/siderolabs/kubelet:v1.31.4".to_string(),
            last_processed_error: "manifest unknown".to_string(),
        })
        .await;
    cluster.reconcile().await;
    cluster.reconcile().await;

    let status = cluster.status().await;
    assert_eq!(status.status, "pre-pulling images (1/7)");
    assert_eq!(
        status.error,
        "failed to pull image ghcr.io/siderolabs/kubelet:v1.31.4 on w-1: manifest unknown"
    );
    assert_eq!(cluster.event_reasons().await, vec!["ImagePullFailed"]);
    assert!(cluster.patch_data("m-cp1").await.is_none());
}

#[tokio::test]
async fn test_next_step_waits_for_restarted_component_to_be_ready() {
    let mut cluster = upgrading_cluster().await;
    run_rounds(&mut cluster, TO, 1).await;
    cluster.reconcile().await;

    cluster.report("cp-1", Component::ApiServer, TO, false);
    cluster.publish_report().await;
    cluster.reconcile().await;

    let status = cluster.status().await;
    assert_eq!(status.phase, UpgradePhase::Upgrading);
    assert_eq!(
        status.status,
        "waiting for components to be ready: kube-apiserver on cp-1"
    );
    let data = cluster.patch_data("m-cp1").await.unwrap();
    assert!(!data.contains("kube-controller-manager"));
}

#[tokio::test]
async fn test_full_upgrade_follows_component_order() {
    let mut cluster = upgrading_cluster().await;

    let steps = cluster.drive_to_done(TO, 30).await;

    assert_eq!(
        steps,
        vec![
            "upgrading kube-apiserver on cp-1 to v1.31.4",
            "upgrading kube-controller-manager on cp-1 to v1.31.4",
            "upgrading kube-scheduler on cp-1 to v1.31.4",
            "upgrading kubelet on cp-1 to v1.31.4",
            "upgrading kubelet on w-1 to v1.31.4",
            "upgrading kube-proxy on cp-1 to v1.31.4",
            "upgrading kube-proxy on w-1 to v1.31.4",
        ]
    );

    let status = cluster.status().await;
    assert_eq!(status.phase, UpgradePhase::Done);
    assert_eq!(status.last_upgrade_version, TO);
    assert!(status.current_upgrade_version.is_empty());
    assert!(status.step.is_empty());
    assert_eq!(status.upgrade_versions, vec!["1.32.0", "1.32.3"]);

    let events = cluster.event_reasons().await;
    assert_eq!(events.iter().filter(|r| *r == "UpgradeStepApplied").count(), 7);
    assert_eq!(events.last().map(String::as_str), Some("UpgradeCompleted"));
}

#[tokio::test]
async fn test_locked_machine_defers_its_steps() {
    let mut cluster = upgrading_cluster().await;
    cluster.set_locked("m-w1", true).await;

    run_rounds(&mut cluster, TO, 10).await;

    let status = cluster.status().await;
    assert_eq!(status.phase, UpgradePhase::Upgrading);
    assert_eq!(status.step, "upgrading kubelet on w-1 to v1.31.4");
    assert_eq!(status.status, "waiting for machine to be unlocked");
    assert!(cluster.patch_data("m-w1").await.is_none());
    let data = cluster.patch_data("m-cp1").await.unwrap();
    assert!(data.contains("ghcr.io/siderolabs/kubelet:v1.31.4"));
    assert!(!data.contains("kube-proxy"));

    cluster.set_locked("m-w1", false).await;
    let steps = cluster.drive_to_done(TO, 20).await;

    assert_eq!(
        steps,
        vec![
            "upgrading kubelet on w-1 to v1.31.4",
            "upgrading kube-proxy on cp-1 to v1.31.4",
            "upgrading kube-proxy on w-1 to v1.31.4",
        ]
    );
}

// ============================================================================
// Revert
// ============================================================================

#[tokio::test]
async fn test_revert_applies_all_steps_in_one_pass() {
    let mut cluster = upgrading_cluster().await;
    // Pre-pull, then API server, controller manager, scheduler and both kubelets
    run_rounds(&mut cluster, TO, 6).await;
    assert_eq!(
        cluster.status().await.step,
        "upgrading kubelet on w-1 to v1.31.4"
    );

    cluster.set_desired_version(FROM).await;
    cluster.reconcile().await;

    let status = cluster.status().await;
    assert_eq!(status.phase, UpgradePhase::Reverting);
    assert_eq!(status.step, "reverting to v1.30.8");
    assert_eq!(status.status, "waiting for a restart");

    let control_plane = cluster.patch_data("m-cp1").await.unwrap();
    assert!(control_plane.contains("registry.k8s.io/kube-apiserver:v1.30.8"));
    assert!(control_plane.contains("registry.k8s.io/kube-controller-manager:v1.30.8"));
    assert!(control_plane.contains("registry.k8s.io/kube-scheduler:v1.30.8"));
    assert!(control_plane.contains("ghcr.io/siderolabs/kubelet:v1.30.8"));
    let worker = cluster.patch_data("m-w1").await.unwrap();
    assert!(worker.contains("ghcr.io/siderolabs/kubelet:v1.30.8"));

    let events = cluster.store().events().await;
    let revert = events
        .iter()
        .find(|e| e.event.reason == "RevertApplied")
        .unwrap();
    assert_eq!(
        revert.event.note.as_deref(),
        Some("Reverting 2 machine(s) to v1.30.8")
    );

    assert!(cluster.restart_patched(FROM).await);
    cluster.reconcile().await;

    let status = cluster.status().await;
    assert_eq!(status.phase, UpgradePhase::Done);
    assert_eq!(status.last_upgrade_version, FROM);
    assert_eq!(
        cluster.event_reasons().await.last().map(String::as_str),
        Some("UpgradeCompleted")
    );
}

#[tokio::test]
async fn test_revert_proceeds_while_cluster_is_unhealthy() {
    let mut cluster = upgrading_cluster().await;
    run_rounds(&mut cluster, TO, 3).await;
    assert_eq!(
        cluster.status().await.step,
        "upgrading kube-controller-manager on cp-1 to v1.31.4"
    );

    cluster.set_desired_version(FROM).await;
    cluster.set_cluster_ready(false).await;
    cluster.reconcile().await;

    let status = cluster.status().await;
    assert_eq!(status.phase, UpgradePhase::Reverting);
    assert_eq!(status.step, "reverting to v1.30.8");
    let data = cluster.patch_data("m-cp1").await.unwrap();
    assert!(data.contains("registry.k8s.io/kube-apiserver:v1.30.8"));
    assert!(data.contains("registry.k8s.io/kube-controller-manager:v1.30.8"));
    assert!(cluster.event_reasons().await.contains(&"RevertApplied".to_string()));

    // Restarted components still count as unready until the cluster recovers.
    cluster.restart_patched(FROM).await;
    cluster.reconcile().await;
    let status = cluster.status().await;
    assert_eq!(status.phase, UpgradePhase::Reverting);
    assert!(status.status.starts_with("waiting for components to be ready"));

    cluster.set_cluster_ready(true).await;
    cluster.reconcile().await;
    let status = cluster.status().await;
    assert_eq!(status.phase, UpgradePhase::Done);
    assert_eq!(status.last_upgrade_version, FROM);
}

#[tokio::test]
async fn test_revert_skips_locked_machines() {
    let mut cluster = upgrading_cluster().await;
    run_rounds(&mut cluster, TO, 6).await;
    cluster.set_locked("m-w1", true).await;

    cluster.set_desired_version(FROM).await;
    cluster.reconcile().await;

    let status = cluster.status().await;
    assert_eq!(status.phase, UpgradePhase::Reverting);
    assert_eq!(status.status, "waiting for a restart");
    let control_plane = cluster.patch_data("m-cp1").await.unwrap();
    assert!(control_plane.contains("ghcr.io/siderolabs/kubelet:v1.30.8"));
    let worker = cluster.patch_data("m-w1").await.unwrap();
    assert!(worker.contains("ghcr.io/siderolabs/kubelet:v1.31.4"));
    assert!(!worker.contains(":v1.30.8"));

    let events = cluster.store().events().await;
    let notes: Vec<_> = events
        .iter()
        .filter(|e| e.event.reason == "RevertApplied")
        .filter_map(|e| e.event.note.clone())
        .collect();
    assert_eq!(notes, vec!["Reverting 1 machine(s) to v1.30.8"]);

    assert!(cluster.restart_patched(FROM).await);
    cluster.reconcile().await;
    let status = cluster.status().await;
    assert_eq!(status.phase, UpgradePhase::Reverting);
    assert_eq!(status.status, "waiting for machine to be unlocked");
    assert!(!cluster.patch_data("m-w1").await.unwrap().contains(":v1.30.8"));

    cluster.set_locked("m-w1", false).await;
    cluster.reconcile().await;
    assert!(
        cluster
            .patch_data("m-w1")
            .await
            .unwrap()
            .contains("ghcr.io/siderolabs/kubelet:v1.30.8")
    );
    assert!(cluster.restart_patched(FROM).await);
    cluster.reconcile().await;

    let status = cluster.status().await;
    assert_eq!(status.phase, UpgradePhase::Done);
    assert_eq!(status.last_upgrade_version, FROM);
}

// ============================================================================
// Teardown
// ============================================================================

#[tokio::test]
async fn test_deletion_removes_only_owned_patches() {
    let cluster = MockCluster::standard("prod", FROM).await;
    cluster.reconcile().await;
    let owner: Cluster = cluster.cluster().await;

    for machine in ["m-cp1", "m-w1"] {
        let mut patch = ConfigPatch::new(
            &ConfigPatch::upgrade_patch_name("prod", machine),
            ConfigPatchSpec::default(),
        );
        patch.metadata.namespace = Some(NS.to_string());
        mark_owned(&mut patch.metadata, &owner, Some(machine));
        cluster.store().seed(patch).await.unwrap();
    }
    let mut foreign = ConfigPatch::new(
        "prod-extra",
        ConfigPatchSpec {
            data: "machine: {}\n".to_string(),
        },
    );
    foreign.metadata.namespace = Some(NS.to_string());
    foreign.metadata.labels = Some([(LABEL_CLUSTER.to_string(), "prod".to_string())].into());
    cluster.store().seed(foreign).await.unwrap();

    assert!(cluster.store().delete::<Cluster>(NS, "prod").await.unwrap());
    let action = cluster.reconcile().await;

    assert_eq!(action, Action::await_change());
    assert_eq!(
        cluster.store().names::<ConfigPatch>(NS).await,
        vec!["prod-extra"]
    );
    assert!(cluster.store().names::<Cluster>(NS).await.is_empty());
    assert!(
        cluster
            .store()
            .names::<KubernetesUpgradeStatus>(NS)
            .await
            .is_empty()
    );
}

// ============================================================================
// Controller entry points
// ============================================================================

#[tokio::test]
async fn test_reconcile_records_metrics() {
    let cluster = MockCluster::standard("prod", FROM).await;
    let obj = Arc::new(cluster.cluster().await);

    reconcile(obj, cluster.ctx.clone()).await.unwrap();

    let metrics = cluster.health.metrics.encode();
    assert!(metrics.contains("kube_upgrade_operator_reconciliations"));
    assert!(metrics.contains("kube_upgrade_operator_clusters_by_phase{phase=\"Done\"} 1"));
}

#[tokio::test]
async fn test_error_policy_backs_off_until_success() {
    let cluster = MockCluster::standard("prod", FROM).await;
    let obj = Arc::new(cluster.cluster().await);
    let conflict = Error::Conflict {
        kind: "KubernetesUpgradeStatus".to_string(),
        name: "prod".to_string(),
    };

    let first = error_policy(obj.clone(), &conflict, cluster.ctx.clone());
    let second = error_policy(obj.clone(), &conflict, cluster.ctx.clone());
    assert_eq!(first, Action::requeue(Duration::from_secs(2)));
    assert_eq!(second, Action::requeue(Duration::from_secs(4)));

    reconcile(obj.clone(), cluster.ctx.clone()).await.unwrap();
    let after_success = error_policy(obj.clone(), &conflict, cluster.ctx.clone());
    assert_eq!(after_success, Action::requeue(Duration::from_secs(2)));

    let gone = Error::NotFound {
        kind: "Cluster".to_string(),
        name: "prod".to_string(),
    };
    assert_eq!(
        error_policy(obj, &gone, cluster.ctx.clone()),
        Action::await_change()
    );
}
