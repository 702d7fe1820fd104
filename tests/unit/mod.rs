// Test code is allowed to panic on failure
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

//! Unit tests for kube-upgrade-operator.
//!
//! These tests run without a Kubernetes cluster and exercise the public
//! API of individual components in isolation.

mod crd_tests {
    use kube::CustomResourceExt;
    use kube_upgrade_operator::crd::{
        Cluster, ClusterMachine, ConfigPatch, ImagePullRequest, ImagePullStatusSpec,
        KubernetesStatus, KubernetesUpgradeStatus, KubernetesUpgradeStatusSpec, MachineRole,
        UpgradePhase,
    };

    #[test]
    fn test_phase_display() {
        assert_eq!(UpgradePhase::Unknown.to_string(), "Unknown");
        assert_eq!(UpgradePhase::Upgrading.to_string(), "Upgrading");
        assert_eq!(UpgradePhase::Reverting.to_string(), "Reverting");
        assert_eq!(UpgradePhase::Done.to_string(), "Done");
    }

    #[test]
    fn test_phase_default() {
        assert_eq!(UpgradePhase::default(), UpgradePhase::Unknown);
        assert!(UpgradePhase::Done.is_terminal());
        assert!(UpgradePhase::Reverting.is_in_progress());
        assert!(!UpgradePhase::Unknown.is_in_progress());
    }

    #[test]
    fn test_cluster_readiness_from_yaml() {
        let cluster: Cluster = serde_yaml::from_str(
            r#"
apiVersion: upgrade.kubeops.io/v1alpha1
kind: Cluster
metadata:
  name: prod
  namespace: clusters
spec:
  kubernetesVersion: "1.31.4"
status:
  phase: Running
  ready: true
"#,
        )
        .unwrap();
        assert_eq!(cluster.spec.kubernetes_version, "1.31.4");
        assert!(cluster.spec.talos_version.is_empty());
        assert!(cluster.is_running_and_ready());

        let scaling: Cluster = serde_yaml::from_str(
            r#"
apiVersion: upgrade.kubeops.io/v1alpha1
kind: Cluster
metadata:
  name: prod
spec:
  kubernetesVersion: "1.31.4"
status:
  phase: ScalingUp
  ready: true
"#,
        )
        .unwrap();
        assert!(!scaling.is_running_and_ready());
    }

    #[test]
    fn test_machine_role_and_lock_from_metadata() {
        let machine: ClusterMachine = serde_yaml::from_str(
            r#"
apiVersion: upgrade.kubeops.io/v1alpha1
kind: ClusterMachine
metadata:
  name: m-1
  labels:
    upgrade.kubeops.io/cluster: prod
    upgrade.kubeops.io/role: controlplane
  annotations:
    upgrade.kubeops.io/locked: ""
spec: {}
"#,
        )
        .unwrap();
        assert_eq!(machine.role(), MachineRole::ControlPlane);
        assert!(machine.is_locked());
    }

    #[test]
    fn test_kubernetes_status_from_yaml() {
        let status: KubernetesStatus = serde_yaml::from_str(
            r#"
apiVersion: upgrade.kubeops.io/v1alpha1
kind: KubernetesStatus
metadata:
  name: prod
spec:
  nodes:
    - nodeName: cp-1
      kubeletVersion: v1.30.8
      ready: true
  pods:
    - nodeName: cp-1
      app: kube-apiserver
      version: v1.31.4
"#,
        )
        .unwrap();
        assert_eq!(status.spec.nodes[0].kubelet_version, "v1.30.8");
        assert_eq!(status.spec.pods[0].app, "kube-apiserver");
        assert!(!status.spec.pods[0].ready);
    }

    #[test]
    fn test_upgrade_status_serializes_camel_case() {
        let status = KubernetesUpgradeStatusSpec {
            phase: UpgradePhase::Upgrading,
            step: "upgrading kubelet on w-1 to v1.31.4".to_string(),
            current_upgrade_version: "1.31.4".to_string(),
            last_upgrade_version: "1.30.8".to_string(),
            ..Default::default()
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["phase"], "Upgrading");
        assert_eq!(json["currentUpgradeVersion"], "1.31.4");
        assert_eq!(json["lastUpgradeVersion"], "1.30.8");
        assert!(json.get("upgradeVersions").is_none());
        assert!(json.get("phaseChangedAt").is_none());
    }

    #[test]
    fn test_pull_status_satisfaction() {
        let status = ImagePullStatusSpec {
            request_version: "42".to_string(),
            processed_count: 3,
            total_count: 3,
            ..Default::default()
        };
        assert!(status.is_satisfied("42"));
        assert!(!status.is_satisfied("43"));
    }

    #[test]
    fn test_crds_share_api_group() {
        for crd in [
            Cluster::crd(),
            KubernetesUpgradeStatus::crd(),
            ConfigPatch::crd(),
            ImagePullRequest::crd(),
        ] {
            assert_eq!(crd.spec.group, "upgrade.kubeops.io");
        }
        assert_eq!(
            KubernetesUpgradeStatus::crd().spec.names.plural,
            "kubernetesupgradestatuses"
        );
    }

    #[test]
    fn test_upgrade_patch_name() {
        assert_eq!(
            ConfigPatch::upgrade_patch_name("prod", "m-1"),
            "prod-m-1-kubernetes-upgrade"
        );
    }
}

mod config_tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use kube_upgrade_operator::OperatorConfig;
    use kube_upgrade_operator::config::{ConfigError, DEFAULT_CONCURRENCY};
    use kube_upgrade_operator::controller::component::Component;

    fn load(pairs: &[(&str, &str)]) -> Result<OperatorConfig, ConfigError> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        OperatorConfig::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn test_empty_environment_uses_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.concurrency, DEFAULT_CONCURRENCY);
        assert!(config.namespace.is_none());
        assert_eq!(config.priority.order()[0], Component::ApiServer);
        assert!(!config.kubernetes_versions.is_empty());
    }

    #[test]
    fn test_overrides_are_applied() {
        let config = load(&[
            ("UPGRADE_NAMESPACE", "clusters"),
            ("UPGRADE_CONCURRENCY", "8"),
            ("UPGRADE_RESYNC_SECS", "60"),
            (
                "UPGRADE_COMPONENT_PRIORITY",
                "kube-apiserver,kube-scheduler,kube-controller-manager,kubelet,kube-proxy",
            ),
            ("UPGRADE_APISERVER_IMAGE", "mirror.local/kube-apiserver"),
        ])
        .unwrap();
        assert_eq!(config.namespace.as_deref(), Some("clusters"));
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.resync_interval, Duration::from_secs(60));
        assert!(
            config
                .priority
                .less(Component::Scheduler, Component::ControllerManager)
        );
        assert_eq!(config.images.api_server, "mirror.local/kube-apiserver");
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(load(&[("UPGRADE_CONCURRENCY", "0")]).is_err());
        assert!(load(&[("UPGRADE_CONCURRENCY", "many")]).is_err());
        assert!(load(&[("UPGRADE_COMPONENT_PRIORITY", "kubelet,kube-proxy")]).is_err());
        let err = load(&[("UPGRADE_KUBELET_IMAGE", "ghcr.io/siderolabs/kubelet:v1.31.4")])
            .unwrap_err();
        assert!(err.to_string().contains("UPGRADE_KUBELET_IMAGE"));
    }
}

mod patch_tests {
    use kube_upgrade_operator::config::ImageRepositories;
    use kube_upgrade_operator::controller::component::Component;
    use kube_upgrade_operator::controller::patches::{ImageRef, Patch, PatchCatalog};
    use semver::Version;

    #[test]
    fn test_patch_merges_into_existing_document() {
        let catalog = PatchCatalog::new(ImageRepositories::default());
        let patch = catalog.patch_for(
            Component::Scheduler,
            &ImageRef::Tag(Version::new(1, 31, 4)),
        );
        let existing = "cluster:\n  apiServer:\n    image: registry.k8s.io/kube-apiserver:v1.31.4\n";

        let merged = patch.apply_to_yaml(existing).unwrap().unwrap();
        assert!(merged.contains("registry.k8s.io/kube-apiserver:v1.31.4"));
        assert!(merged.contains("registry.k8s.io/kube-scheduler:v1.31.4"));
        assert!(patch.apply_to_yaml(&merged).unwrap().is_none());
    }

    #[test]
    fn test_digest_reference() {
        let catalog = PatchCatalog::new(ImageRepositories::default());
        let image = ImageRef::Digest("sha256:abc".to_string());
        assert_eq!(
            catalog.image(Component::KubeProxy, &image),
            "registry.k8s.io/kube-proxy@sha256:abc"
        );
    }

    #[test]
    fn test_composed_patch_keeps_all_ops() {
        let catalog = PatchCatalog::new(ImageRepositories::default());
        let tag = ImageRef::Tag(Version::new(1, 30, 8));
        let composed = Patch::compose([
            catalog.patch_for(Component::ApiServer, &tag),
            catalog.patch_for(Component::Kubelet, &tag),
        ]);
        assert_eq!(composed.ops.len(), 2);
        assert_eq!(composed.used_images.len(), 2);
        assert!(composed.name.contains('+'));
    }
}

mod store_tests {
    use kube_upgrade_operator::store::LabelQuery;

    #[test]
    fn test_label_selector_rendering() {
        let query = LabelQuery::new()
            .equals("upgrade.kubeops.io/cluster", "prod")
            .exists("upgrade.kubeops.io/owner");
        assert_eq!(
            query.to_selector(),
            "upgrade.kubeops.io/cluster=prod,upgrade.kubeops.io/owner"
        );
    }
}
