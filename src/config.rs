//! Operator configuration loaded from the environment.
//!
//! Every setting has a default so the operator starts with an empty
//! environment. Values are read through a lookup function so tests can
//! inject them without touching the process environment.

use std::time::Duration;

use semver::Version;
use thiserror::Error;

use crate::controller::component::{Component, ComponentPriority};

/// Default number of clusters reconciled in parallel.
pub const DEFAULT_CONCURRENCY: u16 = 4;

/// Default requeue interval for converged clusters.
pub const DEFAULT_RESYNC_SECS: u64 = 300;

/// Default deadline for a single reconciliation.
pub const DEFAULT_RECONCILE_TIMEOUT_SECS: u64 = 60;

/// Default port for the health and metrics server.
pub const DEFAULT_HEALTH_PORT: u16 = 8080;

/// Kubernetes versions offered as upgrade targets when none are configured.
const DEFAULT_KUBERNETES_VERSIONS: &[&str] = &[
    "1.30.0", "1.30.8", "1.31.0", "1.31.4", "1.32.0", "1.32.3", "1.33.0", "1.33.1",
];

/// Errors raised while loading configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable holds a value of the wrong shape
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        /// Environment variable name.
        key: &'static str,
        /// Offending value.
        value: String,
        /// What was expected.
        reason: String,
    },
}

impl ConfigError {
    fn invalid(key: &'static str, value: &str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// Image repositories for each component, without tag or digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRepositories {
    pub api_server: String,
    pub controller_manager: String,
    pub scheduler: String,
    pub kube_proxy: String,
    pub kubelet: String,
}

impl Default for ImageRepositories {
    fn default() -> Self {
        Self {
            api_server: "registry.k8s.io/kube-apiserver".to_string(),
            controller_manager: "registry.k8s.io/kube-controller-manager".to_string(),
            scheduler: "registry.k8s.io/kube-scheduler".to_string(),
            kube_proxy: "registry.k8s.io/kube-proxy".to_string(),
            kubelet: "ghcr.io/siderolabs/kubelet".to_string(),
        }
    }
}

impl ImageRepositories {
    /// Repository of a component's image.
    pub fn for_component(&self, component: Component) -> &str {
        match component {
            Component::ApiServer => &self.api_server,
            Component::ControllerManager => &self.controller_manager,
            Component::Scheduler => &self.scheduler,
            Component::KubeProxy => &self.kube_proxy,
            Component::Kubelet => &self.kubelet,
        }
    }
}

/// Runtime configuration of the operator.
#[derive(Debug, Clone, PartialEq)]
pub struct OperatorConfig {
    /// Namespace to watch; `None` watches all namespaces.
    pub namespace: Option<String>,
    /// Maximum number of clusters reconciled in parallel.
    pub concurrency: u16,
    /// Requeue interval once a cluster has converged.
    pub resync_interval: Duration,
    /// Deadline for one reconciliation.
    pub reconcile_timeout: Duration,
    /// Order in which components are upgraded.
    pub priority: ComponentPriority,
    /// Supported Kubernetes versions, ascending.
    pub kubernetes_versions: Vec<Version>,
    /// Image repositories per component.
    pub images: ImageRepositories,
    /// Port of the health and metrics server.
    pub health_port: u16,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            concurrency: DEFAULT_CONCURRENCY,
            resync_interval: Duration::from_secs(DEFAULT_RESYNC_SECS),
            reconcile_timeout: Duration::from_secs(DEFAULT_RECONCILE_TIMEOUT_SECS),
            priority: ComponentPriority::default(),
            kubernetes_versions: DEFAULT_KUBERNETES_VERSIONS
                .iter()
                .filter_map(|v| Version::parse(v).ok())
                .collect(),
            images: ImageRepositories::default(),
            health_port: DEFAULT_HEALTH_PORT,
        }
    }
}

impl OperatorConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        config.namespace = get("UPGRADE_NAMESPACE");

        if let Some(v) = get("UPGRADE_CONCURRENCY") {
            config.concurrency = parse_number("UPGRADE_CONCURRENCY", &v)?;
            if config.concurrency == 0 {
                return Err(ConfigError::invalid(
                    "UPGRADE_CONCURRENCY",
                    &v,
                    "must be at least 1",
                ));
            }
        }
        if let Some(v) = get("UPGRADE_RESYNC_SECS") {
            config.resync_interval =
                Duration::from_secs(parse_number("UPGRADE_RESYNC_SECS", &v)?);
        }
        if let Some(v) = get("UPGRADE_RECONCILE_TIMEOUT_SECS") {
            config.reconcile_timeout =
                Duration::from_secs(parse_number("UPGRADE_RECONCILE_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = get("UPGRADE_HEALTH_PORT") {
            config.health_port = parse_number("UPGRADE_HEALTH_PORT", &v)?;
        }

        if let Some(v) = get("UPGRADE_COMPONENT_PRIORITY") {
            config.priority = ComponentPriority::parse(&v).ok_or_else(|| {
                ConfigError::invalid(
                    "UPGRADE_COMPONENT_PRIORITY",
                    &v,
                    "must name every component exactly once",
                )
            })?;
        }

        if let Some(v) = get("UPGRADE_KUBERNETES_VERSIONS") {
            config.kubernetes_versions = parse_versions(&v)?;
        }

        let images = &mut config.images;
        for (key, slot) in [
            ("UPGRADE_APISERVER_IMAGE", &mut images.api_server),
            (
                "UPGRADE_CONTROLLER_MANAGER_IMAGE",
                &mut images.controller_manager,
            ),
            ("UPGRADE_SCHEDULER_IMAGE", &mut images.scheduler),
            ("UPGRADE_PROXY_IMAGE", &mut images.kube_proxy),
            ("UPGRADE_KUBELET_IMAGE", &mut images.kubelet),
        ] {
            if let Some(v) = get(key) {
                if v.contains('@') || v.rsplit('/').next().is_some_and(|s| s.contains(':')) {
                    return Err(ConfigError::invalid(
                        key,
                        &v,
                        "repository must not carry a tag or digest",
                    ));
                }
                *slot = v.trim().to_string();
            }
        }

        Ok(config)
    }
}

fn parse_number<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::invalid(key, value, "expected a non-negative integer"))
}

fn parse_versions(value: &str) -> Result<Vec<Version>, ConfigError> {
    let mut versions = value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            Version::parse(s.trim_start_matches('v')).map_err(|e| {
                ConfigError::invalid("UPGRADE_KUBERNETES_VERSIONS", s, e.to_string())
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    versions.sort();
    versions.dedup();
    Ok(versions)
}
