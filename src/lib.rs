//! kube-upgrade-operator library crate
//!
//! This module exports the upgrade controller, CRD definitions, the
//! resource store abstraction and the health server.

pub mod config;
pub mod controller;
pub mod crd;
pub mod health;
pub mod store;

pub use config::OperatorConfig;
pub use health::HealthState;

use std::sync::Arc;

use futures::{Stream, StreamExt};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::controller as runtime_controller;
use kube::runtime::{Controller, WatchStreamExt, metadata_watcher, reflector, watcher};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tracing::{debug, error, info};

use controller::{
    context::Context,
    upgrade_reconciler::{error_policy, reconcile},
};
use crd::{
    Cluster, ClusterMachine, ClusterMachineIdentity, ConfigPatch, ImagePullStatus,
    KubernetesStatus, LABEL_CLUSTER,
};
use store::KubeStore;

/// Create namespaced or cluster-wide API based on scope
pub fn scoped_api<T>(client: Client, namespace: Option<&str>) -> Api<T>
where
    T: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <T as Resource>::DynamicType: Default,
    T: Clone + DeserializeOwned + std::fmt::Debug,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Create the default watcher configuration for all watches.
///
/// - `any_semantic()`: More reliable resource discovery in test environments
fn default_watcher_config() -> WatcherConfig {
    WatcherConfig::default().any_semantic()
}

/// Create the cluster stream backed by a reflector cache.
///
/// No generation predicate: cluster readiness lives in status, and status
/// changes must trigger a reconciliation.
fn create_cluster_stream<K>(
    api: Api<K>,
    watcher_config: WatcherConfig,
) -> (
    reflector::Store<K>,
    impl Stream<Item = Result<K, watcher::Error>>,
)
where
    K: Resource + Clone + DeserializeOwned + std::fmt::Debug + Send + 'static,
    K::DynamicType: Default + Eq + std::hash::Hash + Clone,
{
    let (reader, writer) = reflector::store();
    let stream = reflector(writer, watcher(api, watcher_config))
        .default_backoff()
        .applied_objects();
    (reader, stream)
}

/// Map an object named after its cluster back to that cluster.
fn same_name<K: Resource>(obj: &K) -> Option<ObjectRef<Cluster>> {
    let namespace = obj.namespace()?;
    Some(ObjectRef::new(&obj.name_any()).within(&namespace))
}

/// Map an object carrying the cluster label back to that cluster.
fn labelled_cluster<K: Resource>(obj: &K) -> Option<ObjectRef<Cluster>> {
    let namespace = obj.namespace()?;
    let cluster = obj.labels().get(LABEL_CLUSTER)?;
    Some(ObjectRef::new(cluster).within(&namespace))
}

/// Run the upgrade controller.
///
/// This is the main controller loop that watches Cluster resources and the
/// resources describing their state, and reconciles each cluster towards
/// its desired Kubernetes version. It can be called from main.rs or spawned
/// as a background task.
///
/// If health_state is provided, metrics will be recorded for reconciliations.
pub async fn run_controller(
    client: Client,
    config: OperatorConfig,
    health_state: Option<Arc<HealthState>>,
) {
    let namespace = config.namespace.clone();
    let namespace = namespace.as_deref();
    info!(
        scope = namespace.unwrap_or("cluster-wide"),
        concurrency = config.concurrency,
        "Starting controller for Cluster resources"
    );

    // Mark as ready once we start the controller
    if let Some(ref state) = health_state {
        state.set_ready(true).await;
    }

    let controller_config = runtime_controller::Config::default().concurrency(config.concurrency);
    let ctx = Arc::new(Context::new(
        KubeStore::new(client.clone()),
        config,
        health_state,
    ));

    let clusters: Api<Cluster> = scoped_api(client.clone(), namespace);
    let machines: Api<ClusterMachine> = scoped_api(client.clone(), namespace);
    let identities: Api<ClusterMachineIdentity> = scoped_api(client.clone(), namespace);
    let kubernetes_statuses: Api<KubernetesStatus> = scoped_api(client.clone(), namespace);
    let pull_statuses: Api<ImagePullStatus> = scoped_api(client.clone(), namespace);
    let config_patches: Api<ConfigPatch> = scoped_api(client.clone(), namespace);

    let watcher_config = default_watcher_config();
    let (reader, cluster_stream) = create_cluster_stream(clusters, watcher_config.clone());

    // Machines, identities and owned patches are only needed as triggers, so
    // they are watched as metadata. Lock annotations and labels live there.
    Controller::for_stream(cluster_stream, reader)
        .with_config(controller_config)
        .watches(kubernetes_statuses, watcher_config.clone(), |s| same_name(&s))
        .watches(pull_statuses, watcher_config.clone(), |s| same_name(&s))
        .watches_stream(
            metadata_watcher(machines, watcher_config.clone()).touched_objects(),
            |m| labelled_cluster(&m),
        )
        .watches_stream(
            metadata_watcher(identities, watcher_config.clone()).touched_objects(),
            |m| labelled_cluster(&m),
        )
        .owns_stream(metadata_watcher(config_patches, watcher_config).touched_objects())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    debug!(name = %obj.name, "Reconciled");
                }
                Err(e) => {
                    // NotFound errors are expected after deletion when
                    // related watch events trigger reconciliation for a
                    // deleted cluster.
                    let is_not_found = match &e {
                        runtime_controller::Error::ObjectNotFound(_) => true,
                        runtime_controller::Error::ReconcilerFailed(err, _) => err.is_not_found(),
                        _ => false,
                    };
                    if is_not_found {
                        debug!("Object no longer exists (likely deleted): {:?}", e);
                    } else {
                        error!("Reconciliation error: {:?}", e);
                    }
                }
            }
        })
        .await;

    info!("Controller stream ended");
}
