//! Reconciliation loop for Kubernetes upgrades.
//!
//! One reconciliation looks at one `Cluster`: it loads the observed
//! component state, plans the remaining upgrade steps, gates them behind
//! image pre-pulls and machine locks, applies at most one step (or a whole
//! revert batch) as `ConfigPatch` objects, and records the outcome in the
//! cluster's `KubernetesUpgradeStatus`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use jiff::Timestamp;
use kube::{Resource, ResourceExt, runtime::controller::Action};
use semver::Version;
use tracing::{debug, error, info, warn};

use crate::{
    controller::{
        common::{mark_owned, namespace_of, owned_query},
        context::Context,
        error::{Error, Result},
        patches::Patch,
        prepull::{PrePull, ensure_images_pulled},
        topology::Topology,
        upgrade_path::{ObservedState, UpgradePath, calculate_upgrade_path, normalize_version},
        upgrade_state_machine::{
            UpgradeEvent, UpgradeStateMachine, UpgradeTransitionContext, determine_upgrade_event,
        },
    },
    crd::{
        Cluster, ConfigPatch, ConfigPatchSpec, ImagePullRequest, KubernetesStatus,
        KubernetesUpgradeStatus, KubernetesUpgradeStatusSpec, UpgradePhase,
    },
    store::{Store, add_finalizer, modify, remove_finalizer},
};

/// Finalizer guarding cleanup of upgrade patches
pub const UPGRADE_FINALIZER: &str = "upgrade.kubeops.io/kubernetes-upgrade";

/// Requeue interval while an upgrade or revert is in flight
const PROGRESS_REQUEUE: Duration = Duration::from_secs(15);

const STATUS_WAITING_FOR_CLUSTER: &str = "waiting for the cluster to be ready";
const STATUS_WAITING_FOR_RESTART: &str = "waiting for a restart";
const STATUS_WAITING_FOR_UNLOCK: &str = "waiting for machine to be unlocked";

/// Reconcile a Cluster
///
/// This is the main reconciliation function called by the controller. It
/// bounds the work with the configured deadline and records metrics.
pub async fn reconcile<S: Store>(obj: Arc<Cluster>, ctx: Arc<Context<S>>) -> Result<Action> {
    let name = obj.name_any();
    let namespace = namespace_of(obj.as_ref());
    let started = Instant::now();

    debug!(name = %name, namespace = %namespace, "Reconciling Cluster");

    let deadline = ctx.config.reconcile_timeout;
    let result = match tokio::time::timeout(deadline, reconcile_cluster(&obj, &ctx)).await {
        Ok(result) => result,
        Err(_) => Err(Error::Transient(format!(
            "reconciliation exceeded {}s",
            deadline.as_secs()
        ))),
    };

    if let Some(health) = &ctx.health_state {
        match &result {
            Ok(_) => health.metrics.record_reconcile(
                &namespace,
                &name,
                started.elapsed().as_secs_f64(),
            ),
            Err(_) => health.metrics.record_error(&namespace, &name),
        }
    }
    if result.is_ok() {
        ctx.record_success(&format!("{namespace}/{name}"));
    }
    result
}

/// Error policy for the upgrade controller
pub fn error_policy<S: Store>(obj: Arc<Cluster>, error: &Error, ctx: Arc<Context<S>>) -> Action {
    let name = obj.name_any();
    let namespace = namespace_of(obj.as_ref());

    if error.is_not_found() {
        debug!(name = %name, "Resource not found (likely deleted)");
        return Action::await_change();
    }

    let retry_count = ctx.record_failure(&format!("{namespace}/{name}"));
    let backoff = error.requeue_after_with_retry_count(retry_count);

    if error.is_retryable() {
        warn!(
            name = %name,
            error = %error,
            retry_count = retry_count,
            backoff_secs = backoff.as_secs(),
            "Reconciliation failed, retrying with backoff"
        );
    } else {
        error!(
            name = %name,
            error = %error,
            backoff_secs = backoff.as_secs(),
            "Reconciliation failed with non-retryable error"
        );
    }
    Action::requeue(backoff)
}

/// Run one reconciliation pass for a cluster without the deadline wrapper.
pub async fn reconcile_cluster<S: Store>(cluster: &Cluster, ctx: &Context<S>) -> Result<Action> {
    let name = cluster.name_any();
    let namespace = namespace_of(cluster);
    let store = &ctx.store;

    if cluster.meta().deletion_timestamp.is_some() {
        return handle_deletion(cluster, ctx).await;
    }

    // Ensure finalizer is present, then carry on in the same pass
    let cluster = if cluster.finalizers().iter().any(|f| f == UPGRADE_FINALIZER) {
        cluster.clone()
    } else {
        info!(name = %name, "Adding finalizer");
        add_finalizer(store, cluster, UPGRADE_FINALIZER).await?
    };

    let Some(observed_report) = store.get::<KubernetesStatus>(&namespace, &name).await? else {
        debug!(name = %name, "No KubernetesStatus reported yet, skipping");
        return Ok(Action::await_change());
    };

    let current: KubernetesUpgradeStatusSpec = store
        .get::<KubernetesUpgradeStatus>(&namespace, &name)
        .await?
        .map(|s| s.spec)
        .unwrap_or_default();
    let phase = current.phase;

    let desired = match parse_version(&cluster.spec.kubernetes_version) {
        Ok(v) => v,
        Err(e) => {
            warn!(name = %name, error = %e, "Invalid desired Kubernetes version");
            let mut next = current.clone();
            next.error = e.to_string();
            write_status(ctx, &cluster, next).await?;
            return Ok(Action::await_change());
        }
    };

    let version_mismatch = is_version_change(&current.last_upgrade_version, &desired);
    let cluster_ready = cluster.is_running_and_ready();

    let topology = Topology::build(store, &namespace, &name).await?;
    let mut observed = ObservedState::from_kubernetes_status(&observed_report.spec, &topology);
    if !cluster_ready {
        observed.mark_all_not_ready();
    }
    let path = calculate_upgrade_path(
        &name,
        &topology,
        &observed,
        &desired,
        &ctx.catalog,
        &ctx.config.priority,
    );

    if let Some(health) = &ctx.health_state {
        health.metrics.set_pending_steps(
            &namespace,
            &name,
            i64::try_from(path.steps.len()).unwrap_or(i64::MAX),
        );
    }

    let transition_ctx = UpgradeTransitionContext {
        cluster_ready,
        version_mismatch,
        has_steps: !path.is_empty(),
        all_components_ready: path.all_components_ready,
    };
    let event = determine_upgrade_event(phase, &transition_ctx);
    let next_phase = UpgradeStateMachine::new().next_phase(phase, event, &transition_ctx);

    debug!(
        name = %name,
        phase = %phase,
        event = %event,
        steps = path.steps.len(),
        all_ready = path.all_components_ready,
        "Evaluated upgrade state"
    );

    let mut next = current.clone();
    next.upgrade_versions = upgrade_candidates(
        &ctx.config.kubernetes_versions,
        &current.last_upgrade_version,
        &desired,
    );

    let action = match event {
        UpgradeEvent::ClusterNotReady => {
            next.status = STATUS_WAITING_FOR_CLUSTER.to_string();
            Action::requeue(PROGRESS_REQUEUE)
        }

        UpgradeEvent::Converged => {
            next.phase = next_phase;
            next.step.clear();
            next.status.clear();
            next.error.clear();
            next.current_upgrade_version.clear();
            next.last_upgrade_version = desired.to_string();
            next.upgrade_versions = upgrade_candidates(
                &ctx.config.kubernetes_versions,
                &next.last_upgrade_version,
                &desired,
            );
            if phase.is_in_progress() {
                info!(name = %name, version = %desired, "Kubernetes upgrade completed");
                ctx.publish_normal_event(
                    &cluster,
                    "UpgradeCompleted",
                    "Upgrade",
                    format!("Kubernetes is at v{desired}"),
                )
                .await;
            }
            Action::requeue(ctx.config.resync_interval)
        }

        UpgradeEvent::RevertRequested => {
            let applied = apply_revert(ctx, &cluster, &path).await?;
            next.phase = next_phase;
            next.step = format!("reverting to v{desired}");
            next.status = if path.unblocked_steps().next().is_some() {
                STATUS_WAITING_FOR_RESTART.to_string()
            } else {
                STATUS_WAITING_FOR_UNLOCK.to_string()
            };
            next.error.clear();
            next.current_upgrade_version = desired.to_string();
            if applied > 0 {
                info!(name = %name, version = %desired, machines = applied, "Applied revert");
                record_step(ctx, &namespace, &name);
                ctx.publish_normal_event(
                    &cluster,
                    "RevertApplied",
                    "Revert",
                    format!("Reverting {applied} machine(s) to v{desired}"),
                )
                .await;
            }
            Action::requeue(PROGRESS_REQUEUE)
        }

        UpgradeEvent::StepReady => {
            step_forward(ctx, &cluster, &path, &desired, &current, &mut next, next_phase).await?
        }

        UpgradeEvent::ComponentsNotReady => {
            next.status = path.not_ready_status.clone();
            Action::requeue(PROGRESS_REQUEUE)
        }

        UpgradeEvent::Unresolved => {
            next.phase = next_phase;
            Action::requeue(ctx.config.resync_interval)
        }
    };

    write_status(ctx, &cluster, next).await?;
    Ok(action)
}

/// Pre-pull images, then apply the head step of the path.
async fn step_forward<S: Store>(
    ctx: &Context<S>,
    cluster: &Cluster,
    path: &UpgradePath,
    desired: &Version,
    current: &KubernetesUpgradeStatusSpec,
    next: &mut KubernetesUpgradeStatusSpec,
    next_phase: UpgradePhase,
) -> Result<Action> {
    let name = cluster.name_any();
    let namespace = namespace_of(cluster);

    let pull = ensure_images_pulled(&ctx.store, cluster, &path.all_nodes_to_required_images).await?;
    if let PrePull::InProgress { error, .. } = &pull {
        next.status = pull.status();
        next.error = error.clone().unwrap_or_default();
        if let Some(error) = error
            && *error != current.error
        {
            warn!(name = %name, error = %error, "Image pre-pull failed");
            ctx.publish_warning_event(cluster, "ImagePullFailed", "PrePull", error.clone())
                .await;
        }
        debug!(name = %name, status = %next.status, "Waiting for image pre-pull");
        return Ok(Action::requeue(PROGRESS_REQUEUE));
    }

    let Some(head) = path.head() else {
        return Ok(Action::requeue(PROGRESS_REQUEUE));
    };

    if head.blocked {
        debug!(name = %name, machine = %head.machine_id, "Next step waits for a locked machine");
        next.step = head.description.clone();
        next.status = STATUS_WAITING_FOR_UNLOCK.to_string();
        return Ok(Action::requeue(PROGRESS_REQUEUE));
    }

    let written = apply_patch(ctx, cluster, &head.machine_id, &head.patch).await?;
    next.phase = next_phase;
    next.step = head.description.clone();
    next.status = STATUS_WAITING_FOR_RESTART.to_string();
    next.error.clear();
    next.current_upgrade_version = desired.to_string();

    if written {
        info!(
            name = %name,
            machine = %head.machine_id,
            node = %head.node,
            component = %head.component,
            version = %desired,
            "Applied upgrade step"
        );
        record_step(ctx, &namespace, &name);
        ctx.publish_normal_event(cluster, "UpgradeStepApplied", "Upgrade", head.description.clone())
            .await;
    }
    Ok(Action::requeue(PROGRESS_REQUEUE))
}

/// Apply every unblocked step, one patch write per machine.
///
/// Returns the number of machines whose patch changed.
async fn apply_revert<S: Store>(
    ctx: &Context<S>,
    cluster: &Cluster,
    path: &UpgradePath,
) -> Result<usize> {
    let mut by_machine: BTreeMap<&str, Vec<Patch>> = BTreeMap::new();
    for step in path.unblocked_steps() {
        by_machine
            .entry(step.machine_id.as_str())
            .or_default()
            .push(step.patch.clone());
    }

    let mut written = 0;
    for (machine_id, patches) in by_machine {
        if apply_patch(ctx, cluster, machine_id, &Patch::compose(patches)).await? {
            written += 1;
        }
    }
    Ok(written)
}

/// Merge a patch into the machine's upgrade `ConfigPatch`.
///
/// Returns whether anything was written.
async fn apply_patch<S: Store>(
    ctx: &Context<S>,
    cluster: &Cluster,
    machine_id: &str,
    patch: &Patch,
) -> Result<bool> {
    let namespace = namespace_of(cluster);
    let patch_name = ConfigPatch::upgrade_patch_name(&cluster.name_any(), machine_id);

    let result = modify(
        &ctx.store,
        &namespace,
        &patch_name,
        || ConfigPatch::new(&patch_name, ConfigPatchSpec::default()),
        |config_patch| {
            mark_owned(&mut config_patch.metadata, cluster, Some(machine_id));
            if let Some(data) = patch.apply_to_yaml(&config_patch.spec.data)? {
                config_patch.spec.data = data;
            }
            Ok(())
        },
    )
    .await?;

    if result.is_written() {
        debug!(patch = %patch_name, name = %patch.name, "Wrote config patch");
    }
    Ok(result.is_written())
}

/// Write the upgrade status, stamping `phaseChangedAt` on phase changes.
async fn write_status<S: Store>(
    ctx: &Context<S>,
    cluster: &Cluster,
    next: KubernetesUpgradeStatusSpec,
) -> Result<()> {
    let name = cluster.name_any();
    let namespace = namespace_of(cluster);
    let phase = next.phase;

    let result = modify(
        &ctx.store,
        &namespace,
        &name,
        || KubernetesUpgradeStatus::new(&name, KubernetesUpgradeStatusSpec::default()),
        |status| {
            mark_owned(&mut status.metadata, cluster, None);
            let previous_phase = status.spec.phase;
            let changed_at = status.spec.phase_changed_at.take();
            status.spec = next;
            status.spec.phase_changed_at = if previous_phase != status.spec.phase {
                Some(Timestamp::now().to_string())
            } else {
                changed_at
            };
            Ok(())
        },
    )
    .await?;

    if result.is_written() {
        debug!(name = %name, phase = %phase, "Updated upgrade status");
    }
    if let Some(health) = &ctx.health_state {
        health.metrics.set_cluster_phase(&namespace, &name, phase);
    }
    Ok(())
}

/// Handle cluster deletion: remove everything this controller wrote.
async fn handle_deletion<S: Store>(cluster: &Cluster, ctx: &Context<S>) -> Result<Action> {
    let name = cluster.name_any();
    let namespace = namespace_of(cluster);
    let store = &ctx.store;
    let query = owned_query(&name);

    info!(name = %name, "Cluster deleted, removing upgrade patches");

    let patches: Vec<ConfigPatch> = store.list(&namespace, &query).await?;
    for patch in &patches {
        store
            .delete::<ConfigPatch>(&namespace, &patch.name_any())
            .await?;
    }

    let requests: Vec<ImagePullRequest> = store.list(&namespace, &query).await?;
    for request in &requests {
        store
            .delete::<ImagePullRequest>(&namespace, &request.name_any())
            .await?;
    }

    remove_finalizer::<_, Cluster>(store, &namespace, &name, UPGRADE_FINALIZER).await?;

    if let Some(health) = &ctx.health_state {
        health.metrics.forget_cluster(&namespace, &name);
    }
    info!(
        name = %name,
        patches = patches.len(),
        pull_requests = requests.len(),
        "Upgrade cleanup complete"
    );
    Ok(Action::await_change())
}

fn record_step<S: Store>(ctx: &Context<S>, namespace: &str, name: &str) {
    if let Some(health) = &ctx.health_state {
        health.metrics.record_step_applied(namespace, name);
    }
}

/// Parse a Kubernetes version, accepting a leading `v`.
fn parse_version(version: &str) -> Result<Version> {
    Version::parse(&normalize_version(version))
        .map_err(|e| Error::Validation(format!("invalid Kubernetes version {version:?}: {e}")))
}

/// Whether `desired` differs from the last converged version.
///
/// A cluster that never converged counts as changing version, so only a
/// recorded version can turn outstanding steps into a revert.
pub fn is_version_change(last: &str, desired: &Version) -> bool {
    parse_version(last).ok().as_ref() != Some(desired)
}

/// Versions a cluster may move to next.
///
/// Candidates are newer than the last converged version (or the desired
/// version when nothing converged yet), share its major version and are at
/// most one minor release ahead.
pub fn upgrade_candidates(supported: &[Version], last: &str, desired: &Version) -> Vec<String> {
    let base = parse_version(last).unwrap_or_else(|_| desired.clone());
    let mut candidates: Vec<&Version> = supported
        .iter()
        .filter(|v| **v > base && v.major == base.major && v.minor <= base.minor + 1)
        .collect();
    candidates.sort();
    candidates.dedup();
    candidates.into_iter().map(ToString::to_string).collect()
}
