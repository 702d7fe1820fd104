//! Shared context for the controller.
//!
//! The Context struct holds shared state that is passed to the reconciler:
//! the resource store, the operator configuration and optional health state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use kube::Resource;
use tracing::debug;

use crate::config::OperatorConfig;
use crate::controller::patches::PatchCatalog;
use crate::health::HealthState;
use crate::store::{EventRecord, Store};

/// Field manager name for the operator
pub const FIELD_MANAGER: &str = "kube-upgrade-operator";

/// Shared context for the controller
pub struct Context<S: Store> {
    /// Resource store
    pub store: S,
    /// Operator configuration
    pub config: OperatorConfig,
    /// Image patches built from the configured repositories
    pub catalog: PatchCatalog,
    /// Optional health state for metrics and readiness
    pub health_state: Option<Arc<HealthState>>,
    /// Consecutive failures per cluster, for backoff
    retries: Mutex<HashMap<String, u32>>,
}

impl<S: Store> Context<S> {
    /// Create a new context
    pub fn new(store: S, config: OperatorConfig, health_state: Option<Arc<HealthState>>) -> Self {
        let catalog = PatchCatalog::new(config.images.clone());
        Self {
            store,
            config,
            catalog,
            health_state,
            retries: Mutex::new(HashMap::new()),
        }
    }

    /// Publish a normal event for a resource
    pub async fn publish_normal_event<K>(&self, resource: &K, reason: &str, action: &str, note: String)
    where
        K: Resource<DynamicType = ()>,
    {
        self.store
            .publish_event(resource.object_ref(&()), EventRecord::normal(reason, action, note))
            .await;
    }

    /// Publish a warning event for a resource
    pub async fn publish_warning_event<K>(
        &self,
        resource: &K,
        reason: &str,
        action: &str,
        note: String,
    ) where
        K: Resource<DynamicType = ()>,
    {
        self.store
            .publish_event(resource.object_ref(&()), EventRecord::warning(reason, action, note))
            .await;
    }

    /// Record a failed reconciliation; returns the number of failures before this one.
    pub fn record_failure(&self, key: &str) -> u32 {
        let Ok(mut retries) = self.retries.lock() else {
            return 0;
        };
        let count = retries.entry(key.to_string()).or_insert(0);
        let previous = *count;
        *count = count.saturating_add(1);
        previous
    }

    /// Reset the failure count after a successful reconciliation.
    pub fn record_success(&self, key: &str) {
        if let Ok(mut retries) = self.retries.lock()
            && retries.remove(key).is_some()
        {
            debug!(key = %key, "Reset retry count");
        }
    }
}
