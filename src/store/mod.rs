//! Resource store used by the controller.
//!
//! The controller never talks to the Kubernetes API directly; it goes through
//! the [`Store`] trait so reconciliation can run against the real API server
//! ([`KubeStore`]) or an in-process store ([`MemoryStore`]) in tests.
//!
//! Change notification is not part of the trait: re-triggering a reconcile on
//! changes is handled by the kube-runtime watches wired up in `run_controller`.

mod api;
mod memory;

pub use api::KubeStore;
pub use memory::{MemoryStore, RecordedEvent};

use std::collections::BTreeMap;
use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::{Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::controller::error::Result;

/// Resources the store can hold.
pub trait StoreResource:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> StoreResource for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Severity of a published event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Normal,
    Warning,
}

/// An event to publish against an object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub kind: EventKind,
    /// Machine-readable reason (e.g., "UpgradeStepApplied").
    pub reason: String,
    /// Action taken or attempted.
    pub action: String,
    /// Human-readable note.
    pub note: Option<String>,
}

impl EventRecord {
    /// A normal event.
    pub fn normal(reason: &str, action: &str, note: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Normal,
            reason: reason.to_string(),
            action: action.to_string(),
            note: Some(note.into()),
        }
    }

    /// A warning event.
    pub fn warning(reason: &str, action: &str, note: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Warning,
            ..Self::normal(reason, action, note)
        }
    }
}

/// Typed, versioned object store with label queries and finalizers.
///
/// Writes are optimistic: `replace` fails with `Error::Conflict` when the
/// object's `resourceVersion` no longer matches the stored one.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Fetch an object, `None` if it does not exist.
    async fn get<K: StoreResource>(&self, namespace: &str, name: &str) -> Result<Option<K>>;

    /// List objects in a namespace matching a label query.
    async fn list<K: StoreResource>(&self, namespace: &str, query: &LabelQuery) -> Result<Vec<K>>;

    /// Create an object; fails with `Error::Conflict` if it already exists.
    async fn create<K: StoreResource>(&self, namespace: &str, obj: &K) -> Result<K>;

    /// Replace an existing object, checking its `resourceVersion`.
    async fn replace<K: StoreResource>(&self, namespace: &str, obj: &K) -> Result<K>;

    /// Delete an object. Returns `false` if it did not exist.
    ///
    /// Objects carrying finalizers are only marked for deletion.
    async fn delete<K: StoreResource>(&self, namespace: &str, name: &str) -> Result<bool>;

    /// Publish an event about an object. Failures are logged, not returned.
    async fn publish_event(&self, reference: ObjectReference, event: EventRecord);
}

// ============================================================================
// Label queries
// ============================================================================

/// One requirement of a label query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelTerm {
    /// Label must be present with exactly this value.
    Equals(String, String),
    /// Label must be present with any value.
    Exists(String),
}

impl LabelTerm {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            LabelTerm::Equals(key, value) => labels.get(key) == Some(value),
            LabelTerm::Exists(key) => labels.contains_key(key),
        }
    }
}

impl std::fmt::Display for LabelTerm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LabelTerm::Equals(key, value) => write!(f, "{key}={value}"),
            LabelTerm::Exists(key) => f.write_str(key),
        }
    }
}

/// Conjunction of label requirements. An empty query matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelQuery {
    terms: Vec<LabelTerm>,
}

impl LabelQuery {
    /// Empty query.
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `key=value`.
    pub fn equals(mut self, key: &str, value: &str) -> Self {
        self.terms
            .push(LabelTerm::Equals(key.to_string(), value.to_string()));
        self
    }

    /// Require `key` to be present.
    pub fn exists(mut self, key: &str) -> Self {
        self.terms.push(LabelTerm::Exists(key.to_string()));
        self
    }

    /// Render as a Kubernetes label selector string.
    pub fn to_selector(&self) -> String {
        self.terms
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Check a label set against the query.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.terms.iter().all(|t| t.matches(labels))
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Outcome of [`modify`].
#[derive(Debug, Clone, PartialEq)]
pub enum Modified<K> {
    /// The object did not exist and was created.
    Created(K),
    /// The object existed and was changed.
    Updated(K),
    /// The mutation left the object as it was; nothing was written.
    Unchanged(K),
}

impl<K> Modified<K> {
    /// The resulting object.
    pub fn into_inner(self) -> K {
        match self {
            Modified::Created(k) | Modified::Updated(k) | Modified::Unchanged(k) => k,
        }
    }

    /// Whether a write happened.
    pub fn is_written(&self) -> bool {
        !matches!(self, Modified::Unchanged(_))
    }
}

/// Get-mutate-upsert an object.
///
/// `new` builds the object when it does not exist yet. `mutate` is applied to
/// the existing or new object; if the serialized result equals the stored
/// object no write is issued.
pub async fn modify<S, K, N, M>(
    store: &S,
    namespace: &str,
    name: &str,
    new: N,
    mutate: M,
) -> Result<Modified<K>>
where
    S: Store + ?Sized,
    K: StoreResource,
    N: FnOnce() -> K,
    M: FnOnce(&mut K) -> Result<()>,
{
    match store.get::<K>(namespace, name).await? {
        None => {
            let mut obj = new();
            mutate(&mut obj)?;
            let created = store.create(namespace, &obj).await?;
            Ok(Modified::Created(created))
        }
        Some(existing) => {
            let before = serde_json::to_value(&existing)?;
            let mut obj = existing;
            mutate(&mut obj)?;
            if serde_json::to_value(&obj)? == before {
                return Ok(Modified::Unchanged(obj));
            }
            let updated = store.replace(namespace, &obj).await?;
            Ok(Modified::Updated(updated))
        }
    }
}

/// Add a finalizer to an object if it is not already present.
pub async fn add_finalizer<S, K>(store: &S, obj: &K, finalizer: &str) -> Result<K>
where
    S: Store + ?Sized,
    K: StoreResource,
{
    if obj.finalizers().iter().any(|f| f == finalizer) {
        return Ok(obj.clone());
    }
    let mut updated = obj.clone();
    updated.finalizers_mut().push(finalizer.to_string());
    store
        .replace(&obj.namespace().unwrap_or_default(), &updated)
        .await
}

/// Remove a finalizer from an object. Missing objects are not an error.
pub async fn remove_finalizer<S, K>(
    store: &S,
    namespace: &str,
    name: &str,
    finalizer: &str,
) -> Result<()>
where
    S: Store + ?Sized,
    K: StoreResource,
{
    let Some(mut obj) = store.get::<K>(namespace, name).await? else {
        return Ok(());
    };
    let before = obj.finalizers().len();
    obj.finalizers_mut().retain(|f| f != finalizer);
    if obj.finalizers().len() != before {
        store.replace(namespace, &obj).await?;
    }
    Ok(())
}
