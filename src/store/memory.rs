//! In-process store.
//!
//! Objects are kept as JSON values keyed by kind, namespace and name, with a
//! store-wide revision counter standing in for `resourceVersion`. Finalizers,
//! deletion timestamps and owner-reference cascades behave like the API
//! server so reconciliation can be exercised end to end without a cluster.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use k8s_openapi::chrono::Utc;
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::ResourceExt;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};

use super::{EventRecord, LabelQuery, Store, StoreResource};
use crate::controller::error::{Error, Result};

type ObjectKey = (String, String, String);

/// An event captured by [`MemoryStore::publish_event`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    /// Kind of the object the event is about.
    pub kind: String,
    /// Name of the object the event is about.
    pub name: String,
    pub event: EventRecord,
}

/// [`Store`] implementation held in memory.
#[derive(Default)]
pub struct MemoryStore {
    objects: RwLock<BTreeMap<ObjectKey, Value>>,
    revision: AtomicU64,
    writes: AtomicU64,
    events: Mutex<Vec<RecordedEvent>>,
}

fn key<K: StoreResource>(namespace: &str, name: &str) -> ObjectKey {
    (
        K::kind(&()).to_string(),
        namespace.to_string(),
        name.to_string(),
    )
}

fn meta_of(value: &Value) -> Result<ObjectMeta> {
    let meta = value
        .get("metadata")
        .cloned()
        .unwrap_or_else(|| Value::Object(Default::default()));
    Ok(serde_json::from_value(meta)?)
}

fn set_meta(value: &mut Value, meta: &ObjectMeta) -> Result<()> {
    if let Some(map) = value.as_object_mut() {
        map.insert("metadata".to_string(), serde_json::to_value(meta)?);
    }
    Ok(())
}

fn has_finalizers(meta: &ObjectMeta) -> bool {
    meta.finalizers.as_ref().is_some_and(|f| !f.is_empty())
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of writes issued through the [`Store`] trait.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Events published so far, oldest first.
    pub async fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().await.clone()
    }

    /// Insert or overwrite an object without counting it as a write.
    ///
    /// Used to stage objects owned by other controllers. The namespace is
    /// taken from the object, defaulting to `default`.
    pub async fn seed<K: StoreResource>(&self, obj: K) -> Result<K> {
        let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
        let name = obj.name_any();
        let mut objects = self.objects.write().await;
        let stored = objects.get(&key::<K>(&namespace, &name));
        let uid = match stored {
            Some(v) => meta_of(v)?.uid,
            None => None,
        };
        let obj = self.stamp(obj, &namespace, uid);
        objects.insert(key::<K>(&namespace, &name), serde_json::to_value(&obj)?);
        Ok(obj)
    }

    /// Names of all stored objects of a kind in a namespace.
    pub async fn names<K: StoreResource>(&self, namespace: &str) -> Vec<String> {
        let kind = K::kind(&()).to_string();
        self.objects
            .read()
            .await
            .keys()
            .filter(|(k, ns, _)| *k == kind && ns == namespace)
            .map(|(_, _, name)| name.clone())
            .collect()
    }

    fn next_revision(&self) -> u64 {
        self.revision.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Assign namespace, resource version and uid.
    fn stamp<K: StoreResource>(&self, mut obj: K, namespace: &str, uid: Option<String>) -> K {
        let revision = self.next_revision();
        let meta = obj.meta_mut();
        meta.namespace = Some(namespace.to_string());
        meta.resource_version = Some(revision.to_string());
        meta.uid = uid.or_else(|| Some(format!("uid-{revision}")));
        obj
    }

    /// Remove everything owned, transitively, by the object with `uid`.
    fn collect_garbage(
        &self,
        objects: &mut BTreeMap<ObjectKey, Value>,
        uid: Option<String>,
    ) -> Result<()> {
        let mut owners: Vec<String> = uid.into_iter().collect();
        while let Some(owner) = owners.pop() {
            let dependents: Vec<ObjectKey> = objects
                .iter()
                .filter(|(_, v)| {
                    meta_of(v).ok().is_some_and(|m| {
                        m.owner_references
                            .unwrap_or_default()
                            .iter()
                            .any(|r| r.uid == owner)
                    })
                })
                .map(|(k, _)| k.clone())
                .collect();

            for dependent in dependents {
                let Some(value) = objects.get_mut(&dependent) else {
                    continue;
                };
                let mut meta = meta_of(value)?;
                if has_finalizers(&meta) {
                    if meta.deletion_timestamp.is_none() {
                        meta.deletion_timestamp = Some(Time(Utc::now()));
                        set_meta(value, &meta)?;
                    }
                    continue;
                }
                objects.remove(&dependent);
                if let Some(uid) = meta.uid {
                    owners.push(uid);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get<K: StoreResource>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        let objects = self.objects.read().await;
        match objects.get(&key::<K>(namespace, name)) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    async fn list<K: StoreResource>(&self, namespace: &str, query: &LabelQuery) -> Result<Vec<K>> {
        let kind = K::kind(&()).to_string();
        let objects = self.objects.read().await;
        let mut out = Vec::new();
        for ((k, ns, _), value) in objects.iter() {
            if *k != kind || ns != namespace {
                continue;
            }
            let labels = meta_of(value)?.labels.unwrap_or_default();
            if query.matches(&labels) {
                out.push(serde_json::from_value(value.clone())?);
            }
        }
        Ok(out)
    }

    async fn create<K: StoreResource>(&self, namespace: &str, obj: &K) -> Result<K> {
        let name = obj.name_any();
        let key = key::<K>(namespace, &name);
        let mut objects = self.objects.write().await;
        if objects.contains_key(&key) {
            return Err(Error::Conflict {
                kind: K::kind(&()).to_string(),
                name,
            });
        }
        let mut obj = self.stamp(obj.clone(), namespace, None);
        obj.meta_mut().deletion_timestamp = None;
        objects.insert(key, serde_json::to_value(&obj)?);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(obj)
    }

    async fn replace<K: StoreResource>(&self, namespace: &str, obj: &K) -> Result<K> {
        let name = obj.name_any();
        let key = key::<K>(namespace, &name);
        let mut objects = self.objects.write().await;
        let Some(stored) = objects.get(&key) else {
            return Err(Error::NotFound {
                kind: K::kind(&()).to_string(),
                name,
            });
        };
        let stored_meta = meta_of(stored)?;
        if let Some(version) = obj.meta().resource_version.as_ref()
            && stored_meta.resource_version.as_ref() != Some(version)
        {
            return Err(Error::Conflict {
                kind: K::kind(&()).to_string(),
                name,
            });
        }

        let mut obj = self.stamp(obj.clone(), namespace, stored_meta.uid.clone());
        obj.meta_mut().deletion_timestamp = stored_meta.deletion_timestamp.clone();
        self.writes.fetch_add(1, Ordering::SeqCst);

        if obj.meta().deletion_timestamp.is_some() && !has_finalizers(obj.meta()) {
            objects.remove(&key);
            self.collect_garbage(&mut objects, stored_meta.uid)?;
            return Ok(obj);
        }
        objects.insert(key, serde_json::to_value(&obj)?);
        Ok(obj)
    }

    async fn delete<K: StoreResource>(&self, namespace: &str, name: &str) -> Result<bool> {
        let key = key::<K>(namespace, name);
        let mut objects = self.objects.write().await;
        let Some(value) = objects.get_mut(&key) else {
            return Ok(false);
        };
        let mut meta = meta_of(value)?;
        if has_finalizers(&meta) {
            if meta.deletion_timestamp.is_none() {
                meta.deletion_timestamp = Some(Time(Utc::now()));
                meta.resource_version = Some(self.next_revision().to_string());
                set_meta(value, &meta)?;
                self.writes.fetch_add(1, Ordering::SeqCst);
            }
            return Ok(true);
        }
        objects.remove(&key);
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.collect_garbage(&mut objects, meta.uid)?;
        Ok(true)
    }

    async fn publish_event(&self, reference: ObjectReference, event: EventRecord) {
        self.events.lock().await.push(RecordedEvent {
            kind: reference.kind.unwrap_or_default(),
            name: reference.name.unwrap_or_default(),
            event,
        });
    }
}
