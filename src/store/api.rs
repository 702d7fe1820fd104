//! Store backed by the Kubernetes API server.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Api, Client, ResourceExt};
use tracing::{debug, warn};

use super::{EventKind, EventRecord, LabelQuery, Store, StoreResource};
use crate::controller::context::FIELD_MANAGER;
use crate::controller::error::{Error, Result};

/// [`Store`] implementation over a `kube::Client`.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    reporter: Reporter,
}

impl KubeStore {
    /// Create a store for the given client.
    pub fn new(client: Client) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: FIELD_MANAGER.into(),
                instance: std::env::var("POD_NAME").ok(),
            },
        }
    }

    /// The underlying client.
    pub fn client(&self) -> &Client {
        &self.client
    }

    fn api<K: StoreResource>(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn post_params() -> PostParams {
        PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        }
    }
}

/// Map a write error, turning HTTP 409 into `Error::Conflict`.
fn write_error<K: StoreResource>(err: kube::Error, name: &str) -> Error {
    match err {
        kube::Error::Api(ref e) if e.code == 409 => Error::Conflict {
            kind: K::kind(&()).to_string(),
            name: name.to_string(),
        },
        other => Error::Kube(other),
    }
}

#[async_trait]
impl Store for KubeStore {
    async fn get<K: StoreResource>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        Ok(self.api::<K>(namespace).get_opt(name).await?)
    }

    async fn list<K: StoreResource>(&self, namespace: &str, query: &LabelQuery) -> Result<Vec<K>> {
        let selector = query.to_selector();
        let mut params = ListParams::default();
        if !selector.is_empty() {
            params = params.labels(&selector);
        }
        let list = self.api::<K>(namespace).list(&params).await?;
        Ok(list.items)
    }

    async fn create<K: StoreResource>(&self, namespace: &str, obj: &K) -> Result<K> {
        self.api::<K>(namespace)
            .create(&Self::post_params(), obj)
            .await
            .map_err(|e| write_error::<K>(e, &obj.name_any()))
    }

    async fn replace<K: StoreResource>(&self, namespace: &str, obj: &K) -> Result<K> {
        let name = obj.name_any();
        self.api::<K>(namespace)
            .replace(&name, &Self::post_params(), obj)
            .await
            .map_err(|e| write_error::<K>(e, &name))
    }

    async fn delete<K: StoreResource>(&self, namespace: &str, name: &str) -> Result<bool> {
        match self
            .api::<K>(namespace)
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                debug!(kind = %K::kind(&()), name = %name, "Already deleted");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn publish_event(&self, reference: ObjectReference, event: EventRecord) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone());
        let type_ = match event.kind {
            EventKind::Normal => EventType::Normal,
            EventKind::Warning => EventType::Warning,
        };
        if let Err(e) = recorder
            .publish(
                &Event {
                    type_,
                    reason: event.reason.clone(),
                    note: event.note,
                    action: event.action,
                    secondary: None,
                },
                &reference,
            )
            .await
        {
            warn!(reason = %event.reason, error = %e, "Failed to publish event");
        }
    }
}
