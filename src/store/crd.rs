//! CRD Store backend: reads/watches `MCPServer`/`ServiceClass`/`Workflow`/
//! `Capability` custom resources and writes reconciler output back onto
//! their status subresource.

use super::{EntityKey, EntityKind, Store, StoreEvent, StoreEventKind, StoredEntity};
use crate::error::Result;
use crate::operator::crd::{Capability, EntityStatus, MCPServer, ServiceClass, Workflow};
use async_trait::async_trait;
use futures::StreamExt;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Client, Resource, ResourceExt};
use serde::Serialize;
use serde_json::json;
use std::fmt::Debug;
use tokio::sync::broadcast;
use tracing::warn;

pub struct CrdStore {
    client: Client,
    namespace: String,
    events: broadcast::Sender<StoreEvent>,
}

impl CrdStore {
    pub fn new(client: Client, namespace: String) -> Self {
        let (events, _) = broadcast::channel(256);
        Self { client, namespace, events }
    }

    /// Spawns the watch for one entity kind; the reconciliation engine
    /// calls this once per kind at startup.
    pub fn spawn_watch(&self, kind: EntityKind) {
        let events = self.events.clone();
        let client = self.client.clone();
        let namespace = self.namespace.clone();
        match kind {
            EntityKind::McpServer => {
                tokio::spawn(watch_kind::<MCPServer>(client, namespace, kind, events));
            }
            EntityKind::ServiceClass => {
                tokio::spawn(watch_kind::<ServiceClass>(client, namespace, kind, events));
            }
            EntityKind::Workflow => {
                tokio::spawn(watch_kind::<Workflow>(client, namespace, kind, events));
            }
            EntityKind::Capability => {
                tokio::spawn(watch_kind::<Capability>(client, namespace, kind, events));
            }
        }
    }
}

async fn watch_kind<K>(client: Client, namespace: String, kind: EntityKind, events: broadcast::Sender<StoreEvent>)
where
    K: Resource<Scope = kube::core::NamespaceResourceScope>
        + Clone
        + Debug
        + Send
        + Sync
        + 'static
        + for<'de> serde::Deserialize<'de>,
    K::DynamicType: Default + Eq + std::hash::Hash + Clone,
{
    let api: Api<K> = Api::namespaced(client, &namespace);
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    tokio::pin!(stream);

    while let Some(result) = stream.next().await {
        match result {
            Ok(event) => handle_event(kind, event, &events),
            Err(e) => warn!("crd watch error for {}: {e}", kind.plural()),
        }
    }
}

fn handle_event<K>(kind: EntityKind, event: Event<K>, events: &broadcast::Sender<StoreEvent>)
where
    K: Resource + ResourceExt,
{
    match event {
        Event::Apply(obj) | Event::InitApply(obj) => {
            let key = EntityKey { kind, namespace: obj.namespace().unwrap_or_default(), name: obj.name_any() };
            let _ = events.send(StoreEvent::Changed { key, kind: StoreEventKind::Modified });
        }
        Event::Delete(obj) => {
            let key = EntityKey { kind, namespace: obj.namespace().unwrap_or_default(), name: obj.name_any() };
            let _ = events.send(StoreEvent::Changed { key, kind: StoreEventKind::Deleted });
        }
        Event::Init | Event::InitDone => {}
    }
}

fn spec_of<K: Serialize>(spec: &K) -> serde_json::Value {
    serde_json::to_value(spec).unwrap_or(serde_json::Value::Null)
}

fn status_of(status: &Option<EntityStatus>) -> serde_json::Value {
    status.as_ref().map(|s| serde_json::to_value(s).unwrap_or(serde_json::Value::Null)).unwrap_or(serde_json::Value::Null)
}

#[async_trait]
impl Store for CrdStore {
    async fn list(&self, kind: EntityKind) -> Result<Vec<StoredEntity>> {
        match kind {
            EntityKind::McpServer => {
                let api: Api<MCPServer> = Api::namespaced(self.client.clone(), &self.namespace);
                Ok(api
                    .list(&Default::default())
                    .await?
                    .items
                    .into_iter()
                    .map(|o| StoredEntity {
                        key: EntityKey { kind, namespace: o.namespace().unwrap_or_default(), name: o.name_any() },
                        spec: spec_of(&o.spec),
                        status: status_of(&o.status),
                    })
                    .collect())
            }
            EntityKind::ServiceClass => {
                let api: Api<ServiceClass> = Api::namespaced(self.client.clone(), &self.namespace);
                Ok(api
                    .list(&Default::default())
                    .await?
                    .items
                    .into_iter()
                    .map(|o| StoredEntity {
                        key: EntityKey { kind, namespace: o.namespace().unwrap_or_default(), name: o.name_any() },
                        spec: spec_of(&o.spec),
                        status: status_of(&o.status),
                    })
                    .collect())
            }
            EntityKind::Workflow => {
                let api: Api<Workflow> = Api::namespaced(self.client.clone(), &self.namespace);
                Ok(api
                    .list(&Default::default())
                    .await?
                    .items
                    .into_iter()
                    .map(|o| StoredEntity {
                        key: EntityKey { kind, namespace: o.namespace().unwrap_or_default(), name: o.name_any() },
                        spec: spec_of(&o.spec),
                        status: status_of(&o.status),
                    })
                    .collect())
            }
            EntityKind::Capability => {
                let api: Api<Capability> = Api::namespaced(self.client.clone(), &self.namespace);
                Ok(api
                    .list(&Default::default())
                    .await?
                    .items
                    .into_iter()
                    .map(|o| StoredEntity {
                        key: EntityKey { kind, namespace: o.namespace().unwrap_or_default(), name: o.name_any() },
                        spec: spec_of(&o.spec),
                        status: status_of(&o.status),
                    })
                    .collect())
            }
        }
    }

    async fn get(&self, kind: EntityKind, namespace: &str, name: &str) -> Result<StoredEntity> {
        let namespace = if namespace.is_empty() { self.namespace.as_str() } else { namespace };
        match kind {
            EntityKind::McpServer => {
                let api: Api<MCPServer> = Api::namespaced(self.client.clone(), namespace);
                let o = api.get(name).await?;
                Ok(StoredEntity {
                    key: EntityKey { kind, namespace: namespace.to_string(), name: name.to_string() },
                    spec: spec_of(&o.spec),
                    status: status_of(&o.status),
                })
            }
            EntityKind::ServiceClass => {
                let api: Api<ServiceClass> = Api::namespaced(self.client.clone(), namespace);
                let o = api.get(name).await?;
                Ok(StoredEntity {
                    key: EntityKey { kind, namespace: namespace.to_string(), name: name.to_string() },
                    spec: spec_of(&o.spec),
                    status: status_of(&o.status),
                })
            }
            EntityKind::Workflow => {
                let api: Api<Workflow> = Api::namespaced(self.client.clone(), namespace);
                let o = api.get(name).await?;
                Ok(StoredEntity {
                    key: EntityKey { kind, namespace: namespace.to_string(), name: name.to_string() },
                    spec: spec_of(&o.spec),
                    status: status_of(&o.status),
                })
            }
            EntityKind::Capability => {
                let api: Api<Capability> = Api::namespaced(self.client.clone(), namespace);
                let o = api.get(name).await?;
                Ok(StoredEntity {
                    key: EntityKey { kind, namespace: namespace.to_string(), name: name.to_string() },
                    spec: spec_of(&o.spec),
                    status: status_of(&o.status),
                })
            }
        }
    }

    async fn watch(&self, _kind: EntityKind) -> Result<super::StoreSubscription> {
        Ok(super::StoreSubscription::new(self.events.subscribe()))
    }

    async fn update_status(&self, kind: EntityKind, namespace: &str, name: &str, status: serde_json::Value) -> Result<()> {
        let namespace = if namespace.is_empty() { self.namespace.as_str() } else { namespace };
        let patch = json!({ "status": status });
        let params = PatchParams::apply("muster-reconciler");
        match kind {
            EntityKind::McpServer => {
                let api: Api<MCPServer> = Api::namespaced(self.client.clone(), namespace);
                api.patch_status(name, &params, &Patch::Merge(&patch)).await?;
            }
            EntityKind::ServiceClass => {
                let api: Api<ServiceClass> = Api::namespaced(self.client.clone(), namespace);
                api.patch_status(name, &params, &Patch::Merge(&patch)).await?;
            }
            EntityKind::Workflow => {
                let api: Api<Workflow> = Api::namespaced(self.client.clone(), namespace);
                api.patch_status(name, &params, &Patch::Merge(&patch)).await?;
            }
            EntityKind::Capability => {
                let api: Api<Capability> = Api::namespaced(self.client.clone(), namespace);
                api.patch_status(name, &params, &Patch::Merge(&patch)).await?;
            }
        }
        Ok(())
    }
}
