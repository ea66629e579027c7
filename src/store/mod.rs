//! Component G: a uniform interface over wherever ServiceDefinitions
//! actually live, so the reconciliation engine never has to know whether
//! it's reading YAML files or Kubernetes custom resources.

pub mod crd;
pub mod fs;

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    McpServer,
    ServiceClass,
    Workflow,
    Capability,
}

impl EntityKind {
    pub fn all() -> [EntityKind; 4] {
        [EntityKind::McpServer, EntityKind::ServiceClass, EntityKind::Workflow, EntityKind::Capability]
    }

    /// Subdirectory name under the filesystem store root, and the CRD's
    /// plural, per the persistent state layout.
    pub fn plural(&self) -> &'static str {
        match self {
            EntityKind::McpServer => "mcpservers",
            EntityKind::ServiceClass => "serviceclasses",
            EntityKind::Workflow => "workflows",
            EntityKind::Capability => "capabilities",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    pub kind: EntityKind,
    pub namespace: String,
    pub name: String,
}

/// One entity as read from the store: its desired-state spec plus
/// whatever status was last written back (empty/default until a
/// reconciler writes one).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEntity {
    pub key: EntityKey,
    pub spec: serde_json::Value,
    pub status: serde_json::Value,
}

#[derive(Debug, Clone)]
pub enum StoreEventKind {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone)]
pub enum StoreEvent {
    Changed { key: EntityKey, kind: StoreEventKind },
    /// Delivered to a subscriber that fell behind; callers should treat
    /// this as "re-list and resync", same as the reconciler's periodic
    /// resync.
    Lagged,
}

pub struct StoreSubscription {
    inner: broadcast::Receiver<StoreEvent>,
}

impl StoreSubscription {
    pub fn new(inner: broadcast::Receiver<StoreEvent>) -> Self {
        Self { inner }
    }

    pub async fn recv(&mut self) -> StoreEvent {
        loop {
            match self.inner.recv().await {
                Ok(event) => return event,
                Err(broadcast::error::RecvError::Lagged(_)) => return StoreEvent::Lagged,
                Err(broadcast::error::RecvError::Closed) => return StoreEvent::Lagged,
            }
        }
    }
}

/// Implemented identically by the filesystem and CRD backends; the
/// reconciliation engine is written against this trait only.
#[async_trait]
pub trait Store: Send + Sync {
    async fn list(&self, kind: EntityKind) -> Result<Vec<StoredEntity>>;
    async fn get(&self, kind: EntityKind, namespace: &str, name: &str) -> Result<StoredEntity>;
    async fn watch(&self, kind: EntityKind) -> Result<StoreSubscription>;
    async fn update_status(&self, kind: EntityKind, namespace: &str, name: &str, status: serde_json::Value) -> Result<()>;
}
