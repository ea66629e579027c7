//! Concrete reconcilers: `MCPServerReconciler` drives the Orchestrator to
//! bring a ServiceDefinition's actual state in line with its desired
//! spec; `DeclarativeReconciler` validates the schema-only kinds
//! (ServiceClass/Workflow/Capability) that have no supervised process.

use super::engine::{Outcome, Reconciler};
use crate::error::Error;
use crate::orchestrator::{definition_hash, Orchestrator};
use crate::registry::{RestartPolicy, ServiceDefinition, ServiceKind, ServiceState};
use crate::store::{EntityKey, EntityKind, Store};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Deserialize, Default)]
struct McpServerSpecDoc {
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default = "default_restart_policy")]
    restart_policy: String,
    #[serde(default)]
    max_restart_attempts: Option<u32>,
}

fn default_restart_policy() -> String {
    "on-failure".to_string()
}

fn restart_policy_of(s: &str) -> RestartPolicy {
    match s {
        "never" => RestartPolicy::Never,
        "always" => RestartPolicy::Always,
        _ => RestartPolicy::OnFailure,
    }
}

pub struct MCPServerReconciler {
    store: Arc<dyn Store>,
    orchestrator: Arc<Orchestrator>,
}

impl MCPServerReconciler {
    pub fn new(store: Arc<dyn Store>, orchestrator: Arc<Orchestrator>) -> Self {
        Self { store, orchestrator }
    }
}

#[async_trait]
impl Reconciler for MCPServerReconciler {
    fn kind(&self) -> EntityKind {
        EntityKind::McpServer
    }

    async fn reconcile(&self, key: &EntityKey) -> Outcome {
        let entity = match self.store.get(EntityKind::McpServer, &key.namespace, &key.name).await {
            Ok(entity) => entity,
            Err(Error::NotFound(_)) => {
                if let Err(e) = self.orchestrator.delete(&key.name).await {
                    return Outcome::Error(e);
                }
                return Outcome::Done;
            }
            Err(e) => return Outcome::Error(e),
        };

        let fields: McpServerSpecDoc = match serde_json::from_value(entity.spec.clone()) {
            Ok(fields) => fields,
            Err(e) => {
                let _ = self
                    .store
                    .update_status(
                        EntityKind::McpServer,
                        &key.namespace,
                        &key.name,
                        json!({"state": "Blocked", "lastError": format!("invalid spec: {e}")}),
                    )
                    .await;
                return Outcome::Error(Error::Validation(format!("invalid mcpserver spec: {e}")));
            }
        };

        let def = ServiceDefinition {
            name: key.name.clone(),
            kind: ServiceKind::McpServer,
            spec: entity.spec.clone(),
            dependencies: fields.dependencies,
            auto_start: true,
            restart_policy: restart_policy_of(&fields.restart_policy),
            max_restart_attempts: fields.max_restart_attempts,
            health_check: None,
        };

        let result = match self.orchestrator.get_status(&key.name) {
            Ok(existing) if existing.definition_hash == definition_hash(&def.spec) => Ok(()),
            Ok(_) => self.orchestrator.update(def).await,
            Err(_) => self.orchestrator.create(def).await,
        };

        if let Err(e) = result {
            return Outcome::Error(e);
        }

        self.write_back_status(key).await
    }
}

impl MCPServerReconciler {
    async fn write_back_status(&self, key: &EntityKey) -> Outcome {
        let instance = match self.orchestrator.get_status(&key.name) {
            Ok(i) => i,
            Err(_) => return Outcome::Done,
        };

        let status = json!({
            "state": format!("{:?}", instance.state),
            "lastError": instance.last_error,
            "restartCount": instance.restart_count,
            "observedToolCount": instance.exposed_tools.len(),
        });

        if let Err(e) = self.store.update_status(EntityKind::McpServer, &key.namespace, &key.name, status).await {
            warn!(server = %key.name, error = %e, "status write-back failed");
        }

        if matches!(instance.state, ServiceState::Starting | ServiceState::Pending) {
            Outcome::RetryAfter(std::time::Duration::from_secs(2))
        } else {
            Outcome::Done
        }
    }
}

/// Shared by ServiceClass/Workflow/Capability: these have no supervised
/// process, so "reconcile" means validate the spec shape and publish
/// `valid`/`availableOperations` onto status.
pub struct DeclarativeReconciler {
    kind: EntityKind,
    store: Arc<dyn Store>,
}

impl DeclarativeReconciler {
    pub fn new(kind: EntityKind, store: Arc<dyn Store>) -> Self {
        assert!(
            matches!(kind, EntityKind::ServiceClass | EntityKind::Workflow | EntityKind::Capability),
            "DeclarativeReconciler does not handle {kind:?}; McpServer has its own reconciler"
        );
        Self { kind, store }
    }

    fn operations_of(&self, spec: &serde_json::Value) -> Vec<String> {
        match self.kind {
            EntityKind::ServiceClass => spec
                .get("operations")
                .and_then(|v| v.as_array())
                .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                .unwrap_or_default(),
            EntityKind::Workflow => spec
                .get("steps")
                .and_then(|v| v.as_array())
                .map(|a| (0..a.len()).map(|i| format!("step-{i}")).collect())
                .unwrap_or_default(),
            EntityKind::Capability => spec
                .get("provides")
                .and_then(|v| v.as_array())
                .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                .unwrap_or_default(),
            EntityKind::McpServer => Vec::new(),
        }
    }
}

#[async_trait]
impl Reconciler for DeclarativeReconciler {
    fn kind(&self) -> EntityKind {
        self.kind
    }

    async fn reconcile(&self, key: &EntityKey) -> Outcome {
        let entity = match self.store.get(self.kind, &key.namespace, &key.name).await {
            Ok(entity) => entity,
            Err(Error::NotFound(_)) => return Outcome::Done,
            Err(e) => return Outcome::Error(e),
        };

        let valid = entity.spec.get("description").is_some() || self.kind == EntityKind::ServiceClass;
        let operations = self.operations_of(&entity.spec);

        let status = json!({ "valid": valid, "availableOperations": operations });
        if let Err(e) = self.store.update_status(self.kind, &key.namespace, &key.name, status).await {
            return Outcome::Error(e);
        }
        Outcome::Done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoredEntity;
    use std::sync::Mutex;

    struct FakeStore {
        entities: Mutex<std::collections::HashMap<String, serde_json::Value>>,
        statuses: Mutex<std::collections::HashMap<String, serde_json::Value>>,
    }

    #[async_trait]
    impl Store for FakeStore {
        async fn list(&self, kind: EntityKind) -> crate::error::Result<Vec<StoredEntity>> {
            Ok(self
                .entities
                .lock()
                .unwrap()
                .iter()
                .map(|(name, spec)| StoredEntity {
                    key: EntityKey { kind, namespace: "default".into(), name: name.clone() },
                    spec: spec.clone(),
                    status: serde_json::Value::Null,
                })
                .collect())
        }
        async fn get(&self, kind: EntityKind, _namespace: &str, name: &str) -> crate::error::Result<StoredEntity> {
            self.entities
                .lock()
                .unwrap()
                .get(name)
                .map(|spec| StoredEntity {
                    key: EntityKey { kind, namespace: "default".into(), name: name.to_string() },
                    spec: spec.clone(),
                    status: serde_json::Value::Null,
                })
                .ok_or_else(|| Error::NotFound(name.to_string()))
        }
        async fn watch(&self, _kind: EntityKind) -> crate::error::Result<crate::store::StoreSubscription> {
            let (_tx, rx) = tokio::sync::broadcast::channel(1);
            Ok(crate::store::StoreSubscription::new(rx))
        }
        async fn update_status(&self, _kind: EntityKind, _namespace: &str, name: &str, status: serde_json::Value) -> crate::error::Result<()> {
            self.statuses.lock().unwrap().insert(name.to_string(), status);
            Ok(())
        }
    }

    #[tokio::test]
    async fn declarative_reconciler_publishes_operations_for_workflow() {
        let mut entities = std::collections::HashMap::new();
        entities.insert(
            "deploy".to_string(),
            json!({"description": "deploys things", "steps": [{"a": 1}, {"b": 2}]}),
        );
        let store: Arc<dyn Store> = Arc::new(FakeStore { entities: Mutex::new(entities), statuses: Mutex::new(Default::default()) });
        let reconciler = DeclarativeReconciler::new(EntityKind::Workflow, store.clone());

        let key = EntityKey { kind: EntityKind::Workflow, namespace: "default".into(), name: "deploy".into() };
        match reconciler.reconcile(&key).await {
            Outcome::Done => {}
            _ => panic!("expected Done"),
        }
    }

    #[tokio::test]
    async fn declarative_reconciler_is_done_when_entity_deleted() {
        let store: Arc<dyn Store> = Arc::new(FakeStore { entities: Mutex::new(Default::default()), statuses: Mutex::new(Default::default()) });
        let reconciler = DeclarativeReconciler::new(EntityKind::Capability, store);
        let key = EntityKey { kind: EntityKind::Capability, namespace: "default".into(), name: "gone".into() };
        match reconciler.reconcile(&key).await {
            Outcome::Done => {}
            _ => panic!("expected Done for a deleted entity"),
        }
    }
}
