//! Component C: process-wide supervision of all ServiceInstances.
//!
//! The supervision table (name -> running state machine task) is owned by
//! a single task-confined structure behind an async mutex — the only
//! writer is whichever caller is currently inside `start`/`stop`/`create`/
//! `update`/`delete`, matching the "single task owns mutable state, others
//! mutate via channel/await" policy from the concurrency model.

pub mod runtime;

use crate::config::HealthConfig;
use crate::error::{Error, Result};
use crate::registry::{
    Registry, RegistryEvent, RegistrySubscription, ServiceDefinition, ServiceInstance, ServiceState,
};
use crate::state_machine::{self, Command, ServiceRuntime, StateMachineConfig, StateMachineHandle};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub fn definition_hash(spec: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(spec.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Constructs the kind-specific `ServiceRuntime` for a definition. Kept as
/// an injected collaborator (rather than a match buried in the
/// orchestrator) so tests can supply fakes.
#[async_trait::async_trait]
pub trait RuntimeFactory: Send + Sync {
    async fn build(&self, def: &ServiceDefinition) -> Result<Arc<dyn ServiceRuntime>>;
}

struct Supervised {
    handle: StateMachineHandle,
    definition: ServiceDefinition,
}

pub struct Orchestrator {
    registry: Arc<Registry>,
    factory: Arc<dyn RuntimeFactory>,
    health: HealthConfig,
    supervised: Mutex<HashMap<String, Supervised>>,
}

impl Orchestrator {
    pub fn new(registry: Arc<Registry>, factory: Arc<dyn RuntimeFactory>, health: HealthConfig) -> Self {
        Self {
            registry,
            factory,
            health,
            supervised: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    /// Computes the topological order over all `autoStart` instances and
    /// starts them wave by wave, waiting at each wave's barrier for every
    /// member to reach `Running` or a settled terminal state before
    /// admitting the next wave. Returns early into reverse-order shutdown
    /// if `cancel` fires.
    pub async fn start(&self, cancel: CancellationToken) -> Result<()> {
        let all = self.registry.list_all();
        let auto_start: Vec<String> = all
            .iter()
            .filter(|i| i.auto_start)
            .map(|i| i.name.clone())
            .collect();

        let order = self.registry.resolve_start_order(&auto_start)?;
        let waves = self.registry.waves(&order);

        for wave in waves {
            if cancel.is_cancelled() {
                break;
            }
            for name in &wave {
                self.ensure_supervised(name).await?;
            }
            self.await_wave_settled(&wave, &cancel).await;
        }

        if cancel.is_cancelled() {
            self.stop().await?;
        }
        Ok(())
    }

    async fn await_wave_settled(&self, wave: &[String], cancel: &CancellationToken) {
        let mut receivers = Vec::new();
        {
            let table = self.supervised.lock().await;
            for name in wave {
                if let Some(s) = table.get(name) {
                    receivers.push((name.clone(), s.handle.state.clone()));
                }
            }
        }

        for (name, mut rx) in receivers {
            loop {
                if cancel.is_cancelled() {
                    return;
                }
                if rx.borrow().is_settled() {
                    break;
                }
                tokio::select! {
                    _ = rx.changed() => {}
                    _ = cancel.cancelled() => return,
                }
            }
            info!(service = %name, "wave member settled");
        }
    }

    async fn ensure_supervised(&self, name: &str) -> Result<()> {
        let mut table = self.supervised.lock().await;
        if table.contains_key(name) {
            return Ok(());
        }
        // Definitions are registered via `create`/`update` before this is
        // reachable; the registry instance always exists by the time a
        // wave is computed.
        // Reached only if a ServiceInstance was registered directly against
        // the Registry without going through `create`/`update` — the
        // normal path for a reconciler-driven bring-up already populates
        // `supervised` at registration time.
        let instance = self.registry.get(name)?;
        let def = ServiceDefinition {
            name: instance.name.clone(),
            kind: instance.kind,
            spec: instance.spec.clone(),
            dependencies: instance.dependencies.clone(),
            auto_start: instance.auto_start,
            restart_policy: instance.restart_policy,
            max_restart_attempts: None,
            health_check: None,
        };
        drop(table);
        self.spawn_supervised(def).await
    }

    async fn spawn_supervised(&self, def: ServiceDefinition) -> Result<()> {
        let runtime = self.factory.build(&def).await?;
        let config = StateMachineConfig::from_health_config(&self.health);
        let handle = state_machine::spawn(
            def.name.clone(),
            self.registry.clone(),
            runtime,
            def.max_restart_attempts,
            config,
        );
        let mut table = self.supervised.lock().await;
        table.insert(def.name.clone(), Supervised { handle, definition: def });
        Ok(())
    }

    /// Reverse-topological shutdown: per instance, send stop, wait the
    /// grace period, then drop the handle (the task force-terminates on
    /// drop of its join handle's governing runtime object).
    pub async fn stop(&self) -> Result<()> {
        let names: Vec<String> = {
            let table = self.supervised.lock().await;
            table.keys().cloned().collect()
        };
        let order = self.registry.resolve_start_order(&names).unwrap_or(names);
        let waves = self.registry.waves(&order);

        for wave in waves.into_iter().rev() {
            let mut sorted = wave;
            sorted.sort();
            sorted.reverse();
            for name in sorted {
                self.stop_one(&name).await;
            }
        }
        Ok(())
    }

    async fn stop_one(&self, name: &str) {
        let table = self.supervised.lock().await;
        if let Some(s) = table.get(name) {
            let _ = s.handle.commands.send(Command::Stop).await;
            let mut rx = s.handle.state.clone();
            drop(table);
            let _ = tokio::time::timeout(Duration::from_secs(self.health.stop_grace_secs), async {
                while !matches!(*rx.borrow(), ServiceState::Stopped | ServiceState::Terminal) {
                    if rx.changed().await.is_err() {
                        break;
                    }
                }
            })
            .await;
        }
    }

    /// Single-instance create: registers the definition, starts supervised
    /// if `autoStart`. Fails with `AlreadyExists` if already registered.
    pub async fn create(&self, def: ServiceDefinition) -> Result<()> {
        let hash = definition_hash(&def.spec);
        self.registry.register(ServiceInstance::pending(&def, hash)).await?;
        if def.auto_start {
            self.spawn_supervised(def).await?;
        }
        Ok(())
    }

    /// A no-op when `definitionHash` is unchanged; otherwise a stop-then-
    /// start (rolling updates are out of scope).
    pub async fn update(&self, def: ServiceDefinition) -> Result<()> {
        let new_hash = definition_hash(&def.spec);
        let existing = self.registry.get(&def.name)?;
        if existing.definition_hash == new_hash {
            return Ok(());
        }

        self.stop_one(&def.name).await;
        self.registry
            .update_state(&def.name, |i| {
                i.definition_hash = new_hash;
                i.dependencies = def.dependencies.clone();
                i.restart_policy = def.restart_policy;
                i.state = ServiceState::Pending;
                i.restart_count = 0;
            })
            .await?;

        {
            let mut table = self.supervised.lock().await;
            if let Some(old) = table.remove(&def.name) {
                old.handle.join.abort();
            }
        }
        self.spawn_supervised(def).await
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        let table_has = self.supervised.lock().await.contains_key(name);
        if table_has {
            let cmd = {
                let table = self.supervised.lock().await;
                table.get(name).map(|s| s.handle.commands.clone())
            };
            if let Some(tx) = cmd {
                let _ = tx.send(Command::Remove).await;
            }
            // Wait briefly for the state machine to deregister itself.
            for _ in 0..50 {
                if self.registry.get(name).is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            self.supervised.lock().await.remove(name);
        } else {
            self.registry.deregister(name).await?;
        }
        Ok(())
    }

    pub fn get_status(&self, name: &str) -> Result<Arc<ServiceInstance>> {
        self.registry.get(name)
    }

    pub fn subscribe_state_changes(&self) -> RegistrySubscription {
        self.registry.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{RestartPolicy, ServiceKind};
    use async_trait::async_trait;

    struct NoopRuntime;
    #[async_trait]
    impl ServiceRuntime for NoopRuntime {
        async fn start(&self) -> Result<()> {
            Ok(())
        }
        async fn stop(&self) -> Result<()> {
            Ok(())
        }
        async fn health_check(&self) -> Result<()> {
            Ok(())
        }
    }

    struct NoopFactory;
    #[async_trait]
    impl RuntimeFactory for NoopFactory {
        async fn build(&self, _def: &ServiceDefinition) -> Result<Arc<dyn ServiceRuntime>> {
            Ok(Arc::new(NoopRuntime))
        }
    }

    fn def(name: &str, deps: &[&str]) -> ServiceDefinition {
        ServiceDefinition {
            name: name.to_string(),
            kind: ServiceKind::McpServer,
            spec: serde_json::json!({"n": name}),
            dependencies: deps.iter().map(|s| s.to_string()).collect(),
            auto_start: true,
            restart_policy: RestartPolicy::OnFailure,
            max_restart_attempts: Some(3),
            health_check: None,
        }
    }

    #[tokio::test]
    async fn start_brings_dependency_chain_to_running_in_order() {
        let registry = Arc::new(Registry::new());
        let orchestrator = Orchestrator::new(registry.clone(), Arc::new(NoopFactory), HealthConfig::default());

        orchestrator.create(def("a", &[])).await.unwrap();
        orchestrator.create(def("b", &["a"])).await.unwrap();
        orchestrator.create(def("c", &["a", "b"])).await.unwrap();

        let cancel = CancellationToken::new();
        tokio::time::timeout(Duration::from_secs(5), orchestrator.start(cancel))
            .await
            .unwrap()
            .unwrap();

        for name in ["a", "b", "c"] {
            let inst = registry.get(name).unwrap();
            assert_eq!(inst.state, ServiceState::Running, "{name} should be Running");
        }

        let a_started = registry.get("a").unwrap().started_at.unwrap();
        let c_started = registry.get("c").unwrap().started_at.unwrap();
        assert!(a_started <= c_started);
    }

    #[test]
    fn definition_hash_is_stable_for_identical_specs() {
        let h1 = definition_hash(&serde_json::json!({"a": 1}));
        let h2 = definition_hash(&serde_json::json!({"a": 1}));
        assert_eq!(h1, h2);
    }
}
