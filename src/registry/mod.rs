//! Component A: the in-memory index of service instances and their
//! dependency graph.
//!
//! Mutations serialize through a single async mutex; reads are lock-free
//! snapshots of an `Arc<RegistrySnapshot>` swapped atomically by each
//! mutation, per the copy-on-write policy in the concurrency model — a
//! writer swaps a pointer, readers see either the old or the new snapshot,
//! never a torn state.

use crate::error::{Error, Result};
use crate::mcp::Tool;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, RwLock as StdRwLock};
use tokio::sync::{broadcast, Mutex as AsyncMutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceKind {
    McpServer,
    ServiceClassInstance,
    Aggregator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    Never,
    OnFailure,
    Always,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckSpec {
    pub command: Option<String>,
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub failure_threshold: u32,
}

/// The declarative description of something the orchestrator can run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub name: String,
    pub kind: ServiceKind,
    pub spec: serde_json::Value,
    pub dependencies: Vec<String>,
    pub auto_start: bool,
    pub restart_policy: RestartPolicy,
    /// Caps `restartCount` for `on-failure`; `None` means unbounded until
    /// the process is stopped. Ignored for `always`.
    pub max_restart_attempts: Option<u32>,
    pub health_check: Option<HealthCheckSpec>,
}

/// States from the Service State Machine's transition table (§4.B).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceState {
    Pending,
    Starting,
    Running,
    Unhealthy,
    Failed,
    Blocked,
    Stopping,
    Stopped,
    Removing,
    Removed,
    Terminal,
}

impl ServiceState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ServiceState::Terminal | ServiceState::Removed)
    }

    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            ServiceState::Running
                | ServiceState::Blocked
                | ServiceState::Failed
                | ServiceState::Terminal
                | ServiceState::Removed
        )
    }
}

/// The runtime counterpart of a ServiceDefinition, owned exclusively by the
/// Registry and mutated only via the State Machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub name: String,
    pub kind: ServiceKind,
    pub definition_hash: String,
    /// The definition's declarative body, kept for introspection (e.g. the
    /// Aggregator's `list_workflows`) — not interpreted by the Registry.
    pub spec: serde_json::Value,
    pub dependencies: Vec<String>,
    pub auto_start: bool,
    pub restart_policy: RestartPolicy,
    pub state: ServiceState,
    pub last_error: Option<String>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub restart_count: u32,
    pub health_failure_count: u32,
    pub exposed_tools: Vec<Tool>,
}

impl ServiceInstance {
    pub fn pending(def: &ServiceDefinition, definition_hash: String) -> Self {
        Self {
            name: def.name.clone(),
            kind: def.kind,
            definition_hash,
            spec: def.spec.clone(),
            dependencies: def.dependencies.clone(),
            auto_start: def.auto_start,
            restart_policy: def.restart_policy,
            state: ServiceState::Pending,
            last_error: None,
            started_at: None,
            restart_count: 0,
            health_failure_count: 0,
            exposed_tools: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Added(String),
    Removed(String),
    StateChanged(String, ServiceState),
    /// Delivered to a subscriber that fell behind; the registry snapshot is
    /// still authoritative and should be re-read in full.
    Lagged,
}

#[derive(Debug, Default)]
struct RegistrySnapshot {
    instances: HashMap<String, Arc<ServiceInstance>>,
    forward: HashMap<String, BTreeSet<String>>,
    reverse: HashMap<String, BTreeSet<String>>,
}

pub struct Registry {
    snapshot: StdRwLock<Arc<RegistrySnapshot>>,
    mutate: AsyncMutex<()>,
    events: broadcast::Sender<RegistryEvent>,
}

impl Registry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            snapshot: StdRwLock::new(Arc::new(RegistrySnapshot::default())),
            mutate: AsyncMutex::new(()),
            events,
        }
    }

    fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.snapshot.read().expect("registry snapshot lock poisoned").clone()
    }

    pub async fn register(&self, instance: ServiceInstance) -> Result<()> {
        let _guard = self.mutate.lock().await;
        let current = self.snapshot();
        if current.instances.contains_key(&instance.name) {
            return Err(Error::AlreadyExists(instance.name));
        }

        let mut next = (*current).clone_shallow();
        let name = instance.name.clone();
        let deps: BTreeSet<String> = instance.dependencies.iter().cloned().collect();
        for dep in &deps {
            next.reverse.entry(dep.clone()).or_default().insert(name.clone());
        }
        next.forward.insert(name.clone(), deps);
        next.instances.insert(name.clone(), Arc::new(instance));

        self.swap(next);
        let _ = self.events.send(RegistryEvent::Added(name));
        Ok(())
    }

    pub async fn deregister(&self, name: &str) -> Result<()> {
        let _guard = self.mutate.lock().await;
        let current = self.snapshot();
        if !current.instances.contains_key(name) {
            return Err(Error::NotFound(name.to_string()));
        }
        if let Some(dependents) = current.reverse.get(name) {
            let running: Vec<&String> = dependents
                .iter()
                .filter(|d| {
                    current
                        .instances
                        .get(*d)
                        .map(|i| matches!(i.state, ServiceState::Running | ServiceState::Starting))
                        .unwrap_or(false)
                })
                .collect();
            if !running.is_empty() {
                return Err(Error::HasDependents(name.to_string()));
            }
        }

        let mut next = (*current).clone_shallow();
        if let Some(deps) = next.forward.remove(name) {
            for dep in deps {
                if let Some(set) = next.reverse.get_mut(&dep) {
                    set.remove(name);
                }
            }
        }
        next.reverse.remove(name);
        next.instances.remove(name);

        self.swap(next);
        let _ = self.events.send(RegistryEvent::Removed(name.to_string()));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<ServiceInstance>> {
        self.snapshot()
            .instances
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    pub fn list_by_kind(&self, kind: ServiceKind) -> Vec<Arc<ServiceInstance>> {
        self.snapshot()
            .instances
            .values()
            .filter(|i| i.kind == kind)
            .cloned()
            .collect()
    }

    pub fn list_all(&self) -> Vec<Arc<ServiceInstance>> {
        self.snapshot().instances.values().cloned().collect()
    }

    /// Dependents of `name` (reverse adjacency), used by the state machine
    /// to know who to notify and by `deregister` to enforce `HasDependents`.
    pub fn dependents_of(&self, name: &str) -> Vec<String> {
        self.snapshot()
            .reverse
            .get(name)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn update_state(
        &self,
        name: &str,
        mutator: impl FnOnce(&mut ServiceInstance),
    ) -> Result<ServiceState> {
        let _guard = self.mutate.lock().await;
        let current = self.snapshot();
        let existing = current
            .instances
            .get(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;

        let mut updated = (**existing).clone();
        mutator(&mut updated);
        let new_state = updated.state;

        let mut next = (*current).clone_shallow();
        next.instances.insert(name.to_string(), Arc::new(updated));
        self.swap(next);

        let _ = self.events.send(RegistryEvent::StateChanged(name.to_string(), new_state));
        Ok(new_state)
    }

    fn swap(&self, next: RegistrySnapshot) {
        let mut guard = self.snapshot.write().expect("registry snapshot lock poisoned");
        *guard = Arc::new(next);
    }

    /// Topological order over `names` with dependencies expanded
    /// transitively, or `CycleDetected` naming the cycle members.
    pub fn resolve_start_order(&self, names: &[String]) -> Result<Vec<String>> {
        let snapshot = self.snapshot();

        let mut closure: BTreeSet<String> = BTreeSet::new();
        let mut frontier: VecDeque<String> = names.iter().cloned().collect();
        while let Some(n) = frontier.pop_front() {
            if !closure.insert(n.clone()) {
                continue;
            }
            if let Some(deps) = snapshot.forward.get(&n) {
                for dep in deps {
                    if !closure.contains(dep) {
                        frontier.push_back(dep.clone());
                    }
                }
            }
        }

        let mut indegree: HashMap<String, usize> = closure.iter().map(|n| (n.clone(), 0)).collect();
        for n in &closure {
            if let Some(deps) = snapshot.forward.get(n) {
                for dep in deps {
                    if closure.contains(dep) {
                        *indegree.get_mut(n).unwrap() += 1;
                    }
                }
            }
        }

        let mut ready: VecDeque<String> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| n.clone())
            .collect();
        let mut ready_sorted: Vec<String> = ready.drain(..).collect();
        ready_sorted.sort();
        let mut queue: VecDeque<String> = ready_sorted.into();

        let mut order = Vec::with_capacity(closure.len());
        let mut remaining = indegree.clone();
        while let Some(n) = queue.pop_front() {
            order.push(n.clone());
            let dependents: Vec<&String> = closure
                .iter()
                .filter(|m| {
                    snapshot
                        .forward
                        .get(*m)
                        .map(|d| d.contains(&n))
                        .unwrap_or(false)
                })
                .collect();
            let mut newly_ready = Vec::new();
            for dep in dependents {
                let e = remaining.get_mut(dep).unwrap();
                *e -= 1;
                if *e == 0 {
                    newly_ready.push(dep.clone());
                }
            }
            newly_ready.sort();
            for r in newly_ready {
                queue.push_back(r);
            }
        }

        if order.len() != closure.len() {
            let cycle: Vec<String> = closure
                .into_iter()
                .filter(|n| !order.contains(n))
                .collect();
            return Err(Error::CycleDetected(cycle));
        }

        Ok(order)
    }

    /// Groups a topological order into waves (maximal antichains): a wave
    /// is every name whose dependencies are all in a prior wave.
    pub fn waves(&self, order: &[String]) -> Vec<Vec<String>> {
        let snapshot = self.snapshot();
        let mut placed: HashMap<String, usize> = HashMap::new();
        let mut waves: Vec<Vec<String>> = Vec::new();

        for name in order {
            let deps = snapshot.forward.get(name).cloned().unwrap_or_default();
            let wave_index = deps
                .iter()
                .filter_map(|d| placed.get(d))
                .max()
                .map(|w| w + 1)
                .unwrap_or(0);
            if waves.len() <= wave_index {
                waves.resize_with(wave_index + 1, Vec::new);
            }
            waves[wave_index].push(name.clone());
            placed.insert(name.clone(), wave_index);
        }

        for wave in &mut waves {
            wave.sort();
        }
        waves
    }

    pub fn subscribe(&self) -> RegistrySubscription {
        RegistrySubscription {
            inner: self.events.subscribe(),
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistrySnapshot {
    fn clone_shallow(&self) -> Self {
        Self {
            instances: self.instances.clone(),
            forward: self.forward.clone(),
            reverse: self.reverse.clone(),
        }
    }
}

/// Wraps a `broadcast::Receiver`, turning a `RecvError::Lagged` into an
/// explicit `RegistryEvent::Lagged` instead of an error the caller has to
/// special-case.
pub struct RegistrySubscription {
    inner: broadcast::Receiver<RegistryEvent>,
}

impl RegistrySubscription {
    pub async fn recv(&mut self) -> RegistryEvent {
        loop {
            match self.inner.recv().await {
                Ok(event) => return event,
                Err(broadcast::error::RecvError::Lagged(_)) => return RegistryEvent::Lagged,
                Err(broadcast::error::RecvError::Closed) => return RegistryEvent::Lagged,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(name: &str, deps: &[&str]) -> ServiceDefinition {
        ServiceDefinition {
            name: name.to_string(),
            kind: ServiceKind::McpServer,
            spec: serde_json::json!({}),
            dependencies: deps.iter().map(|s| s.to_string()).collect(),
            auto_start: true,
            restart_policy: RestartPolicy::OnFailure,
            max_restart_attempts: None,
            health_check: None,
        }
    }

    #[tokio::test]
    async fn dependency_ordering_respects_wave_structure() {
        let registry = Registry::new();
        registry.register(ServiceInstance::pending(&def("a", &[]), "h".into())).await.unwrap();
        registry.register(ServiceInstance::pending(&def("b", &["a"]), "h".into())).await.unwrap();
        registry.register(ServiceInstance::pending(&def("c", &["a", "b"]), "h".into())).await.unwrap();

        let order = registry
            .resolve_start_order(&["a".to_string(), "b".to_string(), "c".to_string()])
            .unwrap();
        let pos = |n: &str| order.iter().position(|x| x == n).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("b") < pos("c"));

        let waves = registry.waves(&order);
        assert_eq!(waves, vec![vec!["a".to_string()], vec!["b".to_string()], vec!["c".to_string()]]);
    }

    #[tokio::test]
    async fn cycle_is_detected_and_named() {
        let registry = Registry::new();
        registry.register(ServiceInstance::pending(&def("a", &["b"]), "h".into())).await.unwrap();
        registry.register(ServiceInstance::pending(&def("b", &["a"]), "h".into())).await.unwrap();

        let err = registry
            .resolve_start_order(&["a".to_string(), "b".to_string()])
            .unwrap_err();
        match err {
            Error::CycleDetected(mut members) => {
                members.sort();
                assert_eq!(members, vec!["a".to_string(), "b".to_string()]);
            }
            other => panic!("expected CycleDetected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn deregister_fails_with_running_dependents() {
        let registry = Registry::new();
        registry.register(ServiceInstance::pending(&def("a", &[]), "h".into())).await.unwrap();
        registry.register(ServiceInstance::pending(&def("b", &["a"]), "h".into())).await.unwrap();
        registry
            .update_state("b", |i| i.state = ServiceState::Running)
            .await
            .unwrap();

        let err = registry.deregister("a").await.unwrap_err();
        assert!(matches!(err, Error::HasDependents(_)));
    }

    #[tokio::test]
    async fn add_then_remove_yields_empty_registry() {
        let registry = Registry::new();
        registry.register(ServiceInstance::pending(&def("a", &[]), "h".into())).await.unwrap();
        registry.deregister("a").await.unwrap();
        assert!(registry.list_all().is_empty());
    }
}
