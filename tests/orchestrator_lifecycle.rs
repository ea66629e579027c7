//! Integration coverage for the Registry/Orchestrator pair across process
//! boundaries the unit tests colocated with each module don't exercise:
//! full create/start/stop round-trips and declared-but-unreachable
//! dependency cycles.

use async_trait::async_trait;
use muster::config::HealthConfig;
use muster::error::{ErrorKind, Result};
use muster::orchestrator::{Orchestrator, RuntimeFactory};
use muster::registry::{Registry, RestartPolicy, ServiceDefinition, ServiceKind, ServiceState};
use muster::state_machine::ServiceRuntime;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

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
        spec: serde_json::json!({}),
        dependencies: deps.iter().map(|s| s.to_string()).collect(),
        auto_start: true,
        restart_policy: RestartPolicy::OnFailure,
        max_restart_attempts: Some(1),
        health_check: None,
    }
}

#[tokio::test]
async fn full_start_stop_round_trip_settles_every_instance() {
    let registry = Arc::new(Registry::new());
    let orchestrator = Orchestrator::new(registry.clone(), Arc::new(NoopFactory), HealthConfig::default());

    orchestrator.create(def("db", &[])).await.unwrap();
    orchestrator.create(def("api", &["db"])).await.unwrap();

    let cancel = CancellationToken::new();
    tokio::time::timeout(Duration::from_secs(5), orchestrator.start(cancel))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(registry.get("db").unwrap().state, ServiceState::Running);
    assert_eq!(registry.get("api").unwrap().state, ServiceState::Running);

    orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn a_cycle_among_declared_dependencies_is_rejected_before_anything_starts() {
    let registry = Arc::new(Registry::new());
    let orchestrator = Orchestrator::new(registry.clone(), Arc::new(NoopFactory), HealthConfig::default());

    orchestrator.create(def("a", &["b"])).await.unwrap();
    orchestrator.create(def("b", &["a"])).await.unwrap();

    let cancel = CancellationToken::new();
    let err = orchestrator.start(cancel).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}
