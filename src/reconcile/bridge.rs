//! Bridges Orchestrator state changes back into reconcile requests, so a
//! restart or health-driven transition the Orchestrator makes on its own
//! (not in response to a spec change) still gets its status written back
//! to the store promptly instead of waiting for the next resync.

use super::engine::Engine;
use crate::orchestrator::Orchestrator;
use crate::registry::RegistryEvent;
use crate::store::{EntityKey, EntityKind};
use std::sync::Arc;
use tracing::warn;

pub struct StateChangeBridge {
    orchestrator: Arc<Orchestrator>,
    engine: Arc<Engine>,
}

impl StateChangeBridge {
    pub fn new(orchestrator: Arc<Orchestrator>, engine: Arc<Engine>) -> Self {
        Self { orchestrator, engine }
    }

    pub async fn run(self, cancel: tokio_util::sync::CancellationToken) {
        let mut sub = self.orchestrator.subscribe_state_changes();
        loop {
            tokio::select! {
                event = sub.recv() => {
                    match event {
                        RegistryEvent::StateChanged(name, _) | RegistryEvent::Added(name) | RegistryEvent::Removed(name) => {
                            self.engine
                                .enqueue(EntityKey { kind: EntityKind::McpServer, namespace: "default".to_string(), name })
                                .await;
                        }
                        RegistryEvent::Lagged => {
                            warn!("state change bridge lagged, relying on next periodic resync");
                        }
                    }
                }
                _ = cancel.cancelled() => return,
            }
        }
    }
}
