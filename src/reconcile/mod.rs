//! Component F: reconciliation engine. Watches the Store for desired
//! state, drives the Orchestrator (for `McpServer`) or validates in place
//! (for the declarative kinds), and writes outcomes back onto status.

pub mod bridge;
pub mod engine;
pub mod reconcilers;

pub use bridge::StateChangeBridge;
pub use engine::{Engine, Outcome, Reconciler};
pub use reconcilers::{DeclarativeReconciler, MCPServerReconciler};

use crate::config::ReconciliationConfig;
use crate::orchestrator::Orchestrator;
use crate::store::{EntityKind, Store};
use std::sync::Arc;

/// Assembles the engine with one reconciler per entity kind, and a
/// background task per store kind that turns `StoreEvent`s into enqueues.
pub fn build(config: ReconciliationConfig, store: Arc<dyn Store>, orchestrator: Arc<Orchestrator>) -> Arc<Engine> {
    let reconcilers: Vec<Arc<dyn Reconciler>> = vec![
        Arc::new(MCPServerReconciler::new(store.clone(), orchestrator)),
        Arc::new(DeclarativeReconciler::new(EntityKind::ServiceClass, store.clone())),
        Arc::new(DeclarativeReconciler::new(EntityKind::Workflow, store.clone())),
        Arc::new(DeclarativeReconciler::new(EntityKind::Capability, store.clone())),
    ];
    Engine::new(config, store, reconcilers)
}

/// Spawns one watch-forwarding task per kind: every `StoreEvent::Changed`
/// becomes an enqueue, and a `Lagged` event forces a full resync rather
/// than trying to reconstruct what was missed.
pub fn spawn_store_watches(store: Arc<dyn Store>, engine: Arc<Engine>, cancel: tokio_util::sync::CancellationToken) {
    for kind in EntityKind::all() {
        let store = store.clone();
        let engine = engine.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut sub = match store.watch(kind).await {
                Ok(sub) => sub,
                Err(e) => {
                    tracing::warn!(kind = kind.plural(), error = %e, "failed to start store watch");
                    return;
                }
            };
            loop {
                tokio::select! {
                    event = sub.recv() => {
                        match event {
                            crate::store::StoreEvent::Changed { key, .. } => engine.enqueue(key).await,
                            crate::store::StoreEvent::Lagged => {
                                if let Ok(entities) = store.list(kind).await {
                                    for entity in entities {
                                        engine.enqueue(entity.key).await;
                                    }
                                }
                            }
                        }
                    }
                    _ = cancel.cancelled() => return,
                }
            }
        });
    }
}
