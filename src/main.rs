//! Muster binary entry point: load config, stand up the Store backend,
//! bring the Orchestrator's auto-start wave online, start reconciling
//! against the Store, and serve the Aggregator until told to stop.

use clap::Parser;
use muster::aggregator::Aggregator;
use muster::config::{ConfigLoader, StoreKind};
use muster::logging::{self, LogConfig};
use muster::orchestrator::runtime::McpRuntimeFactory;
use muster::orchestrator::Orchestrator;
use muster::reconcile;
use muster::registry::Registry;
use muster::store::{crd::CrdStore, fs::FsStore, EntityKind, Store};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "muster", about = "Aggregates MCP servers behind one endpoint and reconciles declarative service state")]
struct Cli {
    /// Path to config.yaml; falls back to ./config.yaml, then defaults.
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match ConfigLoader::new().load_from_file(cli.config.as_deref()).build() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let log_config: LogConfig = (&config.logging).into();
    let _guard = match logging::init(&log_config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("failed to initialize logging: {e}");
            return ExitCode::FAILURE;
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fatal error during startup");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: muster::config::MusterConfig) -> muster::Result<()> {
    let store: Arc<dyn Store> = match config.store.kind {
        StoreKind::Filesystem => {
            let root = config.store.path.clone().unwrap_or_else(|| "./muster-state".into());
            let fs_store = FsStore::new(root).await?;
            for kind in EntityKind::all() {
                fs_store.spawn_watch(kind)?;
            }
            Arc::new(fs_store)
        }
        StoreKind::Crd => {
            let client = kube::Client::try_default().await?;
            let namespace = config.store.namespace.clone().unwrap_or_else(|| "default".to_string());
            let crd_store = CrdStore::new(client, namespace);
            for kind in EntityKind::all() {
                crd_store.spawn_watch(kind);
            }
            Arc::new(crd_store)
        }
    };

    let registry = Arc::new(Registry::new());
    let aggregator = Aggregator::new(registry.clone(), config.aggregator.clone(), store.clone());
    let factory = Arc::new(McpRuntimeFactory::new(aggregator.clone()));
    let orchestrator = Arc::new(Orchestrator::new(registry.clone(), factory, config.health.clone()));

    let cancel = CancellationToken::new();

    let engine = reconcile::build(config.reconciliation.clone(), store.clone(), orchestrator.clone());
    reconcile::spawn_store_watches(store.clone(), engine.clone(), cancel.clone());
    let bridge = reconcile::StateChangeBridge::new(orchestrator.clone(), engine.clone());
    tokio::spawn(bridge.run(cancel.clone()));
    let engine_handle = tokio::spawn(engine.run(cancel.clone()));

    let discovery = aggregator.clone();
    tokio::spawn(discovery.run_discovery_refresh());

    orchestrator.start(cancel.clone()).await?;

    info!("muster control plane ready, serving aggregator on {}", aggregator.bind_address());

    let serve_cancel = cancel.clone();
    let serve_aggregator = aggregator.clone();
    let serve_handle = tokio::spawn(async move { serve_aggregator.serve(serve_cancel).await });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        }
        _ = cancel.cancelled() => {}
    }

    cancel.cancel();
    orchestrator.stop().await?;
    let _ = serve_handle.await;
    let _ = engine_handle.await;

    Ok(())
}
