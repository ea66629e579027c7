//! Muster: a control plane that aggregates MCP servers behind one
//! federated endpoint, supervises their lifecycles, and reconciles
//! declarative service state the way a small Kubernetes-style controller
//! would — backed either by CRDs or by plain YAML files on disk.

pub mod aggregator;
pub mod config;
pub mod error;
pub mod logging;
pub mod mcp;
pub mod operator;
pub mod orchestrator;
pub mod reconcile;
pub mod registry;
pub mod state_machine;
pub mod store;
pub mod transport;
pub mod upstream;

pub use error::{Error, Result};
