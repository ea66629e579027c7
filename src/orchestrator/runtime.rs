//! The concrete `ServiceRuntime` for `McpServer` instances: owns the
//! upstream connection and registers/deregisters it with the Aggregator
//! as the state machine drives it through `Starting`/`Stopping`.

use crate::aggregator::Aggregator;
use crate::error::{Error, Result};
use crate::mcp::Tool;
use crate::registry::{ServiceDefinition, ServiceKind};
use crate::state_machine::ServiceRuntime;
use crate::transport::TransportKind;
use crate::upstream::UpstreamClient;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
struct McpServerSpecFields {
    transport: String,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    endpoint: Option<String>,
}

fn transport_kind(spec: &serde_json::Value) -> Result<TransportKind> {
    let fields: McpServerSpecFields = serde_json::from_value(spec.clone())
        .map_err(|e| Error::Validation(format!("invalid mcpserver spec: {e}")))?;
    match fields.transport.as_str() {
        "stdio" => {
            let command = fields
                .command
                .ok_or_else(|| Error::Validation("stdio transport requires command".to_string()))?;
            Ok(TransportKind::Stdio { command, args: fields.args })
        }
        "streamable-http" | "http" => {
            let endpoint = fields
                .endpoint
                .ok_or_else(|| Error::Validation("http transport requires endpoint".to_string()))?;
            Ok(TransportKind::StreamableHttp { endpoint })
        }
        "sse" => {
            let endpoint = fields
                .endpoint
                .ok_or_else(|| Error::Validation("sse transport requires endpoint".to_string()))?;
            Ok(TransportKind::Sse { endpoint })
        }
        other => Err(Error::Validation(format!("unknown transport kind: {other}"))),
    }
}

pub struct McpServerRuntime {
    name: String,
    client: Arc<UpstreamClient>,
    aggregator: Arc<Aggregator>,
}

#[async_trait]
impl ServiceRuntime for McpServerRuntime {
    async fn start(&self) -> Result<()> {
        self.client.connect().await?;
        self.aggregator.register_client(&self.name, self.client.clone());
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.aggregator.deregister_client(&self.name);
        self.client.close().await
    }

    async fn health_check(&self) -> Result<()> {
        if self.client.is_connected() {
            Ok(())
        } else {
            Err(Error::Unavailable(format!("{} has no live connection", self.name)))
        }
    }

    async fn exposed_tools(&self) -> Vec<Tool> {
        self.client.list_tools().await.unwrap_or_default()
    }
}

/// Builds a `McpServerRuntime` per `ServiceDefinition`; `ServiceClassInstance`
/// and `Aggregator` kinds have no supervised process of their own, so they
/// get a runtime that only tracks health trivially.
pub struct McpRuntimeFactory {
    aggregator: Arc<Aggregator>,
}

impl McpRuntimeFactory {
    pub fn new(aggregator: Arc<Aggregator>) -> Self {
        Self { aggregator }
    }
}

#[async_trait]
impl crate::orchestrator::RuntimeFactory for McpRuntimeFactory {
    async fn build(&self, def: &ServiceDefinition) -> Result<Arc<dyn ServiceRuntime>> {
        match def.kind {
            ServiceKind::McpServer => {
                let kind = transport_kind(&def.spec)?;
                let client = Arc::new(UpstreamClient::new(def.name.clone(), kind));
                Ok(Arc::new(McpServerRuntime { name: def.name.clone(), client, aggregator: self.aggregator.clone() }))
            }
            ServiceKind::ServiceClassInstance | ServiceKind::Aggregator => Ok(Arc::new(DeclarativeRuntime)),
        }
    }
}

/// A declarative entity (ServiceClass/Workflow) has no process to
/// supervise; the state machine still drives it to `Running` so the
/// Registry can report it as available.
struct DeclarativeRuntime;

#[async_trait]
impl ServiceRuntime for DeclarativeRuntime {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stdio_transport_requires_command() {
        let spec = serde_json::json!({"transport": "stdio"});
        assert!(transport_kind(&spec).is_err());
    }

    #[test]
    fn http_transport_parses_endpoint() {
        let spec = serde_json::json!({"transport": "streamable-http", "endpoint": "http://localhost:9000"});
        match transport_kind(&spec).unwrap() {
            TransportKind::StreamableHttp { endpoint } => assert_eq!(endpoint, "http://localhost:9000"),
            _ => panic!("expected streamable-http"),
        }
    }
}
