//! Client-side transports the Upstream MCP Client drives: one connection
//! to one upstream server over stdio (child process), streamable-HTTP, or
//! SSE. Serving an endpoint (the Aggregator's job) is a different concern
//! and lives in `aggregator`, built directly on `axum`.

pub mod http;
pub mod sse;
pub mod stdio;

use crate::error::Result;
use crate::mcp::{JsonRpcRequest, JsonRpcResponse};
use async_trait::async_trait;

/// One request/response round-trip to a connected upstream, plus an
/// orderly/forced close. Reconnection policy lives in `upstream`, not
/// here — a transport just reports failure.
#[async_trait]
pub trait UpstreamTransport: Send + Sync {
    async fn connect(&mut self) -> Result<()>;
    async fn request(&mut self, req: JsonRpcRequest) -> Result<JsonRpcResponse>;
    async fn close(&mut self) -> Result<()>;
    fn is_connected(&self) -> bool;
}

#[derive(Debug, Clone)]
pub enum TransportKind {
    Stdio { command: String, args: Vec<String> },
    StreamableHttp { endpoint: String },
    Sse { endpoint: String },
}

pub fn build(kind: &TransportKind) -> Box<dyn UpstreamTransport> {
    match kind {
        TransportKind::Stdio { command, args } => {
            Box::new(stdio::StdioTransport::new(command.clone(), args.clone()))
        }
        TransportKind::StreamableHttp { endpoint } => {
            Box::new(http::HttpTransport::new(endpoint.clone()))
        }
        TransportKind::Sse { endpoint } => Box::new(sse::SseTransport::new(endpoint.clone())),
    }
}
