//! MCP-facing error type and its mapping onto JSON-RPC error codes.

use crate::mcp::JsonRpcError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum McpError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    #[error("prompt not found: {0}")]
    PromptNotFound(String),

    #[error("duplicate name: {0}")]
    DuplicateName(String),

    #[error("upstream unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Maps a kind-classified crate error onto the nearest MCP-facing error,
/// carrying the upstream's own message when there is one.
impl From<crate::error::Error> for McpError {
    fn from(err: crate::error::Error) -> Self {
        match err {
            crate::error::Error::NotFound(msg) => McpError::ToolNotFound(msg),
            crate::error::Error::Unavailable(msg) => McpError::Unavailable(msg),
            other => McpError::Internal(other.to_string()),
        }
    }
}

impl From<McpError> for JsonRpcError {
    fn from(err: McpError) -> Self {
        let code = match &err {
            McpError::InvalidRequest(_) => -32600,
            McpError::MethodNotFound(_) => -32601,
            McpError::InvalidParams(_) => -32602,
            McpError::Serialization(_) => -32700,
            McpError::ToolNotFound(_)
            | McpError::ResourceNotFound(_)
            | McpError::PromptNotFound(_)
            | McpError::DuplicateName(_)
            | McpError::Unavailable(_)
            | McpError::Internal(_) => -32000,
        };
        JsonRpcError {
            code,
            message: err.to_string(),
            data: None,
        }
    }
}
