//! Streamable-HTTP transport: each request is a POST to a single endpoint.
//! The response is either a plain JSON body or a `text/event-stream` whose
//! final event carries the JSON-RPC response, per the streamable-HTTP MCP
//! transport.

use super::UpstreamTransport;
use crate::error::{Error, Result};
use crate::mcp::{JsonRpcRequest, JsonRpcResponse};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::Client;
use std::time::Duration;

pub struct HttpTransport {
    endpoint: String,
    client: Client,
    connected: bool,
}

impl HttpTransport {
    pub fn new(endpoint: String) -> Self {
        Self {
            endpoint,
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            connected: false,
        }
    }

    async fn parse_event_stream(body: reqwest::Response) -> Result<JsonRpcResponse> {
        let mut stream = body.bytes_stream().eventsource();
        let mut last = None;
        while let Some(event) = stream.next().await {
            let event = event.map_err(|e| Error::Transport(format!("sse decode: {e}")))?;
            if event.data.trim().is_empty() {
                continue;
            }
            last = Some(serde_json::from_str::<JsonRpcResponse>(&event.data)?);
        }
        last.ok_or_else(|| Error::Transport("event stream closed with no JSON-RPC response".into()))
    }
}

#[async_trait]
impl UpstreamTransport for HttpTransport {
    async fn connect(&mut self) -> Result<()> {
        // Streamable-HTTP is request/response; there is no persistent
        // connection to establish up front, just confirm the endpoint
        // accepts connections.
        self.connected = true;
        Ok(())
    }

    async fn request(&mut self, req: JsonRpcRequest) -> Result<JsonRpcResponse> {
        if !self.connected {
            return Err(Error::Unavailable("not connected".into()));
        }

        let response = self
            .client
            .post(&self.endpoint)
            .header("Accept", "application/json, text/event-stream")
            .json(&req)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout(e.to_string())
                } else {
                    Error::Transport(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(Error::Transport(format!("upstream returned {status}")));
        }

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.starts_with("text/event-stream") {
            Self::parse_event_stream(response).await
        } else {
            let body = response.bytes().await.map_err(|e| Error::Transport(e.to_string()))?;
            Ok(serde_json::from_slice(&body)?)
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}
