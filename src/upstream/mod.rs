//! Component D: one connection to one upstream MCP server, behind a
//! transport-agnostic interface. A connect failure during steady state
//! drops into the same reconnect-with-backoff loop the state machine uses
//! for restarts, reusing `state_machine::backoff_delay`.

use crate::error::{Error, Result};
use crate::mcp::{
    ClientInfo, InitializeParams, JsonRpcRequest, Prompt, PromptGetParams, Resource, ResourceReadParams,
    ServerCapabilities, ServerInfo, Tool, ToolCallParams,
};
use crate::state_machine::backoff_delay;
use crate::transport::{TransportKind, UpstreamTransport};
use serde_json::Value;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::warn;

const PROTOCOL_VERSION: &str = "2024-11-05";
const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5);

struct Cache<T> {
    value: Option<T>,
    fetched_at: Option<Instant>,
}

impl<T> Default for Cache<T> {
    fn default() -> Self {
        Self { value: None, fetched_at: None }
    }
}

impl<T: Clone> Cache<T> {
    fn fresh(&self, ttl: Duration) -> Option<T> {
        match (&self.value, self.fetched_at) {
            (Some(v), Some(at)) if at.elapsed() < ttl => Some(v.clone()),
            _ => None,
        }
    }

    fn store(&mut self, value: T) {
        self.value = Some(value);
        self.fetched_at = Some(Instant::now());
    }

    fn invalidate(&mut self) {
        self.fetched_at = None;
    }
}

struct Caches {
    tools: Cache<Vec<Tool>>,
    resources: Cache<Vec<Resource>>,
    prompts: Cache<Vec<Prompt>>,
}

impl Default for Caches {
    fn default() -> Self {
        Self {
            tools: Cache::default(),
            resources: Cache::default(),
            prompts: Cache::default(),
        }
    }
}

/// A uniform interface over one upstream regardless of which transport
/// carries it. Owns its own reconnect state; callers never see a raw
/// transport error, only `Unavailable` while disconnected.
pub struct UpstreamClient {
    name: String,
    kind: TransportKind,
    client_info: ClientInfo,
    cache_ttl: Duration,
    transport: Mutex<Box<dyn UpstreamTransport>>,
    server_info: Mutex<Option<(ServerInfo, ServerCapabilities)>>,
    caches: Mutex<Caches>,
    next_id: AtomicI64,
    connected: std::sync::atomic::AtomicBool,
}

impl UpstreamClient {
    pub fn new(name: String, kind: TransportKind) -> Self {
        Self {
            name,
            transport: Mutex::new(crate::transport::build(&kind)),
            kind,
            client_info: ClientInfo { name: "muster".to_string(), version: env!("CARGO_PKG_VERSION").to_string() },
            cache_ttl: DEFAULT_CACHE_TTL,
            server_info: Mutex::new(None),
            caches: Mutex::new(Caches::default()),
            next_id: AtomicI64::new(1),
            connected: std::sync::atomic::AtomicBool::new(false),
        }
    }

    fn next_id(&self) -> Value {
        Value::from(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Establishes transport and performs the MCP `initialize` handshake.
    pub async fn connect(&self) -> Result<()> {
        let mut transport = self.transport.lock().await;
        transport.connect().await?;

        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: crate::mcp::ClientCapabilities { experimental: None, sampling: None },
            client_info: self.client_info.clone(),
        };
        let req = JsonRpcRequest::new("initialize", Some(serde_json::to_value(params)?), self.next_id());
        let response = transport.request(req).await?;
        let result = response
            .result
            .ok_or_else(|| Error::ProtocolMismatch(format!("{}: initialize returned no result", self.name)))?;

        let negotiated = result.get("protocolVersion").and_then(Value::as_str).unwrap_or_default();
        if negotiated != PROTOCOL_VERSION {
            return Err(Error::ProtocolMismatch(format!(
                "{}: negotiated {negotiated}, expected {PROTOCOL_VERSION}",
                self.name
            )));
        }

        let server_info: ServerInfo = serde_json::from_value(
            result.get("serverInfo").cloned().unwrap_or(Value::Null),
        )
        .map_err(|e| Error::ProtocolMismatch(format!("{}: bad serverInfo: {e}", self.name)))?;
        let capabilities: ServerCapabilities =
            serde_json::from_value(result.get("capabilities").cloned().unwrap_or(Value::Null)).unwrap_or_default();

        *self.server_info.lock().await = Some((server_info, capabilities));
        self.connected.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Reconnects with the shared backoff schedule until it succeeds or
    /// `attempts` exhausts — called by the owning `ServiceRuntime` after a
    /// transport error during steady state, not by `UpstreamClient` itself.
    pub async fn reconnect_with_backoff(&self, max_attempts: u32) -> Result<()> {
        self.connected.store(false, Ordering::Relaxed);
        for attempt in 0..max_attempts {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(attempt)).await;
            }
            {
                let mut transport = self.transport.lock().await;
                *transport = crate::transport::build(&self.kind);
            }
            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(e) => warn!(upstream = %self.name, attempt, error = %e, "reconnect failed"),
            }
        }
        Err(Error::Unavailable(format!("{}: exhausted reconnect attempts", self.name)))
    }

    async fn call(&self, method: &str, params: Option<Value>) -> Result<Value> {
        if !self.is_connected() {
            return Err(Error::Unavailable(format!("{}: disconnected", self.name)));
        }
        let req = JsonRpcRequest::new(method, params, self.next_id());
        let mut transport = self.transport.lock().await;
        let response = transport.request(req).await.map_err(|e| {
            self.connected.store(false, Ordering::Relaxed);
            e
        })?;
        if let Some(err) = response.error {
            return Err(Error::Transport(format!("{}: {} ({})", self.name, err.message, err.code)));
        }
        response
            .result
            .ok_or_else(|| Error::ProtocolMismatch(format!("{}: {method} returned no result", self.name)))
    }

    pub async fn list_tools(&self) -> Result<Vec<Tool>> {
        if let Some(cached) = self.caches.lock().await.tools.fresh(self.cache_ttl) {
            return Ok(cached);
        }
        let result = self.call("tools/list", None).await?;
        let tools: Vec<Tool> = serde_json::from_value(result.get("tools").cloned().unwrap_or(Value::Array(vec![])))?;
        self.caches.lock().await.tools.store(tools.clone());
        Ok(tools)
    }

    pub async fn list_resources(&self) -> Result<Vec<Resource>> {
        if let Some(cached) = self.caches.lock().await.resources.fresh(self.cache_ttl) {
            return Ok(cached);
        }
        let result = self.call("resources/list", None).await?;
        let resources: Vec<Resource> =
            serde_json::from_value(result.get("resources").cloned().unwrap_or(Value::Array(vec![])))?;
        self.caches.lock().await.resources.store(resources.clone());
        Ok(resources)
    }

    pub async fn list_prompts(&self) -> Result<Vec<Prompt>> {
        if let Some(cached) = self.caches.lock().await.prompts.fresh(self.cache_ttl) {
            return Ok(cached);
        }
        let result = self.call("prompts/list", None).await?;
        let prompts: Vec<Prompt> =
            serde_json::from_value(result.get("prompts").cloned().unwrap_or(Value::Array(vec![])))?;
        self.caches.lock().await.prompts.store(prompts.clone());
        Ok(prompts)
    }

    /// Forces the next `list_*` call to refetch, for use when the
    /// transport delivers a server-sent change notification.
    pub async fn invalidate_caches(&self) {
        let mut caches = self.caches.lock().await;
        caches.tools.invalidate();
        caches.resources.invalidate();
        caches.prompts.invalidate();
    }

    pub async fn call_tool(&self, name: &str, arguments: Option<serde_json::Map<String, Value>>) -> Result<Value> {
        let params = ToolCallParams { name: name.to_string(), arguments: arguments.map(|m| m.into_iter().collect()) };
        self.call("tools/call", Some(serde_json::to_value(params)?)).await
    }

    pub async fn read_resource(&self, uri: &str) -> Result<Value> {
        let params = ResourceReadParams { uri: uri.to_string() };
        self.call("resources/read", Some(serde_json::to_value(params)?)).await
    }

    pub async fn get_prompt(&self, name: &str, arguments: Option<serde_json::Map<String, Value>>) -> Result<Value> {
        let params = PromptGetParams { name: name.to_string(), arguments: arguments.map(|m| m.into_iter().collect()) };
        self.call("prompts/get", Some(serde_json::to_value(params)?)).await
    }

    /// Orderly close, force-closed after 2s if the transport hangs.
    pub async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::Relaxed);
        let mut transport = self.transport.lock().await;
        match tokio::time::timeout(Duration::from_secs(2), transport.close()).await {
            Ok(result) => result,
            Err(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::JsonRpcResponse;
    use async_trait::async_trait;

    struct FakeTransport {
        connected: bool,
    }

    #[async_trait]
    impl UpstreamTransport for FakeTransport {
        async fn connect(&mut self) -> Result<()> {
            self.connected = true;
            Ok(())
        }

        async fn request(&mut self, req: JsonRpcRequest) -> Result<JsonRpcResponse> {
            let result = match req.method.as_str() {
                "initialize" => serde_json::json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "serverInfo": {"name": "fake", "version": "1.0"},
                    "capabilities": {},
                }),
                "tools/list" => serde_json::json!({"tools": []}),
                _ => serde_json::json!({}),
            };
            Ok(JsonRpcResponse::success(req.id, result))
        }

        async fn close(&mut self) -> Result<()> {
            self.connected = false;
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected
        }
    }

    fn fake_client() -> UpstreamClient {
        let client = UpstreamClient::new("u".to_string(), TransportKind::Stdio { command: "true".into(), args: vec![] });
        client
    }

    #[tokio::test]
    async fn list_tools_fails_fast_while_disconnected() {
        let client = fake_client();
        let err = client.list_tools().await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Transient);
    }

    #[tokio::test]
    async fn connect_negotiates_protocol_version_with_fake_transport() {
        let client = fake_client();
        *client.transport.lock().await = Box::new(FakeTransport { connected: false });
        client.connect().await.unwrap();
        assert!(client.is_connected());
        let tools = client.list_tools().await.unwrap();
        assert!(tools.is_empty());
    }
}
