//! Component E: the single MCP endpoint that federates every upstream
//! server currently Running behind one namespace, plus the meta-tools
//! that let a client discover what's federated without another hop.

mod pattern;

use crate::config::AggregatorConfig;
use crate::error::{Error, Result};
use crate::mcp::{
    AggregatedPrompt, AggregatedResource, AggregatedTool, JsonRpcError, JsonRpcRequest, JsonRpcResponse, McpError,
};
use crate::registry::{Registry, RegistryEvent, ServiceKind, ServiceState};
use crate::store::{EntityKind, Store};
use crate::upstream::UpstreamClient;
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock as StdRwLock};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

const CORE_TOOLS: [&str; 4] = ["describe_tool", "filter_tools", "list_workflows", "list_core_tools"];

#[derive(Default)]
struct RoutingTable {
    tools: HashMap<String, AggregatedTool>,
    resources: HashMap<String, AggregatedResource>,
    prompts: HashMap<String, AggregatedPrompt>,
}

impl RoutingTable {
    fn clone_shallow(&self) -> Self {
        Self {
            tools: self.tools.clone(),
            resources: self.resources.clone(),
            prompts: self.prompts.clone(),
        }
    }
}

/// `localhost:8090` by default, streamable-HTTP transport. Routing state
/// is a copy-on-write snapshot so every request sees one consistent view
/// regardless of discovery refreshes happening concurrently.
pub struct Aggregator {
    registry: Arc<Registry>,
    config: AggregatorConfig,
    store: Arc<dyn Store>,
    clients: StdRwLock<HashMap<String, Arc<UpstreamClient>>>,
    routing: StdRwLock<Arc<RoutingTable>>,
}

impl Aggregator {
    pub fn new(registry: Arc<Registry>, config: AggregatorConfig, store: Arc<dyn Store>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            config,
            store,
            clients: StdRwLock::new(HashMap::new()),
            routing: StdRwLock::new(Arc::new(RoutingTable::default())),
        })
    }

    /// Associates an upstream server name with the client that reaches it,
    /// called by the `ServiceRuntime` that owns the connection once it
    /// exists. Discovery refresh looks the client up by this name.
    pub fn register_client(&self, server: &str, client: Arc<UpstreamClient>) {
        self.clients.write().expect("clients lock poisoned").insert(server.to_string(), client);
    }

    pub fn deregister_client(&self, server: &str) {
        self.clients.write().expect("clients lock poisoned").remove(server);
    }

    fn routing_snapshot(&self) -> Arc<RoutingTable> {
        self.routing.read().expect("routing lock poisoned").clone()
    }

    fn prefixed(&self, server: &str, name: &str) -> String {
        format!("{}_{}_{}", self.config.prefix, server, name)
    }

    /// Subscribes to Registry state changes and keeps the routing table in
    /// sync: Running adds a server's tools/resources/prompts atomically,
    /// leaving Running removes them atomically. Runs until the registry's
    /// broadcast channel closes.
    pub async fn run_discovery_refresh(self: Arc<Self>) {
        let mut sub = self.registry.subscribe();
        for instance in self.registry.list_by_kind(ServiceKind::McpServer) {
            if instance.state == ServiceState::Running {
                self.add_server(&instance.name).await;
            }
        }
        loop {
            match sub.recv().await {
                RegistryEvent::StateChanged(name, ServiceState::Running) => self.add_server(&name).await,
                RegistryEvent::StateChanged(name, state) if state != ServiceState::Running => {
                    self.remove_server(&name)
                }
                RegistryEvent::Removed(name) => self.remove_server(&name),
                RegistryEvent::Lagged => self.resync().await,
                _ => {}
            }
        }
    }

    async fn resync(&self) {
        let running: Vec<String> = self
            .registry
            .list_by_kind(ServiceKind::McpServer)
            .into_iter()
            .filter(|i| i.state == ServiceState::Running)
            .map(|i| i.name.clone())
            .collect();
        for name in &running {
            self.add_server(name).await;
        }
        let stale: Vec<String> = {
            let table = self.routing_snapshot();
            table
                .tools
                .values()
                .map(|t| t.upstream_server.clone())
                .filter(|s| !running.contains(s))
                .collect()
        };
        for name in stale {
            self.remove_server(&name);
        }
    }

    async fn add_server(&self, server: &str) {
        let client = { self.clients.read().expect("clients lock poisoned").get(server).cloned() };
        let Some(client) = client else {
            warn!(server, "no upstream client registered for running server");
            return;
        };

        let (tools, resources, prompts) = tokio::join!(
            client.list_tools(),
            client.list_resources(),
            client.list_prompts(),
        );

        let mut next = (*self.routing_snapshot()).clone_shallow();
        if let Ok(tools) = tools {
            for tool in tools {
                insert_tool(&mut next, &self.config.prefix, server, tool);
            }
        }
        if let Ok(resources) = resources {
            for resource in resources {
                let prefixed = self.prefixed(server, &resource.name);
                next.resources.insert(
                    prefixed.clone(),
                    AggregatedResource {
                        prefixed_uri: prefixed,
                        upstream_server: server.to_string(),
                        original_uri: resource.uri,
                        name: resource.name,
                        description: resource.description,
                        mime_type: resource.mime_type,
                    },
                );
            }
        }
        if let Ok(prompts) = prompts {
            for prompt in prompts {
                let prefixed = self.prefixed(server, &prompt.name);
                next.prompts.insert(
                    prefixed.clone(),
                    AggregatedPrompt {
                        prefixed_name: prefixed,
                        upstream_server: server.to_string(),
                        original_name: prompt.name,
                        description: prompt.description,
                        arguments: prompt.arguments,
                    },
                );
            }
        }

        *self.routing.write().expect("routing lock poisoned") = Arc::new(next);
        info!(server, "discovery refreshed");
    }

    fn remove_server(&self, server: &str) {
        let current = self.routing_snapshot();
        let mut next = current.clone_shallow();
        next.tools.retain(|_, t| t.upstream_server != server);
        next.resources.retain(|_, r| r.upstream_server != server);
        next.prompts.retain(|_, p| p.upstream_server != server);
        *self.routing.write().expect("routing lock poisoned") = Arc::new(next);
        info!(server, "discovery removed");
    }

    pub async fn list_tools(&self) -> Vec<Value> {
        let table = self.routing_snapshot();
        let mut out: Vec<Value> = CORE_TOOLS
            .iter()
            .map(|name| json!({"name": name, "description": core_tool_description(name), "inputSchema": core_tool_schema(name)}))
            .collect();
        out.extend(table.tools.values().map(|t| json!({
            "name": t.prefixed_name,
            "description": t.description,
            "inputSchema": t.schema,
        })));
        out
    }

    async fn dispatch_tool_call(&self, name: &str, arguments: Option<serde_json::Map<String, Value>>) -> std::result::Result<Value, McpError> {
        if CORE_TOOLS.contains(&name) {
            return self.call_meta_tool(name, arguments).await.map_err(McpError::from);
        }

        let (server, original, client) = {
            let table = self.routing_snapshot();
            let tool = table.tools.get(name).ok_or_else(|| McpError::ToolNotFound(name.to_string()))?.clone();
            let client = self.clients.read().expect("clients lock poisoned").get(&tool.upstream_server).cloned();
            (tool.upstream_server, tool.original_name, client)
        };

        let instance = self.registry.get(&server).map_err(|_| McpError::ToolNotFound(server.clone()))?;
        if instance.state != ServiceState::Running {
            return Err(McpError::Unavailable(format!("{server} is not Running")));
        }
        let client = client.ok_or_else(|| McpError::Unavailable(format!("{server} has no connected client")))?;
        client.call_tool(&original, arguments).await.map_err(McpError::from)
    }

    async fn call_meta_tool(&self, name: &str, arguments: Option<serde_json::Map<String, Value>>) -> Result<Value> {
        let args = arguments.unwrap_or_default();
        match name {
            "describe_tool" => {
                let tool_name = args.get("name").and_then(Value::as_str).ok_or_else(|| {
                    Error::Validation("describe_tool requires a \"name\" argument".to_string())
                })?;
                let table = self.routing_snapshot();
                let tool = table.tools.get(tool_name).ok_or_else(|| Error::NotFound(tool_name.to_string()))?;
                Ok(json!({
                    "name": tool.prefixed_name,
                    "description": tool.description,
                    "inputSchema": tool.schema,
                }))
            }
            "filter_tools" => {
                let pattern = args.get("pattern").and_then(Value::as_str).unwrap_or("");
                let description_filter = args.get("descriptionFilter").and_then(Value::as_str);
                let case_sensitive = args.get("caseSensitive").and_then(Value::as_bool).unwrap_or(false);
                let include_schema = args.get("includeSchema").and_then(Value::as_bool).unwrap_or(false);

                let table = self.routing_snapshot();
                let matches: Vec<Value> = table
                    .tools
                    .values()
                    .filter(|t| pattern.is_empty() || pattern::matches(pattern, &t.prefixed_name, case_sensitive))
                    .filter(|t| {
                        description_filter
                            .map(|d| pattern::matches(d, &t.description, case_sensitive))
                            .unwrap_or(true)
                    })
                    .map(|t| {
                        let mut entry = json!({
                            "name": t.prefixed_name,
                            "upstreamServer": t.upstream_server,
                            "description": t.description,
                        });
                        if include_schema {
                            entry["schema"] = t.schema.clone();
                        }
                        entry
                    })
                    .collect();
                Ok(json!({ "tools": matches }))
            }
            "list_workflows" => {
                let entities = self.store.list(EntityKind::Workflow).await?;
                let workflows: Vec<Value> = entities
                    .into_iter()
                    .map(|e| {
                        let description = e.spec.get("description").and_then(Value::as_str).unwrap_or("");
                        let steps = e.spec.get("steps").and_then(Value::as_array).map(|s| s.len()).unwrap_or(0);
                        json!({ "name": e.key.name, "description": description, "steps": steps })
                    })
                    .collect();
                Ok(json!({ "workflows": workflows }))
            }
            "list_core_tools" => Ok(json!({ "tools": CORE_TOOLS })),
            other => Err(Error::NotFound(other.to_string())),
        }
    }

    pub async fn read_resource(&self, uri: &str) -> std::result::Result<Value, McpError> {
        let (server, original, client) = {
            let table = self.routing_snapshot();
            let resource = table.resources.get(uri).ok_or_else(|| McpError::ResourceNotFound(uri.to_string()))?.clone();
            let client = self.clients.read().expect("clients lock poisoned").get(&resource.upstream_server).cloned();
            (resource.upstream_server, resource.original_uri, client)
        };
        let instance = self.registry.get(&server).map_err(|_| McpError::ResourceNotFound(server.clone()))?;
        if instance.state != ServiceState::Running {
            return Err(McpError::Unavailable(format!("{server} is not Running")));
        }
        let client = client.ok_or_else(|| McpError::Unavailable(format!("{server} has no connected client")))?;
        client.read_resource(&original).await.map_err(McpError::from)
    }

    pub async fn get_prompt(&self, name: &str, arguments: Option<serde_json::Map<String, Value>>) -> std::result::Result<Value, McpError> {
        let (server, original, client) = {
            let table = self.routing_snapshot();
            let prompt = table.prompts.get(name).ok_or_else(|| McpError::PromptNotFound(name.to_string()))?.clone();
            let client = self.clients.read().expect("clients lock poisoned").get(&prompt.upstream_server).cloned();
            (prompt.upstream_server, prompt.original_name, client)
        };
        let instance = self.registry.get(&server).map_err(|_| McpError::PromptNotFound(server.clone()))?;
        if instance.state != ServiceState::Running {
            return Err(McpError::Unavailable(format!("{server} is not Running")));
        }
        let client = client.ok_or_else(|| McpError::Unavailable(format!("{server} has no connected client")))?;
        client.get_prompt(&original, arguments).await.map_err(McpError::from)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.config.host, self.config.port)
    }

    pub async fn serve(self: Arc<Self>, cancel: tokio_util::sync::CancellationToken) -> Result<()> {
        let addr = self.bind_address();
        let app = router(self.clone());
        let listener = TcpListener::bind(&addr).await?;
        info!(%addr, "aggregator listening");
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await?;
        Ok(())
    }
}

/// Inserts one upstream tool under its prefixed name, rejecting a
/// collision with an entry owned by a different server — the earlier
/// registration stays authoritative.
fn insert_tool(table: &mut RoutingTable, prefix: &str, server: &str, tool: crate::mcp::Tool) {
    let prefixed = format!("{prefix}_{server}_{}", tool.name);
    if let Some(existing) = table.tools.get(&prefixed) {
        if existing.upstream_server != server {
            warn!(name = %prefixed, "duplicate tool name rejected, earlier registration stands");
            return;
        }
    }
    table.tools.insert(
        prefixed.clone(),
        AggregatedTool {
            prefixed_name: prefixed,
            upstream_server: server.to_string(),
            original_name: tool.name,
            description: tool.description,
            schema: tool.input_schema,
        },
    );
}

fn core_tool_description(name: &str) -> &'static str {
    match name {
        "describe_tool" => "Return the schema and description for one federated tool by name.",
        "filter_tools" => "List federated tools whose name and/or description match a pattern.",
        "list_workflows" => "List declarative ServiceClass/Workflow definitions known to the registry.",
        "list_core_tools" => "List the names of the meta-tools this endpoint synthesizes itself.",
        _ => "",
    }
}

fn core_tool_schema(name: &str) -> Value {
    match name {
        "describe_tool" => json!({"type": "object", "properties": {"name": {"type": "string"}}, "required": ["name"]}),
        "filter_tools" => json!({
            "type": "object",
            "properties": {
                "pattern": {"type": "string"},
                "descriptionFilter": {"type": "string"},
                "caseSensitive": {"type": "boolean"},
                "includeSchema": {"type": "boolean"},
            },
        }),
        _ => json!({"type": "object", "properties": {}}),
    }
}

fn router(aggregator: Arc<Aggregator>) -> Router {
    Router::new()
        .route("/", post(handle_json_rpc))
        .route("/mcp", post(handle_json_rpc))
        .layer(CorsLayer::permissive())
        .with_state(aggregator)
}

async fn handle_json_rpc(State(aggregator): State<Arc<Aggregator>>, Json(request): Json<JsonRpcRequest>) -> Json<JsonRpcResponse> {
    let id = request.id.clone();
    match process(&aggregator, request).await {
        Ok(result) => Json(JsonRpcResponse::success(id, result)),
        Err(err) => Json(JsonRpcResponse::failure(id, JsonRpcError::from(err))),
    }
}

async fn process(aggregator: &Aggregator, request: JsonRpcRequest) -> std::result::Result<Value, McpError> {
    match request.method.as_str() {
        "tools/list" => Ok(json!({ "tools": aggregator.list_tools().await })),
        "tools/call" => {
            let params: crate::mcp::ToolCallParams =
                serde_json::from_value(request.params.unwrap_or_default()).map_err(McpError::from)?;
            aggregator
                .dispatch_tool_call(&params.name, params.arguments.map(|m| m.into_iter().collect()))
                .await
        }
        "resources/read" => {
            let params: crate::mcp::ResourceReadParams =
                serde_json::from_value(request.params.unwrap_or_default()).map_err(McpError::from)?;
            aggregator.read_resource(&params.uri).await
        }
        "prompts/get" => {
            let params: crate::mcp::PromptGetParams =
                serde_json::from_value(request.params.unwrap_or_default()).map_err(McpError::from)?;
            aggregator
                .get_prompt(&params.name, params.arguments.map(|m| m.into_iter().collect()))
                .await
        }
        other => Err(McpError::MethodNotFound(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{EntityKey, StoreSubscription, StoredEntity};

    struct FakeStore {
        workflows: Vec<StoredEntity>,
    }

    #[async_trait::async_trait]
    impl Store for FakeStore {
        async fn list(&self, kind: EntityKind) -> Result<Vec<StoredEntity>> {
            Ok(match kind {
                EntityKind::Workflow => self.workflows.clone(),
                _ => Vec::new(),
            })
        }
        async fn get(&self, _kind: EntityKind, _namespace: &str, name: &str) -> Result<StoredEntity> {
            Err(Error::NotFound(name.to_string()))
        }
        async fn watch(&self, _kind: EntityKind) -> Result<StoreSubscription> {
            let (_tx, rx) = tokio::sync::broadcast::channel(1);
            Ok(StoreSubscription::new(rx))
        }
        async fn update_status(&self, _kind: EntityKind, _namespace: &str, _name: &str, _status: Value) -> Result<()> {
            Ok(())
        }
    }

    fn empty_store() -> Arc<dyn Store> {
        Arc::new(FakeStore { workflows: Vec::new() })
    }

    #[tokio::test]
    async fn list_core_tools_is_fixed() {
        let registry = Arc::new(Registry::new());
        let aggregator = Aggregator::new(registry, AggregatorConfig::default(), empty_store());
        let result = aggregator.call_meta_tool("list_core_tools", None).await.unwrap();
        assert_eq!(result["tools"].as_array().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn list_workflows_reads_definitions_from_the_store() {
        let registry = Arc::new(Registry::new());
        let store: Arc<dyn Store> = Arc::new(FakeStore {
            workflows: vec![StoredEntity {
                key: EntityKey { kind: EntityKind::Workflow, namespace: "default".into(), name: "deploy".into() },
                spec: json!({ "description": "deploys the thing", "steps": [{}, {}] }),
                status: Value::Null,
            }],
        });
        let aggregator = Aggregator::new(registry, AggregatorConfig::default(), store);
        let result = aggregator.call_meta_tool("list_workflows", None).await.unwrap();
        let workflows = result["workflows"].as_array().unwrap();
        assert_eq!(workflows.len(), 1);
        assert_eq!(workflows[0]["name"], "deploy");
        assert_eq!(workflows[0]["steps"], 2);
    }

    #[test]
    fn collision_keeps_earlier_registration() {
        let mut table = RoutingTable::default();
        table.tools.insert(
            "x_a_read".to_string(),
            AggregatedTool {
                prefixed_name: "x_a_read".to_string(),
                upstream_server: "a".to_string(),
                original_name: "read".to_string(),
                description: "first".to_string(),
                schema: json!({}),
            },
        );

        insert_tool(
            &mut table,
            "x",
            "b",
            crate::mcp::Tool { name: "a_read".to_string(), description: "second".to_string(), input_schema: json!({}) },
        );

        assert_eq!(table.tools.get("x_a_read").unwrap().upstream_server, "a");
    }

    #[test]
    fn second_server_registers_under_its_own_prefixed_name() {
        let mut table = RoutingTable::default();
        insert_tool(&mut table, "x", "a", crate::mcp::Tool { name: "read".to_string(), description: "a's read".to_string(), input_schema: json!({}) });
        insert_tool(&mut table, "x", "b", crate::mcp::Tool { name: "read".to_string(), description: "b's read".to_string(), input_schema: json!({}) });

        assert_eq!(table.tools.len(), 2);
        assert_eq!(table.tools.get("x_a_read").unwrap().upstream_server, "a");
        assert_eq!(table.tools.get("x_b_read").unwrap().upstream_server, "b");
    }
}
