//! Custom resource type definitions the CRD store backend watches.
//! These are observed, not provisioned — Muster does not create
//! Deployments/Pods for them, it only reads desired state and writes
//! status back onto the same object via the status subresource.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Serialize, Deserialize, Debug, Clone, JsonSchema)]
#[kube(
    group = "muster.dev",
    version = "v1",
    kind = "MCPServer",
    namespaced,
    status = "EntityStatus",
    shortname = "mcpsrv"
)]
#[serde(rename_all = "camelCase")]
pub struct MCPServerSpec {
    pub transport: String,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default = "default_restart_policy")]
    pub restart_policy: String,
    #[serde(default)]
    pub max_restart_attempts: Option<u32>,
}

fn default_restart_policy() -> String {
    "on-failure".to_string()
}

#[derive(CustomResource, Serialize, Deserialize, Debug, Clone, JsonSchema)]
#[kube(
    group = "muster.dev",
    version = "v1",
    kind = "ServiceClass",
    namespaced,
    status = "EntityStatus",
    shortname = "svcclass"
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceClassSpec {
    pub description: String,
    #[serde(default)]
    pub operations: Vec<String>,
}

#[derive(CustomResource, Serialize, Deserialize, Debug, Clone, JsonSchema)]
#[kube(
    group = "muster.dev",
    version = "v1",
    kind = "Workflow",
    namespaced,
    status = "EntityStatus",
    shortname = "wf"
)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSpec {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub steps: Vec<serde_json::Value>,
}

#[derive(CustomResource, Serialize, Deserialize, Debug, Clone, JsonSchema)]
#[kube(
    group = "muster.dev",
    version = "v1",
    kind = "Capability",
    namespaced,
    status = "EntityStatus",
    shortname = "cap"
)]
#[serde(rename_all = "camelCase")]
pub struct CapabilitySpec {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub provides: Vec<String>,
}

/// Common status shape across all four kinds, matching the external
/// interfaces section's CRD schema (`state`, `lastError`, `restartCount`,
/// `observedToolCount`) plus `valid`/`availableOperations` for the
/// declarative (non-instance) kinds.
#[derive(Serialize, Deserialize, Debug, Clone, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EntityStatus {
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub restart_count: u32,
    #[serde(default)]
    pub observed_tool_count: u32,
    #[serde(default)]
    pub valid: Option<bool>,
    #[serde(default)]
    pub available_operations: Vec<String>,
}
