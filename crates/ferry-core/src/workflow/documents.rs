//! Document kinds, factory links, and the collaborating document types the
//! migration workflow reads and writes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{ErrorInfo, TaskStage};
use crate::error::FerryError;

// Document kinds.
pub const MIGRATION_KIND: &str = "ferry/migration";
pub const COPY_STATE_TRIGGER_KIND: &str = "ferry/copy-state-trigger";
pub const COPY_STATE_TASK_KIND: &str = "ferry/copy-state-task";
pub const HOST_KIND: &str = "ferry/host";
pub const DEPLOYMENT_KIND: &str = "ferry/deployment";

// Factory links.
pub const MIGRATION_FACTORY_LINK: &str = "/ferry/migrations";
pub const COPY_STATE_TASK_FACTORY_LINK: &str = "/ferry/copy-state-tasks";
pub const BULK_PROVISION_FACTORY_LINK: &str = "/ferry/bulk-provision-workflows";
pub const UPGRADE_AGENT_TASK_FACTORY_LINK: &str = "/ferry/upgrade-agent-tasks";
pub const MIGRATION_STATUS_TRIGGER_FACTORY_LINK: &str = "/ferry/migration-status-triggers";
pub const DEPLOYMENT_FACTORY_LINK: &str = "/ferry/deployments";

pub const USAGE_TAG_CLOUD: &str = "CLOUD";

/// Task state of a child task, as read back from its document body. Children
/// carry no sub-stage the parent cares about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildTaskState {
    pub stage: TaskStage,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<ErrorInfo>,
}

impl Default for ChildTaskState {
    fn default() -> Self {
        Self {
            stage: TaskStage::Created,
            failure: None,
        }
    }
}

/// Execution state of a recurring copy-state trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionState {
    Running,
    Stopped,
}

/// Start state for a copy-state child task: copy every document of one entity
/// kind from the source factory to the destination factory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyStateTaskState {
    #[serde(default)]
    pub task_state: ChildTaskState,

    pub source_base_uris: Vec<String>,
    pub source_factory_link: String,
    pub destination_uri: String,
    pub destination_factory_link: String,

    /// Only documents updated at or after this epoch-millisecond mark are
    /// copied.
    #[serde(default)]
    pub query_documents_changed_since_epoch_ms: u64,

    #[serde(default)]
    pub perform_host_transformation: bool,

    /// Highest source document update time this task observed; feeds the next
    /// incremental copy's change mark.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_document_update_time_epoch_ms: Option<u64>,
}

/// Lifecycle state of a host document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HostLifecycleState {
    Ready,
    Suspended,
    Error,
}

/// The slice of a deployment document the migration reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentState {
    #[serde(default)]
    pub oauth_enabled: bool,
}

/// Start state for the bulk agent reinstall child workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkProvisionStartState {
    pub deployment_link: String,
    pub usage_tag: String,
    pub host_state: HostLifecycleState,
    pub create_cert: bool,

    #[serde(default)]
    pub task_state: ChildTaskState,
}

/// Start state for a per-host agent upgrade child task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpgradeAgentStartState {
    pub host_link: String,

    #[serde(default)]
    pub task_state: ChildTaskState,
}

/// Membership view of the source cluster's node group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeGroupState {
    pub nodes: HashMap<String, NodeState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeState {
    /// Full reference to the node's group service,
    /// e.g. `http://host:19000/core/node-groups/default`.
    pub group_reference: String,
}

/// Reduce a node's group reference to its base URI (scheme, host, port).
pub fn extract_base_uri(reference: &str) -> Result<String, FerryError> {
    let (scheme, rest) = reference.split_once("://").ok_or_else(|| {
        FerryError::Validation(format!("node reference has no scheme: {reference}"))
    })?;
    let authority = rest.split('/').next().unwrap_or(rest);
    if authority.is_empty() {
        return Err(FerryError::Validation(format!(
            "node reference has no authority: {reference}"
        )));
    }
    Ok(format!("{scheme}://{authority}"))
}

/// Read a child's task state out of a raw document body.
pub fn extract_child_task_state(body: &Value) -> Result<ChildTaskState, FerryError> {
    let state = body
        .get("task_state")
        .ok_or_else(|| FerryError::Validation("child document has no task_state".to_string()))?;
    serde_json::from_value(state.clone())
        .map_err(|e| FerryError::Validation(format!("unparseable child task state: {e}")))
}

/// Read a document's self-link out of a raw body.
pub fn extract_self_link(body: &Value) -> Result<String, FerryError> {
    body.get("document_self_link")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| FerryError::Validation("document has no self-link".to_string()))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn base_uri_drops_path_and_keeps_port() {
        let uri = extract_base_uri("http://10.0.0.1:19000/core/node-groups/default").unwrap();
        assert_eq!(uri, "http://10.0.0.1:19000");

        let uri = extract_base_uri("https://source.example.com:443").unwrap();
        assert_eq!(uri, "https://source.example.com:443");
    }

    #[test]
    fn base_uri_rejects_schemeless_references() {
        let err = extract_base_uri("10.0.0.1:19000/core").unwrap_err();
        assert!(matches!(err, FerryError::Validation(_)));
    }

    #[test]
    fn child_task_state_parses_from_a_body() {
        let body = json!({
            "task_state": { "stage": "FAILED", "failure": { "message": "copy interrupted" } }
        });
        let state = extract_child_task_state(&body).unwrap();
        assert_eq!(state.stage, TaskStage::Failed);
        assert_eq!(state.failure.unwrap().message, "copy interrupted");
    }

    #[test]
    fn execution_state_uses_wire_names() {
        assert_eq!(
            serde_json::to_string(&ExecutionState::Stopped).unwrap(),
            "\"STOPPED\""
        );
        assert_eq!(
            serde_json::to_string(&HostLifecycleState::Ready).unwrap(),
            "\"READY\""
        );
    }
}
