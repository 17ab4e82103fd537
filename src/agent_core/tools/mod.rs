//! Write-capable tools.
//!
//! Each tool wraps one kind of core-service mutation behind the same four
//! operations: validate, preview, execute and rollback. Tools keep an
//! in-memory execution log that doubles as their rollback index.

pub mod bulk;
pub mod create;
pub mod delete;
pub mod update;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use super::actions::{self, Severity};
use super::errors::AgentError;
use super::retry::RetryPolicy;
use super::types::{ToolPreview, ToolResult, ToolStatus};
use crate::core_client::{CoreService, EntityKind};

pub use bulk::BulkCreateTasksTool;
pub use create::EntityCreateTool;
pub use delete::EntityDeleteTool;
pub use update::{EntityUpdateTool, TaskReassignTool};

// ─── Tool Trait ─────────────────────────────────────────────────────────────

/// Who a tool executes on behalf of.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub workspace_id: String,
    pub user_id: String,
}

impl ToolContext {
    pub fn new(workspace_id: &str, user_id: &str) -> Self {
        Self {
            workspace_id: workspace_id.to_string(),
            user_id: user_id.to_string(),
        }
    }
}

/// A write-capable operation against the core service.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Catalog name of the action this tool performs.
    fn action_type(&self) -> &str;

    fn severity(&self) -> Severity {
        actions::severity_of(self.action_type())
    }

    /// Whether successful executions can be undone.
    fn reversible(&self) -> bool {
        false
    }

    /// Check parameters without any I/O.
    fn validate_params(&self, params: &Value) -> Result<(), AgentError>;

    /// Describe what `execute` would do. Never mutates anything.
    fn preview(&self, params: &Value) -> Result<ToolPreview, AgentError>;

    /// Perform the mutation once. Transient failures surface as retryable errors.
    async fn execute(&self, ctx: &ToolContext, params: &Value) -> Result<ToolResult, AgentError>;

    /// Undo a previous execution.
    async fn rollback(&self, rollback_id: &str) -> Result<bool, AgentError> {
        let _ = rollback_id;
        Err(AgentError::RollbackUnsupported {
            action: self.action_type().to_string(),
        })
    }

    /// Executions performed by this instance, oldest first.
    fn history(&self) -> Vec<ExecutionRecord>;
}

// ─── Execution Log ──────────────────────────────────────────────────────────

/// One `execute` call as seen by the tool.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    pub params: Value,
    pub result: ToolResult,
    pub executed_at: DateTime<Utc>,
    pub rolled_back: bool,
}

/// Per-tool execution history and rollback index.
#[derive(Default)]
pub struct ExecutionLog {
    records: Mutex<Vec<ExecutionRecord>>,
}

impl ExecutionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, params: &Value, result: &ToolResult) {
        if let Ok(mut records) = self.records.lock() {
            records.push(ExecutionRecord {
                params: params.clone(),
                result: result.clone(),
                executed_at: Utc::now(),
                rolled_back: false,
            });
        }
    }

    pub fn records(&self) -> Vec<ExecutionRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Reserve a rollback id and return its metadata.
    ///
    /// Fails with `UnknownRollbackId` if the id was never issued or is
    /// already rolled back (or being rolled back).
    pub fn claim_rollback(&self, rollback_id: &str) -> Result<Value, AgentError> {
        let unknown = || AgentError::UnknownRollbackId {
            rollback_id: rollback_id.to_string(),
        };
        let mut records = self.records.lock().map_err(|_| unknown())?;
        let record = records
            .iter_mut()
            .find(|r| r.result.rollback_id.as_deref() == Some(rollback_id))
            .filter(|r| !r.rolled_back)
            .ok_or_else(unknown)?;
        record.rolled_back = true;
        Ok(record.result.rollback_metadata.clone())
    }

    /// Give a claimed rollback id back after the undo failed.
    pub fn release_rollback(&self, rollback_id: &str) {
        if let Ok(mut records) = self.records.lock() {
            if let Some(record) = records
                .iter_mut()
                .find(|r| r.result.rollback_id.as_deref() == Some(rollback_id))
            {
                record.rolled_back = false;
            }
        }
    }
}

// ─── Registry ───────────────────────────────────────────────────────────────

/// Tools keyed by the action type they perform.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every catalogued tool backed by `core`.
    pub fn with_core_tools(core: Arc<dyn CoreService>, retry: RetryPolicy) -> Self {
        use actions::*;

        let mut registry = Self::new();
        for (action, kind) in [
            (TASK_CREATE, EntityKind::Task),
            (DOCUMENT_CREATE, EntityKind::Document),
            (BOARD_CREATE, EntityKind::Board),
        ] {
            registry.register(Arc::new(EntityCreateTool::new(action, kind, core.clone())));
        }
        for (action, kind) in [
            (TASK_UPDATE, EntityKind::Task),
            (DOCUMENT_UPDATE, EntityKind::Document),
            (BOARD_UPDATE, EntityKind::Board),
        ] {
            registry.register(Arc::new(EntityUpdateTool::new(action, kind, core.clone())));
        }
        for (action, kind) in [
            (TASK_DELETE, EntityKind::Task),
            (DOCUMENT_DELETE, EntityKind::Document),
            (BOARD_DELETE, EntityKind::Board),
        ] {
            registry.register(Arc::new(EntityDeleteTool::new(action, kind, core.clone())));
        }
        registry.register(Arc::new(TaskReassignTool::new(core.clone())));
        registry.register(Arc::new(BulkCreateTasksTool::new(core, retry)));
        registry
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.action_type().to_string(), tool);
    }

    pub fn get(&self, action_type: &str) -> Result<Arc<dyn Tool>, AgentError> {
        self.tools
            .get(action_type)
            .cloned()
            .ok_or_else(|| AgentError::UnknownAction {
                action: action_type.to_string(),
            })
    }

    pub fn contains(&self, action_type: &str) -> bool {
        self.tools.contains_key(action_type)
    }

    pub fn action_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }
}

// ─── Helpers ────────────────────────────────────────────────────────────────

/// Fresh rollback id.
pub(crate) fn new_rollback_id() -> String {
    format!("rb-{}", uuid::Uuid::new_v4())
}

pub(crate) fn require_object<'a>(
    action: &str,
    params: &'a Value,
) -> Result<&'a serde_json::Map<String, Value>, AgentError> {
    params
        .as_object()
        .ok_or_else(|| AgentError::invalid_params(action, "parameters must be a JSON object"))
}

/// A required, non-blank string field.
pub(crate) fn require_str<'a>(
    action: &str,
    params: &'a Value,
    field: &str,
) -> Result<&'a str, AgentError> {
    match params.get(field) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s),
        Some(Value::String(_)) => Err(AgentError::invalid_params(
            action,
            format!("field '{field}' must not be empty"),
        )),
        Some(_) => Err(AgentError::invalid_params(
            action,
            format!("field '{field}' must be a string"),
        )),
        None => Err(AgentError::invalid_params(
            action,
            format!("missing required field '{field}'"),
        )),
    }
}

/// Title-ish label of an entity payload for previews.
pub(crate) fn display_name(params: &Value) -> &str {
    params
        .get("title")
        .or_else(|| params.get("name"))
        .and_then(|v| v.as_str())
        .unwrap_or("<untitled>")
}

pub(crate) fn details_of(params: &Value) -> serde_json::Map<String, Value> {
    params.as_object().cloned().unwrap_or_default()
}

pub(crate) fn failed_result(error: &AgentError, execution_time_ms: u64) -> ToolResult {
    ToolResult {
        status: ToolStatus::Failed,
        data: Value::Null,
        error: Some(error.to_string()),
        rollback_id: None,
        rollback_metadata: Value::Null,
        execution_time_ms,
    }
}

/// Read `kind` and `id` back out of rollback metadata.
pub(crate) fn metadata_target(
    rollback_id: &str,
    metadata: &Value,
) -> Result<(EntityKind, String), AgentError> {
    let kind = metadata
        .get("kind")
        .cloned()
        .and_then(|k| serde_json::from_value::<EntityKind>(k).ok());
    let id = metadata.get("id").and_then(|v| v.as_str());
    match (kind, id) {
        (Some(kind), Some(id)) => Ok((kind, id.to_string())),
        _ => Err(AgentError::UnknownRollbackId {
            rollback_id: rollback_id.to_string(),
        }),
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_client::InMemoryCoreService;

    fn success_with_rollback(id: &str) -> ToolResult {
        ToolResult {
            status: ToolStatus::Success,
            data: Value::Null,
            error: None,
            rollback_id: Some(id.to_string()),
            rollback_metadata: serde_json::json!({"kind": "task", "id": "task-1"}),
            execution_time_ms: 1,
        }
    }

    #[test]
    fn test_claim_rollback_once() {
        let log = ExecutionLog::new();
        log.append(&serde_json::json!({}), &success_with_rollback("rb-1"));

        let meta = log.claim_rollback("rb-1").unwrap();
        assert_eq!(meta["id"], "task-1");

        let again = log.claim_rollback("rb-1").unwrap_err();
        assert!(matches!(again, AgentError::UnknownRollbackId { .. }));

        log.release_rollback("rb-1");
        assert!(log.claim_rollback("rb-1").is_ok());
    }

    #[test]
    fn test_claim_unknown_rollback() {
        let log = ExecutionLog::new();
        let err = log.claim_rollback("rb-missing").unwrap_err();
        assert!(matches!(err, AgentError::UnknownRollbackId { .. }));
    }

    #[test]
    fn test_require_str() {
        let params = serde_json::json!({"title": "  ", "n": 3, "ok": "yes"});
        assert!(require_str("a", &params, "title").is_err());
        assert!(require_str("a", &params, "n").is_err());
        assert!(require_str("a", &params, "missing").is_err());
        assert_eq!(require_str("a", &params, "ok").unwrap(), "yes");
    }

    #[test]
    fn test_registry_has_catalogued_tools() {
        let core = Arc::new(InMemoryCoreService::new());
        let registry = ToolRegistry::with_core_tools(core, RetryPolicy::no_retry());
        for action in [
            actions::TASK_CREATE,
            actions::TASK_REASSIGN,
            actions::TASK_BULK_CREATE,
            actions::DOCUMENT_DELETE,
            actions::BOARD_UPDATE,
        ] {
            assert!(registry.contains(action), "missing {action}");
        }
        let err = registry.get("launch_rocket").err().unwrap();
        assert!(matches!(err, AgentError::UnknownAction { .. }));
    }
}
