//! Entity updates and task reassignment.
//!
//! Both snapshot the fields they are about to overwrite so rollback can
//! patch them back.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use super::{
    failed_result, metadata_target, new_rollback_id, require_object, require_str, ExecutionLog,
    ExecutionRecord, Tool, ToolContext,
};
use crate::agent_core::actions;
use crate::agent_core::errors::AgentError;
use crate::agent_core::types::{ToolPreview, ToolResult, ToolStatus};
use crate::core_client::{CoreService, EntityKind};

// ─── Shared Patch Logic ─────────────────────────────────────────────────────

/// Apply `patch` to an entity, capturing the previous values first.
async fn patch_with_snapshot(
    core: &dyn CoreService,
    log: &ExecutionLog,
    action: &str,
    kind: EntityKind,
    id: &str,
    patch: &Map<String, Value>,
    params: &Value,
) -> Result<ToolResult, AgentError> {
    let start = Instant::now();
    let outcome = async {
        let current = core.get(kind, id).await?;
        let previous: Map<String, Value> = patch
            .keys()
            .map(|k| (k.clone(), current.get(k).cloned().unwrap_or(Value::Null)))
            .collect();
        let updated = core.update(kind, id, &Value::Object(patch.clone())).await?;
        Ok::<_, AgentError>((previous, updated))
    }
    .await;

    let (previous, updated) = match outcome {
        Ok(pair) => pair,
        Err(e) => {
            log.append(params, &failed_result(&e, start.elapsed().as_millis() as u64));
            return Err(e);
        }
    };

    let rollback_id = new_rollback_id();
    let result = ToolResult {
        status: ToolStatus::Success,
        data: updated,
        error: None,
        rollback_id: Some(rollback_id.clone()),
        rollback_metadata: json!({"kind": kind, "id": id, "previous": previous}),
        execution_time_ms: start.elapsed().as_millis() as u64,
    };
    log.append(params, &result);

    tracing::info!(
        action = %action,
        entity_id = %id,
        fields = patch.len(),
        rollback_id = %rollback_id,
        "entity updated"
    );
    Ok(result)
}

/// Restore the snapshot recorded under `rollback_id`.
async fn restore_snapshot(
    core: &dyn CoreService,
    log: &ExecutionLog,
    action: &str,
    rollback_id: &str,
) -> Result<bool, AgentError> {
    let metadata = log.claim_rollback(rollback_id)?;
    let restored = async {
        let (kind, id) = metadata_target(rollback_id, &metadata)?;
        let previous = metadata.get("previous").cloned().unwrap_or(json!({}));
        core.update(kind, &id, &previous).await?;
        Ok::<_, AgentError>(id)
    }
    .await;

    match restored {
        Ok(id) => {
            tracing::info!(action = %action, entity_id = %id, "update rolled back");
            Ok(true)
        }
        Err(e) => {
            log.release_rollback(rollback_id);
            Err(e)
        }
    }
}

// ─── EntityUpdateTool ───────────────────────────────────────────────────────

/// Patches fields of a task, document or board.
///
/// Params: `{"<kind>_id": "...", "updates": {...}}`.
pub struct EntityUpdateTool {
    action_type: String,
    kind: EntityKind,
    core: Arc<dyn CoreService>,
    log: ExecutionLog,
}

impl EntityUpdateTool {
    pub fn new(action_type: &str, kind: EntityKind, core: Arc<dyn CoreService>) -> Self {
        Self {
            action_type: action_type.to_string(),
            kind,
            core,
            log: ExecutionLog::new(),
        }
    }

    fn updates<'a>(&self, params: &'a Value) -> Result<&'a Map<String, Value>, AgentError> {
        match params.get("updates") {
            Some(Value::Object(map)) if !map.is_empty() => Ok(map),
            Some(Value::Object(_)) => Err(AgentError::invalid_params(
                &self.action_type,
                "field 'updates' must not be empty",
            )),
            Some(_) => Err(AgentError::invalid_params(
                &self.action_type,
                "field 'updates' must be an object",
            )),
            None => Err(AgentError::invalid_params(
                &self.action_type,
                "missing required field 'updates'",
            )),
        }
    }
}

#[async_trait]
impl Tool for EntityUpdateTool {
    fn action_type(&self) -> &str {
        &self.action_type
    }

    fn reversible(&self) -> bool {
        true
    }

    fn validate_params(&self, params: &Value) -> Result<(), AgentError> {
        require_object(&self.action_type, params)?;
        require_str(&self.action_type, params, self.kind.id_param())?;
        let updates = self.updates(params)?;
        if updates.contains_key("id") {
            return Err(AgentError::invalid_params(
                &self.action_type,
                "field 'id' cannot be updated",
            ));
        }
        Ok(())
    }

    fn preview(&self, params: &Value) -> Result<ToolPreview, AgentError> {
        self.validate_params(params)?;
        let id = require_str(&self.action_type, params, self.kind.id_param())?;
        let updates = self.updates(params)?;
        let fields: Vec<&str> = updates.keys().map(String::as_str).collect();

        let mut risks = Vec::new();
        if updates.contains_key("content") {
            risks.push("existing content will be replaced".to_string());
        }
        if updates.contains_key("status") {
            risks.push("status change is visible to watchers".to_string());
        }

        Ok(ToolPreview {
            action: self.action_type.clone(),
            summary: format!("Update {} {} ({})", self.kind, id, fields.join(", ")),
            details: updates.clone(),
            estimated_impact: format!("{} field(s) on 1 {}", fields.len(), self.kind),
            risks,
            reversible: true,
            estimated_time_ms: 400,
        })
    }

    async fn execute(&self, _ctx: &ToolContext, params: &Value) -> Result<ToolResult, AgentError> {
        self.validate_params(params)?;
        let id = require_str(&self.action_type, params, self.kind.id_param())?;
        let updates = self.updates(params)?;
        patch_with_snapshot(
            self.core.as_ref(),
            &self.log,
            &self.action_type,
            self.kind,
            id,
            updates,
            params,
        )
        .await
    }

    async fn rollback(&self, rollback_id: &str) -> Result<bool, AgentError> {
        restore_snapshot(self.core.as_ref(), &self.log, &self.action_type, rollback_id).await
    }

    fn history(&self) -> Vec<ExecutionRecord> {
        self.log.records()
    }
}

// ─── TaskReassignTool ───────────────────────────────────────────────────────

/// Moves a task to another assignee. Params: `{"task_id", "assignee_id"}`.
pub struct TaskReassignTool {
    core: Arc<dyn CoreService>,
    log: ExecutionLog,
}

impl TaskReassignTool {
    pub fn new(core: Arc<dyn CoreService>) -> Self {
        Self {
            core,
            log: ExecutionLog::new(),
        }
    }
}

#[async_trait]
impl Tool for TaskReassignTool {
    fn action_type(&self) -> &str {
        actions::TASK_REASSIGN
    }

    fn reversible(&self) -> bool {
        true
    }

    fn validate_params(&self, params: &Value) -> Result<(), AgentError> {
        require_object(actions::TASK_REASSIGN, params)?;
        require_str(actions::TASK_REASSIGN, params, "task_id")?;
        require_str(actions::TASK_REASSIGN, params, "assignee_id")?;
        Ok(())
    }

    fn preview(&self, params: &Value) -> Result<ToolPreview, AgentError> {
        self.validate_params(params)?;
        let task_id = require_str(actions::TASK_REASSIGN, params, "task_id")?;
        let assignee = require_str(actions::TASK_REASSIGN, params, "assignee_id")?;
        let mut details = Map::new();
        details.insert("task_id".into(), json!(task_id));
        details.insert("assignee_id".into(), json!(assignee));
        Ok(ToolPreview {
            action: actions::TASK_REASSIGN.to_string(),
            summary: format!("Reassign task {task_id} to {assignee}"),
            details,
            estimated_impact: "ownership of 1 task changes".to_string(),
            risks: vec![
                "current assignee loses the task".to_string(),
                "new assignee will be notified".to_string(),
            ],
            reversible: true,
            estimated_time_ms: 400,
        })
    }

    async fn execute(&self, _ctx: &ToolContext, params: &Value) -> Result<ToolResult, AgentError> {
        self.validate_params(params)?;
        let task_id = require_str(actions::TASK_REASSIGN, params, "task_id")?;
        let assignee = require_str(actions::TASK_REASSIGN, params, "assignee_id")?;
        let mut patch = Map::new();
        patch.insert("assignee_id".into(), json!(assignee));
        patch_with_snapshot(
            self.core.as_ref(),
            &self.log,
            actions::TASK_REASSIGN,
            EntityKind::Task,
            task_id,
            &patch,
            params,
        )
        .await
    }

    async fn rollback(&self, rollback_id: &str) -> Result<bool, AgentError> {
        restore_snapshot(
            self.core.as_ref(),
            &self.log,
            actions::TASK_REASSIGN,
            rollback_id,
        )
        .await
    }

    fn history(&self) -> Vec<ExecutionRecord> {
        self.log.records()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
