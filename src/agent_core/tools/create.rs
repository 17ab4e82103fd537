//! Entity creation (tasks, documents, boards). Rollback deletes the entity.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{
    details_of, display_name, failed_result, metadata_target, new_rollback_id, require_object,
    require_str, ExecutionLog, ExecutionRecord, Tool, ToolContext,
};
use crate::agent_core::errors::AgentError;
use crate::agent_core::types::{ToolPreview, ToolResult, ToolStatus};
use crate::core_client::types::entity_id;
use crate::core_client::{CoreService, CoreServiceError, EntityKind};

/// Field that names a new entity of `kind`.
pub(crate) fn label_field(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Board => "name",
        EntityKind::Task | EntityKind::Document => "title",
    }
}

pub struct EntityCreateTool {
    action_type: String,
    kind: EntityKind,
    core: Arc<dyn CoreService>,
    log: ExecutionLog,
}

impl EntityCreateTool {
    pub fn new(action_type: &str, kind: EntityKind, core: Arc<dyn CoreService>) -> Self {
        Self {
            action_type: action_type.to_string(),
            kind,
            core,
            log: ExecutionLog::new(),
        }
    }
}

#[async_trait]
impl Tool for EntityCreateTool {
    fn action_type(&self) -> &str {
        &self.action_type
    }

    fn reversible(&self) -> bool {
        true
    }

    fn validate_params(&self, params: &Value) -> Result<(), AgentError> {
        require_object(&self.action_type, params)?;
        require_str(&self.action_type, params, label_field(self.kind))?;
        if let Some(tags) = params.get("tags") {
            if !tags.is_array() {
                return Err(AgentError::invalid_params(
                    &self.action_type,
                    "field 'tags' must be an array",
                ));
            }
        }
        Ok(())
    }

    fn preview(&self, params: &Value) -> Result<ToolPreview, AgentError> {
        self.validate_params(params)?;
        let mut risks = Vec::new();
        if self.kind == EntityKind::Task && params.get("assignee_id").is_some() {
            risks.push("assignee will be notified".to_string());
        }
        Ok(ToolPreview {
            action: self.action_type.clone(),
            summary: format!("Create {} '{}'", self.kind, display_name(params)),
            details: details_of(params),
            estimated_impact: format!("1 new {}", self.kind),
            risks,
            reversible: true,
            estimated_time_ms: 300,
        })
    }

    async fn execute(&self, ctx: &ToolContext, params: &Value) -> Result<ToolResult, AgentError> {
        self.validate_params(params)?;
        let start = Instant::now();

        let created = match self.core.create(self.kind, &ctx.workspace_id, params).await {
            Ok(created) => created,
            Err(e) => {
                let err = AgentError::from(e);
                self.log
                    .append(params, &failed_result(&err, start.elapsed().as_millis() as u64));
                return Err(err);
            }
        };
        let id = entity_id(&created).ok_or_else(|| CoreServiceError::Decode {
            reason: format!("created {} has no id", self.kind),
        })?;

        let rollback_id = new_rollback_id();
        let result = ToolResult {
            status: ToolStatus::Success,
            data: created,
            error: None,
            rollback_id: Some(rollback_id.clone()),
            rollback_metadata: json!({"kind": self.kind, "id": id}),
            execution_time_ms: start.elapsed().as_millis() as u64,
        };
        self.log.append(params, &result);

        tracing::info!(
            action = %self.action_type,
            workspace_id = %ctx.workspace_id,
            entity_id = %id,
            rollback_id = %rollback_id,
            "entity created"
        );
        Ok(result)
    }

    async fn rollback(&self, rollback_id: &str) -> Result<bool, AgentError> {
        let metadata = self.log.claim_rollback(rollback_id)?;
        let (kind, id) = match metadata_target(rollback_id, &metadata) {
            Ok(target) => target,
            Err(e) => {
                self.log.release_rollback(rollback_id);
                return Err(e);
            }
        };

        match self.core.delete(kind, &id).await {
            Ok(()) | Err(CoreServiceError::NotFound { .. }) => {
                tracing::info!(action = %self.action_type, entity_id = %id, "creation rolled back");
                Ok(true)
            }
            Err(e) => {
                self.log.release_rollback(rollback_id);
                Err(e.into())
            }
        }
    }

    fn history(&self) -> Vec<ExecutionRecord> {
        self.log.records()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_client::InMemoryCoreService;

    fn setup(kind: EntityKind, action: &str) -> (Arc<InMemoryCoreService>, EntityCreateTool) {
        let core = Arc::new(InMemoryCoreService::new());
        let tool = EntityCreateTool::new(action, kind, core.clone());
        (core, tool)
    }

    #[test]
    fn test_validate_requires_label_field() {
        let (_, tool) = setup(EntityKind::Board, "board_create");
        let err = tool
            .validate_params(&json!({"title": "wrong field"}))
            .unwrap_err();
        assert!(err.to_string().contains("name"));
        assert!(tool.validate_params(&json!({"name": "Roadmap"})).is_ok());
    }

    #[test]
    fn test_preview_is_side_effect_free() {
        let (core, tool) = setup(EntityKind::Task, "task_create");
        let params = json!({"title": "Write report", "assignee_id": "u2"});
        let first = tool.preview(&params).unwrap();
        let second = tool.preview(&params).unwrap();
        assert_eq!(first.summary, second.summary);
        assert_eq!(first.summary, "Create task 'Write report'");
        assert_eq!(first.risks.len(), 1);
        assert!(core.calls().is_empty());
        assert!(tool.history().is_empty());
    }

    #[tokio::test]
    async fn test_execute_then_rollback() {
        let (core, tool) = setup(EntityKind::Task, "task_create");
        let ctx = ToolContext::new("ws-1", "u1");
        let result = tool
            .execute(&ctx, &json!({"title": "Write report"}))
            .await
            .unwrap();
        assert_eq!(result.status, ToolStatus::Success);
        assert_eq!(core.count(EntityKind::Task), 1);

        let rollback_id = result.rollback_id.unwrap();
        assert!(tool.rollback(&rollback_id).await.unwrap());
        assert_eq!(core.count(EntityKind::Task), 0);

        let again = tool.rollback(&rollback_id).await.unwrap_err();
        assert!(matches!(again, AgentError::UnknownRollbackId { .. }));
    }

    #[tokio::test]
    async fn test_failed_execute_is_logged_without_rollback_id() {
        let (core, tool) = setup(EntityKind::Document, "document_create");
        core.reject_title("Bad");
        let ctx = ToolContext::new("ws-1", "u1");
        let err = tool.execute(&ctx, &json!({"title": "Bad"})).await.unwrap_err();
        assert!(!err.is_retryable());

        let history = tool.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].result.status, ToolStatus::Failed);
        assert!(history[0].result.rollback_id.is_none());
    }
}
