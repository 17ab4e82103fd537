//! Entity deletion. Irreversible, so rollback stays unsupported.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use super::{failed_result, require_object, require_str, ExecutionLog, ExecutionRecord, Tool, ToolContext};
use crate::agent_core::errors::AgentError;
use crate::agent_core::types::{ToolPreview, ToolResult, ToolStatus};
use crate::core_client::{CoreService, EntityKind};

pub struct EntityDeleteTool {
    action_type: String,
    kind: EntityKind,
    core: Arc<dyn CoreService>,
    log: ExecutionLog,
}

impl EntityDeleteTool {
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
impl Tool for EntityDeleteTool {
    fn action_type(&self) -> &str {
        &self.action_type
    }

    fn validate_params(&self, params: &Value) -> Result<(), AgentError> {
        require_object(&self.action_type, params)?;
        require_str(&self.action_type, params, self.kind.id_param())?;
        Ok(())
    }

    fn preview(&self, params: &Value) -> Result<ToolPreview, AgentError> {
        self.validate_params(params)?;
        let id = require_str(&self.action_type, params, self.kind.id_param())?;
        let mut details = Map::new();
        details.insert(self.kind.id_param().into(), json!(id));
        let mut risks = vec![format!("{} {} is permanently removed", self.kind, id)];
        if self.kind == EntityKind::Board {
            risks.push("tasks on the board lose their column".to_string());
        }
        Ok(ToolPreview {
            action: self.action_type.clone(),
            summary: format!("Delete {} {}", self.kind, id),
            details,
            estimated_impact: format!("1 {} removed", self.kind),
            risks,
            reversible: false,
            estimated_time_ms: 300,
        })
    }

    async fn execute(&self, _ctx: &ToolContext, params: &Value) -> Result<ToolResult, AgentError> {
        self.validate_params(params)?;
        let id = require_str(&self.action_type, params, self.kind.id_param())?;
        let start = Instant::now();

        if let Err(e) = self.core.delete(self.kind, id).await {
            let err = AgentError::from(e);
            self.log
                .append(params, &failed_result(&err, start.elapsed().as_millis() as u64));
            return Err(err);
        }

        let result = ToolResult {
            status: ToolStatus::Success,
            data: json!({"deleted": id}),
            error: None,
            rollback_id: None,
            rollback_metadata: Value::Null,
            execution_time_ms: start.elapsed().as_millis() as u64,
        };
        self.log.append(params, &result);
        tracing::info!(action = %self.action_type, entity_id = %id, "entity deleted");
        Ok(result)
    }

    fn history(&self) -> Vec<ExecutionRecord> {
        self.log.records()
    }
}
