//! Bulk task creation with per-item failure tolerance.
//!
//! Items are created one at a time so a rejected item does not abort the
//! rest. Each item gets the bounded retry budget for transient failures.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use super::{
    new_rollback_id, require_object, require_str, ExecutionLog, ExecutionRecord, Tool,
    ToolContext,
};
use crate::agent_core::actions;
use crate::agent_core::errors::AgentError;
use crate::agent_core::retry::RetryPolicy;
use crate::agent_core::text::ellipsize;
use crate::agent_core::types::{ToolPreview, ToolResult, ToolStatus};
use crate::core_client::types::entity_id;
use crate::core_client::{CoreService, CoreServiceError, EntityKind};

/// Creates many tasks. Params: `{"tasks": [{"title": ..}, ..]}`.
///
/// `data.results` is index-aligned with the input items.
pub struct BulkCreateTasksTool {
    core: Arc<dyn CoreService>,
    retry: RetryPolicy,
    log: ExecutionLog,
}

impl BulkCreateTasksTool {
    pub fn new(core: Arc<dyn CoreService>, retry: RetryPolicy) -> Self {
        Self {
            core,
            retry,
            log: ExecutionLog::new(),
        }
    }

    fn tasks<'a>(&self, params: &'a Value) -> Result<&'a Vec<Value>, AgentError> {
        match params.get("tasks") {
            Some(Value::Array(items)) if !items.is_empty() => Ok(items),
            Some(Value::Array(_)) => Err(AgentError::invalid_params(
                actions::TASK_BULK_CREATE,
                "field 'tasks' must not be empty",
            )),
            _ => Err(AgentError::invalid_params(
                actions::TASK_BULK_CREATE,
                "missing required array 'tasks'",
            )),
        }
    }
}

#[async_trait]
impl Tool for BulkCreateTasksTool {
    fn action_type(&self) -> &str {
        actions::TASK_BULK_CREATE
    }

    fn reversible(&self) -> bool {
        true
    }

    fn validate_params(&self, params: &Value) -> Result<(), AgentError> {
        require_object(actions::TASK_BULK_CREATE, params)?;
        for (index, item) in self.tasks(params)?.iter().enumerate() {
            if !item.is_object() {
                return Err(AgentError::invalid_params(
                    actions::TASK_BULK_CREATE,
                    format!("tasks[{index}] must be an object"),
                ));
            }
            require_str(actions::TASK_BULK_CREATE, item, "title").map_err(|_| {
                AgentError::invalid_params(
                    actions::TASK_BULK_CREATE,
                    format!("tasks[{index}] is missing 'title'"),
                )
            })?;
        }
        Ok(())
    }

    fn preview(&self, params: &Value) -> Result<ToolPreview, AgentError> {
        self.validate_params(params)?;
        let items = self.tasks(params)?;
        let titles: Vec<&str> = items
            .iter()
            .filter_map(|t| t.get("title").and_then(|v| v.as_str()))
            .collect();
        let mut details = Map::new();
        details.insert("count".into(), json!(items.len()));
        details.insert("titles".into(), json!(titles));

        let mut risks = vec!["creates many tasks at once".to_string()];
        if items.iter().any(|t| t.get("assignee_id").is_some()) {
            risks.push("assignees will be notified".to_string());
        }

        Ok(ToolPreview {
            action: actions::TASK_BULK_CREATE.to_string(),
            summary: ellipsize(
                &format!("Create {} tasks: {}", items.len(), titles.join(", ")),
                200,
            ),
            details,
            estimated_impact: format!("{} new tasks", items.len()),
            risks,
            reversible: true,
            estimated_time_ms: 300 * items.len() as u64,
        })
    }

    async fn execute(&self, ctx: &ToolContext, params: &Value) -> Result<ToolResult, AgentError> {
        self.validate_params(params)?;
        let items = self.tasks(params)?;
        let start = Instant::now();

        let mut results = Vec::with_capacity(items.len());
        let mut created_ids = Vec::new();
        let mut failures = Vec::new();

        for (index, item) in items.iter().enumerate() {
            let outcome = self
                .retry
                .run(actions::TASK_BULK_CREATE, |_| async {
                    self.core
                        .create(EntityKind::Task, &ctx.workspace_id, item)
                        .await
                        .map_err(AgentError::from)
                })
                .await
                .and_then(|created| {
                    entity_id(&created)
                        .map(|id| (id, created))
                        .ok_or_else(|| {
                            CoreServiceError::Decode {
                                reason: "created task has no id".into(),
                            }
                            .into()
                        })
                });

            match outcome {
                Ok((id, created)) => {
                    created_ids.push(id);
                    results.push(json!({"index": index, "success": true, "task": created}));
                }
                Err(e) => {
                    tracing::warn!(index, error = %e, "bulk item failed");
                    failures.push(e.to_string());
                    results.push(json!({"index": index, "success": false, "error": e.to_string()}));
                }
            }
        }

        let status = match (created_ids.len(), failures.len()) {
            (_, 0) => ToolStatus::Success,
            (0, _) => ToolStatus::Failed,
            _ => ToolStatus::Partial,
        };
        let rollback_id = (!created_ids.is_empty()).then(new_rollback_id);
        let result = ToolResult {
            status,
            data: json!({
                "created_count": created_ids.len(),
                "failed_count": failures.len(),
                "results": results,
            }),
            error: (!failures.is_empty()).then(|| failures.join("; ")),
            rollback_id: rollback_id.clone(),
            rollback_metadata: json!({"kind": EntityKind::Task, "ids": created_ids}),
            execution_time_ms: start.elapsed().as_millis() as u64,
        };
        self.log.append(params, &result);

        tracing::info!(
            workspace_id = %ctx.workspace_id,
            created = created_ids.len(),
            failed = failures.len(),
            rollback_id = ?rollback_id,
            "bulk task creation finished"
        );
        Ok(result)
    }

    async fn rollback(&self, rollback_id: &str) -> Result<bool, AgentError> {
        let metadata = self.log.claim_rollback(rollback_id)?;
        let ids: Vec<String> = metadata
            .get("ids")
            .and_then(|v| v.as_array())
            .map(|ids| {
                ids.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();

        let mut first_error = None;
        for id in &ids {
            match self.core.delete(EntityKind::Task, id).await {
                Ok(()) | Err(CoreServiceError::NotFound { .. }) => {}
                Err(e) => {
                    tracing::warn!(task_id = %id, error = %e, "bulk rollback delete failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            None => {
                tracing::info!(rollback_id = %rollback_id, tasks = ids.len(), "bulk creation rolled back");
                Ok(true)
            }
            Some(e) => {
                self.log.release_rollback(rollback_id);
                Err(e.into())
            }
        }
    }

    fn history(&self) -> Vec<ExecutionRecord> {
        self.log.records()
    }
}
