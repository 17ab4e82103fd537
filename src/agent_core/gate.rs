//! HITL gate: the only path by which a write action reaches a tool.
//!
//! Flow for one proposed action:
//! 1. Look up the tool, validate and preview the parameters
//! 2. Evaluate the severity policy
//! 3. Auto-execute (LOW by default) or open a confirmation request
//! 4. Wait for the terminal response (or the timeout rule)
//! 5. Execute at most once, with bounded retry, and audit the outcome

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::actions::{self, RequiredInteraction, Severity};
use super::batch::{BatchControl, BatchController};
use super::confirmation::{ConfirmationManager, NewConfirmation};
use super::database::AuditStore;
use super::errors::AgentError;
use super::notify::{spawn_notify, NotificationEvent, Notifier};
use super::retry::RetryPolicy;
use super::tools::{Tool, ToolContext, ToolRegistry};
use super::types::{
    ActionExecutionResult, ActionOption, ConfirmationRequest, ConfirmationResponse,
    ConfirmationStatus, ToolPreview, ToolResult,
};

/// Id of the single option attached to a gated action.
pub const EXECUTE_OPTION: &str = "execute";

// ─── Types ──────────────────────────────────────────────────────────────────

/// Who is asking for an action and where.
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub workspace_id: String,
    pub user_id: String,
    pub agent_name: String,
}

impl ActionContext {
    pub fn new(workspace_id: &str, user_id: &str, agent_name: &str) -> Self {
        Self {
            workspace_id: workspace_id.to_string(),
            user_id: user_id.to_string(),
            agent_name: agent_name.to_string(),
        }
    }

    fn tool_context(&self) -> ToolContext {
        ToolContext::new(&self.workspace_id, &self.user_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    Executed,
    Rejected,
    TimedOut,
    Cancelled,
    Failed,
}

/// Everything that happened to one proposed action.
#[derive(Debug, Clone, Serialize)]
pub struct GateOutcome {
    pub status: GateStatus,
    pub action_type: String,
    pub severity: Severity,
    pub interaction: RequiredInteraction,
    pub preview: ToolPreview,
    pub request: Option<ConfirmationRequest>,
    pub response: Option<ConfirmationResponse>,
    pub execution: Option<ActionExecutionResult>,
    pub batch: Option<BatchControl>,
}

// ─── HitlGate ───────────────────────────────────────────────────────────────

pub struct HitlGate {
    tools: ToolRegistry,
    confirmations: Arc<ConfirmationManager>,
    notifier: Arc<dyn Notifier>,
    retry: RetryPolicy,
    audit: Option<Arc<AuditStore>>,
    /// Receives every confirmation request as it is opened (UI bridge).
    request_tx: Option<mpsc::UnboundedSender<ConfirmationRequest>>,
}

impl HitlGate {
    pub fn new(
        tools: ToolRegistry,
        confirmations: Arc<ConfirmationManager>,
        notifier: Arc<dyn Notifier>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            tools,
            confirmations,
            notifier,
            retry,
            audit: None,
            request_tx: None,
        }
    }

    pub fn with_audit(mut self, audit: Arc<AuditStore>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Forward opened confirmation requests into a channel.
    pub fn with_request_channel(
        mut self,
    ) -> (Self, mpsc::UnboundedReceiver<ConfirmationRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.request_tx = Some(tx);
        (self, rx)
    }

    pub fn confirmations(&self) -> &Arc<ConfirmationManager> {
        &self.confirmations
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    // ─── Running Actions ────────────────────────────────────────────────

    /// Gate and (maybe) execute one action.
    ///
    /// Errors are reserved for input problems (unknown action, invalid
    /// parameters) and protocol failures; rejections, timeouts and failed
    /// executions are reported in the outcome.
    pub async fn run_action(
        &self,
        ctx: &ActionContext,
        action_type: &str,
        params: &Value,
    ) -> Result<GateOutcome, AgentError> {
        let tool = self.tools.get(action_type)?;
        let preview = tool.preview(params)?;
        let severity = tool.severity();
        let interaction = actions::required_interaction(severity, self.confirmations.config());

        tracing::info!(
            action = %action_type,
            severity = %severity,
            interaction = ?interaction,
            workspace_id = %ctx.workspace_id,
            "gating action"
        );

        let mut outcome = GateOutcome {
            status: GateStatus::Rejected,
            action_type: action_type.to_string(),
            severity,
            interaction,
            preview,
            request: None,
            response: None,
            execution: None,
            batch: None,
        };

        if !interaction.needs_human() {
            let request_id = format!("auto-{}", uuid::Uuid::new_v4());
            let execution = self
                .execute_once(tool.as_ref(), ctx, &request_id, params)
                .await;
            outcome.status = execution_status(&execution);
            spawn_notify(
                &self.notifier,
                &ctx.user_id,
                NotificationEvent::ActionAutoExecuted,
                json!({
                    "action": action_type,
                    "summary": outcome.preview.summary,
                    "success": execution.success,
                }),
            );
            outcome.execution = Some(execution);
            return Ok(outcome);
        }

        let batch = if action_type == actions::TASK_BULK_CREATE {
            let controller = BatchController::new(tool.clone(), "tasks");
            Some((controller.control_from_params(params)?, controller))
        } else {
            None
        };

        let mut context = json!({"preview": outcome.preview});
        if let Some((control, _)) = &batch {
            context["batch"] = control.to_context();
        }
        let request = self.confirmations.create_request(NewConfirmation {
            workspace_id: ctx.workspace_id.clone(),
            user_id: ctx.user_id.clone(),
            agent_name: ctx.agent_name.clone(),
            title: outcome.preview.summary.clone(),
            description: describe(&outcome.preview),
            context,
            options: vec![ActionOption {
                id: EXECUTE_OPTION.to_string(),
                label: "Proceed".to_string(),
                description: outcome.preview.summary.clone(),
                action_type: action_type.to_string(),
                severity,
                parameters: params.clone(),
                reversible: tool.reversible(),
            }],
            default_option: Some(EXECUTE_OPTION.to_string()),
        })?;
        if let Some(tx) = &self.request_tx {
            let _ = tx.send(request.clone());
        }

        let response = self.confirmations.wait(&request.request_id).await?;
        let authorized = ConfirmationManager::executable_option(&request, &response).cloned();
        outcome.status = match (&authorized, response.status) {
            (Some(_), _) => GateStatus::Executed,
            (None, ConfirmationStatus::Timeout) => GateStatus::TimedOut,
            (None, _) if self.confirmations.was_cancelled(&request.request_id) => {
                GateStatus::Cancelled
            }
            (None, _) => GateStatus::Rejected,
        };

        match (authorized, batch) {
            (Some(option), Some((mut control, controller))) => {
                control.apply_response(&response)?;
                self.confirmations.claim_execution(&request.request_id)?;
                let executed = controller.execute(&ctx.tool_context(), &mut control).await;
                let execution = match executed {
                    Ok(Some(result)) => Some(self.finish(&request.request_id, &option.id, Ok(result))),
                    Ok(None) => None,
                    Err(e) => Some(self.finish(&request.request_id, &option.id, Err(e))),
                };
                outcome.status = match &execution {
                    Some(exec) => execution_status(exec),
                    None => GateStatus::Rejected,
                };
                outcome.execution = execution;
                outcome.batch = Some(control);
            }
            (Some(option), None) => {
                self.confirmations.claim_execution(&request.request_id)?;
                let params = effective_params(&option, &response);
                let execution = self
                    .execute_once(tool.as_ref(), ctx, &request.request_id, &params)
                    .await;
                outcome.status = execution_status(&execution);
                outcome.execution = Some(execution);
            }
            (None, Some((mut control, _))) => {
                control.apply_response(&response)?;
                outcome.batch = Some(control);
            }
            (None, None) => {}
        }

        tracing::info!(
            action = %action_type,
            request_id = %request.request_id,
            status = ?outcome.status,
            "gated action finished"
        );
        outcome.request = Some(request);
        outcome.response = Some(response);
        Ok(outcome)
    }

    /// Validate then execute with bounded retry, producing the terminal record.
    async fn execute_once(
        &self,
        tool: &dyn Tool,
        ctx: &ActionContext,
        request_id: &str,
        params: &Value,
    ) -> ActionExecutionResult {
        let tool_ctx = ctx.tool_context();
        let result = match tool.validate_params(params) {
            Ok(()) => {
                self.retry
                    .run(tool.action_type(), |_| tool.execute(&tool_ctx, params))
                    .await
            }
            Err(e) => Err(e),
        };
        self.finish(request_id, EXECUTE_OPTION, result)
    }

    fn finish(
        &self,
        request_id: &str,
        option_id: &str,
        result: Result<ToolResult, AgentError>,
    ) -> ActionExecutionResult {
        let execution = match result {
            Ok(result) => ActionExecutionResult {
                request_id: request_id.to_string(),
                option_id: option_id.to_string(),
                success: result.is_success(),
                rollback_available: result.rollback_id.is_some(),
                rollback_id: result.rollback_id.clone(),
                error: result.error.clone(),
                result: json!({"status": result.status, "data": result.data}),
                executed_at: Utc::now(),
            },
            Err(e) => {
                tracing::warn!(request_id = %request_id, error = %e, "action execution failed");
                ActionExecutionResult {
                    request_id: request_id.to_string(),
                    option_id: option_id.to_string(),
                    success: false,
                    result: Value::Null,
                    error: Some(e.to_string()),
                    rollback_available: false,
                    rollback_id: None,
                    executed_at: Utc::now(),
                }
            }
        };
        self.confirmations.record_execution(&execution);
        execution
    }

    // ─── Rollback ───────────────────────────────────────────────────────

    /// Undo a previous execution through the tool that issued `rollback_id`.
    pub async fn rollback(&self, action_type: &str, rollback_id: &str) -> Result<bool, AgentError> {
        let tool = self.tools.get(action_type)?;
        let result = tool.rollback(rollback_id).await;

        let error = result.as_ref().err().map(|e| e.to_string());
        match &result {
            Ok(_) => tracing::info!(action = %action_type, rollback_id = %rollback_id, "rollback completed"),
            Err(e) => tracing::warn!(action = %action_type, rollback_id = %rollback_id, error = %e, "rollback failed"),
        }
        if let Some(audit) = &self.audit {
            let ok = matches!(result, Ok(true));
            if let Err(e) = audit.record_rollback(rollback_id, action_type, ok, error.as_deref()) {
                tracing::warn!(rollback_id = %rollback_id, error = %e, "failed to audit rollback");
            }
        }
        result
    }
}

// ─── Helpers ────────────────────────────────────────────────────────────────

fn execution_status(execution: &ActionExecutionResult) -> GateStatus {
    if execution.success {
        GateStatus::Executed
    } else {
        GateStatus::Failed
    }
}

/// Option parameters with a modified response's overrides applied.
fn effective_params(option: &ActionOption, response: &ConfirmationResponse) -> Value {
    match (
        response.status,
        &option.parameters,
        &response.modified_parameters,
    ) {
        (ConfirmationStatus::Modified, Value::Object(base), Some(Value::Object(patch))) => {
            let mut merged = base.clone();
            for (k, v) in patch {
                merged.insert(k.clone(), v.clone());
            }
            Value::Object(merged)
        }
        _ => option.parameters.clone(),
    }
}

fn describe(preview: &ToolPreview) -> String {
    let mut text = format!("{} ({})", preview.summary, preview.estimated_impact);
    if !preview.risks.is_empty() {
        text.push_str(&format!(". Risks: {}", preview.risks.join("; ")));
    }
    if !preview.reversible {
        text.push_str(". This cannot be undone.");
    }
    text
}

// ─── Tests ──────────────────────────────────────────────────────────────────
