//! Batch controller: per-item approval for bulk mutations.
//!
//! A bulk action is split into [`BatchItem`]s. Items are approved, rejected
//! or skipped individually (or all at once in whole-batch mode), and only
//! the approved subset is handed to the bulk tool. Counts are recomputed
//! from item state after every transition so they can never drift.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::errors::AgentError;
use super::text::summarize_value;
use super::tools::{Tool, ToolContext};
use super::types::{ConfirmationResponse, ConfirmationStatus, ToolResult, ToolStatus};

// ─── Types ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchItemStatus {
    Pending,
    Approved,
    Rejected,
    Skipped,
}

/// Per-item decision carried in a confirmation response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemDecision {
    Approve,
    Reject,
    Skip,
}

/// One candidate item of a bulk operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItem {
    pub id: String,
    /// One-line description shown to the reviewer.
    pub preview: String,
    /// Original item payload.
    pub data: Value,
    pub status: BatchItemStatus,
    pub approved: Option<bool>,
    pub skip: bool,
    pub modified_data: Option<Value>,
    pub error: Option<String>,
}

impl BatchItem {
    /// Payload to execute: `data` with `modified_data` fields laid over it.
    pub fn effective_data(&self) -> Value {
        match (&self.data, &self.modified_data) {
            (Value::Object(base), Some(Value::Object(patch))) => {
                let mut merged = base.clone();
                for (k, v) in patch {
                    merged.insert(k.clone(), v.clone());
                }
                Value::Object(merged)
            }
            (_, Some(replacement)) => replacement.clone(),
            (base, None) => base.clone(),
        }
    }
}

/// Approval bookkeeping for one bulk action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchControl {
    pub total_items: usize,
    pub allow_partial: bool,
    pub individual_approval: bool,
    pub items: Vec<BatchItem>,
    pub approved_count: usize,
    pub rejected_count: usize,
}

impl BatchControl {
    pub fn new(payloads: Vec<Value>, individual_approval: bool, allow_partial: bool) -> Self {
        let items: Vec<BatchItem> = payloads
            .into_iter()
            .enumerate()
            .map(|(i, data)| BatchItem {
                id: format!("item_{}", i + 1),
                preview: item_preview(&data),
                data,
                status: BatchItemStatus::Pending,
                approved: None,
                skip: false,
                modified_data: None,
                error: None,
            })
            .collect();
        Self {
            total_items: items.len(),
            allow_partial,
            individual_approval,
            items,
            approved_count: 0,
            rejected_count: 0,
        }
    }

    /// Rebuild an undecided control from the payload of [`to_context`](Self::to_context).
    pub fn from_context(context: &Value) -> Option<Self> {
        let items = context.get("items")?.as_array()?;
        let flag = |name: &str| context.get(name).and_then(Value::as_bool).unwrap_or(true);
        Some(Self::new(
            items
                .iter()
                .map(|i| i.get("data").cloned().unwrap_or(Value::Null))
                .collect(),
            flag("individual_approval"),
            flag("allow_partial"),
        ))
    }

    fn item_mut(&mut self, item_id: &str) -> Result<&mut BatchItem, AgentError> {
        self.items
            .iter_mut()
            .find(|i| i.id == item_id)
            .ok_or_else(|| AgentError::invalid_params("batch", format!("unknown item '{item_id}'")))
    }

    fn require_individual(&self) -> Result<(), AgentError> {
        if !self.individual_approval {
            return Err(AgentError::invalid_params(
                "batch",
                "per-item decisions need individual approval mode",
            ));
        }
        Ok(())
    }

    fn recount(&mut self) {
        self.approved_count = self
            .items
            .iter()
            .filter(|i| i.status == BatchItemStatus::Approved)
            .count();
        self.rejected_count = self
            .items
            .iter()
            .filter(|i| i.status == BatchItemStatus::Rejected)
            .count();
    }

    fn set_status(&mut self, item_id: &str, status: BatchItemStatus) -> Result<(), AgentError> {
        let item = self.item_mut(item_id)?;
        if item.skip && status != BatchItemStatus::Skipped {
            return Err(AgentError::invalid_params(
                "batch",
                format!("item '{item_id}' is skipped"),
            ));
        }
        item.status = status;
        item.approved = match status {
            BatchItemStatus::Approved => Some(true),
            BatchItemStatus::Rejected => Some(false),
            BatchItemStatus::Pending | BatchItemStatus::Skipped => None,
        };
        if status == BatchItemStatus::Skipped {
            item.skip = true;
        }
        self.recount();
        Ok(())
    }

    // ─── Item Decisions ─────────────────────────────────────────────────

    pub fn approve_item(&mut self, item_id: &str) -> Result<(), AgentError> {
        self.require_individual()?;
        self.set_status(item_id, BatchItemStatus::Approved)
    }

    pub fn reject_item(&mut self, item_id: &str) -> Result<(), AgentError> {
        self.require_individual()?;
        self.set_status(item_id, BatchItemStatus::Rejected)
    }

    /// Exclude an item from counts and execution. Allowed in both modes.
    pub fn skip_item(&mut self, item_id: &str) -> Result<(), AgentError> {
        self.set_status(item_id, BatchItemStatus::Skipped)
    }

    /// Approve an item with field overrides.
    pub fn modify_item(&mut self, item_id: &str, data: Value) -> Result<(), AgentError> {
        self.require_individual()?;
        self.item_mut(item_id)?.modified_data = Some(data);
        self.set_status(item_id, BatchItemStatus::Approved)
    }

    // ─── Whole-Batch Decisions ──────────────────────────────────────────

    pub fn approve_all(&mut self) {
        self.decide_all(BatchItemStatus::Approved);
    }

    pub fn reject_all(&mut self) {
        self.decide_all(BatchItemStatus::Rejected);
    }

    fn decide_all(&mut self, status: BatchItemStatus) {
        for item in self.items.iter_mut().filter(|i| !i.skip) {
            item.status = status;
            item.approved = Some(status == BatchItemStatus::Approved);
        }
        self.recount();
    }

    /// Close the decision phase: undecided items are rejected, and without
    /// `allow_partial` any rejection rejects the whole batch.
    pub fn finalize(&mut self) {
        for item in self
            .items
            .iter_mut()
            .filter(|i| i.status == BatchItemStatus::Pending)
        {
            item.status = BatchItemStatus::Rejected;
            item.approved = Some(false);
        }
        self.recount();
        if !self.allow_partial && self.rejected_count > 0 {
            self.reject_all();
        }
    }

    /// Items that will be executed. Never contains a skipped item.
    pub fn get_approved_items(&self) -> Vec<&BatchItem> {
        let all_approved = self
            .items
            .iter()
            .filter(|i| !i.skip)
            .all(|i| i.status == BatchItemStatus::Approved);
        if !self.allow_partial && !all_approved {
            return Vec::new();
        }
        self.items
            .iter()
            .filter(|i| !i.skip && i.status == BatchItemStatus::Approved)
            .collect()
    }

    pub fn skipped_count(&self) -> usize {
        self.items.iter().filter(|i| i.skip).count()
    }

    /// Apply a terminal confirmation response to the batch and finalize it.
    ///
    /// In individual mode an approval carries
    /// `modified_parameters.decisions: {item_id: approve|reject|skip}` and
    /// optional `modified_parameters.items: {item_id: {..overrides..}}`.
    pub fn apply_response(&mut self, response: &ConfirmationResponse) -> Result<(), AgentError> {
        // A timeout resolved to the default option approves the whole batch.
        if response.status == ConfirmationStatus::Timeout && response.selected_option_id.is_some() {
            self.approve_all();
            self.finalize();
            return Ok(());
        }
        let approving = matches!(
            response.status,
            ConfirmationStatus::Approved | ConfirmationStatus::Modified
        );
        if !approving {
            self.reject_all();
            self.finalize();
            return Ok(());
        }

        let params = response.modified_parameters.as_ref();
        if !self.individual_approval {
            if let Some(skips) = params
                .and_then(|p| p.get("skip"))
                .and_then(|s| s.as_array())
            {
                for id in skips.iter().filter_map(|v| v.as_str()) {
                    self.skip_item(id)?;
                }
            }
            self.approve_all();
            self.finalize();
            return Ok(());
        }

        let overrides = params
            .and_then(|p| p.get("items"))
            .and_then(|v| v.as_object())
            .cloned()
            .unwrap_or_default();
        if let Some(decisions) = params.and_then(|p| p.get("decisions")) {
            let decisions: std::collections::BTreeMap<String, ItemDecision> =
                serde_json::from_value(decisions.clone()).map_err(|e| {
                    AgentError::InvalidApproval {
                        request_id: response.request_id.clone(),
                        reason: format!("malformed batch decisions: {e}"),
                    }
                })?;
            for (item_id, decision) in decisions {
                match decision {
                    ItemDecision::Approve => match overrides.get(&item_id) {
                        Some(data) => self.modify_item(&item_id, data.clone())?,
                        None => self.approve_item(&item_id)?,
                    },
                    ItemDecision::Reject => self.reject_item(&item_id)?,
                    ItemDecision::Skip => self.skip_item(&item_id)?,
                }
            }
        }
        self.finalize();
        Ok(())
    }

    /// Context payload attached to the confirmation request.
    pub fn to_context(&self) -> Value {
        json!({
            "total_items": self.total_items,
            "individual_approval": self.individual_approval,
            "allow_partial": self.allow_partial,
            "items": self.items.iter().map(|i| json!({"id": i.id, "preview": i.preview, "data": i.data})).collect::<Vec<_>>(),
        })
    }
}

fn item_preview(data: &Value) -> String {
    match data.get("title").and_then(|t| t.as_str()) {
        Some(title) => title.to_string(),
        None => summarize_value(data, 80),
    }
}

// ─── BatchController ────────────────────────────────────────────────────────

/// Runs the approved subset of a batch through a bulk tool.
pub struct BatchController {
    tool: Arc<dyn Tool>,
    items_field: String,
}

impl BatchController {
    /// `items_field` names the array in the tool params (`tasks` for bulk task creation).
    pub fn new(tool: Arc<dyn Tool>, items_field: &str) -> Self {
        Self {
            tool,
            items_field: items_field.to_string(),
        }
    }

    /// Split bulk params into a batch. `individual_approval` and
    /// `allow_partial` in the params override the defaults (true, true).
    pub fn control_from_params(&self, params: &Value) -> Result<BatchControl, AgentError> {
        self.tool.validate_params(params)?;
        let items = params
            .get(&self.items_field)
            .and_then(|v| v.as_array())
            .cloned()
            .ok_or_else(|| {
                AgentError::invalid_params(
                    self.tool.action_type(),
                    format!("missing required array '{}'", self.items_field),
                )
            })?;
        let flag = |name: &str| params.get(name).and_then(|v| v.as_bool()).unwrap_or(true);
        Ok(BatchControl::new(
            items,
            flag("individual_approval"),
            flag("allow_partial"),
        ))
    }

    /// Execute the approved items. Returns `None` when nothing was approved,
    /// in which case the core service is never called.
    pub async fn execute(
        &self,
        ctx: &ToolContext,
        control: &mut BatchControl,
    ) -> Result<Option<ToolResult>, AgentError> {
        let approved: Vec<(String, Value)> = control
            .get_approved_items()
            .into_iter()
            .map(|i| (i.id.clone(), i.effective_data()))
            .collect();
        if approved.is_empty() {
            tracing::info!(
                action = self.tool.action_type(),
                rejected = control.rejected_count,
                "batch has no approved items"
            );
            return Ok(None);
        }

        let payloads: Vec<Value> = approved.iter().map(|(_, data)| data.clone()).collect();
        let mut params = serde_json::Map::new();
        params.insert(self.items_field.clone(), Value::Array(payloads));
        let tool_result = self.tool.execute(ctx, &Value::Object(params)).await?;

        let per_item = tool_result
            .data
            .get("results")
            .and_then(|r| r.as_array())
            .cloned()
            .unwrap_or_default();
        let mut succeeded = 0usize;
        let mut failed = 0usize;
        let mut item_results = Vec::with_capacity(approved.len());
        for (index, (item_id, _)) in approved.iter().enumerate() {
            let entry = per_item.get(index);
            let ok = entry
                .and_then(|e| e.get("success"))
                .and_then(|s| s.as_bool())
                .unwrap_or(false);
            if ok {
                succeeded += 1;
            } else {
                failed += 1;
                let error = entry
                    .and_then(|e| e.get("error"))
                    .and_then(|e| e.as_str())
                    .unwrap_or("no result for item")
                    .to_string();
                if let Ok(item) = control.item_mut(item_id) {
                    item.error = Some(error);
                }
            }
            item_results.push(json!({
                "item_id": item_id,
                "success": ok,
                "task": entry.and_then(|e| e.get("task")).cloned().unwrap_or(Value::Null),
            }));
        }

        let status = if succeeded == 0 {
            ToolStatus::Failed
        } else if failed > 0 || control.rejected_count > 0 {
            ToolStatus::Partial
        } else {
            ToolStatus::Success
        };

        tracing::info!(
            action = self.tool.action_type(),
            created = succeeded,
            failed,
            rejected = control.rejected_count,
            skipped = control.skipped_count(),
            "batch executed"
        );

        Ok(Some(ToolResult {
            status,
            data: json!({
                "created_count": succeeded,
                "failed_count": failed,
                "rejected_count": control.rejected_count,
                "skipped_count": control.skipped_count(),
                "items": item_results,
            }),
            error: tool_result.error,
            rollback_id: tool_result.rollback_id,
            rollback_metadata: tool_result.rollback_metadata,
            execution_time_ms: tool_result.execution_time_ms,
        }))
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
