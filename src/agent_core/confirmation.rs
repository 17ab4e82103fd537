//! Confirmation state machine.
//!
//! A request starts PENDING and reaches exactly one terminal state:
//! APPROVED, REJECTED, MODIFIED or TIMEOUT. Responses are delivered to the
//! waiting side through a oneshot channel; the wait itself is bounded by the
//! request's deadline. Terminal requests are kept for the configured
//! retention window so late responses fail with `RequestAlreadyResolved`, and
//! an execution set guarantees each request triggers at most one execution.
//! Past the window they are pruned; the audit store keeps the durable record.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::actions::{self, Severity};
use super::batch::BatchControl;
use super::database::AuditStore;
use super::errors::AgentError;
use super::notify::{spawn_notify, NotificationEvent, Notifier};
use super::types::{
    ActionExecutionResult, ActionOption, ConfirmationRequest, ConfirmationResponse,
    ConfirmationStatus,
};
use crate::config::{HitlConfig, TimeoutAction};

/// Reason attached to requests withdrawn by their requester.
pub const CANCELLED_REASON: &str = "cancelled";

// ─── Inputs ─────────────────────────────────────────────────────────────────

/// Everything needed to open a confirmation request.
#[derive(Debug, Clone)]
pub struct NewConfirmation {
    pub workspace_id: String,
    pub user_id: String,
    pub agent_name: String,
    pub title: String,
    pub description: String,
    pub context: serde_json::Value,
    pub options: Vec<ActionOption>,
    pub default_option: Option<String>,
}

// ─── State ──────────────────────────────────────────────────────────────────

struct PendingEntry {
    request: ConfirmationRequest,
    deadline: Instant,
    tx: Option<oneshot::Sender<ConfirmationResponse>>,
    rx: Option<oneshot::Receiver<ConfirmationResponse>>,
}

struct ResolvedEntry {
    request: ConfirmationRequest,
    response: ConfirmationResponse,
    /// Withdrawn through `cancel`, not rejected by the user.
    cancelled: bool,
    resolved_at: Instant,
}

impl ResolvedEntry {
    fn new(request: ConfirmationRequest, response: ConfirmationResponse, cancelled: bool) -> Self {
        Self {
            request,
            response,
            cancelled,
            resolved_at: Instant::now(),
        }
    }
}

#[derive(Default)]
struct ManagerState {
    pending: HashMap<String, PendingEntry>,
    resolved: HashMap<String, ResolvedEntry>,
    executed: HashSet<String>,
}

// ─── ConfirmationManager ────────────────────────────────────────────────────

/// Owns every confirmation request for one engine instance.
pub struct ConfirmationManager {
    config: HitlConfig,
    notifier: Arc<dyn Notifier>,
    audit: Option<Arc<AuditStore>>,
    state: Mutex<ManagerState>,
}

impl ConfirmationManager {
    pub fn new(config: HitlConfig, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            config,
            notifier,
            audit: None,
            state: Mutex::new(ManagerState::default()),
        }
    }

    pub fn with_audit(mut self, audit: Arc<AuditStore>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn config(&self) -> &HitlConfig {
        &self.config
    }

    fn lock(&self) -> Result<MutexGuard<'_, ManagerState>, AgentError> {
        self.state.lock().map_err(|e| AgentError::DatabaseError {
            reason: format!("confirmation state poisoned: {e}"),
        })
    }

    // ─── Creation ───────────────────────────────────────────────────────

    /// Open a PENDING request and notify the user if configured.
    pub fn create_request(&self, new: NewConfirmation) -> Result<ConfirmationRequest, AgentError> {
        if new.options.is_empty() {
            return Err(AgentError::invalid_params(
                "confirmation",
                "a confirmation request needs at least one option",
            ));
        }
        if let Some(default) = &new.default_option {
            if !new.options.iter().any(|o| &o.id == default) {
                return Err(AgentError::invalid_params(
                    "confirmation",
                    format!("default option '{default}' is not one of the options"),
                ));
            }
        }

        let severity = new
            .options
            .iter()
            .map(|o| o.severity)
            .max()
            .unwrap_or(Severity::Low);
        let timeout_seconds = actions::timeout_seconds(severity, &self.config);
        let out_of_range = || AgentError::ConfigError {
            reason: format!("confirmation timeout of {timeout_seconds}s is out of range"),
        };
        let created_at = Utc::now();
        let expires_at = i64::try_from(timeout_seconds)
            .ok()
            .and_then(chrono::TimeDelta::try_seconds)
            .and_then(|delta| created_at.checked_add_signed(delta))
            .ok_or_else(out_of_range)?;
        let deadline = Instant::now()
            .checked_add(Duration::from_secs(timeout_seconds))
            .ok_or_else(out_of_range)?;

        let request = ConfirmationRequest {
            request_id: uuid::Uuid::new_v4().to_string(),
            workspace_id: new.workspace_id,
            user_id: new.user_id,
            agent_name: new.agent_name,
            title: new.title,
            description: new.description,
            context: new.context,
            options: new.options,
            default_option: new.default_option,
            timeout_seconds,
            created_at,
            expires_at,
        };

        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.lock()?;
            self.prune_resolved(&mut state);
            state.pending.insert(
                request.request_id.clone(),
                PendingEntry {
                    request: request.clone(),
                    deadline,
                    tx: Some(tx),
                    rx: Some(rx),
                },
            );
        }

        tracing::info!(
            request_id = %request.request_id,
            severity = %severity,
            options = request.options.len(),
            timeout_seconds,
            "confirmation request created"
        );

        if self.config.notify_on_pending {
            spawn_notify(
                &self.notifier,
                &request.user_id,
                NotificationEvent::ConfirmationPending,
                serde_json::json!({
                    "request_id": request.request_id,
                    "title": request.title,
                    "severity": severity,
                    "expires_at": request.expires_at.to_rfc3339(),
                }),
            );
        }

        Ok(request)
    }

    // ─── Responses ──────────────────────────────────────────────────────

    /// Apply a human response. Invalid responses leave the request PENDING.
    pub fn respond(&self, mut response: ConfirmationResponse) -> Result<(), AgentError> {
        let request_id = response.request_id.clone();
        let (request, tx) = {
            let mut state = self.lock()?;
            if state.resolved.contains_key(&request_id) {
                return Err(AgentError::RequestAlreadyResolved { request_id });
            }
            let entry = state
                .pending
                .get(&request_id)
                .ok_or_else(|| AgentError::UnknownRequest {
                    request_id: request_id.clone(),
                })?;

            self.validate_response(&entry.request, &mut response)?;

            let mut entry = state
                .pending
                .remove(&request_id)
                .ok_or_else(|| AgentError::UnknownRequest {
                    request_id: request_id.clone(),
                })?;
            let tx = entry.tx.take();
            state.resolved.insert(
                request_id.clone(),
                ResolvedEntry::new(entry.request.clone(), response.clone(), false),
            );
            (entry.request, tx)
        };

        tracing::info!(
            request_id = %request_id,
            status = response.status.as_str(),
            option = ?response.selected_option_id,
            "confirmation resolved"
        );
        self.audit_confirmation(&request, &response);

        if let Some(tx) = tx {
            // Nobody waiting is fine: the resolution is already recorded.
            let _ = tx.send(response);
        }
        Ok(())
    }

    fn validate_response(
        &self,
        request: &ConfirmationRequest,
        response: &mut ConfirmationResponse,
    ) -> Result<(), AgentError> {
        let invalid = |reason: &str| AgentError::InvalidApproval {
            request_id: request.request_id.clone(),
            reason: reason.to_string(),
        };

        match response.status {
            ConfirmationStatus::Pending | ConfirmationStatus::Timeout => {
                return Err(invalid("status must be approved, rejected or modified"));
            }
            ConfirmationStatus::Approved | ConfirmationStatus::Modified => {
                if response.selected_option_id.is_none() && request.options.len() == 1 {
                    response.selected_option_id = Some(request.options[0].id.clone());
                }
                if response.selected_option_id.is_none() {
                    return Err(invalid("an option must be selected"));
                }
            }
            ConfirmationStatus::Rejected => {}
        }

        let selected = match &response.selected_option_id {
            Some(id) => Some(
                request
                    .option(id)
                    .ok_or_else(|| invalid(&format!("option '{id}' does not exist")))?,
            ),
            None => None,
        };

        if response.status == ConfirmationStatus::Modified
            && !matches!(response.modified_parameters, Some(serde_json::Value::Object(_)))
        {
            return Err(invalid("modified response needs an object of parameters"));
        }

        let severity = selected
            .map(|o| o.severity)
            .unwrap_or_else(|| request.max_severity());
        let needs_reason = actions::required_interaction(severity, &self.config).needs_reason();
        let has_reason = response
            .reason
            .as_deref()
            .map(|r| !r.trim().is_empty())
            .unwrap_or(false);
        if needs_reason && !has_reason {
            return Err(invalid("critical actions require a non-empty reason"));
        }

        // Batch decisions are checked against the items the request was opened with.
        if let Some(mut control) = request.context.get("batch").and_then(BatchControl::from_context) {
            control
                .apply_response(response)
                .map_err(|e| invalid(&format!("batch decisions rejected: {e}")))?;
        }
        Ok(())
    }

    /// Withdraw a pending request. Finalizes as REJECTED with reason "cancelled".
    pub fn cancel(&self, request_id: &str) -> Result<(), AgentError> {
        let (request, response, tx) = {
            let mut state = self.lock()?;
            if state.resolved.contains_key(request_id) {
                return Err(AgentError::RequestAlreadyResolved {
                    request_id: request_id.to_string(),
                });
            }
            let mut entry =
                state
                    .pending
                    .remove(request_id)
                    .ok_or_else(|| AgentError::UnknownRequest {
                        request_id: request_id.to_string(),
                    })?;
            let response = ConfirmationResponse::reject(request_id, Some(CANCELLED_REASON));
            let tx = entry.tx.take();
            state.resolved.insert(
                request_id.to_string(),
                ResolvedEntry::new(entry.request.clone(), response.clone(), true),
            );
            (entry.request, response, tx)
        };

        tracing::info!(request_id = %request_id, "confirmation cancelled");
        self.audit_confirmation(&request, &response);
        if let Some(tx) = tx {
            let _ = tx.send(response);
        }
        Ok(())
    }

    // ─── Waiting & Timeouts ─────────────────────────────────────────────

    /// Wait for the terminal response, applying the timeout rule at the deadline.
    pub async fn wait(&self, request_id: &str) -> Result<ConfirmationResponse, AgentError> {
        let (rx, deadline) = {
            let mut state = self.lock()?;
            if let Some(resolved) = state.resolved.get(request_id) {
                return Ok(resolved.response.clone());
            }
            let entry =
                state
                    .pending
                    .get_mut(request_id)
                    .ok_or_else(|| AgentError::UnknownRequest {
                        request_id: request_id.to_string(),
                    })?;
            let rx = entry.rx.take().ok_or_else(|| AgentError::AlreadyWaiting {
                request_id: request_id.to_string(),
            })?;
            (rx, entry.deadline)
        };

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) | Err(_) => self.expire(request_id),
        }
    }

    /// Finalize a request as TIMEOUT, or return its resolution if it won the race.
    pub fn expire(&self, request_id: &str) -> Result<ConfirmationResponse, AgentError> {
        let (request, response) = {
            let mut state = self.lock()?;
            if let Some(resolved) = state.resolved.get(request_id) {
                return Ok(resolved.response.clone());
            }
            let entry =
                state
                    .pending
                    .remove(request_id)
                    .ok_or_else(|| AgentError::UnknownRequest {
                        request_id: request_id.to_string(),
                    })?;
            let response = self.timeout_response(&entry.request);
            state.resolved.insert(
                request_id.to_string(),
                ResolvedEntry::new(entry.request.clone(), response.clone(), false),
            );
            (entry.request, response)
        };

        tracing::info!(
            request_id = %request_id,
            timeout_action = ?self.config.timeout_action,
            default_applied = response.selected_option_id.is_some(),
            "confirmation timed out"
        );

        if self.config.timeout_action == TimeoutAction::Escalate {
            tracing::warn!(request_id = %request_id, "confirmation escalated");
            spawn_notify(
                &self.notifier,
                &request.user_id,
                NotificationEvent::ConfirmationEscalated,
                serde_json::json!({
                    "request_id": request.request_id,
                    "title": request.title,
                    "severity": request.max_severity(),
                }),
            );
        }
        if self.config.notify_on_timeout {
            spawn_notify(
                &self.notifier,
                &request.user_id,
                NotificationEvent::ConfirmationTimeout,
                serde_json::json!({
                    "request_id": request.request_id,
                    "title": request.title,
                    "default_applied": response.selected_option_id.is_some(),
                }),
            );
        }

        self.audit_confirmation(&request, &response);
        Ok(response)
    }

    /// Expire every pending request whose deadline has passed, and drop
    /// terminal requests older than the retention window.
    pub fn expire_overdue(&self) -> Result<Vec<ConfirmationResponse>, AgentError> {
        let now = Instant::now();
        let overdue: Vec<String> = {
            let mut state = self.lock()?;
            self.prune_resolved(&mut state);
            state
                .pending
                .iter()
                .filter(|(_, e)| e.deadline <= now)
                .map(|(id, _)| id.clone())
                .collect()
        };
        overdue.iter().map(|id| self.expire(id)).collect()
    }

    fn prune_resolved(&self, state: &mut ManagerState) {
        let retention = Duration::from_secs(self.config.resolved_retention_seconds);
        let now = Instant::now();
        let before = state.resolved.len();
        let ManagerState {
            resolved, executed, ..
        } = &mut *state;
        resolved.retain(|id, entry| {
            let keep = now.saturating_duration_since(entry.resolved_at) < retention;
            if !keep {
                executed.remove(id);
            }
            keep
        });
        let pruned = before - state.resolved.len();
        if pruned > 0 {
            tracing::debug!(pruned, "pruned resolved confirmation requests");
        }
    }

    /// The TIMEOUT response the deployment's timeout rule produces.
    ///
    /// Only `default` with a valid default option whose interaction is a plain
    /// confirmation carries a selected option; everything else never executes.
    fn timeout_response(&self, request: &ConfirmationRequest) -> ConfirmationResponse {
        let default_option = match self.config.timeout_action {
            TimeoutAction::Default => request
                .default_option
                .as_deref()
                .and_then(|id| request.option(id))
                .filter(|opt| {
                    actions::required_interaction(opt.severity, &self.config)
                        .allows_timeout_default()
                })
                .map(|opt| opt.id.clone()),
            TimeoutAction::Reject | TimeoutAction::Escalate => None,
        };
        ConfirmationResponse {
            request_id: request.request_id.clone(),
            status: ConfirmationStatus::Timeout,
            selected_option_id: default_option,
            modified_parameters: None,
            reason: Some("timeout".into()),
        }
    }

    // ─── Execution Bookkeeping ──────────────────────────────────────────

    /// The option a terminal response authorizes, if any.
    pub fn executable_option<'a>(
        request: &'a ConfirmationRequest,
        response: &ConfirmationResponse,
    ) -> Option<&'a ActionOption> {
        match response.status {
            ConfirmationStatus::Approved
            | ConfirmationStatus::Modified
            | ConfirmationStatus::Timeout => response
                .selected_option_id
                .as_deref()
                .and_then(|id| request.option(id)),
            ConfirmationStatus::Rejected | ConfirmationStatus::Pending => None,
        }
    }

    /// Reserve the single execution a terminal request may trigger.
    pub fn claim_execution(&self, request_id: &str) -> Result<(), AgentError> {
        let mut state = self.lock()?;
        if !state.resolved.contains_key(request_id) {
            return Err(AgentError::UnknownRequest {
                request_id: request_id.to_string(),
            });
        }
        if !state.executed.insert(request_id.to_string()) {
            return Err(AgentError::RequestAlreadyResolved {
                request_id: request_id.to_string(),
            });
        }
        Ok(())
    }

    pub fn record_execution(&self, execution: &ActionExecutionResult) {
        if let Some(audit) = &self.audit {
            if let Err(e) = audit.record_execution(execution) {
                tracing::warn!(request_id = %execution.request_id, error = %e, "failed to audit execution");
            }
        }
    }

    // ─── Queries ────────────────────────────────────────────────────────

    /// Whether the request was withdrawn through [`cancel`](Self::cancel).
    pub fn was_cancelled(&self, request_id: &str) -> bool {
        self.lock()
            .map(|s| s.resolved.get(request_id).is_some_and(|r| r.cancelled))
            .unwrap_or(false)
    }

    pub fn status(&self, request_id: &str) -> Option<ConfirmationStatus> {
        let state = self.lock().ok()?;
        if state.pending.contains_key(request_id) {
            return Some(ConfirmationStatus::Pending);
        }
        state.resolved.get(request_id).map(|r| r.response.status)
    }

    pub fn get_request(&self, request_id: &str) -> Option<ConfirmationRequest> {
        let state = self.lock().ok()?;
        state
            .pending
            .get(request_id)
            .map(|e| e.request.clone())
            .or_else(|| state.resolved.get(request_id).map(|r| r.request.clone()))
    }

    /// Pending requests for a user, oldest first.
    pub fn pending_for(&self, user_id: &str) -> Vec<ConfirmationRequest> {
        let mut requests: Vec<ConfirmationRequest> = self
            .lock()
            .map(|s| {
                s.pending
                    .values()
                    .filter(|e| e.request.user_id == user_id)
                    .map(|e| e.request.clone())
                    .collect()
            })
            .unwrap_or_default();
        requests.sort_by_key(|r| r.created_at);
        requests
    }

    fn audit_confirmation(&self, request: &ConfirmationRequest, response: &ConfirmationResponse) {
        if let Some(audit) = &self.audit {
            if let Err(e) = audit.record_confirmation(request, response) {
                tracing::warn!(request_id = %request.request_id, error = %e, "failed to audit confirmation");
            }
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_core::notify::{ChannelNotifier, LogNotifier};

    fn option(id: &str, action: &str, severity: Severity) -> ActionOption {
        ActionOption {
            id: id.into(),
            label: id.into(),
            description: String::new(),
            action_type: action.into(),
            severity,
            parameters: serde_json::json!({}),
            reversible: true,
        }
    }

    fn new_request(options: Vec<ActionOption>, default_option: Option<&str>) -> NewConfirmation {
        NewConfirmation {
            workspace_id: "ws".into(),
            user_id: "u1".into(),
            agent_name: "task".into(),
            title: "Do the thing".into(),
            description: String::new(),
            context: serde_json::Value::Null,
            options,
            default_option: default_option.map(String::from),
        }
    }

    fn manager(config: HitlConfig) -> ConfirmationManager {
        ConfirmationManager::new(config, Arc::new(LogNotifier))
    }

    #[tokio::test]
    async fn test_create_sets_expiry_by_severity() {
        let mgr = manager(HitlConfig::default());
        let req = mgr
            .create_request(new_request(
                vec![option("del", "document_delete", Severity::Critical)],
                None,
            ))
            .unwrap();
        assert_eq!(req.timeout_seconds, 600);
        assert_eq!(
            (req.expires_at - req.created_at).num_seconds(),
            600
        );
        assert_eq!(mgr.status(&req.request_id), Some(ConfirmationStatus::Pending));
    }

    #[tokio::test]
    async fn test_create_rejects_bad_default() {
        let mgr = manager(HitlConfig::default());
        let err = mgr
            .create_request(new_request(
                vec![option("a", "task_update", Severity::Medium)],
                Some("zzz"),
            ))
            .unwrap_err();
        assert!(matches!(err, AgentError::InvalidParameters { .. }));
        assert!(mgr.create_request(new_request(vec![], None)).is_err());
    }

    #[tokio::test]
    async fn test_approve_then_second_response_fails() {
        let mgr = manager(HitlConfig::default());
        let req = mgr
            .create_request(new_request(
                vec![option("a", "task_update", Severity::Medium)],
                None,
            ))
            .unwrap();
        mgr.respond(ConfirmationResponse::approve(&req.request_id, "a"))
            .unwrap();
        let resp = mgr.wait(&req.request_id).await.unwrap();
        assert_eq!(resp.status, ConfirmationStatus::Approved);

        let err = mgr
            .respond(ConfirmationResponse::reject(&req.request_id, None))
            .unwrap_err();
        assert!(matches!(err, AgentError::RequestAlreadyResolved { .. }));
        assert_eq!(mgr.status(&req.request_id), Some(ConfirmationStatus::Approved));
    }

    #[tokio::test]
    async fn test_unknown_option_keeps_request_pending() {
        let mgr = manager(HitlConfig::default());
        let req = mgr
            .create_request(new_request(
                vec![option("a", "task_update", Severity::Medium)],
                None,
            ))
            .unwrap();
        let err = mgr
            .respond(ConfirmationResponse::approve(&req.request_id, "nope"))
            .unwrap_err();
        assert!(matches!(err, AgentError::InvalidApproval { .. }));
        assert_eq!(mgr.status(&req.request_id), Some(ConfirmationStatus::Pending));
    }

    #[tokio::test]
    async fn test_critical_requires_reason() {
        let mgr = manager(HitlConfig::default());
        let req = mgr
            .create_request(new_request(
                vec![option("del", "document_delete", Severity::Critical)],
                None,
            ))
            .unwrap();

        let err = mgr
            .respond(ConfirmationResponse::approve(&req.request_id, "del").with_reason("  "))
            .unwrap_err();
        assert!(matches!(err, AgentError::InvalidApproval { .. }));
        assert_eq!(mgr.status(&req.request_id), Some(ConfirmationStatus::Pending));

        mgr.respond(
            ConfirmationResponse::approve(&req.request_id, "del").with_reason("obsolete draft"),
        )
        .unwrap();
        assert_eq!(mgr.status(&req.request_id), Some(ConfirmationStatus::Approved));
    }

    #[tokio::test]
    async fn test_caller_cannot_send_timeout() {
        let mgr = manager(HitlConfig::default());
        let req = mgr
            .create_request(new_request(
                vec![option("a", "task_update", Severity::Medium)],
                None,
            ))
            .unwrap();
        let mut resp = ConfirmationResponse::approve(&req.request_id, "a");
        resp.status = ConfirmationStatus::Timeout;
        assert!(matches!(
            mgr.respond(resp).unwrap_err(),
            AgentError::InvalidApproval { .. }
        ));
    }

    #[tokio::test]
    async fn test_modified_needs_parameters() {
        let mgr = manager(HitlConfig::default());
        let req = mgr
            .create_request(new_request(
                vec![option("a", "task_update", Severity::Medium)],
                None,
            ))
            .unwrap();
        let mut resp = ConfirmationResponse::modify(&req.request_id, "a", serde_json::json!({}));
        resp.modified_parameters = None;
        assert!(mgr.respond(resp).is_err());

        mgr.respond(ConfirmationResponse::modify(
            &req.request_id,
            "a",
            serde_json::json!({"status": "done"}),
        ))
        .unwrap();
        assert_eq!(mgr.status(&req.request_id), Some(ConfirmationStatus::Modified));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_reject_never_selects_option() {
        let mgr = manager(HitlConfig::default());
        let req = mgr
            .create_request(new_request(
                vec![option("a", "task_reassign", Severity::High)],
                Some("a"),
            ))
            .unwrap();
        let resp = mgr.wait(&req.request_id).await.unwrap();
        assert_eq!(resp.status, ConfirmationStatus::Timeout);
        assert!(resp.selected_option_id.is_none());
        assert!(ConfirmationManager::executable_option(&req, &resp).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_default_applies_for_confirm_level() {
        let config = HitlConfig {
            timeout_action: TimeoutAction::Default,
            ..HitlConfig::default()
        };
        let mgr = manager(config);
        let req = mgr
            .create_request(new_request(
                vec![option("a", "task_update", Severity::Medium)],
                Some("a"),
            ))
            .unwrap();
        let resp = mgr.wait(&req.request_id).await.unwrap();
        assert_eq!(resp.status, ConfirmationStatus::Timeout);
        assert_eq!(resp.selected_option_id.as_deref(), Some("a"));
        assert!(ConfirmationManager::executable_option(&req, &resp).is_some());

        mgr.claim_execution(&req.request_id).unwrap();
        assert!(mgr.claim_execution(&req.request_id).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_default_never_approves_high() {
        let config = HitlConfig {
            timeout_action: TimeoutAction::Default,
            ..HitlConfig::default()
        };
        let mgr = manager(config);
        let req = mgr
            .create_request(new_request(
                vec![option("a", "task_reassign", Severity::High)],
                Some("a"),
            ))
            .unwrap();
        let resp = mgr.wait(&req.request_id).await.unwrap();
        assert!(resp.selected_option_id.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_escalate_notifies_and_finalizes_as_timeout() {
        let (notifier, mut rx) = ChannelNotifier::new(8);
        let config = HitlConfig {
            timeout_action: TimeoutAction::Escalate,
            notify_on_pending: false,
            notify_on_timeout: false,
            ..HitlConfig::default()
        };
        let mgr = ConfirmationManager::new(config, Arc::new(notifier));
        let req = mgr
            .create_request(new_request(
                vec![option("a", "task_update", Severity::Medium)],
                Some("a"),
            ))
            .unwrap();
        let resp = mgr.wait(&req.request_id).await.unwrap();
        assert_eq!(resp.status, ConfirmationStatus::Timeout);
        assert!(resp.selected_option_id.is_none());

        let n = rx.recv().await.unwrap();
        assert_eq!(n.event, NotificationEvent::ConfirmationEscalated);
    }

    #[tokio::test]
    async fn test_cancel_finalizes_as_rejected() {
        let mgr = manager(HitlConfig::default());
        let req = mgr
            .create_request(new_request(
                vec![option("a", "task_update", Severity::Medium)],
                None,
            ))
            .unwrap();
        mgr.cancel(&req.request_id).unwrap();
        let resp = mgr.wait(&req.request_id).await.unwrap();
        assert_eq!(resp.status, ConfirmationStatus::Rejected);
        assert_eq!(resp.reason.as_deref(), Some(CANCELLED_REASON));
        assert!(mgr.cancel(&req.request_id).is_err());
    }

    #[tokio::test]
    async fn test_response_unblocks_waiter() {
        let mgr = Arc::new(manager(HitlConfig::default()));
        let req = mgr
            .create_request(new_request(
                vec![option("a", "task_update", Severity::Medium)],
                None,
            ))
            .unwrap();
        let waiter = {
            let mgr = mgr.clone();
            let id = req.request_id.clone();
            tokio::spawn(async move { mgr.wait(&id).await })
        };
        tokio::task::yield_now().await;
        mgr.respond(ConfirmationResponse::reject(&req.request_id, Some("no")))
            .unwrap();
        let resp = waiter.await.unwrap().unwrap();
        assert_eq!(resp.status, ConfirmationStatus::Rejected);
    }

    #[tokio::test]
    async fn test_audit_records_terminal_state() {
        let audit = Arc::new(AuditStore::open(":memory:").unwrap());
        let mgr = manager(HitlConfig::default()).with_audit(audit.clone());
        let req = mgr
            .create_request(new_request(
                vec![option("a", "task_update", Severity::Medium)],
                None,
            ))
            .unwrap();
        mgr.respond(ConfirmationResponse::reject(&req.request_id, Some("no")))
            .unwrap();
        let record = audit.get_confirmation(&req.request_id).unwrap().unwrap();
        assert_eq!(record.status, "rejected");
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_overdue_sweeps_past_deadline() {
        let mgr = manager(HitlConfig::default());
        let req = mgr
            .create_request(new_request(
                vec![option("a", "task_update", Severity::Medium)],
                Some("a"),
            ))
            .unwrap();
        assert!(!req.is_expired(req.created_at));
        assert!(req.is_expired(req.expires_at));
        assert!(mgr.expire_overdue().unwrap().is_empty());

        tokio::time::advance(std::time::Duration::from_secs(301)).await;
        let expired = mgr.expire_overdue().unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].status, ConfirmationStatus::Timeout);
        assert!(expired[0].selected_option_id.is_none());
        assert_eq!(mgr.status(&req.request_id), Some(ConfirmationStatus::Timeout));
        assert_eq!(mgr.get_request(&req.request_id).unwrap().title, "Do the thing");
    }

    #[tokio::test]
    async fn test_oversized_timeout_is_a_config_error() {
        let mgr = manager(HitlConfig {
            default_timeout_seconds: u64::MAX / 2,
            ..HitlConfig::default()
        });
        let err = mgr
            .create_request(new_request(
                vec![option("a", "task_update", Severity::Medium)],
                None,
            ))
            .unwrap_err();
        assert!(matches!(err, AgentError::ConfigError { .. }));
        assert!(mgr.pending_for("u1").is_empty());
    }

    #[tokio::test]
    async fn test_second_waiter_is_refused() {
        let mgr = Arc::new(manager(HitlConfig::default()));
        let req = mgr
            .create_request(new_request(
                vec![option("a", "task_update", Severity::Medium)],
                None,
            ))
            .unwrap();
        let first = {
            let mgr = mgr.clone();
            let id = req.request_id.clone();
            tokio::spawn(async move { mgr.wait(&id).await })
        };
        tokio::task::yield_now().await;

        let err = mgr.wait(&req.request_id).await.unwrap_err();
        assert!(matches!(err, AgentError::AlreadyWaiting { .. }));

        mgr.respond(ConfirmationResponse::approve(&req.request_id, "a"))
            .unwrap();
        assert_eq!(
            first.await.unwrap().unwrap().status,
            ConfirmationStatus::Approved
        );
    }

    #[tokio::test]
    async fn test_cancel_is_tracked_apart_from_reason() {
        let mgr = manager(HitlConfig::default());
        let opts = || vec![option("a", "task_update", Severity::Medium)];
        let cancelled = mgr.create_request(new_request(opts(), None)).unwrap();
        let rejected = mgr.create_request(new_request(opts(), None)).unwrap();

        mgr.cancel(&cancelled.request_id).unwrap();
        mgr.respond(ConfirmationResponse::reject(&rejected.request_id, Some(CANCELLED_REASON)))
            .unwrap();

        assert!(mgr.was_cancelled(&cancelled.request_id));
        assert!(!mgr.was_cancelled(&rejected.request_id));
    }

    #[tokio::test]
    async fn test_bad_batch_decisions_keep_request_pending() {
        let mgr = manager(HitlConfig::default());
        let mut new = new_request(vec![option("bulk", "task_bulk_create", Severity::High)], None);
        new.context = serde_json::json!({
            "batch": BatchControl::new(
                vec![serde_json::json!({"title": "A"}), serde_json::json!({"title": "B"})],
                true,
                true,
            )
            .to_context()
        });
        let req = mgr.create_request(new).unwrap();

        let err = mgr
            .respond(ConfirmationResponse::modify(
                &req.request_id,
                "bulk",
                serde_json::json!({"decisions": {"item_1": "approve", "item_9": "approve"}}),
            ))
            .unwrap_err();
        assert!(matches!(err, AgentError::InvalidApproval { .. }));
        assert!(err.to_string().contains("item_9"));

        let err = mgr
            .respond(ConfirmationResponse::modify(
                &req.request_id,
                "bulk",
                serde_json::json!({"decisions": {"item_1": "maybe"}}),
            ))
            .unwrap_err();
        assert!(matches!(err, AgentError::InvalidApproval { .. }));
        assert_eq!(mgr.status(&req.request_id), Some(ConfirmationStatus::Pending));

        mgr.respond(ConfirmationResponse::modify(
            &req.request_id,
            "bulk",
            serde_json::json!({"decisions": {"item_1": "approve", "item_2": "reject"}}),
        ))
        .unwrap();
        assert_eq!(mgr.status(&req.request_id), Some(ConfirmationStatus::Modified));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolved_requests_are_pruned_after_retention() {
        let mgr = manager(HitlConfig {
            resolved_retention_seconds: 60,
            ..HitlConfig::default()
        });
        let opts = || vec![option("a", "task_update", Severity::Medium)];
        let old = mgr.create_request(new_request(opts(), None)).unwrap();
        mgr.respond(ConfirmationResponse::approve(&old.request_id, "a"))
            .unwrap();
        mgr.claim_execution(&old.request_id).unwrap();

        tokio::time::advance(Duration::from_secs(30)).await;
        let recent = mgr.create_request(new_request(opts(), None)).unwrap();
        mgr.respond(ConfirmationResponse::reject(&recent.request_id, None))
            .unwrap();
        assert!(mgr.expire_overdue().unwrap().is_empty());
        assert_eq!(mgr.status(&old.request_id), Some(ConfirmationStatus::Approved));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(mgr.expire_overdue().unwrap().is_empty());
        assert_eq!(mgr.status(&old.request_id), None);
        assert!(mgr.get_request(&old.request_id).is_none());
        assert!(matches!(
            mgr.claim_execution(&old.request_id).unwrap_err(),
            AgentError::UnknownRequest { .. }
        ));
        assert_eq!(mgr.status(&recent.request_id), Some(ConfirmationStatus::Rejected));
        {
            let state = mgr.lock().unwrap();
            assert_eq!(state.resolved.len(), 1);
            assert!(state.executed.is_empty());
        }

        // A fresh request also sweeps.
        tokio::time::advance(Duration::from_secs(60)).await;
        mgr.create_request(new_request(opts(), None)).unwrap();
        assert_eq!(mgr.status(&recent.request_id), None);
    }
}
