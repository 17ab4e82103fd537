//! Action catalog and severity policy.
//!
//! Every write action has a fixed severity. The policy maps a severity and
//! the deployment's [`HitlConfig`] to the interaction a human must provide
//! before the action runs. Evaluation is pure: no I/O, no state.

use serde::{Deserialize, Serialize};

use crate::config::HitlConfig;

// ─── Severity ───────────────────────────────────────────────────────────────

/// How much damage an action can do. Ordered from least to most dangerous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Catalog ────────────────────────────────────────────────────────────────

pub const TASK_CREATE: &str = "task_create";
pub const TASK_UPDATE: &str = "task_update";
pub const TASK_REASSIGN: &str = "task_reassign";
pub const TASK_BULK_CREATE: &str = "task_bulk_create";
pub const TASK_DELETE: &str = "task_delete";
pub const DOCUMENT_CREATE: &str = "document_create";
pub const DOCUMENT_UPDATE: &str = "document_update";
pub const DOCUMENT_DELETE: &str = "document_delete";
pub const BOARD_CREATE: &str = "board_create";
pub const BOARD_UPDATE: &str = "board_update";
pub const BOARD_DELETE: &str = "board_delete";
pub const WORKSPACE_DELETE: &str = "workspace_delete";

/// Static `action_type -> severity` table.
const CATALOG: &[(&str, Severity)] = &[
    (TASK_CREATE, Severity::Low),
    (TASK_UPDATE, Severity::Medium),
    (DOCUMENT_CREATE, Severity::Medium),
    (DOCUMENT_UPDATE, Severity::Medium),
    (BOARD_CREATE, Severity::Medium),
    (BOARD_UPDATE, Severity::Medium),
    (TASK_REASSIGN, Severity::High),
    (TASK_BULK_CREATE, Severity::High),
    (TASK_DELETE, Severity::High),
    (DOCUMENT_DELETE, Severity::Critical),
    (BOARD_DELETE, Severity::Critical),
    (WORKSPACE_DELETE, Severity::Critical),
];

/// Severity of a known action type, `None` if it is not catalogued.
pub fn lookup(action_type: &str) -> Option<Severity> {
    CATALOG
        .iter()
        .find(|(name, _)| *name == action_type)
        .map(|(_, sev)| *sev)
}

/// Severity used for gating. Uncatalogued actions are treated as HIGH.
pub fn severity_of(action_type: &str) -> Severity {
    lookup(action_type).unwrap_or(Severity::High)
}

/// All catalogued action types.
pub fn action_types() -> impl Iterator<Item = &'static str> {
    CATALOG.iter().map(|(name, _)| *name)
}

// ─── Policy ─────────────────────────────────────────────────────────────────

/// What a human must do before an action runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequiredInteraction {
    /// Run immediately and notify.
    AutoExecute,
    /// A single confirmation; may be satisfied by a timeout default.
    Confirm,
    /// Explicit approval; timeouts never approve.
    Approve,
    /// Explicit approval plus a non-empty reason.
    ApproveWithReason,
}

impl RequiredInteraction {
    pub fn needs_human(&self) -> bool {
        !matches!(self, RequiredInteraction::AutoExecute)
    }

    pub fn needs_reason(&self) -> bool {
        matches!(self, RequiredInteraction::ApproveWithReason)
    }

    /// Whether a timeout configured as `default` may stand in for approval.
    pub fn allows_timeout_default(&self) -> bool {
        matches!(self, RequiredInteraction::Confirm)
    }
}

/// Evaluate the policy for a severity under a deployment config.
pub fn required_interaction(severity: Severity, config: &HitlConfig) -> RequiredInteraction {
    if !config.enabled {
        return RequiredInteraction::AutoExecute;
    }
    match severity {
        Severity::Low if config.auto_execute_low => RequiredInteraction::AutoExecute,
        Severity::Low => RequiredInteraction::Confirm,
        Severity::Medium if config.require_confirmation_medium => RequiredInteraction::Confirm,
        Severity::Medium => RequiredInteraction::AutoExecute,
        Severity::High if config.require_approval_high => RequiredInteraction::Approve,
        Severity::High => RequiredInteraction::Confirm,
        Severity::Critical if config.require_reason_critical => {
            RequiredInteraction::ApproveWithReason
        }
        Severity::Critical => RequiredInteraction::Approve,
    }
}

/// Timeout for a confirmation request of the given severity.
pub fn timeout_seconds(severity: Severity, config: &HitlConfig) -> u64 {
    if severity == Severity::Critical {
        config.critical_timeout_seconds
    } else {
        config.default_timeout_seconds
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
