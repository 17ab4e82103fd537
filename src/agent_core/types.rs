//! Shared types for the agent core.
//!
//! Intents, execution plans, step results, tool previews/results and the
//! confirmation protocol types used across the planner, executor and gate.
//! Constructors validate what can be validated up front so the rest of the
//! engine can trust the invariants.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::actions::Severity;

/// String-keyed JSON object used for step payloads and entities.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

// ─── Intent ─────────────────────────────────────────────────────────────────

/// Classified purpose of a user query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntentType {
    DocumentQuery,
    DocumentSummary,
    DocumentSearch,
    DocumentCreate,
    DocumentUpdate,
    TaskQuery,
    TaskStatus,
    TaskAnalytics,
    TaskCreate,
    TaskUpdate,
    TaskAssign,
    BoardQuery,
    BoardCreate,
    BoardUpdate,
    HybridQuery,
    WorkspaceOverview,
    Unknown,
}

impl IntentType {
    /// Whether the intent asks for a mutation of workspace state.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            IntentType::DocumentCreate
                | IntentType::DocumentUpdate
                | IntentType::TaskCreate
                | IntentType::TaskUpdate
                | IntentType::TaskAssign
                | IntentType::BoardCreate
                | IntentType::BoardUpdate
        )
    }

    /// The agent that owns this intent type.
    pub fn default_agent(&self) -> AgentKind {
        match self {
            IntentType::DocumentQuery
            | IntentType::DocumentSummary
            | IntentType::DocumentSearch
            | IntentType::DocumentCreate
            | IntentType::DocumentUpdate => AgentKind::Document,
            IntentType::TaskQuery
            | IntentType::TaskStatus
            | IntentType::TaskAnalytics
            | IntentType::TaskCreate
            | IntentType::TaskUpdate
            | IntentType::TaskAssign => AgentKind::Task,
            IntentType::BoardQuery | IntentType::BoardCreate | IntentType::BoardUpdate => {
                AgentKind::Board
            }
            IntentType::HybridQuery | IntentType::WorkspaceOverview | IntentType::Unknown => {
                AgentKind::Both
            }
        }
    }

    /// Parse the wire name (`TASK_QUERY`, `task_query`).
    pub fn parse(s: &str) -> Option<Self> {
        serde_json::from_value(serde_json::Value::String(s.trim().to_uppercase())).ok()
    }
}

/// Which agent(s) handle an intent or step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Document,
    Task,
    Board,
    Both,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Document => "document",
            AgentKind::Task => "task",
            AgentKind::Board => "board",
            AgentKind::Both => "both",
        }
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified query. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intent {
    #[serde(rename = "type")]
    pub intent_type: IntentType,
    /// Calibration signal in [0, 1]; never gates execution on its own.
    pub confidence: f32,
    pub agent: AgentKind,
    pub reasoning: String,
    #[serde(default)]
    pub entities: HashMap<String, String>,
    #[serde(default)]
    pub requires_decomposition: bool,
}

impl Intent {
    /// Build an intent, clamping confidence into [0, 1].
    pub fn new(
        intent_type: IntentType,
        confidence: f32,
        agent: AgentKind,
        reasoning: impl Into<String>,
    ) -> Self {
        let confidence = if confidence.is_finite() {
            confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            intent_type,
            confidence,
            agent,
            reasoning: reasoning.into(),
            entities: HashMap::new(),
            requires_decomposition: false,
        }
    }

    /// The intent returned for anything that cannot be classified.
    pub fn unknown(reasoning: impl Into<String>) -> Self {
        Self::new(IntentType::Unknown, 0.0, AgentKind::Both, reasoning)
    }

    pub fn with_entities(mut self, entities: HashMap<String, String>) -> Self {
        self.entities = entities;
        self
    }

    pub fn with_decomposition(mut self, requires_decomposition: bool) -> Self {
        self.requires_decomposition = requires_decomposition;
        self
    }
}

/// One prior turn of the conversation, used as classification context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    /// `user` or `assistant`.
    pub role: String,
    pub content: String,
}

impl ConversationTurn {
    pub fn user(content: &str) -> Self {
        Self {
            role: "user".into(),
            content: content.to_string(),
        }
    }

    pub fn assistant(content: &str) -> Self {
        Self {
            role: "assistant".into(),
            content: content.to_string(),
        }
    }
}

// ─── Execution Plan ─────────────────────────────────────────────────────────

/// What a plan step does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    QueryDocument,
    QueryTask,
    QueryBoard,
    Synthesize,
    Validate,
}

impl StepType {
    /// The query step type for an agent (`Both` has none).
    pub fn query_for(agent: AgentKind) -> Option<Self> {
        match agent {
            AgentKind::Document => Some(StepType::QueryDocument),
            AgentKind::Task => Some(StepType::QueryTask),
            AgentKind::Board => Some(StepType::QueryBoard),
            AgentKind::Both => None,
        }
    }
}

/// One node of an execution plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub step_id: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    pub agent: AgentKind,
    pub query: String,
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    /// Names of upstream result fields this step needs.
    #[serde(default)]
    pub context_keys: Vec<String>,
    #[serde(default)]
    pub reasoning: String,
}

/// Rough size of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    Medium,
    Complex,
}

impl Complexity {
    pub fn from_step_count(n: usize) -> Self {
        match n {
            0 | 1 => Complexity::Simple,
            2..=3 => Complexity::Medium,
            _ => Complexity::Complex,
        }
    }
}

/// Ordered, dependency-consistent set of steps for one query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub plan_id: String,
    pub original_query: String,
    pub steps: Vec<ExecutionStep>,
    pub estimated_complexity: Complexity,
    pub requires_synthesis: bool,
    #[serde(default)]
    pub reasoning: String,
    /// Confidence of the intent this plan came from (1.0 for hand-authored plans).
    #[serde(default = "default_intent_confidence")]
    pub intent_confidence: f32,
}

fn default_intent_confidence() -> f32 {
    1.0
}

impl ExecutionPlan {
    pub fn step(&self, step_id: &str) -> Option<&ExecutionStep> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }
}

/// Outcome of one attempted step. Immutable once recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub success: bool,
    pub result: JsonMap,
    pub error: Option<String>,
    pub execution_time_ms: u64,
}

impl StepResult {
    pub fn ok(step_id: &str, result: JsonMap, execution_time_ms: u64) -> Self {
        Self {
            step_id: step_id.to_string(),
            success: true,
            result,
            error: None,
            execution_time_ms,
        }
    }

    pub fn failed(step_id: &str, error: impl Into<String>, execution_time_ms: u64) -> Self {
        Self {
            step_id: step_id.to_string(),
            success: false,
            result: JsonMap::new(),
            error: Some(error.into()),
            execution_time_ms,
        }
    }
}

/// Final answer for a plan plus every step outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanExecutionResult {
    pub plan_id: String,
    /// True when synthesis produced an answer, regardless of individual steps.
    pub success: bool,
    /// One entry per attempted step, in completion order.
    pub step_results: Vec<StepResult>,
    pub final_answer: String,
    pub confidence: f32,
    pub total_time_ms: u64,
    #[serde(default)]
    pub metadata: JsonMap,
}

// ─── Tools ──────────────────────────────────────────────────────────────────

/// Human-readable description of what a tool call would do.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolPreview {
    pub action: String,
    pub summary: String,
    pub details: JsonMap,
    pub estimated_impact: String,
    pub risks: Vec<String>,
    pub reversible: bool,
    pub estimated_time_ms: u64,
}

/// Result status of a tool execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Success,
    Failed,
    Partial,
}

/// Outcome of one `Tool::execute` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub status: ToolStatus,
    pub data: serde_json::Value,
    pub error: Option<String>,
    /// Present iff the tool is reversible and the execution succeeded (fully or partially).
    pub rollback_id: Option<String>,
    #[serde(default)]
    pub rollback_metadata: serde_json::Value,
    pub execution_time_ms: u64,
}

impl ToolResult {
    pub fn is_success(&self) -> bool {
        self.status != ToolStatus::Failed
    }
}

// ─── Confirmation Protocol ──────────────────────────────────────────────────

/// One selectable action attached to a confirmation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionOption {
    pub id: String,
    pub label: String,
    pub description: String,
    pub action_type: String,
    pub severity: Severity,
    pub parameters: serde_json::Value,
    pub reversible: bool,
}

/// A question put to a human before a mutating action runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmationRequest {
    pub request_id: String,
    pub workspace_id: String,
    pub user_id: String,
    pub agent_name: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub context: serde_json::Value,
    /// At least one option.
    pub options: Vec<ActionOption>,
    /// Option applied on timeout when the deployment's timeout action is `default`.
    pub default_option: Option<String>,
    pub timeout_seconds: u64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ConfirmationRequest {
    pub fn option(&self, option_id: &str) -> Option<&ActionOption> {
        self.options.iter().find(|o| o.id == option_id)
    }

    /// Highest severity across all options.
    pub fn max_severity(&self) -> Severity {
        self.options
            .iter()
            .map(|o| o.severity)
            .max()
            .unwrap_or(Severity::Low)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Lifecycle state of a confirmation request. All but `Pending` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationStatus {
    Pending,
    Approved,
    Rejected,
    Modified,
    Timeout,
}

impl ConfirmationStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ConfirmationStatus::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConfirmationStatus::Pending => "pending",
            ConfirmationStatus::Approved => "approved",
            ConfirmationStatus::Rejected => "rejected",
            ConfirmationStatus::Modified => "modified",
            ConfirmationStatus::Timeout => "timeout",
        }
    }
}

/// A human's (or the timeout rule's) answer to a confirmation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmationResponse {
    pub request_id: String,
    pub status: ConfirmationStatus,
    #[serde(default)]
    pub selected_option_id: Option<String>,
    #[serde(default)]
    pub modified_parameters: Option<serde_json::Value>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl ConfirmationResponse {
    pub fn approve(request_id: &str, option_id: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            status: ConfirmationStatus::Approved,
            selected_option_id: Some(option_id.to_string()),
            modified_parameters: None,
            reason: None,
        }
    }

    pub fn reject(request_id: &str, reason: Option<&str>) -> Self {
        Self {
            request_id: request_id.to_string(),
            status: ConfirmationStatus::Rejected,
            selected_option_id: None,
            modified_parameters: None,
            reason: reason.map(String::from),
        }
    }

    pub fn modify(request_id: &str, option_id: &str, parameters: serde_json::Value) -> Self {
        Self {
            request_id: request_id.to_string(),
            status: ConfirmationStatus::Modified,
            selected_option_id: Some(option_id.to_string()),
            modified_parameters: Some(parameters),
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: &str) -> Self {
        self.reason = Some(reason.to_string());
        self
    }
}

/// Terminal record of what happened after a response was applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionExecutionResult {
    pub request_id: String,
    pub option_id: String,
    pub success: bool,
    pub result: serde_json::Value,
    pub error: Option<String>,
    pub rollback_available: bool,
    pub rollback_id: Option<String>,
    pub executed_at: DateTime<Utc>,
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intent_type_wire_names() {
        let json = serde_json::to_string(&IntentType::TaskQuery).unwrap();
        assert_eq!(json, "\"TASK_QUERY\"");
        assert_eq!(IntentType::parse("task_assign"), Some(IntentType::TaskAssign));
        assert_eq!(IntentType::parse("nonsense"), None);
    }

    #[test]
    fn test_intent_confidence_is_clamped() {
        let intent = Intent::new(IntentType::TaskQuery, 1.7, AgentKind::Task, "");
        assert_eq!(intent.confidence, 1.0);
        let intent = Intent::new(IntentType::TaskQuery, f32::NAN, AgentKind::Task, "");
        assert_eq!(intent.confidence, 0.0);
    }

    #[test]
    fn test_unknown_intent_shape() {
        let intent = Intent::unknown("no signal");
        assert_eq!(intent.intent_type, IntentType::Unknown);
        assert_eq!(intent.confidence, 0.0);
        assert_eq!(intent.agent, AgentKind::Both);
    }

    #[test]
    fn test_write_intents() {
        assert!(IntentType::TaskAssign.is_write());
        assert!(IntentType::BoardCreate.is_write());
        assert!(!IntentType::TaskAnalytics.is_write());
        assert_eq!(IntentType::DocumentSearch.default_agent(), AgentKind::Document);
    }

    #[test]
    fn test_complexity_from_step_count() {
        assert_eq!(Complexity::from_step_count(1), Complexity::Simple);
        assert_eq!(Complexity::from_step_count(3), Complexity::Medium);
        assert_eq!(Complexity::from_step_count(5), Complexity::Complex);
    }

    #[test]
    fn test_execution_step_deserialization_defaults() {
        let step: ExecutionStep = serde_json::from_str(
            r#"{"step_id":"s1","type":"query_task","agent":"task","query":"overdue?"}"#,
        )
        .unwrap();
        assert!(step.dependencies.is_empty());
        assert!(step.context_keys.is_empty());
        assert_eq!(step.step_type, StepType::QueryTask);
    }

    #[test]
    fn test_confirmation_response_builders() {
        let resp = ConfirmationResponse::approve("r1", "opt").with_reason("ok");
        assert_eq!(resp.status, ConfirmationStatus::Approved);
        assert_eq!(resp.selected_option_id.as_deref(), Some("opt"));
        assert_eq!(resp.reason.as_deref(), Some("ok"));

        let json = serde_json::to_string(&ConfirmationStatus::Timeout).unwrap();
        assert_eq!(json, "\"timeout\"");
        assert!(ConfirmationStatus::Rejected.is_terminal());
        assert!(!ConfirmationStatus::Pending.is_terminal());
    }
}
