//! Agent Core: plan execution engine with human-in-the-loop gating.
//!
//! Submodules:
//! - `intent`: Intent classifier (model JSON with keyword fallback)
//! - `plan_builder`: Intent → execution plan, plan validation, JSON plans
//! - `executor`: DAG scheduler over agents with partial-failure tolerance
//! - `synthesis`: Final answer from step results (model, template, fallback)
//! - `orchestrator`: classify → plan → execute entry point
//! - `agents`: Agent query interface, HTTP and scripted agents
//! - `actions`: Action catalog, severities, approval policy
//! - `tools`: Write-capable tools over the core service, with rollback
//! - `retry`: Bounded exponential backoff for transient failures
//! - `confirmation`: Confirmation state machine with timeouts
//! - `batch`: Per-item approval for bulk actions
//! - `gate`: Tool → policy → confirmation → execute, at most once
//! - `notify`: Fire-and-forget user notifications
//! - `database`: SQLite audit store for confirmations, executions, rollbacks
//! - `text`: UTF-8 safe truncation and summaries
//! - `types`: Shared types across the agent core
//! - `errors`: Agent-level error types

pub mod actions;
pub mod agents;
pub mod batch;
pub mod confirmation;
pub mod database;
pub mod errors;
pub mod executor;
pub mod gate;
pub mod intent;
pub mod notify;
pub mod orchestrator;
pub mod plan_builder;
pub mod retry;
pub mod synthesis;
pub mod text;
pub mod tools;
pub mod types;

// Re-exports for convenience
pub use actions::{RequiredInteraction, Severity};
pub use agents::{Agent, AgentRegistry, AgentResponse, HttpAgent, ProposedAction, ScriptedAgent};
pub use batch::{BatchControl, BatchController, BatchItem, BatchItemStatus};
pub use confirmation::{ConfirmationManager, NewConfirmation};
pub use database::AuditStore;
pub use errors::{AgentError, ErrorKind};
pub use executor::{ExecutionScope, PlanExecutor};
pub use gate::{ActionContext, GateOutcome, GateStatus, HitlGate};
pub use intent::IntentClassifier;
pub use notify::{ChannelNotifier, LogNotifier, Notification, NotificationEvent, Notifier};
pub use orchestrator::Orchestrator;
pub use retry::RetryPolicy;
pub use synthesis::{Synthesis, SynthesisMode, Synthesizer};
pub use tools::{Tool, ToolContext, ToolRegistry};
pub use types::{
    ActionExecutionResult, ActionOption, AgentKind, Complexity, ConfirmationRequest,
    ConfirmationResponse, ConfirmationStatus, ConversationTurn, ExecutionPlan, ExecutionStep,
    Intent, IntentType, PlanExecutionResult, StepResult, StepType, ToolPreview, ToolResult,
    ToolStatus,
};
