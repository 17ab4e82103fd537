//! Agent Core error types.

use thiserror::Error;

use crate::core_client::errors::CoreServiceError;

/// Coarse classification of an [`AgentError`].
///
/// Callers branch on the kind rather than matching every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidParameters,
    InvalidPlan,
    MissingContext,
    RequestAlreadyResolved,
    AlreadyWaiting,
    UnknownRollbackId,
    RollbackUnsupported,
    InvalidApproval,
    UnknownRequest,
    UnknownAction,
    CoreService,
    Agent,
    Database,
    Serialization,
    Config,
}

/// Errors that can occur during agent core operations.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Tool input is malformed. Caller's fault, never retried.
    #[error("invalid parameters for '{action}': {reason}")]
    InvalidParameters { action: String, reason: String },

    /// Plan has a cycle, a dangling dependency or a duplicate step id.
    #[error("invalid plan: {reason}")]
    InvalidPlan { reason: String },

    /// An upstream step result lacks a key this step needs.
    #[error("step '{step_id}' is missing context key '{key}'")]
    MissingContext { step_id: String, key: String },

    /// A response arrived for a request that already reached a terminal state.
    #[error("confirmation request '{request_id}' is already resolved")]
    RequestAlreadyResolved { request_id: String },

    /// A second waiter asked for a request that already has one.
    #[error("confirmation request '{request_id}' is already being waited on")]
    AlreadyWaiting { request_id: String },

    /// Rollback id was never issued by this tool, or was already rolled back.
    #[error("unknown rollback id '{rollback_id}'")]
    UnknownRollbackId { rollback_id: String },

    /// The tool cannot undo its own executions.
    #[error("action '{action}' does not support rollback")]
    RollbackUnsupported { action: String },

    /// The response is not acceptable for the request (request stays pending).
    #[error("invalid approval for request '{request_id}': {reason}")]
    InvalidApproval { request_id: String, reason: String },

    /// No confirmation request with this id exists.
    #[error("unknown confirmation request '{request_id}'")]
    UnknownRequest { request_id: String },

    /// No tool is registered for the action type.
    #[error("no tool registered for action '{action}'")]
    UnknownAction { action: String },

    /// Core-service call failed after the retry budget was spent.
    #[error("core service error: {0}")]
    CoreService(#[from] CoreServiceError),

    /// An agent query failed (transport, timeout or malformed reply).
    #[error("agent '{agent}' failed: {reason}")]
    AgentFailed { agent: String, reason: String },

    /// Database operation failed.
    #[error("database error: {reason}")]
    DatabaseError { reason: String },

    /// Serialization error.
    #[error("serialization error: {reason}")]
    SerializationError { reason: String },

    /// Configuration loading or validation error.
    #[error("config error: {reason}")]
    ConfigError { reason: String },
}

impl AgentError {
    /// The taxonomy bucket this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentError::InvalidParameters { .. } => ErrorKind::InvalidParameters,
            AgentError::InvalidPlan { .. } => ErrorKind::InvalidPlan,
            AgentError::MissingContext { .. } => ErrorKind::MissingContext,
            AgentError::RequestAlreadyResolved { .. } => ErrorKind::RequestAlreadyResolved,
            AgentError::AlreadyWaiting { .. } => ErrorKind::AlreadyWaiting,
            AgentError::UnknownRollbackId { .. } => ErrorKind::UnknownRollbackId,
            AgentError::RollbackUnsupported { .. } => ErrorKind::RollbackUnsupported,
            AgentError::InvalidApproval { .. } => ErrorKind::InvalidApproval,
            AgentError::UnknownRequest { .. } => ErrorKind::UnknownRequest,
            AgentError::UnknownAction { .. } => ErrorKind::UnknownAction,
            AgentError::CoreService(_) => ErrorKind::CoreService,
            AgentError::AgentFailed { .. } => ErrorKind::Agent,
            AgentError::DatabaseError { .. } => ErrorKind::Database,
            AgentError::SerializationError { .. } => ErrorKind::Serialization,
            AgentError::ConfigError { .. } => ErrorKind::Config,
        }
    }

    /// Whether retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            AgentError::CoreService(e) => e.is_retryable(),
            _ => false,
        }
    }

    pub(crate) fn invalid_params(action: &str, reason: impl Into<String>) -> Self {
        AgentError::InvalidParameters {
            action: action.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<rusqlite::Error> for AgentError {
    fn from(e: rusqlite::Error) -> Self {
        AgentError::DatabaseError {
            reason: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        AgentError::SerializationError {
            reason: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_maps_protocol_errors() {
        let err = AgentError::RequestAlreadyResolved {
            request_id: "r1".into(),
        };
        assert_eq!(err.kind(), ErrorKind::RequestAlreadyResolved);

        let err = AgentError::UnknownRollbackId {
            rollback_id: "rb".into(),
        };
        assert_eq!(err.kind(), ErrorKind::UnknownRollbackId);
        assert!(err.to_string().contains("rb"));
    }

    #[test]
    fn test_only_transient_core_errors_are_retryable() {
        let transient = AgentError::CoreService(CoreServiceError::Http {
            status: 503,
            body: "unavailable".into(),
        });
        assert!(transient.is_retryable());

        let client_fault = AgentError::CoreService(CoreServiceError::Http {
            status: 422,
            body: "bad".into(),
        });
        assert!(!client_fault.is_retryable());

        assert!(!AgentError::invalid_params("task_create", "missing title").is_retryable());
    }

    #[test]
    fn test_serde_error_converts() {
        let e = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: AgentError = e.into();
        assert_eq!(err.kind(), ErrorKind::Serialization);
    }
}
