//! SQLite audit store for confirmations, executions and rollbacks.
//!
//! Uses `rusqlite` in synchronous mode behind a mutex; every write is a
//! single short statement. WAL mode is enabled so readers never block the
//! state machine.

use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use super::errors::AgentError;
use super::types::{ActionExecutionResult, ConfirmationRequest, ConfirmationResponse};

// ─── Records ────────────────────────────────────────────────────────────────

/// A terminal confirmation as stored.
#[derive(Debug, Clone, Serialize)]
pub struct ConfirmationRecord {
    pub request_id: String,
    pub workspace_id: String,
    pub user_id: String,
    pub agent_name: String,
    pub title: String,
    pub status: String,
    pub selected_option_id: Option<String>,
    pub reason: Option<String>,
    pub created_at: String,
    pub resolved_at: String,
}

/// A stored execution outcome.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionAuditEntry {
    pub id: i64,
    pub request_id: String,
    pub option_id: String,
    pub success: bool,
    pub result: serde_json::Value,
    pub error: Option<String>,
    pub rollback_id: Option<String>,
    pub executed_at: String,
}

// ─── AuditStore ─────────────────────────────────────────────────────────────

/// Durable audit trail of the confirmation protocol.
pub struct AuditStore {
    conn: Mutex<Connection>,
}

impl AuditStore {
    /// Open (or create) the audit database at the given path.
    ///
    /// Pass `":memory:"` for an in-memory database (tests).
    pub fn open(path: &str) -> Result<Self, AgentError> {
        if path != ":memory:" {
            if let Some(parent) = std::path::Path::new(path).parent() {
                std::fs::create_dir_all(parent).map_err(|e| AgentError::DatabaseError {
                    reason: format!("failed to create {}: {e}", parent.display()),
                })?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.create_tables()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, AgentError> {
        self.conn.lock().map_err(|e| AgentError::DatabaseError {
            reason: format!("audit connection poisoned: {e}"),
        })
    }

    fn create_tables(&self) -> Result<(), AgentError> {
        self.conn()?.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS confirmations (
                request_id TEXT PRIMARY KEY,
                workspace_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                agent_name TEXT NOT NULL,
                title TEXT NOT NULL,
                status TEXT NOT NULL,
                selected_option_id TEXT,
                reason TEXT,
                created_at TEXT NOT NULL,
                resolved_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_confirmations_workspace
                ON confirmations(workspace_id);

            CREATE TABLE IF NOT EXISTS executions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                request_id TEXT NOT NULL,
                option_id TEXT NOT NULL,
                success INTEGER NOT NULL,
                result TEXT,
                error TEXT,
                rollback_id TEXT,
                executed_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_executions_request
                ON executions(request_id);

            CREATE TABLE IF NOT EXISTS rollbacks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                rollback_id TEXT NOT NULL,
                action_type TEXT NOT NULL,
                success INTEGER NOT NULL,
                error TEXT,
                timestamp TEXT NOT NULL DEFAULT (datetime('now'))
            );
            ",
        )?;
        Ok(())
    }

    // ─── Confirmations ──────────────────────────────────────────────────

    /// Record a request reaching its terminal state.
    pub fn record_confirmation(
        &self,
        request: &ConfirmationRequest,
        response: &ConfirmationResponse,
    ) -> Result<(), AgentError> {
        self.conn()?.execute(
            "INSERT OR REPLACE INTO confirmations
             (request_id, workspace_id, user_id, agent_name, title, status,
              selected_option_id, reason, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                request.request_id,
                request.workspace_id,
                request.user_id,
                request.agent_name,
                request.title,
                response.status.as_str(),
                response.selected_option_id,
                response.reason,
                request.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_confirmation(
        &self,
        request_id: &str,
    ) -> Result<Option<ConfirmationRecord>, AgentError> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                "SELECT request_id, workspace_id, user_id, agent_name, title, status,
                        selected_option_id, reason, created_at, resolved_at
                 FROM confirmations WHERE request_id = ?1",
                params![request_id],
                |row| {
                    Ok(ConfirmationRecord {
                        request_id: row.get(0)?,
                        workspace_id: row.get(1)?,
                        user_id: row.get(2)?,
                        agent_name: row.get(3)?,
                        title: row.get(4)?,
                        status: row.get(5)?,
                        selected_option_id: row.get(6)?,
                        reason: row.get(7)?,
                        created_at: row.get(8)?,
                        resolved_at: row.get(9)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    // ─── Executions ─────────────────────────────────────────────────────

    pub fn record_execution(&self, execution: &ActionExecutionResult) -> Result<i64, AgentError> {
        let result_json = serde_json::to_string(&execution.result)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO executions
             (request_id, option_id, success, result, error, rollback_id, executed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                execution.request_id,
                execution.option_id,
                execution.success as i32,
                result_json,
                execution.error,
                execution.rollback_id,
                execution.executed_at.to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn executions_for(&self, request_id: &str) -> Result<Vec<ExecutionAuditEntry>, AgentError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, request_id, option_id, success, result, error, rollback_id, executed_at
             FROM executions
             WHERE request_id = ?1
             ORDER BY id ASC",
        )?;

        let rows = stmt.query_map(params![request_id], |row| {
            Ok(ExecutionAuditEntry {
                id: row.get(0)?,
                request_id: row.get(1)?,
                option_id: row.get(2)?,
                success: row.get::<_, i32>(3)? != 0,
                result: row
                    .get::<_, Option<String>>(4)?
                    .map(parse_json_value)
                    .unwrap_or(serde_json::Value::Null),
                error: row.get(5)?,
                rollback_id: row.get(6)?,
                executed_at: row.get(7)?,
            })
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    // ─── Rollbacks ──────────────────────────────────────────────────────

    pub fn record_rollback(
        &self,
        rollback_id: &str,
        action_type: &str,
        success: bool,
        error: Option<&str>,
    ) -> Result<(), AgentError> {
        self.conn()?.execute(
            "INSERT INTO rollbacks (rollback_id, action_type, success, error)
             VALUES (?1, ?2, ?3, ?4)",
            params![rollback_id, action_type, success as i32, error],
        )?;
        Ok(())
    }

    /// Number of successful rollbacks recorded for an id.
    pub fn rollback_count(&self, rollback_id: &str) -> Result<u32, AgentError> {
        let count: i64 = self.conn()?.query_row(
            "SELECT COUNT(*) FROM rollbacks WHERE rollback_id = ?1 AND success = 1",
            params![rollback_id],
            |row| row.get(0),
        )?;
        Ok(count as u32)
    }
}

/// Parse a JSON string into a serde_json::Value, defaulting to null.
fn parse_json_value(json: String) -> serde_json::Value {
    serde_json::from_str(&json).unwrap_or(serde_json::Value::Null)
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_core::actions::Severity;
    use crate::agent_core::types::ActionOption;
    use chrono::Utc;

    fn test_store() -> AuditStore {
        AuditStore::open(":memory:").unwrap()
    }

    fn request() -> ConfirmationRequest {
        let now = Utc::now();
        ConfirmationRequest {
            request_id: "req-1".into(),
            workspace_id: "ws-1".into(),
            user_id: "u1".into(),
            agent_name: "task".into(),
            title: "Reassign task".into(),
            description: String::new(),
            context: serde_json::Value::Null,
            options: vec![ActionOption {
                id: "opt-1".into(),
                label: "Reassign".into(),
                description: String::new(),
                action_type: "task_reassign".into(),
                severity: Severity::High,
                parameters: serde_json::json!({}),
                reversible: true,
            }],
            default_option: None,
            timeout_seconds: 60,
            created_at: now,
            expires_at: now,
        }
    }

    #[test]
    fn test_confirmation_roundtrip() {
        let store = test_store();
        let req = request();
        let resp = ConfirmationResponse::reject("req-1", Some("not now"));
        store.record_confirmation(&req, &resp).unwrap();

        let record = store.get_confirmation("req-1").unwrap().unwrap();
        assert_eq!(record.status, "rejected");
        assert_eq!(record.reason.as_deref(), Some("not now"));
        assert!(store.get_confirmation("missing").unwrap().is_none());
    }

    #[test]
    fn test_execution_log() {
        let store = test_store();
        let execution = ActionExecutionResult {
            request_id: "req-1".into(),
            option_id: "opt-1".into(),
            success: true,
            result: serde_json::json!({"id": "task-1"}),
            error: None,
            rollback_available: true,
            rollback_id: Some("rb-1".into()),
            executed_at: Utc::now(),
        };
        store.record_execution(&execution).unwrap();

        let entries = store.executions_for("req-1").unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].success);
        assert_eq!(entries[0].result["id"], "task-1");
        assert_eq!(entries[0].rollback_id.as_deref(), Some("rb-1"));
    }

    #[test]
    fn test_rollback_count() {
        let store = test_store();
        store.record_rollback("rb-1", "task_create", true, None).unwrap();
        store
            .record_rollback("rb-1", "task_create", false, Some("unknown rollback id"))
            .unwrap();
        assert_eq!(store.rollback_count("rb-1").unwrap(), 1);
    }
}
