//! Shared types for the core-service client.

use serde::{Deserialize, Serialize};

/// Entity families the core service can create and update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Document,
    Task,
    Board,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Document => "document",
            EntityKind::Task => "task",
            EntityKind::Board => "board",
        }
    }

    /// REST collection segment (`/documents`, `/tasks`, `/boards`).
    pub fn collection(&self) -> &'static str {
        match self {
            EntityKind::Document => "documents",
            EntityKind::Task => "tasks",
            EntityKind::Board => "boards",
        }
    }

    /// Name of the id parameter tools expect (`task_id`, ...).
    pub fn id_param(&self) -> &'static str {
        match self {
            EntityKind::Document => "document_id",
            EntityKind::Task => "task_id",
            EntityKind::Board => "board_id",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pull the entity id out of a core-service response body.
///
/// The service answers `{"id": "..."}` for single entities; some routes
/// wrap it as `{"data": {"id": ...}}`. Numeric ids are stringified.
pub fn entity_id(body: &serde_json::Value) -> Option<String> {
    let id = body
        .get("id")
        .or_else(|| body.get("data").and_then(|d| d.get("id")))?;
    match id {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
