//! Core-service client: trait plus the reqwest implementation.
//!
//! [`HttpCoreService`] is constructed once from config and shared behind an
//! `Arc`; the underlying `reqwest::Client` owns the connection pool and
//! releases it when the last handle is dropped.
//!
//! [`InMemoryCoreService`] is a deterministic stand-in used for local runs
//! and tests. It records every mutation so callers can assert what was sent.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client as HttpClient, Method};
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::errors::CoreServiceError;
use super::types::EntityKind;
use crate::config::CoreServiceConfig;

// ─── Constants ───────────────────────────────────────────────────────────────

/// TCP connection timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Header carrying the client-supplied idempotency key.
const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

// ─── Trait ───────────────────────────────────────────────────────────────────

/// Write interface of the core service.
///
/// Calls are idempotent by intent but not by transport; the HTTP
/// implementation attaches an idempotency key so a retried call is
/// recognised server-side.
#[async_trait]
pub trait CoreService: Send + Sync {
    /// Create an entity in a workspace. Returns the created entity.
    async fn create(
        &self,
        kind: EntityKind,
        workspace_id: &str,
        payload: &Value,
    ) -> Result<Value, CoreServiceError>;

    /// Patch an entity. Returns the updated entity.
    async fn update(&self, kind: EntityKind, id: &str, payload: &Value)
        -> Result<Value, CoreServiceError>;

    /// Fetch the current state of an entity.
    async fn get(&self, kind: EntityKind, id: &str) -> Result<Value, CoreServiceError>;

    /// Delete an entity (used to reverse a creation).
    async fn delete(&self, kind: EntityKind, id: &str) -> Result<(), CoreServiceError>;
}

// ─── HttpCoreService ─────────────────────────────────────────────────────────

/// REST client for the core service.
pub struct HttpCoreService {
    http: HttpClient,
    base_url: String,
    api_key: Option<String>,
}

impl HttpCoreService {
    /// Build a client from config. Does NOT check connectivity.
    pub fn from_config(config: &CoreServiceConfig) -> Result<Self, CoreServiceError> {
        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| CoreServiceError::Config {
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
        })
    }

    /// Send a JSON request and decode the JSON reply.
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, CoreServiceError> {
        let url = format!("{}{path}", self.base_url);
        let mut request = self.http.request(method.clone(), &url);

        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        if let Some(body) = body {
            request = request
                .header(IDEMPOTENCY_HEADER, idempotency_key(method.as_str(), path, body))
                .json(body);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                CoreServiceError::Timeout {
                    endpoint: url.clone(),
                }
            } else {
                CoreServiceError::Transport {
                    endpoint: url.clone(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| CoreServiceError::Transport {
            endpoint: url.clone(),
            reason: format!("failed to read response body: {e}"),
        })?;

        if !status.is_success() {
            tracing::warn!(
                method = %method,
                url = %url,
                status = status.as_u16(),
                "core service call failed"
            );
            return Err(CoreServiceError::Http {
                status: status.as_u16(),
                body: text,
            });
        }

        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| CoreServiceError::Decode {
            reason: format!("{e} (body: {})", crate::agent_core::text::truncate_utf8(&text, 200)),
        })
    }
}

#[async_trait]
impl CoreService for HttpCoreService {
    async fn create(
        &self,
        kind: EntityKind,
        workspace_id: &str,
        payload: &Value,
    ) -> Result<Value, CoreServiceError> {
        let path = format!("/workspaces/{workspace_id}/{}", kind.collection());
        self.send(Method::POST, &path, Some(payload)).await
    }

    async fn update(
        &self,
        kind: EntityKind,
        id: &str,
        payload: &Value,
    ) -> Result<Value, CoreServiceError> {
        let path = format!("/{}/{id}", kind.collection());
        self.send(Method::PATCH, &path, Some(payload)).await
    }

    async fn get(&self, kind: EntityKind, id: &str) -> Result<Value, CoreServiceError> {
        let path = format!("/{}/{id}", kind.collection());
        self.send(Method::GET, &path, None)
            .await
            .map_err(|e| not_found_or(e, kind, id))
    }

    async fn delete(&self, kind: EntityKind, id: &str) -> Result<(), CoreServiceError> {
        let path = format!("/{}/{id}", kind.collection());
        self.send(Method::DELETE, &path, None)
            .await
            .map(|_| ())
            .map_err(|e| not_found_or(e, kind, id))
    }
}

/// Map a 404 into `NotFound`, pass everything else through.
fn not_found_or(err: CoreServiceError, kind: EntityKind, id: &str) -> CoreServiceError {
    match err {
        CoreServiceError::Http { status: 404, .. } => CoreServiceError::NotFound {
            kind: kind.to_string(),
            id: id.to_string(),
        },
        other => other,
    }
}

/// Deterministic key for a logical request: same method, path and body
/// always produce the same key, so a transport retry is deduplicated.
pub fn idempotency_key(method: &str, path: &str, body: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.as_bytes());
    hasher.update(b" ");
    hasher.update(path.as_bytes());
    hasher.update(b"\n");
    hasher.update(body.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

// ─── InMemoryCoreService ─────────────────────────────────────────────────────

/// A recorded mutation against [`InMemoryCoreService`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub operation: &'static str,
    pub kind: EntityKind,
    pub target: String,
    pub payload: Value,
}

#[derive(Default)]
struct InMemoryState {
    entities: HashMap<(EntityKind, String), Value>,
    calls: Vec<RecordedCall>,
    next_id: u64,
    transient_failures: u32,
    reject_titles: Vec<String>,
}

/// In-process core service: stores entities in a map and records calls.
#[derive(Default)]
pub struct InMemoryCoreService {
    state: Mutex<InMemoryState>,
}

impl InMemoryCoreService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` mutating calls with a retryable 503.
    pub fn fail_next(&self, n: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.transient_failures = n;
        }
    }

    /// Reject (HTTP 422) any create whose `title` equals `title`.
    pub fn reject_title(&self, title: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.reject_titles.push(title.to_string());
        }
    }

    /// Seed an existing entity.
    pub fn insert(&self, kind: EntityKind, id: &str, entity: Value) {
        if let Ok(mut state) = self.state.lock() {
            state.entities.insert((kind, id.to_string()), entity);
        }
    }

    /// All mutating calls received so far, in order.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.lock().map(|s| s.calls.clone()).unwrap_or_default()
    }

    /// Current number of stored entities of a kind.
    pub fn count(&self, kind: EntityKind) -> usize {
        self.state
            .lock()
            .map(|s| s.entities.keys().filter(|(k, _)| *k == kind).count())
            .unwrap_or(0)
    }

    /// Current state of an entity, if present.
    pub fn entity(&self, kind: EntityKind, id: &str) -> Option<Value> {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.entities.get(&(kind, id.to_string())).cloned())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, InMemoryState>, CoreServiceError> {
        self.state.lock().map_err(|e| CoreServiceError::Transport {
            endpoint: "memory".into(),
            reason: format!("lock poisoned: {e}"),
        })
    }
}

impl InMemoryState {
    fn take_transient_failure(&mut self) -> Result<(), CoreServiceError> {
        if self.transient_failures > 0 {
            self.transient_failures -= 1;
            return Err(CoreServiceError::Http {
                status: 503,
                body: "service unavailable".into(),
            });
        }
        Ok(())
    }

    fn create_one(
        &mut self,
        kind: EntityKind,
        workspace_id: &str,
        payload: &Value,
    ) -> Result<Value, CoreServiceError> {
        let title = payload.get("title").and_then(|v| v.as_str()).unwrap_or("");
        if self.reject_titles.iter().any(|t| t == title) {
            return Err(CoreServiceError::Http {
                status: 422,
                body: format!("rejected title '{title}'"),
            });
        }

        self.next_id += 1;
        let id = format!("{}-{}", kind.as_str(), self.next_id);
        let mut entity = payload.clone();
        if let Some(obj) = entity.as_object_mut() {
            obj.insert("id".into(), Value::String(id.clone()));
            obj.insert("workspace_id".into(), Value::String(workspace_id.to_string()));
        }
        self.entities.insert((kind, id.clone()), entity.clone());
        self.calls.push(RecordedCall {
            operation: "create",
            kind,
            target: workspace_id.to_string(),
            payload: payload.clone(),
        });
        Ok(entity)
    }
}

#[async_trait]
impl CoreService for InMemoryCoreService {
    async fn create(
        &self,
        kind: EntityKind,
        workspace_id: &str,
        payload: &Value,
    ) -> Result<Value, CoreServiceError> {
        let mut state = self.lock()?;
        state.take_transient_failure()?;
        state.create_one(kind, workspace_id, payload)
    }

    async fn update(
        &self,
        kind: EntityKind,
        id: &str,
        payload: &Value,
    ) -> Result<Value, CoreServiceError> {
        let mut state = self.lock()?;
        state.take_transient_failure()?;
        let key = (kind, id.to_string());
        let entity = state
            .entities
            .get_mut(&key)
            .ok_or_else(|| CoreServiceError::NotFound {
                kind: kind.to_string(),
                id: id.to_string(),
            })?;
        if let (Some(target), Some(patch)) = (entity.as_object_mut(), payload.as_object()) {
            for (k, v) in patch {
                target.insert(k.clone(), v.clone());
            }
        }
        let updated = entity.clone();
        state.calls.push(RecordedCall {
            operation: "update",
            kind,
            target: id.to_string(),
            payload: payload.clone(),
        });
        Ok(updated)
    }

    async fn get(&self, kind: EntityKind, id: &str) -> Result<Value, CoreServiceError> {
        let state = self.lock()?;
        state
            .entities
            .get(&(kind, id.to_string()))
            .cloned()
            .ok_or_else(|| CoreServiceError::NotFound {
                kind: kind.to_string(),
                id: id.to_string(),
            })
    }

    async fn delete(&self, kind: EntityKind, id: &str) -> Result<(), CoreServiceError> {
        let mut state = self.lock()?;
        state.take_transient_failure()?;
        if state.entities.remove(&(kind, id.to_string())).is_none() {
            return Err(CoreServiceError::NotFound {
                kind: kind.to_string(),
                id: id.to_string(),
            });
        }
        state.calls.push(RecordedCall {
            operation: "delete",
            kind,
            target: id.to_string(),
            payload: Value::Null,
        });
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idempotency_key_is_stable() {
        let body = serde_json::json!({"title": "Write report"});
        let a = idempotency_key("POST", "/workspaces/w1/tasks", &body);
        let b = idempotency_key("POST", "/workspaces/w1/tasks", &body);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        let other = idempotency_key("POST", "/workspaces/w2/tasks", &body);
        assert_ne!(a, other);
    }

    #[test]
    fn test_http_client_trims_base_url() {
        let config = CoreServiceConfig {
            base_url: "http://localhost:8000/api/".into(),
            api_key: Some(String::new()),
            timeout_seconds: 5,
        };
        let client = HttpCoreService::from_config(&config).unwrap();
        assert_eq!(client.base_url, "http://localhost:8000/api");
        assert!(client.api_key.is_none());
    }

    #[test]
    fn test_not_found_mapping() {
        let err = not_found_or(
            CoreServiceError::Http {
                status: 404,
                body: String::new(),
            },
            EntityKind::Task,
            "t9",
        );
        assert!(matches!(err, CoreServiceError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_in_memory_create_update_delete() {
        let core = InMemoryCoreService::new();
        let created = core
            .create(EntityKind::Task, "w1", &serde_json::json!({"title": "A"}))
            .await
            .unwrap();
        let id = created["id"].as_str().unwrap().to_string();

        let updated = core
            .update(EntityKind::Task, &id, &serde_json::json!({"status": "done"}))
            .await
            .unwrap();
        assert_eq!(updated["status"], "done");
        assert_eq!(updated["title"], "A");

        core.delete(EntityKind::Task, &id).await.unwrap();
        assert_eq!(core.count(EntityKind::Task), 0);
        assert_eq!(core.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_in_memory_transient_failures() {
        let core = InMemoryCoreService::new();
        core.fail_next(1);
        let err = core
            .create(EntityKind::Board, "w1", &serde_json::json!({"name": "Q3"}))
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        assert!(core
            .create(EntityKind::Board, "w1", &serde_json::json!({"name": "Q3"}))
            .await
            .is_ok());
    }
}
