//! Agent query interface and the agents the executor dispatches to.
//!
//! An agent answers a natural-language query scoped to a workspace. Agents
//! never mutate state themselves: a write is returned as a proposed action
//! and goes through the HITL gate before anything executes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::errors::AgentError;
use super::text::truncate_utf8;
use super::types::{AgentKind, JsonMap};
use crate::config::EngineConfig;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

// ─── Types ──────────────────────────────────────────────────────────────────

/// A write the agent wants performed on the user's behalf.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedAction {
    pub action_type: String,
    #[serde(default)]
    pub parameters: Value,
}

/// Reply from an agent query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResponse {
    pub answer: String,
    #[serde(default = "default_confidence")]
    pub confidence: f32,
    #[serde(default)]
    pub citations: Vec<Value>,
    #[serde(default)]
    pub raw_result: Value,
    #[serde(default)]
    pub proposed_actions: Vec<ProposedAction>,
}

fn default_confidence() -> f32 {
    0.5
}

impl AgentResponse {
    pub fn new(answer: &str, confidence: f32) -> Self {
        Self {
            answer: answer.to_string(),
            confidence,
            citations: Vec::new(),
            raw_result: Value::Null,
            proposed_actions: Vec::new(),
        }
    }

    pub fn with_raw(mut self, raw_result: Value) -> Self {
        self.raw_result = raw_result;
        self
    }

    pub fn with_action(mut self, action_type: &str, parameters: Value) -> Self {
        self.proposed_actions.push(ProposedAction {
            action_type: action_type.to_string(),
            parameters,
        });
        self
    }

    /// Flatten into a step result payload.
    ///
    /// Keys: `answer`, `confidence`, `citations`, `raw_result`, plus every
    /// top-level field of an object `raw_result` that does not collide, so
    /// downstream `context_keys` can name agent fields directly.
    pub fn into_result_map(self, agent: AgentKind) -> JsonMap {
        let mut map = JsonMap::new();
        if let Value::Object(fields) = &self.raw_result {
            for (k, v) in fields {
                map.insert(k.clone(), v.clone());
            }
        }
        map.insert("agent".into(), json!(agent));
        map.insert("answer".into(), Value::String(self.answer));
        map.insert("confidence".into(), json!(self.confidence.clamp(0.0, 1.0)));
        map.insert("citations".into(), Value::Array(self.citations));
        map.insert("raw_result".into(), self.raw_result);
        map
    }
}

// ─── Agent Trait ────────────────────────────────────────────────────────────

#[async_trait]
pub trait Agent: Send + Sync {
    fn kind(&self) -> AgentKind;

    async fn query(
        &self,
        text: &str,
        workspace_id: &str,
        context: &JsonMap,
    ) -> Result<AgentResponse, AgentError>;
}

// ─── HttpAgent ──────────────────────────────────────────────────────────────

/// Agent served over HTTP: `POST {base_url}/query`.
pub struct HttpAgent {
    kind: AgentKind,
    http: HttpClient,
    endpoint: String,
}

impl HttpAgent {
    pub fn new(kind: AgentKind, base_url: &str, timeout: Duration) -> Result<Self, AgentError> {
        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(timeout)
            .build()
            .map_err(|e| AgentError::ConfigError {
                reason: format!("failed to build HTTP client for {kind} agent: {e}"),
            })?;
        Ok(Self {
            kind,
            http,
            endpoint: format!("{}/query", base_url.trim_end_matches('/')),
        })
    }

    fn failed(&self, reason: impl Into<String>) -> AgentError {
        AgentError::AgentFailed {
            agent: self.kind.to_string(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl Agent for HttpAgent {
    fn kind(&self) -> AgentKind {
        self.kind
    }

    async fn query(
        &self,
        text: &str,
        workspace_id: &str,
        context: &JsonMap,
    ) -> Result<AgentResponse, AgentError> {
        let body = json!({
            "query": text,
            "workspace_id": workspace_id,
            "context": context,
        });
        let response = self
            .http
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.failed(format!("request to {} failed: {e}", self.endpoint)))?;

        let status = response.status();
        let body_text = response
            .text()
            .await
            .map_err(|e| self.failed(format!("failed to read response body: {e}")))?;
        if !status.is_success() {
            return Err(self.failed(format!(
                "HTTP {}: {}",
                status.as_u16(),
                truncate_utf8(&body_text, 500)
            )));
        }
        serde_json::from_str(&body_text)
            .map_err(|e| self.failed(format!("malformed agent response: {e}")))
    }
}

// ─── Registry ───────────────────────────────────────────────────────────────

/// Agents by kind.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: HashMap<AgentKind, Arc<dyn Agent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// One HTTP agent per configured endpoint.
    pub fn from_config(config: &EngineConfig) -> Result<Self, AgentError> {
        let timeout = Duration::from_secs(config.executor.step_timeout_seconds);
        let mut registry = Self::new();
        for (kind, endpoint) in &config.agents {
            registry.register(Arc::new(HttpAgent::new(*kind, &endpoint.base_url, timeout)?));
        }
        tracing::info!(agents = registry.agents.len(), "agent registry ready");
        Ok(registry)
    }

    pub fn register(&mut self, agent: Arc<dyn Agent>) {
        self.agents.insert(agent.kind(), agent);
    }

    pub fn get(&self, kind: AgentKind) -> Result<Arc<dyn Agent>, AgentError> {
        self.agents
            .get(&kind)
            .cloned()
            .ok_or_else(|| AgentError::AgentFailed {
                agent: kind.to_string(),
                reason: "no agent configured".into(),
            })
    }
}

// ─── ScriptedAgent ──────────────────────────────────────────────────────────

/// In-process agent with a canned reply, for tests and offline runs.
pub struct ScriptedAgent {
    kind: AgentKind,
    reply: Result<AgentResponse, String>,
    delay: Duration,
    queries: Mutex<Vec<(String, JsonMap)>>,
}

impl ScriptedAgent {
    pub fn answering(kind: AgentKind, response: AgentResponse) -> Self {
        Self {
            kind,
            reply: Ok(response),
            delay: Duration::ZERO,
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(kind: AgentKind, reason: &str) -> Self {
        Self {
            kind,
            reply: Err(reason.to_string()),
            delay: Duration::ZERO,
            queries: Mutex::new(Vec::new()),
        }
    }

    /// Sleep before replying.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Every `(text, context)` this agent was asked.
    pub fn queries(&self) -> Vec<(String, JsonMap)> {
        self.queries.lock().map(|q| q.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    fn kind(&self) -> AgentKind {
        self.kind
    }

    async fn query(
        &self,
        text: &str,
        _workspace_id: &str,
        context: &JsonMap,
    ) -> Result<AgentResponse, AgentError> {
        if let Ok(mut queries) = self.queries.lock() {
            queries.push((text.to_string(), context.clone()));
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.reply.clone().map_err(|reason| AgentError::AgentFailed {
            agent: self.kind.to_string(),
            reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentEndpointConfig;

    #[test]
    fn test_result_map_flattens_raw_fields() {
        let response = AgentResponse::new("2 overdue", 0.9)
            .with_raw(json!({"tasks": [{"title": "A"}], "answer": "shadowed"}));
        let map = response.into_result_map(AgentKind::Task);
        assert_eq!(map["answer"], "2 overdue");
        assert_eq!(map["agent"], "task");
        assert!(map["tasks"].is_array());
        assert!(map.contains_key("raw_result"));
    }

    #[test]
    fn test_response_deserializes_with_defaults() {
        let response: AgentResponse = serde_json::from_str(
            r#"{"answer": "ok", "proposed_actions": [{"action_type": "task_create", "parameters": {"title": "x"}}]}"#,
        )
        .unwrap();
        assert_eq!(response.confidence, 0.5);
        assert!(response.citations.is_empty());
        assert_eq!(response.proposed_actions[0].action_type, "task_create");
    }

    #[tokio::test]
    async fn test_registry_lookup() {
        let mut registry = AgentRegistry::new();
        registry.register(Arc::new(ScriptedAgent::answering(
            AgentKind::Document,
            AgentResponse::new("doc", 0.7),
        )));
        let agent = registry.get(AgentKind::Document).unwrap();
        let reply = agent.query("q", "ws", &JsonMap::new()).await.unwrap();
        assert_eq!(reply.answer, "doc");

        let err = registry.get(AgentKind::Board).err().unwrap();
        assert!(matches!(err, AgentError::AgentFailed { .. }));
    }

    #[tokio::test]
    async fn test_scripted_failure_and_recording() {
        let agent = ScriptedAgent::failing(AgentKind::Task, "backend down");
        let mut ctx = JsonMap::new();
        ctx.insert("k".into(), json!(1));
        let err = agent.query("list", "ws", &ctx).await.unwrap_err();
        assert!(err.to_string().contains("backend down"));
        assert_eq!(agent.queries()[0].1["k"], 1);
    }

    #[test]
    fn test_registry_from_config() {
        let mut config = EngineConfig::default();
        config.agents.insert(
            AgentKind::Task,
            AgentEndpointConfig {
                base_url: "http://localhost:9001/".into(),
            },
        );
        let registry = AgentRegistry::from_config(&config).unwrap();
        assert!(registry.get(AgentKind::Task).is_ok());
        assert!(registry.get(AgentKind::Document).is_err());
    }
}
