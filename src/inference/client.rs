//! OpenAI-compatible inference client.
//!
//! The engine treats the model as a black box: `infer(prompt) -> text`.
//! Classification and synthesis prompts are single user turns under a short
//! system prompt, sent non-streaming.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;

use super::errors::InferenceError;
use super::types::{ChatCompletionRequest, ChatCompletionResponse, ChatMessage};
use crate::agent_core::text::truncate_utf8;
use crate::config::ModelConfig;

// ─── Constants ───────────────────────────────────────────────────────────────

/// TCP connection timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const SYSTEM_PROMPT: &str = "You are the planning and synthesis component of a workspace \
assistant. Follow the output format requested in the user message exactly.";

// ─── LanguageModel ───────────────────────────────────────────────────────────

/// Text-in, text-out model.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn infer(&self, prompt: &str) -> Result<String, InferenceError>;

    /// Model identifier for logs.
    fn name(&self) -> &str;
}

// ─── InferenceClient ─────────────────────────────────────────────────────────

/// Client for an OpenAI-compatible chat completions endpoint.
pub struct InferenceClient {
    http: HttpClient,
    config: ModelConfig,
}

impl InferenceClient {
    /// Create a client. Does NOT check connectivity; that happens on the first request.
    pub fn from_config(config: ModelConfig) -> Result<Self, InferenceError> {
        if config.base_url.trim().is_empty() {
            return Err(InferenceError::ConfigError {
                reason: "model base_url is empty".into(),
            });
        }
        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| InferenceError::ConnectionFailed {
                endpoint: config.base_url.clone(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { http, config })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl LanguageModel for InferenceClient {
    async fn infer(&self, prompt: &str) -> Result<String, InferenceError> {
        let url = self.endpoint();
        let body = ChatCompletionRequest {
            model: self.config.model_name.clone(),
            messages: vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(prompt)],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            stream: false,
        };

        let mut request = self.http.post(&url).json(&body);
        if let Some(key) = self.config.api_key.as_deref().filter(|k| !k.is_empty()) {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                InferenceError::Timeout {
                    duration_secs: self.config.timeout_seconds,
                }
            } else {
                InferenceError::ConnectionFailed {
                    endpoint: url.clone(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(InferenceError::HttpError {
                status: status.as_u16(),
                body: truncate_utf8(&body_text, 2000).to_string(),
            });
        }

        let body_text = response
            .text()
            .await
            .map_err(|e| InferenceError::MalformedResponse {
                reason: format!("failed to read response body: {e}"),
            })?;
        let text = parse_completion(&body_text)?;

        tracing::debug!(
            model = %self.config.model_name,
            prompt_len = prompt.len(),
            response_len = text.len(),
            "inference complete"
        );
        Ok(text)
    }

    fn name(&self) -> &str {
        &self.config.model_name
    }
}

/// Pull the assistant text out of a completion body.
///
/// Falls back to `reasoning` when `content` is empty, which reasoning models
/// do when they run out of tokens mid-answer.
pub fn parse_completion(body: &str) -> Result<String, InferenceError> {
    let resp: ChatCompletionResponse =
        serde_json::from_str(body).map_err(|e| InferenceError::MalformedResponse {
            reason: format!("failed to parse completion: {e}"),
        })?;
    let choice = resp
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| InferenceError::MalformedResponse {
            reason: "completion has no choices".into(),
        })?;
    let text = choice
        .message
        .content
        .filter(|c| !c.trim().is_empty())
        .or(choice.message.reasoning)
        .unwrap_or_default();
    if text.trim().is_empty() {
        return Err(InferenceError::MalformedResponse {
            reason: "completion is empty".into(),
        });
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model_config(base_url: &str) -> ModelConfig {
        ModelConfig {
            base_url: base_url.into(),
            model_name: "test-model".into(),
            api_key: None,
            temperature: 0.1,
            max_tokens: 256,
            timeout_seconds: 5,
        }
    }

    #[test]
    fn test_parse_completion_content() {
        let body = r#"{"choices":[{"message":{"content":"TASK_QUERY"},"finish_reason":"stop"}]}"#;
        assert_eq!(parse_completion(body).unwrap(), "TASK_QUERY");
    }

    #[test]
    fn test_parse_completion_falls_back_to_reasoning() {
        let body = r#"{"choices":[{"message":{"content":"","reasoning":"thinking..."}}]}"#;
        assert_eq!(parse_completion(body).unwrap(), "thinking...");
    }

    #[test]
    fn test_parse_completion_errors() {
        assert!(parse_completion("not json").is_err());
        assert!(parse_completion(r#"{"choices":[]}"#).is_err());
        assert!(parse_completion(r#"{"choices":[{"message":{"content":"  "}}]}"#).is_err());
    }

    #[test]
    fn test_endpoint_trims_slash() {
        let client = InferenceClient::from_config(model_config("http://localhost:11434/v1/")).unwrap();
        assert_eq!(client.endpoint(), "http://localhost:11434/v1/chat/completions");
        assert_eq!(client.name(), "test-model");
    }

    #[test]
    fn test_empty_base_url_rejected() {
        assert!(InferenceClient::from_config(model_config(" ")).is_err());
    }
}
