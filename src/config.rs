//! Engine configuration loading and validation.
//!
//! Reads `config/orchestrator.yaml` and resolves environment variables.
//! Every section has defaults, so an empty file yields a usable config with
//! HITL gating fully enabled.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::agent_core::errors::AgentError;
use crate::agent_core::types::AgentKind;

/// Env var that points directly at a config file.
pub const CONFIG_ENV_VAR: &str = "ORCHESTRATOR_CONFIG";

const CONFIG_RELATIVE_PATH: &str = "config/orchestrator.yaml";

/// Upper bound for HITL durations (30 days).
const MAX_HITL_SECONDS: u64 = 30 * 24 * 60 * 60;

// ─── Public Types ────────────────────────────────────────────────────────────

/// What happens to a confirmation request nobody answered in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutAction {
    /// Finalize as TIMEOUT and never execute.
    #[default]
    Reject,
    /// Apply the request's default option as if approved.
    Default,
    /// Notify a higher-severity path; still finalizes as TIMEOUT.
    Escalate,
}

/// Human-in-the-loop policy for a deployment.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HitlConfig {
    pub enabled: bool,
    pub auto_execute_low: bool,
    pub require_confirmation_medium: bool,
    pub require_approval_high: bool,
    pub require_reason_critical: bool,
    pub default_timeout_seconds: u64,
    pub critical_timeout_seconds: u64,
    pub notify_on_pending: bool,
    pub notify_on_timeout: bool,
    pub timeout_action: TimeoutAction,
    /// How long terminal requests stay queryable before they are pruned.
    pub resolved_retention_seconds: u64,
}

impl Default for HitlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_execute_low: true,
            require_confirmation_medium: true,
            require_approval_high: true,
            require_reason_critical: true,
            default_timeout_seconds: 300,
            critical_timeout_seconds: 600,
            notify_on_pending: true,
            notify_on_timeout: true,
            timeout_action: TimeoutAction::Reject,
            resolved_retention_seconds: 3600,
        }
    }
}

/// Plan executor scheduling limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Maximum steps running at once.
    pub max_in_flight: usize,
    /// Forbid two in-flight steps on the same agent.
    pub one_per_agent: bool,
    /// Per-step agent call timeout.
    pub step_timeout_seconds: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 3,
            one_per_agent: true,
            step_timeout_seconds: 60,
        }
    }
}

/// Retry budget for transient core-service failures.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 4000,
        }
    }
}

/// Core-service HTTP endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct CoreServiceConfig {
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_core_timeout")]
    pub timeout_seconds: u64,
}

fn default_core_timeout() -> u64 {
    30
}

impl Default for CoreServiceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/api".into(),
            api_key: None,
            timeout_seconds: default_core_timeout(),
        }
    }
}

/// Endpoint of one specialist agent.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentEndpointConfig {
    pub base_url: String,
}

/// OpenAI-compatible model used for classification and synthesis.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub base_url: String,
    pub model_name: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_model_timeout")]
    pub timeout_seconds: u64,
}

fn default_temperature() -> f32 {
    0.1
}
fn default_max_tokens() -> u32 {
    1024
}
fn default_model_timeout() -> u64 {
    60
}

/// Top-level engine configuration (mirrors `config/orchestrator.yaml`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub hitl: HitlConfig,
    pub executor: ExecutorConfig,
    pub retry: RetryConfig,
    pub core_service: CoreServiceConfig,
    pub agents: BTreeMap<AgentKind, AgentEndpointConfig>,
    /// When absent, classification and synthesis use the rule-based paths.
    pub model: Option<ModelConfig>,
    /// SQLite path for the audit store; `":memory:"` is allowed.
    pub audit_db: Option<String>,
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Locate the config file.
///
/// Checks `ORCHESTRATOR_CONFIG` first, then searches upward from `start`
/// for `config/orchestrator.yaml`.
pub fn find_config_path(start: &Path) -> Result<PathBuf, AgentError> {
    if let Ok(explicit) = std::env::var(CONFIG_ENV_VAR) {
        let candidate = PathBuf::from(expand_tilde(&explicit));
        if candidate.exists() {
            return Ok(candidate);
        }
        return Err(AgentError::ConfigError {
            reason: format!("{CONFIG_ENV_VAR} points to missing file {}", candidate.display()),
        });
    }

    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(CONFIG_RELATIVE_PATH);
        if candidate.exists() {
            return Ok(candidate);
        }
        if !dir.pop() {
            break;
        }
    }

    Err(AgentError::ConfigError {
        reason: format!("could not find {CONFIG_RELATIVE_PATH}"),
    })
}

/// Load, interpolate and validate the engine configuration file.
pub fn load_config(path: &Path) -> Result<EngineConfig, AgentError> {
    let raw = std::fs::read_to_string(path).map_err(|e| AgentError::ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;
    parse_config(&raw)
}

/// Parse configuration from YAML text.
pub fn parse_config(raw: &str) -> Result<EngineConfig, AgentError> {
    let interpolated = interpolate_env_vars(raw);

    // An empty document deserializes as null; treat it as all defaults.
    let mut config: EngineConfig = if interpolated.trim().is_empty() {
        EngineConfig::default()
    } else {
        serde_yaml::from_str(&interpolated).map_err(|e| AgentError::ConfigError {
            reason: format!("failed to parse config: {e}"),
        })?
    };

    config.retry.max_attempts = config.retry.max_attempts.clamp(1, 3);
    config.executor.max_in_flight = config.executor.max_in_flight.max(1);
    config.core_service.api_key = config
        .core_service
        .api_key
        .take()
        .filter(|k| !k.trim().is_empty());

    validate(&config)?;
    Ok(config)
}

fn validate(config: &EngineConfig) -> Result<(), AgentError> {
    let hitl = &config.hitl;
    for (name, value) in [
        ("default_timeout_seconds", hitl.default_timeout_seconds),
        ("critical_timeout_seconds", hitl.critical_timeout_seconds),
        ("resolved_retention_seconds", hitl.resolved_retention_seconds),
    ] {
        if value == 0 || value > MAX_HITL_SECONDS {
            return Err(AgentError::ConfigError {
                reason: format!("hitl.{name} must be between 1 and {MAX_HITL_SECONDS}, got {value}"),
            });
        }
    }
    if config.agents.contains_key(&AgentKind::Both) {
        return Err(AgentError::ConfigError {
            reason: "'both' is not a concrete agent endpoint".into(),
        });
    }
    Ok(())
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((var_name, default)) => {
            std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default))
        }
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = parse_config("").unwrap();
        assert!(config.hitl.enabled);
        assert_eq!(config.hitl.default_timeout_seconds, 300);
        assert_eq!(config.hitl.critical_timeout_seconds, 600);
        assert_eq!(config.hitl.timeout_action, TimeoutAction::Reject);
        assert_eq!(config.executor.max_in_flight, 3);
        assert_eq!(config.retry.max_attempts, 3);
        assert!(config.model.is_none());
    }

    #[test]
    fn test_partial_hitl_section_keeps_other_defaults() {
        let yaml = r#"
            hitl:
              timeout_action: default
              default_timeout_seconds: 30
        "#;
        let config = parse_config(yaml).unwrap();
        assert_eq!(config.hitl.timeout_action, TimeoutAction::Default);
        assert_eq!(config.hitl.default_timeout_seconds, 30);
        assert!(config.hitl.require_reason_critical);
    }

    #[test]
    fn test_unknown_timeout_action_fails() {
        let yaml = "hitl:\n  timeout_action: approve_everything\n";
        let err = parse_config(yaml).unwrap_err();
        assert!(matches!(err, AgentError::ConfigError { .. }));
    }

    #[test]
    fn test_hitl_durations_are_bounded() {
        let err = parse_config("hitl:\n  default_timeout_seconds: 0\n").unwrap_err();
        assert!(matches!(err, AgentError::ConfigError { .. }));

        let yaml = format!("hitl:\n  critical_timeout_seconds: {}\n", u64::MAX / 2);
        let err = parse_config(&yaml).unwrap_err();
        assert!(err.to_string().contains("critical_timeout_seconds"));

        let err = parse_config("hitl:\n  resolved_retention_seconds: 0\n").unwrap_err();
        assert!(matches!(err, AgentError::ConfigError { .. }));

        let config = parse_config("hitl:\n  default_timeout_seconds: 86400\n").unwrap();
        assert_eq!(config.hitl.default_timeout_seconds, 86400);
        assert_eq!(config.hitl.resolved_retention_seconds, 3600);
    }

    #[test]
    fn test_retry_attempts_clamped() {
        let config = parse_config("retry:\n  max_attempts: 10\n").unwrap();
        assert_eq!(config.retry.max_attempts, 3);
        let config = parse_config("retry:\n  max_attempts: 0\n").unwrap();
        assert_eq!(config.retry.max_attempts, 1);
    }

    #[test]
    fn test_agents_map_and_model() {
        let yaml = r#"
            agents:
              document:
                base_url: "http://docs:9000"
              task:
                base_url: "http://tasks:9001"
            model:
              base_url: "http://localhost:11434/v1"
              model_name: "qwen2.5"
        "#;
        let config = parse_config(yaml).unwrap();
        assert_eq!(config.agents.len(), 2);
        assert_eq!(
            config.agents[&AgentKind::Task].base_url,
            "http://tasks:9001"
        );
        let model = config.model.unwrap();
        assert_eq!(model.max_tokens, 1024);
    }

    #[test]
    fn test_both_agent_endpoint_rejected() {
        let yaml = "agents:\n  both:\n    base_url: http://x\n";
        assert!(parse_config(yaml).is_err());
    }

    #[test]
    fn test_blank_api_key_is_dropped() {
        std::env::remove_var("__TEST_ORCH_MISSING_KEY__");
        let yaml = r#"
            core_service:
              base_url: "http://core"
              api_key: "${__TEST_ORCH_MISSING_KEY__}"
        "#;
        let config = parse_config(yaml).unwrap();
        assert!(config.core_service.api_key.is_none());
        assert_eq!(config.core_service.timeout_seconds, 30);
    }

    #[test]
    fn test_interpolate_env_vars_with_default() {
        std::env::remove_var("__TEST_ORCH_NONEXISTENT__");
        let result = interpolate_env_vars("${__TEST_ORCH_NONEXISTENT__:-/fallback/path}");
        assert_eq!(result, "/fallback/path");
    }

    #[test]
    fn test_interpolate_env_vars_with_value() {
        std::env::set_var("__TEST_ORCH_VAR__", "/custom/path");
        let result = interpolate_env_vars("${__TEST_ORCH_VAR__:-/fallback/path}");
        assert_eq!(result, "/custom/path");
        std::env::remove_var("__TEST_ORCH_VAR__");
    }

    #[test]
    fn test_load_config_from_file_and_walk_up() {
        let dir = tempfile::tempdir().unwrap();
        let config_dir = dir.path().join("config");
        std::fs::create_dir_all(&config_dir).unwrap();
        let path = config_dir.join("orchestrator.yaml");
        std::fs::write(&path, "executor:\n  max_in_flight: 5\n").unwrap();

        let nested = dir.path().join("a/b");
        std::fs::create_dir_all(&nested).unwrap();

        // Only meaningful when the env override is not set in this process.
        if std::env::var(CONFIG_ENV_VAR).is_err() {
            let found = find_config_path(&nested).unwrap();
            assert_eq!(found, path);
        }

        let config = load_config(&path).unwrap();
        assert_eq!(config.executor.max_in_flight, 5);
    }

    #[test]
    fn test_shipped_config_parses() {
        let config = parse_config(include_str!("../config/orchestrator.yaml")).unwrap();
        assert!(config.hitl.enabled);
        assert_eq!(config.agents.len(), 3);
        assert!(config.model.is_none());
        assert!(config.audit_db.is_some());
    }
}
