//! Plan executor: walks the dependency graph of an [`ExecutionPlan`].
//!
//! A step becomes eligible once every dependency has a recorded result
//! (successful or not). Eligible steps are dispatched in plan order, bounded
//! by `max_in_flight` and, with `one_per_agent`, by one running step per
//! agent. Step failures stay local: siblings keep running and the plan
//! always ends with an answer, even if it is the fallback.
//!
//! Agent replies may propose writes; each proposed action goes through the
//! [`HitlGate`] before the step's result is recorded.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::{json, Value};
use tokio::time::Instant;

use super::agents::{AgentRegistry, AgentResponse};
use super::errors::AgentError;
use super::gate::{ActionContext, GateOutcome, HitlGate};
use super::plan_builder::validate_plan;
use super::synthesis::{Synthesis, Synthesizer};
use super::types::{
    AgentKind, ExecutionPlan, ExecutionStep, JsonMap, PlanExecutionResult, StepResult, StepType,
};
use crate::config::ExecutorConfig;

/// Who a plan runs for.
#[derive(Debug, Clone)]
pub struct ExecutionScope {
    pub workspace_id: String,
    pub user_id: String,
}

impl ExecutionScope {
    pub fn new(workspace_id: &str, user_id: &str) -> Self {
        Self {
            workspace_id: workspace_id.to_string(),
            user_id: user_id.to_string(),
        }
    }
}

struct StepOutcome {
    index: usize,
    result: StepResult,
    synthesis: Option<Synthesis>,
}

pub struct PlanExecutor {
    agents: AgentRegistry,
    gate: Option<Arc<HitlGate>>,
    synthesizer: Synthesizer,
    config: ExecutorConfig,
}

impl PlanExecutor {
    pub fn new(agents: AgentRegistry, synthesizer: Synthesizer, config: ExecutorConfig) -> Self {
        Self {
            agents,
            gate: None,
            synthesizer,
            config,
        }
    }

    /// Route proposed write actions through this gate.
    pub fn with_gate(mut self, gate: Arc<HitlGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn gate(&self) -> Option<&Arc<HitlGate>> {
        self.gate.as_ref()
    }

    // ─── Scheduling ─────────────────────────────────────────────────────

    /// Execute a plan. Only an invalid plan is an error; everything else
    /// is reported inside the result.
    pub async fn execute(
        &self,
        plan: &ExecutionPlan,
        scope: &ExecutionScope,
    ) -> Result<PlanExecutionResult, AgentError> {
        validate_plan(plan)?;
        let started_at = Instant::now();
        let max_in_flight = self.config.max_in_flight.max(1);

        tracing::info!(
            plan_id = %plan.plan_id,
            steps = plan.steps.len(),
            max_in_flight,
            one_per_agent = self.config.one_per_agent,
            "plan execution started"
        );

        let mut started = vec![false; plan.steps.len()];
        let mut recorded: HashMap<&str, StepResult> = HashMap::new();
        let mut step_results: Vec<StepResult> = Vec::with_capacity(plan.steps.len());
        let mut busy_agents: HashSet<AgentKind> = HashSet::new();
        let mut last_synthesis: Option<(usize, Synthesis)> = None;
        let mut in_flight = FuturesUnordered::new();

        loop {
            for (index, step) in plan.steps.iter().enumerate() {
                if in_flight.len() >= max_in_flight {
                    break;
                }
                if started[index]
                    || !step
                        .dependencies
                        .iter()
                        .all(|d| recorded.contains_key(d.as_str()))
                {
                    continue;
                }
                let agent_bound = is_agent_query(step);
                if agent_bound && self.config.one_per_agent && busy_agents.contains(&step.agent) {
                    continue;
                }

                started[index] = true;
                if agent_bound {
                    busy_agents.insert(step.agent);
                }
                let inputs: Vec<StepResult> = step
                    .dependencies
                    .iter()
                    .filter_map(|d| recorded.get(d.as_str()).cloned())
                    .collect();
                tracing::info!(
                    plan_id = %plan.plan_id,
                    step_id = %step.step_id,
                    step_type = ?step.step_type,
                    agent = %step.agent,
                    "step started"
                );
                in_flight.push(self.run_step(index, step, inputs, plan, scope));
            }

            let Some(outcome) = in_flight.next().await else {
                break;
            };
            let step = &plan.steps[outcome.index];
            if is_agent_query(step) {
                busy_agents.remove(&step.agent);
            }
            if outcome.result.success {
                tracing::info!(
                    plan_id = %plan.plan_id,
                    step_id = %step.step_id,
                    elapsed_ms = outcome.result.execution_time_ms,
                    "step completed"
                );
            } else {
                tracing::warn!(
                    plan_id = %plan.plan_id,
                    step_id = %step.step_id,
                    error = outcome.result.error.as_deref().unwrap_or(""),
                    "step failed"
                );
            }
            if let Some(synthesis) = outcome.synthesis {
                if last_synthesis.as_ref().map_or(true, |(i, _)| outcome.index > *i) {
                    last_synthesis = Some((outcome.index, synthesis));
                }
            }
            recorded.insert(step.step_id.as_str(), outcome.result.clone());
            step_results.push(outcome.result);
        }

        let synthesis = match last_synthesis {
            Some((_, synthesis)) => synthesis,
            None if plan.requires_synthesis || step_results.len() > 1 => {
                self.synthesizer
                    .synthesize(&plan.original_query, plan.intent_confidence, &step_results, &[])
                    .await
            }
            None => match step_results.first() {
                Some(only) => self
                    .synthesizer
                    .direct(&plan.original_query, only, plan.intent_confidence),
                None => {
                    self.synthesizer
                        .synthesize(&plan.original_query, plan.intent_confidence, &[], &[])
                        .await
                }
            },
        };

        let confidence = if synthesis.succeeded() {
            mean_confidence(plan, &step_results)
        } else {
            0.0
        };
        let steps_failed = step_results.iter().filter(|r| !r.success).count();

        let mut metadata = JsonMap::new();
        metadata.insert("complexity".into(), json!(plan.estimated_complexity));
        metadata.insert("steps_total".into(), json!(plan.steps.len()));
        metadata.insert("steps_failed".into(), json!(steps_failed));
        metadata.insert("synthesis".into(), json!(synthesis.mode.as_str()));
        metadata.insert("intent_confidence".into(), json!(plan.intent_confidence));

        let result = PlanExecutionResult {
            plan_id: plan.plan_id.clone(),
            success: synthesis.succeeded(),
            step_results,
            final_answer: synthesis.answer,
            confidence,
            total_time_ms: elapsed_ms(started_at),
            metadata,
        };
        tracing::info!(
            plan_id = %plan.plan_id,
            success = result.success,
            steps_failed,
            synthesis = synthesis.mode.as_str(),
            total_ms = result.total_time_ms,
            "plan execution finished"
        );
        Ok(result)
    }

    // ─── Steps ──────────────────────────────────────────────────────────

    async fn run_step(
        &self,
        index: usize,
        step: &ExecutionStep,
        inputs: Vec<StepResult>,
        plan: &ExecutionPlan,
        scope: &ExecutionScope,
    ) -> StepOutcome {
        let started_at = Instant::now();
        let (context, missing) = resolve_context(&step.context_keys, &inputs);

        let (result, synthesis) = match step.step_type {
            StepType::Synthesize => {
                let synthesis = self
                    .synthesizer
                    .synthesize(&plan.original_query, plan.intent_confidence, &inputs, &missing)
                    .await;
                let mut map = JsonMap::new();
                map.insert("answer".into(), json!(synthesis.answer));
                map.insert("mode".into(), json!(synthesis.mode.as_str()));
                let result = if synthesis.succeeded() {
                    StepResult::ok(&step.step_id, map, elapsed_ms(started_at))
                } else {
                    StepResult {
                        result: map,
                        ..StepResult::failed(
                            &step.step_id,
                            "insufficient information to synthesize",
                            elapsed_ms(started_at),
                        )
                    }
                };
                (result, Some(synthesis))
            }
            _ if !missing.is_empty() => {
                let err = AgentError::MissingContext {
                    step_id: step.step_id.clone(),
                    key: missing.join(", "),
                };
                (
                    StepResult::failed(&step.step_id, err.to_string(), elapsed_ms(started_at)),
                    None,
                )
            }
            StepType::Validate => {
                let failed: Vec<&str> = inputs
                    .iter()
                    .filter(|r| !r.success)
                    .map(|r| r.step_id.as_str())
                    .collect();
                let result = if failed.is_empty() {
                    let mut map = context;
                    map.insert("valid".into(), json!(true));
                    map.insert(
                        "checked".into(),
                        json!(step.dependencies.iter().collect::<Vec<_>>()),
                    );
                    StepResult::ok(&step.step_id, map, elapsed_ms(started_at))
                } else {
                    StepResult::failed(
                        &step.step_id,
                        format!("upstream steps failed: {}", failed.join(", ")),
                        elapsed_ms(started_at),
                    )
                };
                (result, None)
            }
            StepType::QueryDocument | StepType::QueryTask | StepType::QueryBoard => {
                let result = match self.query_agent(step, &context, scope).await {
                    Ok((map, action_errors)) if action_errors.is_empty() => {
                        StepResult::ok(&step.step_id, map, elapsed_ms(started_at))
                    }
                    // Keep the map: it carries the actions that did run and their rollback ids.
                    Ok((map, action_errors)) => StepResult {
                        result: map,
                        ..StepResult::failed(
                            &step.step_id,
                            format!("proposed actions failed: {}", action_errors.join("; ")),
                            elapsed_ms(started_at),
                        )
                    },
                    Err(e) => StepResult::failed(&step.step_id, e.to_string(), elapsed_ms(started_at)),
                };
                (result, None)
            }
        };

        StepOutcome {
            index,
            result,
            synthesis,
        }
    }

    /// Query the owning agent, then gate any proposed writes.
    ///
    /// Every proposed action gets an entry under `actions`. An action the
    /// gate refuses with an error is recorded as failed and the remaining
    /// actions still run; the errors are returned alongside the map.
    async fn query_agent(
        &self,
        step: &ExecutionStep,
        context: &JsonMap,
        scope: &ExecutionScope,
    ) -> Result<(JsonMap, Vec<String>), AgentError> {
        let agent = self.agents.get(step.agent)?;
        let timeout = Duration::from_secs(self.config.step_timeout_seconds);
        let response: AgentResponse =
            tokio::time::timeout(timeout, agent.query(&step.query, &scope.workspace_id, context))
                .await
                .map_err(|_| AgentError::AgentFailed {
                    agent: step.agent.to_string(),
                    reason: format!("timed out after {}s", timeout.as_secs()),
                })??;

        let proposed = response.proposed_actions.clone();
        let mut map = response.into_result_map(step.agent);
        if proposed.is_empty() {
            return Ok((map, Vec::new()));
        }

        let gate = self.gate.as_ref().ok_or_else(|| AgentError::AgentFailed {
            agent: step.agent.to_string(),
            reason: "agent proposed write actions but no approval gate is configured".into(),
        })?;
        let ctx = ActionContext::new(&scope.workspace_id, &scope.user_id, step.agent.as_str());
        let mut actions = Vec::with_capacity(proposed.len());
        let mut errors = Vec::new();
        for action in &proposed {
            match gate
                .run_action(&ctx, &action.action_type, &action.parameters)
                .await
            {
                Ok(outcome) => actions.push(action_summary(&outcome)),
                Err(e) => {
                    tracing::warn!(
                        step_id = %step.step_id,
                        action = %action.action_type,
                        error = %e,
                        "proposed action refused"
                    );
                    actions.push(json!({
                        "action_type": action.action_type,
                        "status": "failed",
                        "error": e.to_string(),
                    }));
                    errors.push(format!("{}: {e}", action.action_type));
                }
            }
        }
        map.insert("actions".into(), Value::Array(actions));
        Ok((map, errors))
    }
}

fn is_agent_query(step: &ExecutionStep) -> bool {
    matches!(
        step.step_type,
        StepType::QueryDocument | StepType::QueryTask | StepType::QueryBoard
    )
}

/// Look up each key in the successful upstream results; later dependencies win.
fn resolve_context(keys: &[String], inputs: &[StepResult]) -> (JsonMap, Vec<String>) {
    let mut context = JsonMap::new();
    let mut missing = Vec::new();
    for key in keys {
        let found = inputs
            .iter()
            .rev()
            .filter(|r| r.success)
            .find_map(|r| r.result.get(key));
        match found {
            Some(value) => {
                context.insert(key.clone(), value.clone());
            }
            None => missing.push(key.clone()),
        }
    }
    (context, missing)
}

fn action_summary(outcome: &GateOutcome) -> Value {
    json!({
        "action_type": outcome.action_type,
        "status": outcome.status,
        "severity": outcome.severity,
        "request_id": outcome.request.as_ref().map(|r| r.request_id.clone()),
        "response_status": outcome.response.as_ref().map(|r| r.status),
        "execution": outcome.execution,
    })
}

/// Mean confidence over successful agent steps (0 when none).
fn mean_confidence(plan: &ExecutionPlan, results: &[StepResult]) -> f32 {
    let values: Vec<f32> = results
        .iter()
        .filter(|r| r.success)
        .filter(|r| plan.step(&r.step_id).is_some_and(is_agent_query))
        .filter_map(|r| r.result.get("confidence").and_then(Value::as_f64))
        .map(|c| c as f32)
        .collect();
    if values.is_empty() {
        return 0.0;
    }
    (values.iter().sum::<f32>() / values.len() as f32).clamp(0.0, 1.0)
}

fn elapsed_ms(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}
