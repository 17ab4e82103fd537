//! Orchestrator: the end-to-end query pipeline.
//!
//! 1. **Classify**: intent classifier maps the query to an [`Intent`]
//! 2. **Plan**: plan builder turns the intent into an [`ExecutionPlan`]
//! 3. **Execute**: plan executor runs the DAG, gating writes through HITL,
//!    and synthesizes the final answer
//!
//! `handle_query` never returns an error. A plan that cannot be built
//! becomes a `success=false` result with a readable answer.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::agents::AgentRegistry;
use super::confirmation::ConfirmationManager;
use super::database::AuditStore;
use super::errors::AgentError;
use super::executor::{ExecutionScope, PlanExecutor};
use super::gate::HitlGate;
use super::intent::IntentClassifier;
use super::notify::{LogNotifier, Notifier};
use super::plan_builder;
use super::retry::RetryPolicy;
use super::synthesis::{SynthesisMode, Synthesizer};
use super::tools::ToolRegistry;
use super::types::{ConfirmationRequest, ConversationTurn, Intent, JsonMap, PlanExecutionResult};
use crate::config::EngineConfig;
use crate::core_client::{CoreService, HttpCoreService};
use crate::inference::{InferenceClient, LanguageModel};

pub struct Orchestrator {
    classifier: IntentClassifier,
    executor: PlanExecutor,
}

impl Orchestrator {
    pub fn new(classifier: IntentClassifier, executor: PlanExecutor) -> Self {
        Self {
            classifier,
            executor,
        }
    }

    /// Wire every collaborator from config.
    ///
    /// Returns the receiver for confirmation requests as they are opened;
    /// answer them through [`Orchestrator::confirmations`].
    pub fn from_config(
        config: &EngineConfig,
        notifier: Arc<dyn Notifier>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ConfirmationRequest>), AgentError> {
        let retry = RetryPolicy::from_config(&config.retry);
        let core: Arc<dyn CoreService> = Arc::new(HttpCoreService::from_config(&config.core_service)?);

        let audit = match config.audit_db.as_deref() {
            Some(path) => Some(Arc::new(AuditStore::open(path)?)),
            None => None,
        };

        let mut confirmations = ConfirmationManager::new(config.hitl.clone(), notifier.clone());
        if let Some(audit) = &audit {
            confirmations = confirmations.with_audit(audit.clone());
        }
        let mut gate = HitlGate::new(
            ToolRegistry::with_core_tools(core, retry),
            Arc::new(confirmations),
            notifier,
            retry,
        );
        if let Some(audit) = audit {
            gate = gate.with_audit(audit);
        }
        let (gate, requests) = gate.with_request_channel();

        let model: Option<Arc<dyn LanguageModel>> = match &config.model {
            Some(model_config) => Some(Arc::new(
                InferenceClient::from_config(model_config.clone()).map_err(|e| {
                    AgentError::ConfigError {
                        reason: format!("model: {e}"),
                    }
                })?,
            )),
            None => None,
        };
        let (classifier, synthesizer) = match model {
            Some(model) => (
                IntentClassifier::with_model(model.clone()),
                Synthesizer::with_model(model),
            ),
            None => (IntentClassifier::new(), Synthesizer::new()),
        };

        let executor = PlanExecutor::new(
            AgentRegistry::from_config(config)?,
            synthesizer,
            config.executor.clone(),
        )
        .with_gate(Arc::new(gate));

        tracing::info!(
            hitl_enabled = config.hitl.enabled,
            model = config.model.is_some(),
            audit = config.audit_db.is_some(),
            "orchestrator ready"
        );
        Ok((Self::new(classifier, executor), requests))
    }

    /// Config wiring with log-only notifications.
    pub fn from_config_logging(
        config: &EngineConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ConfirmationRequest>), AgentError> {
        Self::from_config(config, Arc::new(LogNotifier))
    }

    pub fn executor(&self) -> &PlanExecutor {
        &self.executor
    }

    /// The confirmation manager behind the gate, if one is attached.
    pub fn confirmations(&self) -> Option<&Arc<ConfirmationManager>> {
        self.executor.gate().map(|g| g.confirmations())
    }

    /// Answer one query: classify, plan, execute.
    pub async fn handle_query(
        &self,
        query: &str,
        workspace_id: &str,
        user_id: &str,
        history: &[ConversationTurn],
    ) -> PlanExecutionResult {
        let started_at = Instant::now();
        let intent = self.classifier.classify(query, workspace_id, history).await;

        let outcome = match plan_builder::build(&intent, query) {
            Ok(plan) => {
                let scope = ExecutionScope::new(workspace_id, user_id);
                self.executor
                    .execute(&plan, &scope)
                    .await
                    .map_err(|e| (Some(plan.plan_id.clone()), e))
            }
            Err(e) => Err((None, e)),
        };

        let mut result = match outcome {
            Ok(result) => result,
            Err((plan_id, e)) => {
                tracing::warn!(error = %e, "query could not be planned");
                unplannable(plan_id, &e, started_at)
            }
        };
        annotate(&mut result.metadata, &intent);
        result
    }
}

fn annotate(metadata: &mut JsonMap, intent: &Intent) {
    metadata.insert("intent_type".into(), json!(intent.intent_type));
    metadata.insert("intent_confidence".into(), json!(intent.confidence));
    metadata.insert("intent_agent".into(), json!(intent.agent));
    if !intent.entities.is_empty() {
        metadata.insert("entities".into(), json!(intent.entities));
    }
}

fn unplannable(plan_id: Option<String>, error: &AgentError, started_at: Instant) -> PlanExecutionResult {
    let mut metadata = JsonMap::new();
    metadata.insert("complexity".into(), json!("simple"));
    metadata.insert("steps_total".into(), json!(0));
    metadata.insert("steps_failed".into(), json!(0));
    metadata.insert("synthesis".into(), json!(SynthesisMode::Fallback.as_str()));
    metadata.insert("error".into(), json!(error.to_string()));
    PlanExecutionResult {
        plan_id: plan_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        success: false,
        step_results: Vec::new(),
        final_answer: format!("I couldn't work out how to answer that request ({error})."),
        confidence: 0.0,
        total_time_ms: u64::try_from(started_at.elapsed().as_millis()).unwrap_or(u64::MAX),
        metadata,
    }
}
