//! Final-answer synthesis.
//!
//! Combines step results into the user-facing answer. The model is used only
//! when one is configured and the intent was classified with reasonable
//! confidence; otherwise a templated combination is produced. Synthesis
//! always yields an answer: missing inputs produce the insufficient
//! information fallback instead of an error.

use std::sync::Arc;

use serde_json::Value;

use super::text::{ellipsize, summarize_value, truncate_utf8};
use super::types::StepResult;
use crate::inference::LanguageModel;

/// Below this intent confidence the model is skipped and a caveat is added.
pub const LOW_CONFIDENCE_THRESHOLD: f32 = 0.5;

const LOW_CONFIDENCE_CAVEAT: &str =
    "Note: I wasn't sure exactly what you were asking, so this combines everything I found.";

/// How the final answer was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynthesisMode {
    Llm,
    Template,
    Fallback,
    Direct,
}

impl SynthesisMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SynthesisMode::Llm => "llm",
            SynthesisMode::Template => "template",
            SynthesisMode::Fallback => "fallback",
            SynthesisMode::Direct => "direct",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Synthesis {
    pub answer: String,
    pub mode: SynthesisMode,
}

impl Synthesis {
    /// Whether synthesis produced a real answer (anything but the fallback).
    pub fn succeeded(&self) -> bool {
        self.mode != SynthesisMode::Fallback
    }
}

/// Produces final answers, optionally with a model.
#[derive(Clone, Default)]
pub struct Synthesizer {
    model: Option<Arc<dyn LanguageModel>>,
}

impl Synthesizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(model: Arc<dyn LanguageModel>) -> Self {
        Self { model: Some(model) }
    }

    /// Combine upstream step results.
    ///
    /// `missing_keys` lists declared context keys no upstream result carried;
    /// any missing key, or no successful input, yields the fallback.
    pub async fn synthesize(
        &self,
        query: &str,
        intent_confidence: f32,
        inputs: &[StepResult],
        missing_keys: &[String],
    ) -> Synthesis {
        let usable: Vec<&StepResult> = inputs.iter().filter(|r| r.success).collect();
        if usable.is_empty() || !missing_keys.is_empty() {
            tracing::info!(
                inputs = inputs.len(),
                usable = usable.len(),
                missing = ?missing_keys,
                "synthesis fell back to insufficient-information answer"
            );
            return insufficient_information(query, inputs, missing_keys);
        }

        let low_confidence = intent_confidence < LOW_CONFIDENCE_THRESHOLD;
        if let (Some(model), false) = (&self.model, low_confidence) {
            match model.infer(&synthesis_prompt(query, inputs)).await {
                Ok(answer) => {
                    return Synthesis {
                        answer: answer.trim().to_string(),
                        mode: SynthesisMode::Llm,
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        model = %model.name(),
                        error = %e,
                        "model synthesis failed, using template"
                    );
                }
            }
        }

        Synthesis {
            answer: templated_answer(inputs, low_confidence),
            mode: SynthesisMode::Template,
        }
    }

    /// Answer for a plan without a synthesize step: the single result's own answer.
    pub fn direct(&self, query: &str, result: &StepResult, intent_confidence: f32) -> Synthesis {
        if !result.success {
            return insufficient_information(query, std::slice::from_ref(result), &[]);
        }
        let mut answer = answer_text(result);
        if intent_confidence < LOW_CONFIDENCE_THRESHOLD {
            answer = format!("{answer}\n\n{LOW_CONFIDENCE_CAVEAT}");
        }
        Synthesis {
            answer,
            mode: SynthesisMode::Direct,
        }
    }
}

/// The agent's answer, or a summary of its result when it gave none.
fn answer_text(result: &StepResult) -> String {
    match result.result.get("answer").and_then(Value::as_str) {
        Some(answer) if !answer.trim().is_empty() => answer.trim().to_string(),
        _ => result
            .result
            .get("raw_result")
            .map(|raw| summarize_value(raw, 400))
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "(no answer)".to_string()),
    }
}

fn source_label(result: &StepResult) -> String {
    match result.result.get("agent").and_then(Value::as_str) {
        Some("document") => "Documents".to_string(),
        Some("task") => "Tasks".to_string(),
        Some("board") => "Boards".to_string(),
        _ => result.step_id.clone(),
    }
}

fn templated_answer(inputs: &[StepResult], low_confidence: bool) -> String {
    let mut lines = vec!["Here's what I found:".to_string()];
    for result in inputs.iter().filter(|r| r.success) {
        lines.push(format!(
            "- {}: {}",
            source_label(result),
            ellipsize(&answer_text(result), 600)
        ));
    }
    let failed: Vec<String> = inputs
        .iter()
        .filter(|r| !r.success)
        .map(source_label)
        .collect();
    if !failed.is_empty() {
        lines.push(format!(
            "I couldn't get results from: {}.",
            failed.join(", ")
        ));
    }
    if low_confidence {
        lines.push(LOW_CONFIDENCE_CAVEAT.to_string());
    }
    lines.join("\n")
}

fn insufficient_information(query: &str, inputs: &[StepResult], missing: &[String]) -> Synthesis {
    let mut answer = format!(
        "I don't have enough information to answer \"{}\" right now.",
        truncate_utf8(query.trim(), 200)
    );
    let errors: Vec<String> = inputs
        .iter()
        .filter_map(|r| r.error.as_ref().map(|e| format!("{}: {e}", source_label(r))))
        .collect();
    if !errors.is_empty() {
        answer.push_str(&format!(" Some sources failed ({}).", errors.join("; ")));
    }
    if !missing.is_empty() {
        answer.push_str(&format!(" Missing: {}.", missing.join(", ")));
    }
    Synthesis {
        answer,
        mode: SynthesisMode::Fallback,
    }
}

fn synthesis_prompt(query: &str, inputs: &[StepResult]) -> String {
    let results_summary = inputs
        .iter()
        .map(|r| {
            if r.success {
                format!(
                    "{} ({}): {}",
                    source_label(r),
                    r.step_id,
                    truncate_utf8(&answer_text(r), 800)
                )
            } else {
                format!(
                    "{} ({}): FAILED: {}",
                    source_label(r),
                    r.step_id,
                    r.error.as_deref().unwrap_or("unknown")
                )
            }
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "The user asked: \"{query}\"\n\n\
         Answers from the workspace agents:\n{results_summary}\n\n\
         Write one clear, concise answer that combines these results. \
         Use ONLY the information above. For failed sources, say that the \
         information could not be retrieved. NEVER fabricate results."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_core::types::JsonMap;
    use crate::inference::InferenceError;
    use async_trait::async_trait;
    use serde_json::json;

    struct EchoModel;

    #[async_trait]
    impl LanguageModel for EchoModel {
        async fn infer(&self, _prompt: &str) -> Result<String, InferenceError> {
            Ok("  combined answer  ".into())
        }

        fn name(&self) -> &str {
            "echo"
        }
    }

    fn ok(step: &str, agent: &str, answer: &str) -> StepResult {
        let mut map = JsonMap::new();
        map.insert("agent".into(), json!(agent));
        map.insert("answer".into(), json!(answer));
        StepResult::ok(step, map, 5)
    }

    #[tokio::test]
    async fn test_template_without_model() {
        let inputs = vec![
            ok("step_1", "document", "The roadmap is v2."),
            StepResult::failed("step_2", "task agent timed out", 10),
        ];
        let s = Synthesizer::new().synthesize("status?", 0.9, &inputs, &[]).await;
        assert_eq!(s.mode, SynthesisMode::Template);
        assert!(s.succeeded());
        assert!(s.answer.contains("- Documents: The roadmap is v2."));
        assert!(s.answer.contains("couldn't get results from: step_2"));
        assert!(!s.answer.contains("Note:"));
    }

    #[tokio::test]
    async fn test_model_used_when_confident() {
        let synth = Synthesizer::with_model(Arc::new(EchoModel));
        let s = synth.synthesize("q", 0.8, &[ok("step_1", "task", "3 tasks")], &[]).await;
        assert_eq!(s.mode, SynthesisMode::Llm);
        assert_eq!(s.answer, "combined answer");
    }

    #[tokio::test]
    async fn test_low_confidence_skips_model_and_adds_caveat() {
        let synth = Synthesizer::with_model(Arc::new(EchoModel));
        let s = synth.synthesize("q", 0.2, &[ok("step_1", "task", "3 tasks")], &[]).await;
        assert_eq!(s.mode, SynthesisMode::Template);
        assert!(s.answer.ends_with(LOW_CONFIDENCE_CAVEAT));
    }

    #[tokio::test]
    async fn test_fallback_when_nothing_usable_or_keys_missing() {
        let failed = vec![StepResult::failed("step_1", "boom", 1)];
        let s = Synthesizer::new().synthesize("q", 0.9, &failed, &[]).await;
        assert_eq!(s.mode, SynthesisMode::Fallback);
        assert!(!s.succeeded());
        assert!(s.answer.contains("don't have enough information"));
        assert!(s.answer.contains("boom"));

        let s = Synthesizer::new()
            .synthesize("q", 0.9, &[ok("step_1", "task", "x")], &["due_dates".to_string()])
            .await;
        assert_eq!(s.mode, SynthesisMode::Fallback);
        assert!(s.answer.contains("due_dates"));
    }

    #[test]
    fn test_direct_answer() {
        let synth = Synthesizer::new();
        let s = synth.direct("q", &ok("step_1", "task", "Two tasks are overdue."), 0.9);
        assert_eq!(s.mode, SynthesisMode::Direct);
        assert_eq!(s.answer, "Two tasks are overdue.");

        let s = synth.direct("q", &StepResult::failed("step_1", "down", 1), 0.9);
        assert_eq!(s.mode, SynthesisMode::Fallback);
    }

    #[test]
    fn test_answer_falls_back_to_raw_summary() {
        let mut map = JsonMap::new();
        map.insert("raw_result".into(), json!([{"title": "Fix login"}]));
        let result = StepResult::ok("step_1", map, 1);
        assert_eq!(answer_text(&result), "1 item(s): Fix login");
    }
}
