//! Plan builder: turns a classified intent into an execution plan.
//!
//! Built plans have one of two shapes:
//! - **single step**: one query step owned by the intent's agent
//! - **fan-out**: independent query steps (no edges between them) plus one
//!   terminal `synthesize` step depending on all of them
//!
//! Hand-authored plans (JSON) go through the same validation: unique ids,
//! no dangling dependencies, no cycles, and dependency-consistent order.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use serde::Deserialize;

use super::errors::AgentError;
use super::types::{
    AgentKind, Complexity, ExecutionPlan, ExecutionStep, Intent, IntentType, StepType,
};

/// Build the plan for an intent.
pub fn build(intent: &Intent, query: &str) -> Result<ExecutionPlan, AgentError> {
    let query = query.trim();
    if query.is_empty() {
        return Err(AgentError::InvalidPlan {
            reason: "query is empty".into(),
        });
    }

    let steps = match (intent.requires_decomposition, intent.agent) {
        (false, AgentKind::Document | AgentKind::Task | AgentKind::Board) => {
            vec![query_step(1, intent.agent, query, &intent.reasoning)]
        }
        _ => fan_out_steps(intent, query),
    };
    let requires_synthesis = steps.iter().any(|s| s.step_type == StepType::Synthesize);

    let plan = ExecutionPlan {
        plan_id: uuid::Uuid::new_v4().to_string(),
        original_query: query.to_string(),
        estimated_complexity: Complexity::from_step_count(steps.len()),
        steps,
        requires_synthesis,
        reasoning: format!(
            "{:?} intent routed to {} ({})",
            intent.intent_type, intent.agent, intent.reasoning
        ),
        intent_confidence: intent.confidence,
    };
    validate_plan(&plan)?;

    tracing::info!(
        plan_id = %plan.plan_id,
        intent = ?intent.intent_type,
        steps = plan.steps.len(),
        complexity = ?plan.estimated_complexity,
        "plan built"
    );
    Ok(plan)
}

fn query_step(n: usize, agent: AgentKind, query: &str, reasoning: &str) -> ExecutionStep {
    ExecutionStep {
        step_id: format!("step_{n}"),
        // Callers only pass concrete agents here.
        step_type: StepType::query_for(agent).unwrap_or(StepType::QueryTask),
        agent,
        query: query.to_string(),
        dependencies: BTreeSet::new(),
        context_keys: Vec::new(),
        reasoning: reasoning.to_string(),
    }
}

/// Agents consulted by a decomposed intent, in dispatch order.
fn fan_out_agents(intent: &Intent, query: &str) -> Vec<AgentKind> {
    if intent.intent_type == IntentType::WorkspaceOverview {
        return vec![AgentKind::Document, AgentKind::Task, AgentKind::Board];
    }
    let mut agents = vec![AgentKind::Document, AgentKind::Task];
    let lower = query.to_lowercase();
    if intent.agent == AgentKind::Board || lower.contains("board") || lower.contains("kanban") {
        agents.push(AgentKind::Board);
    }
    agents
}

fn fan_out_steps(intent: &Intent, query: &str) -> Vec<ExecutionStep> {
    let mut steps: Vec<ExecutionStep> = fan_out_agents(intent, query)
        .into_iter()
        .enumerate()
        .map(|(i, agent)| {
            query_step(
                i + 1,
                agent,
                query,
                &format!("gather the {agent} side of the question"),
            )
        })
        .collect();

    let dependencies: BTreeSet<String> = steps.iter().map(|s| s.step_id.clone()).collect();
    steps.push(ExecutionStep {
        step_id: format!("step_{}", steps.len() + 1),
        step_type: StepType::Synthesize,
        agent: AgentKind::Both,
        query: query.to_string(),
        dependencies,
        context_keys: Vec::new(),
        reasoning: "combine agent answers into one response".into(),
    });
    steps
}

// ─── Validation ─────────────────────────────────────────────────────────────

/// Reject plans that cannot be executed.
pub fn validate_plan(plan: &ExecutionPlan) -> Result<(), AgentError> {
    let invalid = |reason: String| {
        tracing::warn!(plan_id = %plan.plan_id, reason = %reason, "plan rejected");
        Err(AgentError::InvalidPlan { reason })
    };

    if plan.steps.is_empty() {
        return invalid("plan has no steps".into());
    }

    let mut ids: HashSet<&str> = HashSet::new();
    for step in &plan.steps {
        if step.step_id.trim().is_empty() {
            return invalid("step with empty id".into());
        }
        if !ids.insert(step.step_id.as_str()) {
            return invalid(format!("duplicate step id '{}'", step.step_id));
        }
    }

    for step in &plan.steps {
        for dep in &step.dependencies {
            if dep == &step.step_id {
                return invalid(format!("step '{}' depends on itself", step.step_id));
            }
            if !ids.contains(dep.as_str()) {
                return invalid(format!(
                    "step '{}' depends on unknown step '{dep}'",
                    step.step_id
                ));
            }
        }
        if let Some(expected) = StepType::query_for(step.agent) {
            let is_query = matches!(
                step.step_type,
                StepType::QueryDocument | StepType::QueryTask | StepType::QueryBoard
            );
            if is_query && step.step_type != expected {
                return invalid(format!(
                    "step '{}' is {:?} but is owned by the {} agent",
                    step.step_id, step.step_type, step.agent
                ));
            }
        } else if step.step_type != StepType::Synthesize && step.step_type != StepType::Validate {
            return invalid(format!(
                "query step '{}' needs a single owning agent",
                step.step_id
            ));
        }
    }

    if let Some(cycle_members) = find_cycle(plan) {
        return invalid(format!(
            "dependency cycle between steps {}",
            cycle_members.join(", ")
        ));
    }

    let mut seen: HashSet<&str> = HashSet::new();
    for step in &plan.steps {
        if let Some(dep) = step.dependencies.iter().find(|d| !seen.contains(d.as_str())) {
            return invalid(format!(
                "step '{}' is listed before its dependency '{dep}'",
                step.step_id
            ));
        }
        seen.insert(step.step_id.as_str());
    }
    Ok(())
}

/// Kahn's algorithm; returns the steps left over when no node has in-degree 0.
fn find_cycle(plan: &ExecutionPlan) -> Option<Vec<String>> {
    let mut in_degree: HashMap<&str, usize> = plan
        .steps
        .iter()
        .map(|s| (s.step_id.as_str(), s.dependencies.len()))
        .collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for step in &plan.steps {
        for dep in &step.dependencies {
            dependents
                .entry(dep.as_str())
                .or_default()
                .push(step.step_id.as_str());
        }
    }

    let mut ready: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut visited = 0usize;
    while let Some(id) = ready.pop_front() {
        visited += 1;
        for next in dependents.get(id).into_iter().flatten() {
            if let Some(d) = in_degree.get_mut(next) {
                *d -= 1;
                if *d == 0 {
                    ready.push_back(*next);
                }
            }
        }
    }

    if visited == plan.steps.len() {
        return None;
    }
    let mut stuck: Vec<String> = in_degree
        .into_iter()
        .filter(|(_, d)| *d > 0)
        .map(|(id, _)| id.to_string())
        .collect();
    stuck.sort();
    Some(stuck)
}

// ─── JSON Plans ─────────────────────────────────────────────────────────────

/// Extract a JSON object from model or user text.
///
/// Accepts bare JSON or JSON wrapped in a markdown fence or prose; returns
/// the span from the first `{` to the last `}`.
pub(crate) fn extract_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

#[derive(Debug, Deserialize)]
struct RawPlan {
    #[serde(default)]
    plan_id: Option<String>,
    steps: Vec<ExecutionStep>,
    #[serde(default)]
    requires_synthesis: Option<bool>,
    #[serde(default)]
    reasoning: String,
}

/// Parse and validate a hand-authored plan.
///
/// Missing `plan_id` gets a fresh id; missing `requires_synthesis` is
/// inferred from the presence of a `synthesize` step.
pub fn parse_plan_json(text: &str, original_query: &str) -> Result<ExecutionPlan, AgentError> {
    let json = extract_json(text).ok_or_else(|| AgentError::InvalidPlan {
        reason: "no JSON object found".into(),
    })?;
    let raw: RawPlan = serde_json::from_str(json).map_err(|e| AgentError::InvalidPlan {
        reason: format!("malformed plan JSON: {e}"),
    })?;

    let has_synthesis = raw.steps.iter().any(|s| s.step_type == StepType::Synthesize);
    let plan = ExecutionPlan {
        plan_id: raw
            .plan_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        original_query: original_query.to_string(),
        estimated_complexity: Complexity::from_step_count(raw.steps.len()),
        steps: raw.steps,
        requires_synthesis: raw.requires_synthesis.unwrap_or(has_synthesis),
        reasoning: raw.reasoning,
        intent_confidence: 1.0,
    };
    validate_plan(&plan)?;
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_core::errors::ErrorKind;

    fn intent(t: IntentType, agent: AgentKind, decompose: bool) -> Intent {
        Intent::new(t, 0.8, agent, "test").with_decomposition(decompose)
    }

    #[test]
    fn test_simple_intent_builds_single_step() {
        let plan = build(
            &intent(IntentType::TaskQuery, AgentKind::Task, false),
            "Are there any overdue tasks?",
        )
        .unwrap();
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].step_id, "step_1");
        assert_eq!(plan.steps[0].step_type, StepType::QueryTask);
        assert!(plan.steps[0].dependencies.is_empty());
        assert!(!plan.requires_synthesis);
        assert_eq!(plan.estimated_complexity, Complexity::Simple);
        assert!((plan.intent_confidence - 0.8).abs() < f32::EPSILON);
    }

    #[test]
    fn test_hybrid_intent_fans_out_with_terminal_synthesis() {
        let plan = build(
            &intent(IntentType::HybridQuery, AgentKind::Both, true),
            "Which tasks relate to the onboarding document?",
        )
        .unwrap();
        assert_eq!(plan.steps.len(), 3);
        assert!(plan.requires_synthesis);
        let synth = plan.steps.last().unwrap();
        assert_eq!(synth.step_type, StepType::Synthesize);
        let expected: BTreeSet<String> = ["step_1", "step_2"].iter().map(|s| s.to_string()).collect();
        assert_eq!(synth.dependencies, expected);
        assert!(plan.steps[..2].iter().all(|s| s.dependencies.is_empty()));
        assert_eq!(plan.estimated_complexity, Complexity::Medium);
    }

    #[test]
    fn test_hybrid_mentioning_board_adds_board_step() {
        let plan = build(
            &intent(IntentType::HybridQuery, AgentKind::Both, true),
            "compare the sprint board with the tasks in the design doc",
        )
        .unwrap();
        let agents: Vec<AgentKind> = plan.steps.iter().map(|s| s.agent).collect();
        assert_eq!(
            agents,
            vec![AgentKind::Document, AgentKind::Task, AgentKind::Board, AgentKind::Both]
        );
        assert_eq!(plan.estimated_complexity, Complexity::Complex);
    }

    #[test]
    fn test_overview_queries_all_agents() {
        let plan = build(
            &intent(IntentType::WorkspaceOverview, AgentKind::Both, true),
            "catch me up",
        )
        .unwrap();
        assert_eq!(plan.steps.len(), 4);
        assert_eq!(plan.steps[2].step_type, StepType::QueryBoard);
    }

    #[test]
    fn test_empty_query_rejected() {
        let err = build(&intent(IntentType::TaskQuery, AgentKind::Task, false), "  ").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidPlan);
    }

    #[test]
    fn test_cycle_is_rejected() {
        let text = r#"{"steps": [
            {"step_id": "a", "type": "query_task", "agent": "task", "query": "q", "dependencies": ["b"]},
            {"step_id": "b", "type": "query_document", "agent": "document", "query": "q", "dependencies": ["a"]}
        ]}"#;
        let err = parse_plan_json(text, "q").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidPlan);
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_dangling_dependency_rejected() {
        let text = r#"{"steps": [
            {"step_id": "a", "type": "query_task", "agent": "task", "query": "q", "dependencies": ["ghost"]}
        ]}"#;
        let err = parse_plan_json(text, "q").unwrap_err();
        assert!(err.to_string().contains("unknown step 'ghost'"));
    }

    #[test]
    fn test_duplicate_and_self_dependency_rejected() {
        let dup = r#"{"steps": [
            {"step_id": "a", "type": "query_task", "agent": "task", "query": "q"},
            {"step_id": "a", "type": "query_task", "agent": "task", "query": "q"}
        ]}"#;
        assert!(parse_plan_json(dup, "q").unwrap_err().to_string().contains("duplicate"));

        let selfdep = r#"{"steps": [
            {"step_id": "a", "type": "query_task", "agent": "task", "query": "q", "dependencies": ["a"]}
        ]}"#;
        assert!(parse_plan_json(selfdep, "q").unwrap_err().to_string().contains("itself"));
    }

    #[test]
    fn test_out_of_order_steps_rejected() {
        let text = r#"{"steps": [
            {"step_id": "s", "type": "synthesize", "agent": "both", "query": "q", "dependencies": ["a"]},
            {"step_id": "a", "type": "query_task", "agent": "task", "query": "q"}
        ]}"#;
        let err = parse_plan_json(text, "q").unwrap_err();
        assert!(err.to_string().contains("before its dependency"));
    }

    #[test]
    fn test_mismatched_agent_rejected() {
        let text = r#"{"steps": [
            {"step_id": "a", "type": "query_task", "agent": "document", "query": "q"}
        ]}"#;
        assert_eq!(parse_plan_json(text, "q").unwrap_err().kind(), ErrorKind::InvalidPlan);
    }

    #[test]
    fn test_parse_fenced_plan_infers_synthesis() {
        let text = "Here you go:\n```json\n{\"steps\": [\
            {\"step_id\": \"docs\", \"type\": \"query_document\", \"agent\": \"document\", \"query\": \"find the roadmap\"},\
            {\"step_id\": \"tasks\", \"type\": \"query_task\", \"agent\": \"task\", \"query\": \"open items\", \"dependencies\": [\"docs\"], \"context_keys\": [\"answer\"]},\
            {\"step_id\": \"final\", \"type\": \"synthesize\", \"agent\": \"both\", \"query\": \"combine\", \"dependencies\": [\"docs\", \"tasks\"]}\
        ]}\n```";
        let plan = parse_plan_json(text, "roadmap status").unwrap();
        assert!(plan.requires_synthesis);
        assert_eq!(plan.steps[1].context_keys, vec!["answer".to_string()]);
        assert_eq!(plan.original_query, "roadmap status");
        assert!(!plan.plan_id.is_empty());
    }

    #[test]
    fn test_extract_json() {
        assert_eq!(extract_json("```json\n{\"a\":1}\n```"), Some("{\"a\":1}"));
        assert_eq!(extract_json("{\"a\":1}"), Some("{\"a\":1}"));
        assert_eq!(extract_json("no json here"), None);
        assert_eq!(extract_json("} backwards {"), None);
    }
}
