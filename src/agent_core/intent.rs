//! Intent classifier: maps a raw query (plus recent conversation) to an [`Intent`].
//!
//! Two paths:
//! - **model**: when a [`LanguageModel`] is configured, ask it for a JSON
//!   intent object and validate it
//! - **keywords**: synonym-group scoring over the lowercased query
//!
//! Any model failure (transport, malformed JSON, unknown labels) falls back
//! to the keyword rules. Classification never fails: unclassifiable input
//! yields `UNKNOWN` with confidence 0.0 and agent `both`.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;

use super::plan_builder::extract_json;
use super::text::{contains_any, keyword_score, truncate_utf8};
use super::types::{AgentKind, ConversationTurn, Intent, IntentType};
use crate::inference::LanguageModel;

/// Turns of history considered for context.
const HISTORY_TURNS: usize = 6;

// ─── Keyword Groups ─────────────────────────────────────────────────────────

const CREATE_VERBS: &[&str] = &[
    "create", "add ", "make a", "make an", "new ", "draft", "open a", "set up", "write a",
];
const UPDATE_VERBS: &[&str] = &[
    "update", "change", "edit", "modify", "mark ", "move ", "rename", "close ", "reopen",
];
const ASSIGN_VERBS: &[&str] = &["assign", "reassign", "delegate", "hand over", "hand off"];

const DOCUMENT_NOUNS: &[&str] = &[
    "document", "doc ", "docs", "doc?", "file", "note", "page", "wiki", "report", "pdf", "spec ",
];
const TASK_NOUNS: &[&str] = &[
    "task", "todo", "to-do", "ticket", "issue", "deadline", "overdue", "assignment",
];
const BOARD_NOUNS: &[&str] = &["board", "kanban", "column", "swimlane", "sprint"];

const QUERY_CUES: &[&str] = &[
    "what", "which", "who", "when", "where", "show", "list", "are there", "is there", "any ", "?",
];
const SUMMARY_CUES: &[&str] = &["summarize", "summarise", "summary", "tl;dr", "tldr", "gist"];
const SEARCH_CUES: &[&str] = &["search", "find", "look up", "lookup", "mention"];
const ANALYTICS_CUES: &[&str] = &[
    "how many", "count", "stats", "statistics", "velocity", "rate", "breakdown", "analytics",
    "trend",
];
const STATUS_CUES: &[&str] = &["status", "progress", "where are we", "how is", "how's"];
/// Openers that make a sentence a read even when it contains a write verb.
const QUESTION_OPENERS: &[&str] = &[
    "what", "which", "who", "when", "where", "why", "how", "are ", "is ", "do ", "does ", "did ",
    "show", "list",
];
const OVERVIEW_CUES: &[&str] = &[
    "overview",
    "catch me up",
    "everything",
    "whole workspace",
    "entire workspace",
    "what's happening",
    "what is happening",
    "what's going on",
];

// ─── Classifier ─────────────────────────────────────────────────────────────

/// Intent classifier with an optional model front end.
#[derive(Clone, Default)]
pub struct IntentClassifier {
    model: Option<Arc<dyn LanguageModel>>,
}

impl IntentClassifier {
    /// Keyword-only classifier.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(model: Arc<dyn LanguageModel>) -> Self {
        Self { model: Some(model) }
    }

    /// Classify a query. Never fails.
    pub async fn classify(
        &self,
        query: &str,
        workspace_id: &str,
        history: &[ConversationTurn],
    ) -> Intent {
        let recent = recent_turns(history);

        let intent = match &self.model {
            Some(model) => match classify_with_model(model.as_ref(), query, recent).await {
                Ok(intent) => intent,
                Err(reason) => {
                    tracing::warn!(
                        model = %model.name(),
                        reason = %reason,
                        "model classification failed, using keyword rules"
                    );
                    classify_keywords(query, recent)
                }
            },
            None => classify_keywords(query, recent),
        };

        tracing::info!(
            workspace_id = %workspace_id,
            intent = ?intent.intent_type,
            agent = %intent.agent,
            confidence = intent.confidence,
            decompose = intent.requires_decomposition,
            entities = intent.entities.len(),
            "intent classified"
        );
        intent
    }
}

fn recent_turns(history: &[ConversationTurn]) -> &[ConversationTurn] {
    &history[history.len().saturating_sub(HISTORY_TURNS)..]
}

// ─── Model Path ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RawIntent {
    #[serde(rename = "type")]
    intent_type: String,
    #[serde(default)]
    confidence: Option<f32>,
    #[serde(default)]
    agent: Option<String>,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    entities: HashMap<String, serde_json::Value>,
    #[serde(default)]
    requires_decomposition: Option<bool>,
}

fn classification_prompt(query: &str, history: &[ConversationTurn]) -> String {
    let context = if history.is_empty() {
        "(none)".to_string()
    } else {
        history
            .iter()
            .map(|t| format!("{}: {}", t.role, truncate_utf8(&t.content, 300)))
            .collect::<Vec<_>>()
            .join("\n")
    };
    format!(
        "Classify the user's request for a workspace assistant with document, task and board agents.\n\n\
         Recent conversation:\n{context}\n\n\
         Request: \"{query}\"\n\n\
         Respond with ONLY a JSON object:\n\
         {{\"type\": one of DOCUMENT_QUERY, DOCUMENT_SUMMARY, DOCUMENT_SEARCH, DOCUMENT_CREATE, \
         DOCUMENT_UPDATE, TASK_QUERY, TASK_STATUS, TASK_ANALYTICS, TASK_CREATE, TASK_UPDATE, \
         TASK_ASSIGN, BOARD_QUERY, BOARD_CREATE, BOARD_UPDATE, HYBRID_QUERY, WORKSPACE_OVERVIEW, UNKNOWN,\n \
         \"confidence\": number between 0 and 1,\n \
         \"agent\": one of document, task, board, both,\n \
         \"reasoning\": short explanation,\n \
         \"entities\": object of string values (title, assignee, priority, due, status),\n \
         \"requires_decomposition\": true if more than one agent is needed}}"
    )
}

async fn classify_with_model(
    model: &dyn LanguageModel,
    query: &str,
    history: &[ConversationTurn],
) -> Result<Intent, String> {
    let text = model
        .infer(&classification_prompt(query, history))
        .await
        .map_err(|e| e.to_string())?;
    let json = extract_json(&text).ok_or("no JSON object in model output")?;
    let raw: RawIntent =
        serde_json::from_str(json).map_err(|e| format!("malformed intent JSON: {e}"))?;

    let intent_type = IntentType::parse(&raw.intent_type)
        .ok_or_else(|| format!("unknown intent type '{}'", raw.intent_type))?;
    let agent = match raw.agent.as_deref().map(parse_agent) {
        Some(Some(agent)) => agent,
        Some(None) => return Err(format!("unknown agent '{}'", raw.agent.unwrap_or_default())),
        None => intent_type.default_agent(),
    };
    if intent_type == IntentType::Unknown {
        return Ok(Intent::unknown(raw.reasoning));
    }

    let mut entities: HashMap<String, String> = raw
        .entities
        .into_iter()
        .filter_map(|(k, v)| match v {
            serde_json::Value::String(s) if !s.trim().is_empty() => Some((k, s)),
            serde_json::Value::Number(n) => Some((k, n.to_string())),
            _ => None,
        })
        .collect();
    for (k, v) in extract_entities(query) {
        entities.entry(k).or_insert(v);
    }

    let decompose = raw.requires_decomposition.unwrap_or(false)
        || matches!(
            intent_type,
            IntentType::HybridQuery | IntentType::WorkspaceOverview
        );
    Ok(Intent::new(
        intent_type,
        raw.confidence.unwrap_or(0.5),
        agent,
        raw.reasoning,
    )
    .with_entities(entities)
    .with_decomposition(decompose))
}

fn parse_agent(s: &str) -> Option<AgentKind> {
    serde_json::from_value(serde_json::Value::String(s.trim().to_lowercase())).ok()
}

// ─── Keyword Path ───────────────────────────────────────────────────────────

/// Which entity nouns a text mentions, with the byte offset of the first hit.
fn mentioned_agents(lower: &str) -> Vec<(usize, AgentKind)> {
    let mut found: Vec<(usize, AgentKind)> = [
        (DOCUMENT_NOUNS, AgentKind::Document),
        (TASK_NOUNS, AgentKind::Task),
        (BOARD_NOUNS, AgentKind::Board),
    ]
    .iter()
    .filter_map(|(nouns, agent)| {
        nouns
            .iter()
            .filter_map(|n| lower.find(n))
            .min()
            .map(|pos| (pos, *agent))
    })
    .collect();
    found.sort();
    found
}

fn classify_keywords(query: &str, history: &[ConversationTurn]) -> Intent {
    // Trailing space lets word-final nouns ("the doc") match "doc ".
    let lower = format!("{} ", query.trim().to_lowercase());
    if lower.trim().is_empty() {
        return Intent::unknown("empty query");
    }

    let entities = extract_entities(query);

    if contains_any(&lower, OVERVIEW_CUES) {
        return Intent::new(
            IntentType::WorkspaceOverview,
            0.8,
            AgentKind::Both,
            "overview cue",
        )
        .with_entities(entities)
        .with_decomposition(true);
    }

    let mut agents = mentioned_agents(&lower);
    let mut from_history = false;
    if agents.is_empty() {
        if let Some(found) = history.iter().rev().find_map(|turn| {
            let found = mentioned_agents(&format!("{} ", turn.content.to_lowercase()));
            (!found.is_empty()).then_some(found)
        }) {
            agents = found;
            from_history = true;
        }
    }

    let verb = write_verb(&lower);

    let (intent_type, agent, decompose) = match agents.as_slice() {
        [] => return Intent::unknown("no document, task or board cue"),
        [(_, agent)] => (single_agent_type(&lower, *agent, verb), *agent, false),
        [(_, first), ..] if verb.is_some() => {
            (single_agent_type(&lower, *first, verb), *first, false)
        }
        _ => (IntentType::HybridQuery, AgentKind::Both, true),
    };

    let cue_groups: &[&[&str]] = &[
        CREATE_VERBS,
        UPDATE_VERBS,
        ASSIGN_VERBS,
        QUERY_CUES,
        SUMMARY_CUES,
        SEARCH_CUES,
        ANALYTICS_CUES,
        STATUS_CUES,
    ];
    let mut confidence: f32 = 0.6;
    if !from_history {
        confidence += 0.1;
    }
    if keyword_score(&lower, cue_groups) > 0 {
        confidence += 0.1;
    }
    if !entities.is_empty() {
        confidence += 0.1;
    }

    let reasoning = format!(
        "keyword rules matched {}{}",
        agents
            .iter()
            .map(|(_, a)| a.as_str())
            .collect::<Vec<_>>()
            .join(" + "),
        if from_history { " (from conversation)" } else { "" }
    );
    Intent::new(intent_type, confidence.min(0.9), agent, reasoning)
        .with_entities(entities)
        .with_decomposition(decompose)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteVerb {
    Create,
    Update,
    Assign,
}

/// The earliest write verb in the text, unless the text is phrased as a question.
fn write_verb(lower: &str) -> Option<WriteVerb> {
    if QUESTION_OPENERS.iter().any(|q| lower.starts_with(q)) {
        return None;
    }
    let first_hit = |verbs: &[&str]| verbs.iter().filter_map(|v| lower.find(v)).min();
    [
        (first_hit(ASSIGN_VERBS), WriteVerb::Assign),
        (first_hit(UPDATE_VERBS), WriteVerb::Update),
        (first_hit(CREATE_VERBS), WriteVerb::Create),
    ]
    .into_iter()
    .filter_map(|(pos, verb)| pos.map(|p| (p, verb)))
    .min_by_key(|(pos, _)| *pos)
    .map(|(_, verb)| verb)
}

fn single_agent_type(lower: &str, agent: AgentKind, verb: Option<WriteVerb>) -> IntentType {
    match (agent, verb) {
        (AgentKind::Task, Some(WriteVerb::Assign)) => IntentType::TaskAssign,
        (AgentKind::Task, Some(WriteVerb::Create)) => IntentType::TaskCreate,
        (AgentKind::Task, Some(WriteVerb::Update)) => IntentType::TaskUpdate,
        (AgentKind::Task, None) if contains_any(lower, ANALYTICS_CUES) => IntentType::TaskAnalytics,
        (AgentKind::Task, None) if contains_any(lower, STATUS_CUES) => IntentType::TaskStatus,
        (AgentKind::Task, None) => IntentType::TaskQuery,
        (AgentKind::Document, Some(WriteVerb::Create)) => IntentType::DocumentCreate,
        (AgentKind::Document, Some(_)) => IntentType::DocumentUpdate,
        (AgentKind::Document, None) if contains_any(lower, SUMMARY_CUES) => {
            IntentType::DocumentSummary
        }
        (AgentKind::Document, None) if contains_any(lower, SEARCH_CUES) => {
            IntentType::DocumentSearch
        }
        (AgentKind::Document, None) => IntentType::DocumentQuery,
        (AgentKind::Board, Some(WriteVerb::Create)) => IntentType::BoardCreate,
        (AgentKind::Board, Some(_)) => IntentType::BoardUpdate,
        (AgentKind::Board, None) => IntentType::BoardQuery,
        (AgentKind::Both, _) => IntentType::HybridQuery,
    }
}

// ─── Entity Extraction ──────────────────────────────────────────────────────

/// Best-effort entity extraction. Missing entities are not an error.
pub fn extract_entities(query: &str) -> HashMap<String, String> {
    let mut entities = HashMap::new();
    let lower = query.to_lowercase();

    if let Some(title) = extract_title(query) {
        entities.insert("title".to_string(), title);
    }
    if let Some(assignee) = extract_assignee(query) {
        entities.insert("assignee".to_string(), assignee);
    }

    let priority = if lower.contains("urgent") {
        Some("urgent")
    } else {
        ["high", "medium", "low"].into_iter().find(|p| {
            lower.contains(&format!("{p} priority")) || lower.contains(&format!("{p}-priority"))
        })
    };
    if let Some(p) = priority {
        entities.insert("priority".to_string(), p.to_string());
    }

    if let Some(due) = extract_due(query, &lower) {
        entities.insert("due".to_string(), due);
    }

    let status = if lower.contains("overdue") {
        Some("overdue")
    } else if lower.contains("in progress") || lower.contains("in-progress") {
        Some("in_progress")
    } else if lower.contains("blocked") {
        Some("blocked")
    } else if lower.contains("todo") || lower.contains("to-do") || lower.contains("to do") {
        Some("todo")
    } else if lower.contains(" done") || lower.contains("completed") {
        Some("done")
    } else {
        None
    };
    if let Some(s) = status {
        entities.insert("status".to_string(), s.to_string());
    }
    entities
}

/// Quoted text, or the words after "titled" / "called" / "named".
fn extract_title(text: &str) -> Option<String> {
    for quote in ['"', '\''] {
        let mut rest = text;
        while let Some(start) = rest.find(quote) {
            let after = &rest[start + 1..];
            let Some(end) = after.find(quote) else { break };
            let content = after[..end].trim();
            if (2..=200).contains(&content.len()) {
                return Some(content.to_string());
            }
            rest = &after[end + 1..];
        }
    }

    let lower = text.to_lowercase();
    for prefix in ["titled ", "called ", "named "] {
        if let Some(idx) = lower.find(prefix) {
            let after = &text[idx + prefix.len()..];
            let end = after.find([',', '.', '\n', '?']).unwrap_or(after.len());
            let title = after[..end].trim();
            if !title.is_empty() && title.len() <= 200 {
                return Some(title.to_string());
            }
        }
    }
    None
}

/// `@handle`, or a capitalised name after "to" / "for".
fn extract_assignee(text: &str) -> Option<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    if let Some(handle) = words.iter().find_map(|w| w.strip_prefix('@')) {
        let handle = handle.trim_end_matches(|c: char| !c.is_alphanumeric() && c != '_');
        if !handle.is_empty() {
            return Some(handle.to_string());
        }
    }
    words.windows(2).find_map(|pair| {
        let lead = pair[0].to_lowercase();
        let name = pair[1].trim_end_matches(|c: char| !c.is_alphanumeric());
        let capitalised = name.chars().next().is_some_and(|c| c.is_uppercase());
        ((lead == "to" || lead == "for") && capitalised && name.len() > 1)
            .then(|| name.to_string())
    })
}

fn extract_due(text: &str, lower: &str) -> Option<String> {
    for phrase in ["today", "tomorrow", "this week", "next week", "end of week"] {
        if lower.contains(phrase) {
            return Some(phrase.to_string());
        }
    }
    text.split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_ascii_alphanumeric() && c != '-'))
        .find(|w| {
            w.len() == 10
                && w.as_bytes().get(4) == Some(&b'-')
                && w.as_bytes().get(7) == Some(&b'-')
                && w.chars().filter(|c| c.is_ascii_digit()).count() == 8
        })
        .map(String::from)
}
