//! Text helpers for previews, log fields and templated answers.

// ─── UTF-8 Safe Truncation ──────────────────────────────────────────────────

/// Truncate a string to at most `max_bytes` bytes on a valid UTF-8 char boundary.
///
/// If the byte at `max_bytes` is inside a multi-byte character, the slice is
/// shortened to the preceding character boundary.
pub(crate) fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Truncate with a trailing ellipsis when anything was cut.
pub(crate) fn ellipsize(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        s.to_string()
    } else {
        format!("{}...", truncate_utf8(s, max_bytes))
    }
}

// ─── Value Summaries ────────────────────────────────────────────────────────

/// Summarize a JSON value into a single line for previews and answers.
///
/// Strings are returned as-is (truncated), arrays report their length and
/// first items, everything else is compact JSON.
pub fn summarize_value(value: &serde_json::Value, max_bytes: usize) -> String {
    match value {
        serde_json::Value::String(s) => ellipsize(s, max_bytes),
        serde_json::Value::Array(items) => {
            let head: Vec<String> = items
                .iter()
                .take(3)
                .map(|v| match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other
                        .get("title")
                        .or_else(|| other.get("name"))
                        .and_then(|t| t.as_str())
                        .map(String::from)
                        .unwrap_or_else(|| other.to_string()),
                })
                .collect();
            let more = items.len().saturating_sub(head.len());
            let mut line = format!("{} item(s): {}", items.len(), head.join(", "));
            if more > 0 {
                line.push_str(&format!(" (+{more} more)"));
            }
            ellipsize(&line, max_bytes)
        }
        serde_json::Value::Null => String::new(),
        other => ellipsize(&other.to_string(), max_bytes),
    }
}

/// Count how many keyword groups have at least one member in `lower_text`.
///
/// Each group is a set of synonyms; the text must already be lowercase.
pub(crate) fn keyword_score(lower_text: &str, groups: &[&[&str]]) -> usize {
    groups
        .iter()
        .filter(|group| group.iter().any(|kw| lower_text.contains(kw)))
        .count()
}

/// Whether any of `keywords` occurs in `lower_text`.
pub(crate) fn contains_any(lower_text: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|kw| lower_text.contains(kw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_utf8_respects_char_boundary() {
        let s = "héllo";
        // 'é' is two bytes at positions 1..3
        assert_eq!(truncate_utf8(s, 2), "h");
        assert_eq!(truncate_utf8(s, 3), "hé");
        assert_eq!(truncate_utf8(s, 100), s);
    }

    #[test]
    fn test_ellipsize() {
        assert_eq!(ellipsize("short", 10), "short");
        assert_eq!(ellipsize("a longer line", 6), "a long...");
    }

    #[test]
    fn test_summarize_array_uses_titles() {
        let value = serde_json::json!([
            {"title": "Fix login"},
            {"title": "Ship v2"},
            {"name": "Roadmap"},
            {"title": "Fourth"}
        ]);
        let line = summarize_value(&value, 200);
        assert!(line.starts_with("4 item(s): Fix login, Ship v2, Roadmap"));
        assert!(line.ends_with("(+1 more)"));
    }

    #[test]
    fn test_keyword_score_counts_groups() {
        let score = keyword_score(
            "create a task and update the doc",
            &[&["create", "add"], &["task"], &["board"]],
        );
        assert_eq!(score, 2);
        assert!(contains_any("show overdue tasks", &["overdue", "late"]));
    }
}
