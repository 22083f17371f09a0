//! SQL and reasoning extraction from free-form model output.
//!
//! Providers that don't return SQL in a structured field get it pulled out of
//! the answer text: fenced code blocks first, then a statement heuristic.
//! Reasoning wrapped in `<thinking>` / `<think>` tags is split from the answer.

use std::sync::OnceLock;

use regex::Regex;

use super::types::Completion;

fn fence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)```[ \t]*([A-Za-z0-9_-]*)[ \t]*\r?\n(.*?)```").expect("static regex")
    })
}

fn statement_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?im)^[ \t]*(?:SELECT|INSERT|UPDATE|DELETE|CREATE|WITH)\b[\s\S]*?;")
            .expect("static regex")
    })
}

fn thinking_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<think(?:ing)?>(.*?)</think(?:ing)?>").expect("static regex"))
}

fn sql_keyword_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^\s*(?:SELECT|INSERT|UPDATE|DELETE|CREATE|WITH)\b").expect("static regex")
    })
}

/// Extract the first SQL statement from assistant text.
///
/// Order of preference:
/// 1. A ```` ```sql ```` fenced block.
/// 2. An untagged fenced block whose body starts with a SQL keyword.
/// 3. A line starting with `SELECT|INSERT|UPDATE|DELETE|CREATE|WITH` and
///    running to the first `;`.
pub fn extract_sql(text: &str) -> Option<String> {
    let mut untagged: Option<String> = None;

    for caps in fence_re().captures_iter(text) {
        let lang = caps.get(1).map(|m| m.as_str()).unwrap_or("");
        let body = caps.get(2).map(|m| m.as_str().trim()).unwrap_or("");
        if body.is_empty() {
            continue;
        }
        if lang.eq_ignore_ascii_case("sql") {
            return Some(body.to_string());
        }
        if lang.is_empty() && untagged.is_none() && sql_keyword_re().is_match(body) {
            untagged = Some(body.to_string());
        }
    }

    if untagged.is_some() {
        return untagged;
    }

    statement_re()
        .find(text)
        .map(|m| m.as_str().trim().to_string())
}

/// Split reasoning from the answer.
///
/// Returns `(thinking, answer)`. Multiple reasoning blocks are joined with a
/// blank line. An unterminated opening tag treats the remainder as reasoning.
pub fn split_thinking(text: &str) -> (Option<String>, String) {
    let mut thoughts: Vec<String> = thinking_re()
        .captures_iter(text)
        .filter_map(|c| c.get(1).map(|m| m.as_str().trim().to_string()))
        .filter(|t| !t.is_empty())
        .collect();
    let mut answer = thinking_re().replace_all(text, "").to_string();

    for open in ["<thinking>", "<think>"] {
        if let Some(idx) = answer.find(open) {
            let tail = answer[idx + open.len()..].trim().to_string();
            if !tail.is_empty() {
                thoughts.push(tail);
            }
            answer.truncate(idx);
            break;
        }
    }

    let thinking = if thoughts.is_empty() {
        None
    } else {
        Some(thoughts.join("\n\n"))
    };
    (thinking, answer.trim().to_string())
}

/// Build a `Completion` from raw round text.
///
/// Structured values supplied by the provider win over anything extracted.
pub fn complete(
    raw_text: &str,
    structured_sql: Option<String>,
    structured_thinking: Option<String>,
) -> Completion {
    let (tagged_thinking, answer) = split_thinking(raw_text);
    let thinking = match (structured_thinking.filter(|t| !t.trim().is_empty()), tagged_thinking) {
        (Some(s), Some(t)) => Some(format!("{s}\n\n{t}")),
        (s, t) => s.or(t),
    };
    let sql = structured_sql
        .filter(|s| !s.trim().is_empty())
        .or_else(|| extract_sql(&answer));
    Completion {
        final_text: answer,
        sql,
        thinking,
        thinking_blocks: Vec::new(),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
