//! Token estimation and UTF-8 safe truncation.
//!
//! Uses character-based heuristics calibrated for LLM tokenizers:
//! - English prose: ~3.2 chars/token (conservative, overestimates)
//! - JSON/structured content: ~2.8 chars/token (denser due to punctuation)
//!
//! Used to budget replayed history and to cap tool result text.

use crate::inference::types::{ChatMessage, Role};

// ─── Constants ──────────────────────────────────────────────────────────────

/// Average characters per token for English prose.
const CHARS_PER_TOKEN: f64 = 3.2;

/// Average characters per token for JSON/structured content.
const JSON_CHARS_PER_TOKEN: f64 = 2.8;

/// Per-message overhead (role label, formatting tokens).
const MESSAGE_OVERHEAD_TOKENS: u32 = 4;

/// Overhead for tool call JSON structure (per call).
const TOOL_CALL_OVERHEAD_TOKENS: u32 = 10;

/// Appended when tool output is cut short.
const TRUNCATION_MARKER: &str = "\n…[truncated]";

// ─── UTF-8 Safe Truncation ──────────────────────────────────────────────────

/// Truncate a string to at most `max_bytes` bytes on a valid UTF-8 char boundary.
pub fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    // Walk backward to find a valid char boundary
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Truncate to `max_bytes` and mark the cut, or return the text unchanged.
pub fn truncate_with_marker(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    format!("{}{TRUNCATION_MARKER}", truncate_utf8(s, max_bytes))
}

// ─── Estimation ─────────────────────────────────────────────────────────────

/// Estimate the token count for a string of natural language text.
pub fn estimate_tokens(text: &str) -> u32 {
    let chars = text.len() as f64;
    (chars / CHARS_PER_TOKEN).ceil() as u32
}

/// Estimate the token count for JSON/structured content.
pub fn estimate_json_tokens(json_text: &str) -> u32 {
    let chars = json_text.len() as f64;
    (chars / JSON_CHARS_PER_TOKEN).ceil() as u32
}

/// Estimate the token count for a `ChatMessage`.
///
/// Tool results and tool-call arguments use the JSON estimator; everything
/// else is prose.
pub fn estimate_message_tokens(message: &ChatMessage) -> u32 {
    let mut total = MESSAGE_OVERHEAD_TOKENS;

    if let Some(ref content) = message.content {
        total += match message.role {
            Role::Tool => estimate_json_tokens(content),
            _ => estimate_tokens(content),
        };
    }

    if let Some(ref calls) = message.tool_calls {
        for call in calls {
            total += TOOL_CALL_OVERHEAD_TOKENS;
            total += estimate_tokens(&call.name);
            total += estimate_json_tokens(&call.arguments.to_string());
        }
    }

    if let Some(ref id) = message.tool_call_id {
        total += estimate_tokens(id);
    }

    total
}

/// Keep the newest messages that fit in `budget` tokens, oldest first.
///
/// A leading `tool` message whose assistant call was cut is dropped too, so
/// the replayed history never starts mid tool exchange.
pub fn fit_to_budget(messages: Vec<ChatMessage>, budget: u32) -> Vec<ChatMessage> {
    let mut used = 0u32;
    let mut keep_from = messages.len();
    for (i, message) in messages.iter().enumerate().rev() {
        let cost = estimate_message_tokens(message);
        if used + cost > budget {
            break;
        }
        used += cost;
        keep_from = i;
    }

    let mut kept: Vec<ChatMessage> = messages.into_iter().skip(keep_from).collect();
    while kept.first().is_some_and(|m| m.role == Role::Tool) {
        kept.remove(0);
    }
    kept
}

// ─── Tests ──────────────────────────────────────────────────────────────────
