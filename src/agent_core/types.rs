//! Shared types for the agent core.
//!
//! Persisted session, turn, tool-call and memory records used by the
//! database layer and the memory store.

use serde::{Deserialize, Serialize};

use crate::inference::types::ChatMessage;

// ─── Sessions ───────────────────────────────────────────────────────────────

/// Whether a session covers a whole schema or a single table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    /// The whole schema of a connection.
    Collection,
    /// One table.
    Context,
}

impl SessionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionMode::Collection => "collection",
            SessionMode::Context => "context",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "collection" => Some(SessionMode::Collection),
            "context" => Some(SessionMode::Context),
            _ => None,
        }
    }

    /// `context` when exactly one table is in scope.
    pub fn for_tables(tables: &[String]) -> Self {
        if tables.len() == 1 {
            SessionMode::Context
        } else {
            SessionMode::Collection
        }
    }
}

/// Metadata for a conversation session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Unique session identifier.
    pub id: String,
    /// The connection this session belongs to.
    pub connection_id: String,
    pub mode: SessionMode,
    /// ISO 8601 creation timestamp.
    pub created_at: String,
    /// ISO 8601 last activity timestamp (the only mutable field).
    pub last_activity: String,
}

// ─── Turns ──────────────────────────────────────────────────────────────────

/// One append-only conversation entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub id: String,
    pub session_id: String,
    /// Messages in their original order.
    pub messages: Vec<ChatMessage>,
    /// ISO 8601 timestamp.
    pub created_at: String,
}

// ─── Tool Calls ─────────────────────────────────────────────────────────────

/// Lifecycle of a recorded tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Pending,
    Success,
    Error,
}

impl ToolCallStatus {
    /// Convert to database string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolCallStatus::Pending => "pending",
            ToolCallStatus::Success => "success",
            ToolCallStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ToolCallStatus::Pending),
            "success" => Some(ToolCallStatus::Success),
            "error" => Some(ToolCallStatus::Error),
            _ => None,
        }
    }
}

/// A tool call as recorded alongside its turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    /// Unique within the turn.
    pub id: String,
    pub turn_id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
    pub status: ToolCallStatus,
    pub result: Option<serde_json::Value>,
}

// ─── Long-Term Memory ───────────────────────────────────────────────────────

/// A remembered fact scoped to a connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryFact {
    pub id: i64,
    pub fact: String,
    /// Connection reference the fact applies to.
    pub scope: String,
    /// In [0, 1]; raised, never lowered, on re-upsert.
    pub importance: f64,
    /// sha256 of the normalized fact text.
    pub fact_hash: String,
    pub created_at: String,
    pub updated_at: String,
}
