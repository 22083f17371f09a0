//! SQLite persistence for sessions, turns, tool calls, and long-term memory.
//!
//! Uses `rusqlite` synchronously behind the memory store's mutex. WAL mode
//! is enabled for concurrent reads; foreign keys cascade session deletion
//! to turns, messages and tool calls.

use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};

use super::errors::AgentError;
use super::types::{MemoryFact, Session, SessionMode, ToolCallRecord, ToolCallStatus, Turn};
use crate::inference::types::{ChatMessage, Role, ToolCall};

// ─── Database ───────────────────────────────────────────────────────────────

/// SQLite database handle for the agent core.
pub struct AgentDatabase {
    conn: Connection,
}

impl AgentDatabase {
    /// Open (or create) the agent database at the given path.
    ///
    /// Pass `":memory:"` for an in-memory database (tests).
    pub fn open(path: &str) -> Result<Self, AgentError> {
        let conn = Connection::open(path)?;

        // Enable WAL mode for concurrent reads
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let db = Self { conn };
        db.create_tables()?;
        Ok(db)
    }

    /// Create all required tables if they don't exist.
    fn create_tables(&self) -> Result<(), AgentError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                connection_id TEXT NOT NULL,
                mode TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                last_activity TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_connection
                ON sessions(connection_id, mode, last_activity);

            CREATE TABLE IF NOT EXISTS turns (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_turns_session
                ON turns(session_id);

            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                turn_id TEXT NOT NULL,
                position INTEGER NOT NULL,
                role TEXT NOT NULL,
                content TEXT,
                tool_calls TEXT,
                tool_call_id TEXT,
                UNIQUE (turn_id, position),
                FOREIGN KEY (turn_id) REFERENCES turns(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS tool_calls (
                id TEXT NOT NULL,
                turn_id TEXT NOT NULL,
                tool_name TEXT NOT NULL,
                arguments TEXT NOT NULL,
                status TEXT NOT NULL,
                result TEXT,
                PRIMARY KEY (turn_id, id),
                FOREIGN KEY (turn_id) REFERENCES turns(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS long_term_memory (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                fact TEXT NOT NULL,
                scope TEXT NOT NULL,
                importance REAL NOT NULL,
                fact_hash TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                UNIQUE (scope, fact_hash)
            );
            ",
        )?;
        Ok(())
    }

    // ─── Sessions ───────────────────────────────────────────────────────

    /// Create a new session for a (connection, mode) pair.
    pub fn create_session(
        &self,
        session_id: &str,
        connection_id: &str,
        mode: SessionMode,
    ) -> Result<Session, AgentError> {
        self.conn.execute(
            "INSERT INTO sessions (id, connection_id, mode) VALUES (?1, ?2, ?3)",
            params![session_id, connection_id, mode.as_str()],
        )?;
        self.get_session(session_id)?
            .ok_or_else(|| AgentError::SessionNotFound {
                session_id: session_id.to_string(),
            })
    }

    /// Get a session by ID.
    pub fn get_session(&self, session_id: &str) -> Result<Option<Session>, AgentError> {
        let result = self
            .conn
            .query_row(
                "SELECT id, connection_id, mode, created_at, last_activity
                 FROM sessions WHERE id = ?1",
                params![session_id],
                row_to_session,
            )
            .optional()?;
        Ok(result)
    }

    /// Most recently active session for a (connection, mode) pair.
    pub fn find_latest_session(
        &self,
        connection_id: &str,
        mode: SessionMode,
    ) -> Result<Option<Session>, AgentError> {
        let result = self
            .conn
            .query_row(
                "SELECT id, connection_id, mode, created_at, last_activity
                 FROM sessions
                 WHERE connection_id = ?1 AND mode = ?2
                 ORDER BY last_activity DESC, rowid DESC
                 LIMIT 1",
                params![connection_id, mode.as_str()],
                row_to_session,
            )
            .optional()?;
        Ok(result)
    }

    /// Update the session's last activity timestamp.
    pub fn touch_session(&self, session_id: &str) -> Result<(), AgentError> {
        self.conn.execute(
            "UPDATE sessions SET last_activity = datetime('now') WHERE id = ?1",
            params![session_id],
        )?;
        Ok(())
    }

    /// Delete a session; turns, messages and tool calls cascade.
    ///
    /// Returns whether a session was deleted.
    pub fn delete_session(&self, session_id: &str) -> Result<bool, AgentError> {
        let deleted = self
            .conn
            .execute("DELETE FROM sessions WHERE id = ?1", params![session_id])?;
        Ok(deleted > 0)
    }

    // ─── Turns ──────────────────────────────────────────────────────────

    /// Append a turn with its ordered messages and derived tool-call records.
    pub fn insert_turn(
        &self,
        session_id: &str,
        messages: &[ChatMessage],
    ) -> Result<String, AgentError> {
        if self.get_session(session_id)?.is_none() {
            return Err(AgentError::SessionNotFound {
                session_id: session_id.to_string(),
            });
        }

        let turn_id = uuid::Uuid::new_v4().to_string();
        let tx = self.conn.unchecked_transaction()?;

        tx.execute(
            "INSERT INTO turns (id, session_id) VALUES (?1, ?2)",
            params![turn_id, session_id],
        )?;

        for (position, msg) in messages.iter().enumerate() {
            let tool_calls_json = msg
                .tool_calls
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            tx.execute(
                "INSERT INTO messages (turn_id, position, role, content, tool_calls, tool_call_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    turn_id,
                    position as i64,
                    msg.role.as_str(),
                    msg.content,
                    tool_calls_json,
                    msg.tool_call_id,
                ],
            )?;
        }

        for record in tool_call_records(&turn_id, messages) {
            tx.execute(
                "INSERT OR IGNORE INTO tool_calls (id, turn_id, tool_name, arguments, status, result)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.id,
                    record.turn_id,
                    record.tool_name,
                    record.arguments.to_string(),
                    record.status.as_str(),
                    record.result.as_ref().map(|r| r.to_string()),
                ],
            )?;
        }

        tx.execute(
            "UPDATE sessions SET last_activity = datetime('now') WHERE id = ?1",
            params![session_id],
        )?;
        tx.commit()?;
        Ok(turn_id)
    }

    /// Get the N most recent turns for a session, oldest first.
    pub fn get_recent_turns(&self, session_id: &str, limit: usize) -> Result<Vec<Turn>, AgentError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, session_id, created_at
             FROM turns
             WHERE session_id = ?1
             ORDER BY rowid DESC
             LIMIT ?2",
        )?;

        let rows = stmt.query_map(params![session_id, limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut heads = Vec::new();
        for row in rows {
            heads.push(row?);
        }
        // Reverse so oldest is first
        heads.reverse();

        let mut turns = Vec::with_capacity(heads.len());
        for (id, session_id, created_at) in heads {
            let messages = self.get_turn_messages(&id)?;
            turns.push(Turn {
                id,
                session_id,
                messages,
                created_at,
            });
        }
        Ok(turns)
    }

    /// Messages of one turn in their stored order.
    fn get_turn_messages(&self, turn_id: &str) -> Result<Vec<ChatMessage>, AgentError> {
        let mut stmt = self.conn.prepare(
            "SELECT role, content, tool_calls, tool_call_id
             FROM messages
             WHERE turn_id = ?1
             ORDER BY position ASC",
        )?;

        let rows = stmt.query_map(params![turn_id], |row| {
            let role: String = row.get(0)?;
            let tool_calls: Option<String> = row.get(2)?;
            Ok(ChatMessage {
                role: Role::parse(&role).unwrap_or(Role::User),
                content: row.get(1)?,
                tool_calls: tool_calls.and_then(|j| serde_json::from_str::<Vec<ToolCall>>(&j).ok()),
                tool_call_id: row.get(3)?,
                thinking_blocks: Vec::new(),
            })
        })?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Tool calls recorded for a turn.
    pub fn get_tool_calls(&self, turn_id: &str) -> Result<Vec<ToolCallRecord>, AgentError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, turn_id, tool_name, arguments, status, result
             FROM tool_calls
             WHERE turn_id = ?1
             ORDER BY rowid ASC",
        )?;

        let rows = stmt.query_map(params![turn_id], |row| {
            let arguments: String = row.get(3)?;
            let status: String = row.get(4)?;
            let result: Option<String> = row.get(5)?;
            Ok(ToolCallRecord {
                id: row.get(0)?,
                turn_id: row.get(1)?,
                tool_name: row.get(2)?,
                arguments: parse_json_value(arguments),
                status: ToolCallStatus::parse(&status).unwrap_or(ToolCallStatus::Pending),
                result: result.map(parse_json_value),
            })
        })?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    // ─── Long-Term Memory ───────────────────────────────────────────────

    /// Insert a fact, or raise its importance and refresh its timestamp.
    pub fn upsert_memory(&self, fact: &str, scope: &str, importance: f64) -> Result<(), AgentError> {
        let importance = importance.clamp(0.0, 1.0);
        self.conn.execute(
            "INSERT INTO long_term_memory (fact, scope, importance, fact_hash)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (scope, fact_hash) DO UPDATE SET
                importance = max(importance, excluded.importance),
                updated_at = datetime('now')",
            params![fact.trim(), scope, importance, fact_hash(fact)],
        )?;
        Ok(())
    }

    /// Facts for a scope, most important first.
    pub fn get_memory_facts(&self, scope: &str, limit: usize) -> Result<Vec<MemoryFact>, AgentError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, fact, scope, importance, fact_hash, created_at, updated_at
             FROM long_term_memory
             WHERE scope = ?1
             ORDER BY importance DESC, updated_at DESC, id DESC
             LIMIT ?2",
        )?;

        let rows = stmt.query_map(params![scope, limit as i64], |row| {
            Ok(MemoryFact {
                id: row.get(0)?,
                fact: row.get(1)?,
                scope: row.get(2)?,
                importance: row.get(3)?,
                fact_hash: row.get(4)?,
                created_at: row.get(5)?,
                updated_at: row.get(6)?,
            })
        })?;

        let mut facts = Vec::new();
        for row in rows {
            facts.push(row?);
        }
        Ok(facts)
    }
}

// ─── Helpers ────────────────────────────────────────────────────────────────

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    let mode: String = row.get(2)?;
    Ok(Session {
        id: row.get(0)?,
        connection_id: row.get(1)?,
        mode: SessionMode::parse(&mode).unwrap_or(SessionMode::Collection),
        created_at: row.get(3)?,
        last_activity: row.get(4)?,
    })
}

fn parse_json_value(json: String) -> serde_json::Value {
    serde_json::from_str(&json).unwrap_or(serde_json::Value::String(json))
}

/// sha256 over the lowercased, whitespace-collapsed fact.
pub(crate) fn fact_hash(fact: &str) -> String {
    let normalized = fact
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    format!("{:x}", Sha256::digest(normalized.as_bytes()))
}

/// Pair each assistant tool call with its tool message, if any.
fn tool_call_records(turn_id: &str, messages: &[ChatMessage]) -> Vec<ToolCallRecord> {
    messages
        .iter()
        .filter(|m| m.role == Role::Assistant)
        .flat_map(|m| m.tool_calls.iter().flatten())
        .map(|call| {
            let result = messages
                .iter()
                .find(|m| m.role == Role::Tool && m.tool_call_id.as_deref() == Some(call.id.as_str()))
                .and_then(|m| m.content.clone())
                .map(parse_json_value);
            let status = match result
                .as_ref()
                .and_then(|r| r.get("success"))
                .and_then(|s| s.as_bool())
            {
                Some(true) => ToolCallStatus::Success,
                Some(false) => ToolCallStatus::Error,
                None if result.is_some() => ToolCallStatus::Success,
                None => ToolCallStatus::Pending,
            };
            ToolCallRecord {
                id: call.id.clone(),
                turn_id: turn_id.to_string(),
                tool_name: call.name.clone(),
                arguments: call.arguments.clone(),
                status,
                result,
            }
        })
        .collect()
}

// ─── Tests ──────────────────────────────────────────────────────────────────
