//! MemoryStore — short- and long-term memory over `AgentDatabase`.
//!
//! Responsibilities:
//! - Create or reuse the session for a (connection, mode) pair
//! - Append completed turns and replay recent ones as history
//! - Upsert and load long-term memory facts per connection
//!
//! Persistence is best effort: every failure except an explicit session
//! delete is logged and swallowed so a turn never fails on storage.

use std::sync::{Mutex, MutexGuard};

use crate::config::MemoryConfig;
use crate::inference::types::ChatMessage;

use super::database::AgentDatabase;
use super::errors::AgentError;
use super::tokens;
use super::types::{MemoryFact, SessionMode, Turn};

// ─── MemoryStore ────────────────────────────────────────────────────────────

/// Shared handle: one rusqlite connection behind a `std::sync::Mutex`.
pub struct MemoryStore {
    db: Mutex<AgentDatabase>,
    recent_turns: usize,
    memory_facts: usize,
    history_token_budget: u32,
}

impl MemoryStore {
    pub fn new(db: AgentDatabase, config: &MemoryConfig) -> Self {
        Self {
            db: Mutex::new(db),
            recent_turns: config.recent_turns,
            memory_facts: config.memory_facts,
            history_token_budget: config.history_token_budget,
        }
    }

    /// Open the database at `path` (`":memory:"` for tests).
    pub fn open(path: &str, config: &MemoryConfig) -> Result<Self, AgentError> {
        Ok(Self::new(AgentDatabase::open(path)?, config))
    }

    fn db(&self) -> Result<MutexGuard<'_, AgentDatabase>, AgentError> {
        self.db.lock().map_err(|_| AgentError::DatabaseError {
            reason: "memory store lock poisoned".to_string(),
        })
    }

    // ─── Sessions ───────────────────────────────────────────────────────

    /// Resolve the session for this request.
    ///
    /// A requested id is reused when it belongs to the same connection, or
    /// created under that id when unknown. Without one, the latest session of
    /// the (connection, mode) pair is reused.
    pub fn create_or_reuse_session(
        &self,
        requested: Option<&str>,
        connection_id: &str,
        mode: SessionMode,
    ) -> Option<String> {
        let result = self.db().and_then(|db| {
            if let Some(id) = requested.filter(|id| !id.trim().is_empty()) {
                match db.get_session(id)? {
                    Some(session) if session.connection_id == connection_id => {
                        db.touch_session(id)?;
                        return Ok(session.id);
                    }
                    Some(_) => {
                        tracing::warn!(
                            session_id = %id,
                            connection_id = %connection_id,
                            "session belongs to another connection, starting a new one"
                        );
                    }
                    None => return Ok(db.create_session(id, connection_id, mode)?.id),
                }
            } else if let Some(session) = db.find_latest_session(connection_id, mode)? {
                db.touch_session(&session.id)?;
                return Ok(session.id);
            }
            let id = uuid::Uuid::new_v4().to_string();
            Ok(db.create_session(&id, connection_id, mode)?.id)
        });
        swallow(result, "create_or_reuse_session")
    }

    /// Explicit user deletion. Errors surface; returns whether it existed.
    pub fn delete_session(&self, session_id: &str) -> Result<bool, AgentError> {
        let deleted = self.db()?.delete_session(session_id)?;
        tracing::info!(session_id = %session_id, deleted, "session delete");
        Ok(deleted)
    }

    // ─── Turns ──────────────────────────────────────────────────────────

    /// Persist a completed turn; also bumps the session's last activity.
    pub fn append_turn(&self, session_id: &str, messages: &[ChatMessage]) -> Option<String> {
        let result = self.db().and_then(|db| db.insert_turn(session_id, messages));
        let turn_id = swallow(result, "append_turn")?;
        tracing::debug!(
            session_id = %session_id,
            turn_id = %turn_id,
            messages = messages.len(),
            "turn persisted"
        );
        Some(turn_id)
    }

    /// The most recent turns, oldest first.
    pub fn load_recent_turns(&self, session_id: &str, limit: usize) -> Vec<Turn> {
        let result = self.db().and_then(|db| db.get_recent_turns(session_id, limit));
        swallow(result, "load_recent_turns").unwrap_or_default()
    }

    /// Prior conversation replayed ahead of the new query, within budget.
    pub fn history(&self, session_id: &str) -> Vec<ChatMessage> {
        let messages: Vec<ChatMessage> = self
            .load_recent_turns(session_id, self.recent_turns)
            .into_iter()
            .flat_map(|turn| turn.messages)
            .collect();
        tokens::fit_to_budget(messages, self.history_token_budget)
    }

    // ─── Long-Term Memory ───────────────────────────────────────────────

    pub fn upsert_long_term_memory(&self, fact: &str, scope: &str, importance: f64) {
        if fact.trim().is_empty() {
            return;
        }
        let result = self.db().and_then(|db| db.upsert_memory(fact, scope, importance));
        swallow(result, "upsert_long_term_memory");
    }

    /// Facts for a connection, most important first.
    pub fn load_memory_facts(&self, scope: &str, limit: usize) -> Vec<MemoryFact> {
        let result = self.db().and_then(|db| db.get_memory_facts(scope, limit));
        swallow(result, "load_memory_facts").unwrap_or_default()
    }

    /// Top facts using the configured limit.
    pub fn top_facts(&self, scope: &str) -> Vec<MemoryFact> {
        self.load_memory_facts(scope, self.memory_facts)
    }
}

fn swallow<T>(result: Result<T, AgentError>, operation: &'static str) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(operation, error = %e, "memory persistence failed, continuing");
            None
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryStore {
        MemoryStore::open(":memory:", &MemoryConfig::default()).unwrap()
    }

    #[test]
    fn test_session_reused_per_connection_and_mode() {
        let store = store();
        let a = store
            .create_or_reuse_session(None, "warehouse", SessionMode::Collection)
            .unwrap();
        let b = store
            .create_or_reuse_session(None, "warehouse", SessionMode::Collection)
            .unwrap();
        let c = store
            .create_or_reuse_session(None, "warehouse", SessionMode::Context)
            .unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_requested_session_id() {
        let store = store();
        let id = store
            .create_or_reuse_session(Some("client-1"), "warehouse", SessionMode::Collection)
            .unwrap();
        assert_eq!(id, "client-1");

        // Same id on a different connection never crosses over.
        let other = store
            .create_or_reuse_session(Some("client-1"), "crm", SessionMode::Collection)
            .unwrap();
        assert_ne!(other, "client-1");
    }

    #[test]
    fn test_append_to_missing_session_is_swallowed() {
        let store = store();
        assert!(store.append_turn("ghost", &[ChatMessage::user("hi")]).is_none());
        assert!(store.load_recent_turns("ghost", 5).is_empty());
    }

    #[test]
    fn test_history_flattens_turns_in_order() {
        let store = store();
        let id = store
            .create_or_reuse_session(None, "warehouse", SessionMode::Collection)
            .unwrap();
        store.append_turn(&id, &[ChatMessage::user("q1"), ChatMessage::assistant("a1")]);
        store.append_turn(&id, &[ChatMessage::user("q2"), ChatMessage::assistant("a2")]);

        let history = store.history(&id);
        let texts: Vec<_> = history.iter().filter_map(|m| m.content.clone()).collect();
        assert_eq!(texts, vec!["q1", "a1", "q2", "a2"]);
    }

    #[test]
    fn test_history_respects_budget() {
        let config = MemoryConfig {
            history_token_budget: 10,
            ..MemoryConfig::default()
        };
        let store = MemoryStore::open(":memory:", &config).unwrap();
        let id = store
            .create_or_reuse_session(None, "warehouse", SessionMode::Collection)
            .unwrap();
        store.append_turn(&id, &[ChatMessage::user("a much longer question that costs tokens")]);
        store.append_turn(&id, &[ChatMessage::user("q2")]);

        let history = store.history(&id);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content.as_deref(), Some("q2"));
    }

    #[test]
    fn test_memory_facts_and_delete() {
        let store = store();
        store.upsert_long_term_memory("Revenue lives in orders.total", "warehouse", 0.8);
        store.upsert_long_term_memory("   ", "warehouse", 1.0);
        assert_eq!(store.top_facts("warehouse").len(), 1);

        let id = store
            .create_or_reuse_session(None, "warehouse", SessionMode::Collection)
            .unwrap();
        assert!(store.delete_session(&id).unwrap());
        assert!(!store.delete_session(&id).unwrap());
    }
}
