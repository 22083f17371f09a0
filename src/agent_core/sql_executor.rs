//! SQL Executor contract and the reference SQLite implementation.
//!
//! Engines plug in behind `SqlExecutor`; `ConnectionRegistry` maps a
//! request's `connection_id` to one of them. The tool executor is the only
//! caller and has already enforced the read-only policy by the time a
//! statement arrives here.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Connection, InterruptHandle, OpenFlags};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::errors::AgentError;
use crate::config::{expand_tilde, OrchestratorConfig};

// ─── Errors ─────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("table not found: '{table}'")]
    TableNotFound { table: String },

    #[error("sql error: {reason}")]
    Sql { reason: String },

    #[error("executor unavailable: {reason}")]
    Unavailable { reason: String },
}

impl From<rusqlite::Error> for ExecutorError {
    fn from(e: rusqlite::Error) -> Self {
        ExecutorError::Sql {
            reason: e.to_string(),
        }
    }
}

// ─── Types ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub primary_key: bool,
}

/// Result set with rows keyed by column name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryRows {
    pub columns: Vec<String>,
    pub rows: Vec<serde_json::Map<String, serde_json::Value>>,
}

// ─── Contract ───────────────────────────────────────────────────────────────

#[async_trait]
pub trait SqlExecutor: Send + Sync {
    /// Table names, optionally within one schema.
    async fn list_tables(&self, schema: Option<&str>) -> Result<Vec<String>, ExecutorError>;

    /// Column metadata; `TableNotFound` when the table does not exist.
    async fn describe_table(&self, table: &str) -> Result<Vec<ColumnInfo>, ExecutorError>;

    /// Run one statement with positional parameters bound.
    async fn query(&self, sql: &str, params: &[serde_json::Value]) -> Result<QueryRows, ExecutorError>;
}

// ─── SqliteExecutor ─────────────────────────────────────────────────────────

/// Reference executor over one rusqlite connection.
///
/// Calls run on the blocking pool; the connection is shared behind a mutex.
/// Dropping a pending call interrupts its statement (or skips it if it has
/// not started), so a cancelled request releases the connection promptly.
#[derive(Clone)]
pub struct SqliteExecutor {
    conn: Arc<Mutex<Connection>>,
    interrupt: Arc<InterruptHandle>,
}

/// Shared between one pending call and its blocking task.
#[derive(Default)]
struct CallState {
    abandoned: AtomicBool,
    running: AtomicBool,
}

/// Interrupts the call's statement when the awaiting future is dropped.
struct InterruptOnDrop {
    state: Arc<CallState>,
    interrupt: Arc<InterruptHandle>,
    armed: bool,
}

impl Drop for InterruptOnDrop {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.state.abandoned.store(true, Ordering::SeqCst);
        if self.state.running.load(Ordering::SeqCst) {
            tracing::debug!("interrupting abandoned sqlite statement");
            self.interrupt.interrupt();
        }
    }
}

impl SqliteExecutor {
    /// Open an existing database file read-only.
    pub fn open(path: &Path) -> Result<Self, ExecutorError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_URI | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        let interrupt = Arc::new(conn.get_interrupt_handle());
        Self {
            conn: Arc::new(Mutex::new(conn)),
            interrupt,
        }
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, ExecutorError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, ExecutorError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let state = Arc::new(CallState::default());
        let mut guard = InterruptOnDrop {
            state: Arc::clone(&state),
            interrupt: Arc::clone(&self.interrupt),
            armed: true,
        };

        let result = tokio::task::spawn_blocking(move || {
            let locked = conn.lock().map_err(|_| ExecutorError::Unavailable {
                reason: "connection lock poisoned".to_string(),
            })?;
            // Mark running before checking: the drop guard does the reverse,
            // so one side always sees the other.
            state.running.store(true, Ordering::SeqCst);
            if state.abandoned.load(Ordering::SeqCst) {
                state.running.store(false, Ordering::SeqCst);
                return Err(ExecutorError::Unavailable {
                    reason: "call abandoned before it started".to_string(),
                });
            }
            let out = f(&locked);
            state.running.store(false, Ordering::SeqCst);
            out
        })
        .await;
        guard.armed = false;

        result.map_err(|e| ExecutorError::Unavailable {
            reason: e.to_string(),
        })?
    }
}

#[async_trait]
impl SqlExecutor for SqliteExecutor {
    async fn list_tables(&self, schema: Option<&str>) -> Result<Vec<String>, ExecutorError> {
        let schema = schema.unwrap_or("main").to_string();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT name FROM \"{}\".sqlite_master
                 WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%'
                 ORDER BY name",
                schema.replace('"', "\"\"")
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            let mut names = Vec::new();
            for row in rows {
                names.push(row?);
            }
            Ok(names)
        })
        .await
    }

    async fn describe_table(&self, table: &str) -> Result<Vec<ColumnInfo>, ExecutorError> {
        let (schema, name) = match table.split_once('.') {
            Some((s, t)) => (s.to_string(), t.to_string()),
            None => ("main".to_string(), table.to_string()),
        };
        let table = table.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT name, type, \"notnull\", pk FROM pragma_table_info(?1, ?2) ORDER BY cid",
            )?;
            let rows = stmt.query_map([&name, &schema], |row| {
                Ok(ColumnInfo {
                    name: row.get(0)?,
                    data_type: row.get(1)?,
                    nullable: row.get::<_, i64>(2)? == 0,
                    primary_key: row.get::<_, i64>(3)? > 0,
                })
            })?;
            let mut columns = Vec::new();
            for row in rows {
                columns.push(row?);
            }
            if columns.is_empty() {
                return Err(ExecutorError::TableNotFound { table });
            }
            Ok(columns)
        })
        .await
    }

    async fn query(&self, sql: &str, params: &[serde_json::Value]) -> Result<QueryRows, ExecutorError> {
        let sql = sql.to_string();
        let params: Vec<SqlValue> = params.iter().map(to_sql_value).collect();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
            let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;

            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let mut map = serde_json::Map::with_capacity(columns.len());
                for (i, column) in columns.iter().enumerate() {
                    map.insert(column.clone(), from_sql_value(row.get_ref(i)?));
                }
                out.push(map);
            }
            Ok(QueryRows { columns, rows: out })
        })
        .await
    }
}

fn to_sql_value(value: &serde_json::Value) -> SqlValue {
    match value {
        serde_json::Value::Null => SqlValue::Null,
        serde_json::Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        serde_json::Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn from_sql_value(value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        ValueRef::Text(t) => serde_json::Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => serde_json::Value::String(format!("<blob {} bytes>", b.len())),
    }
}

// ─── ConnectionRegistry ─────────────────────────────────────────────────────

/// Maps `connection_id` to an executor, with an optional default.
#[derive(Default, Clone)]
pub struct ConnectionRegistry {
    executors: HashMap<String, Arc<dyn SqlExecutor>>,
    default_id: Option<String>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open every configured SQLite connection.
    pub fn from_config(config: &OrchestratorConfig) -> Result<Self, AgentError> {
        let mut registry = Self::new();
        for (id, conn) in &config.connections {
            let path = PathBuf::from(expand_tilde(&conn.sqlite_path));
            let executor = SqliteExecutor::open(&path).map_err(|e| AgentError::DatabaseError {
                reason: format!("connection '{id}' ({}): {e}", path.display()),
            })?;
            tracing::info!(connection_id = %id, path = %path.display(), "sql connection registered");
            registry.register(id, Arc::new(executor));
        }
        registry.default_id = config.default_connection.clone().or_else(|| {
            // A single connection is the default without saying so.
            (config.connections.len() == 1)
                .then(|| config.connections.keys().next().cloned())
                .flatten()
        });
        Ok(registry)
    }

    pub fn register(&mut self, id: &str, executor: Arc<dyn SqlExecutor>) {
        self.executors.insert(id.to_string(), executor);
    }

    pub fn with_default(mut self, id: &str) -> Self {
        self.default_id = Some(id.to_string());
        self
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.executors.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Executor for a requested id, or the default.
    ///
    /// `Ok(None)` means no connection applies and the turn runs without
    /// tools; an unknown explicit id is a validation error.
    pub fn resolve(
        &self,
        requested: Option<&str>,
    ) -> Result<Option<(String, Arc<dyn SqlExecutor>)>, AgentError> {
        let id = match requested.filter(|s| !s.trim().is_empty()) {
            Some(id) => id.to_string(),
            None => match &self.default_id {
                Some(id) => id.clone(),
                None => return Ok(None),
            },
        };
        match self.executors.get(&id) {
            Some(executor) => Ok(Some((id, Arc::clone(executor)))),
            None => Err(AgentError::validation(format!("unknown connection: '{id}'"))),
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
