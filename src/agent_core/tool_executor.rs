//! Tool Executor — validates and runs tool calls against a `SqlExecutor`.
//!
//! Every call goes through: catalog validation → safety policy → SQL
//! Executor → masking → truncation. Failures never escape as errors; they
//! become failed `ToolResult`s the model can react to on the next round.

use std::sync::{Arc, OnceLock};
use std::time::Instant;

use futures::stream::{self, StreamExt};
use regex::Regex;
use serde_json::{json, Map, Value};

use super::errors::AgentError;
use super::sql_executor::{ColumnInfo, QueryRows, SqlExecutor};
use super::tokens::truncate_with_marker;
use super::tool_catalog::{self, ToolCatalog};
use crate::config::ToolLoopConfig;
use crate::inference::types::{ToolCall, ToolResult};

// ─── Constants ──────────────────────────────────────────────────────────────

pub const READ_ONLY_ERROR: &str = "Only SELECT queries are allowed for safety.";

const DEFAULT_SAMPLE_ROWS: usize = 5;

const MASK: &str = "****";

const CHART_TYPES: &[&str] = &["bar", "line", "pie", "scatter", "area"];

// ─── Patterns ───────────────────────────────────────────────────────────────

fn identifier_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static regex"))
}

fn table_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*\.)?[A-Za-z_][A-Za-z0-9_]*$").expect("static regex")
    })
}

/// A `LIMIT n [OFFSET m]` (or `LIMIT m, n`) ending the statement.
fn trailing_limit_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\blimit\s+\d+(\s*,\s*\d+|\s+offset\s+\d+)?\s*$").expect("static regex")
    })
}

fn sensitive_column_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(password|passwd|token|secret|credit_?card|api_?key|(^|_)ssn($|_))")
            .expect("static regex")
    })
}

// ─── Policy ─────────────────────────────────────────────────────────────────

/// SQL with quoted literals emptied and comments removed. Only used for
/// structural checks; never executed.
fn structural_text(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\'' | '"' | '`' => {
                out.push(c);
                out.push(c);
                for inner in chars.by_ref() {
                    if inner == c {
                        break;
                    }
                }
            }
            '-' if chars.peek() == Some(&'-') => {
                for inner in chars.by_ref() {
                    if inner == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for inner in chars.by_ref() {
                    if prev == '*' && inner == '/' {
                        break;
                    }
                    prev = inner;
                }
                out.push(' ');
            }
            _ => out.push(c),
        }
    }
    out
}

/// Trimmed, upper-cased statement starts with `SELECT` or `WITH`, and holds
/// a single statement.
pub fn is_read_only(sql: &str) -> bool {
    let structure = structural_text(sql);
    let trimmed = structure.trim();
    let upper = trimmed.to_uppercase();
    if !(upper.starts_with("SELECT") || upper.starts_with("WITH")) {
        return false;
    }
    // Reject a second statement smuggled after a semicolon.
    !trimmed
        .trim_end_matches(|c: char| c == ';' || c.is_whitespace())
        .contains(';')
}

/// Whether the statement already ends in a top-level limit clause.
fn has_trailing_limit(structure: &str) -> bool {
    let Some(found) = trailing_limit_pattern().find(structure.trim_end()) else {
        return false;
    };
    let depth = structure[..found.start()].chars().fold(0i32, |depth, c| match c {
        '(' => depth + 1,
        ')' => depth - 1,
        _ => depth,
    });
    depth == 0
}

/// Append `LIMIT <row_cap>` unless the outer statement already ends in one.
///
/// A limit inside a subquery, CTE or string literal does not count.
pub fn ensure_limit(sql: &str, row_cap: usize) -> String {
    let body = sql.trim().trim_end_matches(|c: char| c == ';' || c.is_whitespace());
    let structure = structural_text(body);
    if has_trailing_limit(&structure) {
        return body.to_string();
    }
    // A trailing line comment would swallow the clause.
    let separator = if body.contains("--") { "\n" } else { " " };
    format!("{body}{separator}LIMIT {row_cap}")
}

pub fn validate_identifier(name: &str) -> Result<&str, AgentError> {
    if identifier_pattern().is_match(name) {
        Ok(name)
    } else {
        Err(tool_error(format!("invalid identifier: '{name}'")))
    }
}

/// Table name with an optional `schema.` prefix.
pub fn validate_table_name(name: &str) -> Result<&str, AgentError> {
    if table_pattern().is_match(name) {
        Ok(name)
    } else {
        Err(tool_error(format!("invalid table name: '{name}'")))
    }
}

pub fn is_sensitive_column(name: &str) -> bool {
    sensitive_column_pattern().is_match(name)
}

/// Replace non-null values of sensitive columns in place.
pub fn mask_rows(rows: &mut [Map<String, Value>]) {
    for row in rows.iter_mut() {
        for (column, value) in row.iter_mut() {
            if !value.is_null() && is_sensitive_column(column) {
                *value = Value::String(MASK.to_string());
            }
        }
    }
}

fn tool_error(reason: impl Into<String>) -> AgentError {
    AgentError::ToolExecutionError {
        reason: reason.into(),
    }
}

// ─── Executor ───────────────────────────────────────────────────────────────

/// What a successful tool produced.
struct ToolOutput {
    response: String,
    data: Option<Vec<Map<String, Value>>>,
}

impl ToolOutput {
    fn text(response: String) -> Self {
        Self { response, data: None }
    }
}

/// Request-scoped tool runner bound to one connection (or none).
pub struct ToolExecutor {
    catalog: Arc<ToolCatalog>,
    sql: Option<Arc<dyn SqlExecutor>>,
    row_cap: usize,
    max_result_chars: usize,
    worker_cap: usize,
}

impl ToolExecutor {
    pub fn new(
        catalog: Arc<ToolCatalog>,
        sql: Option<Arc<dyn SqlExecutor>>,
        config: &ToolLoopConfig,
    ) -> Self {
        Self {
            catalog,
            sql,
            row_cap: config.row_cap.max(1),
            max_result_chars: config.max_tool_result_chars,
            worker_cap: config.worker_cap.max(1),
        }
    }

    pub fn catalog(&self) -> &ToolCatalog {
        &self.catalog
    }

    /// Whether tools can run at all (a connection is bound).
    pub fn has_connection(&self) -> bool {
        self.sql.is_some()
    }

    /// Run a batch under the worker cap; results come back in request order.
    pub async fn execute_batch(&self, calls: &[ToolCall]) -> Vec<ToolResult> {
        // Futures are built up front so the returned future stays `Send`.
        let pending: Vec<_> = calls.iter().map(|call| self.execute(call)).collect();
        stream::iter(pending)
            .buffered(self.worker_cap)
            .collect()
            .await
    }

    /// Run one call. Never fails: errors become a failed `ToolResult`.
    pub async fn execute(&self, call: &ToolCall) -> ToolResult {
        let start = Instant::now();
        let outcome = match self.catalog.validate_tool_call(call) {
            Ok(_) => self.dispatch(call).await,
            Err(reason) => Err(AgentError::validation(reason)),
        };
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(output) => {
                tracing::info!(
                    tool = %call.name,
                    call_id = %call.id,
                    success = true,
                    rows = output.data.as_ref().map(|d| d.len()).unwrap_or(0),
                    elapsed_ms,
                    "tool executed"
                );
                ToolResult {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    success: true,
                    response: truncate_with_marker(&output.response, self.max_result_chars),
                    data: output.data,
                    error: None,
                    execution_time_ms: elapsed_ms,
                }
            }
            Err(e) => {
                let message = match e {
                    AgentError::ToolExecutionError { reason } | AgentError::ValidationError { reason } => {
                        reason
                    }
                    other => other.to_string(),
                };
                tracing::warn!(
                    tool = %call.name,
                    call_id = %call.id,
                    success = false,
                    error = %message,
                    elapsed_ms,
                    "tool failed"
                );
                let mut result = ToolResult::failure(&call.id, &call.name, message);
                result.execution_time_ms = elapsed_ms;
                result
            }
        }
    }

    async fn dispatch(&self, call: &ToolCall) -> Result<ToolOutput, AgentError> {
        let args = &call.arguments;
        match call.name.as_str() {
            tool_catalog::GET_SCHEMA => self.get_schema(args).await,
            tool_catalog::SAMPLE_TABLE => self.sample_table(args).await,
            tool_catalog::EXECUTE_QUERY => self.execute_query(args).await,
            tool_catalog::GENERATE_CHART => self.generate_chart(args).await,
            tool_catalog::DESCRIBE_TABLE => self.describe_table(args).await,
            tool_catalog::GET_TABLE_STATS => self.table_stats(args).await,
            tool_catalog::SELECT_DATA => self.select_data(args).await,
            other => Err(tool_error(format!("unknown tool: '{other}'"))),
        }
    }

    fn sql(&self) -> Result<&Arc<dyn SqlExecutor>, AgentError> {
        self.sql
            .as_ref()
            .ok_or_else(|| tool_error("no database connection is configured for this request"))
    }

    /// Run a statement, cap and mask the rows.
    async fn run(&self, sql: &str, params: &[Value]) -> Result<QueryRows, AgentError> {
        tracing::debug!(sql = %sql, params = params.len(), "sql dispatch");
        let mut rows = self
            .sql()?
            .query(sql, params)
            .await
            .map_err(|e| tool_error(e.to_string()))?;
        rows.rows.truncate(self.row_cap);
        mask_rows(&mut rows.rows);
        Ok(rows)
    }

    fn rows_output(&self, rows: QueryRows) -> Result<ToolOutput, AgentError> {
        let response = json!({
            "columns": rows.columns,
            "row_count": rows.rows.len(),
            "rows": rows.rows,
        })
        .to_string();
        Ok(ToolOutput {
            response,
            data: Some(rows.rows),
        })
    }

    fn capped_limit(&self, args: &Value, default: usize) -> usize {
        args.get("limit")
            .and_then(|v| v.as_u64())
            .map(|n| n as usize)
            .unwrap_or(default)
            .clamp(1, self.row_cap)
    }

    // ─── Tools ──────────────────────────────────────────────────────────

    async fn get_schema(&self, args: &Value) -> Result<ToolOutput, AgentError> {
        let schema = match str_arg(args, "schema") {
            Some(s) => Some(validate_identifier(s)?),
            None => None,
        };
        let filter: Option<Vec<String>> = match args.get("tables").and_then(|t| t.as_array()) {
            Some(list) => Some(
                list.iter()
                    .filter_map(|t| t.as_str())
                    .map(|t| validate_table_name(t).map(bare_table))
                    .collect::<Result<_, _>>()?,
            ),
            None => None,
        };

        let sql = self.sql()?;
        let tables = sql
            .list_tables(schema)
            .await
            .map_err(|e| tool_error(e.to_string()))?;

        let mut lines = Vec::new();
        for table in tables {
            if let Some(ref wanted) = filter {
                if !wanted.iter().any(|w| w.eq_ignore_ascii_case(&table)) {
                    continue;
                }
            }
            let qualified = match schema {
                Some(s) => format!("{s}.{table}"),
                None => table.clone(),
            };
            let columns = sql
                .describe_table(&qualified)
                .await
                .map_err(|e| tool_error(e.to_string()))?;
            lines.push(format!("{qualified}({})", format_columns(&columns)));
        }

        if lines.is_empty() {
            return Ok(ToolOutput::text("No tables found.".to_string()));
        }
        Ok(ToolOutput::text(lines.join("\n")))
    }

    async fn sample_table(&self, args: &Value) -> Result<ToolOutput, AgentError> {
        let table = validate_table_name(required_str(args, "table_name")?)?;
        let limit = self.capped_limit(args, DEFAULT_SAMPLE_ROWS);
        let rows = self.run(&format!("SELECT * FROM {table} LIMIT {limit}"), &[]).await?;
        self.rows_output(rows)
    }

    async fn execute_query(&self, args: &Value) -> Result<ToolOutput, AgentError> {
        let query = required_str(args, "query")?;
        if !is_read_only(query) {
            return Err(tool_error(READ_ONLY_ERROR));
        }
        let rows = self.run(&ensure_limit(query, self.row_cap), &[]).await?;
        self.rows_output(rows)
    }

    async fn generate_chart(&self, args: &Value) -> Result<ToolOutput, AgentError> {
        let chart_type = required_str(args, "chart_type")?;
        if !CHART_TYPES.contains(&chart_type) {
            return Err(tool_error(format!(
                "unsupported chart_type '{chart_type}' (expected one of {})",
                CHART_TYPES.join(", ")
            )));
        }
        let x_axis = validate_identifier(required_str(args, "x_axis")?)?;
        let y_axis = validate_identifier(required_str(args, "y_axis")?)?;
        let query = required_str(args, "query")?;
        if !is_read_only(query) {
            return Err(tool_error(READ_ONLY_ERROR));
        }

        let rows = self.run(&ensure_limit(query, self.row_cap), &[]).await?;
        for axis in [x_axis, y_axis] {
            if !rows.columns.iter().any(|c| c == axis) {
                return Err(tool_error(format!("column '{axis}' is not in the query result")));
            }
        }

        let title = str_arg(args, "title").unwrap_or_default();
        let descriptor = json!({
            "type": chart_type,
            "title": title,
            "x_axis": x_axis,
            "y_axis": y_axis,
            "row_count": rows.rows.len(),
            "data": rows.rows,
        });
        Ok(ToolOutput {
            response: descriptor.to_string(),
            data: Some(rows.rows),
        })
    }

    async fn describe_table(&self, args: &Value) -> Result<ToolOutput, AgentError> {
        let table = validate_table_name(required_str(args, "table_name")?)?;
        let columns = self
            .sql()?
            .describe_table(table)
            .await
            .map_err(|e| tool_error(e.to_string()))?;
        let response = json!({ "table": table, "columns": columns }).to_string();
        Ok(ToolOutput::text(response))
    }

    async fn table_stats(&self, args: &Value) -> Result<ToolOutput, AgentError> {
        let table = validate_table_name(required_str(args, "table_name")?)?;
        let columns: Vec<ColumnInfo> = self
            .sql()?
            .describe_table(table)
            .await
            .map_err(|e| tool_error(e.to_string()))?
            .into_iter()
            .filter(|c| identifier_pattern().is_match(&c.name))
            .collect();

        let mut select = vec!["COUNT(*) AS row_count".to_string()];
        for (i, column) in columns.iter().enumerate() {
            select.push(format!("COUNT(DISTINCT {}) AS d{i}", column.name));
            select.push(format!(
                "SUM(CASE WHEN {} IS NULL THEN 1 ELSE 0 END) AS n{i}",
                column.name
            ));
        }
        let sql = format!("SELECT {} FROM {table}", select.join(", "));
        let rows = self
            .sql()?
            .query(&sql, &[])
            .await
            .map_err(|e| tool_error(e.to_string()))?;
        let row = rows.rows.into_iter().next().unwrap_or_default();

        let stats: Vec<Value> = columns
            .iter()
            .enumerate()
            .map(|(i, column)| {
                json!({
                    "name": column.name,
                    "distinct": row.get(&format!("d{i}")).cloned().unwrap_or(Value::Null),
                    "nulls": row.get(&format!("n{i}")).cloned().unwrap_or(json!(0)),
                })
            })
            .collect();
        let response = json!({
            "table": table,
            "row_count": row.get("row_count").cloned().unwrap_or(json!(0)),
            "columns": stats,
        })
        .to_string();
        Ok(ToolOutput::text(response))
    }

    async fn select_data(&self, args: &Value) -> Result<ToolOutput, AgentError> {
        let table = validate_table_name(required_str(args, "table_name")?)?;

        let columns = match args.get("columns").and_then(|c| c.as_array()) {
            Some(list) if !list.is_empty() => list
                .iter()
                .map(|c| {
                    c.as_str()
                        .ok_or_else(|| tool_error("columns must be strings"))
                        .and_then(validate_identifier)
                })
                .collect::<Result<Vec<_>, _>>()?
                .join(", "),
            _ => "*".to_string(),
        };

        let mut clauses = Vec::new();
        let mut params = Vec::new();
        if let Some(filters) = args.get("filters").and_then(|f| f.as_object()) {
            for (column, value) in filters {
                let column = validate_identifier(column)?;
                if value.is_null() {
                    clauses.push(format!("{column} IS NULL"));
                } else {
                    params.push(value.clone());
                    clauses.push(format!("{column} = ?{}", params.len()));
                }
            }
        }

        let mut sql = format!("SELECT {columns} FROM {table}");
        if !clauses.is_empty() {
            sql.push_str(&format!(" WHERE {}", clauses.join(" AND ")));
        }
        if let Some(order_by) = str_arg(args, "order_by") {
            let order_by = validate_identifier(order_by)?;
            let direction = if args.get("descending").and_then(|d| d.as_bool()).unwrap_or(false) {
                "DESC"
            } else {
                "ASC"
            };
            sql.push_str(&format!(" ORDER BY {order_by} {direction}"));
        }
        sql.push_str(&format!(" LIMIT {}", self.capped_limit(args, self.row_cap)));

        let rows = self.run(&sql, &params).await?;
        self.rows_output(rows)
    }
}

// ─── Helpers ────────────────────────────────────────────────────────────────

fn str_arg<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(|v| v.as_str()).filter(|s| !s.trim().is_empty())
}

fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, AgentError> {
    str_arg(args, key).ok_or_else(|| tool_error(format!("'{key}' must be a non-empty string")))
}

fn bare_table(name: &str) -> String {
    name.rsplit('.').next().unwrap_or(name).to_string()
}

fn format_columns(columns: &[ColumnInfo]) -> String {
    columns
        .iter()
        .map(|c| {
            let mut s = format!("{} {}", c.name, c.data_type);
            if c.primary_key {
                s.push_str(" PK");
            }
            if !c.nullable {
                s.push_str(" NOT NULL");
            }
            s
        })
        .collect::<Vec<_>>()
        .join(", ")
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_core::sql_executor::tests::sample_executor;
    use crate::agent_core::sql_executor::ExecutorError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn config() -> ToolLoopConfig {
        ToolLoopConfig {
            row_cap: 2,
            ..ToolLoopConfig::default()
        }
    }

    fn executor_with(sql: Arc<dyn SqlExecutor>, config: &ToolLoopConfig) -> ToolExecutor {
        ToolExecutor::new(Arc::new(ToolCatalog::standard()), Some(sql), config)
    }

    fn call(id: &str, name: &str, arguments: Value) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }

    /// Counts queries and tracks peak concurrency.
    #[derive(Default)]
    struct CountingExecutor {
        queries: AtomicUsize,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl SqlExecutor for CountingExecutor {
        async fn list_tables(&self, _schema: Option<&str>) -> Result<Vec<String>, ExecutorError> {
            Ok(Vec::new())
        }

        async fn describe_table(&self, table: &str) -> Result<Vec<ColumnInfo>, ExecutorError> {
            Err(ExecutorError::TableNotFound {
                table: table.to_string(),
            })
        }

        async fn query(&self, sql: &str, _params: &[Value]) -> Result<QueryRows, ExecutorError> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            let mut row = Map::new();
            row.insert("sql".into(), Value::String(sql.to_string()));
            Ok(QueryRows {
                columns: vec!["sql".into()],
                rows: vec![row],
            })
        }
    }

    #[test]
    fn test_read_only_guard() {
        assert!(is_read_only("  select * from users"));
        assert!(is_read_only("WITH t AS (SELECT 1) SELECT * FROM t;"));
        assert!(!is_read_only("DROP TABLE users"));
        assert!(!is_read_only("UPDATE users SET email = ''"));
        assert!(!is_read_only("SELECT 1; DROP TABLE users"));
        assert!(!is_read_only(""));
    }

    #[test]
    fn test_read_only_ignores_literals_and_comments() {
        assert!(is_read_only("SELECT * FROM notes WHERE body = 'a;b'"));
        assert!(is_read_only("SELECT 1 -- trailing; note"));
        assert!(!is_read_only("SELECT 'x'; DELETE FROM notes"));
        assert!(!is_read_only("/* SELECT */ DELETE FROM notes"));
    }

    #[test]
    fn test_ensure_limit() {
        assert_eq!(ensure_limit("SELECT * FROM users;", 100), "SELECT * FROM users LIMIT 100");
        assert_eq!(ensure_limit("SELECT * FROM users LIMIT 3", 100), "SELECT * FROM users LIMIT 3");
        assert_eq!(ensure_limit("select * from t limit 7 ", 100), "select * from t limit 7");
        assert_eq!(
            ensure_limit("SELECT * FROM t LIMIT 10 OFFSET 20", 100),
            "SELECT * FROM t LIMIT 10 OFFSET 20"
        );
    }

    #[test]
    fn test_ensure_limit_only_counts_outer_statement() {
        assert_eq!(
            ensure_limit("SELECT * FROM users WHERE id IN (SELECT user_id FROM orders LIMIT 3)", 100),
            "SELECT * FROM users WHERE id IN (SELECT user_id FROM orders LIMIT 3) LIMIT 100"
        );
        assert_eq!(
            ensure_limit("SELECT * FROM notes WHERE body = 'no limit 5'", 100),
            "SELECT * FROM notes WHERE body = 'no limit 5' LIMIT 100"
        );
        assert_eq!(
            ensure_limit("WITH t AS (SELECT * FROM users LIMIT 1) SELECT * FROM t", 100),
            "WITH t AS (SELECT * FROM users LIMIT 1) SELECT * FROM t LIMIT 100"
        );
        assert_eq!(
            ensure_limit("SELECT * FROM users -- all of them", 100),
            "SELECT * FROM users -- all of them\nLIMIT 100"
        );
    }

    #[tokio::test]
    async fn test_subquery_limit_still_bounded() {
        let counting = Arc::new(CountingExecutor::default());
        let exec = executor_with(counting.clone(), &config());
        let result = exec
            .execute(&call(
                "c1",
                tool_catalog::EXECUTE_QUERY,
                json!({"query": "SELECT * FROM users WHERE id IN (SELECT user_id FROM orders LIMIT 3)"}),
            ))
            .await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(
            result.data.unwrap()[0]["sql"],
            "SELECT * FROM users WHERE id IN (SELECT user_id FROM orders LIMIT 3) LIMIT 2"
        );
    }

    #[test]
    fn test_identifiers() {
        assert!(validate_identifier("signed_up").is_ok());
        assert!(validate_identifier("1col").is_err());
        assert!(validate_identifier("name; DROP").is_err());
        assert!(validate_table_name("public.users").is_ok());
        assert!(validate_table_name("a.b.c").is_err());
        assert!(validate_table_name("users--").is_err());
    }

    #[test]
    fn test_sensitive_columns() {
        for name in ["password", "user_passwd", "api_key", "apikey", "refresh_token", "ssn", "creditcard", "credit_card", "client_secret"] {
            assert!(is_sensitive_column(name), "{name}");
        }
        for name in ["email", "classname", "lessons", "id"] {
            assert!(!is_sensitive_column(name), "{name}");
        }
    }

    #[tokio::test]
    async fn test_drop_never_reaches_executor() {
        let counting = Arc::new(CountingExecutor::default());
        let exec = executor_with(counting.clone(), &config());

        let result = exec
            .execute(&call("c1", tool_catalog::EXECUTE_QUERY, json!({"query": "DROP TABLE users"})))
            .await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some(READ_ONLY_ERROR));
        let model: Value = serde_json::from_str(&result.model_text()).unwrap();
        assert_eq!(model, json!({"success": false, "error": READ_ONLY_ERROR}));
        assert_eq!(counting.queries.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_limit_injected_before_executor() {
        let counting = Arc::new(CountingExecutor::default());
        let exec = executor_with(counting.clone(), &config());
        let result = exec
            .execute(&call("c1", tool_catalog::EXECUTE_QUERY, json!({"query": "SELECT * FROM users"})))
            .await;
        assert!(result.success);
        assert_eq!(result.data.unwrap()[0]["sql"], "SELECT * FROM users LIMIT 2");
    }

    #[tokio::test]
    async fn test_execute_query_masks_and_caps() {
        let exec = executor_with(Arc::new(sample_executor()), &config());
        let result = exec
            .execute(&call(
                "c1",
                tool_catalog::EXECUTE_QUERY,
                json!({"query": "SELECT id, email, password FROM users ORDER BY id LIMIT 50"}),
            ))
            .await;
        assert!(result.success);
        let rows = result.data.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["password"], MASK);
        assert_eq!(rows[0]["email"], "ada@example.com");
        assert!(!result.response.contains("hunter2"));
    }

    #[tokio::test]
    async fn test_validation_failure_is_failed_result() {
        let exec = executor_with(Arc::new(sample_executor()), &config());
        let result = exec.execute(&call("c1", tool_catalog::SAMPLE_TABLE, json!({}))).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("table_name"));

        let result = exec
            .execute(&call("c2", "rm_rf", json!({})))
            .await;
        assert!(result.error.unwrap().contains("unknown tool"));
    }

    #[tokio::test]
    async fn test_bad_identifier_rejected() {
        let counting = Arc::new(CountingExecutor::default());
        let exec = executor_with(counting.clone(), &config());
        let result = exec
            .execute(&call(
                "c1",
                tool_catalog::SELECT_DATA,
                json!({"table_name": "users; DROP TABLE users"}),
            ))
            .await;
        assert!(!result.success);
        assert_eq!(counting.queries.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_get_schema_with_filter() {
        let exec = executor_with(Arc::new(sample_executor()), &config());
        let all = exec.execute(&call("c1", tool_catalog::GET_SCHEMA, json!({}))).await;
        assert!(all.response.contains("orders("));
        assert!(all.response.contains("users(id INTEGER PK"));

        let only = exec
            .execute(&call("c2", tool_catalog::GET_SCHEMA, json!({"tables": ["users"]})))
            .await;
        assert!(!only.response.contains("orders("));
    }

    #[tokio::test]
    async fn test_sample_table_bounded_by_row_cap() {
        let exec = executor_with(Arc::new(sample_executor()), &config());
        let result = exec
            .execute(&call("c1", tool_catalog::SAMPLE_TABLE, json!({"table_name": "users", "limit": 500})))
            .await;
        assert_eq!(result.data.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_describe_and_stats() {
        let exec = executor_with(Arc::new(sample_executor()), &ToolLoopConfig::default());
        let described = exec
            .execute(&call("c1", tool_catalog::DESCRIBE_TABLE, json!({"table_name": "orders"})))
            .await;
        assert!(described.success);
        assert!(described.response.contains("user_id"));

        let stats = exec
            .execute(&call("c2", tool_catalog::GET_TABLE_STATS, json!({"table_name": "orders"})))
            .await;
        let parsed: Value = serde_json::from_str(&stats.response).unwrap();
        assert_eq!(parsed["row_count"], 3);
        let region = parsed["columns"]
            .as_array()
            .unwrap()
            .iter()
            .find(|c| c["name"] == "region")
            .unwrap();
        assert_eq!(region["distinct"], 1);
        assert_eq!(region["nulls"], 1);
    }

    #[tokio::test]
    async fn test_select_data_binds_filters() {
        let exec = executor_with(Arc::new(sample_executor()), &ToolLoopConfig::default());
        let result = exec
            .execute(&call(
                "c1",
                tool_catalog::SELECT_DATA,
                json!({
                    "table_name": "orders",
                    "columns": ["id", "total"],
                    "filters": {"user_id": 1},
                    "order_by": "total",
                    "descending": true
                }),
            ))
            .await;
        assert!(result.success, "{:?}", result.error);
        let rows = result.data.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["total"], 19.5);
    }

    #[tokio::test]
    async fn test_generate_chart_descriptor() {
        let exec = executor_with(Arc::new(sample_executor()), &ToolLoopConfig::default());
        let result = exec
            .execute(&call(
                "c1",
                tool_catalog::GENERATE_CHART,
                json!({
                    "chart_type": "bar",
                    "query": "SELECT region, SUM(total) AS revenue FROM orders GROUP BY region",
                    "x_axis": "region",
                    "y_axis": "revenue",
                    "title": "Revenue by region"
                }),
            ))
            .await;
        assert!(result.success, "{:?}", result.error);
        let descriptor: Value = serde_json::from_str(&result.response).unwrap();
        assert_eq!(descriptor["type"], "bar");
        assert_eq!(descriptor["x_axis"], "region");
        assert_eq!(descriptor["row_count"], 2);

        let bad_axis = exec
            .execute(&call(
                "c2",
                tool_catalog::GENERATE_CHART,
                json!({"chart_type": "bar", "query": "SELECT 1 AS a", "x_axis": "a", "y_axis": "b"}),
            ))
            .await;
        assert!(!bad_axis.success);
    }

    #[tokio::test]
    async fn test_no_connection() {
        let exec = ToolExecutor::new(Arc::new(ToolCatalog::standard()), None, &config());
        assert!(!exec.has_connection());
        let result = exec
            .execute(&call("c1", tool_catalog::EXECUTE_QUERY, json!({"query": "SELECT 1"})))
            .await;
        assert!(!result.success);
    }

    #[tokio::test]
    async fn test_result_text_truncated() {
        let config = ToolLoopConfig {
            max_tool_result_chars: 40,
            ..ToolLoopConfig::default()
        };
        let exec = executor_with(Arc::new(sample_executor()), &config);
        let result = exec
            .execute(&call("c1", tool_catalog::EXECUTE_QUERY, json!({"query": "SELECT * FROM users"})))
            .await;
        assert!(result.response.ends_with("[truncated]"));
        assert_eq!(result.data.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_batch_bounded_and_ordered() {
        let counting = Arc::new(CountingExecutor::default());
        let config = ToolLoopConfig {
            worker_cap: 2,
            ..ToolLoopConfig::default()
        };
        let exec = executor_with(counting.clone(), &config);
        let calls: Vec<ToolCall> = (0..6)
            .map(|i| {
                call(
                    &format!("c{i}"),
                    tool_catalog::EXECUTE_QUERY,
                    json!({"query": format!("SELECT {i}")}),
                )
            })
            .collect();

        let results = exec.execute_batch(&calls).await;
        let ids: Vec<_> = results.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["c0", "c1", "c2", "c3", "c4", "c5"]);
        assert_eq!(counting.queries.load(Ordering::SeqCst), 6);
        assert!(counting.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_batch_future_is_send() {
        fn assert_send<T: Send>(_: &T) {}
        let exec = executor_with(Arc::new(sample_executor()), &config());
        let calls = vec![call("c1", tool_catalog::EXECUTE_QUERY, json!({"query": "SELECT 1"}))];
        let batch = exec.execute_batch(&calls);
        assert_send(&batch);
        assert_eq!(batch.await.len(), 1);
    }
}
