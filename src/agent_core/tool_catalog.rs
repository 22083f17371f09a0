//! Tool Catalog — the static set of database tools offered to the model.
//!
//! Each declaration carries a JSON Schema (`type: object`, `properties`,
//! `required`). Conversions to the OpenAI and Anthropic shapes live on
//! `ToolSpec`; this module owns the list and argument validation.

use serde_json::json;

use crate::inference::types::{ToolCall, ToolSpec};

pub const GET_SCHEMA: &str = "get_schema";
pub const SAMPLE_TABLE: &str = "sample_table";
pub const EXECUTE_QUERY: &str = "execute_query";
pub const GENERATE_CHART: &str = "generate_chart";
pub const DESCRIBE_TABLE: &str = "describe_table";
pub const GET_TABLE_STATS: &str = "get_table_stats";
pub const SELECT_DATA: &str = "select_data";

/// Registry of callable tools. Immutable once built; shared across requests.
#[derive(Debug, Clone)]
pub struct ToolCatalog {
    tools: Vec<ToolSpec>,
}

impl Default for ToolCatalog {
    fn default() -> Self {
        Self::standard()
    }
}

impl ToolCatalog {
    /// The seven database tools.
    pub fn standard() -> Self {
        let tools = vec![
            spec(
                GET_SCHEMA,
                "List tables and their columns. Optionally restrict to a schema or to specific tables.",
                json!({
                    "type": "object",
                    "properties": {
                        "schema": {"type": "string", "description": "Schema name"},
                        "tables": {
                            "type": "array",
                            "items": {"type": "string"},
                            "description": "Only describe these tables"
                        }
                    },
                    "required": []
                }),
            ),
            spec(
                SAMPLE_TABLE,
                "Return a few example rows from a table.",
                json!({
                    "type": "object",
                    "properties": {
                        "table_name": {"type": "string"},
                        "limit": {"type": "integer", "minimum": 1, "description": "Rows to return (default 5)"}
                    },
                    "required": ["table_name"]
                }),
            ),
            spec(
                EXECUTE_QUERY,
                "Run a read-only SQL query (SELECT or WITH) and return the rows.",
                json!({
                    "type": "object",
                    "properties": {
                        "query": {"type": "string", "description": "A single SELECT or WITH statement"}
                    },
                    "required": ["query"]
                }),
            ),
            spec(
                GENERATE_CHART,
                "Run a read-only query and describe a chart over its rows. Does not render.",
                json!({
                    "type": "object",
                    "properties": {
                        "chart_type": {"type": "string", "enum": ["bar", "line", "pie", "scatter", "area"]},
                        "query": {"type": "string"},
                        "x_axis": {"type": "string", "description": "Column for the x axis"},
                        "y_axis": {"type": "string", "description": "Column for the y axis"},
                        "title": {"type": "string"}
                    },
                    "required": ["chart_type", "query", "x_axis", "y_axis"]
                }),
            ),
            spec(
                DESCRIBE_TABLE,
                "Describe a table's columns, types, nullability and primary key.",
                json!({
                    "type": "object",
                    "properties": {
                        "table_name": {"type": "string"}
                    },
                    "required": ["table_name"]
                }),
            ),
            spec(
                GET_TABLE_STATS,
                "Row count plus distinct and null counts for each column of a table.",
                json!({
                    "type": "object",
                    "properties": {
                        "table_name": {"type": "string"}
                    },
                    "required": ["table_name"]
                }),
            ),
            spec(
                SELECT_DATA,
                "Select rows from one table with optional columns, equality filters, ordering and limit.",
                json!({
                    "type": "object",
                    "properties": {
                        "table_name": {"type": "string"},
                        "columns": {"type": "array", "items": {"type": "string"}},
                        "filters": {
                            "type": "object",
                            "description": "Column name to required value",
                            "additionalProperties": true
                        },
                        "order_by": {"type": "string"},
                        "descending": {"type": "boolean"},
                        "limit": {"type": "integer", "minimum": 1}
                    },
                    "required": ["table_name"]
                }),
            ),
        ];
        Self { tools }
    }

    pub fn specs(&self) -> &[ToolSpec] {
        &self.tools
    }

    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.iter().find(|t| t.name == name)
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Check that the tool exists, arguments are an object, and every
    /// required field is present.
    pub fn validate_tool_call(&self, call: &ToolCall) -> Result<&ToolSpec, String> {
        let spec = self
            .get(&call.name)
            .ok_or_else(|| format!("unknown tool: '{}'", call.name))?;

        let args = call.arguments.as_object().ok_or_else(|| {
            format!("invalid arguments for '{}': expected a JSON object", call.name)
        })?;

        for field in spec.required_fields() {
            if !args.contains_key(field) {
                return Err(format!(
                    "invalid arguments for '{}': missing required field: '{field}'",
                    call.name
                ));
            }
        }

        Ok(spec)
    }
}

fn spec(name: &str, description: &str, input_schema: serde_json::Value) -> ToolSpec {
    ToolSpec {
        name: name.to_string(),
        description: description.to_string(),
        input_schema,
    }
}
