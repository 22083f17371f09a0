//! System prompt assembly.
//!
//! The prompt has four parts:
//! 1. Identity and intro (static)
//! 2. Database context: connection, schema, tables, session mode
//! 3. Remembered facts for the connection (optional)
//! 4. Tool rules and answer format; thinking instructions when enabled

use super::types::{MemoryFact, SessionMode};

/// Identity and intro — static portion of the system prompt.
const SYSTEM_PROMPT_INTRO: &str = "\
You are a data assistant that answers questions about a relational database. \
You translate natural-language questions into correct, efficient, read-only SQL.";

const TOOL_RULES: &str = "\
Rules:\n\
1. Inspect before you query: call get_schema or describe_table when unsure of names.\n\
2. Only read. Every statement must be a single SELECT or WITH query.\n\
3. Never invent tables or columns; use only names returned by the tools.\n\
4. Prefer select_data for simple single-table lookups and execute_query for joins and aggregates.\n\
5. Keep result sets small; add LIMIT when the user did not ask for everything.\n\
6. When a tool fails, read the error, fix the call and try again.\n\
7. Only report results you actually received from tool calls.";

const NO_TOOL_RULES: &str = "\
Rules:\n\
1. You cannot run queries in this conversation; write the SQL the user should run.\n\
2. Only read. Every statement must be a single SELECT or WITH query.\n\
3. Never invent tables or columns beyond those named in the database context.";

const ANSWER_FORMAT: &str = "\
Answer format: a short explanation, then the final SQL in one fenced ```sql block.";

const THINKING_INSTRUCTIONS: &str = "\
Reason carefully before answering. Put your step-by-step reasoning inside \
<thinking>...</thinking> tags, then give the answer outside the tags.";

/// Inputs for one request's system prompt.
#[derive(Debug, Default)]
pub struct PromptContext<'a> {
    pub connection_id: Option<&'a str>,
    pub schema: Option<&'a str>,
    pub tables: &'a [String],
    pub tools_available: bool,
    pub use_thinking: bool,
    pub facts: &'a [MemoryFact],
}

pub fn build_system_prompt(ctx: &PromptContext<'_>) -> String {
    let mut sections = vec![SYSTEM_PROMPT_INTRO.to_string(), database_context(ctx)];

    if !ctx.facts.is_empty() {
        let facts = ctx
            .facts
            .iter()
            .map(|f| format!("- {}", f.fact))
            .collect::<Vec<_>>()
            .join("\n");
        sections.push(format!("Known facts about this database:\n{facts}"));
    }

    sections.push(if ctx.tools_available { TOOL_RULES } else { NO_TOOL_RULES }.to_string());
    sections.push(ANSWER_FORMAT.to_string());

    if ctx.use_thinking {
        sections.push(THINKING_INSTRUCTIONS.to_string());
    }

    sections.join("\n\n")
}

fn database_context(ctx: &PromptContext<'_>) -> String {
    let mode = SessionMode::for_tables(ctx.tables);
    let mut lines = vec!["Database context:".to_string()];
    lines.push(format!("- connection: {}", ctx.connection_id.unwrap_or("none")));
    if let Some(schema) = ctx.schema {
        lines.push(format!("- schema: {schema}"));
    }
    match mode {
        SessionMode::Context => {
            lines.push(format!("- mode: context (questions are about the table {})", ctx.tables[0]));
        }
        SessionMode::Collection if ctx.tables.is_empty() => {
            lines.push("- mode: collection (the whole schema is in scope)".to_string());
        }
        SessionMode::Collection => {
            lines.push(format!(
                "- mode: collection (tables in focus: {})",
                ctx.tables.join(", ")
            ));
        }
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_mode_for_single_table() {
        let tables = vec!["users".to_string()];
        let prompt = build_system_prompt(&PromptContext {
            connection_id: Some("warehouse"),
            tables: &tables,
            tools_available: true,
            ..Default::default()
        });
        assert!(prompt.contains("connection: warehouse"));
        assert!(prompt.contains("mode: context"));
        assert!(prompt.contains("get_schema"));
        assert!(!prompt.contains("<thinking>"));
    }

    #[test]
    fn test_collection_mode_with_facts_and_thinking() {
        let tables = vec!["users".to_string(), "orders".to_string()];
        let facts = vec![MemoryFact {
            id: 1,
            fact: "orders.total is in cents".into(),
            scope: "warehouse".into(),
            importance: 0.9,
            fact_hash: String::new(),
            created_at: String::new(),
            updated_at: String::new(),
        }];
        let prompt = build_system_prompt(&PromptContext {
            schema: Some("public"),
            tables: &tables,
            use_thinking: true,
            facts: &facts,
            ..Default::default()
        });
        assert!(prompt.contains("tables in focus: users, orders"));
        assert!(prompt.contains("- orders.total is in cents"));
        assert!(prompt.contains("<thinking>"));
        assert!(prompt.contains("cannot run queries"));
    }
}
