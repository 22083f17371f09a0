//! Canonical types shared by every provider adapter.
//!
//! The conversation model, tool declarations, per-request credentials and the
//! normalized event vocabulary live here. Native wire shapes stay private to
//! each adapter module.

use serde::{Deserialize, Serialize};

use super::errors::InferenceError;

// ─── Conversation ────────────────────────────────────────────────────────────

/// Message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "system" => Some(Role::System),
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "tool" => Some(Role::Tool),
            _ => None,
        }
    }
}

/// A single message in the running conversation.
///
/// `content` serializes as `""` rather than `null`; several OpenAI-compatible
/// runtimes reject null content on assistant tool-call messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(serialize_with = "serialize_content")]
    pub content: Option<String>,
    /// Set on `tool` messages: the call this result answers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Set on `assistant` messages that request tools.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// Signed reasoning blocks that must be replayed with this turn.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub thinking_blocks: Vec<ThinkingBlock>,
}

/// Provider-native reasoning block, replayed verbatim on the next round.
///
/// Serializes in the Anthropic content-block shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ThinkingBlock {
    Thinking { thinking: String, signature: String },
    RedactedThinking { data: String },
}

fn serialize_content<S>(value: &Option<String>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match value {
        Some(s) => serializer.serialize_str(s),
        None => serializer.serialize_str(""),
    }
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::text(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::text(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::text(Role::Assistant, content)
    }

    /// Assistant message carrying tool calls (and any text produced alongside).
    pub fn assistant_tool_calls(text: Option<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: text.filter(|t| !t.is_empty()),
            tool_call_id: None,
            tool_calls: Some(calls),
            thinking_blocks: Vec::new(),
        }
    }

    pub fn with_thinking_blocks(mut self, blocks: Vec<ThinkingBlock>) -> Self {
        self.thinking_blocks = blocks;
        self
    }

    /// Tool result message fed back to the model.
    pub fn tool_result(result: &ToolResult) -> Self {
        Self {
            role: Role::Tool,
            content: Some(result.model_text()),
            tool_call_id: Some(result.id.clone()),
            tool_calls: None,
            thinking_blocks: Vec::new(),
        }
    }

    fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            tool_call_id: None,
            tool_calls: None,
            thinking_blocks: Vec::new(),
        }
    }
}

/// A tool call requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique within a turn (generated if the provider doesn't supply one).
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Outcome of executing one tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub id: String,
    pub name: String,
    pub success: bool,
    /// Human/model-readable response text.
    pub response: String,
    /// Result rows, when the tool produced tabular data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<serde_json::Map<String, serde_json::Value>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub execution_time_ms: u64,
}

impl ToolResult {
    /// Failed result with the given error message.
    pub fn failure(id: &str, name: &str, error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            id: id.to_string(),
            name: name.to_string(),
            success: false,
            response: error.clone(),
            data: None,
            error: Some(error),
            execution_time_ms: 0,
        }
    }

    /// The JSON text fed back to the model as the tool message.
    ///
    /// Failures render as `{"success":false,"error":"…"}` so the model can
    /// self-correct on the next round.
    pub fn model_text(&self) -> String {
        let value = if self.success {
            serde_json::json!({
                "success": true,
                "result": self.response,
                "rows": self.data,
            })
        } else {
            serde_json::json!({
                "success": false,
                "error": self.error.as_deref().unwrap_or(&self.response),
            })
        };
        value.to_string()
    }
}

// ─── Tool Declarations ───────────────────────────────────────────────────────

/// Provider-neutral tool declaration.
///
/// `{name, description, input_schema:{type:"object", properties, required[]}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

impl ToolSpec {
    /// OpenAI function-calling shape.
    pub fn to_openai(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.input_schema,
            }
        })
    }

    /// Anthropic `tools[]` shape.
    pub fn to_anthropic(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name,
            "description": self.description,
            "input_schema": self.input_schema,
        })
    }

    /// Names listed in the schema's `required` array.
    pub fn required_fields(&self) -> Vec<&str> {
        self.input_schema
            .get("required")
            .and_then(|r| r.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str()).collect())
            .unwrap_or_default()
    }
}

// ─── Routing Tier ────────────────────────────────────────────────────────────

/// Model tier selected by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Simple,
    Complex,
}

impl ModelTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelTier::Simple => "simple",
            ModelTier::Complex => "complex",
        }
    }
}

// ─── Credentials ─────────────────────────────────────────────────────────────

/// Request-scoped provider credentials. Never persisted, never logged.
#[derive(Clone, Default, PartialEq, Eq)]
pub enum Credentials {
    #[default]
    None,
    ApiKey(String),
    AccessKeys {
        access_key_id: String,
        secret_access_key: String,
        region: Option<String>,
    },
    Bearer {
        access_token: String,
        refresh_token: Option<String>,
    },
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::None => write!(f, "Credentials::None"),
            Credentials::ApiKey(_) => write!(f, "Credentials::ApiKey(***)"),
            Credentials::AccessKeys { region, .. } => {
                write!(f, "Credentials::AccessKeys {{ region: {region:?}, .. }}")
            }
            Credentials::Bearer { refresh_token, .. } => write!(
                f,
                "Credentials::Bearer {{ refreshable: {} }}",
                refresh_token.is_some()
            ),
        }
    }
}

impl Credentials {
    pub fn is_none(&self) -> bool {
        matches!(self, Credentials::None)
    }

    /// The refresh token, if these are bearer credentials that carry one.
    pub fn refresh_token(&self) -> Option<&str> {
        match self {
            Credentials::Bearer { refresh_token, .. } => refresh_token.as_deref(),
            _ => None,
        }
    }
}

/// Credentials plus the per-request refresh bookkeeping.
///
/// A logical request may call the remote agent more than once, but the
/// refresh token is spent at most once across all of those calls.
#[derive(Debug, Clone, Default)]
pub struct CredentialScope {
    pub credentials: Credentials,
    refreshed: bool,
}

impl CredentialScope {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            refreshed: false,
        }
    }

    pub fn has_refreshed(&self) -> bool {
        self.refreshed
    }

    /// Swap in refreshed credentials and close the refresh window.
    pub fn apply_refresh(&mut self, credentials: Credentials) {
        self.credentials = credentials;
        self.refreshed = true;
    }

    /// Close the refresh window without new credentials (refresh failed).
    pub fn mark_refresh_spent(&mut self) {
        self.refreshed = true;
    }
}

// ─── Requests & Events ───────────────────────────────────────────────────────

/// Everything an adapter needs for one model round.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    /// Explicit model override; otherwise the adapter picks by tier.
    pub model: Option<String>,
    pub tier: ModelTier,
    pub system_prompt: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSpec>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Extended reasoning requested by the router.
    pub thinking: bool,
    pub session_id: Option<String>,
}

/// Final text of one model round, with anything extracted from it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub final_text: String,
    pub sql: Option<String>,
    pub thinking: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub thinking_blocks: Vec<ThinkingBlock>,
}

/// Error classes surfaced through events and responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Auth,
    Provider,
    ToolExecution,
    Timeout,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Auth => "auth",
            ErrorKind::Provider => "provider",
            ErrorKind::ToolExecution => "tool_execution",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Internal => "internal",
        }
    }
}

/// Normalized event emitted by every provider adapter.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    TextDelta(String),
    ToolCallRequested(ToolCall),
    /// The upstream resolved a tool call itself (remote agent).
    ToolResultAccepted(ToolResult),
    Done(Completion),
    Error { kind: ErrorKind, message: String },
}

impl ProviderEvent {
    /// Map a provider failure onto the canonical error event.
    pub fn from_error(err: &InferenceError) -> Self {
        let kind = if err.is_auth_error() {
            ErrorKind::Auth
        } else {
            ErrorKind::Provider
        };
        ProviderEvent::Error {
            kind,
            message: err.upstream_message(),
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_serializes_empty_string_when_none() {
        let msg = ChatMessage::assistant_tool_calls(
            None,
            vec![ToolCall {
                id: "call_1".into(),
                name: "get_schema".into(),
                arguments: serde_json::json!({}),
            }],
        );
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["content"], "");
        assert!(json.get("tool_call_id").is_none());
    }

    #[test]
    fn test_failed_tool_result_model_text() {
        let result = ToolResult::failure(
            "call_1",
            "execute_query",
            "Only SELECT queries are allowed for safety.",
        );
        let parsed: serde_json::Value = serde_json::from_str(&result.model_text()).unwrap();
        assert_eq!(parsed["success"], false);
        assert_eq!(parsed["error"], "Only SELECT queries are allowed for safety.");
    }

    #[test]
    fn test_tool_spec_conversions_are_lossless() {
        let spec = ToolSpec {
            name: "describe_table".into(),
            description: "Describe a table".into(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {"table_name": {"type": "string"}},
                "required": ["table_name"]
            }),
        };
        let openai = spec.to_openai();
        assert_eq!(openai["function"]["parameters"], spec.input_schema);
        let anthropic = spec.to_anthropic();
        assert_eq!(anthropic["input_schema"], spec.input_schema);
        assert_eq!(spec.required_fields(), vec!["table_name"]);
    }

    #[test]
    fn test_credentials_debug_redacts_secrets() {
        let creds = Credentials::Bearer {
            access_token: "super-secret-token".into(),
            refresh_token: Some("refresh-secret".into()),
        };
        let rendered = format!("{creds:?}");
        assert!(!rendered.contains("super-secret-token"));
        assert!(!rendered.contains("refresh-secret"));

        let key = Credentials::ApiKey("sk-live-123".into());
        assert!(!format!("{key:?}").contains("sk-live-123"));
    }

    #[test]
    fn test_credential_scope_refresh_is_one_shot() {
        let mut scope = CredentialScope::new(Credentials::Bearer {
            access_token: "old".into(),
            refresh_token: Some("r".into()),
        });
        assert!(!scope.has_refreshed());
        scope.apply_refresh(Credentials::Bearer {
            access_token: "new".into(),
            refresh_token: None,
        });
        assert!(scope.has_refreshed());
        assert!(scope.credentials.refresh_token().is_none());
    }

    #[test]
    fn test_from_error_classifies_auth() {
        let err = InferenceError::HttpError {
            status: 401,
            body: r#"{"message":"token expired"}"#.into(),
        };
        assert_eq!(
            ProviderEvent::from_error(&err),
            ProviderEvent::Error {
                kind: ErrorKind::Auth,
                message: "token expired".into()
            }
        );
    }

    #[test]
    fn test_model_tier_ordering() {
        assert!(ModelTier::Simple < ModelTier::Complex);
        assert_eq!(ModelTier::Complex.as_str(), "complex");
    }
}
