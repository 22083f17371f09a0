//! Inference — provider adapters and their shared plumbing.
//!
//! Every upstream is reduced to one capability, `ModelProvider::send`, which
//! yields canonical `ProviderEvent`s:
//! - `openai`: function calling over SSE
//! - `anthropic`: `tool_use` blocks over SSE, native thinking
//! - `simple`: raw invocation, one JSON round trip, no tools
//! - `remote_agent`: hosted agent over NDJSON with bearer refresh
//!
//! SSE decoding, SQL/thinking extraction and the token refresher are shared.

pub mod anthropic;
pub mod client;
pub mod errors;
pub mod openai;
pub mod provider;
pub mod refresh;
pub mod remote_agent;
pub mod simple;
pub mod sql_extract;
pub mod streaming;
pub mod types;

// Re-exports for convenience
pub use errors::InferenceError;
pub use provider::{build_adapter, effective_credentials, EventStream, ModelProvider, ProviderAdapter};
pub use types::{
    ChatMessage, Completion, CredentialScope, Credentials, ErrorKind, ModelTier, ProviderEvent,
    ProviderRequest, Role, ThinkingBlock, ToolCall, ToolResult, ToolSpec,
};
