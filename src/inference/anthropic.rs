//! Anthropic messages adapter (`tool_use` blocks, native thinking).
//!
//! The streaming protocol is block-oriented: `content_block_start` opens a
//! text, thinking or `tool_use` block at an index, deltas extend it, and
//! `content_block_stop` closes it. Tool inputs arrive as partial JSON text
//! and are parsed once their block closes.
//!
//! Thinking blocks arrive with a `signature_delta`; the signed blocks are
//! handed back on the `Done` completion and replayed ahead of the
//! `tool_use` blocks of the same assistant turn, which extended thinking
//! requires.

use async_trait::async_trait;
use serde::Deserialize;

use super::client::{headers, ProviderHttp};
use super::errors::InferenceError;
use super::provider::{
    drive_round, effective_credentials, fresh_call_id, parse_arguments, EventStream,
    ModelProvider, RoundDecoder,
};
use super::sql_extract;
use super::streaming::{sse_events, SseEvent};
use super::types::{
    ChatMessage, CredentialScope, Credentials, ProviderEvent, ProviderRequest, Role, ThinkingBlock,
    ToolCall,
};
use crate::config::ProviderConfig;

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Output budget kept on top of the thinking budget.
const MIN_ANSWER_TOKENS: u32 = 1024;

// ─── Wire Types ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireEvent {
    MessageStart {},
    ContentBlockStart {
        index: usize,
        content_block: WireBlock,
    },
    ContentBlockDelta {
        index: usize,
        delta: WireDelta,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageDelta {},
    MessageStop,
    Ping,
    Error {
        error: serde_json::Value,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
        #[serde(default)]
        signature: String,
    },
    RedactedThinking {
        #[serde(default)]
        data: String,
    },
    ToolUse {
        #[serde(default)]
        id: String,
        name: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    ThinkingDelta { thinking: String },
    SignatureDelta { signature: String },
    #[serde(other)]
    Other,
}

// ─── Adapter ─────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct AnthropicAdapter {
    name: String,
    config: ProviderConfig,
    http: ProviderHttp,
}

impl AnthropicAdapter {
    pub fn new(name: &str, config: ProviderConfig, http: ProviderHttp) -> Self {
        Self {
            name: name.to_string(),
            config,
            http,
        }
    }

    fn build_body(&self, request: &ProviderRequest) -> serde_json::Value {
        let model = request
            .model
            .clone()
            .unwrap_or_else(|| self.config.model_for(request.tier).to_string());
        let mut max_tokens = request.max_tokens.unwrap_or(self.config.max_tokens);

        let mut body = serde_json::json!({
            "model": model,
            "system": request.system_prompt,
            "messages": wire_messages(&request.messages),
            "stream": true,
        });

        if request.thinking {
            let budget = self.config.thinking_budget_tokens;
            max_tokens = max_tokens.max(budget + MIN_ANSWER_TOKENS);
            body["thinking"] = serde_json::json!({
                "type": "enabled",
                "budget_tokens": budget,
            });
            // Extended thinking only accepts the default temperature.
        } else {
            body["temperature"] =
                serde_json::json!(request.temperature.unwrap_or(self.config.temperature));
        }
        body["max_tokens"] = serde_json::json!(max_tokens);

        if !request.tools.is_empty() {
            body["tools"] = request.tools.iter().map(|t| t.to_anthropic()).collect();
        }
        body
    }
}

/// Canonical conversation → Anthropic messages.
///
/// System messages are dropped (the prompt travels in `system`). Consecutive
/// tool results merge into one `user` message of `tool_result` blocks, as the
/// API requires results to immediately follow the `tool_use` turn.
fn wire_messages(messages: &[ChatMessage]) -> Vec<serde_json::Value> {
    let mut out: Vec<serde_json::Value> = Vec::with_capacity(messages.len());
    let mut tool_results: Vec<serde_json::Value> = Vec::new();

    let flush = |out: &mut Vec<serde_json::Value>, results: &mut Vec<serde_json::Value>| {
        if !results.is_empty() {
            out.push(serde_json::json!({
                "role": "user",
                "content": std::mem::take(results),
            }));
        }
    };

    for message in messages {
        let content = message.content.clone().unwrap_or_default();
        match message.role {
            Role::System => {}
            Role::Tool => {
                let is_error = serde_json::from_str::<serde_json::Value>(&content)
                    .ok()
                    .and_then(|v| v.get("success").and_then(|s| s.as_bool()))
                    .map(|success| !success)
                    .unwrap_or(false);
                tool_results.push(serde_json::json!({
                    "type": "tool_result",
                    "tool_use_id": message.tool_call_id,
                    "content": content,
                    "is_error": is_error,
                }));
            }
            Role::Assistant => {
                flush(&mut out, &mut tool_results);
                let mut blocks: Vec<serde_json::Value> = message
                    .thinking_blocks
                    .iter()
                    .filter_map(|b| serde_json::to_value(b).ok())
                    .collect();
                if !content.is_empty() {
                    blocks.push(serde_json::json!({"type": "text", "text": content}));
                }
                for call in message.tool_calls.iter().flatten() {
                    let input = if call.arguments.is_object() {
                        call.arguments.clone()
                    } else {
                        serde_json::json!({})
                    };
                    blocks.push(serde_json::json!({
                        "type": "tool_use",
                        "id": call.id,
                        "name": call.name,
                        "input": input,
                    }));
                }
                if !blocks.is_empty() {
                    out.push(serde_json::json!({"role": "assistant", "content": blocks}));
                }
            }
            Role::User => {
                flush(&mut out, &mut tool_results);
                out.push(serde_json::json!({"role": "user", "content": content}));
            }
        }
    }
    flush(&mut out, &mut tool_results);
    out
}

#[async_trait]
impl ModelProvider for AnthropicAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports_tools(&self) -> bool {
        true
    }

    async fn send(
        &self,
        request: &ProviderRequest,
        scope: &mut CredentialScope,
    ) -> Result<EventStream, InferenceError> {
        let api_key = match effective_credentials(&self.config, &self.name, scope.credentials.clone())?
        {
            Credentials::ApiKey(key) => key,
            _ => {
                return Err(InferenceError::AuthFailed {
                    reason: format!("provider '{}' requires an API key", self.name),
                })
            }
        };

        let body = self.build_body(request);
        tracing::info!(
            provider = %self.name,
            model = %body["model"],
            message_count = request.messages.len(),
            tool_count = request.tools.len(),
            thinking = request.thinking,
            "=== LLM REQUEST ==="
        );

        let hdrs = headers([
            ("x-api-key", api_key),
            ("anthropic-version", ANTHROPIC_VERSION.to_string()),
            ("accept", "text/event-stream".to_string()),
        ])?;
        let response = self.http.post_json("messages", hdrs, &body, true).await?;

        Ok(drive_round(
            Box::pin(sse_events(response)),
            AnthropicRound::default(),
        ))
    }
}

// ─── Round State ─────────────────────────────────────────────────────────────

#[derive(Debug)]
struct OpenToolUse {
    index: usize,
    id: String,
    name: String,
    input_json: String,
}

#[derive(Debug, Default)]
struct AnthropicRound {
    text: String,
    thinking: String,
    /// Reasoning blocks by content index, in arrival order.
    thinking_blocks: Vec<(usize, ThinkingBlock)>,
    open_tools: Vec<OpenToolUse>,
    /// Calls closed during the round, emitted from `finish()`.
    closed_tools: Vec<ToolCall>,
    finished: bool,
}

impl RoundDecoder<SseEvent> for AnthropicRound {
    fn on_item(&mut self, event: SseEvent) -> Result<Vec<ProviderEvent>, InferenceError> {
        if event.data.trim().is_empty() {
            return Ok(Vec::new());
        }
        let parsed: WireEvent = match serde_json::from_str(&event.data) {
            Ok(e) => e,
            Err(e) => {
                // Unknown event types are skipped; unparseable JSON is not.
                if serde_json::from_str::<serde_json::Value>(&event.data).is_ok() {
                    tracing::debug!(event = ?event.event, "skipping unknown anthropic event");
                    return Ok(Vec::new());
                }
                return Err(InferenceError::MalformedResponse {
                    reason: format!("failed to parse anthropic event: {e}"),
                });
            }
        };

        let mut events = Vec::new();
        match parsed {
            WireEvent::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                WireBlock::Text { text } if !text.is_empty() => {
                    self.text.push_str(&text);
                    events.push(ProviderEvent::TextDelta(text));
                }
                WireBlock::Thinking {
                    thinking,
                    signature,
                } => {
                    self.thinking.push_str(&thinking);
                    self.thinking_blocks.push((
                        index,
                        ThinkingBlock::Thinking {
                            thinking,
                            signature,
                        },
                    ));
                }
                WireBlock::RedactedThinking { data } => {
                    self.thinking_blocks
                        .push((index, ThinkingBlock::RedactedThinking { data }));
                }
                WireBlock::ToolUse { id, name } => self.open_tools.push(OpenToolUse {
                    index,
                    id,
                    name,
                    input_json: String::new(),
                }),
                _ => {}
            },
            WireEvent::ContentBlockDelta { index, delta } => match delta {
                WireDelta::TextDelta { text } => {
                    if !text.is_empty() {
                        self.text.push_str(&text);
                        events.push(ProviderEvent::TextDelta(text));
                    }
                }
                WireDelta::ThinkingDelta { thinking } => {
                    self.thinking.push_str(&thinking);
                    if let Some(ThinkingBlock::Thinking { thinking: block, .. }) =
                        self.thinking_block_mut(index)
                    {
                        block.push_str(&thinking);
                    }
                }
                WireDelta::SignatureDelta { signature } => {
                    if let Some(ThinkingBlock::Thinking { signature: block, .. }) =
                        self.thinking_block_mut(index)
                    {
                        block.push_str(&signature);
                    }
                }
                WireDelta::InputJsonDelta { partial_json } => {
                    if let Some(tool) = self.open_tools.iter_mut().find(|t| t.index == index) {
                        tool.input_json.push_str(&partial_json);
                    }
                }
                WireDelta::Other => {}
            },
            WireEvent::ContentBlockStop { index } => {
                if let Some(pos) = self.open_tools.iter().position(|t| t.index == index) {
                    let tool = self.open_tools.remove(pos);
                    self.closed_tools.push(close_tool(tool));
                }
            }
            WireEvent::MessageStop => self.finished = true,
            WireEvent::Error { error } => {
                return Err(InferenceError::HttpError {
                    status: 500,
                    body: serde_json::json!({ "error": error }).to_string(),
                });
            }
            WireEvent::MessageStart {} | WireEvent::MessageDelta {} | WireEvent::Ping => {}
        }
        Ok(events)
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    fn requires_terminator(&self) -> bool {
        true
    }

    fn finish(&mut self) -> Vec<ProviderEvent> {
        for tool in std::mem::take(&mut self.open_tools) {
            self.closed_tools.push(close_tool(tool));
        }

        let mut events: Vec<ProviderEvent> = std::mem::take(&mut self.closed_tools)
            .into_iter()
            .map(ProviderEvent::ToolCallRequested)
            .collect();

        let thinking = self.thinking.trim();
        let structured_thinking = (!thinking.is_empty()).then(|| thinking.to_string());
        let mut completion = sql_extract::complete(&self.text, None, structured_thinking);
        // Unsigned blocks cannot be replayed.
        completion.thinking_blocks = std::mem::take(&mut self.thinking_blocks)
            .into_iter()
            .map(|(_, block)| block)
            .filter(|block| match block {
                ThinkingBlock::Thinking { signature, .. } => !signature.is_empty(),
                ThinkingBlock::RedactedThinking { data } => !data.is_empty(),
            })
            .collect();
        events.push(ProviderEvent::Done(completion));
        events
    }
}

impl AnthropicRound {
    fn thinking_block_mut(&mut self, index: usize) -> Option<&mut ThinkingBlock> {
        self.thinking_blocks
            .iter_mut()
            .find(|(i, _)| *i == index)
            .map(|(_, block)| block)
    }
}

fn close_tool(tool: OpenToolUse) -> ToolCall {
    ToolCall {
        id: if tool.id.is_empty() {
            fresh_call_id()
        } else {
            tool.id
        },
        name: tool.name,
        arguments: parse_arguments(&tool.input_json),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
