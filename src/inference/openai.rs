//! OpenAI chat-completions adapter (function calling, SSE streaming).
//!
//! Tool-call fragments arrive spread over many deltas keyed by `index`; they
//! are accumulated per index and emitted as whole `ToolCallRequested` events
//! once the round ends. Reasoning comes either from a `reasoning_content`
//! delta field or from `<thinking>` tags in the answer text.

use async_trait::async_trait;
use serde::Deserialize;

use super::client::{bearer, headers, ProviderHttp};
use super::errors::InferenceError;
use super::provider::{
    drive_round, effective_credentials, fresh_call_id, parse_arguments, EventStream,
    ModelProvider, RoundDecoder,
};
use super::sql_extract;
use super::streaming::{sse_events, SseEvent};
use super::types::{
    ChatMessage, CredentialScope, Credentials, ProviderEvent, ProviderRequest, Role, ToolCall,
};
use crate::config::ProviderConfig;

// ─── Wire Types ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ChunkEnvelope {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    /// Reasoning stream emitted by reasoning-capable OpenAI-compatible servers.
    #[serde(default, alias = "reasoning")]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ChunkToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ChunkToolCall {
    #[serde(default)]
    index: Option<u32>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<ChunkFunction>,
}

#[derive(Debug, Deserialize)]
struct ChunkFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

// ─── Adapter ─────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct OpenAiAdapter {
    name: String,
    config: ProviderConfig,
    http: ProviderHttp,
}

impl OpenAiAdapter {
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

        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if !request.system_prompt.is_empty() {
            messages.push(serde_json::json!({
                "role": "system",
                "content": request.system_prompt,
            }));
        }
        messages.extend(request.messages.iter().map(wire_message));

        let mut body = serde_json::json!({
            "model": model,
            "messages": messages,
            "temperature": request.temperature.unwrap_or(self.config.temperature),
            "max_tokens": request.max_tokens.unwrap_or(self.config.max_tokens),
            "stream": true,
        });
        if !request.tools.is_empty() {
            body["tools"] = request.tools.iter().map(|t| t.to_openai()).collect();
            body["tool_choice"] = serde_json::json!("auto");
        }
        body
    }
}

/// Canonical message → OpenAI chat message.
fn wire_message(message: &ChatMessage) -> serde_json::Value {
    let content = message.content.clone().unwrap_or_default();
    match message.role {
        Role::Tool => serde_json::json!({
            "role": "tool",
            "tool_call_id": message.tool_call_id,
            "content": content,
        }),
        Role::Assistant if message.tool_calls.is_some() => {
            let calls: Vec<serde_json::Value> = message
                .tool_calls
                .iter()
                .flatten()
                .map(|c| {
                    serde_json::json!({
                        "id": c.id,
                        "type": "function",
                        "function": {
                            "name": c.name,
                            "arguments": c.arguments.to_string(),
                        }
                    })
                })
                .collect();
            serde_json::json!({
                "role": "assistant",
                "content": content,
                "tool_calls": calls,
            })
        }
        role => serde_json::json!({
            "role": role.as_str(),
            "content": content,
        }),
    }
}

#[async_trait]
impl ModelProvider for OpenAiAdapter {
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
            message_count = request.messages.len() + 1,
            tool_count = request.tools.len(),
            thinking = request.thinking,
            "=== LLM REQUEST ==="
        );

        let hdrs = headers([bearer(&api_key), ("accept", "text/event-stream".to_string())])?;
        let response = self
            .http
            .post_json("chat/completions", hdrs, &body, true)
            .await?;

        Ok(drive_round(Box::pin(sse_events(response)), OpenAiRound::default()))
    }
}

// ─── Round State ─────────────────────────────────────────────────────────────

/// In-progress tool call, keyed by the delta `index`.
#[derive(Debug)]
struct PendingCall {
    index: u32,
    id: Option<String>,
    name: String,
    arguments: String,
}

/// Accumulates one streamed round.
#[derive(Debug, Default)]
struct OpenAiRound {
    text: String,
    reasoning: String,
    pending_tool_calls: Vec<PendingCall>,
    finished: bool,
}

impl OpenAiRound {
    fn apply_tool_delta(&mut self, tc: ChunkToolCall) {
        let index = tc.index.unwrap_or(0);
        let (name, args) = tc
            .function
            .map(|f| (f.name.unwrap_or_default(), f.arguments.unwrap_or_default()))
            .unwrap_or_default();

        match self.pending_tool_calls.iter_mut().find(|p| p.index == index) {
            Some(pending) => {
                pending.name.push_str(&name);
                pending.arguments.push_str(&args);
                if tc.id.is_some() {
                    pending.id = tc.id;
                }
            }
            None => self.pending_tool_calls.push(PendingCall {
                index,
                id: tc.id,
                name,
                arguments: args,
            }),
        }
    }
}

impl RoundDecoder<SseEvent> for OpenAiRound {
    fn on_item(&mut self, event: SseEvent) -> Result<Vec<ProviderEvent>, InferenceError> {
        let data = event.data.trim();
        if data == "[DONE]" {
            self.finished = true;
            return Ok(Vec::new());
        }
        if data.is_empty() {
            return Ok(Vec::new());
        }

        let chunk: ChunkEnvelope =
            serde_json::from_str(data).map_err(|e| InferenceError::MalformedResponse {
                reason: format!("failed to parse SSE chunk: {e}"),
            })?;

        if let Some(error) = chunk.error {
            return Err(InferenceError::HttpError {
                status: 500,
                body: serde_json::json!({ "error": error }).to_string(),
            });
        }

        let mut events = Vec::new();
        for choice in chunk.choices {
            let delta = choice.delta;
            if let Some(content) = delta.content.filter(|c| !c.is_empty()) {
                self.text.push_str(&content);
                events.push(ProviderEvent::TextDelta(content));
            }
            if let Some(reasoning) = delta.reasoning_content {
                self.reasoning.push_str(&reasoning);
            }
            for tc in delta.tool_calls.into_iter().flatten() {
                self.apply_tool_delta(tc);
            }
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
        let mut pending = std::mem::take(&mut self.pending_tool_calls);
        pending.sort_by_key(|p| p.index);

        let mut events: Vec<ProviderEvent> = pending
            .into_iter()
            .filter(|p| !p.name.is_empty())
            .map(|p| {
                ProviderEvent::ToolCallRequested(ToolCall {
                    id: p.id.filter(|id| !id.is_empty()).unwrap_or_else(fresh_call_id),
                    name: p.name,
                    arguments: parse_arguments(&p.arguments),
                })
            })
            .collect();

        let reasoning = std::mem::take(&mut self.reasoning);
        let structured_thinking = (!reasoning.trim().is_empty()).then(|| reasoning.trim().to_string());
        events.push(ProviderEvent::Done(sql_extract::complete(
            &self.text,
            None,
            structured_thinking,
        )));
        events
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
