//! Tool-calling loop — drives one provider and the tool executor across
//! bounded rounds.
//!
//! ```text
//! AwaitingModel → ToolsRequested → ExecutingTools → ContinuingModel ─┐
//!       ▲                                                              │
//!       └──────────────────────────────────────────────────────────────┘
//!       └→ Completed | Failed
//! ```
//!
//! The round counter bounds tool execution cycles at `max_rounds`. Every
//! await is raced against the request's `CancellationToken`, so a client
//! disconnect or stream timeout aborts the provider stream and running
//! tools alike.

use std::collections::HashSet;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::errors::AgentError;
use super::tool_catalog;
use super::tool_executor::ToolExecutor;
use crate::inference::provider::fresh_call_id;
use crate::inference::types::{
    ChatMessage, Completion, CredentialScope, ProviderEvent, ProviderRequest, ToolCall, ToolResult,
};
use crate::inference::ModelProvider;

// ─── Types ──────────────────────────────────────────────────────────────────

/// Loop state, logged at every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    AwaitingModel,
    ToolsRequested,
    ExecutingTools,
    ContinuingModel,
    Completed,
    Failed,
}

/// Internal events handed to the stream multiplexer.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopEvent {
    Text(String),
    ToolCall(ToolCall),
    ToolResult(ToolResult),
}

/// Result of a completed (or round-capped) loop.
#[derive(Debug, Clone, Default)]
pub struct LoopOutcome {
    pub final_text: String,
    pub sql: Option<String>,
    pub thinking: Option<String>,
    /// The round cap was hit before the model produced a final answer.
    pub incomplete: bool,
    /// Model invocations made.
    pub rounds: usize,
    /// Messages produced this turn (tool exchanges and the final answer).
    pub messages: Vec<ChatMessage>,
}

/// What one model round produced.
#[derive(Default)]
struct RoundOutput {
    text: String,
    calls: Vec<ToolCall>,
    resolved: Vec<ToolResult>,
    completion: Option<Completion>,
}

impl RoundOutput {
    fn pending(&self) -> Vec<ToolCall> {
        self.calls
            .iter()
            .filter(|c| !self.resolved.iter().any(|r| r.id == c.id))
            .cloned()
            .collect()
    }
}

// ─── ToolLoop ───────────────────────────────────────────────────────────────

pub struct ToolLoop<'a> {
    provider: &'a dyn ModelProvider,
    tools: &'a ToolExecutor,
    max_rounds: usize,
    cancel: CancellationToken,
    events: Option<mpsc::Sender<LoopEvent>>,
    state: LoopState,
    /// Call ids used so far this turn.
    seen_ids: HashSet<String>,
}

impl<'a> ToolLoop<'a> {
    pub fn new(
        provider: &'a dyn ModelProvider,
        tools: &'a ToolExecutor,
        max_rounds: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            provider,
            tools,
            max_rounds: max_rounds.max(1),
            cancel,
            events: None,
            state: LoopState::AwaitingModel,
            seen_ids: HashSet::new(),
        }
    }

    /// Forward text, tool calls and tool results as they happen.
    pub fn with_events(mut self, events: mpsc::Sender<LoopEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    fn transition(&mut self, to: LoopState, round: usize) {
        tracing::debug!(round, from = ?self.state, to = ?to, "tool loop transition");
        self.state = to;
    }

    async fn emit(&self, event: LoopEvent) -> Result<(), AgentError> {
        if let Some(ref tx) = self.events {
            // A dropped receiver means the client is gone.
            tx.send(event).await.map_err(|_| AgentError::Cancelled)?;
        }
        Ok(())
    }

    /// Run the loop to completion over `request.messages`.
    pub async fn run(
        &mut self,
        mut request: ProviderRequest,
        scope: &mut CredentialScope,
    ) -> Result<LoopOutcome, AgentError> {
        let result = self.drive(&mut request, scope).await;
        match result {
            Ok(ref outcome) => {
                self.transition(LoopState::Completed, outcome.rounds);
                tracing::info!(
                    provider = self.provider.name(),
                    rounds = outcome.rounds,
                    incomplete = outcome.incomplete,
                    has_sql = outcome.sql.is_some(),
                    "=== TOOL LOOP COMPLETE ==="
                );
            }
            Err(ref e) => {
                self.transition(LoopState::Failed, 0);
                tracing::warn!(
                    provider = self.provider.name(),
                    error = %e,
                    "=== TOOL LOOP FAILED ==="
                );
            }
        }
        result
    }

    async fn drive(
        &mut self,
        request: &mut ProviderRequest,
        scope: &mut CredentialScope,
    ) -> Result<LoopOutcome, AgentError> {
        let mut outcome = LoopOutcome::default();
        let mut tool_rounds = 0usize;
        let mut texts: Vec<String> = Vec::new();
        let mut thoughts: Vec<String> = Vec::new();
        let mut last_query: Option<String> = None;

        loop {
            outcome.rounds += 1;
            let round = outcome.rounds;
            self.transition(LoopState::AwaitingModel, round);
            tracing::info!(
                round,
                provider = self.provider.name(),
                message_count = request.messages.len(),
                tools = request.tools.len(),
                "=== TOOL LOOP ROUND START ==="
            );

            let output = self.model_round(request, scope, round).await?;
            let pending = output.pending();
            let completion = output.completion.clone().unwrap_or_default();

            if !output.text.trim().is_empty() {
                texts.push(output.text.trim().to_string());
            }
            if let Some(ref t) = completion.thinking {
                thoughts.push(t.clone());
            }

            tracing::info!(
                round,
                text_len = output.text.len(),
                tool_calls = output.calls.len(),
                resolved = output.resolved.len(),
                pending = pending.len(),
                "=== MODEL RESPONSE ==="
            );

            if pending.is_empty() {
                if !output.calls.is_empty() {
                    // Tools resolved upstream still belong to the transcript.
                    record_exchange(&mut outcome.messages, &output, &output.resolved);
                }
                outcome.messages.push(ChatMessage::assistant(completion.final_text.clone()));
                outcome.final_text = completion.final_text;
                outcome.sql = completion.sql.or(last_query);
                outcome.thinking = join_nonempty(&thoughts);
                return Ok(outcome);
            }

            self.transition(LoopState::ToolsRequested, round);
            if tool_rounds >= self.max_rounds {
                tracing::warn!(
                    round,
                    max_rounds = self.max_rounds,
                    unexecuted = pending.len(),
                    "round cap reached, completing with partial answer"
                );
                for call in &pending {
                    let skipped = ToolResult::failure(
                        &call.id,
                        &call.name,
                        "round limit reached; tool was not executed",
                    );
                    self.emit(LoopEvent::ToolResult(skipped)).await?;
                }
                outcome.incomplete = true;
                outcome.final_text = join_nonempty(&texts).unwrap_or_default();
                if !outcome.final_text.is_empty() {
                    outcome
                        .messages
                        .push(ChatMessage::assistant(outcome.final_text.clone()));
                }
                outcome.sql = last_query;
                outcome.thinking = join_nonempty(&thoughts);
                return Ok(outcome);
            }

            self.transition(LoopState::ExecutingTools, round);
            tracing::info!(
                round,
                tool_count = pending.len(),
                tool_names = ?pending.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
                "executing tool calls"
            );
            let executed = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(AgentError::Cancelled),
                results = self.tools.execute_batch(&pending) => results,
            };
            tool_rounds += 1;

            for (call, result) in pending.iter().zip(&executed) {
                if result.success && call.name == tool_catalog::EXECUTE_QUERY {
                    if let Some(q) = call.arguments.get("query").and_then(|q| q.as_str()) {
                        last_query = Some(q.trim().to_string());
                    }
                }
                self.emit(LoopEvent::ToolResult(result.clone())).await?;
            }

            let mut results = output.resolved.clone();
            results.extend(executed);
            // Tool messages follow the order the model asked in.
            results.sort_by_key(|r| output.calls.iter().position(|c| c.id == r.id));

            let before = outcome.messages.len();
            record_exchange(&mut outcome.messages, &output, &results);
            request.messages.extend(outcome.messages[before..].iter().cloned());

            self.transition(LoopState::ContinuingModel, round);
        }
    }

    /// One provider call, consumed until `Done` or `Error`.
    async fn model_round(
        &mut self,
        request: &ProviderRequest,
        scope: &mut CredentialScope,
        round: usize,
    ) -> Result<RoundOutput, AgentError> {
        let mut stream = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(AgentError::Cancelled),
            opened = self.provider.send(request, scope) => opened?,
        };

        let mut output = RoundOutput::default();
        let mut round_ids: HashSet<String> = HashSet::new();

        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(AgentError::Cancelled),
                event = stream.next() => event,
            };
            let Some(event) = event else {
                return Err(AgentError::ProviderError {
                    reason: "provider stream ended without a final answer".to_string(),
                });
            };

            match event {
                ProviderEvent::TextDelta(text) => {
                    output.text.push_str(&text);
                    self.emit(LoopEvent::Text(text)).await?;
                }
                ProviderEvent::ToolCallRequested(mut call) => {
                    if round_ids.contains(&call.id) {
                        tracing::debug!(round, call_id = %call.id, "duplicate tool call ignored");
                        continue;
                    }
                    if self.seen_ids.contains(&call.id) {
                        // Some upstreams restart numbering each round.
                        call.id = fresh_call_id();
                    }
                    round_ids.insert(call.id.clone());
                    self.seen_ids.insert(call.id.clone());
                    self.emit(LoopEvent::ToolCall(call.clone())).await?;
                    output.calls.push(call);
                }
                ProviderEvent::ToolResultAccepted(result) => {
                    let known = output.calls.iter().any(|c| c.id == result.id);
                    let answered = output.resolved.iter().any(|r| r.id == result.id);
                    if !known || answered {
                        tracing::debug!(round, call_id = %result.id, "unmatched tool result dropped");
                        continue;
                    }
                    self.emit(LoopEvent::ToolResult(result.clone())).await?;
                    output.resolved.push(result);
                }
                ProviderEvent::Done(completion) => {
                    output.completion = Some(completion);
                    return Ok(output);
                }
                ProviderEvent::Error { kind, message } => {
                    return Err(AgentError::from_event(kind, message));
                }
            }
        }
    }
}

/// Append the assistant tool-call message and one tool message per result.
fn record_exchange(messages: &mut Vec<ChatMessage>, output: &RoundOutput, results: &[ToolResult]) {
    let text = Some(output.text.trim().to_string());
    let thinking_blocks = output
        .completion
        .as_ref()
        .map(|c| c.thinking_blocks.clone())
        .unwrap_or_default();
    messages.push(
        ChatMessage::assistant_tool_calls(text, output.calls.clone())
            .with_thinking_blocks(thinking_blocks),
    );
    messages.extend(results.iter().map(ChatMessage::tool_result));
}

fn join_nonempty(parts: &[String]) -> Option<String> {
    let joined = parts
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n");
    (!joined.is_empty()).then_some(joined)
}

// ─── Tests ──────────────────────────────────────────────────────────────────
