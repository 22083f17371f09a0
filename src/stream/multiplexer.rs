//! Stream multiplexer — turns one pipeline run into an ordered event stream.
//!
//! A spawned task drives the orchestrator and forwards loop events through
//! an [`OrderingGuard`] into a bounded channel; the HTTP body is the single
//! consumer. Heartbeats are interleaved while the pipeline is working, and
//! idle/overall timeouts cancel the run with a terminal `error{timeout}`.
//! Dropping the [`QueryStream`] cancels the run.

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};

use super::frames::StreamEvent;
use crate::agent_core::orchestrator::{QueryAnswer, QueryOrchestrator, QueryRequest};
use crate::agent_core::tool_loop::LoopEvent;
use crate::agent_core::AgentError;
use crate::config::StreamConfig;
use crate::inference::types::ErrorKind;

/// Reason attached to calls that never got a response.
const UNANSWERED_CALL: &str = "tool call was not completed";

// ─── Ordering Guard ─────────────────────────────────────────────────────────

/// Enforces the outward ordering rules on a single stream.
///
/// - a `tool_response` is only emitted for an open call id
/// - a repeated `tool_call` id is dropped
/// - open calls get a synthesized failed response before the terminal event
/// - nothing passes once `done` or `error` has been emitted
#[derive(Debug, Default)]
pub struct OrderingGuard {
    open: Vec<String>,
    seen: HashSet<String>,
    terminated: bool,
}

impl OrderingGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events to emit, in order, for one proposed event.
    pub fn admit(&mut self, event: StreamEvent) -> Vec<StreamEvent> {
        if self.terminated {
            tracing::debug!(event = event.type_name(), "dropping event after terminal frame");
            return Vec::new();
        }
        if event.is_terminal() {
            self.terminated = true;
            let mut out: Vec<StreamEvent> = self
                .open
                .drain(..)
                .map(|id| StreamEvent::synthesized_failure(&id, UNANSWERED_CALL))
                .collect();
            out.push(event);
            return out;
        }
        match &event {
            StreamEvent::ToolCall { id, .. } => {
                if !self.seen.insert(id.clone()) {
                    tracing::warn!(call_id = %id, "dropping duplicate tool_call");
                    return Vec::new();
                }
                self.open.push(id.clone());
            }
            StreamEvent::ToolResponse { id, .. } => match self.open.iter().position(|o| o == id) {
                Some(pos) => {
                    self.open.remove(pos);
                }
                None => {
                    tracing::warn!(call_id = %id, "dropping tool_response without open call");
                    return Vec::new();
                }
            },
            _ => {}
        }
        vec![event]
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }
}

// ─── Settings ───────────────────────────────────────────────────────────────

/// Stream timings resolved from config.
#[derive(Debug, Clone, Copy)]
pub struct StreamSettings {
    pub heartbeat: Duration,
    pub idle_timeout: Duration,
    pub overall_timeout: Duration,
    pub channel_capacity: usize,
}

impl From<&StreamConfig> for StreamSettings {
    fn from(config: &StreamConfig) -> Self {
        Self {
            heartbeat: config.heartbeat_interval(),
            idle_timeout: config.idle_timeout(),
            overall_timeout: config.overall_timeout(),
            channel_capacity: config.channel_capacity.max(1),
        }
    }
}

// ─── Query Stream ───────────────────────────────────────────────────────────

/// Consumer end of a streamed query. Dropping it cancels the run.
pub struct QueryStream {
    rx: mpsc::Receiver<StreamEvent>,
    cancel: CancellationToken,
    _guard: DropGuard,
}

impl QueryStream {
    /// Token cancelled when the run is abandoned.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Stream for QueryStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Spawn the pipeline for `request` and return its event stream.
pub fn start(
    orchestrator: Arc<QueryOrchestrator>,
    request: QueryRequest,
    settings: StreamSettings,
) -> QueryStream {
    let cancel = CancellationToken::new();
    let (tx, rx) = mpsc::channel(settings.channel_capacity);

    tokio::spawn(pump(orchestrator, request, settings, cancel.clone(), tx));

    QueryStream {
        rx,
        cancel: cancel.clone(),
        _guard: cancel.drop_guard(),
    }
}

/// Ordered sender for the outward channel.
///
/// A send that cannot complete before the idle window or the overall
/// deadline (whichever is first) counts as a stalled consumer: the run is
/// cancelled and the stream ends.
struct Emitter {
    tx: mpsc::Sender<StreamEvent>,
    guard: OrderingGuard,
    cancel: CancellationToken,
    deadline: Instant,
    idle_timeout: Duration,
}

impl Emitter {
    /// `false` once the consumer is gone or stalled; the run is cancelled.
    async fn emit(&mut self, event: StreamEvent) -> bool {
        for admitted in self.guard.admit(event) {
            let pending = match self.tx.try_send(admitted) {
                Ok(()) => continue,
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.cancel.cancel();
                    return false;
                }
                Err(mpsc::error::TrySendError::Full(pending)) => pending,
            };
            let limit = self.deadline.min(Instant::now() + self.idle_timeout);
            match tokio::time::timeout_at(limit, self.tx.send(pending)).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => {
                    self.cancel.cancel();
                    return false;
                }
                Err(_) => {
                    tracing::warn!("stream consumer stalled, run cancelled");
                    self.cancel.cancel();
                    return false;
                }
            }
        }
        true
    }
}

fn loop_frame(event: LoopEvent) -> StreamEvent {
    match event {
        LoopEvent::Text(content) => StreamEvent::Chunk { content },
        LoopEvent::ToolCall(call) => StreamEvent::tool_call(&call),
        LoopEvent::ToolResult(result) => StreamEvent::tool_response(&result),
    }
}

fn done_frame(answer: QueryAnswer) -> StreamEvent {
    StreamEvent::Done {
        message: answer.outcome.final_text,
        sql: answer.outcome.sql,
        thinking: answer.outcome.thinking,
        incomplete: answer.outcome.incomplete,
        complexity: Some(answer.analysis.score),
        routing: Some(answer.decision.info()),
    }
}

fn error_frame(error: &AgentError) -> StreamEvent {
    StreamEvent::error(error.kind(), error.to_string())
}

async fn pump(
    orchestrator: Arc<QueryOrchestrator>,
    request: QueryRequest,
    settings: StreamSettings,
    cancel: CancellationToken,
    tx: mpsc::Sender<StreamEvent>,
) {
    let deadline = Instant::now() + settings.overall_timeout;
    let mut out = Emitter {
        tx,
        guard: OrderingGuard::new(),
        cancel: cancel.clone(),
        deadline,
        idle_timeout: settings.idle_timeout,
    };

    let prepared = match orchestrator.prepare(request) {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(error = %e, "stream request rejected");
            out.emit(error_frame(&e)).await;
            return;
        }
    };

    let session = StreamEvent::Session {
        session_id: prepared.session.session_id.clone(),
        connection_id: prepared.session.connection_id.clone(),
        mode: Some(prepared.session.mode.as_str().to_string()),
    };
    let tools = StreamEvent::Tools {
        tools: prepared.tool_names(),
    };
    if !out.emit(session).await || !out.emit(tools).await {
        return;
    }

    let (loop_tx, mut loop_rx) = mpsc::channel(settings.channel_capacity);
    let run = orchestrator.run(prepared, Some(loop_tx), cancel.clone());
    tokio::pin!(run);

    let overall = tokio::time::sleep_until(deadline);
    let idle = tokio::time::sleep(settings.idle_timeout);
    tokio::pin!(overall, idle);
    let mut heartbeat =
        tokio::time::interval_at(Instant::now() + settings.heartbeat, settings.heartbeat);
    let mut loop_open = true;

    let terminal = loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                tracing::info!("stream consumer gone, run cancelled");
                return;
            }
            _ = &mut overall => {
                tracing::warn!(timeout_secs = settings.overall_timeout.as_secs_f64(), "stream overall timeout");
                cancel.cancel();
                break StreamEvent::error(ErrorKind::Timeout, "request exceeded the overall time limit");
            }
            _ = &mut idle => {
                tracing::warn!(timeout_secs = settings.idle_timeout.as_secs_f64(), "stream idle timeout");
                cancel.cancel();
                break StreamEvent::error(ErrorKind::Timeout, "no progress from the model within the idle time limit");
            }
            event = loop_rx.recv(), if loop_open => match event {
                Some(event) => {
                    idle.as_mut().reset(Instant::now() + settings.idle_timeout);
                    if !out.emit(loop_frame(event)).await {
                        return;
                    }
                }
                None => loop_open = false,
            },
            result = &mut run => {
                while let Ok(event) = loop_rx.try_recv() {
                    if !out.emit(loop_frame(event)).await {
                        return;
                    }
                }
                break match result {
                    Ok(answer) => done_frame(answer),
                    Err(e) => {
                        tracing::warn!(error = %e, kind = e.kind().as_str(), "stream run failed");
                        error_frame(&e)
                    }
                };
            }
            _ = heartbeat.tick() => {
                if !out.emit(StreamEvent::heartbeat()).await {
                    return;
                }
            }
        }
    };

    out.emit(terminal).await;
}

// ─── Tests ──────────────────────────────────────────────────────────────────
