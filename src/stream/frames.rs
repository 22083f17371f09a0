//! NDJSON frame codec for the outward streaming protocol.
//!
//! One JSON envelope per `\n`-terminated line, tagged by `type`. The decoder
//! buffers raw bytes and only splits on `\n`, so a UTF-8 sequence split
//! across network reads is reassembled before parsing.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::inference::types::{ErrorKind, ToolCall, ToolResult};

// ─── Events ──────────────────────────────────────────────────────────────────

/// Routing summary attached to `done` frames and response envelopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingInfo {
    /// Selected tier: `simple` or `complex`.
    pub selected_agent: String,
    pub reason: String,
    pub use_thinking: bool,
}

/// One outward stream event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Session {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        connection_id: Option<String>,
        #[serde(default)]
        mode: Option<String>,
    },
    Tools {
        tools: Vec<String>,
    },
    Chunk {
        content: String,
    },
    ToolCall {
        id: String,
        name: String,
        #[serde(default)]
        args: serde_json::Value,
    },
    ToolResponse {
        id: String,
        #[serde(default)]
        name: Option<String>,
        success: bool,
        #[serde(default)]
        response: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Vec<serde_json::Map<String, serde_json::Value>>>,
    },
    Done {
        #[serde(default)]
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sql: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thinking: Option<String>,
        #[serde(default)]
        incomplete: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        complexity: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        routing: Option<RoutingInfo>,
    },
    Error {
        #[serde(default = "default_error_kind")]
        kind: ErrorKind,
        message: String,
    },
    Heartbeat {
        timestamp: String,
    },
}

fn default_error_kind() -> ErrorKind {
    ErrorKind::Provider
}

impl StreamEvent {
    pub fn tool_call(call: &ToolCall) -> Self {
        StreamEvent::ToolCall {
            id: call.id.clone(),
            name: call.name.clone(),
            args: call.arguments.clone(),
        }
    }

    pub fn tool_response(result: &ToolResult) -> Self {
        StreamEvent::ToolResponse {
            id: result.id.clone(),
            name: Some(result.name.clone()),
            success: result.success,
            response: if result.success {
                result.response.clone()
            } else {
                result.error.clone().unwrap_or_else(|| result.response.clone())
            },
            data: result.data.clone(),
        }
    }

    /// Failed response for a call that never got one.
    pub fn synthesized_failure(id: &str, reason: &str) -> Self {
        StreamEvent::ToolResponse {
            id: id.to_string(),
            name: None,
            success: false,
            response: reason.to_string(),
            data: None,
        }
    }

    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        StreamEvent::Error {
            kind,
            message: message.into(),
        }
    }

    pub fn heartbeat() -> Self {
        StreamEvent::Heartbeat {
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// `done` and `error` end the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done { .. } | StreamEvent::Error { .. })
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            StreamEvent::Session { .. } => "session",
            StreamEvent::Tools { .. } => "tools",
            StreamEvent::Chunk { .. } => "chunk",
            StreamEvent::ToolCall { .. } => "tool_call",
            StreamEvent::ToolResponse { .. } => "tool_response",
            StreamEvent::Done { .. } => "done",
            StreamEvent::Error { .. } => "error",
            StreamEvent::Heartbeat { .. } => "heartbeat",
        }
    }
}

// ─── Encoder ─────────────────────────────────────────────────────────────────

/// Serializes events as newline-terminated JSON lines.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameEncoder;

impl FrameEncoder {
    pub fn encode(&self, event: &StreamEvent) -> Result<Vec<u8>, serde_json::Error> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        Ok(line)
    }
}

// ─── Decoder ─────────────────────────────────────────────────────────────────

/// Longest line accepted before the peer is treated as broken.
pub const DEFAULT_MAX_LINE_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame exceeds {limit} bytes without a line terminator")]
    LineTooLong { limit: usize },
}

/// Splits a byte stream into complete lines with explicit carry-over.
///
/// Bytes already searched for a terminator are not searched again.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    /// Prefix of `buffer` known to hold no `\n`.
    scanned: usize,
    max_line: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            max_line: DEFAULT_MAX_LINE_BYTES,
        }
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_line(mut self, max_line: usize) -> Self {
        self.max_line = max_line.max(1);
        self
    }

    /// Feed raw bytes; returns every non-blank line completed by this chunk.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<String>, FrameError> {
        self.buffer.extend_from_slice(bytes);

        let mut lines = Vec::new();
        let mut start = 0;
        let mut from = self.scanned;
        while let Some(offset) = self.buffer[from..].iter().position(|b| *b == b'\n') {
            let end = from + offset;
            if end - start > self.max_line {
                return Err(self.overflow());
            }
            if let Some(text) = to_line(&self.buffer[start..end]) {
                lines.push(text);
            }
            start = end + 1;
            from = start;
        }
        self.buffer.drain(..start);
        self.scanned = self.buffer.len();

        if self.buffer.len() > self.max_line {
            return Err(self.overflow());
        }
        Ok(lines)
    }

    /// Flush an unterminated final line once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        self.scanned = 0;
        let rest = std::mem::take(&mut self.buffer);
        to_line(&rest)
    }

    /// Bytes waiting for a line terminator.
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    fn overflow(&mut self) -> FrameError {
        self.buffer.clear();
        self.scanned = 0;
        FrameError::LineTooLong {
            limit: self.max_line,
        }
    }
}

fn to_line(bytes: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(bytes);
    let trimmed = text.trim_end_matches('\r').trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Parse one line as a stream event.
pub fn decode_frame(line: &str) -> Result<StreamEvent, serde_json::Error> {
    serde_json::from_str(line)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
