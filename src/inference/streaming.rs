//! Server-Sent Events decoder shared by the HTTP adapters.
//!
//! Reads a byte stream, splits it on SSE event boundaries (`\n\n`), and yields
//! `SseEvent`s. Partial events are carried over between chunks as raw bytes,
//! so a multi-byte UTF-8 character split across two network reads is
//! reassembled before decoding.

use std::collections::VecDeque;

use futures::stream::{self, Stream, StreamExt};

use super::errors::InferenceError;

// ─── SseEvent ────────────────────────────────────────────────────────────────

/// One decoded SSE event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    /// Value of the `event:` field, when present.
    pub event: Option<String>,
    /// Concatenated `data:` lines (joined with `\n`).
    pub data: String,
}

// ─── SseDecoder ──────────────────────────────────────────────────────────────

/// Incremental SSE decoder with explicit carry-over state.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes; returns every event completed by this chunk.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        // CRLF framing is legal SSE; normalize to LF.
        self.buffer.extend(bytes.iter().copied().filter(|b| *b != b'\r'));

        let mut events = Vec::new();
        while let Some(end) = find_boundary(&self.buffer) {
            let block: Vec<u8> = self.buffer.drain(..end + 2).collect();
            if let Some(event) = parse_block(&block[..end]) {
                events.push(event);
            }
        }
        events
    }

    /// Flush whatever remains once the underlying stream has ended.
    pub fn finish(&mut self) -> Option<SseEvent> {
        let rest = std::mem::take(&mut self.buffer);
        parse_block(&rest)
    }
}

fn find_boundary(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\n\n")
}

/// Parse one event block. Comment-only and empty blocks yield `None`.
fn parse_block(block: &[u8]) -> Option<SseEvent> {
    let text = String::from_utf8_lossy(block);
    let mut event = SseEvent::default();
    let mut data_lines: Vec<&str> = Vec::new();

    for line in text.lines() {
        if line.starts_with(':') {
            continue; // comment / keep-alive
        }
        if let Some(value) = line.strip_prefix("data:") {
            data_lines.push(value.strip_prefix(' ').unwrap_or(value));
        } else if let Some(value) = line.strip_prefix("event:") {
            event.event = Some(value.trim().to_string());
        }
        // id:, retry: and unknown fields are ignored
    }

    if data_lines.is_empty() && event.event.is_none() {
        return None;
    }
    event.data = data_lines.join("\n");
    Some(event)
}

// ─── Stream adapter ──────────────────────────────────────────────────────────

/// Turn any byte stream (e.g. `reqwest::Response::bytes_stream()`) into a
/// stream of SSE events.
pub fn decode_sse<S, B, E>(byte_stream: S) -> impl Stream<Item = Result<SseEvent, InferenceError>>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    stream::unfold(
        (byte_stream, SseDecoder::new(), VecDeque::new(), false),
        |(mut byte_stream, mut decoder, mut pending, mut ended)| async move {
            loop {
                if let Some(event) = pending.pop_front() {
                    return Some((Ok(event), (byte_stream, decoder, pending, ended)));
                }
                if ended {
                    return None;
                }

                match byte_stream.next().await {
                    Some(Ok(bytes)) => pending.extend(decoder.push(bytes.as_ref())),
                    Some(Err(e)) => {
                        ended = true;
                        return Some((
                            Err(InferenceError::StreamError {
                                reason: format!("stream read error: {e}"),
                            }),
                            (byte_stream, decoder, pending, ended),
                        ));
                    }
                    None => {
                        ended = true;
                        if let Some(event) = decoder.finish() {
                            pending.push_back(event);
                        }
                    }
                }
            }
        },
    )
}

/// Convenience wrapper for a `reqwest` response body.
pub fn sse_events(
    response: reqwest::Response,
) -> impl Stream<Item = Result<SseEvent, InferenceError>> {
    decode_sse(Box::pin(response.bytes_stream()))
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_event() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b"data: {\"a\":1}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{\"a\":1}");
        assert!(events[0].event.is_none());
    }

    #[test]
    fn test_partial_event_carried_over() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"event: content_block_delta\nda").is_empty());
        let events = decoder.push(b"ta: {\"x\":true}\n\ndata: [DONE]\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event.as_deref(), Some("content_block_delta"));
        assert_eq!(events[0].data, "{\"x\":true}");
        assert_eq!(events[1].data, "[DONE]");
    }

    #[test]
    fn test_crlf_and_comments() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b": ping\r\n\r\ndata: hi\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "hi");
    }

    #[test]
    fn test_multibyte_split_across_chunks() {
        let payload = "data: caf\u{e9}\n\n".as_bytes().to_vec();
        // Split inside the two-byte 'é'
        let split = payload.iter().position(|b| *b == 0xC3).unwrap() + 1;
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(&payload[..split]).is_empty());
        let events = decoder.push(&payload[split..]);
        assert_eq!(events[0].data, "café");
    }

    #[test]
    fn test_finish_flushes_unterminated_event() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: tail").is_empty());
        assert_eq!(decoder.finish().unwrap().data, "tail");
        assert!(decoder.finish().is_none());
    }

    #[tokio::test]
    async fn test_decode_sse_stream() {
        let chunks: Vec<Result<Vec<u8>, std::io::Error>> = vec![
            Ok(b"data: one\n".to_vec()),
            Ok(b"\ndata: two\n\n".to_vec()),
        ];
        let events: Vec<_> = decode_sse(futures::stream::iter(chunks)).collect().await;
        let data: Vec<String> = events.into_iter().map(|e| e.unwrap().data).collect();
        assert_eq!(data, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_decode_sse_stream_error_terminates() {
        let chunks: Vec<Result<Vec<u8>, std::io::Error>> = vec![
            Ok(b"data: one\n\n".to_vec()),
            Err(std::io::Error::other("reset")),
            Ok(b"data: never\n\n".to_vec()),
        ];
        let events: Vec<_> = decode_sse(futures::stream::iter(chunks)).collect().await;
        assert_eq!(events.len(), 2);
        assert!(events[0].is_ok());
        assert!(matches!(events[1], Err(InferenceError::StreamError { .. })));
    }
}
