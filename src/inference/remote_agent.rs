//! Remote-agent provider: a hosted endpoint that selects models and may run
//! tools itself.
//!
//! Requests carry a bearer token; the response is an NDJSON stream in the
//! same frame vocabulary this service emits outward. Calls the upstream
//! resolves itself arrive as `tool_call` + `tool_response` pairs and surface as
//! `ToolResultAccepted`; calls left unanswered are executed locally by the
//! tool loop. Opening the stream goes through the token refresher.

use std::collections::VecDeque;

use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};

use super::client::{bearer, headers, ProviderHttp};
use super::errors::InferenceError;
use super::provider::{drive_round, EventStream, ModelProvider, RoundDecoder};
use super::refresh::{call_with_refresh, TokenRefresher};
use super::sql_extract;
use super::types::{
    CredentialScope, Credentials, ErrorKind, ProviderEvent, ProviderRequest, Role, ToolCall,
    ToolResult,
};
use crate::config::ProviderConfig;
use crate::stream::frames::{decode_frame, FrameDecoder, StreamEvent};

#[derive(Debug)]
pub struct RemoteAgentAdapter {
    name: String,
    config: ProviderConfig,
    http: ProviderHttp,
    refresher: Option<TokenRefresher>,
}

impl RemoteAgentAdapter {
    pub fn new(
        name: &str,
        config: ProviderConfig,
        http: ProviderHttp,
        refresher: Option<TokenRefresher>,
    ) -> Self {
        Self {
            name: name.to_string(),
            config,
            http,
            refresher,
        }
    }

    fn build_body(&self, request: &ProviderRequest) -> serde_json::Value {
        let query = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .and_then(|m| m.content.clone())
            .unwrap_or_default();
        let model = request
            .model
            .clone()
            .or_else(|| Some(self.config.model_for(request.tier).to_string()))
            .filter(|m| !m.is_empty());

        serde_json::json!({
            "query": query,
            "system": request.system_prompt,
            "messages": request.messages,
            "tools": request.tools.iter().map(|t| t.to_anthropic()).collect::<Vec<_>>(),
            "model": model,
            "tier": request.tier.as_str(),
            "use_thinking": request.thinking,
            "temperature": request.temperature.unwrap_or(self.config.temperature),
            "max_tokens": request.max_tokens.unwrap_or(self.config.max_tokens),
            "session_id": request.session_id,
            "stream": true,
        })
    }

    async fn open(
        &self,
        body: &serde_json::Value,
        creds: Credentials,
    ) -> Result<reqwest::Response, InferenceError> {
        let token = match creds {
            Credentials::Bearer { access_token, .. } => access_token,
            _ => {
                return Err(InferenceError::AuthFailed {
                    reason: format!("provider '{}' requires a bearer access token", self.name),
                })
            }
        };
        let hdrs = headers([
            bearer(&token),
            ("accept", "application/x-ndjson".to_string()),
        ])?;
        self.http.post_json("", hdrs, body, true).await
    }
}

#[async_trait]
impl ModelProvider for RemoteAgentAdapter {
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
        if !matches!(scope.credentials, Credentials::Bearer { .. }) {
            return Err(InferenceError::AuthFailed {
                reason: format!("missing credentials for provider '{}'", self.name),
            });
        }

        let body = self.build_body(request);
        tracing::info!(
            provider = %self.name,
            message_count = request.messages.len(),
            thinking = request.thinking,
            "=== REMOTE AGENT REQUEST ==="
        );

        let body = &body;
        let response =
            call_with_refresh(self.refresher.as_ref(), scope, move |creds| self.open(body, creds))
                .await?;

        let lines = ndjson_lines(Box::pin(response.bytes_stream()));
        Ok(drive_round(Box::pin(lines), RemoteRound::default()))
    }
}

// ─── NDJSON Lines ────────────────────────────────────────────────────────────

/// Split a byte stream into NDJSON lines using the frame decoder.
fn ndjson_lines<S, B, E>(byte_stream: S) -> impl Stream<Item = Result<String, InferenceError>>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    stream::unfold(
        (byte_stream, FrameDecoder::new(), VecDeque::new(), false),
        |(mut byte_stream, mut decoder, mut pending, mut ended)| async move {
            loop {
                if let Some(line) = pending.pop_front() {
                    return Some((Ok(line), (byte_stream, decoder, pending, ended)));
                }
                if ended {
                    return None;
                }
                match byte_stream.next().await {
                    Some(Ok(bytes)) => match decoder.push(bytes.as_ref()) {
                        Ok(lines) => pending.extend(lines),
                        Err(e) => {
                            ended = true;
                            return Some((
                                Err(InferenceError::MalformedResponse {
                                    reason: e.to_string(),
                                }),
                                (byte_stream, decoder, pending, ended),
                            ));
                        }
                    },
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
                        if let Some(line) = decoder.finish() {
                            pending.push_back(line);
                        }
                    }
                }
            }
        },
    )
}

// ─── Round State ─────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct RemoteRound {
    text: String,
    final_message: Option<String>,
    sql: Option<String>,
    thinking: Option<String>,
    finished: bool,
    failed: bool,
}

impl RoundDecoder<String> for RemoteRound {
    fn on_item(&mut self, line: String) -> Result<Vec<ProviderEvent>, InferenceError> {
        let frame = match decode_frame(&line) {
            Ok(frame) => frame,
            Err(e) => return self.on_unrecognized(&line, e),
        };

        let events = match frame {
            StreamEvent::Chunk { content } => {
                if content.is_empty() {
                    Vec::new()
                } else {
                    self.text.push_str(&content);
                    vec![ProviderEvent::TextDelta(content)]
                }
            }
            StreamEvent::ToolCall { id, name, args } => {
                vec![ProviderEvent::ToolCallRequested(ToolCall {
                    id,
                    name,
                    arguments: args,
                })]
            }
            StreamEvent::ToolResponse {
                id,
                name,
                success,
                response,
                data,
            } => vec![ProviderEvent::ToolResultAccepted(ToolResult {
                id,
                name: name.unwrap_or_default(),
                success,
                error: (!success).then(|| response.clone()),
                response,
                data,
                execution_time_ms: 0,
            })],
            StreamEvent::Done {
                message,
                sql,
                thinking,
                ..
            } => {
                self.final_message = Some(message).filter(|m| !m.is_empty());
                self.sql = sql;
                self.thinking = thinking;
                self.finished = true;
                Vec::new()
            }
            StreamEvent::Error { kind, message } => {
                self.failed = true;
                self.finished = true;
                vec![ProviderEvent::Error { kind, message }]
            }
            StreamEvent::Session { .. } | StreamEvent::Tools { .. } | StreamEvent::Heartbeat { .. } => {
                Vec::new()
            }
        };
        Ok(events)
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    fn finish(&mut self) -> Vec<ProviderEvent> {
        if self.failed {
            return Vec::new();
        }
        let text = self.final_message.take().unwrap_or_else(|| self.text.clone());
        vec![ProviderEvent::Done(sql_extract::complete(
            &text,
            self.sql.take(),
            self.thinking.take(),
        ))]
    }
}

impl RemoteRound {
    /// Frames of unknown type are skipped; an `error` frame with an unfamiliar
    /// kind is still an error; anything that isn't JSON is malformed.
    fn on_unrecognized(
        &mut self,
        line: &str,
        err: serde_json::Error,
    ) -> Result<Vec<ProviderEvent>, InferenceError> {
        let value: serde_json::Value =
            serde_json::from_str(line).map_err(|_| InferenceError::MalformedResponse {
                reason: format!("invalid NDJSON frame: {err}"),
            })?;

        if value.get("type").and_then(|t| t.as_str()) == Some("error") {
            self.failed = true;
            self.finished = true;
            let message = value
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("remote agent error")
                .to_string();
            return Ok(vec![ProviderEvent::Error {
                kind: ErrorKind::Provider,
                message,
            }]);
        }

        tracing::debug!(frame_type = ?value.get("type"), "skipping unrecognized remote frame");
        Ok(Vec::new())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderKind;
    use crate::inference::types::{ChatMessage, ModelTier};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter(server: &MockServer, with_refresher: bool) -> RemoteAgentAdapter {
        let base = format!("{}/agent", server.uri());
        let config = ProviderConfig {
            kind: ProviderKind::RemoteAgent,
            base_url: base.clone(),
            simple_model: String::new(),
            complex_model: String::new(),
            api_key: None,
            max_tokens: 1000,
            temperature: 0.2,
            thinking_budget_tokens: 0,
            request_timeout_secs: 5,
        };
        let refresher = with_refresher.then(|| {
            TokenRefresher::new(ProviderHttp::new(&format!("{}/auth/refresh", server.uri()), None).unwrap())
        });
        RemoteAgentAdapter::new("agent", config, ProviderHttp::new(&base, None).unwrap(), refresher)
    }

    fn request() -> ProviderRequest {
        ProviderRequest {
            model: None,
            tier: ModelTier::Complex,
            system_prompt: "sys".into(),
            messages: vec![ChatMessage::user("Revenue by region")],
            tools: Vec::new(),
            temperature: None,
            max_tokens: None,
            thinking: true,
            session_id: Some("s1".into()),
        }
    }

    fn scope(access: &str) -> CredentialScope {
        CredentialScope::new(Credentials::Bearer {
            access_token: access.into(),
            refresh_token: Some("r1".into()),
        })
    }

    fn ndjson(frames: &[serde_json::Value]) -> String {
        frames.iter().map(|f| format!("{f}\n")).collect()
    }

    #[test]
    fn test_body_carries_query_and_tier() {
        let server_uri = "http://localhost:1/agent";
        let config = ProviderConfig {
            kind: ProviderKind::RemoteAgent,
            base_url: server_uri.into(),
            simple_model: String::new(),
            complex_model: String::new(),
            api_key: None,
            max_tokens: 1000,
            temperature: 0.2,
            thinking_budget_tokens: 0,
            request_timeout_secs: 5,
        };
        let a = RemoteAgentAdapter::new("agent", config, ProviderHttp::new(server_uri, None).unwrap(), None);
        let body = a.build_body(&request());
        assert_eq!(body["query"], "Revenue by region");
        assert_eq!(body["tier"], "complex");
        assert_eq!(body["use_thinking"], true);
        assert!(body["model"].is_null());
        assert_eq!(body["session_id"], "s1");
    }

    #[tokio::test]
    async fn test_ndjson_lines_split_across_chunks() {
        let chunks: Vec<Result<Vec<u8>, std::io::Error>> = vec![
            Ok(b"{\"type\":\"chunk\",\"content\":\"a\"}\n{\"type\":".to_vec()),
            Ok(b"\"chunk\",\"content\":\"b\"}".to_vec()),
        ];
        let lines: Vec<_> = ndjson_lines(stream::iter(chunks)).collect().await;
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].as_ref().unwrap(), r#"{"type":"chunk","content":"b"}"#);
    }

    #[test]
    fn test_round_maps_upstream_frames() {
        let mut round = RemoteRound::default();
        let frames = [
            serde_json::json!({"type": "status", "stage": "planning"}),
            serde_json::json!({"type": "chunk", "content": "Looking"}),
            serde_json::json!({"type": "tool_call", "id": "t1", "name": "execute_query", "args": {"query": "SELECT 1"}}),
            serde_json::json!({"type": "tool_response", "id": "t1", "success": true, "response": "1 row", "data": [{"x": 1}]}),
            serde_json::json!({"type": "done", "message": "Here it is", "sql": "SELECT region, SUM(amount) FROM sales GROUP BY region", "thinking": "group by region"}),
        ];
        let mut events = Vec::new();
        for f in frames {
            events.extend(round.on_item(f.to_string()).unwrap());
        }
        assert!(round.is_finished());
        events.extend(round.finish());

        assert_eq!(events.len(), 4);
        assert!(matches!(events[1], ProviderEvent::ToolCallRequested(ref c) if c.id == "t1"));
        match &events[2] {
            ProviderEvent::ToolResultAccepted(r) => {
                assert!(r.success);
                assert_eq!(r.data.as_ref().unwrap().len(), 1);
            }
            other => panic!("unexpected {other:?}"),
        }
        match &events[3] {
            ProviderEvent::Done(c) => {
                assert_eq!(c.final_text, "Here it is");
                assert_eq!(c.thinking.as_deref(), Some("group by region"));
                assert!(c.sql.as_deref().unwrap().starts_with("SELECT region"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_round_error_frame_with_unknown_kind() {
        let mut round = RemoteRound::default();
        let events = round
            .on_item(r#"{"type":"error","kind":"rate_limited","message":"slow down"}"#.to_string())
            .unwrap();
        assert_eq!(
            events,
            vec![ProviderEvent::Error {
                kind: ErrorKind::Provider,
                message: "slow down".into()
            }]
        );
        assert!(round.finish().is_empty());
    }

    #[test]
    fn test_round_rejects_non_json() {
        let mut round = RemoteRound::default();
        assert!(round.on_item("garbage".into()).is_err());
    }

    #[tokio::test]
    async fn test_send_refreshes_once_on_401() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/agent"))
            .and(header("authorization", "Bearer stale"))
            .respond_with(ResponseTemplate::new(401).set_body_string("expired"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"access_token": "fresh"})))
            .expect(1)
            .mount(&server)
            .await;
        let body = ndjson(&[
            serde_json::json!({"type": "chunk", "content": "ok"}),
            serde_json::json!({"type": "done", "message": "ok"}),
        ]);
        Mock::given(method("POST"))
            .and(path("/agent"))
            .and(header("authorization", "Bearer fresh"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/x-ndjson"))
            .expect(1)
            .mount(&server)
            .await;

        let a = adapter(&server, true);
        let mut s = scope("stale");
        let events: Vec<_> = a.send(&request(), &mut s).await.unwrap().collect().await;
        assert!(s.has_refreshed());
        assert!(matches!(events.last(), Some(ProviderEvent::Done(_))));
    }

    #[tokio::test]
    async fn test_send_second_401_is_terminal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/agent"))
            .respond_with(ResponseTemplate::new(401))
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"access_token": "fresh"})))
            .expect(1)
            .mount(&server)
            .await;

        let a = adapter(&server, true);
        let mut s = scope("stale");
        let err = match a.send(&request(), &mut s).await {
            Err(e) => e,
            Ok(_) => panic!("expected auth failure"),
        };
        assert!(matches!(err, InferenceError::AuthFailed { .. }));
    }

    #[tokio::test]
    async fn test_send_without_bearer_is_rejected() {
        let server = MockServer::start().await;
        let a = adapter(&server, false);
        let mut s = CredentialScope::new(Credentials::ApiKey("k".into()));
        assert!(a.send(&request(), &mut s).await.is_err());
    }
}
