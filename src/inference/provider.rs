//! Provider adapter seam.
//!
//! `ModelProvider` is the capability every upstream implements:
//! `send(request, credentials) → stream of ProviderEvent`. `ProviderAdapter`
//! is the closed set of concrete upstreams built from configuration; the
//! tool-calling loop only ever sees the trait, so tests drive it with
//! scripted providers.

use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};

use super::anthropic::AnthropicAdapter;
use super::client::ProviderHttp;
use super::errors::InferenceError;
use super::openai::OpenAiAdapter;
use super::refresh::TokenRefresher;
use super::remote_agent::RemoteAgentAdapter;
use super::simple::SimpleAdapter;
use super::types::{CredentialScope, Credentials, ProviderEvent, ProviderRequest};
use crate::config::{IdentityConfig, ProviderConfig, ProviderKind};

/// Boxed stream of canonical events for one model round.
pub type EventStream = Pin<Box<dyn Stream<Item = ProviderEvent> + Send>>;

// ─── ModelProvider ───────────────────────────────────────────────────────────

#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Configured provider name (for logs and routing output).
    fn name(&self) -> &str;

    /// Whether tool declarations are sent to this upstream.
    fn supports_tools(&self) -> bool;

    /// Open one model round.
    ///
    /// Failures before the first byte (HTTP status, auth) come back as `Err`;
    /// failures mid-stream arrive as a terminal `ProviderEvent::Error`.
    /// `scope` is mutable so the remote agent can swap in refreshed tokens.
    async fn send(
        &self,
        request: &ProviderRequest,
        scope: &mut CredentialScope,
    ) -> Result<EventStream, InferenceError>;
}

// ─── ProviderAdapter ─────────────────────────────────────────────────────────

/// Direct API dialects that support tool calling.
#[derive(Debug)]
pub enum ToolDialect {
    OpenAi(OpenAiAdapter),
    Anthropic(AnthropicAdapter),
}

/// The concrete upstream selected for a request.
#[derive(Debug)]
pub enum ProviderAdapter {
    DirectSimple(SimpleAdapter),
    DirectTools(ToolDialect),
    RemoteAgent(RemoteAgentAdapter),
}

impl ProviderAdapter {
    pub fn kind(&self) -> ProviderKind {
        match self {
            ProviderAdapter::DirectSimple(_) => ProviderKind::DirectSimple,
            ProviderAdapter::DirectTools(ToolDialect::OpenAi(_)) => ProviderKind::OpenAi,
            ProviderAdapter::DirectTools(ToolDialect::Anthropic(_)) => ProviderKind::Anthropic,
            ProviderAdapter::RemoteAgent(_) => ProviderKind::RemoteAgent,
        }
    }

    fn inner(&self) -> &dyn ModelProvider {
        match self {
            ProviderAdapter::DirectSimple(a) => a,
            ProviderAdapter::DirectTools(ToolDialect::OpenAi(a)) => a,
            ProviderAdapter::DirectTools(ToolDialect::Anthropic(a)) => a,
            ProviderAdapter::RemoteAgent(a) => a,
        }
    }
}

#[async_trait]
impl ModelProvider for ProviderAdapter {
    fn name(&self) -> &str {
        self.inner().name()
    }

    fn supports_tools(&self) -> bool {
        self.inner().supports_tools()
    }

    async fn send(
        &self,
        request: &ProviderRequest,
        scope: &mut CredentialScope,
    ) -> Result<EventStream, InferenceError> {
        self.inner().send(request, scope).await
    }
}

/// Build the adapter for a configured provider.
pub fn build_adapter(
    name: &str,
    config: &ProviderConfig,
    identity: &IdentityConfig,
) -> Result<ProviderAdapter, InferenceError> {
    let http = ProviderHttp::new(
        &config.base_url,
        Some(Duration::from_secs(config.request_timeout_secs)),
    )?;

    let adapter = match config.kind {
        ProviderKind::DirectSimple => {
            ProviderAdapter::DirectSimple(SimpleAdapter::new(name, config.clone(), http))
        }
        ProviderKind::OpenAi => ProviderAdapter::DirectTools(ToolDialect::OpenAi(
            OpenAiAdapter::new(name, config.clone(), http),
        )),
        ProviderKind::Anthropic => ProviderAdapter::DirectTools(ToolDialect::Anthropic(
            AnthropicAdapter::new(name, config.clone(), http),
        )),
        ProviderKind::RemoteAgent => {
            let refresher = match identity.refresh_url.as_deref() {
                Some(url) if !url.trim().is_empty() => {
                    Some(TokenRefresher::new(ProviderHttp::new(url, None)?))
                }
                _ => None,
            };
            ProviderAdapter::RemoteAgent(RemoteAgentAdapter::new(
                name,
                config.clone(),
                http,
                refresher,
            ))
        }
    };

    tracing::debug!(provider = %name, kind = ?config.kind, base_url = %config.base_url, "built provider adapter");
    Ok(adapter)
}

// ─── Credential Checks ───────────────────────────────────────────────────────

/// Resolve the credentials a provider kind will use for this request.
///
/// Request credentials win; a configured API key is the fallback for direct
/// providers. Missing credentials are an auth error raised before any
/// upstream call.
pub fn effective_credentials(
    config: &ProviderConfig,
    provider: &str,
    requested: Credentials,
) -> Result<Credentials, InferenceError> {
    let fallback = || config.configured_api_key().map(|k| Credentials::ApiKey(k.to_string()));

    let resolved = match (config.kind, requested) {
        (ProviderKind::RemoteAgent, creds @ Credentials::Bearer { .. }) => Some(creds),
        (ProviderKind::RemoteAgent, _) => None,
        (ProviderKind::DirectSimple, creds @ Credentials::AccessKeys { .. }) => Some(creds),
        (_, creds @ Credentials::ApiKey(_)) => Some(creds),
        (_, Credentials::None) => fallback(),
        // Bearer tokens double as API keys for OpenAI-compatible gateways.
        (ProviderKind::OpenAi, Credentials::Bearer { access_token, .. }) => {
            Some(Credentials::ApiKey(access_token))
        }
        (_, _) => fallback(),
    };

    resolved.ok_or_else(|| InferenceError::AuthFailed {
        reason: format!("missing credentials for provider '{provider}'"),
    })
}

// ─── Round Driver ────────────────────────────────────────────────────────────

/// Per-adapter decoder that turns upstream items into canonical events.
pub(crate) trait RoundDecoder<T>: Send + 'static {
    /// Handle one upstream item.
    fn on_item(&mut self, item: T) -> Result<Vec<ProviderEvent>, InferenceError>;

    /// Whether the upstream signalled the end of the round.
    fn is_finished(&self) -> bool;

    /// Whether the protocol has an explicit end-of-round marker. EOF before
    /// that marker is a truncated, malformed response.
    fn requires_terminator(&self) -> bool {
        false
    }

    /// Events to emit once the round has ended (tool calls, `Done`).
    fn finish(&mut self) -> Vec<ProviderEvent>;
}

/// Drive a decoder over an upstream item stream.
///
/// Any error, whether from the transport or the decoder, yields one terminal
/// `Error` event and ends the stream; `finish()` is not called in that case.
/// The same applies to EOF before the terminator of a protocol that has one.
pub(crate) fn drive_round<S, T, D>(items: S, decoder: D) -> EventStream
where
    S: Stream<Item = Result<T, InferenceError>> + Send + Unpin + 'static,
    T: Send + 'static,
    D: RoundDecoder<T>,
{
    let stream = stream::unfold(
        (items, decoder, VecDeque::<ProviderEvent>::new(), false),
        |(mut items, mut decoder, mut pending, mut ended)| async move {
            loop {
                if let Some(event) = pending.pop_front() {
                    return Some((event, (items, decoder, pending, ended)));
                }
                if ended {
                    return None;
                }

                match items.next().await {
                    Some(Ok(item)) => match decoder.on_item(item) {
                        Ok(events) => {
                            pending.extend(events);
                            if decoder.is_finished() {
                                pending.extend(decoder.finish());
                                ended = true;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "provider stream decode failed");
                            pending.push_back(ProviderEvent::from_error(&e));
                            ended = true;
                        }
                    },
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "provider stream failed");
                        pending.push_back(ProviderEvent::from_error(&e));
                        ended = true;
                    }
                    None if decoder.requires_terminator() => {
                        let e = InferenceError::MalformedResponse {
                            reason: "stream ended before the end-of-round marker".to_string(),
                        };
                        tracing::warn!(error = %e, "provider stream truncated");
                        pending.push_back(ProviderEvent::from_error(&e));
                        ended = true;
                    }
                    None => {
                        pending.extend(decoder.finish());
                        ended = true;
                    }
                }
            }
        },
    );
    Box::pin(stream)
}

// ─── Tool Call Helpers ───────────────────────────────────────────────────────

/// Parse accumulated tool-call argument text.
///
/// Empty input is an empty object. Text that isn't JSON is passed through as
/// a string so validation rejects it and the model sees the error.
pub(crate) fn parse_arguments(raw: &str) -> serde_json::Value {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return serde_json::json!({});
    }
    serde_json::from_str(trimmed).unwrap_or_else(|e| {
        tracing::warn!(error = %e, raw_len = trimmed.len(), "tool call arguments are not valid JSON");
        serde_json::Value::String(trimmed.to_string())
    })
}

/// Id for a tool call the upstream left unnamed.
pub(crate) fn fresh_call_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().simple())
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::types::{Completion, ErrorKind};

    fn provider_config(kind: ProviderKind, api_key: Option<&str>) -> ProviderConfig {
        ProviderConfig {
            kind,
            base_url: "http://localhost:1".into(),
            simple_model: "s".into(),
            complex_model: "c".into(),
            api_key: api_key.map(String::from),
            max_tokens: 256,
            temperature: 0.2,
            thinking_budget_tokens: 1024,
            request_timeout_secs: 5,
        }
    }

    #[test]
    fn test_missing_credentials_is_auth_error() {
        let config = provider_config(ProviderKind::Anthropic, None);
        let err = effective_credentials(&config, "anthropic", Credentials::None).unwrap_err();
        assert!(err.is_auth_error());
        assert!(err.to_string().contains("anthropic"));
    }

    #[test]
    fn test_configured_key_is_fallback() {
        let config = provider_config(ProviderKind::OpenAi, Some("sk-conf"));
        let creds = effective_credentials(&config, "openai", Credentials::None).unwrap();
        assert_eq!(creds, Credentials::ApiKey("sk-conf".into()));

        let creds =
            effective_credentials(&config, "openai", Credentials::ApiKey("sk-req".into())).unwrap();
        assert_eq!(creds, Credentials::ApiKey("sk-req".into()));
    }

    #[test]
    fn test_remote_agent_requires_bearer() {
        let config = provider_config(ProviderKind::RemoteAgent, Some("ignored"));
        assert!(effective_credentials(&config, "agent", Credentials::ApiKey("k".into())).is_err());
        let bearer = Credentials::Bearer {
            access_token: "a".into(),
            refresh_token: None,
        };
        assert_eq!(
            effective_credentials(&config, "agent", bearer.clone()).unwrap(),
            bearer
        );
    }

    #[test]
    fn test_simple_accepts_access_keys() {
        let config = provider_config(ProviderKind::DirectSimple, None);
        let keys = Credentials::AccessKeys {
            access_key_id: "id".into(),
            secret_access_key: "secret".into(),
            region: Some("us-east-1".into()),
        };
        assert_eq!(
            effective_credentials(&config, "simple", keys.clone()).unwrap(),
            keys
        );
    }

    #[test]
    fn test_build_adapter_kinds() {
        let identity = IdentityConfig::default();
        for kind in [
            ProviderKind::DirectSimple,
            ProviderKind::OpenAi,
            ProviderKind::Anthropic,
            ProviderKind::RemoteAgent,
        ] {
            let adapter = build_adapter("p", &provider_config(kind, None), &identity).unwrap();
            assert_eq!(adapter.kind(), kind);
            assert_eq!(adapter.name(), "p");
            assert_eq!(adapter.supports_tools(), kind != ProviderKind::DirectSimple);
        }
    }

    struct Echo {
        finished: bool,
        text: String,
        terminated: bool,
    }

    impl RoundDecoder<&'static str> for Echo {
        fn on_item(&mut self, item: &'static str) -> Result<Vec<ProviderEvent>, InferenceError> {
            if item == "STOP" {
                self.finished = true;
                return Ok(vec![]);
            }
            if item == "BAD" {
                return Err(InferenceError::MalformedResponse {
                    reason: "bad item".into(),
                });
            }
            self.text.push_str(item);
            Ok(vec![ProviderEvent::TextDelta(item.to_string())])
        }

        fn is_finished(&self) -> bool {
            self.finished
        }

        fn requires_terminator(&self) -> bool {
            self.terminated
        }

        fn finish(&mut self) -> Vec<ProviderEvent> {
            vec![ProviderEvent::Done(Completion {
                final_text: self.text.clone(),
                ..Default::default()
            })]
        }
    }

    fn echo() -> Echo {
        Echo {
            finished: false,
            text: String::new(),
            terminated: false,
        }
    }

    #[tokio::test]
    async fn test_drive_round_stops_at_finish_marker() {
        let items = stream::iter(vec![Ok("a"), Ok("b"), Ok("STOP"), Ok("ignored")]);
        let events: Vec<_> = drive_round(items, echo()).collect().await;
        assert_eq!(events.len(), 3);
        assert_eq!(
            events[2],
            ProviderEvent::Done(Completion {
                final_text: "ab".into(),
                ..Default::default()
            })
        );
    }

    #[tokio::test]
    async fn test_drive_round_decode_error_is_terminal() {
        let items = stream::iter(vec![Ok("a"), Ok("BAD"), Ok("c")]);
        let events: Vec<_> = drive_round(items, echo()).collect().await;
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[1],
            ProviderEvent::Error {
                kind: ErrorKind::Provider,
                message: "malformed response".into()
            }
        );
    }

    #[test]
    fn test_parse_arguments() {
        assert_eq!(parse_arguments(""), serde_json::json!({}));
        assert_eq!(
            parse_arguments(r#"{"table_name":"users"}"#)["table_name"],
            "users"
        );
        assert!(parse_arguments("{broken").is_string());
        assert!(fresh_call_id().starts_with("call_"));
    }

    #[tokio::test]
    async fn test_drive_round_finishes_on_eof() {
        let items = stream::iter(vec![Ok::<_, InferenceError>("x")]);
        let events: Vec<_> = drive_round(items, echo()).collect().await;
        assert!(matches!(events.last(), Some(ProviderEvent::Done(_))));
    }

    #[tokio::test]
    async fn test_drive_round_eof_before_terminator_is_malformed() {
        let items = stream::iter(vec![Ok::<_, InferenceError>("x")]);
        let decoder = Echo {
            terminated: true,
            ..echo()
        };
        let events: Vec<_> = drive_round(items, decoder).collect().await;
        assert_eq!(
            events,
            vec![
                ProviderEvent::TextDelta("x".into()),
                ProviderEvent::Error {
                    kind: ErrorKind::Provider,
                    message: "malformed response".into()
                }
            ]
        );
    }
}
