//! Direct raw model invocation, no tools.
//!
//! One non-streaming POST per round. The body follows the common
//! `{model, system, messages, max_tokens, temperature}` shape accepted by
//! model-hosting gateways; the answer is read from `content[].text`,
//! `choices[0].message.content` or a bare `completion` field.
//!
//! Access-key credentials are forwarded as `x-access-key-id` /
//! `x-secret-access-key` / `x-region` headers for a signing gateway in front
//! of the model host.

use async_trait::async_trait;
use futures::stream;

use super::client::{bearer, headers, ProviderHttp};
use super::errors::InferenceError;
use super::provider::{effective_credentials, EventStream, ModelProvider};
use super::sql_extract;
use super::types::{ChatMessage, CredentialScope, Credentials, ProviderEvent, ProviderRequest, Role};
use crate::config::ProviderConfig;

#[derive(Debug)]
pub struct SimpleAdapter {
    name: String,
    config: ProviderConfig,
    http: ProviderHttp,
}

impl SimpleAdapter {
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
        serde_json::json!({
            "model": model,
            "system": request.system_prompt,
            "messages": wire_messages(&request.messages),
            "max_tokens": request.max_tokens.unwrap_or(self.config.max_tokens),
            "temperature": request.temperature.unwrap_or(self.config.temperature),
        })
    }
}

/// Plain role/content pairs. Tool traffic is folded into user text since
/// this upstream has no tool protocol.
fn wire_messages(messages: &[ChatMessage]) -> Vec<serde_json::Value> {
    messages
        .iter()
        .filter_map(|m| {
            let content = m.content.as_deref().unwrap_or("");
            match m.role {
                Role::System => None,
                Role::Tool => Some(serde_json::json!({
                    "role": "user",
                    "content": format!("Tool result: {content}"),
                })),
                Role::Assistant if content.is_empty() => None,
                role => Some(serde_json::json!({"role": role.as_str(), "content": content})),
            }
        })
        .collect()
}

/// Pull the answer text out of whichever response shape the host returned.
fn extract_text(body: &serde_json::Value) -> Option<String> {
    if let Some(blocks) = body.get("content").and_then(|c| c.as_array()) {
        let text: String = blocks
            .iter()
            .filter(|b| b.get("type").and_then(|t| t.as_str()).unwrap_or("text") == "text")
            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
            .collect();
        return Some(text);
    }
    if let Some(text) = body
        .pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
    {
        return Some(text.to_string());
    }
    body.get("completion")
        .or_else(|| body.get("content"))
        .and_then(|c| c.as_str())
        .map(String::from)
}

fn credential_headers(creds: &Credentials) -> Vec<(&'static str, String)> {
    match creds {
        Credentials::ApiKey(key) => vec![bearer(key)],
        Credentials::AccessKeys {
            access_key_id,
            secret_access_key,
            region,
        } => {
            let mut pairs = vec![
                ("x-access-key-id", access_key_id.clone()),
                ("x-secret-access-key", secret_access_key.clone()),
            ];
            if let Some(region) = region {
                pairs.push(("x-region", region.clone()));
            }
            pairs
        }
        Credentials::Bearer { access_token, .. } => vec![bearer(access_token)],
        Credentials::None => Vec::new(),
    }
}

#[async_trait]
impl ModelProvider for SimpleAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports_tools(&self) -> bool {
        false
    }

    async fn send(
        &self,
        request: &ProviderRequest,
        scope: &mut CredentialScope,
    ) -> Result<EventStream, InferenceError> {
        let creds = effective_credentials(&self.config, &self.name, scope.credentials.clone())?;
        let body = self.build_body(request);
        tracing::info!(
            provider = %self.name,
            model = %body["model"],
            message_count = request.messages.len(),
            "=== LLM REQUEST ==="
        );

        let response = self
            .http
            .post_json_value("", headers(credential_headers(&creds))?, &body)
            .await?;

        let text = extract_text(&response).ok_or_else(|| InferenceError::MalformedResponse {
            reason: "no answer text in response".to_string(),
        })?;
        let structured_sql = response
            .get("sql")
            .and_then(|s| s.as_str())
            .map(String::from);
        let completion = sql_extract::complete(&text, structured_sql, None);

        let mut events = Vec::with_capacity(2);
        if !completion.final_text.is_empty() {
            events.push(ProviderEvent::TextDelta(completion.final_text.clone()));
        }
        events.push(ProviderEvent::Done(completion));
        Ok(Box::pin(stream::iter(events)))
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
