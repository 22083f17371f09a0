//! Shared HTTP plumbing for provider adapters.
//!
//! Every adapter posts JSON to one upstream endpoint and either reads the body
//! whole or streams it. This module owns the two `reqwest` clients (short and
//! long timeouts), status checking, and the transport error mapping.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Client as HttpClient;

use super::errors::InferenceError;

// ─── Constants ───────────────────────────────────────────────────────────────

/// TCP connection timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Total request timeout for non-streaming calls when the provider sets none.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Total request timeout for streaming calls.
///
/// Complex-tier models with reasoning enabled can spend a long time before
/// the first token. The multiplexer's idle timeout is the tighter bound.
const STREAM_REQUEST_TIMEOUT: Duration = Duration::from_secs(180);

// ─── ProviderHttp ────────────────────────────────────────────────────────────

/// HTTP transport bound to one provider base URL.
#[derive(Debug, Clone)]
pub struct ProviderHttp {
    /// Client for whole-body requests.
    http: HttpClient,
    /// Client for streaming requests.
    http_stream: HttpClient,
    base_url: String,
    request_timeout: Duration,
}

impl ProviderHttp {
    pub fn new(base_url: &str, request_timeout: Option<Duration>) -> Result<Self, InferenceError> {
        let request_timeout = request_timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT);

        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(request_timeout)
            .build()
            .map_err(|e| InferenceError::ConnectionFailed {
                endpoint: base_url.to_string(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        let http_stream = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(STREAM_REQUEST_TIMEOUT.max(request_timeout))
            .build()
            .map_err(|e| InferenceError::ConnectionFailed {
                endpoint: base_url.to_string(),
                reason: format!("failed to build streaming HTTP client: {e}"),
            })?;

        Ok(Self {
            http,
            http_stream,
            base_url: base_url.trim_end_matches('/').to_string(),
            request_timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Absolute URL for a path under the base URL.
    pub fn url(&self, path: &str) -> String {
        if path.is_empty() {
            return self.base_url.clone();
        }
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// POST a JSON body and return the response if the status is 2xx.
    ///
    /// `streaming` selects the long-timeout client. Non-2xx responses become
    /// `HttpError { status, body }` so the caller can classify 401s.
    pub async fn post_json(
        &self,
        path: &str,
        headers: HeaderMap,
        body: &serde_json::Value,
        streaming: bool,
    ) -> Result<reqwest::Response, InferenceError> {
        let url = self.url(path);
        let client = if streaming { &self.http_stream } else { &self.http };

        let response = client
            .post(&url)
            .headers(headers)
            .json(body)
            .send()
            .await
            .map_err(|e| self.map_send_error(&url, e))?;

        check_status(response).await
    }

    /// POST a JSON body and decode a JSON response.
    pub async fn post_json_value(
        &self,
        path: &str,
        headers: HeaderMap,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, InferenceError> {
        let response = self.post_json(path, headers, body, false).await?;
        let text = response.text().await.map_err(|e| InferenceError::StreamError {
            reason: format!("failed to read response body: {e}"),
        })?;
        serde_json::from_str(&text).map_err(|e| InferenceError::MalformedResponse {
            reason: format!("response is not JSON: {e}"),
        })
    }

    fn map_send_error(&self, url: &str, e: reqwest::Error) -> InferenceError {
        if e.is_timeout() {
            InferenceError::Timeout {
                duration_secs: self.request_timeout.as_secs(),
            }
        } else {
            InferenceError::ConnectionFailed {
                endpoint: url.to_string(),
                reason: e.to_string(),
            }
        }
    }
}

/// Turn a non-2xx response into `HttpError`, keeping the body for diagnostics.
pub async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, InferenceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(InferenceError::HttpError {
        status: status.as_u16(),
        body,
    })
}

// ─── Headers ─────────────────────────────────────────────────────────────────

/// Build a header map from static names and owned values.
///
/// Header values come from caller credentials; a value that isn't valid
/// header text is an auth problem, not a transport one.
pub fn headers<I>(pairs: I) -> Result<HeaderMap, InferenceError>
where
    I: IntoIterator<Item = (&'static str, String)>,
{
    let mut map = HeaderMap::new();
    for (name, value) in pairs {
        let value = HeaderValue::from_str(&value).map_err(|_| InferenceError::AuthFailed {
            reason: format!("credential for header '{name}' contains invalid characters"),
        })?;
        map.insert(HeaderName::from_static(name), value);
    }
    Ok(map)
}

/// `Authorization: Bearer <token>` header pair.
pub fn bearer(token: &str) -> (&'static str, String) {
    ("authorization", format!("Bearer {token}"))
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_url_joins_without_double_slash() {
        let http = ProviderHttp::new("http://localhost:1234/v1/", None).unwrap();
        assert_eq!(http.base_url(), "http://localhost:1234/v1");
        assert_eq!(http.url("/chat/completions"), "http://localhost:1234/v1/chat/completions");
        assert_eq!(http.url("messages"), "http://localhost:1234/v1/messages");
        assert_eq!(http.url(""), "http://localhost:1234/v1");
    }

    #[test]
    fn test_headers_rejects_invalid_value() {
        let err = headers([("x-api-key", "bad\nvalue".to_string())]).unwrap_err();
        assert!(matches!(err, InferenceError::AuthFailed { .. }));
    }

    #[tokio::test]
    async fn test_post_json_value_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/echo"))
            .and(header("authorization", "Bearer t0k"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let http = ProviderHttp::new(&format!("{}/v1", server.uri()), None).unwrap();
        let value = http
            .post_json_value("echo", headers([bearer("t0k")]).unwrap(), &serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(value["ok"], true);
    }

    #[tokio::test]
    async fn test_non_2xx_becomes_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("token expired"))
            .mount(&server)
            .await;

        let http = ProviderHttp::new(&server.uri(), None).unwrap();
        let err = http
            .post_json("x", HeaderMap::new(), &serde_json::json!({}), true)
            .await
            .unwrap_err();
        assert!(err.is_auth_failure());
        assert_eq!(err.error_body(), Some("token expired"));
    }

    #[tokio::test]
    async fn test_non_json_body_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let http = ProviderHttp::new(&server.uri(), None).unwrap();
        let err = http
            .post_json_value("x", HeaderMap::new(), &serde_json::json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.upstream_message(), "malformed response");
    }
}
