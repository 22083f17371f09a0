//! Single-retry bearer token refresh for the remote-agent provider.
//!
//! A 401 from the upstream triggers at most one refresh per logical request:
//! the `CredentialScope` records that the refresh window is spent, so a second
//! 401 (on the retry or on a later round) is a terminal auth failure.

use std::future::Future;

use serde::Deserialize;

use super::client::ProviderHttp;
use super::errors::InferenceError;
use super::types::{CredentialScope, Credentials};

/// Tokens returned by the identity refresh endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct RefreshedTokens {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// Client for the identity provider's refresh endpoint.
#[derive(Debug, Clone)]
pub struct TokenRefresher {
    http: ProviderHttp,
}

impl TokenRefresher {
    pub fn new(http: ProviderHttp) -> Self {
        Self { http }
    }

    /// Exchange a refresh token for a new access token.
    pub async fn refresh(&self, refresh_token: &str) -> Result<RefreshedTokens, InferenceError> {
        let body = serde_json::json!({ "refresh_token": refresh_token });
        let value = self
            .http
            .post_json_value("", reqwest::header::HeaderMap::new(), &body)
            .await?;
        let tokens: RefreshedTokens =
            serde_json::from_value(value).map_err(|e| InferenceError::MalformedResponse {
                reason: format!("refresh response missing access_token: {e}"),
            })?;
        if tokens.access_token.is_empty() {
            return Err(InferenceError::MalformedResponse {
                reason: "refresh response has an empty access_token".to_string(),
            });
        }
        Ok(tokens)
    }
}

/// Run `call` with the scope's credentials, refreshing once on a 401.
///
/// - Non-401 outcomes pass through untouched.
/// - A 401 with a refresh token and an unspent scope triggers one refresh and
///   exactly one retry with the new credentials.
/// - A failed refresh, a missing refresh token, or a 401 after the refresh
///   window is spent all end in `AuthFailed`.
pub async fn call_with_refresh<T, F, Fut>(
    refresher: Option<&TokenRefresher>,
    scope: &mut CredentialScope,
    mut call: F,
) -> Result<T, InferenceError>
where
    F: FnMut(Credentials) -> Fut,
    Fut: Future<Output = Result<T, InferenceError>>,
{
    let first_err = match call(scope.credentials.clone()).await {
        Err(e) if e.is_auth_failure() => e,
        other => return other,
    };

    if scope.has_refreshed() {
        tracing::warn!("upstream rejected refreshed credentials");
        return Err(InferenceError::AuthFailed {
            reason: format!(
                "credentials rejected after refresh: {}",
                first_err.upstream_message()
            ),
        });
    }

    let refresh_token = scope.credentials.refresh_token().map(String::from);
    let (Some(refresher), Some(refresh_token)) = (refresher, refresh_token) else {
        return Err(InferenceError::AuthFailed {
            reason: first_err.upstream_message(),
        });
    };

    tracing::info!("access token rejected, attempting refresh");
    match refresher.refresh(&refresh_token).await {
        Ok(tokens) => {
            scope.apply_refresh(Credentials::Bearer {
                access_token: tokens.access_token,
                refresh_token: tokens.refresh_token,
            });
        }
        Err(e) => {
            scope.mark_refresh_spent();
            tracing::warn!(error = %e, "token refresh failed");
            return Err(InferenceError::AuthFailed {
                reason: format!("token refresh failed: {}", e.upstream_message()),
            });
        }
    }

    match call(scope.credentials.clone()).await {
        Err(e) if e.is_auth_failure() => {
            tracing::warn!("retry after refresh was rejected");
            Err(InferenceError::AuthFailed {
                reason: format!("credentials rejected after refresh: {}", e.upstream_message()),
            })
        }
        other => other,
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use wiremock::matchers::{body_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn unauthorized() -> InferenceError {
        InferenceError::HttpError {
            status: 401,
            body: r#"{"message":"token expired"}"#.into(),
        }
    }

    fn bearer(access: &str, refresh: Option<&str>) -> CredentialScope {
        CredentialScope::new(Credentials::Bearer {
            access_token: access.into(),
            refresh_token: refresh.map(String::from),
        })
    }

    async fn refresher_returning(server: &MockServer, status: u16, expected_calls: u64) -> TokenRefresher {
        Mock::given(method("POST"))
            .and(body_json(serde_json::json!({"refresh_token": "r1"})))
            .respond_with(
                ResponseTemplate::new(status)
                    .set_body_json(serde_json::json!({"access_token": "fresh", "refresh_token": "r2"})),
            )
            .expect(expected_calls)
            .mount(server)
            .await;
        TokenRefresher::new(ProviderHttp::new(&server.uri(), None).unwrap())
    }

    #[tokio::test]
    async fn test_success_passes_through_without_refresh() {
        let server = MockServer::start().await;
        let refresher = refresher_returning(&server, 200, 0).await;
        let mut scope = bearer("a", Some("r1"));

        let out = call_with_refresh(Some(&refresher), &mut scope, |_| async { Ok::<_, InferenceError>(7) })
            .await
            .unwrap();
        assert_eq!(out, 7);
        assert!(!scope.has_refreshed());
    }

    #[tokio::test]
    async fn test_single_refresh_then_retry() {
        let server = MockServer::start().await;
        let refresher = refresher_returning(&server, 200, 1).await;
        let mut scope = bearer("stale", Some("r1"));
        let seen = Mutex::new(Vec::new());

        let out = call_with_refresh(Some(&refresher), &mut scope, |creds| {
            let token = match creds {
                Credentials::Bearer { access_token, .. } => access_token,
                _ => String::new(),
            };
            seen.lock().unwrap().push(token.clone());
            async move {
                if token == "fresh" {
                    Ok("answer")
                } else {
                    Err(unauthorized())
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(out, "answer");
        assert_eq!(*seen.lock().unwrap(), vec!["stale".to_string(), "fresh".to_string()]);
        assert!(scope.has_refreshed());
    }

    #[tokio::test]
    async fn test_second_401_is_terminal() {
        let server = MockServer::start().await;
        let refresher = refresher_returning(&server, 200, 1).await;
        let mut scope = bearer("stale", Some("r1"));
        let calls = AtomicUsize::new(0);

        let err = call_with_refresh(Some(&refresher), &mut scope, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(unauthorized()) }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, InferenceError::AuthFailed { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // Same logical request, later round: no second refresh.
        let err = call_with_refresh(Some(&refresher), &mut scope, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(unauthorized()) }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, InferenceError::AuthFailed { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_failed_refresh_is_auth_error() {
        let server = MockServer::start().await;
        let refresher = refresher_returning(&server, 400, 1).await;
        let mut scope = bearer("stale", Some("r1"));
        let calls = AtomicUsize::new(0);

        let err = call_with_refresh(Some(&refresher), &mut scope, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(unauthorized()) }
        })
        .await
        .unwrap_err();

        assert!(err.is_auth_error());
        assert!(err.to_string().contains("refresh failed"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(scope.has_refreshed());
    }

    #[tokio::test]
    async fn test_no_refresh_token_is_auth_error() {
        let mut scope = bearer("stale", None);
        let err = call_with_refresh(None, &mut scope, |_| async { Err::<(), _>(unauthorized()) })
            .await
            .unwrap_err();
        assert!(matches!(err, InferenceError::AuthFailed { ref reason } if reason == "token expired"));
    }

    #[tokio::test]
    async fn test_non_auth_errors_are_not_refreshed() {
        let server = MockServer::start().await;
        let refresher = refresher_returning(&server, 200, 0).await;
        let mut scope = bearer("a", Some("r1"));
        let err = call_with_refresh(Some(&refresher), &mut scope, |_| async {
            Err::<(), _>(InferenceError::HttpError {
                status: 503,
                body: String::new(),
            })
        })
        .await
        .unwrap_err();
        assert!(matches!(err, InferenceError::HttpError { status: 503, .. }));
    }
}
