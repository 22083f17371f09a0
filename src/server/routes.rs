//! Route handlers.
//!
//! Errors map onto status codes by kind: validation 400, auth 401,
//! provider 502, timeout 504, anything else 500.

use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::AppState;
use crate::agent_core::{AgentError, QueryRequest, QueryResponse};
use crate::inference::types::ErrorKind;
use crate::stream::{self, FrameEncoder};

const NDJSON: &str = "application/x-ndjson";

pub(crate) fn status_for(error: &AgentError) -> StatusCode {
    if matches!(error, AgentError::SessionNotFound { .. }) {
        return StatusCode::NOT_FOUND;
    }
    match error.kind() {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::Auth => StatusCode::UNAUTHORIZED,
        ErrorKind::Provider => StatusCode::BAD_GATEWAY,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::ToolExecution | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn failure(error: AgentError) -> Response {
    (status_for(&error), Json(QueryResponse::failure(&error))).into_response()
}

fn parse_body(body: Result<Json<QueryRequest>, JsonRejection>) -> Result<QueryRequest, AgentError> {
    body.map(|Json(req)| req)
        .map_err(|e| AgentError::validation(format!("invalid request body: {}", e.body_text())))
}

// ─── Handlers ───────────────────────────────────────────────────────────────

pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "providers": state.orchestrator.provider_names(),
        "memory": state.orchestrator.memory().is_some(),
    }))
}

pub async fn tools(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "tools": state.orchestrator.catalog().specs() }))
}

pub async fn query(
    State(state): State<AppState>,
    body: Result<Json<QueryRequest>, JsonRejection>,
) -> Response {
    let req = match parse_body(body) {
        Ok(req) => req,
        Err(e) => return failure(e),
    };

    // Dropped with the handler future when the client goes away.
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let run = state.orchestrator.execute(req, cancel.clone());
    let result = match tokio::time::timeout(state.stream.overall_timeout, run).await {
        Ok(result) => result,
        Err(_) => {
            cancel.cancel();
            tracing::warn!("query exceeded the overall time limit");
            Err(AgentError::Cancelled)
        }
    };

    match result {
        Ok(answer) => Json(answer.into_response()).into_response(),
        Err(e) => {
            tracing::warn!(error = %e, kind = e.kind().as_str(), "query failed");
            failure(e)
        }
    }
}

/// NDJSON stream. Request errors are reported in-band as a terminal
/// `error` frame so clients only have one code path.
pub async fn query_stream(
    State(state): State<AppState>,
    body: Result<Json<QueryRequest>, JsonRejection>,
) -> Response {
    let req = match parse_body(body) {
        Ok(req) => req,
        Err(e) => return failure(e),
    };

    let events = stream::start(state.orchestrator.clone(), req, state.stream);
    let encoder = FrameEncoder;
    let bytes = events.map(move |event| encoder.encode(&event));

    (
        [
            (header::CONTENT_TYPE, NDJSON),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(bytes),
    )
        .into_response()
}

pub async fn delete_session(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Some(memory) = state.orchestrator.memory() else {
        return failure(AgentError::SessionNotFound { session_id: id });
    };
    match memory.delete_session(&id) {
        Ok(true) => {
            tracing::info!(session_id = %id, "session deleted");
            StatusCode::NO_CONTENT.into_response()
        }
        Ok(false) => failure(AgentError::SessionNotFound { session_id: id }),
        Err(e) => failure(e),
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_core::memory::MemoryStore;
    use crate::agent_core::orchestrator::tests::scripted_orchestrator;
    use crate::agent_core::tool_loop::tests::{done, query_call, ScriptedProvider};
    use crate::config::MemoryConfig;
    use crate::inference::types::ProviderEvent;
    use crate::server::build_router;
    use crate::stream::{decode_frame, StreamEvent};
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app(rounds: Vec<Vec<ProviderEvent>>) -> (axum::Router, Arc<MemoryStore>) {
        let memory =
            Arc::new(MemoryStore::open(":memory:", &MemoryConfig::default()).unwrap());
        let provider = Arc::new(ScriptedProvider::new(rounds));
        let orchestrator = Arc::new(scripted_orchestrator(provider, Some(memory.clone())));
        (build_router(AppState::new(orchestrator)), memory)
    }

    fn post(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _) = app(vec![vec![done("x")]]);
        let response = app
            .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["memory"], true);
    }

    #[tokio::test]
    async fn test_tools_lists_catalog() {
        let (app, _) = app(vec![vec![done("x")]]);
        let response = app
            .oneshot(Request::get("/api/ai/tools").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = json_body(response).await;
        let names: Vec<&str> = json["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert!(names.contains(&"execute_query"));
        assert!(names.contains(&"get_schema"));
    }

    #[tokio::test]
    async fn test_query_envelope() {
        let (app, _) = app(vec![vec![done(
            "All users:\n```sql\nSELECT * FROM users\n```",
        )]]);
        let response = app
            .oneshot(post("/api/ai/query", json!({"query": "list users"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["sql"], "SELECT * FROM users");
        assert_eq!(json["routing"]["selectedAgent"], "simple");
        assert!(json["sessionId"].is_string());
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let (app, _) = app(vec![vec![ProviderEvent::Error {
            kind: ErrorKind::Provider,
            message: "upstream 500".into(),
        }]]);

        let response = app
            .clone()
            .oneshot(post("/api/ai/query", json!({"query": ""})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["success"], false);

        let response = app
            .clone()
            .oneshot(post("/api/ai/query", json!({"query": "q", "temperature": 3.0})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(post("/api/ai/query", json!({"query": "q"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(json_body(response).await["error"], "upstream 500");
    }

    #[test]
    fn test_status_for_auth_and_timeout() {
        let auth = AgentError::AuthError {
            reason: "missing".into(),
        };
        assert_eq!(status_for(&auth), StatusCode::UNAUTHORIZED);
        assert_eq!(status_for(&AgentError::Cancelled), StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn test_malformed_body_is_bad_request() {
        let (app, _) = app(vec![vec![done("x")]]);
        let request = Request::builder()
            .method("POST")
            .uri("/api/ai/query")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_stream_is_ndjson() {
        let (app, _) = app(vec![
            vec![query_call("c1", "SELECT COUNT(*) FROM users"), done("")],
            vec![done("Three.")],
        ]);
        let response = app
            .oneshot(post("/api/ai/query/stream", json!({"query": "how many users"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE].to_str().unwrap(),
            NDJSON
        );

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        let events: Vec<StreamEvent> = text.lines().map(|l| decode_frame(l).unwrap()).collect();

        assert!(matches!(events[0], StreamEvent::Session { .. }));
        let call = events
            .iter()
            .position(|e| matches!(e, StreamEvent::ToolCall { .. }))
            .unwrap();
        let response = events
            .iter()
            .position(|e| matches!(e, StreamEvent::ToolResponse { .. }))
            .unwrap();
        assert!(call < response);
        assert!(matches!(events.last().unwrap(), StreamEvent::Done { .. }));
    }

    #[tokio::test]
    async fn test_delete_session() {
        let (app, memory) = app(vec![vec![done("x")]]);
        let id = memory
            .create_or_reuse_session(Some("s-1"), "warehouse", crate::agent_core::SessionMode::Collection)
            .unwrap();

        let delete = |id: &str| {
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/sessions/{id}"))
                .body(Body::empty())
                .unwrap()
        };
        let response = app.clone().oneshot(delete(&id)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app.oneshot(delete(&id)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
