//! HTTP API: starting operations, inspection, HTTP replay and maintenance.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::error;

use specstream_protocol::{ErrorCode, OperationSummary, StreamMessage};

use crate::broadcaster::BroadcasterStats;
use crate::handoff::HandoffError;
use crate::launcher::{LaunchError, StartRequest, StartedOperation};
use crate::persistence::LedgerRecord;
use crate::registry::{RegistryError, RegistryStats, SweepReport};
use crate::state::{AppState, ConnectionStatsSnapshot};
use crate::websocket::{error_code, ws_handler};

pub type SharedState = Arc<AppState>;

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    /// Evicted operations and pruned replay ranges
    Gone(ErrorCode, String),
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, ErrorCode::NotFound, msg),
            ApiError::Gone(code, msg) => (StatusCode::GONE, code, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, ErrorCode::InvalidRequest, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, ErrorCode::Internal, msg),
        };
        (status, Json(serde_json::json!({"error": message, "code": code}))).into_response()
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        let message = err.to_string();
        match err {
            RegistryError::NotFound(_) => ApiError::NotFound(message),
            RegistryError::Evicted(_) | RegistryError::RangeExpired { .. } => {
                ApiError::Gone(error_code(&err), message)
            }
            _ => ApiError::BadRequest(message),
        }
    }
}

impl From<LaunchError> for ApiError {
    fn from(err: LaunchError) -> Self {
        match err {
            LaunchError::InvalidRequest(msg) => ApiError::BadRequest(msg),
            LaunchError::Registry(e) => e.into(),
        }
    }
}

impl From<HandoffError> for ApiError {
    fn from(err: HandoffError) -> Self {
        error!(
            component = "api",
            event = "api.handoff_lookup_failed",
            error = %err,
            "Outcome ledger lookup failed"
        );
        ApiError::Internal(err.to_string())
    }
}

// ── Payloads ──────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct OperationDetail {
    #[serde(flatten)]
    pub summary: OperationSummary,
    /// What the persistence handoff recorded, once it has run
    pub persistence: Option<LedgerRecord>,
}

#[derive(Deserialize)]
pub struct MessagesQuery {
    pub after: Option<u64>,
}

#[derive(Serialize)]
pub struct StatsResponse {
    pub registry: RegistryStats,
    pub broadcaster: BroadcasterStats,
    pub connections: ConnectionStatsSnapshot,
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/operations", get(list_operations).post(start_operation))
        .route("/api/operations/{id}", get(get_operation))
        .route("/api/operations/{id}/messages", get(get_messages))
        .route("/api/stats", get(stats))
        .route("/api/cleanup", post(cleanup))
        .route("/ws/connect", get(ws_handler))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn start_operation(
    State(state): State<SharedState>,
    Json(request): Json<StartRequest>,
) -> Result<(StatusCode, Json<StartedOperation>), ApiError> {
    let started = state.launcher.start_operation(request).await?;
    Ok((StatusCode::ACCEPTED, Json(started)))
}

async fn list_operations(State(state): State<SharedState>) -> Json<Vec<OperationSummary>> {
    Json(state.registry.list().await)
}

async fn get_operation(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<OperationDetail>, ApiError> {
    let summary = state.registry.summary(&id).await?;
    let persistence = state.handoff.outcome(&id).await?;
    Ok(Json(OperationDetail {
        summary,
        persistence,
    }))
}

async fn get_messages(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<Vec<StreamMessage>>, ApiError> {
    Ok(Json(state.registry.snapshot(&id, query.after).await?))
}

async fn stats(State(state): State<SharedState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        registry: state.registry.stats().await,
        broadcaster: state.broadcaster().stats(),
        connections: state.connections.snapshot(),
    })
}

async fn cleanup(State(state): State<SharedState>) -> Json<SweepReport> {
    Json(state.registry.sweep(Utc::now()).await)
}

async fn health_check() -> &'static str {
    "OK"
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::{json, Value};
    use specstream_protocol::{MessageType, OperationKind, OperationStatus};

    use super::*;
    use crate::registry::{RetentionConfig, TypedLine};
    use crate::state::tests::test_state;

    async fn serve(state: SharedState) -> String {
        let app = api_router().with_state(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}")
    }

    async fn get_json(url: &str) -> (u16, Value) {
        let response = reqwest::get(url).await.expect("request");
        let status = response.status().as_u16();
        (status, response.json().await.expect("json body"))
    }

    #[tokio::test]
    async fn health_is_ok() {
        let (_dir, state, _store) = test_state(RetentionConfig::default(), &[]);
        let base = serve(state).await;
        let body = reqwest::get(format!("{base}/health"))
            .await
            .expect("request")
            .text()
            .await
            .expect("body");
        assert_eq!(body, "OK");
    }

    #[tokio::test]
    async fn start_runs_to_commit_and_reports_persistence() {
        let (_dir, state, store) = test_state(RetentionConfig::default(), &[]);
        let base = serve(state).await;

        let response = reqwest::Client::new()
            .post(format!("{base}/api/operations"))
            .json(&json!({
                "kind": "generate_spec",
                "repository": "acme/widgets",
                "branch": "feature/login",
                "feature_dir": "specs/001-login",
                "requirement": "Users can sign in"
            }))
            .send()
            .await
            .expect("start");
        assert_eq!(response.status().as_u16(), 202);
        let started: Value = response.json().await.expect("json");
        let id = started["operation_id"].as_str().expect("id").to_string();
        assert_eq!(
            started["stream_url"],
            format!("/ws/connect?operation_id={id}")
        );

        // The ledger row lands just before the registry flag flips
        let mut detail = Value::Null;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
        while tokio::time::Instant::now() < deadline {
            let (_, body) = get_json(&format!("{base}/api/operations/{id}")).await;
            if body["persistence"]["status"] == "committed" && body["artifact_committed"] == true {
                detail = body;
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert_eq!(detail["status"], "completed");
        assert_eq!(detail["artifact_committed"], true);
        assert_eq!(detail["persistence"]["path"], "specs/001-login/spec.md");
        assert_eq!(store.commit_count(), 1);

        let (status, messages) = get_json(&format!("{base}/api/operations/{id}/messages")).await;
        assert_eq!(status, 200);
        let messages = messages.as_array().expect("array");
        assert_eq!(messages[0]["type"], "system");
        assert_eq!(messages[messages.len() - 1]["type"], "complete");
    }

    #[tokio::test]
    async fn invalid_start_is_bad_request() {
        let (_dir, state, _store) = test_state(RetentionConfig::default(), &[]);
        let base = serve(state).await;
        let response = reqwest::Client::new()
            .post(format!("{base}/api/operations"))
            .json(&json!({
                "kind": "generate_plan",
                "repository": "widgets",
                "branch": "main",
                "feature_dir": "specs/002",
                "requirement": "x"
            }))
            .send()
            .await
            .expect("start");
        assert_eq!(response.status().as_u16(), 400);
        let body: Value = response.json().await.expect("json");
        assert_eq!(body["code"], "invalid_request");
    }

    #[tokio::test]
    async fn unknown_is_404_and_pruned_range_is_410() {
        let (_dir, state, _store) = test_state(
            RetentionConfig {
                max_log_messages: 2,
                ..RetentionConfig::default()
            },
            &[],
        );
        state
            .registry
            .create("op-1", OperationKind::GenerateSpec, None)
            .expect("create");
        state
            .registry
            .transition("op-1", OperationStatus::Running, None)
            .await
            .expect("running");
        for i in 0..5 {
            state
                .registry
                .append("op-1", TypedLine::agent(MessageType::Execution, format!("{i}")))
                .await
                .expect("append");
        }
        let base = serve(state).await;

        let (status, body) = get_json(&format!("{base}/api/operations/nope")).await;
        assert_eq!(status, 404);
        assert_eq!(body["code"], "not_found");

        let (status, body) = get_json(&format!("{base}/api/operations/op-1/messages?after=0")).await;
        assert_eq!(status, 410);
        assert_eq!(body["code"], "range_expired");

        let (status, body) = get_json(&format!("{base}/api/operations/op-1/messages?after=2")).await;
        assert_eq!(status, 200);
        assert_eq!(body.as_array().expect("array").len(), 2);
    }

    #[tokio::test]
    async fn cleanup_and_stats_report_registry_state() {
        let (_dir, state, _store) = test_state(
            RetentionConfig {
                retention: Duration::ZERO,
                ..RetentionConfig::default()
            },
            &[],
        );
        state
            .registry
            .create("op-1", OperationKind::GenerateTasks, None)
            .expect("create");
        state
            .registry
            .abort("op-1", "test")
            .await
            .expect("abort");
        let base = serve(state).await;

        let (_, stats) = get_json(&format!("{base}/api/stats")).await;
        assert_eq!(stats["registry"]["failed"], 1);
        assert_eq!(stats["connections"]["open"], 0);

        let report: Value = reqwest::Client::new()
            .post(format!("{base}/api/cleanup"))
            .send()
            .await
            .expect("cleanup")
            .json()
            .await
            .expect("json");
        assert_eq!(report["evicted"], json!(["op-1"]));

        let (status, body) = get_json(&format!("{base}/api/operations/op-1")).await;
        assert_eq!(status, 410);
        assert_eq!(body["code"], "not_found");
    }
}
