//! Authentication collaborators.
//!
//! WebSocket connections authenticate with a `session_id` checked by a
//! `SessionValidator`. The HTTP API can additionally be protected by a
//! static bearer token (`--auth-token`); `/health` and the WebSocket
//! endpoint are never gated by it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::Response,
};
use serde::Serialize;
use thiserror::Error;

/// Who a validated session belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Principal {
    pub session_id: String,
    pub name: String,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("session rejected: {reason}")]
pub struct AuthRejected {
    pub reason: String,
}

impl AuthRejected {
    fn new(reason: &str) -> Self {
        Self {
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
pub trait SessionValidator: Send + Sync {
    async fn validate(&self, session_id: &str) -> Result<Principal, AuthRejected>;
}

/// Validates against a fixed session table.
///
/// Entries are `name:session` or a bare session id. An empty table means
/// open development mode: any non-empty session id is accepted.
#[derive(Debug, Clone, Default)]
pub struct StaticSessionValidator {
    sessions: HashMap<String, String>,
}

impl StaticSessionValidator {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let sessions = entries
            .into_iter()
            .filter_map(|entry| {
                let entry = entry.as_ref().trim();
                if entry.is_empty() {
                    return None;
                }
                Some(match entry.split_once(':') {
                    Some((name, session)) => (session.to_string(), name.to_string()),
                    None => (entry.to_string(), "user".to_string()),
                })
            })
            .collect();
        Self { sessions }
    }

    pub fn is_open(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[async_trait]
impl SessionValidator for StaticSessionValidator {
    async fn validate(&self, session_id: &str) -> Result<Principal, AuthRejected> {
        let session_id = session_id.trim();
        if session_id.is_empty() {
            return Err(AuthRejected::new("missing session id"));
        }
        if self.is_open() {
            return Ok(Principal {
                session_id: session_id.to_string(),
                name: "anonymous".to_string(),
            });
        }
        match self.sessions.get(session_id) {
            Some(name) => Ok(Principal {
                session_id: session_id.to_string(),
                name: name.clone(),
            }),
            None => Err(AuthRejected::new("unknown session")),
        }
    }
}

/// Axum middleware that checks `Authorization: Bearer <token>`.
/// Skips `/health` and the WebSocket endpoint.
pub async fn auth_middleware(
    State(expected_token): State<Arc<str>>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let path = req.uri().path();
    if path == "/health" || path.starts_with("/ws/") {
        return Ok(next.run(req).await);
    }

    let bearer = req
        .headers()
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    match bearer {
        Some(token) if token == &*expected_token => Ok(next.run(req).await),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}

#[cfg(test)]
mod tests {
    use axum::routing::get;
    use axum::Router;

    use super::*;

    #[tokio::test]
    async fn table_validator_accepts_known_sessions_only() {
        let validator = StaticSessionValidator::new(["alice:sess-a", "sess-b"]);
        assert_eq!(
            validator.validate("sess-a").await,
            Ok(Principal {
                session_id: "sess-a".into(),
                name: "alice".into()
            })
        );
        assert_eq!(
            validator.validate("sess-b").await.map(|p| p.name),
            Ok("user".to_string())
        );
        assert!(validator.validate("sess-z").await.is_err());
        assert!(validator.validate("").await.is_err());
    }

    #[tokio::test]
    async fn open_validator_accepts_any_non_empty_session() {
        let validator = StaticSessionValidator::new(Vec::<String>::new());
        assert!(validator.is_open());
        assert!(validator.validate("whatever").await.is_ok());
        assert_eq!(
            validator.validate("  ").await,
            Err(AuthRejected::new("missing session id"))
        );
    }

    #[tokio::test]
    async fn bearer_middleware_guards_api_routes() {
        let token: Arc<str> = Arc::from("s3cret");
        let app = Router::new()
            .route("/health", get(|| async { "OK" }))
            .route("/api/stats", get(|| async { "{}" }))
            .layer(axum::middleware::from_fn_with_state(token, auth_middleware));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let client = reqwest::Client::new();
        let health = client
            .get(format!("http://{addr}/health"))
            .send()
            .await
            .expect("health");
        assert_eq!(health.status().as_u16(), 200);

        let denied = client
            .get(format!("http://{addr}/api/stats"))
            .send()
            .await
            .expect("stats");
        assert_eq!(denied.status().as_u16(), 401);

        let allowed = client
            .get(format!("http://{addr}/api/stats"))
            .bearer_auth("s3cret")
            .send()
            .await
            .expect("stats");
        assert_eq!(allowed.status().as_u16(), 200);
    }
}
