//! WebSocket handling
//!
//! One task per connection owns the `ConnectionState` and runs effects from
//! `connection::transition`. A send task writes frames to the socket, so the
//! loop never blocks on a slow client while it reads.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use bytes::Bytes;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use specstream_protocol::{ClientMessage, ErrorCode, ServerMessage, StreamMessage};

use crate::broadcaster::ObserverQueue;
use crate::connection::{transition, ConnectionState, Effect, Input};
use crate::registry::{format_time, RegistryError};
use crate::state::AppState;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

const CLOSE_GOING_AWAY: u16 = 1001;

/// Messages that can be sent through the WebSocket
#[allow(clippy::large_enum_variant)]
enum OutboundMessage {
    /// JSON-serialized ServerMessage
    Json(ServerMessage),
    Ping,
    /// Raw pong response
    Pong(Bytes),
    Close { code: u16, reason: String },
}

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    pub operation_id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub last_received_sequence: Option<u64>,
}

/// WebSocket upgrade handler for `/ws/connect`
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<ConnectQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query))
}

pub fn error_code(err: &RegistryError) -> ErrorCode {
    match err {
        RegistryError::RangeExpired { .. } => ErrorCode::RangeExpired,
        RegistryError::NotFound(_) | RegistryError::Evicted(_) => ErrorCode::NotFound,
        RegistryError::DuplicateOperation(_)
        | RegistryError::IllegalTransition { .. }
        | RegistryError::Closed(_)
        | RegistryError::NotTerminal(_) => ErrorCode::InvalidRequest,
    }
}

/// Connection-owned state plus the handles its effects need
struct Connection {
    app: Arc<AppState>,
    outbound: mpsc::Sender<OutboundMessage>,
    state: ConnectionState,
    queue: Option<Arc<ObserverQueue>>,
    open: bool,
}

impl Connection {
    fn new(app: Arc<AppState>, outbound: mpsc::Sender<OutboundMessage>, connection_id: u64) -> Self {
        Self {
            app,
            outbound,
            state: ConnectionState::new(connection_id),
            queue: None,
            open: true,
        }
    }

    fn id(&self) -> u64 {
        self.state.connection_id
    }

    /// Feed `input` through the state machine and run every effect,
    /// including inputs produced by registry calls.
    async fn apply(&mut self, input: Input) {
        let mut pending = VecDeque::from([input]);
        while let Some(input) = pending.pop_front() {
            let now = format_time(Utc::now());
            let id = self.id();
            let state = std::mem::replace(&mut self.state, ConnectionState::new(id));
            let (state, effects) = transition(state, input, &now);
            self.state = state;

            for effect in effects {
                if let Some(next) = self.execute(effect).await {
                    pending.push_back(next);
                }
            }
        }
    }

    async fn execute(&mut self, effect: Effect) -> Option<Input> {
        match effect {
            Effect::Emit(message) => {
                self.send(OutboundMessage::Json(*message)).await;
                None
            }

            Effect::Attach {
                operation_id,
                from_exclusive,
            } => {
                let queue = self.app.broadcaster().new_queue();
                match self
                    .app
                    .registry
                    .subscribe(&operation_id, from_exclusive, self.id(), queue.clone())
                    .await
                {
                    Ok(subscription) => {
                        info!(
                            component = "websocket",
                            event = "ws.subscribe",
                            connection_id = self.id(),
                            operation_id = %operation_id,
                            replay = subscription.replay.len(),
                            "Subscribed to operation"
                        );
                        self.queue = Some(queue);
                        Some(Input::AttachSucceeded {
                            operation_id,
                            replay: subscription.replay,
                            status: subscription.status,
                            latest_sequence: subscription.latest_sequence,
                        })
                    }
                    Err(e) => {
                        warn!(
                            component = "websocket",
                            event = "ws.subscribe.failed",
                            connection_id = self.id(),
                            operation_id = %operation_id,
                            error = %e,
                            "Subscribe failed"
                        );
                        Some(Input::AttachFailed {
                            operation_id,
                            code: error_code(&e),
                            message: e.to_string(),
                        })
                    }
                }
            }

            Effect::Detach { operation_id } => {
                self.app.registry.unsubscribe(&operation_id, self.id());
                self.queue = None;
                debug!(
                    component = "websocket",
                    event = "ws.unsubscribe",
                    connection_id = self.id(),
                    operation_id = %operation_id,
                    "Detached from operation"
                );
                None
            }

            Effect::Replay {
                operation_id,
                from_exclusive,
            } => match self.app.registry.snapshot(&operation_id, from_exclusive).await {
                Ok(messages) => {
                    let latest_sequence = self
                        .app
                        .registry
                        .summary(&operation_id)
                        .await
                        .ok()
                        .and_then(|summary| summary.latest_sequence);
                    Some(Input::ReplaySucceeded {
                        operation_id,
                        messages,
                        latest_sequence,
                    })
                }
                Err(e) => Some(Input::ReplayFailed {
                    operation_id,
                    code: error_code(&e),
                    message: e.to_string(),
                }),
            },

            Effect::Close { code, reason } => {
                self.send(OutboundMessage::Close { code, reason }).await;
                self.open = false;
                None
            }
        }
    }

    async fn send(&mut self, message: OutboundMessage) {
        if self.outbound.send(message).await.is_err() {
            self.open = false;
        }
    }
}

/// Next live message, or never when nothing is attached
async fn next_live(queue: Option<&Arc<ObserverQueue>>) -> Option<StreamMessage> {
    match queue {
        Some(queue) => queue.recv().await,
        None => std::future::pending().await,
    }
}

/// Handle a WebSocket connection
async fn handle_socket(socket: WebSocket, app: Arc<AppState>, query: ConnectQuery) {
    let conn_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
    info!(
        component = "websocket",
        event = "ws.connection.opened",
        connection_id = conn_id,
        operation_id = %query.operation_id,
        "WebSocket connection opened"
    );
    app.connections.opened();

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundMessage>(100);

    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            let result = match msg {
                OutboundMessage::Json(server_msg) => match serde_json::to_string(&server_msg) {
                    Ok(json) => ws_tx.send(Message::Text(json.into())).await,
                    Err(e) => {
                        error!(
                            component = "websocket",
                            event = "ws.send.serialize_failed",
                            connection_id = conn_id,
                            error = %e,
                            "Failed to serialize server message"
                        );
                        continue;
                    }
                },
                OutboundMessage::Ping => ws_tx.send(Message::Ping(Bytes::new())).await,
                OutboundMessage::Pong(data) => ws_tx.send(Message::Pong(data)).await,
                OutboundMessage::Close { code, reason } => {
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            };

            if result.is_err() {
                debug!(
                    component = "websocket",
                    event = "ws.send.disconnected",
                    connection_id = conn_id,
                    "WebSocket send failed, client disconnected"
                );
                break;
            }
        }
    });

    let mut conn = Connection::new(app.clone(), outbound_tx, conn_id);

    let session_id = query.session_id.unwrap_or_default();
    match app.validator.validate(&session_id).await {
        Ok(principal) => {
            conn.apply(Input::SessionValidated {
                principal,
                operation_id: query.operation_id,
                last_received_sequence: query.last_received_sequence,
            })
            .await;
        }
        Err(rejected) => {
            warn!(
                component = "websocket",
                event = "ws.auth.rejected",
                connection_id = conn_id,
                reason = %rejected.reason,
                "Session rejected"
            );
            app.connections.rejected();
            conn.apply(Input::SessionRejected {
                reason: rejected.reason,
            })
            .await;
        }
    }

    let keepalive = app.keepalive.clone();
    let mut ping = tokio::time::interval_at(
        Instant::now() + keepalive.ping_interval,
        keepalive.ping_interval,
    );
    let mut last_seen = Instant::now();
    let mut shutdown = app.shutdown.subscribe();

    while conn.open {
        let live = conn.queue.clone();
        tokio::select! {
            frame = ws_rx.next() => {
                last_seen = Instant::now();
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Ping(data))) => {
                        conn.send(OutboundMessage::Pong(data)).await;
                        continue;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(
                            component = "websocket",
                            event = "ws.connection.close_frame",
                            connection_id = conn_id,
                            "Client closed the connection"
                        );
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!(
                            component = "websocket",
                            event = "ws.connection.error",
                            connection_id = conn_id,
                            error = %e,
                            "WebSocket error"
                        );
                        break;
                    }
                };
                handle_client_message(&mut conn, text.as_str()).await;
            }

            message = next_live(live.as_ref()) => match message {
                Some(message) => conn.apply(Input::LiveMessage(message)).await,
                // Queue closed underneath us: eviction or a newer binding
                None => conn.queue = None,
            },

            _ = ping.tick() => {
                if last_seen.elapsed() >= keepalive.idle_timeout {
                    info!(
                        component = "websocket",
                        event = "ws.connection.idle_timeout",
                        connection_id = conn_id,
                        idle_secs = last_seen.elapsed().as_secs(),
                        "Closing idle connection"
                    );
                    break;
                }
                conn.send(OutboundMessage::Ping).await;
            }

            Ok(()) = shutdown.changed() => {
                if *shutdown.borrow() {
                    conn.send(OutboundMessage::Close {
                        code: CLOSE_GOING_AWAY,
                        reason: "server shutting down".to_string(),
                    })
                    .await;
                    break;
                }
            }
        }
    }

    conn.apply(Input::TransportClosed).await;
    let delivered = conn.state.delivered;
    app.connections.closed(delivered);
    info!(
        component = "websocket",
        event = "ws.connection.closed",
        connection_id = conn_id,
        delivered = delivered,
        unacknowledged = conn.state.awaiting_ack.len(),
        "WebSocket connection closed"
    );

    // Let queued frames (an auth error and its close) reach the client
    drop(conn);
    if tokio::time::timeout(std::time::Duration::from_secs(1), &mut send_task)
        .await
        .is_err()
    {
        send_task.abort();
    }
}

/// Parse one client frame and feed it to the connection
async fn handle_client_message(conn: &mut Connection, text: &str) {
    let client_msg: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            warn!(
                component = "websocket",
                event = "ws.message.parse_failed",
                connection_id = conn.id(),
                error = %e,
                payload_bytes = text.len(),
                "Failed to parse client message"
            );
            conn.apply(Input::ParseFailed {
                error: e.to_string(),
            })
            .await;
            return;
        }
    };

    let input = match client_msg {
        ClientMessage::Subscribe {
            operation_id,
            last_received_sequence,
        } => Input::SubscribeRequested {
            operation_id,
            last_received_sequence,
        },
        ClientMessage::Unsubscribe { operation_id } => Input::UnsubscribeRequested { operation_id },
        ClientMessage::Acknowledge {
            operation_id,
            sequence,
        } => Input::AcknowledgeReceived {
            operation_id,
            sequence,
        },
        ClientMessage::Replay {
            operation_id,
            from_sequence,
        } => Input::ReplayRequested {
            operation_id,
            from_sequence,
        },
        ClientMessage::Ping => Input::PingReceived,
    };
    conn.apply(input).await;
}
