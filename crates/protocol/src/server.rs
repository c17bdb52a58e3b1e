//! Server → Client frames

use serde::{Deserialize, Serialize};

use crate::types::*;

/// Frames sent from server to client.
///
/// Tagged by `frame` so a message frame keeps the message's own `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected {
        connection_id: u64,
        operation_id: String,
        session_id: String,
        principal: String,
    },
    Message(StreamMessage),
    /// Sent after the replay burst and before the first live message
    Subscribed {
        operation_id: String,
        status: OperationStatus,
        replayed: usize,
        latest_sequence: Option<u64>,
    },
    /// End marker of an explicit replay request
    Replayed {
        operation_id: String,
        count: usize,
        latest_sequence: Option<u64>,
    },
    Unsubscribed {
        operation_id: String,
    },
    Error {
        code: ErrorCode,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        operation_id: Option<String>,
    },
    Pong {
        timestamp: String,
    },
}

impl ServerMessage {
    pub fn error(code: ErrorCode, message: impl Into<String>, operation_id: Option<&str>) -> Self {
        ServerMessage::Error {
            code,
            message: message.into(),
            operation_id: operation_id.map(str::to_string),
        }
    }
}
