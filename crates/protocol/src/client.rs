//! Client → Server control frames

use serde::{Deserialize, Serialize};

/// Control frames sent from client to server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Bind the connection to an operation. With `last_received_sequence`
    /// the server replays everything after it before live delivery.
    Subscribe {
        operation_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_received_sequence: Option<u64>,
    },
    Unsubscribe {
        operation_id: String,
    },
    /// Flow-control bookkeeping for high/critical messages
    Acknowledge {
        operation_id: String,
        sequence: u64,
    },
    /// Re-send retained messages after `from_sequence` (exclusive)
    /// without touching the live subscription.
    Replay {
        operation_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_sequence: Option<u64>,
    },
    Ping,
}

impl ClientMessage {
    pub fn operation_id(&self) -> Option<&str> {
        match self {
            ClientMessage::Subscribe { operation_id, .. }
            | ClientMessage::Unsubscribe { operation_id }
            | ClientMessage::Acknowledge { operation_id, .. }
            | ClientMessage::Replay { operation_id, .. } => Some(operation_id),
            ClientMessage::Ping => None,
        }
    }
}
