//! specstream protocol
//!
//! Wire types shared between the streaming server and its clients.
//! Frames are serialized as JSON over WebSocket.

use uuid::Uuid;

pub mod client;
pub mod reconnect;
pub mod server;
pub mod types;

pub use client::ClientMessage;
pub use reconnect::{Observation, ReconnectPolicy, ResumeCursor};
pub use server::ServerMessage;
pub use types::*;

/// Generate a new unique ID
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
