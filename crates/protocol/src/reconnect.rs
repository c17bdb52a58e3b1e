//! Client-side resume support.
//!
//! Reconnection is handled entirely by the client: it retries the handshake
//! with exponential backoff and rejoins with the last sequence it saw. The
//! server keeps no per-connection state across transport failures.

use std::time::Duration;

use crate::client::ClientMessage;
use crate::types::{MessageType, StreamMessage};

/// Exponential backoff with a bounded attempt count
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: u32,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2,
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based).
    /// Returns `None` once the attempt budget is spent.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = self
            .multiplier
            .max(1)
            .checked_pow(attempt - 1)
            .unwrap_or(u32::MAX);
        let delay = self
            .initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay);
        Some(delay.min(self.max_delay))
    }
}

/// Result of feeding a received message into the cursor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// Next message in order; cursor advanced
    Fresh,
    /// Already seen (replay overlap); ignore it
    Duplicate,
    /// Sequence skipped ahead. Only happens when the server dropped live
    /// messages under backpressure; a `replay` from the cursor fills it.
    Gap { expected: u64, got: u64 },
    /// Belongs to another operation
    Foreign,
}

/// Tracks the last sequence a client has received for one operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeCursor {
    pub operation_id: String,
    pub last_received_sequence: Option<u64>,
    pub finished: bool,
}

impl ResumeCursor {
    pub fn new(operation_id: impl Into<String>) -> Self {
        Self {
            operation_id: operation_id.into(),
            last_received_sequence: None,
            finished: false,
        }
    }

    fn expected(&self) -> u64 {
        self.last_received_sequence.map_or(0, |seq| seq + 1)
    }

    pub fn observe(&mut self, message: &StreamMessage) -> Observation {
        if message.operation_id != self.operation_id {
            return Observation::Foreign;
        }
        let expected = self.expected();
        if message.sequence < expected {
            return Observation::Duplicate;
        }

        self.last_received_sequence = Some(message.sequence);
        if message.message_type == MessageType::Complete {
            self.finished = true;
        }
        if message.sequence > expected {
            Observation::Gap {
                expected,
                got: message.sequence,
            }
        } else {
            Observation::Fresh
        }
    }

    /// Query string for the connect handshake (without the session id)
    pub fn handshake_query(&self) -> String {
        match self.last_received_sequence {
            Some(seq) => format!(
                "operation_id={}&last_received_sequence={}",
                self.operation_id, seq
            ),
            None => format!("operation_id={}", self.operation_id),
        }
    }

    pub fn subscribe_frame(&self) -> ClientMessage {
        ClientMessage::Subscribe {
            operation_id: self.operation_id.clone(),
            last_received_sequence: self.last_received_sequence,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MessageMetadata, Sender};

    fn message(operation_id: &str, sequence: u64, message_type: MessageType) -> StreamMessage {
        StreamMessage {
            id: format!("{operation_id}-{sequence}"),
            operation_id: operation_id.into(),
            sequence,
            message_type,
            content: String::new(),
            sender: Sender::Agent,
            timestamp: "2026-01-01T00:00:00.000Z".into(),
            metadata: MessageMetadata::for_type(message_type),
        }
    }

    #[test]
    fn backoff_doubles_until_capped() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(1), Some(Duration::from_secs(1)));
        assert_eq!(policy.delay_for(2), Some(Duration::from_secs(2)));
        assert_eq!(policy.delay_for(3), Some(Duration::from_secs(4)));
        assert_eq!(policy.delay_for(5), Some(Duration::from_secs(16)));
        assert_eq!(policy.delay_for(6), None);
        assert_eq!(policy.delay_for(0), None);

        let capped = ReconnectPolicy {
            max_attempts: 10,
            ..ReconnectPolicy::default()
        };
        assert_eq!(capped.delay_for(8), Some(Duration::from_secs(30)));
    }

    #[test]
    fn cursor_skips_replay_overlap() {
        let mut cursor = ResumeCursor::new("op-1");
        assert_eq!(
            cursor.observe(&message("op-1", 0, MessageType::System)),
            Observation::Fresh
        );
        assert_eq!(
            cursor.observe(&message("op-1", 1, MessageType::Thinking)),
            Observation::Fresh
        );
        assert_eq!(
            cursor.observe(&message("op-1", 1, MessageType::Thinking)),
            Observation::Duplicate
        );
        assert_eq!(
            cursor.observe(&message("op-2", 2, MessageType::Thinking)),
            Observation::Foreign
        );
        assert_eq!(cursor.last_received_sequence, Some(1));
        assert_eq!(
            cursor.handshake_query(),
            "operation_id=op-1&last_received_sequence=1"
        );
    }

    #[test]
    fn cursor_reports_gaps_and_completion() {
        let mut cursor = ResumeCursor::new("op-1");
        cursor.observe(&message("op-1", 0, MessageType::System));
        assert_eq!(
            cursor.observe(&message("op-1", 3, MessageType::Complete)),
            Observation::Gap {
                expected: 1,
                got: 3
            }
        );
        assert!(cursor.finished);
        assert_eq!(
            cursor.subscribe_frame(),
            ClientMessage::Subscribe {
                operation_id: "op-1".into(),
                last_received_sequence: Some(3),
            }
        );
    }

    #[test]
    fn fresh_cursor_requests_full_replay() {
        let cursor = ResumeCursor::new("op-7");
        assert_eq!(cursor.handshake_query(), "operation_id=op-7");
    }
}
