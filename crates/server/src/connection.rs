//! Pure connection state machine
//!
//! Protocol decisions for one WebSocket connection live here as a pure,
//! synchronous function: `transition(state, input, now) -> (state, effects)`.
//! The socket loop in `websocket.rs` feeds it inputs and executes the
//! returned effects (registry calls, frames, close).

use std::collections::BTreeSet;

use specstream_protocol::{ErrorCode, OperationStatus, ServerMessage, StreamMessage};

use crate::auth::Principal;

/// Close code sent after an authentication failure (policy violation)
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

// ---------------------------------------------------------------------------
// Phase: where the connection is in its lifecycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Connecting,
    Authenticated,
    Subscribed { operation_id: String },
    Closed,
}

// ---------------------------------------------------------------------------
// ConnectionState: per-connection data
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ConnectionState {
    pub connection_id: u64,
    pub phase: Phase,
    pub principal: Option<Principal>,
    /// Highest sequence the client acknowledged on the current subscription
    pub last_acknowledged: Option<u64>,
    /// Delivered high/critical sequences not yet acknowledged
    pub awaiting_ack: BTreeSet<u64>,
    pub delivered: u64,
}

impl ConnectionState {
    pub fn new(connection_id: u64) -> Self {
        Self {
            connection_id,
            phase: Phase::Connecting,
            principal: None,
            last_acknowledged: None,
            awaiting_ack: BTreeSet::new(),
            delivered: 0,
        }
    }

    pub fn subscribed_to(&self) -> Option<&str> {
        match &self.phase {
            Phase::Subscribed { operation_id } => Some(operation_id),
            _ => None,
        }
    }

    fn is_open(&self) -> bool {
        matches!(self.phase, Phase::Authenticated | Phase::Subscribed { .. })
    }

    fn reset_acks(&mut self) {
        self.last_acknowledged = None;
        self.awaiting_ack.clear();
    }

    fn deliver(&mut self, message: StreamMessage, effects: &mut Vec<Effect>) {
        if message.metadata.requires_acknowledgment {
            self.awaiting_ack.insert(message.sequence);
        }
        self.delivered += 1;
        effects.push(Effect::Emit(Box::new(ServerMessage::Message(message))));
    }
}

// ---------------------------------------------------------------------------
// Input: handshake results, client frames, registry results, transport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum Input {
    SessionValidated {
        principal: Principal,
        operation_id: String,
        last_received_sequence: Option<u64>,
    },
    SessionRejected {
        reason: String,
    },
    SubscribeRequested {
        operation_id: String,
        last_received_sequence: Option<u64>,
    },
    /// Registry snapshot taken and the observer queue attached
    AttachSucceeded {
        operation_id: String,
        replay: Vec<StreamMessage>,
        status: OperationStatus,
        latest_sequence: Option<u64>,
    },
    AttachFailed {
        operation_id: String,
        code: ErrorCode,
        message: String,
    },
    UnsubscribeRequested {
        operation_id: String,
    },
    AcknowledgeReceived {
        operation_id: String,
        sequence: u64,
    },
    ReplayRequested {
        operation_id: String,
        from_sequence: Option<u64>,
    },
    ReplaySucceeded {
        operation_id: String,
        messages: Vec<StreamMessage>,
        latest_sequence: Option<u64>,
    },
    ReplayFailed {
        operation_id: String,
        code: ErrorCode,
        message: String,
    },
    /// Live message drained from the observer queue
    LiveMessage(StreamMessage),
    PingReceived,
    ParseFailed {
        error: String,
    },
    TransportClosed,
}

// ---------------------------------------------------------------------------
// Effects: IO for the socket loop to execute
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Emit(Box<ServerMessage>),
    /// `Registry::subscribe` with a fresh observer queue
    Attach {
        operation_id: String,
        from_exclusive: Option<u64>,
    },
    Detach {
        operation_id: String,
    },
    /// `Registry::snapshot`, answered with `ReplaySucceeded`/`ReplayFailed`
    Replay {
        operation_id: String,
        from_exclusive: Option<u64>,
    },
    Close {
        code: u16,
        reason: String,
    },
}

fn emit(message: ServerMessage) -> Effect {
    Effect::Emit(Box::new(message))
}

fn error(code: ErrorCode, message: impl Into<String>, operation_id: Option<&str>) -> Effect {
    emit(ServerMessage::error(code, message, operation_id))
}

fn not_subscribed(operation_id: &str) -> Effect {
    error(
        ErrorCode::NotSubscribed,
        format!("not subscribed to {operation_id}"),
        Some(operation_id),
    )
}

// ---------------------------------------------------------------------------
// Transition
// ---------------------------------------------------------------------------

pub fn transition(
    mut state: ConnectionState,
    input: Input,
    now: &str,
) -> (ConnectionState, Vec<Effect>) {
    let mut effects = Vec::new();

    if state.phase == Phase::Closed {
        return (state, effects);
    }

    match input {
        Input::SessionValidated {
            principal,
            operation_id,
            last_received_sequence,
        } => {
            if state.phase != Phase::Connecting {
                effects.push(error(
                    ErrorCode::InvalidRequest,
                    "connection already authenticated",
                    None,
                ));
                return (state, effects);
            }
            effects.push(emit(ServerMessage::Connected {
                connection_id: state.connection_id,
                operation_id: operation_id.clone(),
                session_id: principal.session_id.clone(),
                principal: principal.name.clone(),
            }));
            effects.push(Effect::Attach {
                operation_id,
                from_exclusive: last_received_sequence,
            });
            state.principal = Some(principal);
            state.phase = Phase::Authenticated;
        }

        Input::SessionRejected { reason } => {
            effects.push(error(ErrorCode::AuthRejected, reason.clone(), None));
            effects.push(Effect::Close {
                code: CLOSE_POLICY_VIOLATION,
                reason,
            });
            state.phase = Phase::Closed;
        }

        Input::SubscribeRequested {
            operation_id,
            last_received_sequence,
        } => {
            if !state.is_open() {
                effects.push(error(
                    ErrorCode::InvalidRequest,
                    "subscribe before authentication",
                    Some(&operation_id),
                ));
                return (state, effects);
            }
            // One subscription per connection: rebinding drops the old one
            if let Some(previous) = state.subscribed_to().map(str::to_string) {
                effects.push(Effect::Detach {
                    operation_id: previous,
                });
                state.phase = Phase::Authenticated;
                state.reset_acks();
            }
            effects.push(Effect::Attach {
                operation_id,
                from_exclusive: last_received_sequence,
            });
        }

        Input::AttachSucceeded {
            operation_id,
            replay,
            status,
            latest_sequence,
        } => {
            if !state.is_open() {
                effects.push(Effect::Detach { operation_id });
                return (state, effects);
            }
            state.reset_acks();
            let replayed = replay.len();
            for message in replay {
                state.deliver(message, &mut effects);
            }
            effects.push(emit(ServerMessage::Subscribed {
                operation_id: operation_id.clone(),
                status,
                replayed,
                latest_sequence,
            }));
            state.phase = Phase::Subscribed { operation_id };
        }

        Input::AttachFailed {
            operation_id,
            code,
            message,
        }
        | Input::ReplayFailed {
            operation_id,
            code,
            message,
        } => {
            effects.push(error(code, message, Some(&operation_id)));
        }

        Input::UnsubscribeRequested { operation_id } => {
            if state.subscribed_to() != Some(operation_id.as_str()) {
                effects.push(not_subscribed(&operation_id));
                return (state, effects);
            }
            effects.push(Effect::Detach {
                operation_id: operation_id.clone(),
            });
            effects.push(emit(ServerMessage::Unsubscribed { operation_id }));
            state.phase = Phase::Authenticated;
            state.reset_acks();
        }

        Input::AcknowledgeReceived {
            operation_id,
            sequence,
        } => {
            if state.subscribed_to() != Some(operation_id.as_str()) {
                effects.push(not_subscribed(&operation_id));
                return (state, effects);
            }
            state.last_acknowledged = Some(state.last_acknowledged.map_or(sequence, |s| s.max(sequence)));
            state.awaiting_ack.retain(|&pending| pending > sequence);
        }

        Input::ReplayRequested {
            operation_id,
            from_sequence,
        } => {
            if state.subscribed_to() != Some(operation_id.as_str()) {
                effects.push(not_subscribed(&operation_id));
                return (state, effects);
            }
            effects.push(Effect::Replay {
                operation_id,
                from_exclusive: from_sequence,
            });
        }

        Input::ReplaySucceeded {
            operation_id,
            messages,
            latest_sequence,
        } => {
            if state.subscribed_to() != Some(operation_id.as_str()) {
                return (state, effects);
            }
            let count = messages.len();
            for message in messages {
                state.deliver(message, &mut effects);
            }
            effects.push(emit(ServerMessage::Replayed {
                operation_id,
                count,
                latest_sequence,
            }));
        }

        Input::LiveMessage(message) => {
            // Stale queue items from a previous binding are dropped
            if state.subscribed_to() == Some(message.operation_id.as_str()) {
                state.deliver(message, &mut effects);
            }
        }

        Input::PingReceived => {
            effects.push(emit(ServerMessage::Pong {
                timestamp: now.to_string(),
            }));
        }

        Input::ParseFailed { error: detail } => {
            effects.push(error(
                ErrorCode::ParseError,
                format!("invalid client frame: {detail}"),
                None,
            ));
        }

        Input::TransportClosed => {
            if let Some(operation_id) = state.subscribed_to().map(str::to_string) {
                effects.push(Effect::Detach { operation_id });
            }
            state.phase = Phase::Closed;
        }
    }

    (state, effects)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use specstream_protocol::{MessageMetadata, MessageType, Sender};

    use super::*;

    const NOW: &str = "2026-01-01T00:00:00.000Z";

    fn principal() -> Principal {
        Principal {
            session_id: "sess-1".into(),
            name: "alice".into(),
        }
    }

    fn message(operation_id: &str, sequence: u64, message_type: MessageType) -> StreamMessage {
        StreamMessage {
            id: format!("m-{sequence}"),
            operation_id: operation_id.into(),
            sequence,
            message_type,
            content: "line".into(),
            sender: Sender::Agent,
            timestamp: NOW.into(),
            metadata: MessageMetadata::for_type(message_type),
        }
    }

    fn authenticated() -> ConnectionState {
        let (state, _) = transition(
            ConnectionState::new(7),
            Input::SessionValidated {
                principal: principal(),
                operation_id: "op-1".into(),
                last_received_sequence: None,
            },
            NOW,
        );
        state
    }

    fn subscribed(operation_id: &str) -> ConnectionState {
        let (state, _) = transition(
            authenticated(),
            Input::AttachSucceeded {
                operation_id: operation_id.into(),
                replay: vec![],
                status: OperationStatus::Running,
                latest_sequence: None,
            },
            NOW,
        );
        state
    }

    fn emitted(effects: &[Effect]) -> Vec<&ServerMessage> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::Emit(message) => Some(message.as_ref()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn validated_session_emits_connected_then_attaches() {
        let (state, effects) = transition(
            ConnectionState::new(7),
            Input::SessionValidated {
                principal: principal(),
                operation_id: "op-1".into(),
                last_received_sequence: Some(4),
            },
            NOW,
        );

        assert_eq!(state.phase, Phase::Authenticated);
        assert_eq!(effects.len(), 2);
        assert!(matches!(
            effects[0],
            Effect::Emit(ref m) if matches!(**m, ServerMessage::Connected { connection_id: 7, .. })
        ));
        assert_eq!(
            effects[1],
            Effect::Attach {
                operation_id: "op-1".into(),
                from_exclusive: Some(4)
            }
        );
    }

    #[test]
    fn rejected_session_errors_then_closes_with_policy_code() {
        let (state, effects) = transition(
            ConnectionState::new(1),
            Input::SessionRejected {
                reason: "unknown session".into(),
            },
            NOW,
        );

        assert_eq!(state.phase, Phase::Closed);
        assert!(matches!(
            effects[0],
            Effect::Emit(ref m) if matches!(**m, ServerMessage::Error { code: ErrorCode::AuthRejected, .. })
        ));
        assert_eq!(
            effects[1],
            Effect::Close {
                code: CLOSE_POLICY_VIOLATION,
                reason: "unknown session".into()
            }
        );
    }

    #[test]
    fn attach_sends_replay_before_subscribed() {
        let (state, effects) = transition(
            authenticated(),
            Input::AttachSucceeded {
                operation_id: "op-1".into(),
                replay: vec![
                    message("op-1", 3, MessageType::Thinking),
                    message("op-1", 4, MessageType::Error),
                ],
                status: OperationStatus::Running,
                latest_sequence: Some(4),
            },
            NOW,
        );

        assert_eq!(state.subscribed_to(), Some("op-1"));
        let frames = emitted(&effects);
        assert_eq!(frames.len(), 3);
        assert!(matches!(frames[0], ServerMessage::Message(m) if m.sequence == 3));
        assert!(matches!(frames[1], ServerMessage::Message(m) if m.sequence == 4));
        assert!(matches!(
            frames[2],
            ServerMessage::Subscribed { replayed: 2, latest_sequence: Some(4), .. }
        ));
        // error is critical and needs an acknowledgement, thinking does not
        assert_eq!(state.awaiting_ack.iter().copied().collect::<Vec<_>>(), vec![4]);
    }

    #[test]
    fn failed_attach_keeps_connection_authenticated() {
        let (state, effects) = transition(
            authenticated(),
            Input::AttachFailed {
                operation_id: "op-1".into(),
                code: ErrorCode::RangeExpired,
                message: "sequence 1 is no longer retained".into(),
            },
            NOW,
        );
        assert_eq!(state.phase, Phase::Authenticated);
        assert!(matches!(
            emitted(&effects)[0],
            ServerMessage::Error { code: ErrorCode::RangeExpired, .. }
        ));
    }

    #[test]
    fn resubscribe_detaches_previous_operation() {
        let (state, effects) = transition(
            subscribed("op-1"),
            Input::SubscribeRequested {
                operation_id: "op-2".into(),
                last_received_sequence: None,
            },
            NOW,
        );
        assert_eq!(state.phase, Phase::Authenticated);
        assert_eq!(
            effects,
            vec![
                Effect::Detach {
                    operation_id: "op-1".into()
                },
                Effect::Attach {
                    operation_id: "op-2".into(),
                    from_exclusive: None
                },
            ]
        );
    }

    #[test]
    fn subscribe_before_authentication_is_invalid() {
        let (state, effects) = transition(
            ConnectionState::new(1),
            Input::SubscribeRequested {
                operation_id: "op-1".into(),
                last_received_sequence: None,
            },
            NOW,
        );
        assert_eq!(state.phase, Phase::Connecting);
        assert!(matches!(
            emitted(&effects)[0],
            ServerMessage::Error { code: ErrorCode::InvalidRequest, .. }
        ));
    }

    #[test]
    fn acknowledge_clears_pending_high_priority_sequences() {
        let mut state = subscribed("op-1");
        for (sequence, message_type) in [
            (0, MessageType::Error),
            (1, MessageType::Execution),
            (2, MessageType::Complete),
        ] {
            let (next, _) = transition(
                state,
                Input::LiveMessage(message("op-1", sequence, message_type)),
                NOW,
            );
            state = next;
        }
        assert_eq!(state.delivered, 3);
        assert_eq!(state.awaiting_ack.len(), 2);

        let (state, effects) = transition(
            state,
            Input::AcknowledgeReceived {
                operation_id: "op-1".into(),
                sequence: 1,
            },
            NOW,
        );
        assert!(effects.is_empty());
        assert_eq!(state.last_acknowledged, Some(1));
        assert_eq!(state.awaiting_ack.iter().copied().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn acknowledge_for_other_operation_is_not_subscribed() {
        let (_, effects) = transition(
            subscribed("op-1"),
            Input::AcknowledgeReceived {
                operation_id: "op-2".into(),
                sequence: 0,
            },
            NOW,
        );
        assert!(matches!(
            emitted(&effects)[0],
            ServerMessage::Error { code: ErrorCode::NotSubscribed, .. }
        ));
    }

    #[test]
    fn live_messages_for_stale_bindings_are_dropped() {
        let (state, effects) = transition(
            subscribed("op-2"),
            Input::LiveMessage(message("op-1", 9, MessageType::Execution)),
            NOW,
        );
        assert!(effects.is_empty());
        assert_eq!(state.delivered, 0);
    }

    #[test]
    fn replay_round_trip_ends_with_marker() {
        let (state, effects) = transition(
            subscribed("op-1"),
            Input::ReplayRequested {
                operation_id: "op-1".into(),
                from_sequence: Some(1),
            },
            NOW,
        );
        assert_eq!(
            effects,
            vec![Effect::Replay {
                operation_id: "op-1".into(),
                from_exclusive: Some(1)
            }]
        );

        let (_, effects) = transition(
            state,
            Input::ReplaySucceeded {
                operation_id: "op-1".into(),
                messages: vec![message("op-1", 2, MessageType::Execution)],
                latest_sequence: Some(2),
            },
            NOW,
        );
        let frames = emitted(&effects);
        assert_eq!(frames.len(), 2);
        assert!(matches!(frames[1], ServerMessage::Replayed { count: 1, .. }));
    }

    #[test]
    fn unsubscribe_detaches_and_confirms() {
        let (state, effects) = transition(
            subscribed("op-1"),
            Input::UnsubscribeRequested {
                operation_id: "op-1".into(),
            },
            NOW,
        );
        assert_eq!(state.phase, Phase::Authenticated);
        assert_eq!(
            effects[0],
            Effect::Detach {
                operation_id: "op-1".into()
            }
        );
        assert!(matches!(
            emitted(&effects)[0],
            ServerMessage::Unsubscribed { .. }
        ));
    }

    #[test]
    fn ping_and_parse_errors_keep_connection_open() {
        let (state, effects) = transition(subscribed("op-1"), Input::PingReceived, NOW);
        assert!(matches!(
            emitted(&effects)[0],
            ServerMessage::Pong { timestamp } if timestamp == NOW
        ));

        let (state, effects) = transition(
            state,
            Input::ParseFailed {
                error: "expected value".into(),
            },
            NOW,
        );
        assert_eq!(state.subscribed_to(), Some("op-1"));
        assert!(matches!(
            emitted(&effects)[0],
            ServerMessage::Error { code: ErrorCode::ParseError, .. }
        ));
    }

    #[test]
    fn transport_close_detaches_and_ignores_later_input() {
        let (state, effects) = transition(subscribed("op-1"), Input::TransportClosed, NOW);
        assert_eq!(state.phase, Phase::Closed);
        assert_eq!(
            effects,
            vec![Effect::Detach {
                operation_id: "op-1".into()
            }]
        );

        let (_, effects) = transition(state, Input::PingReceived, NOW);
        assert!(effects.is_empty());
    }
}
