//! Events written to a client connection by the delivery controller.
//!
//! Each variant has a stable wire name (`connected`, `message`, ...) and a
//! JSON payload. The transport layer maps them onto SSE `event:`/`data:`
//! frames; nothing here depends on the transport.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::message::Message;

/// Error code for failures while generating a reply.
pub const STREAM_ERROR: &str = "stream_error";
/// Error code for failures while replaying history.
pub const REPLAY_ERROR: &str = "replay_error";

/// Payload of `connected`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectedPayload {
    /// Conversation the stream is attached to.
    pub conversation_id: Uuid,
}

/// Payload of `replay_complete`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplayCompletePayload {
    /// Highest sequence delivered, or the resume cursor when nothing was replayed.
    pub last_sequence: u64,
    /// Number of `message` events emitted during replay.
    pub message_count: u64,
}

/// Payload of `heartbeat`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeartbeatPayload {
    /// Server time at emission.
    pub timestamp: DateTime<Utc>,
}

/// Payload of `token`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenPayload {
    /// Text fragment.
    pub token: String,
    /// Zero-based position in the generation.
    pub index: usize,
}

/// Payload of `message_complete`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageCompletePayload {
    /// The persisted assistant message.
    pub message: Message,
    /// Its log sequence.
    pub sequence: u64,
}

/// Payload of `error`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    /// Stable machine-readable code.
    pub code: String,
    /// Human-readable description.
    pub message: String,
}

impl ErrorPayload {
    /// Builds an error payload.
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Payload of `done`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DonePayload {
    /// Whether the exchange completed.
    pub success: bool,
}

/// A single event on a client stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum DeliveryEvent {
    /// Stream opened.
    Connected(ConnectedPayload),
    /// Historical message from replay.
    Message(Message),
    /// Replay reached the end of the log.
    ReplayComplete(ReplayCompletePayload),
    /// Keepalive.
    Heartbeat(HeartbeatPayload),
    /// Incremental generation output.
    Token(TokenPayload),
    /// Confirmation of the published user message.
    UserMessage(Message),
    /// Persisted assistant message.
    MessageComplete(MessageCompletePayload),
    /// Terminal failure.
    Error(ErrorPayload),
    /// Terminal success marker.
    Done(DonePayload),
}

impl DeliveryEvent {
    /// Wire name of the event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            DeliveryEvent::Connected(_) => "connected",
            DeliveryEvent::Message(_) => "message",
            DeliveryEvent::ReplayComplete(_) => "replay_complete",
            DeliveryEvent::Heartbeat(_) => "heartbeat",
            DeliveryEvent::Token(_) => "token",
            DeliveryEvent::UserMessage(_) => "user_message",
            DeliveryEvent::MessageComplete(_) => "message_complete",
            DeliveryEvent::Error(_) => "error",
            DeliveryEvent::Done(_) => "done",
        }
    }

    /// JSON encoding of the payload alone.
    ///
    /// # Errors
    /// Returns an error if the payload cannot be serialized.
    pub fn payload_json(&self) -> serde_json::Result<String> {
        match self {
            DeliveryEvent::Connected(payload) => serde_json::to_string(payload),
            DeliveryEvent::Message(message) | DeliveryEvent::UserMessage(message) => {
                serde_json::to_string(message)
            }
            DeliveryEvent::ReplayComplete(payload) => serde_json::to_string(payload),
            DeliveryEvent::Heartbeat(payload) => serde_json::to_string(payload),
            DeliveryEvent::Token(payload) => serde_json::to_string(payload),
            DeliveryEvent::MessageComplete(payload) => serde_json::to_string(payload),
            DeliveryEvent::Error(payload) => serde_json::to_string(payload),
            DeliveryEvent::Done(payload) => serde_json::to_string(payload),
        }
    }

    /// Log sequence carried by the event, used as the SSE `id`.
    #[must_use]
    pub fn sequence(&self) -> Option<u64> {
        match self {
            DeliveryEvent::Message(message) | DeliveryEvent::UserMessage(message) => {
                message.sequence
            }
            DeliveryEvent::MessageComplete(payload) => Some(payload.sequence),
            _ => None,
        }
    }

    /// Whether no further events follow this one.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryEvent::Error(_) | DeliveryEvent::Done(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::message::Role;

    #[test]
    fn token_payload_uses_wire_field_names() {
        let event = DeliveryEvent::Token(TokenPayload {
            token: "Hi".into(),
            index: 0,
        });
        assert_eq!(event.name(), "token");
        assert_eq!(event.payload_json().unwrap(), r#"{"token":"Hi","index":0}"#);
        assert!(!event.is_terminal());
    }

    #[test]
    fn replayed_message_exposes_sequence() {
        let mut message = Message::new(Uuid::now_v7(), "t1", Role::User, "hello");
        message.sequence = Some(42);
        let event = DeliveryEvent::Message(message);
        assert_eq!(event.sequence(), Some(42));
        assert_eq!(
            DeliveryEvent::Done(DonePayload { success: true }).sequence(),
            None
        );
    }

    #[test]
    fn error_payload_carries_code_and_message() {
        let event = DeliveryEvent::Error(ErrorPayload::new(REPLAY_ERROR, "Failed to replay messages"));
        assert!(event.is_terminal());
        assert_eq!(
            event.payload_json().unwrap(),
            r#"{"code":"replay_error","message":"Failed to replay messages"}"#
        );
    }
}
