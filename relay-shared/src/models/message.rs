use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use uuid::Uuid;

/// Author of a message within a conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Message typed by the end user.
    User,
    /// Message produced by the generation provider.
    Assistant,
    /// Operator-supplied instructions.
    System,
    /// Output of a tool invocation.
    Tool,
}

impl Role {
    /// Subject token used for this role in the log.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
        }
    }
}

impl Display for Role {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            "tool" => Ok(Role::Tool),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

/// A single conversation turn as stored in the append-only log.
///
/// `sequence` is assigned by the log store when the record is committed. A
/// message without a sequence has not been durably published.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Unique identifier of the message.
    pub id: Uuid,
    /// Conversation the message belongs to.
    pub conversation_id: Uuid,
    /// Owning tenant.
    pub tenant_id: String,
    /// Author role.
    pub role: Role,
    /// Message body.
    pub content: String,

    /// Model that generated the content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Prompt tokens consumed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_in: Option<u32>,
    /// Completion tokens produced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_out: Option<u32>,
    /// Wall-clock generation latency.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    /// Provider-reported reason generation stopped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,

    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// When token streaming began.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_started: Option<DateTime<Utc>>,
    /// When token streaming finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_ended: Option<DateTime<Utc>>,

    /// Log sequence, populated on publish and on read.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
}

impl Message {
    /// Builds an unpublished message with a fresh time-ordered identifier.
    #[must_use]
    pub fn new(
        conversation_id: Uuid,
        tenant_id: impl Into<String>,
        role: Role,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            conversation_id,
            tenant_id: tenant_id.into(),
            role,
            content: content.into(),
            model: None,
            tokens_in: None,
            tokens_out: None,
            latency_ms: None,
            stop_reason: None,
            created_at: Utc::now(),
            stream_started: None,
            stream_ended: None,
            sequence: None,
        }
    }

    /// Whether the log store has committed this message.
    #[must_use]
    pub fn is_persisted(&self) -> bool {
        self.sequence.is_some()
    }
}

/// Body of `POST /conversations/{id}/messages`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendMessageRequest {
    /// User message content.
    pub content: String,
    /// Optional model override for the assistant reply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// When true the caller intends to open the stream endpoint for the reply.
    #[serde(default)]
    pub stream: bool,
}

/// Body of `POST /conversations/{id}/stream`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamRequest {
    /// User message content.
    pub content: String,
    /// Optional model override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Response for a synchronous send.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendMessageResponse {
    /// The published user message.
    pub message: Message,
    /// Sequence assigned by the log.
    pub sequence: u64,
}

/// One page of conversation history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListMessagesResponse {
    /// Messages in ascending sequence order.
    pub messages: Vec<Message>,
    /// True when the page was full; a further page may exist.
    pub has_more: bool,
    /// Cursor to pass as `after_sequence` for the next page.
    pub last_sequence: u64,
    /// Whether a generation is currently streaming for this conversation.
    pub stream_active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unpublished_message_omits_sequence_and_generation_fields() {
        let message = Message::new(Uuid::now_v7(), "t1", Role::User, "hello");
        assert!(!message.is_persisted());

        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["role"], "user");
        assert!(json.get("sequence").is_none());
        assert!(json.get("model").is_none());
        assert!(json.get("stream_started").is_none());
    }

    #[test]
    fn role_parses_subject_tokens() {
        for role in [Role::User, Role::Assistant, Role::System, Role::Tool] {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
        assert!("moderator".parse::<Role>().is_err());
    }

    #[test]
    fn send_request_defaults_to_non_streaming() {
        let request: SendMessageRequest = serde_json::from_str(r#"{"content":"hi"}"#).unwrap();
        assert!(!request.stream);
        assert!(request.model.is_none());
    }
}
