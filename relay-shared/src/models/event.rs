use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter, Result as FmtResult};
use uuid::Uuid;

/// Kind of side-channel signal recorded next to the message history.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Generation failed.
    Error,
    /// Generation was cancelled by the client.
    Cancel,
    /// A rate limit rejected the request.
    RateLimit,
    /// An operation exceeded its deadline.
    Timeout,
}

impl EventType {
    /// Subject token used for this event type in the log.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Error => "error",
            EventType::Cancel => "cancel",
            EventType::RateLimit => "rate_limit",
            EventType::Timeout => "timeout",
        }
    }
}

impl Display for EventType {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

/// An audit event published to the conversation log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationEvent {
    /// Unique identifier.
    pub id: Uuid,
    /// Conversation the event refers to.
    pub conversation_id: Uuid,
    /// Owning tenant.
    pub tenant_id: String,
    /// Event kind.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Human-readable cause.
    pub reason: String,
    /// Free-form context.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Log sequence once published.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
}

impl ConversationEvent {
    /// Builds an unpublished event.
    #[must_use]
    pub fn new(
        conversation_id: Uuid,
        tenant_id: impl Into<String>,
        event_type: EventType,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            conversation_id,
            tenant_id: tenant_id.into(),
            event_type,
            reason: reason.into(),
            metadata: BTreeMap::new(),
            created_at: Utc::now(),
            sequence: None,
        }
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}
