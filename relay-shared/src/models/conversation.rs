use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::message::Message;

/// Catalog entry for a conversation, scoped to a single tenant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conversation {
    /// Unique identifier.
    pub id: Uuid,
    /// Owning tenant; never changes after creation.
    pub tenant_id: String,
    /// User that created the conversation.
    pub owner_user_id: String,
    /// Display title.
    pub title: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
    /// Caller-defined labels.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    /// Number of messages published to this conversation.
    #[serde(default)]
    pub message_count: u64,
    /// Most recently published message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<Message>,
    /// Soft-delete marker.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
}

/// Body of `POST /conversations`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateConversationRequest {
    /// Display title; may be empty.
    #[serde(default)]
    pub title: String,
    /// Optional labels.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Body of `PUT /conversations/{id}`.
///
/// An empty or missing title leaves the title unchanged; a present metadata
/// map replaces the stored one.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateConversationRequest {
    /// New title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Replacement labels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, String>>,
}

/// One page of a tenant's conversations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListConversationsResponse {
    /// Conversations in creation order.
    pub conversations: Vec<Conversation>,
    /// Count of the tenant's live conversations.
    pub total: usize,
    /// Whether entries exist past this page.
    pub has_more: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_conversation_omits_deleted_flag() {
        let now = Utc::now();
        let conversation = Conversation {
            id: Uuid::now_v7(),
            tenant_id: "t1".into(),
            owner_user_id: "u1".into(),
            title: "demo".into(),
            created_at: now,
            updated_at: now,
            metadata: BTreeMap::new(),
            message_count: 0,
            last_message: None,
            deleted: false,
        };

        let json = serde_json::to_value(&conversation).unwrap();
        assert!(json.get("deleted").is_none());
        assert!(json.get("last_message").is_none());
        assert_eq!(json["message_count"], 0);
    }

    #[test]
    fn update_request_distinguishes_absent_metadata() {
        let request: UpdateConversationRequest =
            serde_json::from_str(r#"{"title":"renamed"}"#).unwrap();
        assert_eq!(request.title.as_deref(), Some("renamed"));
        assert!(request.metadata.is_none());
    }
}
