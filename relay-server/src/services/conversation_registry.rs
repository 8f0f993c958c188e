//! Volatile, tenant-scoped catalog of conversation metadata.
//!
//! The log store stays authoritative for message history; this registry only
//! answers existence and ownership questions and keeps last-message
//! bookkeeping for listings.

use std::collections::HashMap;

use chrono::Utc;
use shared::models::{
    Conversation, CreateConversationRequest, Limits, ListConversationsResponse, Message,
    UpdateConversationRequest,
};
use tokio::sync::RwLock;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::services::errors::{RelayError, RelayResult};

#[derive(Debug, Default)]
struct TenantCatalog {
    by_id: HashMap<Uuid, Conversation>,
    // Creation order, used for deterministic listing.
    order: Vec<Uuid>,
}

impl TenantCatalog {
    fn live_mut(&mut self, id: Uuid) -> RelayResult<&mut Conversation> {
        self.by_id
            .get_mut(&id)
            .filter(|conversation| !conversation.deleted)
            .ok_or(RelayError::NotFound)
    }
}

/// Tenant-scoped conversation catalog, held in memory.
#[derive(Debug, Default)]
pub struct ConversationRegistry {
    limits: Limits,
    tenants: RwLock<HashMap<String, TenantCatalog>>,
}

impl ConversationRegistry {
    pub fn new(limits: Limits) -> Self {
        Self {
            limits,
            tenants: RwLock::new(HashMap::new()),
        }
    }

    #[instrument(name = "registry.create", skip(self, request), err)]
    pub async fn create(
        &self,
        tenant_id: &str,
        owner_user_id: &str,
        request: CreateConversationRequest,
    ) -> RelayResult<Conversation> {
        self.limits.validate_tenant_id(tenant_id)?;
        self.limits.validate_title(&request.title)?;

        let now = Utc::now();
        let conversation = Conversation {
            id: Uuid::now_v7(),
            tenant_id: tenant_id.to_string(),
            owner_user_id: owner_user_id.to_string(),
            title: request.title,
            created_at: now,
            updated_at: now,
            metadata: request.metadata,
            message_count: 0,
            last_message: None,
            deleted: false,
        };

        let mut tenants = self.tenants.write().await;
        let catalog = tenants.entry(tenant_id.to_string()).or_default();
        catalog.order.push(conversation.id);
        catalog.by_id.insert(conversation.id, conversation.clone());

        info!(conversation_id = %conversation.id, "conversation created");
        Ok(conversation)
    }

    /// Returns the live conversation, or `NotFound` when it is missing,
    /// deleted, or owned by another tenant.
    pub async fn get(&self, tenant_id: &str, id: Uuid) -> RelayResult<Conversation> {
        let tenants = self.tenants.read().await;
        tenants
            .get(tenant_id)
            .and_then(|catalog| catalog.by_id.get(&id))
            .filter(|conversation| !conversation.deleted)
            .cloned()
            .ok_or(RelayError::NotFound)
    }

    #[instrument(name = "registry.update", skip(self, request), err)]
    pub async fn update(
        &self,
        tenant_id: &str,
        id: Uuid,
        request: UpdateConversationRequest,
    ) -> RelayResult<Conversation> {
        if let Some(title) = request.title.as_deref() {
            self.limits.validate_title(title)?;
        }

        let mut tenants = self.tenants.write().await;
        let conversation = tenants
            .get_mut(tenant_id)
            .ok_or(RelayError::NotFound)?
            .live_mut(id)?;

        if let Some(title) = request.title.filter(|title| !title.is_empty()) {
            conversation.title = title;
        }
        if let Some(metadata) = request.metadata {
            conversation.metadata = metadata;
        }
        conversation.updated_at = Utc::now();
        Ok(conversation.clone())
    }

    /// Soft-deletes a conversation. Deleting twice reports `NotFound`.
    #[instrument(name = "registry.delete", skip(self), err)]
    pub async fn delete(&self, tenant_id: &str, id: Uuid) -> RelayResult<()> {
        let mut tenants = self.tenants.write().await;
        let conversation = tenants
            .get_mut(tenant_id)
            .ok_or(RelayError::NotFound)?
            .live_mut(id)?;
        conversation.deleted = true;
        conversation.updated_at = Utc::now();
        info!(conversation_id = %id, "conversation deleted");
        Ok(())
    }

    /// Pages through the tenant's live conversations in creation order.
    pub async fn list(
        &self,
        tenant_id: &str,
        offset: usize,
        limit: usize,
    ) -> ListConversationsResponse {
        let tenants = self.tenants.read().await;
        let live: Vec<&Conversation> = tenants
            .get(tenant_id)
            .map(|catalog| {
                catalog
                    .order
                    .iter()
                    .filter_map(|id| catalog.by_id.get(id))
                    .filter(|conversation| !conversation.deleted)
                    .collect()
            })
            .unwrap_or_default();

        let total = live.len();
        let conversations: Vec<Conversation> = live
            .into_iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect();
        let has_more = offset.saturating_add(conversations.len()) < total;

        ListConversationsResponse {
            conversations,
            total,
            has_more,
        }
    }

    /// Records a freshly published message.
    pub async fn update_last_message(
        &self,
        tenant_id: &str,
        id: Uuid,
        message: &Message,
    ) -> RelayResult<()> {
        let mut tenants = self.tenants.write().await;
        let conversation = tenants
            .get_mut(tenant_id)
            .ok_or(RelayError::NotFound)?
            .live_mut(id)?;
        conversation.message_count += 1;
        conversation.last_message = Some(message.clone());
        conversation.updated_at = Utc::now();
        Ok(())
    }
}
