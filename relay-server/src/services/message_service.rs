//! Message operations invoked by the HTTP layer.
//!
//! Sends publish the user message before anything else happens, so a reply
//! that later fails still leaves the question in the log.

use std::sync::Arc;

use shared::models::{Limits, ListMessagesResponse, Message, Role, TokenPayload};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::services::conversation_registry::ConversationRegistry;
use crate::services::errors::{RelayError, RelayResult};
use crate::services::response_assembler::{GenerationRequest, ResponseAssembler};
use crate::services::stream_manager::StreamManager;

/// A user message paired with the assistant reply it produced.
#[derive(Debug, Clone, PartialEq)]
pub struct Exchange {
    pub user: Message,
    pub assistant: Message,
}

/// Sends and lists messages, optionally generating a reply.
#[derive(Debug)]
pub struct MessageService {
    registry: Arc<ConversationRegistry>,
    streams: StreamManager,
    assembler: Option<ResponseAssembler>,
    limits: Limits,
    history_window: usize,
    replay_batch_size: usize,
}

impl MessageService {
    pub fn new(
        registry: Arc<ConversationRegistry>,
        streams: StreamManager,
        assembler: Option<ResponseAssembler>,
        limits: Limits,
        history_window: usize,
        replay_batch_size: usize,
    ) -> Self {
        Self {
            registry,
            streams,
            assembler,
            limits,
            history_window,
            replay_batch_size,
        }
    }

    /// Whether replies can be generated.
    pub fn can_generate(&self) -> bool {
        self.assembler.is_some()
    }

    /// Publishes a user message and returns it with its sequence set.
    #[instrument(name = "messages.send", skip(self, content), err)]
    pub async fn send(
        &self,
        tenant_id: &str,
        conversation_id: Uuid,
        content: String,
    ) -> RelayResult<Message> {
        self.limits.validate_content(&content)?;
        self.registry.get(tenant_id, conversation_id).await?;

        let mut message = Message::new(conversation_id, tenant_id, Role::User, content);
        self.streams.publish_message(&mut message).await?;

        if let Err(err) = self
            .registry
            .update_last_message(tenant_id, conversation_id, &message)
            .await
        {
            warn!(error = %err, "registry not updated after user publish");
        }
        Ok(message)
    }

    /// Publishes a user message, then generates and persists the reply while
    /// forwarding tokens to `tokens`.
    #[instrument(name = "messages.send_with_stream", skip(self, content, tokens, cancel), err)]
    pub async fn send_with_stream(
        &self,
        tenant_id: &str,
        conversation_id: Uuid,
        content: String,
        model: Option<String>,
        tokens: mpsc::Sender<TokenPayload>,
        cancel: CancellationToken,
    ) -> RelayResult<Exchange> {
        let assembler = self
            .assembler
            .as_ref()
            .ok_or(RelayError::Unavailable("no completion provider configured"))?;

        let user = self.send(tenant_id, conversation_id, content).await?;
        let history = self
            .streams
            .recent_history(
                tenant_id,
                conversation_id,
                self.history_window,
                self.replay_batch_size,
                user.sequence.unwrap_or(u64::MAX),
            )
            .await?;

        let assistant = assembler
            .generate_and_persist(
                GenerationRequest {
                    tenant_id: tenant_id.to_string(),
                    conversation_id,
                    history,
                    model,
                },
                Some(tokens),
                cancel,
            )
            .await?;

        Ok(Exchange { user, assistant })
    }

    /// One page of history after `after_sequence`.
    #[instrument(name = "messages.list", skip(self), err)]
    pub async fn list_messages(
        &self,
        tenant_id: &str,
        conversation_id: Uuid,
        after_sequence: u64,
        limit: Option<usize>,
    ) -> RelayResult<ListMessagesResponse> {
        let limit = self.limits.message_page(limit)?;
        self.registry.get(tenant_id, conversation_id).await?;

        let page = self
            .streams
            .replay(tenant_id, conversation_id, after_sequence, limit)
            .await?;

        Ok(ListMessagesResponse {
            messages: page.messages,
            has_more: page.has_more,
            last_sequence: page.last_sequence,
            stream_active: false,
        })
    }
}
