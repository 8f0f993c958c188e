//! Subject naming, publishing, and cursor-based replay over the log store.
//!
//! Every conversation owns two subject trees under the configured prefix:
//! `{prefix}.{tenant}.{conversation}.msg.{role}` for messages and
//! `{prefix}.{tenant}.{conversation}.event.{type}` for audit events. Replay
//! only ever reads the `msg` tree.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use shared::config::LogStoreConfig;
use shared::models::{ConversationEvent, Message, ValidationError, validation::is_subject_token};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::log_store::{DeliverPolicy, LogStore, LogStoreError, LogStoreResult};
use crate::services::errors::{RelayError, RelayResult};

/// One replay batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplayPage {
    /// Decoded messages in ascending sequence order.
    pub messages: Vec<Message>,
    /// Cursor to resume from. Advances past skipped records, and equals the
    /// requested cursor when nothing was fetched.
    pub last_sequence: u64,
    /// True when the fetch filled the whole batch, so more may follow.
    pub has_more: bool,
}

/// Maps conversations onto log subjects and reads them back in order.
#[derive(Clone)]
pub struct StreamManager {
    store: Arc<dyn LogStore>,
    prefix: String,
    fetch_wait: Duration,
}

impl std::fmt::Debug for StreamManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamManager")
            .field("backend", &self.store.backend())
            .field("prefix", &self.prefix)
            .field("fetch_wait", &self.fetch_wait)
            .finish()
    }
}

impl StreamManager {
    pub fn new(store: Arc<dyn LogStore>, config: &LogStoreConfig) -> Self {
        Self {
            store,
            prefix: config.subject_prefix.clone(),
            fetch_wait: config.fetch_wait(),
        }
    }

    /// Provisions the backing stream.
    pub async fn ensure_ready(&self) -> LogStoreResult<()> {
        self.store.ensure_stream().await
    }

    pub fn is_connected(&self) -> bool {
        self.store.is_connected()
    }

    fn conversation_root(&self, tenant_id: &str, conversation_id: Uuid) -> RelayResult<String> {
        if !is_subject_token(tenant_id) {
            return Err(ValidationError::InvalidTenantId("not a valid subject token").into());
        }
        Ok(format!("{}.{tenant_id}.{conversation_id}", self.prefix))
    }

    /// Subject a message with the given role is written to.
    pub fn message_subject(&self, message: &Message) -> RelayResult<String> {
        let root = self.conversation_root(&message.tenant_id, message.conversation_id)?;
        Ok(format!("{root}.msg.{}", message.role))
    }

    /// Subject an event of the given type is written to.
    pub fn event_subject(&self, event: &ConversationEvent) -> RelayResult<String> {
        let root = self.conversation_root(&event.tenant_id, event.conversation_id)?;
        Ok(format!("{root}.event.{}", event.event_type))
    }

    /// Filter selecting every message role in a conversation.
    pub fn message_filter(&self, tenant_id: &str, conversation_id: Uuid) -> RelayResult<String> {
        Ok(format!("{}.msg.>", self.conversation_root(tenant_id, conversation_id)?))
    }

    /// Filter selecting messages and events of a conversation.
    pub fn conversation_filter(
        &self,
        tenant_id: &str,
        conversation_id: Uuid,
    ) -> RelayResult<String> {
        Ok(format!("{}.>", self.conversation_root(tenant_id, conversation_id)?))
    }

    /// Publishes `message` and stamps it with the committed sequence.
    #[instrument(
        name = "stream.publish_message",
        skip(self, message),
        fields(conversation_id = %message.conversation_id, role = %message.role),
        err
    )]
    pub async fn publish_message(&self, message: &mut Message) -> RelayResult<u64> {
        let subject = self.message_subject(message)?;
        let payload = serde_json::to_vec(&*message)
            .map_err(|err| RelayError::Publish(LogStoreError::Publish(err.to_string())))?;

        let sequence = self.store.publish(&subject, payload).await.map_err(|err| {
            counter!("relay_publish_failures_total").increment(1);
            RelayError::Publish(err)
        })?;

        message.sequence = Some(sequence);
        counter!(
            "relay_messages_total",
            "tenant" => message.tenant_id.clone(),
            "role" => message.role.as_str()
        )
        .increment(1);
        debug!(subject, sequence, "message published");
        Ok(sequence)
    }

    /// Publishes `event` and stamps it with the committed sequence.
    #[instrument(
        name = "stream.publish_event",
        skip(self, event),
        fields(conversation_id = %event.conversation_id, event_type = %event.event_type),
        err
    )]
    pub async fn publish_event(&self, event: &mut ConversationEvent) -> RelayResult<u64> {
        let subject = self.event_subject(event)?;
        let payload = serde_json::to_vec(&*event)
            .map_err(|err| RelayError::Publish(LogStoreError::Publish(err.to_string())))?;

        let sequence = self.store.publish(&subject, payload).await.map_err(|err| {
            counter!("relay_publish_failures_total").increment(1);
            RelayError::Publish(err)
        })?;

        event.sequence = Some(sequence);
        counter!("relay_events_total", "type" => event.event_type.as_str()).increment(1);
        debug!(subject, sequence, "event published");
        Ok(sequence)
    }

    /// Reads up to `limit` messages recorded strictly after `after_sequence`.
    ///
    /// Records that fail to decode are skipped, but still move the cursor so
    /// the caller never re-reads them.
    #[instrument(name = "stream.replay", skip(self), err)]
    pub async fn replay(
        &self,
        tenant_id: &str,
        conversation_id: Uuid,
        after_sequence: u64,
        limit: usize,
    ) -> RelayResult<ReplayPage> {
        let filter = self.message_filter(tenant_id, conversation_id)?;
        let Some(policy) = DeliverPolicy::after(after_sequence).filter(|_| limit > 0) else {
            return Ok(ReplayPage {
                last_sequence: after_sequence,
                ..ReplayPage::default()
            });
        };

        let mut consumer = self
            .store
            .create_consumer(&filter, policy)
            .await
            .map_err(RelayError::Replay)?;
        let batch = consumer
            .fetch(limit, self.fetch_wait)
            .await
            .map_err(RelayError::Replay)?;
        counter!("relay_replay_batches_total").increment(1);

        let fetched = batch.records.len();
        if let Some(err) = batch.terminal_error.clone() {
            if fetched == 0 {
                return Err(RelayError::Replay(err));
            }
            warn!(error = %err, fetched, "replay batch cut short");
        }

        let mut page = ReplayPage {
            messages: Vec::with_capacity(fetched),
            last_sequence: after_sequence,
            has_more: fetched == limit || (batch.terminal_error.is_some() && fetched > 0),
        };

        for record in batch.records {
            page.last_sequence = page.last_sequence.max(record.sequence);
            match serde_json::from_slice::<Message>(&record.payload) {
                Ok(mut message) => {
                    message.sequence = Some(record.sequence);
                    page.messages.push(message);
                }
                Err(err) => {
                    counter!("relay_replay_records_skipped_total").increment(1);
                    warn!(
                        sequence = record.sequence,
                        subject = %record.subject,
                        error = %err,
                        "skipping undecodable record"
                    );
                }
            }
        }

        debug!(
            returned = page.messages.len(),
            last_sequence = page.last_sequence,
            has_more = page.has_more,
            "replay page"
        );
        Ok(page)
    }

    /// The most recent `window` messages up to and including `through`,
    /// oldest first.
    ///
    /// Sequences are store-wide, so the tail of one conversation cannot be
    /// located without scanning it: this costs one fetch per `batch_size`
    /// messages of history. The scan stops as soon as `through` is reached
    /// instead of waiting out an empty tail fetch.
    pub async fn recent_history(
        &self,
        tenant_id: &str,
        conversation_id: Uuid,
        window: usize,
        batch_size: usize,
        through: u64,
    ) -> RelayResult<Vec<Message>> {
        let mut history = VecDeque::with_capacity(window);
        if window == 0 {
            return Ok(Vec::new());
        }

        let mut cursor = 0;
        loop {
            let page = self
                .replay(tenant_id, conversation_id, cursor, batch_size.max(1))
                .await?;
            let upto = page
                .messages
                .into_iter()
                .take_while(|message| message.sequence.is_some_and(|seq| seq <= through));
            for message in upto {
                if history.len() == window {
                    history.pop_front();
                }
                history.push_back(message);
            }
            if !page.has_more || page.last_sequence >= through || page.last_sequence == cursor {
                break;
            }
            cursor = page.last_sequence;
        }

        Ok(history.into())
    }
}
