//! Drives a completion provider and persists the assistant reply only when
//! generation finishes cleanly.
//!
//! Tokens are pushed into a bounded channel as they arrive. Closing the
//! receiving side, or firing the cancellation token, stops generation and the
//! partial content is dropped. Every failure is recorded as an `error` event
//! on the conversation log instead of a message.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures_util::StreamExt;
use metrics::{counter, histogram};
use shared::llms::{CompletionProvider, CompletionRequest, CompletionSummary, LLMError, StreamChunk};
use shared::models::{ConversationEvent, EventType, Message, Role, TokenPayload};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::services::conversation_registry::ConversationRegistry;
use crate::services::errors::{RelayError, RelayResult};
use crate::services::stream_manager::StreamManager;

/// Input for one generation attempt.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Owning tenant.
    pub tenant_id: String,
    /// Conversation the reply belongs to.
    pub conversation_id: Uuid,
    /// Prior messages, oldest first.
    pub history: Vec<Message>,
    /// Model override; the configured default applies when `None`.
    pub model: Option<String>,
}

/// Turns a provider stream into exactly one persisted reply, or none.
pub struct ResponseAssembler {
    provider: Arc<dyn CompletionProvider>,
    streams: StreamManager,
    registry: Arc<ConversationRegistry>,
    default_model: Option<String>,
    max_tokens: u32,
}

impl std::fmt::Debug for ResponseAssembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseAssembler")
            .field("provider", &self.provider.name())
            .field("default_model", &self.default_model)
            .field("max_tokens", &self.max_tokens)
            .finish_non_exhaustive()
    }
}

enum Outcome {
    Finished(CompletionSummary),
    Failed(RelayError),
}

impl ResponseAssembler {
    pub fn new(
        provider: Arc<dyn CompletionProvider>,
        streams: StreamManager,
        registry: Arc<ConversationRegistry>,
        default_model: Option<String>,
        max_tokens: u32,
    ) -> Self {
        Self {
            provider,
            streams,
            registry,
            default_model,
            max_tokens,
        }
    }

    fn resolve_model(&self, requested: Option<String>) -> String {
        requested
            .filter(|model| !model.is_empty())
            .or_else(|| self.default_model.clone())
            .unwrap_or_else(|| self.provider.default_model().to_string())
    }

    /// Generates a reply, forwarding each token to `tokens` before reading
    /// the next one, and publishes the assistant message on success.
    ///
    /// # Errors
    /// `Generation` when the provider fails or the attempt is cancelled,
    /// `Publish` when the finished reply cannot be written.
    #[instrument(
        name = "assembler.generate",
        skip(self, request, tokens, cancel),
        fields(conversation_id = %request.conversation_id, provider = self.provider.name()),
        err
    )]
    pub async fn generate_and_persist(
        &self,
        request: GenerationRequest,
        tokens: Option<mpsc::Sender<TokenPayload>>,
        cancel: CancellationToken,
    ) -> RelayResult<Message> {
        let model = self.resolve_model(request.model.clone());
        let started_at = Utc::now();
        let clock = Instant::now();

        let completion = CompletionRequest::from_history(
            &request.history,
            Some(model.clone()),
            self.max_tokens,
        );

        let mut content = String::new();
        let mut emitted = 0usize;
        let outcome = match self
            .provider
            .stream_completion(completion, cancel.child_token())
            .await
        {
            Err(err) => Outcome::Failed(map_provider_error(err)),
            Ok(mut stream) => loop {
                let next = tokio::select! {
                    biased;
                    () = cancel.cancelled() => break Outcome::Failed(RelayError::cancelled()),
                    next = stream.next() => next,
                };

                match next {
                    Some(Ok(StreamChunk::Token(token))) => {
                        if let Some(sender) = tokens.as_ref() {
                            let payload = TokenPayload {
                                token: token.clone(),
                                index: emitted,
                            };
                            let delivered = tokio::select! {
                                biased;
                                () = cancel.cancelled() => false,
                                sent = sender.send(payload) => sent.is_ok(),
                            };
                            if !delivered {
                                break Outcome::Failed(RelayError::cancelled());
                            }
                        }
                        content.push_str(&token);
                        emitted += 1;
                    }
                    Some(Ok(StreamChunk::Finished(summary))) => break Outcome::Finished(summary),
                    Some(Err(err)) => break Outcome::Failed(map_provider_error(err)),
                    None => {
                        break Outcome::Failed(RelayError::generation(
                            "provider stream ended before completion",
                        ));
                    }
                }
            },
        };

        let elapsed = clock.elapsed();
        match outcome {
            Outcome::Finished(summary) => {
                let mut message =
                    Message::new(request.conversation_id, &request.tenant_id, Role::Assistant, content);
                message.model = Some(if summary.model.is_empty() {
                    model.clone()
                } else {
                    summary.model.clone()
                });
                message.tokens_in = Some(summary.tokens_in);
                message.tokens_out = Some(summary.tokens_out);
                message.latency_ms = Some(u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX));
                message.stop_reason = summary.stop_reason;
                message.stream_started = Some(started_at);
                message.stream_ended = Some(Utc::now());

                self.streams.publish_message(&mut message).await?;
                if let Err(err) = self
                    .registry
                    .update_last_message(&request.tenant_id, request.conversation_id, &message)
                    .await
                {
                    warn!(error = %err, "registry not updated after assistant publish");
                }

                counter!("relay_generation_total", "model" => model.clone(), "status" => "success")
                    .increment(1);
                histogram!("relay_generation_latency_seconds").record(elapsed.as_secs_f64());
                counter!("relay_generation_tokens_total", "direction" => "input")
                    .increment(u64::from(summary.tokens_in));
                counter!("relay_generation_tokens_total", "direction" => "output")
                    .increment(u64::from(summary.tokens_out));
                info!(sequence = ?message.sequence, tokens = emitted, "assistant reply persisted");
                Ok(message)
            }
            Outcome::Failed(err) => {
                let status = if err.is_cancelled() { "cancelled" } else { "error" };
                counter!("relay_generation_total", "model" => model.clone(), "status" => status)
                    .increment(1);
                warn!(error = %err, tokens = emitted, "generation abandoned");

                let mut event = ConversationEvent::new(
                    request.conversation_id,
                    &request.tenant_id,
                    EventType::Error,
                    err.to_string(),
                )
                .with_metadata("cancelled", err.is_cancelled())
                .with_metadata("tokens_emitted", emitted)
                .with_metadata("model", model);
                if let Err(publish_err) = self.streams.publish_event(&mut event).await {
                    warn!(error = %publish_err, "failed to record generation error event");
                }
                Err(err)
            }
        }
    }
}

fn map_provider_error(err: LLMError) -> RelayError {
    if err.is_cancelled() {
        RelayError::cancelled()
    } else {
        RelayError::generation(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_store::{MemoryLogStore, subject_matches};
    use shared::config::LogStoreConfig;
    use shared::llms::ScriptedProvider;
    use shared::models::CreateConversationRequest;
    use std::time::Duration;

    struct Fixture {
        assembler: ResponseAssembler,
        store: MemoryLogStore,
        streams: StreamManager,
        conversation_id: Uuid,
    }

    async fn fixture(provider: ScriptedProvider) -> Fixture {
        let store = MemoryLogStore::new();
        let config = LogStoreConfig {
            fetch_wait_ms: 10,
            ..LogStoreConfig::default()
        };
        let streams = StreamManager::new(Arc::new(store.clone()), &config);
        let registry = Arc::new(ConversationRegistry::default());
        let conversation_id = registry
            .create("t1", "u1", CreateConversationRequest::default())
            .await
            .unwrap()
            .id;
        let assembler = ResponseAssembler::new(
            Arc::new(provider),
            streams.clone(),
            registry,
            None,
            256,
        );
        Fixture {
            assembler,
            store,
            streams,
            conversation_id,
        }
    }

    fn request(conversation_id: Uuid) -> GenerationRequest {
        GenerationRequest {
            tenant_id: "t1".into(),
            conversation_id,
            history: vec![Message::new(conversation_id, "t1", Role::User, "hello")],
            model: None,
        }
    }

    async fn count(store: &MemoryLogStore, filter: &str) -> usize {
        store
            .records()
            .await
            .iter()
            .filter(|record| subject_matches(filter, &record.subject))
            .count()
    }

    #[tokio::test]
    async fn success_persists_exact_concatenation() {
        let fx = fixture(ScriptedProvider::new(["Hi", " there"])).await;
        let (tx, mut rx) = mpsc::channel(8);

        let message = fx
            .assembler
            .generate_and_persist(request(fx.conversation_id), Some(tx), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(message.content, "Hi there");
        assert_eq!(message.role, Role::Assistant);
        assert!(message.is_persisted());
        assert!(message.stream_started.is_some() && message.stream_ended.is_some());
        assert_eq!(message.model.as_deref(), Some("scripted"));

        let mut forwarded = Vec::new();
        while let Ok(token) = rx.try_recv() {
            forwarded.push((token.token, token.index));
        }
        assert_eq!(forwarded, [("Hi".to_string(), 0), (" there".to_string(), 1)]);

        let page = fx.streams.replay("t1", fx.conversation_id, 0, 10).await.unwrap();
        assert_eq!(page.messages, [message]);
    }

    #[tokio::test]
    async fn failure_after_tokens_records_event_only() {
        let fx = fixture(ScriptedProvider::new(["Hi", " there"]).failing_after(1, "boom")).await;
        let (tx, _rx) = mpsc::channel(8);

        let err = fx
            .assembler
            .generate_and_persist(request(fx.conversation_id), Some(tx), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Generation { cancelled: false, .. }));

        let root = format!("conv.t1.{}", fx.conversation_id);
        assert_eq!(count(&fx.store, &format!("{root}.msg.>")).await, 0);
        assert_eq!(count(&fx.store, &format!("{root}.event.error")).await, 1);
    }

    #[tokio::test]
    async fn cancellation_discards_partial_reply() {
        let fx = fixture(
            ScriptedProvider::new(["a", "b", "c"]).with_delay(Duration::from_millis(20)),
        )
        .await;
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(8);

        let trigger = cancel.clone();
        tokio::spawn(async move {
            let _ = rx.recv().await;
            trigger.cancel();
        });

        let err = fx
            .assembler
            .generate_and_persist(request(fx.conversation_id), Some(tx), cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());

        let records = fx.store.records().await;
        assert_eq!(records.len(), 1);
        let event: ConversationEvent = serde_json::from_slice(&records[0].payload).unwrap();
        assert_eq!(event.event_type, EventType::Error);
        assert_eq!(event.metadata["cancelled"], serde_json::Value::Bool(true));
    }

    #[tokio::test]
    async fn dropped_receiver_counts_as_cancellation() {
        let fx = fixture(ScriptedProvider::new(["a", "b"])).await;
        let (tx, rx) = mpsc::channel(8);
        drop(rx);

        let err = fx
            .assembler
            .generate_and_persist(request(fx.conversation_id), Some(tx), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        let root = format!("conv.t1.{}", fx.conversation_id);
        assert_eq!(count(&fx.store, &format!("{root}.msg.>")).await, 0);
    }

    #[tokio::test]
    async fn publish_failure_surfaces_without_a_message() {
        let fx = fixture(ScriptedProvider::new(["ok"])).await;
        fx.store.fail_next_publishes(1);

        let err = fx
            .assembler
            .generate_and_persist(request(fx.conversation_id), None, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Publish(_)));
        assert!(fx.store.records().await.is_empty());
    }

    #[tokio::test]
    async fn retry_after_failure_is_independent() {
        let fx = fixture(ScriptedProvider::new(["x"]).failing_after(0, "down")).await;
        assert!(
            fx.assembler
                .generate_and_persist(request(fx.conversation_id), None, CancellationToken::new())
                .await
                .is_err()
        );

        let retry = ResponseAssembler::new(
            Arc::new(ScriptedProvider::new(["fine"])),
            fx.streams.clone(),
            Arc::new(ConversationRegistry::default()),
            Some("configured".into()),
            256,
        );
        let message = retry
            .generate_and_persist(request(fx.conversation_id), None, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(message.content, "fine");
        assert_eq!(message.model.as_deref(), Some("configured"));
    }
}
