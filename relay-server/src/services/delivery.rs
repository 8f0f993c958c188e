//! Per-connection delivery of conversation history and live generation.
//!
//! A replay connection walks `Replaying -> Live -> Closed`: it pages through
//! the log from the client's cursor, marks the boundary with
//! `replay_complete`, then keeps the connection warm with heartbeats. A
//! send-and-stream connection walks `Generating -> Closed`, forwarding tokens
//! as the reply is produced.
//!
//! Events are written into a bounded channel owned by the transport. A
//! dropped receiver is how a disconnect shows up here.

use std::time::Duration;

use chrono::Utc;
use metrics::gauge;
use shared::config::StreamConfig;
use shared::models::{
    ConnectedPayload, DeliveryEvent, DonePayload, ErrorPayload, HeartbeatPayload,
    MessageCompletePayload, ReplayCompletePayload, TokenPayload,
    delivery::{REPLAY_ERROR, STREAM_ERROR},
};
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::services::errors::{RelayError, RelayResult};
use crate::services::message_service::MessageService;
use crate::services::stream_manager::StreamManager;

/// Lifecycle of one client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    /// Sending history after the resume cursor.
    Replaying,
    /// Caught up; heartbeats and optional tailing.
    Live,
    /// Streaming a reply as it is produced.
    Generating,
    /// Terminal.
    Closed,
}

/// Write half of a client connection.
#[derive(Debug, Clone)]
pub struct DeliverySink {
    events: mpsc::Sender<DeliveryEvent>,
    cancel: CancellationToken,
}

impl DeliverySink {
    /// Creates a sink and the receiver the transport drains.
    pub fn channel(
        capacity: usize,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Receiver<DeliveryEvent>) {
        let (events, receiver) = mpsc::channel(capacity.max(1));
        (Self { events, cancel }, receiver)
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.events.is_closed()
    }

    /// Resolves once the client is gone or the connection was cancelled.
    pub async fn closed(&self) {
        tokio::select! {
            () = self.cancel.cancelled() => {}
            () = self.events.closed() => {}
        }
    }

    /// Writes one event, failing with `Transport` once the client is gone.
    pub async fn emit(&self, event: DeliveryEvent) -> RelayResult<()> {
        if self.is_closed() {
            return Err(RelayError::Transport);
        }
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(RelayError::Transport),
            sent = self.events.send(event) => sent.map_err(|_| RelayError::Transport),
        }
    }
}

/// Tracks open connections in `relay_sse_connections`.
#[derive(Debug)]
struct ConnectionGauge;

impl ConnectionGauge {
    fn open() -> Self {
        gauge!("relay_sse_connections").increment(1.0);
        Self
    }
}

impl Drop for ConnectionGauge {
    fn drop(&mut self) {
        gauge!("relay_sse_connections").decrement(1.0);
    }
}

/// Timing and paging knobs for delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliverySettings {
    /// Interval between heartbeats once live.
    pub heartbeat: Duration,
    /// Records fetched per replay page.
    pub batch_size: usize,
    /// Poll interval for new records after replay; `None` disables tailing.
    pub live_tail: Option<Duration>,
    /// Events buffered per connection before the writer waits.
    pub channel_capacity: usize,
}

impl From<&StreamConfig> for DeliverySettings {
    fn from(config: &StreamConfig) -> Self {
        Self {
            heartbeat: config.heartbeat_interval(),
            batch_size: config.replay_batch_size,
            live_tail: config.live_tail.then(|| config.live_tail_interval()),
            channel_capacity: config.channel_capacity,
        }
    }
}

/// Drives client connections through replay, live, and generation.
#[derive(Debug, Clone)]
pub struct DeliveryController {
    streams: StreamManager,
    settings: DeliverySettings,
}

impl DeliveryController {
    pub fn new(streams: StreamManager, settings: DeliverySettings) -> Self {
        Self { streams, settings }
    }

    pub fn settings(&self) -> DeliverySettings {
        self.settings
    }

    /// Replays history after `cursor`, then holds the connection open until
    /// the client leaves. Returns the terminal state.
    pub async fn replay_and_follow(
        &self,
        tenant_id: &str,
        conversation_id: Uuid,
        cursor: u64,
        sink: DeliverySink,
    ) -> DeliveryState {
        let _gauge = ConnectionGauge::open();
        info!(%conversation_id, cursor, "stream connected");

        let connected = DeliveryEvent::Connected(ConnectedPayload { conversation_id });
        if sink.emit(connected).await.is_err() {
            return DeliveryState::Closed;
        }

        let mut state = DeliveryState::Replaying;
        let mut cursor = cursor;
        let mut replayed = 0u64;
        match self
            .drain_from(tenant_id, conversation_id, &mut cursor, &mut replayed, &sink)
            .await
        {
            Ok(()) => {}
            Err(RelayError::Transport) => return DeliveryState::Closed,
            Err(err) => {
                warn!(%conversation_id, error = %err, "replay failed");
                let _ = sink
                    .emit(DeliveryEvent::Error(ErrorPayload::new(
                        REPLAY_ERROR,
                        "Failed to replay messages",
                    )))
                    .await;
                return DeliveryState::Closed;
            }
        }

        let complete = DeliveryEvent::ReplayComplete(ReplayCompletePayload {
            last_sequence: cursor,
            message_count: replayed,
        });
        if sink.emit(complete).await.is_err() {
            return DeliveryState::Closed;
        }
        info!(%conversation_id, last_sequence = cursor, replayed, "replay complete");

        state = transition(state, DeliveryState::Live);
        let period = self.settings.heartbeat;
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut tail = self.settings.live_tail.map(|period| {
            let mut tail = interval_at(Instant::now() + period, period);
            tail.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tail
        });

        loop {
            tokio::select! {
                biased;
                () = sink.closed() => break,
                _ = heartbeat.tick() => {
                    let beat = DeliveryEvent::Heartbeat(HeartbeatPayload { timestamp: Utc::now() });
                    if sink.emit(beat).await.is_err() {
                        break;
                    }
                }
                () = next_tick(tail.as_mut()) => {
                    let mut delivered = 0;
                    match self
                        .drain_from(tenant_id, conversation_id, &mut cursor, &mut delivered, &sink)
                        .await
                    {
                        Ok(()) => {
                            if delivered > 0 {
                                debug!(%conversation_id, delivered, cursor, "live tail delivered");
                            }
                        }
                        Err(RelayError::Transport) => break,
                        Err(err) => {
                            warn!(%conversation_id, error = %err, "live tail failed");
                            let _ = sink
                                .emit(DeliveryEvent::Error(ErrorPayload::new(
                                    REPLAY_ERROR,
                                    "Failed to read new messages",
                                )))
                                .await;
                            break;
                        }
                    }
                }
            }
        }

        info!(%conversation_id, "stream disconnected");
        transition(state, DeliveryState::Closed)
    }

    /// Pages through the log after `cursor`, emitting each message and
    /// advancing `cursor` past everything fetched.
    async fn drain_from(
        &self,
        tenant_id: &str,
        conversation_id: Uuid,
        cursor: &mut u64,
        delivered: &mut u64,
        sink: &DeliverySink,
    ) -> RelayResult<()> {
        loop {
            let page = tokio::select! {
                biased;
                () = sink.closed() => return Err(RelayError::Transport),
                page = self.streams.replay(tenant_id, conversation_id, *cursor, self.settings.batch_size) => page?,
            };

            for message in page.messages {
                if sink.is_closed() {
                    return Err(RelayError::Transport);
                }
                let sequence = message.sequence.unwrap_or_default();
                sink.emit(DeliveryEvent::Message(message)).await?;
                *cursor = (*cursor).max(sequence);
                *delivered += 1;
            }
            *cursor = (*cursor).max(page.last_sequence);

            if !page.has_more {
                return Ok(());
            }
        }
    }

    /// Sends a user message and streams the generated reply.
    pub async fn generate(
        &self,
        messages: &MessageService,
        tenant_id: &str,
        conversation_id: Uuid,
        content: String,
        model: Option<String>,
        sink: DeliverySink,
    ) -> DeliveryState {
        let _gauge = ConnectionGauge::open();
        let state = DeliveryState::Generating;
        let cancel = sink.cancel.child_token();
        let (token_tx, mut token_rx) =
            mpsc::channel::<TokenPayload>(self.settings.channel_capacity.max(1));

        let generation = messages.send_with_stream(
            tenant_id,
            conversation_id,
            content,
            model,
            token_tx,
            cancel.clone(),
        );
        tokio::pin!(generation);

        let mut client_gone = false;
        let result = loop {
            tokio::select! {
                biased;
                result = &mut generation => break result,
                () = sink.closed(), if !client_gone => {
                    client_gone = true;
                    cancel.cancel();
                }
                Some(token) = token_rx.recv() => {
                    if !client_gone && sink.emit(DeliveryEvent::Token(token)).await.is_err() {
                        client_gone = true;
                        cancel.cancel();
                    }
                }
            }
        };

        while let Ok(token) = token_rx.try_recv() {
            if client_gone || sink.emit(DeliveryEvent::Token(token)).await.is_err() {
                client_gone = true;
                break;
            }
        }

        match result {
            Ok(exchange) if !client_gone => {
                let sequence = exchange.assistant.sequence.unwrap_or_default();
                let events = [
                    DeliveryEvent::UserMessage(exchange.user),
                    DeliveryEvent::MessageComplete(MessageCompletePayload {
                        message: exchange.assistant,
                        sequence,
                    }),
                    DeliveryEvent::Done(DonePayload { success: true }),
                ];
                for event in events {
                    if sink.emit(event).await.is_err() {
                        break;
                    }
                }
            }
            Ok(_) => debug!(%conversation_id, "reply persisted after client left"),
            Err(err) => {
                warn!(%conversation_id, error = %err, "send-and-stream failed");
                if !client_gone {
                    let _ = sink
                        .emit(DeliveryEvent::Error(ErrorPayload::new(
                            STREAM_ERROR,
                            client_message(&err),
                        )))
                        .await;
                }
            }
        }

        transition(state, DeliveryState::Closed)
    }
}

fn transition(from: DeliveryState, to: DeliveryState) -> DeliveryState {
    debug!(?from, ?to, "delivery state change");
    to
}

async fn next_tick(interval: Option<&mut Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Message shown to the client for a failed send-and-stream.
fn client_message(err: &RelayError) -> String {
    match err {
        RelayError::Publish(_) | RelayError::Replay(_) => "Failed to persist message".to_string(),
        RelayError::Transport => "Connection closed".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use shared::config::LogStoreConfig;
    use shared::llms::ScriptedProvider;
    use shared::models::{CreateConversationRequest, Limits, Message, Role};
    use tokio::time::timeout;

    use crate::log_store::{LogStore, MemoryLogStore};
    use crate::services::conversation_registry::ConversationRegistry;
    use crate::services::response_assembler::ResponseAssembler;

    const WAIT: Duration = Duration::from_secs(2);

    fn settings(live_tail: Option<Duration>) -> DeliverySettings {
        DeliverySettings {
            heartbeat: Duration::from_millis(40),
            batch_size: 2,
            live_tail,
            channel_capacity: 16,
        }
    }

    fn streams(store: &MemoryLogStore) -> StreamManager {
        let config = LogStoreConfig {
            fetch_wait_ms: 5,
            ..LogStoreConfig::default()
        };
        StreamManager::new(Arc::new(store.clone()), &config)
    }

    async fn seed(streams: &StreamManager, conversation_id: Uuid, count: usize) -> Vec<u64> {
        let mut sequences = Vec::new();
        for index in 0..count {
            let mut message = Message::new(conversation_id, "t1", Role::User, format!("m{index}"));
            sequences.push(streams.publish_message(&mut message).await.unwrap());
        }
        sequences
    }

    async fn next(receiver: &mut mpsc::Receiver<DeliveryEvent>) -> DeliveryEvent {
        timeout(WAIT, receiver.recv())
            .await
            .expect("event within timeout")
            .expect("channel open")
    }

    #[tokio::test]
    async fn replays_in_order_then_heartbeats() {
        let store = MemoryLogStore::new();
        let streams = streams(&store);
        let conversation_id = Uuid::now_v7();
        let sequences = seed(&streams, conversation_id, 3).await;

        let controller = DeliveryController::new(streams, settings(None));
        let (sink, mut receiver) = DeliverySink::channel(16, CancellationToken::new());
        let task = tokio::spawn(async move {
            controller
                .replay_and_follow("t1", conversation_id, 0, sink)
                .await
        });

        assert_eq!(
            next(&mut receiver).await,
            DeliveryEvent::Connected(ConnectedPayload { conversation_id })
        );
        let mut seen = Vec::new();
        for _ in 0..3 {
            match next(&mut receiver).await {
                DeliveryEvent::Message(message) => seen.push(message.sequence.unwrap()),
                other => panic!("expected message, got {other:?}"),
            }
        }
        assert_eq!(seen, sequences);
        assert_eq!(
            next(&mut receiver).await,
            DeliveryEvent::ReplayComplete(ReplayCompletePayload {
                last_sequence: sequences[2],
                message_count: 3,
            })
        );
        assert!(matches!(next(&mut receiver).await, DeliveryEvent::Heartbeat(_)));
        assert!(matches!(next(&mut receiver).await, DeliveryEvent::Heartbeat(_)));

        drop(receiver);
        let state = timeout(WAIT, task).await.unwrap().unwrap();
        assert_eq!(state, DeliveryState::Closed);
    }

    #[tokio::test]
    async fn resumes_after_cursor() {
        let store = MemoryLogStore::new();
        let streams = streams(&store);
        let conversation_id = Uuid::now_v7();
        let sequences = seed(&streams, conversation_id, 4).await;

        let controller = DeliveryController::new(streams, settings(None));
        let (sink, mut receiver) = DeliverySink::channel(16, CancellationToken::new());
        let cursor = sequences[1];
        tokio::spawn(async move {
            controller
                .replay_and_follow("t1", conversation_id, cursor, sink)
                .await
        });

        let _ = next(&mut receiver).await;
        let mut seen = Vec::new();
        loop {
            match next(&mut receiver).await {
                DeliveryEvent::Message(message) => seen.push(message.sequence.unwrap()),
                DeliveryEvent::ReplayComplete(done) => {
                    assert_eq!(done.message_count, 2);
                    break;
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(seen, &sequences[2..]);
    }

    #[tokio::test]
    async fn replay_failure_emits_error_and_closes() {
        let store = MemoryLogStore::new();
        store.fail_next_fetches(1);
        let controller = DeliveryController::new(streams(&store), settings(None));
        let (sink, mut receiver) = DeliverySink::channel(16, CancellationToken::new());
        let state = controller
            .replay_and_follow("t1", Uuid::now_v7(), 0, sink)
            .await;

        assert_eq!(state, DeliveryState::Closed);
        assert!(matches!(next(&mut receiver).await, DeliveryEvent::Connected(_)));
        match next(&mut receiver).await {
            DeliveryEvent::Error(payload) => assert_eq!(payload.code, REPLAY_ERROR),
            other => panic!("expected error, got {other:?}"),
        }
        assert!(receiver.recv().await.is_none());
    }

    #[tokio::test]
    async fn cancellation_stops_a_live_connection() {
        let store = MemoryLogStore::new();
        let controller = DeliveryController::new(streams(&store), settings(None));
        let cancel = CancellationToken::new();
        let (sink, mut receiver) = DeliverySink::channel(16, cancel.clone());
        let task = tokio::spawn(async move {
            controller
                .replay_and_follow("t1", Uuid::now_v7(), 0, sink)
                .await
        });

        let _ = next(&mut receiver).await;
        assert!(matches!(next(&mut receiver).await, DeliveryEvent::ReplayComplete(_)));
        cancel.cancel();
        assert_eq!(timeout(WAIT, task).await.unwrap().unwrap(), DeliveryState::Closed);
    }

    #[tokio::test]
    async fn live_tail_delivers_new_messages() {
        let store = MemoryLogStore::new();
        let streams = streams(&store);
        let conversation_id = Uuid::now_v7();
        seed(&streams, conversation_id, 1).await;

        let controller =
            DeliveryController::new(streams.clone(), settings(Some(Duration::from_millis(10))));
        let (sink, mut receiver) = DeliverySink::channel(16, CancellationToken::new());
        tokio::spawn(async move {
            controller
                .replay_and_follow("t1", conversation_id, 0, sink)
                .await
        });

        let _ = next(&mut receiver).await;
        assert!(matches!(next(&mut receiver).await, DeliveryEvent::Message(_)));
        assert!(matches!(next(&mut receiver).await, DeliveryEvent::ReplayComplete(_)));

        let later = seed(&streams, conversation_id, 1).await;
        loop {
            match next(&mut receiver).await {
                DeliveryEvent::Message(message) => {
                    assert_eq!(message.sequence, Some(later[0]));
                    break;
                }
                DeliveryEvent::Heartbeat(_) => {}
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(store.records().await.len(), 2);
    }

    async fn generation_fixture(
        provider: ScriptedProvider,
    ) -> (DeliveryController, MessageService, MemoryLogStore, Uuid) {
        let store = MemoryLogStore::new();
        let streams = streams(&store);
        let registry = Arc::new(ConversationRegistry::default());
        let conversation_id = registry
            .create("t1", "u1", CreateConversationRequest::default())
            .await
            .unwrap()
            .id;
        let assembler = ResponseAssembler::new(
            Arc::new(provider),
            streams.clone(),
            Arc::clone(&registry),
            None,
            64,
        );
        let messages = MessageService::new(
            registry,
            streams.clone(),
            Some(assembler),
            Limits::default(),
            50,
            50,
        );
        (
            DeliveryController::new(streams, settings(None)),
            messages,
            store,
            conversation_id,
        )
    }

    async fn collect(mut receiver: mpsc::Receiver<DeliveryEvent>) -> Vec<DeliveryEvent> {
        let mut events = Vec::new();
        while let Some(event) = receiver.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn generation_success_event_order() {
        let (controller, messages, _store, conversation_id) =
            generation_fixture(ScriptedProvider::new(["Hi", " there"])).await;
        let (sink, receiver) = DeliverySink::channel(16, CancellationToken::new());

        let state = controller
            .generate(&messages, "t1", conversation_id, "hello".into(), None, sink)
            .await;
        assert_eq!(state, DeliveryState::Closed);

        let events = collect(receiver).await;
        let names: Vec<_> = events.iter().map(DeliveryEvent::name).collect();
        assert_eq!(
            names,
            ["token", "token", "user_message", "message_complete", "done"]
        );
        assert_eq!(
            events[0],
            DeliveryEvent::Token(TokenPayload {
                token: "Hi".into(),
                index: 0
            })
        );
        match &events[3] {
            DeliveryEvent::MessageComplete(payload) => {
                assert_eq!(payload.message.content, "Hi there");
                assert_eq!(payload.message.sequence, Some(payload.sequence));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(events[4], DeliveryEvent::Done(DonePayload { success: true }));
    }

    #[tokio::test]
    async fn generation_failure_emits_single_error() {
        let (controller, messages, store, conversation_id) =
            generation_fixture(ScriptedProvider::new(["Hi", " there"]).failing_after(1, "boom"))
                .await;
        let (sink, receiver) = DeliverySink::channel(16, CancellationToken::new());

        controller
            .generate(&messages, "t1", conversation_id, "hello".into(), None, sink)
            .await;

        let events = collect(receiver).await;
        let names: Vec<_> = events.iter().map(DeliveryEvent::name).collect();
        assert_eq!(names, ["token", "error"]);
        match &events[1] {
            DeliveryEvent::Error(payload) => assert_eq!(payload.code, STREAM_ERROR),
            other => panic!("unexpected {other:?}"),
        }

        let assistant = format!("conv.t1.{conversation_id}.msg.assistant");
        assert!(
            store
                .records()
                .await
                .iter()
                .all(|record| record.subject != assistant)
        );
    }

    #[tokio::test]
    async fn client_leaving_cancels_generation() {
        let (controller, messages, store, conversation_id) = generation_fixture(
            ScriptedProvider::new(["a", "b", "c"]).with_delay(Duration::from_millis(30)),
        )
        .await;
        let (sink, mut receiver) = DeliverySink::channel(16, CancellationToken::new());

        let reader = tokio::spawn(async move {
            let first = receiver.recv().await;
            drop(receiver);
            first
        });

        controller
            .generate(&messages, "t1", conversation_id, "hello".into(), None, sink)
            .await;
        assert!(matches!(
            reader.await.unwrap(),
            Some(DeliveryEvent::Token(_))
        ));

        let records = store.records().await;
        assert!(records.iter().all(|record| !record.subject.ends_with(".msg.assistant")));
        assert!(records.iter().any(|record| record.subject.ends_with(".event.error")));
        assert!(store.is_connected());
    }
}
