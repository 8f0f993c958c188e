//! SSE endpoints for a conversation.
//!
//! `GET` replays history from the client's cursor and then holds the
//! connection open; `POST` sends a message and streams the reply. The
//! delivery work runs on a spawned task that writes into a bounded channel;
//! this module only turns that channel into an SSE body. Dropping the body
//! cancels the connection token.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query, State, rejection::JsonRejection},
    http::{HeaderMap, HeaderName, HeaderValue, header},
    response::{
        IntoResponse, Response,
        sse::{Event, Sse},
    },
    routing::get,
};
use shared::models::{DeliveryEvent, StreamRequest, validation::parse_conversation_id};
use tokio::sync::mpsc;
use tokio_stream::{StreamExt, wrappers::ReceiverStream};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info_span, instrument, warn};

use crate::{
    app_state::AppState,
    handlers::messages::{HistoryQuery, parse_or_default},
    http::error::{ApiError, AppResult},
    middleware::request_context::RequestContext,
    services::DeliverySink,
};

const LAST_EVENT_ID: &str = "last-event-id";

pub fn routes() -> Router<AppState> {
    Router::new().route(
        "/conversations/{conversation_id}/stream",
        get(stream_history).post(send_and_stream),
    )
}

/// Replays messages after `after_sequence` (or the `Last-Event-ID` a
/// reconnecting browser sends), then keeps the stream alive.
#[instrument(name = "http.stream.replay", skip(state, context, query, headers), err)]
async fn stream_history(
    State(state): State<AppState>,
    Extension(context): Extension<RequestContext>,
    Path(conversation_id): Path<String>,
    Query(query): Query<HistoryQuery>,
    headers: HeaderMap,
) -> AppResult<Response> {
    let identity = context.identity()?.clone();
    let conversation_id = parse_conversation_id(&conversation_id)?;
    state
        .registry
        .get(&identity.tenant_id, conversation_id)
        .await?;

    let cursor = resume_cursor(&query, &headers);
    let cancel = CancellationToken::new();
    let (sink, receiver) =
        DeliverySink::channel(state.delivery.settings().channel_capacity, cancel.clone());

    let delivery = state.delivery.clone();
    let span = info_span!(
        "stream.replay",
        request_id = %context.request_id,
        tenant_id = %identity.tenant_id,
        %conversation_id,
        cursor
    );
    tokio::spawn(
        async move {
            delivery
                .replay_and_follow(&identity.tenant_id, conversation_id, cursor, sink)
                .await
        }
        .instrument(span),
    );

    Ok(sse_response(receiver, cancel))
}

/// Publishes the user message and streams the generated reply.
#[instrument(name = "http.stream.generate", skip(state, context, payload), err)]
async fn send_and_stream(
    State(state): State<AppState>,
    Extension(context): Extension<RequestContext>,
    Path(conversation_id): Path<String>,
    payload: Result<Json<StreamRequest>, JsonRejection>,
) -> AppResult<Response> {
    let identity = context.identity()?.clone();
    let conversation_id = parse_conversation_id(&conversation_id)?;
    state
        .registry
        .get(&identity.tenant_id, conversation_id)
        .await?;
    let Json(payload) = payload?;
    state.config.limits.validate_content(&payload.content)?;
    if !state.messages.can_generate() {
        return Err(ApiError::service_unavailable(
            "no completion provider configured",
        ));
    }

    let cancel = CancellationToken::new();
    let (sink, receiver) =
        DeliverySink::channel(state.delivery.settings().channel_capacity, cancel.clone());

    let delivery = state.delivery.clone();
    let messages = Arc::clone(&state.messages);
    let span = info_span!(
        "stream.generate",
        request_id = %context.request_id,
        tenant_id = %identity.tenant_id,
        %conversation_id
    );
    tokio::spawn(
        async move {
            delivery
                .generate(
                    &messages,
                    &identity.tenant_id,
                    conversation_id,
                    payload.content,
                    payload.model,
                    sink,
                )
                .await
        }
        .instrument(span),
    );

    Ok(sse_response(receiver, cancel))
}

fn resume_cursor(query: &HistoryQuery, headers: &HeaderMap) -> u64 {
    let cursor = query.cursor();
    if cursor > 0 {
        return cursor;
    }
    parse_or_default(
        headers
            .get(LAST_EVENT_ID)
            .and_then(|value| value.to_str().ok()),
    )
}

fn sse_response(receiver: mpsc::Receiver<DeliveryEvent>, cancel: CancellationToken) -> Response {
    let guard = cancel.drop_guard();
    let events = ReceiverStream::new(receiver).filter_map(move |event| {
        let _connection = &guard;
        to_sse_event(&event).map(Ok::<_, Infallible>)
    });

    (
        [
            (header::CACHE_CONTROL, HeaderValue::from_static("no-cache")),
            (
                HeaderName::from_static("x-accel-buffering"),
                HeaderValue::from_static("no"),
            ),
        ],
        Sse::new(events),
    )
        .into_response()
}

fn to_sse_event(event: &DeliveryEvent) -> Option<Event> {
    let data = match event.payload_json() {
        Ok(data) => data,
        Err(err) => {
            warn!(event = event.name(), error = %err, "dropping unserializable event");
            return None;
        }
    };
    let mut sse_event = Event::default().event(event.name());
    if let Some(sequence) = event.sequence() {
        sse_event = sse_event.id(sequence.to_string());
    }
    Some(sse_event.data(data))
}
