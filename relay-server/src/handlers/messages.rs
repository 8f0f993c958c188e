use axum::{
    Json, Router,
    extract::{Extension, Path, Query, State, rejection::JsonRejection},
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use shared::models::{
    ListMessagesResponse, SendMessageRequest, SendMessageResponse,
    validation::parse_conversation_id,
};
use tracing::{info, instrument};

use crate::{
    app_state::AppState, http::error::AppResult, middleware::request_context::RequestContext,
};

/// Header naming the endpoint that streams the reply for a deferred send.
pub const STREAM_URL_HEADER: &str = "x-stream-url";

pub fn routes() -> Router<AppState> {
    Router::new().route(
        "/conversations/{conversation_id}/messages",
        get(list_messages).post(send_message),
    )
}

/// Query for a history page. Unparseable values fall back to defaults so a
/// stale client cursor never fails the request.
#[derive(Debug, Deserialize, Default)]
pub(crate) struct HistoryQuery {
    after_sequence: Option<String>,
    limit: Option<String>,
}

impl HistoryQuery {
    pub(crate) fn cursor(&self) -> u64 {
        parse_or_default(self.after_sequence.as_deref())
    }

    fn limit(&self) -> Option<usize> {
        self.limit.as_deref().and_then(|raw| raw.trim().parse().ok())
    }
}

pub(crate) fn parse_or_default(raw: Option<&str>) -> u64 {
    raw.and_then(|raw| raw.trim().parse().ok()).unwrap_or(0)
}

#[instrument(name = "http.messages.list", skip(state, context, query), err)]
async fn list_messages(
    State(state): State<AppState>,
    Extension(context): Extension<RequestContext>,
    Path(conversation_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> AppResult<Json<ListMessagesResponse>> {
    let identity = context.identity()?;
    let conversation_id = parse_conversation_id(&conversation_id)?;

    let page = state
        .messages
        .list_messages(
            &identity.tenant_id,
            conversation_id,
            query.cursor(),
            query.limit(),
        )
        .await?;
    Ok(Json(page))
}

#[instrument(name = "http.messages.send", skip(state, context, payload), err)]
async fn send_message(
    State(state): State<AppState>,
    Extension(context): Extension<RequestContext>,
    Path(raw_id): Path<String>,
    payload: Result<Json<SendMessageRequest>, JsonRejection>,
) -> AppResult<Response> {
    let identity = context.identity()?;
    let conversation_id = parse_conversation_id(&raw_id)?;
    state
        .registry
        .get(&identity.tenant_id, conversation_id)
        .await?;
    let Json(payload) = payload?;

    if payload.stream {
        state.config.limits.validate_content(&payload.content)?;
        let location = HeaderValue::from_str(&format!(
            "/api/v1/conversations/{conversation_id}/stream"
        ))
        .map_err(http::Error::from)?;
        info!(%conversation_id, "send deferred to stream endpoint");

        let mut response = StatusCode::ACCEPTED.into_response();
        response.headers_mut().insert(STREAM_URL_HEADER, location);
        return Ok(response);
    }

    let message = state
        .messages
        .send(&identity.tenant_id, conversation_id, payload.content)
        .await?;
    let sequence = message.sequence.unwrap_or_default();
    Ok((
        StatusCode::CREATED,
        Json(SendMessageResponse { message, sequence }),
    )
        .into_response())
}
