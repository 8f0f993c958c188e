use axum::{
    Json, Router,
    extract::{Extension, Path, Query, State, rejection::JsonRejection, rejection::QueryRejection},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use serde::Deserialize;
use shared::models::{
    Conversation, CreateConversationRequest, ListConversationsResponse, UpdateConversationRequest,
    validation::parse_conversation_id,
};
use tracing::instrument;

use crate::{app_state::AppState, http::error::AppResult, middleware::request_context::RequestContext};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/conversations",
            get(list_conversations).post(create_conversation),
        )
        .route(
            "/conversations/{conversation_id}",
            get(get_conversation)
                .put(update_conversation)
                .delete(delete_conversation),
        )
}

#[derive(Debug, Deserialize, Default)]
struct ListQuery {
    limit: Option<usize>,
    offset: Option<usize>,
}

#[instrument(name = "http.conversations.create", skip(state, context, payload), err)]
async fn create_conversation(
    State(state): State<AppState>,
    Extension(context): Extension<RequestContext>,
    payload: Result<Json<CreateConversationRequest>, JsonRejection>,
) -> AppResult<impl IntoResponse> {
    let identity = context.identity()?;
    let Json(payload) = payload?;

    let created = state
        .registry
        .create(&identity.tenant_id, &identity.user_id, payload)
        .await?;
    Ok((StatusCode::CREATED, Json(created)))
}

#[instrument(name = "http.conversations.list", skip(state, context), err)]
async fn list_conversations(
    State(state): State<AppState>,
    Extension(context): Extension<RequestContext>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> AppResult<Json<ListConversationsResponse>> {
    let identity = context.identity()?;
    let Query(query) = query?;
    let limit = state.config.limits.conversation_page(query.limit)?;

    let page = state
        .registry
        .list(&identity.tenant_id, query.offset.unwrap_or(0), limit)
        .await;
    Ok(Json(page))
}

#[instrument(name = "http.conversations.get", skip(state, context), err)]
async fn get_conversation(
    State(state): State<AppState>,
    Extension(context): Extension<RequestContext>,
    Path(conversation_id): Path<String>,
) -> AppResult<Json<Conversation>> {
    let identity = context.identity()?;
    let conversation_id = parse_conversation_id(&conversation_id)?;

    let conversation = state
        .registry
        .get(&identity.tenant_id, conversation_id)
        .await?;
    Ok(Json(conversation))
}

#[instrument(name = "http.conversations.update", skip(state, context, payload), err)]
async fn update_conversation(
    State(state): State<AppState>,
    Extension(context): Extension<RequestContext>,
    Path(conversation_id): Path<String>,
    payload: Result<Json<UpdateConversationRequest>, JsonRejection>,
) -> AppResult<Json<Conversation>> {
    let identity = context.identity()?;
    let conversation_id = parse_conversation_id(&conversation_id)?;
    let Json(payload) = payload?;

    let updated = state
        .registry
        .update(&identity.tenant_id, conversation_id, payload)
        .await?;
    Ok(Json(updated))
}

#[instrument(name = "http.conversations.delete", skip(state, context), err)]
async fn delete_conversation(
    State(state): State<AppState>,
    Extension(context): Extension<RequestContext>,
    Path(conversation_id): Path<String>,
) -> AppResult<StatusCode> {
    let identity = context.identity()?;
    let conversation_id = parse_conversation_id(&conversation_id)?;

    state
        .registry
        .delete(&identity.tenant_id, conversation_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
