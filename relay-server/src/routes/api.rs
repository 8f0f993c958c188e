use axum::{Router, middleware};

use crate::{
    app_state::AppState,
    handlers::{conversations, messages, streaming},
    middleware::{
        auth::{AuthState, require_identity},
        rate_limit::{RateLimitState, enforce_rate_limits},
    },
};

/// Routes mounted under `/api/v1`, all behind caller authentication and a
/// per-tenant rate limit. Authentication runs first so the limiter can key
/// on the tenant.
pub fn create_api_router(auth: AuthState, rate_limit: RateLimitState) -> Router<AppState> {
    Router::new()
        .merge(conversations::routes())
        .merge(messages::routes())
        .merge(streaming::routes())
        .route_layer(middleware::from_fn_with_state(
            rate_limit,
            enforce_rate_limits,
        ))
        .route_layer(middleware::from_fn_with_state(auth, require_identity))
}
