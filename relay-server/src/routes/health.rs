use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use serde::Serialize;

use crate::app_state::AppState;

#[derive(Serialize)]
struct HealthResponse<'a> {
    status: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'a str>,
}

async fn healthz() -> impl IntoResponse {
    metrics::counter!("health_checks_total", "endpoint" => "healthz", "status" => "ok")
        .increment(1);
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok",
            reason: None,
        }),
    )
}

/// Ready once the log store connection is up.
async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    if state.streams.is_connected() {
        metrics::counter!("health_checks_total", "endpoint" => "readyz", "status" => "ok")
            .increment(1);
        (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ready",
                reason: None,
            }),
        )
    } else {
        metrics::counter!("health_checks_total", "endpoint" => "readyz", "status" => "error")
            .increment(1);
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse {
                status: "not_ready",
                reason: Some("log store not connected"),
            }),
        )
    }
}

pub fn create_health_router() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::{body::Body, http::Request};
    use serde_json::Value;
    use shared::config::Config;
    use tower::ServiceExt;

    use crate::log_store::MemoryLogStore;

    fn app(store: &MemoryLogStore) -> Router {
        let state = AppState::new(Arc::new(Config::default()), Arc::new(store.clone()), None);
        create_health_router().with_state(state)
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let _ = crate::server::metrics_handle();
        let (status, body) = get_json(app(&MemoryLogStore::new()), "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn readyz_follows_log_store_connection() {
        let _ = crate::server::metrics_handle();
        let store = MemoryLogStore::new();

        let (status, body) = get_json(app(&store), "/readyz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ready");

        store.set_connected(false);
        let (status, body) = get_json(app(&store), "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "not_ready");
        assert_eq!(body["reason"], "log store not connected");
    }
}
