use std::{
    net::SocketAddr,
    sync::{Arc, OnceLock},
    time::Duration,
};

use axum::{
    Extension, Router,
    http::{HeaderValue, Method, StatusCode, header},
    middleware,
    response::IntoResponse,
    routing::get,
    serve,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use shared::config::{Config, LogFormat, LogStoreBackend};
use shared::llms::{CompletionProvider, build_provider};
use tokio::net::TcpListener;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tracing::{error, info, level_filters::LevelFilter, warn};
use tracing_subscriber::{EnvFilter, fmt};

use crate::{
    app_state::AppState,
    log_store::{JetStreamLogStore, LogStore, LogStoreResult, MemoryLogStore},
    middleware::{
        auth::AuthState,
        metrics::record_request_metrics,
        rate_limit::RateLimitState,
        request_context::{self, RequestIdState},
        security::{SecurityHeadersState, apply_security_headers},
    },
    routes, tracer,
};

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Process-wide Prometheus recorder, installed on first use.
pub fn metrics_handle() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .expect("failed to install Prometheus recorder")
        })
        .clone()
}

async fn metrics_endpoint(Extension(handle): Extension<PrometheusHandle>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; version=0.0.4"),
        )],
        handle.render(),
    )
}

/// Installs the global tracing subscriber and returns the configured level.
pub fn initialize_tracing(config: &Config) -> String {
    let env_filter = build_env_filter(config);

    let fmt_builder = fmt::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_level(true)
        .with_thread_ids(false)
        .with_thread_names(false);

    let installed = if matches!(config.logging.format, LogFormat::Json) {
        fmt_builder.json().with_ansi(false).try_init()
    } else {
        fmt_builder.with_ansi(true).try_init()
    };
    if installed.is_err() {
        warn!("tracing subscriber already installed");
    }

    config.logging.level.clone()
}

fn build_env_filter(config: &Config) -> EnvFilter {
    let default_level = config
        .logging
        .level
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::INFO);

    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::builder()
            .with_default_directive(default_level.into())
            .from_env_lossy()
    })
}

/// CORS for browser clients; an empty origin list allows any origin.
pub fn create_cors_layer(config: &Config) -> CorsLayer {
    let methods = vec![
        Method::GET,
        Method::POST,
        Method::PUT,
        Method::DELETE,
        Method::OPTIONS,
    ];

    let origins = config
        .server
        .cors
        .allowed_origins
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect::<Vec<_>>();

    let cors = CorsLayer::new()
        .allow_methods(AllowMethods::list(methods))
        .expose_headers([
            header::HeaderName::from_static("x-stream-url"),
            header::HeaderName::from_static("x-request-id"),
            header::RETRY_AFTER,
            header::HeaderName::from_static("ratelimit-limit"),
            header::HeaderName::from_static("ratelimit-remaining"),
            header::HeaderName::from_static("ratelimit-reset"),
        ])
        .max_age(Duration::from_secs(config.server.cors.max_age_seconds));

    // Credentials cannot be combined with wildcard origins or headers.
    if origins.is_empty() {
        cors.allow_origin(AllowOrigin::any())
            .allow_headers(AllowHeaders::any())
    } else if config.server.cors.allow_credentials {
        cors.allow_origin(AllowOrigin::list(origins))
            .allow_headers(AllowHeaders::mirror_request())
            .allow_credentials(true)
    } else {
        cors.allow_origin(AllowOrigin::list(origins))
            .allow_headers(AllowHeaders::any())
    }
}

/// Builds the full router: `/api/v1` behind auth, plus health and metrics.
pub fn create_app_router(state: AppState, metrics_handle: PrometheusHandle) -> Router {
    let config = Arc::clone(&state.config);
    let cors = create_cors_layer(&config);
    let request_id_state = RequestIdState::from_config(&config);
    let security = SecurityHeadersState::from_config(&config.security);
    let api_router = routes::api::create_api_router(
        AuthState::from_config(&config),
        RateLimitState::from_config(&config.rate_limits),
    );

    Router::new()
        .nest("/api/v1", api_router)
        .merge(routes::health::create_health_router())
        .route("/metrics", get(metrics_endpoint))
        .route_layer(middleware::from_fn(record_request_metrics))
        .layer(Extension(metrics_handle))
        .layer(middleware::from_fn_with_state(
            security,
            apply_security_headers,
        ))
        .layer(cors)
        .layer(tracer::create_trace_layer())
        .layer(middleware::from_fn_with_state(
            request_id_state,
            request_context::assign_request_id,
        ))
        .with_state(state)
}

/// Opens the configured log store.
///
/// # Errors
/// Returns an error if the store cannot be reached.
pub async fn create_log_store(config: &Config) -> LogStoreResult<Arc<dyn LogStore>> {
    let store: Arc<dyn LogStore> = match config.log_store.backend {
        LogStoreBackend::Jetstream => {
            Arc::new(JetStreamLogStore::connect(&config.log_store).await?)
        }
        LogStoreBackend::Memory => {
            warn!("using the in-memory log store; history is lost on restart");
            Arc::new(MemoryLogStore::new())
        }
    };
    info!(backend = store.backend(), "log store connected");
    Ok(store)
}

/// Builds the generation provider, or `None` when it is not configured.
/// The relay still serves history without one.
pub fn create_provider(config: &Config) -> Option<Arc<dyn CompletionProvider>> {
    match build_provider(&config.llm) {
        Ok(provider) => {
            info!(provider = provider.name(), "generation provider ready");
            Some(provider)
        }
        Err(err) => {
            warn!(error = %err, "generation disabled");
            None
        }
    }
}

/// Resolves on Ctrl+C.
pub async fn create_shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutting down...");
}

/// Starts the relay and serves until shutdown.
///
/// # Errors
/// Returns an error if the log store is unreachable or the listener fails.
pub async fn run(config: Config) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    initialize_tracing(&config);
    info!("Starting relay...");

    let metrics_handle = metrics_handle();
    let config = Arc::new(config);

    let store = create_log_store(&config).await?;
    let provider = create_provider(&config);
    let state = AppState::new(Arc::clone(&config), store, provider);
    state.streams.ensure_ready().await?;
    let app = create_app_router(state, metrics_handle);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let listener = TcpListener::bind(addr).await?;
    info!("Listening on {}", addr);

    serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(create_shutdown_signal())
    .await?;

    Ok(())
}
