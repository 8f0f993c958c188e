use axum::{body::Body, http::Request};
use std::time::Duration;
use tower_http::classify::{ServerErrorsAsFailures, ServerErrorsFailureClass, SharedClassifier};
use tower_http::trace::{
    DefaultOnBodyChunk, DefaultOnEos, DefaultOnResponse, MakeSpan, TraceLayer,
};
use tracing::{Level, Span, error, info};

use crate::middleware::request_context::RequestContext;

type RelayTraceLayer = TraceLayer<
    SharedClassifier<ServerErrorsAsFailures>,
    HttpMakeSpan,
    fn(&Request<Body>, &Span),
    DefaultOnResponse,
    DefaultOnBodyChunk,
    DefaultOnEos,
    fn(ServerErrorsFailureClass, Duration, &Span),
>;

/// Opens one span per request, tagged with the correlation ID.
#[derive(Clone, Debug, Default)]
pub(crate) struct HttpMakeSpan;

impl<B> MakeSpan<B> for HttpMakeSpan {
    fn make_span(&mut self, request: &Request<B>) -> Span {
        let request_id = request
            .extensions()
            .get::<RequestContext>()
            .map_or_else(|| "n/a".to_string(), |ctx| ctx.request_id.clone());

        tracing::info_span!(
            "http_request",
            method = %request.method(),
            path = %request.uri().path(),
            request_id = %request_id,
        )
    }
}

fn on_request(request: &Request<Body>, span: &Span) {
    span.in_scope(|| {
        info!(
            method = %request.method(),
            uri = %request.uri(),
            "started processing request"
        );
    });
}

fn on_failure(failure: ServerErrorsFailureClass, latency: Duration, span: &Span) {
    span.in_scope(|| {
        error!(error = %failure, latency = ?latency, "request failed");
    });
}

pub(crate) fn create_trace_layer() -> RelayTraceLayer {
    TraceLayer::new_for_http()
        .make_span_with(HttpMakeSpan)
        .on_request(on_request as fn(&Request<Body>, &Span))
        .on_response(DefaultOnResponse::new().level(Level::INFO))
        .on_failure(on_failure as fn(ServerErrorsFailureClass, Duration, &Span))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_falls_back_without_context() {
        let request = Request::builder().uri("/healthz").body(()).unwrap();
        let span = HttpMakeSpan.make_span(&request);
        // Without a subscriber the span is disabled but must still build.
        let _entered = span.enter();
    }

    #[test]
    fn span_uses_request_context() {
        let mut request = Request::builder().uri("/api/v1/x").body(()).unwrap();
        request.extensions_mut().insert(RequestContext {
            request_id: "req-9".into(),
            identity: None,
        });
        let _span = HttpMakeSpan.make_span(&request);
    }
}
