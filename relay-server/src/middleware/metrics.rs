//! Request counters and latency histograms, labelled by route template.

use std::time::Instant;

use axum::{
    body::Body,
    extract::MatchedPath,
    http::Request,
    middleware::Next,
    response::Response,
};
use metrics::{counter, histogram};
use uuid::Uuid;

pub async fn record_request_metrics(request: Request<Body>, next: Next) -> Response {
    let started = Instant::now();
    let method = request.method().to_string();
    let path = request.extensions().get::<MatchedPath>().map_or_else(
        || route_label(request.uri().path()),
        |matched| matched.as_str().to_string(),
    );

    let response = next.run(request).await;

    let labels = [
        ("method", method),
        ("path", path),
        ("status", response.status().as_u16().to_string()),
    ];
    counter!("api_requests_total", &labels).increment(1);
    histogram!("api_request_duration_seconds", &labels).record(started.elapsed().as_secs_f64());
    response
}

/// Collapses identifier segments so labels stay bounded.
fn route_label(path: &str) -> String {
    path.split('/')
        .map(|segment| {
            if Uuid::parse_str(segment).is_ok() {
                "{id}"
            } else {
                segment
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_are_collapsed() {
        let id = Uuid::now_v7();
        assert_eq!(
            route_label(&format!("/api/v1/conversations/{id}/stream")),
            "/api/v1/conversations/{id}/stream"
        );
        assert_eq!(route_label("/healthz"), "/healthz");
    }
}
