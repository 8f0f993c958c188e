use axum::{
    body::Body,
    extract::State,
    http::{HeaderValue, Request, header},
    middleware::Next,
    response::Response,
};
use shared::config::SecurityConfig;

const CONTENT_SECURITY_POLICY: &str = "default-src 'none'; frame-ancestors 'none'";

#[derive(Clone, Debug)]
pub struct SecurityHeadersState {
    hsts: Option<HeaderValue>,
}

impl SecurityHeadersState {
    pub fn from_config(config: &SecurityConfig) -> Self {
        let hsts = config.hsts.enabled.then(|| {
            let mut directives = vec![format!("max-age={}", config.hsts.max_age_seconds)];
            if config.hsts.include_subdomains {
                directives.push("includeSubDomains".into());
            }
            if config.hsts.preload {
                directives.push("preload".into());
            }
            HeaderValue::from_str(&directives.join("; "))
                .unwrap_or_else(|_| HeaderValue::from_static("max-age=63072000"))
        });

        Self { hsts }
    }
}

/// Adds hardening headers to every response, keeping any a handler already set.
pub async fn apply_security_headers(
    State(state): State<SecurityHeadersState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    if let Some(hsts) = state.hsts {
        headers.insert(header::STRICT_TRANSPORT_SECURITY, hsts);
    }
    headers
        .entry(header::X_CONTENT_TYPE_OPTIONS)
        .or_insert_with(|| HeaderValue::from_static("nosniff"));
    headers
        .entry(header::X_FRAME_OPTIONS)
        .or_insert_with(|| HeaderValue::from_static("DENY"));
    headers
        .entry(header::REFERRER_POLICY)
        .or_insert_with(|| HeaderValue::from_static("no-referrer"));
    headers
        .entry(header::CONTENT_SECURITY_POLICY)
        .or_insert_with(|| HeaderValue::from_static(CONTENT_SECURITY_POLICY));

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, middleware, routing::get};
    use shared::config::HstsConfig;
    use tower::ServiceExt;

    async fn headers_for(config: &SecurityConfig) -> axum::http::HeaderMap {
        let app = Router::new()
            .route(
                "/",
                get(|| async { ([(header::REFERRER_POLICY, "same-origin")], "ok") }),
            )
            .layer(middleware::from_fn_with_state(
                SecurityHeadersState::from_config(config),
                apply_security_headers,
            ));
        let request = Request::builder().uri("/").body(Body::empty()).unwrap();
        app.oneshot(request).await.unwrap().headers().clone()
    }

    #[tokio::test]
    async fn hardening_headers_are_added_without_overriding() {
        let headers = headers_for(&SecurityConfig::default()).await;
        assert_eq!(headers[header::X_CONTENT_TYPE_OPTIONS], "nosniff");
        assert_eq!(headers[header::X_FRAME_OPTIONS], "DENY");
        assert_eq!(headers[header::CONTENT_SECURITY_POLICY], CONTENT_SECURITY_POLICY);
        assert_eq!(headers[header::REFERRER_POLICY], "same-origin");
        assert!(headers.get(header::STRICT_TRANSPORT_SECURITY).is_none());
    }

    #[tokio::test]
    async fn hsts_directives_follow_config() {
        let config = SecurityConfig {
            hsts: HstsConfig {
                enabled: true,
                max_age_seconds: 600,
                include_subdomains: true,
                preload: true,
            },
        };
        let headers = headers_for(&config).await;
        assert_eq!(
            headers[header::STRICT_TRANSPORT_SECURITY],
            "max-age=600; includeSubDomains; preload"
        );
    }
}
