pub mod conversations;
pub mod messages;
pub mod streaming;

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::{
        Router,
        body::{Body, Bytes},
        http::{Method, Request, StatusCode, header},
        response::Response,
    };
    use futures_util::StreamExt;
    use serde_json::{Value, json};
    use shared::config::Config;
    use shared::llms::{CompletionProvider, ScriptedProvider};
    use tower::ServiceExt;

    use crate::app_state::AppState;
    use crate::log_store::MemoryLogStore;
    use crate::middleware::auth::tests::token;

    /// Router over an in-memory store, authenticated as tenant `t1`.
    #[derive(Clone)]
    pub(crate) struct TestApp {
        router: Router,
        secret: String,
        bearer: Option<String>,
    }

    impl TestApp {
        pub(crate) fn new() -> Self {
            Self::with_provider(Some(Arc::new(ScriptedProvider::new(["Hello", " world"]))))
        }

        pub(crate) fn with_provider(provider: Option<Arc<dyn CompletionProvider>>) -> Self {
            let mut config = Config::default();
            config.log_store.fetch_wait_ms = 10;
            let secret = config.auth.jwt_secret.clone();
            let state = AppState::new(Arc::new(config), Arc::new(MemoryLogStore::new()), provider);
            let router = crate::server::create_app_router(state, crate::server::metrics_handle());

            Self {
                router,
                bearer: Some(token(&secret, "t1", "u1")),
                secret,
            }
        }

        pub(crate) fn as_tenant(&self, tenant: &str) -> Self {
            Self {
                bearer: Some(token(&self.secret, tenant, "u2")),
                ..self.clone()
            }
        }

        pub(crate) fn without_token(self) -> Self {
            Self {
                bearer: None,
                ..self
            }
        }

        fn builder(&self, method: Method, uri: &str) -> axum::http::request::Builder {
            let builder = Request::builder().method(method).uri(uri);
            match &self.bearer {
                Some(bearer) => builder.header(header::AUTHORIZATION, format!("Bearer {bearer}")),
                None => builder,
            }
        }

        pub(crate) async fn request(
            &self,
            method: Method,
            uri: &str,
            body: Option<Value>,
        ) -> Response {
            let request = match body {
                Some(body) => self
                    .builder(method, uri)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string())),
                None => self.builder(method, uri).body(Body::empty()),
            }
            .unwrap();
            self.router.clone().oneshot(request).await.unwrap()
        }

        pub(crate) async fn raw(&self, method: Method, uri: &str, body: &str) -> (StatusCode, Bytes) {
            let request = self
                .builder(method, uri)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap();
            let response = self.router.clone().oneshot(request).await.unwrap();
            let status = response.status();
            let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
                .await
                .unwrap();
            (status, bytes)
        }

        /// Sends a request and decodes the body as JSON (`Null` when empty).
        pub(crate) async fn json(
            &self,
            method: Method,
            uri: &str,
            body: Option<Value>,
        ) -> (StatusCode, Value) {
            let response = self.request(method, uri, body).await;
            let status = response.status();
            let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
                .await
                .unwrap();
            if bytes.is_empty() {
                return (status, Value::Null);
            }
            (status, serde_json::from_slice(&bytes).unwrap())
        }

        pub(crate) async fn create_conversation(&self, title: &str) -> String {
            let (status, created) = self
                .json(
                    Method::POST,
                    "/api/v1/conversations",
                    Some(json!({ "title": title })),
                )
                .await;
            assert_eq!(status, StatusCode::CREATED);
            created["id"].as_str().unwrap().to_string()
        }

        /// Reads an open SSE body until an event named `until` arrives.
        pub(crate) async fn read_sse_until(
            &self,
            response: Response,
            until: &str,
            wait: Duration,
        ) -> Vec<SseFrame> {
            let mut body = response.into_body().into_data_stream();
            let mut text = String::new();
            loop {
                let chunk = tokio::time::timeout(wait, body.next())
                    .await
                    .expect("sse frame within timeout")
                    .expect("stream still open")
                    .unwrap();
                text.push_str(&String::from_utf8_lossy(&chunk));
                let frames = parse_sse(&text);
                if frames.iter().any(|frame| frame.event == until) {
                    return frames;
                }
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) struct SseFrame {
        pub(crate) event: String,
        pub(crate) data: String,
        pub(crate) id: Option<String>,
    }

    /// Splits complete SSE frames out of `text`, ignoring a trailing partial one.
    pub(crate) fn parse_sse(text: &str) -> Vec<SseFrame> {
        let complete = text.rfind("\n\n").map_or("", |end| &text[..end]);
        complete
            .split("\n\n")
            .filter_map(|block| {
                let mut frame = SseFrame {
                    event: String::new(),
                    data: String::new(),
                    id: None,
                };
                for line in block.lines() {
                    if let Some(value) = line.strip_prefix("event:") {
                        frame.event = value.trim().to_string();
                    } else if let Some(value) = line.strip_prefix("data:") {
                        frame.data.push_str(value.trim_start());
                    } else if let Some(value) = line.strip_prefix("id:") {
                        frame.id = Some(value.trim().to_string());
                    }
                }
                (!frame.event.is_empty()).then_some(frame)
            })
            .collect()
    }
}
