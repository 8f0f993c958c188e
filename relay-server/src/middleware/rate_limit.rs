//! Token-bucket rate limiting for the `/api/v1` routes.
//!
//! Buckets are keyed by tenant once the caller is authenticated, otherwise by
//! client address. A denied request gets `429` with `Retry-After`.

use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Instant};

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderValue, Method, Request, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use metrics::counter;
use serde_json::json;
use shared::config::RateLimitConfig;
use tokio::sync::Mutex;
use tracing::warn;

use crate::http::error::ApiError;
use crate::middleware::request_context::RequestContext;

/// Idle buckets are swept once this many keys are tracked.
const SWEEP_THRESHOLD: usize = 10_000;

#[derive(Debug, Clone)]
pub struct RateLimitState {
    enabled: bool,
    strategy: Strategy,
    store: Arc<Mutex<HashMap<String, Bucket>>>,
}

impl RateLimitState {
    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self {
            enabled: config.enabled,
            strategy: Strategy::new(
                f64::from(config.burst),
                f64::from(config.requests_per_minute) / 60.0,
            ),
            store: Arc::default(),
        }
    }

    async fn acquire(&self, key: &str) -> RateLimitOutcome {
        let now = Instant::now();
        let mut buckets = self.store.lock().await;
        if buckets.len() >= SWEEP_THRESHOLD && !buckets.contains_key(key) {
            buckets.retain(|_, bucket| !bucket.is_full(now));
        }
        buckets
            .entry(key.to_string())
            .or_insert_with(|| Bucket::new(self.strategy, now))
            .take(now)
    }
}

#[derive(Debug, Clone, Copy)]
struct Strategy {
    capacity: f64,
    refill_per_sec: f64,
}

impl Strategy {
    fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            capacity: capacity.max(1.0),
            refill_per_sec: refill_per_sec.max(1.0 / 60.0),
        }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
    strategy: Strategy,
}

impl Bucket {
    fn new(strategy: Strategy, now: Instant) -> Self {
        Self {
            tokens: strategy.capacity,
            last_refill: now,
            strategy,
        }
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn take(&mut self, now: Instant) -> RateLimitOutcome {
        self.refill(now);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            let deficit = (self.strategy.capacity - self.tokens).max(0.0);
            RateLimitOutcome::Allowed {
                limit: self.strategy.capacity as u32,
                remaining: self.tokens.floor() as u32,
                reset_after: (deficit / self.strategy.refill_per_sec).ceil() as u64,
            }
        } else {
            let needed = 1.0 - self.tokens;
            let retry_after = (needed / self.strategy.refill_per_sec).ceil() as u64;
            RateLimitOutcome::Denied {
                retry_after: retry_after.max(1),
            }
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if elapsed <= 0.0 {
            return;
        }
        self.tokens =
            (self.tokens + elapsed * self.strategy.refill_per_sec).min(self.strategy.capacity);
        self.last_refill = now;
    }

    fn is_full(&self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens + elapsed * self.strategy.refill_per_sec >= self.strategy.capacity
    }
}

#[derive(Debug, PartialEq, Eq)]
enum RateLimitOutcome {
    Allowed {
        limit: u32,
        remaining: u32,
        reset_after: u64,
    },
    Denied {
        retry_after: u64,
    },
}

/// Charges one request against the caller's bucket.
pub async fn enforce_rate_limits(
    State(state): State<RateLimitState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if !state.enabled || request.method() == Method::OPTIONS {
        return next.run(request).await;
    }

    let key = rate_limit_key(&request);
    match state.acquire(&key).await {
        RateLimitOutcome::Allowed {
            limit,
            remaining,
            reset_after,
        } => {
            let mut response = next.run(request).await;
            let headers = response.headers_mut();
            headers.insert("ratelimit-limit", HeaderValue::from(limit));
            headers.insert("ratelimit-remaining", HeaderValue::from(remaining));
            headers.insert("ratelimit-reset", HeaderValue::from(reset_after));
            response
        }
        RateLimitOutcome::Denied { retry_after } => {
            counter!("relay_rate_limited_total").increment(1);
            warn!(key, retry_after, "rate limit exceeded");
            let mut response = ApiError::too_many_requests("rate limit exceeded")
                .with_details(json!({ "retry_after_seconds": retry_after }))
                .into_response();
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
            response
        }
    }
}

fn rate_limit_key<B>(request: &Request<B>) -> String {
    let tenant = request
        .extensions()
        .get::<RequestContext>()
        .and_then(|context| context.identity.as_ref())
        .map(|identity| identity.tenant_id.as_str());
    if let Some(tenant) = tenant {
        return format!("tenant:{tenant}");
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map_or_else(
            || "ip:unknown".to_string(),
            |ConnectInfo(addr)| format!("ip:{}", addr.ip()),
        )
}
