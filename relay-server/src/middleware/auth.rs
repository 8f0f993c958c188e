//! Bearer-token authentication for the `/api/v1` routes.
//!
//! Tokens are HS256 JWTs whose `sub` claim is the user and whose `tenant_id`
//! claim is the isolation boundary. With auth disabled the identity is read
//! from `x-tenant-id` / `x-user-id` headers, which is only meant for local
//! development.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{HeaderMap, header},
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};
use shared::config::Config;
use shared::models::Limits;
use tracing::{debug, warn};

use crate::http::error::{ApiError, AppResult};
use crate::middleware::request_context::{Identity, RequestContext};

const TENANT_HEADER: &str = "x-tenant-id";
const USER_HEADER: &str = "x-user-id";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    pub sub: String,
    pub tenant_id: String,
    pub exp: u64,
}

#[derive(Clone)]
pub struct AuthState {
    enabled: bool,
    key: Arc<DecodingKey>,
    validation: Arc<Validation>,
    limits: Limits,
}

impl std::fmt::Debug for AuthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthState")
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

impl AuthState {
    pub fn from_config(config: &Config) -> Self {
        Self {
            enabled: config.auth.enabled,
            key: Arc::new(DecodingKey::from_secret(config.auth.jwt_secret.as_bytes())),
            validation: Arc::new(Validation::new(Algorithm::HS256)),
            limits: config.limits.clone(),
        }
    }

    fn authenticate(&self, headers: &HeaderMap) -> AppResult<Identity> {
        let identity = if self.enabled {
            let token = bearer_token(headers)
                .ok_or_else(|| ApiError::unauthorized("missing bearer token"))?;
            let claims = decode::<Claims>(token, &self.key, &self.validation)
                .map_err(|err| {
                    debug!(error = %err, "token rejected");
                    ApiError::unauthorized("invalid token")
                })?
                .claims;
            Identity {
                tenant_id: claims.tenant_id,
                user_id: claims.sub,
            }
        } else {
            Identity {
                tenant_id: header_value(headers, TENANT_HEADER)
                    .ok_or_else(|| ApiError::unauthorized("missing x-tenant-id header"))?,
                user_id: header_value(headers, USER_HEADER).unwrap_or_else(|| "anonymous".into()),
            }
        };

        self.limits.validate_tenant_id(&identity.tenant_id).map_err(|err| {
            warn!(error = %err, "rejecting identity with unusable tenant");
            ApiError::unauthorized("invalid tenant")
        })?;
        Ok(identity)
    }
}

/// Resolves the caller identity and stores it in the [`RequestContext`].
pub async fn require_identity(
    State(state): State<AuthState>,
    mut request: Request<Body>,
    next: Next,
) -> AppResult<Response> {
    let identity = state.authenticate(request.headers())?;

    if let Some(context) = request.extensions_mut().get_mut::<RequestContext>() {
        context.identity = Some(identity);
    } else {
        request.extensions_mut().insert(RequestContext {
            request_id: String::new(),
            identity: Some(identity),
        });
    }

    Ok(next.run(request).await)
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then(|| token.trim())
        .filter(|token| !token.is_empty())
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use jsonwebtoken::{EncodingKey, Header, encode};

    pub(crate) fn token(secret: &str, tenant: &str, user: &str) -> String {
        let exp = u64::try_from(chrono::Utc::now().timestamp()).unwrap() + 3600;
        let claims = Claims {
            sub: user.into(),
            tenant_id: tenant.into(),
            exp,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn headers(pairs: &[(&'static str, String)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        headers
    }

    #[test]
    fn valid_token_yields_identity() {
        let config = Config::default();
        let state = AuthState::from_config(&config);
        let bearer = format!("Bearer {}", token(&config.auth.jwt_secret, "t1", "u1"));

        let identity = state
            .authenticate(&headers(&[("authorization", bearer)]))
            .unwrap();
        assert_eq!(
            identity,
            Identity {
                tenant_id: "t1".into(),
                user_id: "u1".into()
            }
        );
    }

    #[test]
    fn wrong_secret_and_missing_token_are_rejected() {
        let state = AuthState::from_config(&Config::default());
        let forged = format!("Bearer {}", token("another-secret", "t1", "u1"));

        assert_eq!(
            state
                .authenticate(&headers(&[("authorization", forged)]))
                .unwrap_err()
                .status(),
            axum::http::StatusCode::UNAUTHORIZED
        );
        assert!(state.authenticate(&HeaderMap::new()).is_err());
        assert!(
            state
                .authenticate(&headers(&[("authorization", "Basic abc".into())]))
                .is_err()
        );
    }

    #[test]
    fn tenants_must_be_subject_tokens() {
        let config = Config::default();
        let state = AuthState::from_config(&config);
        let bearer = format!("Bearer {}", token(&config.auth.jwt_secret, "t1.evil", "u1"));
        assert!(
            state
                .authenticate(&headers(&[("authorization", bearer)]))
                .is_err()
        );
    }

    #[test]
    fn disabled_auth_reads_identity_headers() {
        let mut config = Config::default();
        config.auth.enabled = false;
        let state = AuthState::from_config(&config);

        let identity = state
            .authenticate(&headers(&[(TENANT_HEADER, "dev".into())]))
            .unwrap();
        assert_eq!(identity.tenant_id, "dev");
        assert_eq!(identity.user_id, "anonymous");
        assert!(state.authenticate(&HeaderMap::new()).is_err());
    }
}
