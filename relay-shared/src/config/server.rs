use serde::{Deserialize, Serialize};
use std::{env, fs, path::PathBuf, time::Duration};
use thiserror::Error;

use crate::models::Limits;

/// Errors raised while resolving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read configuration file {path}: {source}")]
    Io {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The configuration file could not be parsed.
    #[error("failed to parse configuration file: {0}")]
    Parse(String),
    /// The file extension is not `yaml`, `yml` or `json`.
    #[error("Unsupported configuration format. Use 'yaml' or 'json'.")]
    UnsupportedFormat,
    /// An environment override could not be parsed.
    #[error("Invalid {name} value: {reason}")]
    InvalidEnv {
        /// Variable name.
        name: &'static str,
        /// Explanation.
        reason: &'static str,
    },
    /// Semantic validation failed.
    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Output format for log lines.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Which log store adapter backs the relay.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogStoreBackend {
    /// NATS `JetStream`.
    #[default]
    Jetstream,
    /// Process-local store; contents are lost on exit.
    Memory,
}

/// Which generation provider produces assistant replies.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LlmProviderKind {
    /// Anthropic Messages API.
    #[default]
    Anthropic,
    /// `OpenAI` chat completions API.
    Openai,
    /// Local echo of the last user message.
    Echo,
}

/// Cross-origin settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CorsConfig {
    /// Allowed origins; empty allows any.
    pub allowed_origins: Vec<String>,
    /// Whether credentials may be sent.
    pub allow_credentials: bool,
    /// Preflight cache lifetime.
    pub max_age_seconds: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: Vec::new(),
            allow_credentials: false,
            max_age_seconds: 600,
        }
    }
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen port.
    pub port: u16,
    /// Header carrying the request correlation ID.
    pub request_id_header: String,
    /// Cross-origin settings.
    pub cors: CorsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            request_id_header: "x-request-id".into(),
            cors: CorsConfig::default(),
        }
    }
}

/// Log store connection and stream layout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LogStoreConfig {
    /// Adapter selection.
    pub backend: LogStoreBackend,
    /// Server URL.
    pub url: String,
    /// Optional auth token.
    pub token: Option<String>,
    /// CA bundle used to verify the server.
    pub tls_ca_file: Option<PathBuf>,
    /// Client certificate for mutual TLS.
    pub tls_cert_file: Option<PathBuf>,
    /// Client key for mutual TLS.
    pub tls_key_file: Option<PathBuf>,
    /// Stream holding every conversation subject.
    pub stream_name: String,
    /// First subject token.
    pub subject_prefix: String,
    /// Retention age.
    pub max_age_days: u64,
    /// Retention size.
    pub max_bytes: i64,
    /// Stream replica count.
    pub replicas: usize,
    /// Upper bound on one replay fetch.
    pub fetch_wait_ms: u64,
    /// Upper bound on one publish acknowledgement.
    pub publish_timeout_ms: u64,
}

impl Default for LogStoreConfig {
    fn default() -> Self {
        Self {
            backend: LogStoreBackend::Jetstream,
            url: "nats://localhost:4222".into(),
            token: None,
            tls_ca_file: None,
            tls_cert_file: None,
            tls_key_file: None,
            stream_name: "CONVERSATIONS".into(),
            subject_prefix: "conv".into(),
            max_age_days: 365,
            max_bytes: 100 * 1024 * 1024 * 1024,
            replicas: 1,
            fetch_wait_ms: 2_000,
            publish_timeout_ms: 5_000,
        }
    }
}

impl LogStoreConfig {
    /// Replay fetch wait as a [`Duration`].
    #[must_use]
    pub fn fetch_wait(&self) -> Duration {
        Duration::from_millis(self.fetch_wait_ms)
    }

    /// Publish acknowledgement timeout as a [`Duration`].
    #[must_use]
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }
}

/// Delivery controller behaviour.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StreamConfig {
    /// Interval between heartbeats once live.
    pub heartbeat_seconds: u64,
    /// Records fetched per replay round trip.
    pub replay_batch_size: usize,
    /// Prior messages handed to the generation provider.
    pub history_window: usize,
    /// Bound of the per-connection event channel.
    pub channel_capacity: usize,
    /// Poll the log for new records after replay completes.
    pub live_tail: bool,
    /// Poll interval when `live_tail` is on.
    pub live_tail_poll_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            heartbeat_seconds: 30,
            replay_batch_size: 50,
            history_window: 50,
            channel_capacity: 64,
            live_tail: false,
            live_tail_poll_ms: 1_000,
        }
    }
}

impl StreamConfig {
    /// Heartbeat interval as a [`Duration`].
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_seconds)
    }

    /// Live-tail poll interval as a [`Duration`].
    #[must_use]
    pub fn live_tail_interval(&self) -> Duration {
        Duration::from_millis(self.live_tail_poll_ms)
    }
}

/// Generation provider settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LlmConfig {
    /// Provider selection.
    pub provider: LlmProviderKind,
    /// Model used when a request names none.
    pub default_model: Option<String>,
    /// Completion token cap.
    pub max_tokens: u32,
    /// Anthropic credential.
    pub anthropic_api_key: Option<String>,
    /// `OpenAI` credential.
    pub openai_api_key: Option<String>,
    /// Base URL for `OpenAI`-compatible endpoints.
    pub openai_base_url: String,
    /// Base URL for the Anthropic API.
    pub anthropic_base_url: String,
    /// Connection establishment timeout for provider requests.
    pub connect_timeout_seconds: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProviderKind::Anthropic,
            default_model: None,
            max_tokens: 4096,
            anthropic_api_key: None,
            openai_api_key: None,
            openai_base_url: "https://api.openai.com/v1".into(),
            anthropic_base_url: "https://api.anthropic.com/v1".into(),
            connect_timeout_seconds: 10,
        }
    }
}

/// Bearer token verification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AuthConfig {
    /// Require a valid token on `/api/v1`.
    pub enabled: bool,
    /// HS256 shared secret.
    pub jwt_secret: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            jwt_secret: "development-secret-change-in-production".into(),
        }
    }
}

/// Per-caller request budget for `/api/v1`.
///
/// Each tenant gets a token bucket holding `burst` requests that refills at
/// `requests_per_minute`. Callers without a tenant are keyed by client address.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enforce the budget.
    pub enabled: bool,
    /// Sustained refill rate.
    pub requests_per_minute: u32,
    /// Bucket capacity.
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_minute: 60,
            burst: 60,
        }
    }
}

/// `Strict-Transport-Security` settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HstsConfig {
    /// Send the header.
    pub enabled: bool,
    /// `max-age` directive.
    pub max_age_seconds: u64,
    /// Add `includeSubDomains`.
    pub include_subdomains: bool,
    /// Add `preload`.
    pub preload: bool,
}

impl Default for HstsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_age_seconds: 63_072_000,
            include_subdomains: true,
            preload: false,
        }
    }
}

/// Response hardening headers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct SecurityConfig {
    /// HSTS, off unless the relay is served over TLS.
    pub hsts: HstsConfig,
}

/// Log output settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level directive when `RUST_LOG` is unset.
    pub level: String,
    /// Line format.
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: LogFormat::Text,
        }
    }
}

/// Fully resolved relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct Config {
    /// HTTP listener.
    pub server: ServerConfig,
    /// Log store.
    pub log_store: LogStoreConfig,
    /// Delivery behaviour.
    pub stream: StreamConfig,
    /// Generation provider.
    pub llm: LlmConfig,
    /// Authentication.
    pub auth: AuthConfig,
    /// Request limits.
    pub limits: Limits,
    /// Request rate budget.
    pub rate_limits: RateLimitConfig,
    /// Response hardening headers.
    pub security: SecurityConfig,
    /// Logging.
    pub logging: LoggingConfig,
}

impl Config {
    /// Generates a default configuration.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::default()
    }

    /// Loads configuration from a file, environment variables, and defaults.
    ///
    /// Precedence, lowest first: defaults, file, environment (only for values
    /// the file left at their default), `port_override`.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] when the file cannot be read or parsed, an
    /// environment override is malformed, or validation fails.
    pub fn load_config(
        config_path: Option<PathBuf>,
        port_override: Option<u16>,
    ) -> Result<Self, ConfigError> {
        let mut config = match config_path {
            Some(path) => Self::from_file(path)?,
            None => Self::with_defaults(),
        };

        config.apply_env_overrides()?;

        if let Some(port) = port_override {
            config.server.port = port;
        }

        config.validate().map_err(ConfigError::Invalid)?;
        Ok(config)
    }

    fn from_file(path: PathBuf) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml" | "yml") => {
                serde_yml::from_str(&content).map_err(|err| ConfigError::Parse(err.to_string()))
            }
            Some("json") => {
                serde_json::from_str(&content).map_err(|err| ConfigError::Parse(err.to_string()))
            }
            _ => Err(ConfigError::UnsupportedFormat),
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        let defaults = Self::with_defaults();

        if self.server.port == defaults.server.port {
            if let Ok(port) = env::var("RELAY_SERVER_PORT") {
                self.server.port = port.parse().map_err(|_| ConfigError::InvalidEnv {
                    name: "RELAY_SERVER_PORT",
                    reason: "must be a valid number between 1 and 65535",
                })?;
            }
        }
        if self.log_store.url == defaults.log_store.url {
            if let Ok(url) = env::var("RELAY_NATS_URL") {
                self.log_store.url = url;
            }
        }
        if self.log_store.token.is_none() {
            self.log_store.token = non_empty_env("RELAY_NATS_TOKEN");
        }
        if self.logging.level == defaults.logging.level {
            if let Ok(level) = env::var("RELAY_LOG_LEVEL") {
                self.logging.level = level;
            }
        }
        if self.logging.format == defaults.logging.format {
            if let Ok(format) = env::var("RELAY_LOG_FORMAT") {
                self.logging.format = match format.to_ascii_lowercase().as_str() {
                    "json" => LogFormat::Json,
                    "text" => LogFormat::Text,
                    _ => {
                        return Err(ConfigError::InvalidEnv {
                            name: "RELAY_LOG_FORMAT",
                            reason: "must be 'text' or 'json'",
                        });
                    }
                };
            }
        }
        if self.auth.jwt_secret == defaults.auth.jwt_secret {
            if let Some(secret) = non_empty_env("RELAY_JWT_SECRET") {
                self.auth.jwt_secret = secret;
            }
        }
        if self.llm.provider == defaults.llm.provider {
            if let Ok(provider) = env::var("RELAY_LLM_PROVIDER") {
                self.llm.provider = match provider.to_ascii_lowercase().as_str() {
                    "anthropic" => LlmProviderKind::Anthropic,
                    "openai" => LlmProviderKind::Openai,
                    "echo" => LlmProviderKind::Echo,
                    _ => {
                        return Err(ConfigError::InvalidEnv {
                            name: "RELAY_LLM_PROVIDER",
                            reason: "must be 'anthropic', 'openai' or 'echo'",
                        });
                    }
                };
            }
        }
        if self.rate_limits.requests_per_minute == defaults.rate_limits.requests_per_minute {
            if let Ok(raw) = env::var("RELAY_RATE_LIMIT_REQUESTS") {
                self.rate_limits.requests_per_minute =
                    raw.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                        name: "RELAY_RATE_LIMIT_REQUESTS",
                        reason: "must be a non-negative integer",
                    })?;
            }
        }
        if self.llm.anthropic_api_key.is_none() {
            self.llm.anthropic_api_key = non_empty_env("ANTHROPIC_API_KEY");
        }
        if self.llm.openai_api_key.is_none() {
            self.llm.openai_api_key = non_empty_env("OPENAI_API_KEY");
        }

        Ok(())
    }

    /// Validates semantic constraints across sections.
    ///
    /// # Errors
    /// Returns every violated constraint.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("Invalid server port. Must be greater than 0.".to_string());
        }
        if self.stream.heartbeat_seconds == 0 {
            errors.push("stream.heartbeat_seconds must be greater than 0".to_string());
        }
        if self.stream.replay_batch_size == 0
            || self.stream.replay_batch_size > self.limits.max_page_size
        {
            errors.push(format!(
                "stream.replay_batch_size must be between 1 and {}",
                self.limits.max_page_size
            ));
        }
        if self.stream.history_window == 0 {
            errors.push("stream.history_window must be greater than 0".to_string());
        }
        if self.stream.channel_capacity == 0 {
            errors.push("stream.channel_capacity must be greater than 0".to_string());
        }
        if self.stream.live_tail && self.stream.live_tail_poll_ms == 0 {
            errors.push("stream.live_tail_poll_ms must be greater than 0".to_string());
        }
        if self.log_store.subject_prefix.is_empty()
            || !crate::models::validation::is_subject_token(&self.log_store.subject_prefix)
        {
            errors.push("log_store.subject_prefix must be a single subject token".to_string());
        }
        if self.log_store.tls_cert_file.is_some() != self.log_store.tls_key_file.is_some() {
            errors.push(
                "log_store.tls_cert_file and log_store.tls_key_file must be set together"
                    .to_string(),
            );
        }
        if self.log_store.fetch_wait_ms == 0 {
            errors.push("log_store.fetch_wait_ms must be greater than 0".to_string());
        }
        if self.auth.enabled && self.auth.jwt_secret.is_empty() {
            errors.push("auth.jwt_secret is required when auth is enabled".to_string());
        }
        if self.llm.max_tokens == 0 {
            errors.push("llm.max_tokens must be greater than 0".to_string());
        }
        if self.rate_limits.enabled
            && (self.rate_limits.requests_per_minute == 0 || self.rate_limits.burst == 0)
        {
            errors.push(
                "rate_limits.requests_per_minute and rate_limits.burst must be greater than 0"
                    .to_string(),
            );
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}
