//! Runtime configuration for the relay server.

pub mod server;

pub use server::{
    AuthConfig, Config, ConfigError, CorsConfig, HstsConfig, LlmConfig, LlmProviderKind,
    LogFormat, LogStoreBackend, LogStoreConfig, LoggingConfig, RateLimitConfig, SecurityConfig,
    ServerConfig, StreamConfig,
};
