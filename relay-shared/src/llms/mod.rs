//! # Generation Providers
//!
//! A uniform streaming interface over the text-generation backends the relay
//! can drive.
//!
//! - [`CompletionProvider`] - the trait the response assembler consumes
//! - [`AnthropicProvider`] / [`OpenAiProvider`] - hosted APIs streamed over SSE
//! - [`EchoProvider`] / [`ScriptedProvider`] - local, credential-free providers

pub mod anthropic;
pub mod echo;
pub mod errors;
pub mod openai;
pub mod traits;
pub mod types;

use std::sync::Arc;

use crate::config::{LlmConfig, LlmProviderKind};

pub use anthropic::AnthropicProvider;
pub use echo::{EchoProvider, ScriptedProvider};
pub use errors::{LLMError, LLMResult};
pub use openai::OpenAiProvider;
pub use traits::{CompletionProvider, TokenStream};
pub use types::{CompletionMessage, CompletionRequest, CompletionSummary, StreamChunk};

/// Builds the provider selected by configuration.
///
/// # Errors
/// Returns [`LLMError::InvalidConfiguration`] when the selected provider lacks
/// credentials.
pub fn build_provider(config: &LlmConfig) -> LLMResult<Arc<dyn CompletionProvider>> {
    Ok(match config.provider {
        LlmProviderKind::Anthropic => Arc::new(AnthropicProvider::new(config)?),
        LlmProviderKind::Openai => Arc::new(OpenAiProvider::new(config)?),
        LlmProviderKind::Echo => Arc::new(EchoProvider),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_provider_follows_configuration() {
        let config = LlmConfig {
            provider: LlmProviderKind::Echo,
            ..LlmConfig::default()
        };
        assert_eq!(build_provider(&config).unwrap().name(), "echo");

        let missing_key = LlmConfig::default();
        assert!(build_provider(&missing_key).is_err());
    }
}
