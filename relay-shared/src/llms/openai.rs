//! `OpenAI`-compatible chat completions provider.

use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::LlmConfig;
use crate::llms::{
    errors::{LLMError, LLMResult},
    traits::{CompletionProvider, TokenStream},
    types::{CompletionMessage, CompletionRequest, CompletionSummary, StreamChunk},
};

const DEFAULT_MODEL: &str = "gpt-4o";

/// Streams completions from `/chat/completions`.
#[derive(Debug, Clone)]
pub struct OpenAiProvider {
    client: Client,
    api_key: String,
    base_url: String,
    default_model: String,
}

impl OpenAiProvider {
    /// Builds a provider from configuration.
    ///
    /// # Errors
    /// Returns [`LLMError::InvalidConfiguration`] when no API key is set.
    pub fn new(config: &LlmConfig) -> LLMResult<Self> {
        let api_key = config
            .openai_api_key
            .clone()
            .filter(|key| !key.is_empty())
            .ok_or_else(|| LLMError::invalid_config("openai_api_key", "OpenAI API key is required"))?;

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .build()?;

        Ok(Self {
            client,
            api_key,
            base_url: config.openai_base_url.trim_end_matches('/').to_string(),
            default_model: config
                .default_model
                .clone()
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        })
    }
}

#[derive(Serialize)]
struct ChatBody<'a> {
    model: &'a str,
    messages: &'a [CompletionMessage],
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
    stream_options: StreamOptions,
}

#[derive(Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Deserialize)]
struct ChatChunk {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<ChunkUsage>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChunkUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

/// Folds one `data:` payload into `summary`, returning any text it carried.
/// `None` signals the `[DONE]` sentinel.
pub(crate) fn apply_chunk(
    data: &str,
    summary: &mut CompletionSummary,
) -> LLMResult<Option<Option<String>>> {
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(None);
    }

    let chunk: ChatChunk = serde_json::from_str(data)?;
    if let Some(model) = chunk.model {
        summary.model = model;
    }
    if let Some(usage) = chunk.usage {
        summary.tokens_in = usage.prompt_tokens;
        summary.tokens_out = usage.completion_tokens;
    }

    let mut text = None;
    if let Some(choice) = chunk.choices.into_iter().next() {
        if choice.finish_reason.is_some() {
            summary.stop_reason = choice.finish_reason;
        }
        text = choice.delta.content.filter(|content| !content.is_empty());
    }
    Ok(Some(text))
}

#[async_trait]
impl CompletionProvider for OpenAiProvider {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn models(&self) -> Vec<String> {
        ["gpt-4o", "gpt-4o-mini", "gpt-4-turbo", "gpt-4", "gpt-3.5-turbo"]
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    async fn stream_completion(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> LLMResult<TokenStream> {
        let model = request
            .model
            .clone()
            .unwrap_or_else(|| self.default_model.clone());

        let body = ChatBody {
            model: &model,
            messages: &request.messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            stream: true,
            stream_options: StreamOptions {
                include_usage: true,
            },
        };

        debug!(model = %model, turns = request.messages.len(), "starting openai stream");
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            warn!(status, "openai stream request rejected");
            return Err(LLMError::Api { status, message });
        }

        let mut events = Box::pin(response.bytes_stream().eventsource());
        let stream = async_stream::stream! {
            let mut summary = CompletionSummary {
                model,
                ..CompletionSummary::default()
            };

            loop {
                let polled = tokio::select! {
                    biased;
                    () = cancel.cancelled() => None,
                    next = events.next() => Some(next),
                };
                let Some(next) = polled else {
                    yield Err::<StreamChunk, LLMError>(LLMError::Cancelled);
                    return;
                };
                let Some(frame) = next else { break };
                let frame = match frame {
                    Ok(frame) => frame,
                    Err(err) => {
                        yield Err(LLMError::generation_failed(err.to_string()));
                        return;
                    }
                };
                match apply_chunk(&frame.data, &mut summary) {
                    Ok(Some(Some(text))) => yield Ok(StreamChunk::Token(text)),
                    Ok(Some(None)) => {}
                    Ok(None) => break,
                    Err(err) => {
                        yield Err(err);
                        return;
                    }
                }
            }

            yield Ok(StreamChunk::Finished(summary));
        };

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_requires_api_key() {
        assert!(OpenAiProvider::new(&LlmConfig::default()).is_err());
    }

    #[test]
    fn chunks_accumulate_usage_and_finish_reason() {
        let mut summary = CompletionSummary::default();

        let first = apply_chunk(
            r#"{"model":"gpt-4o-2024-08-06","choices":[{"index":0,"delta":{"role":"assistant","content":"Hi"},"finish_reason":null}]}"#,
            &mut summary,
        )
        .unwrap();
        assert_eq!(first, Some(Some("Hi".to_string())));

        let last = apply_chunk(
            r#"{"choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}"#,
            &mut summary,
        )
        .unwrap();
        assert_eq!(last, Some(None));

        apply_chunk(
            r#"{"choices":[],"usage":{"prompt_tokens":9,"completion_tokens":2,"total_tokens":11}}"#,
            &mut summary,
        )
        .unwrap();

        assert_eq!(apply_chunk(" [DONE] ", &mut summary).unwrap(), None);
        assert_eq!(summary.model, "gpt-4o-2024-08-06");
        assert_eq!(summary.stop_reason.as_deref(), Some("stop"));
        assert_eq!((summary.tokens_in, summary.tokens_out), (9, 2));
    }
}
