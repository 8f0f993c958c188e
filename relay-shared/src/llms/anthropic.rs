//! Anthropic Messages API provider.

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

const DEFAULT_MODEL: &str = "claude-3-5-sonnet-20241022";
const API_VERSION: &str = "2023-06-01";

/// Streams completions from the Anthropic Messages API.
#[derive(Debug, Clone)]
pub struct AnthropicProvider {
    client: Client,
    api_key: String,
    base_url: String,
    default_model: String,
}

impl AnthropicProvider {
    /// Builds a provider from configuration.
    ///
    /// # Errors
    /// Returns [`LLMError::InvalidConfiguration`] when no API key is set.
    pub fn new(config: &LlmConfig) -> LLMResult<Self> {
        let api_key = config
            .anthropic_api_key
            .clone()
            .filter(|key| !key.is_empty())
            .ok_or_else(|| {
                LLMError::invalid_config("anthropic_api_key", "Anthropic API key is required")
            })?;

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .build()?;

        Ok(Self {
            client,
            api_key,
            base_url: config.anthropic_base_url.trim_end_matches('/').to_string(),
            default_model: config
                .default_model
                .clone()
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        })
    }
}

#[derive(Serialize)]
struct MessagesBody<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<&'a CompletionMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    MessageStart {
        message: StartedMessage,
    },
    ContentBlockDelta {
        delta: ContentDelta,
    },
    MessageDelta {
        delta: MessageDeltaBody,
        #[serde(default)]
        usage: Option<Usage>,
    },
    MessageStop,
    Error {
        error: ErrorBody,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct StartedMessage {
    model: String,
    #[serde(default)]
    usage: Usage,
}

#[derive(Deserialize, Default)]
struct Usage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentDelta {
    TextDelta {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct MessageDeltaBody {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(rename = "type")]
    kind: String,
    message: String,
}

/// What one SSE frame contributed to the generation.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum FrameOutcome {
    Token(String),
    Continue,
    Stop,
}

/// Folds one `data:` payload into `summary`.
pub(crate) fn apply_frame(data: &str, summary: &mut CompletionSummary) -> LLMResult<FrameOutcome> {
    match serde_json::from_str::<StreamEvent>(data)? {
        StreamEvent::MessageStart { message } => {
            summary.model = message.model;
            summary.tokens_in = message.usage.input_tokens;
            Ok(FrameOutcome::Continue)
        }
        StreamEvent::ContentBlockDelta {
            delta: ContentDelta::TextDelta { text },
        } if !text.is_empty() => Ok(FrameOutcome::Token(text)),
        StreamEvent::MessageDelta { delta, usage } => {
            if delta.stop_reason.is_some() {
                summary.stop_reason = delta.stop_reason;
            }
            if let Some(usage) = usage {
                summary.tokens_out = usage.output_tokens;
            }
            Ok(FrameOutcome::Continue)
        }
        StreamEvent::MessageStop => Ok(FrameOutcome::Stop),
        StreamEvent::Error { error } => Err(LLMError::generation_failed(format!(
            "{}: {}",
            error.kind, error.message
        ))),
        StreamEvent::ContentBlockDelta { .. } | StreamEvent::Other => Ok(FrameOutcome::Continue),
    }
}

#[async_trait]
impl CompletionProvider for AnthropicProvider {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn models(&self) -> Vec<String> {
        [
            "claude-3-5-sonnet-20241022",
            "claude-3-5-haiku-20241022",
            "claude-3-opus-20240229",
            "claude-3-sonnet-20240229",
            "claude-3-haiku-20240307",
        ]
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

        let system = request
            .messages
            .iter()
            .filter(|message| message.role == "system")
            .map(|message| message.content.as_str())
            .collect::<Vec<_>>();
        let body = MessagesBody {
            model: &model,
            max_tokens: request.max_tokens,
            messages: request
                .messages
                .iter()
                .filter(|message| message.role != "system")
                .collect(),
            system: (!system.is_empty()).then(|| system.join("\n\n")),
            temperature: request.temperature,
            stream: true,
        };

        debug!(model = %model, turns = body.messages.len(), "starting anthropic stream");
        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            warn!(status, "anthropic stream request rejected");
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
                match apply_frame(&frame.data, &mut summary) {
                    Ok(FrameOutcome::Token(text)) => yield Ok(StreamChunk::Token(text)),
                    Ok(FrameOutcome::Continue) => {}
                    Ok(FrameOutcome::Stop) => break,
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
