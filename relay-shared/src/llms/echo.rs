//! Local providers that need no credentials: an echo provider for development
//! and a scripted provider for exercising the response pipeline.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::llms::{
    errors::{LLMError, LLMResult},
    traits::{CompletionProvider, TokenStream},
    types::{CompletionRequest, CompletionSummary, StreamChunk},
};

/// Repeats the last user message back one word at a time.
#[derive(Debug, Clone, Default)]
pub struct EchoProvider;

#[async_trait]
impl CompletionProvider for EchoProvider {
    fn name(&self) -> &'static str {
        "echo"
    }

    fn models(&self) -> Vec<String> {
        vec!["echo".to_string()]
    }

    fn default_model(&self) -> &str {
        "echo"
    }

    async fn stream_completion(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> LLMResult<TokenStream> {
        let text = request
            .last_user_message()
            .ok_or_else(|| LLMError::invalid_input("no user message to echo"))?;
        let tokens = split_words(text);
        let summary = CompletionSummary {
            model: request.model.unwrap_or_else(|| "echo".to_string()),
            tokens_in: u32::try_from(request.messages.len()).unwrap_or(u32::MAX),
            tokens_out: u32::try_from(tokens.len()).unwrap_or(u32::MAX),
            stop_reason: Some("end_turn".to_string()),
        };
        Ok(scripted_stream(tokens, None, None, summary, cancel))
    }
}

/// Splits text into word tokens that keep their leading whitespace, so the
/// concatenation of all tokens equals the input.
fn split_words(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        if ch.is_whitespace() && !current.trim().is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
        current.push(ch);
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Replays a fixed token list, optionally failing part way through.
#[derive(Debug, Clone)]
pub struct ScriptedProvider {
    tokens: Vec<String>,
    failure: Option<(usize, String)>,
    delay: Option<Duration>,
    requests: Arc<Mutex<Vec<CompletionRequest>>>,
}

impl ScriptedProvider {
    /// Provider that emits `tokens` then finishes.
    #[must_use]
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
            failure: None,
            delay: None,
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Fails with `reason` after emitting `emitted` tokens.
    #[must_use]
    pub fn failing_after(mut self, emitted: usize, reason: impl Into<String>) -> Self {
        self.failure = Some((emitted, reason.into()));
        self
    }

    /// Waits `delay` before each token.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Requests received so far.
    #[must_use]
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn models(&self) -> Vec<String> {
        vec!["scripted".to_string()]
    }

    fn default_model(&self) -> &str {
        "scripted"
    }

    async fn stream_completion(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> LLMResult<TokenStream> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        let summary = CompletionSummary {
            model: request.model.unwrap_or_else(|| "scripted".to_string()),
            tokens_in: u32::try_from(request.messages.len()).unwrap_or(u32::MAX),
            tokens_out: u32::try_from(self.tokens.len()).unwrap_or(u32::MAX),
            stop_reason: Some("end_turn".to_string()),
        };
        Ok(scripted_stream(
            self.tokens.clone(),
            self.failure.clone(),
            self.delay,
            summary,
            cancel,
        ))
    }
}

fn scripted_stream(
    tokens: Vec<String>,
    failure: Option<(usize, String)>,
    delay: Option<Duration>,
    summary: CompletionSummary,
    cancel: CancellationToken,
) -> TokenStream {
    Box::pin(async_stream::stream! {
        for (index, token) in tokens.into_iter().enumerate() {
            if let Some((emitted, reason)) = failure.as_ref() {
                if index == *emitted {
                    yield Err::<StreamChunk, LLMError>(LLMError::generation_failed(reason.clone()));
                    return;
                }
            }
            if let Some(delay) = delay {
                let cancelled = tokio::select! {
                    () = cancel.cancelled() => true,
                    () = tokio::time::sleep(delay) => false,
                };
                if cancelled {
                    yield Err(LLMError::Cancelled);
                    return;
                }
            } else if cancel.is_cancelled() {
                yield Err(LLMError::Cancelled);
                return;
            }
            yield Ok(StreamChunk::Token(token));
        }
        if let Some((_, reason)) = failure {
            yield Err(LLMError::generation_failed(reason));
            return;
        }
        yield Ok(StreamChunk::Finished(summary));
    })
}
