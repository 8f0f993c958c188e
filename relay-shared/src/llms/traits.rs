//! # LLM Traits
//!
//! The provider seam used by the response assembler.

use crate::llms::{
    errors::LLMResult,
    types::{CompletionRequest, StreamChunk},
};
use async_trait::async_trait;
use futures_util::Stream;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

/// Type alias for a provider token stream
pub type TokenStream = Pin<Box<dyn Stream<Item = LLMResult<StreamChunk>> + Send + 'static>>;

/// A text-generation backend that produces tokens incrementally.
///
/// Implementations yield zero or more [`StreamChunk::Token`] items followed by
/// exactly one [`StreamChunk::Finished`]. An `Err` item ends the stream.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Short provider identifier used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Models this provider accepts.
    fn models(&self) -> Vec<String>;

    /// Model used when the request names none.
    fn default_model(&self) -> &str;

    /// Starts a streaming completion.
    ///
    /// The returned stream stops producing items once `cancel` fires.
    ///
    /// # Errors
    /// Returns an error if the request cannot be started. Individual stream
    /// items may also carry errors.
    async fn stream_completion(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> LLMResult<TokenStream>;
}
