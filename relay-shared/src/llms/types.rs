//! # LLM Types
//!
//! Request and streaming types exchanged with generation providers.

use serde::{Deserialize, Serialize};

use crate::models::{Message, Role};

/// One prior turn handed to the provider as context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompletionMessage {
    /// `user`, `assistant` or `system`.
    pub role: String,
    /// Turn text.
    pub content: String,
}

impl From<&Message> for CompletionMessage {
    fn from(message: &Message) -> Self {
        // Providers accept no tool role in plain chat; tool output is replayed as user context.
        let role = match message.role {
            Role::Tool => Role::User,
            other => other,
        };
        Self {
            role: role.as_str().to_string(),
            content: message.content.clone(),
        }
    }
}

/// A streaming completion request.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    /// Model override; the provider default applies when absent.
    pub model: Option<String>,
    /// Conversation context, oldest first.
    pub messages: Vec<CompletionMessage>,
    /// Completion token cap.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: Option<f32>,
}

impl CompletionRequest {
    /// Builds a request from conversation history.
    #[must_use]
    pub fn from_history(history: &[Message], model: Option<String>, max_tokens: u32) -> Self {
        Self {
            model,
            messages: history.iter().map(CompletionMessage::from).collect(),
            max_tokens,
            temperature: None,
        }
    }

    /// Last user turn in the request, if any.
    #[must_use]
    pub fn last_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|message| message.role == "user")
            .map(|message| message.content.as_str())
    }
}

/// Provider accounting for a finished generation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletionSummary {
    /// Model that produced the output.
    pub model: String,
    /// Prompt tokens.
    pub tokens_in: u32,
    /// Completion tokens.
    pub tokens_out: u32,
    /// Why generation stopped.
    pub stop_reason: Option<String>,
}

/// Item of a provider token stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamChunk {
    /// Incremental text.
    Token(String),
    /// Generation ended normally; always the last item.
    Finished(CompletionSummary),
}
