//! Model-call interface.
//!
//! The engine treats the language model as an opaque function from an agent
//! descriptor plus a conversation to text. Interpretation of that text
//! (see [`crate::stream`]) and retries (see [`crate::queue`]) stay on the
//! engine side of this boundary.
//!
//! OpenRouter is the bundled implementation.

mod error;
mod openrouter;

pub use error::{classify_http_status, LlmError, LlmErrorKind};
pub use openrouter::OpenRouterClient;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::agents::AgentDescriptor;

/// Raw model output as it arrives, one chunk at a time.
pub type ByteStream = BoxStream<'static, Result<Bytes, LlmError>>;

/// Role in a chat conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// Content part of a structured message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
}

/// Message content - either simple text or structured parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Render the content as a single string.
    ///
    /// Text is returned as-is; structured parts are serialized to JSON.
    pub fn to_text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Parts(parts) => {
                serde_json::to_string(parts).unwrap_or_default()
            }
        }
    }
}

/// A message in an agent's conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: MessageContent,
}

impl ChatMessage {
    /// Create a simple text message.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        ChatMessage {
            role,
            content: MessageContent::Text(content.into()),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Get the text content of this message.
    pub fn text(&self) -> String {
        self.content.to_text()
    }
}

/// A language-model backend.
///
/// Implementations must signal provider rate limiting with
/// [`LlmErrorKind::RateLimited`] so the request queue can back off.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Run a completion and return the full response text.
    async fn complete(
        &self,
        agent: &AgentDescriptor,
        messages: &[ChatMessage],
    ) -> Result<String, LlmError>;

    /// Run a completion and return the response as a raw byte stream.
    ///
    /// Default implementation wraps `complete` in a single-chunk stream.
    async fn complete_stream(
        &self,
        agent: &AgentDescriptor,
        messages: &[ChatMessage],
    ) -> Result<ByteStream, LlmError> {
        let text = self.complete(agent, messages).await?;
        Ok(Box::pin(futures::stream::once(async move {
            Ok(Bytes::from(text))
        })))
    }
}
