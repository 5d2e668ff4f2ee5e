//! OpenRouter API client.
//!
//! No retry logic lives here: a 429 is surfaced as
//! [`LlmErrorKind::RateLimited`](super::LlmErrorKind) and the request queue
//! decides what to do with it.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{ByteStream, ChatMessage, LlmError, ModelClient};
use crate::agents::AgentDescriptor;

const OPENROUTER_API_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

/// OpenRouter API client.
pub struct OpenRouterClient {
    client: Client,
    api_key: String,
    default_model: String,
    api_url: String,
}

impl OpenRouterClient {
    pub fn new(api_key: String, default_model: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            default_model,
            api_url: OPENROUTER_API_URL.to_string(),
        }
    }

    /// Point the client at a different OpenAI-compatible endpoint.
    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    /// Parse Retry-After header if present.
    fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
        headers
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok().map(Duration::from_secs))
    }

    fn build_request(
        &self,
        agent: &AgentDescriptor,
        messages: &[ChatMessage],
        stream: bool,
    ) -> OpenRouterRequest {
        OpenRouterRequest {
            model: agent
                .model
                .clone()
                .unwrap_or_else(|| self.default_model.clone()),
            messages: messages.to_vec(),
            stream,
        }
    }

    /// Send the request and map transport and HTTP failures to `LlmError`.
    async fn send(&self, request: &OpenRouterRequest) -> Result<reqwest::Response, LlmError> {
        let response = self
            .client
            .post(&self.api_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .header("X-Title", "agent_swarm")
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::network_error(format!("Request timeout: {}", e))
                } else if e.is_connect() {
                    LlmError::network_error(format!("Connection failed: {}", e))
                } else {
                    LlmError::network_error(format!("Request failed: {}", e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = Self::parse_retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::from_status(status.as_u16(), &body, retry_after));
        }

        Ok(response)
    }
}

#[async_trait]
impl ModelClient for OpenRouterClient {
    async fn complete(
        &self,
        agent: &AgentDescriptor,
        messages: &[ChatMessage],
    ) -> Result<String, LlmError> {
        let request = self.build_request(agent, messages, false);
        tracing::debug!(model = %request.model, agent = %agent.name, "Sending completion request");

        let response = self.send(&request).await?;
        let body = response
            .text()
            .await
            .map_err(|e| LlmError::network_error(format!("Failed to read body: {}", e)))?;

        let parsed: OpenRouterResponse = serde_json::from_str(&body).map_err(|e| {
            LlmError::parse_error(format!("Failed to parse response: {}, body: {}", e, body))
        })?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content.unwrap_or_default())
            .ok_or_else(|| LlmError::parse_error("No choices in response"))
    }

    async fn complete_stream(
        &self,
        agent: &AgentDescriptor,
        messages: &[ChatMessage],
    ) -> Result<ByteStream, LlmError> {
        let request = self.build_request(agent, messages, true);
        tracing::debug!(model = %request.model, agent = %agent.name, "Sending streaming request");

        let response = self.send(&request).await?;
        let mut upstream = Box::pin(response.bytes_stream());

        // Re-frame SSE events into a plain stream of content bytes.
        let stream = async_stream::try_stream! {
            let mut buf: Vec<u8> = Vec::new();
            'read: while let Some(chunk) = upstream.next().await {
                let chunk = chunk.map_err(|e| LlmError::network_error(format!("Stream interrupted: {}", e)))?;
                buf.extend_from_slice(&chunk);
                while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buf.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&line).into_owned();
                    match parse_sse_line(line.trim_end()) {
                        SseLine::Content(text) => yield Bytes::from(text),
                        SseLine::Done => break 'read,
                        SseLine::Error { code, message } => {
                            Err::<(), LlmError>(LlmError::in_stream(code, message))?;
                        }
                        SseLine::Skip => {}
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

#[derive(Debug, PartialEq)]
enum SseLine {
    Content(String),
    Error { code: Option<u16>, message: String },
    Done,
    Skip,
}

/// Interpret one SSE line from an OpenAI-compatible streaming response.
fn parse_sse_line(line: &str) -> SseLine {
    let Some(data) = line.strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseLine::Done;
    }
    let Ok(chunk) = serde_json::from_str::<OpenRouterStreamChunk>(data) else {
        return SseLine::Skip;
    };
    if let Some(error) = chunk.error {
        let code = error.get("code").and_then(|c| match c {
            serde_json::Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
            serde_json::Value::String(s) => s.parse().ok(),
            _ => None,
        });
        let message = error
            .get("message")
            .map(crate::util::stringify_value)
            .unwrap_or_else(|| error.to_string());
        return SseLine::Error { code, message };
    }
    chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .filter(|c| !c.is_empty())
        .map(SseLine::Content)
        .unwrap_or(SseLine::Skip)
}

/// OpenRouter API request format.
#[derive(Debug, Serialize)]
struct OpenRouterRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct OpenRouterResponse {
    choices: Vec<OpenRouterChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenRouterChoice {
    message: OpenRouterMessage,
}

#[derive(Debug, Deserialize)]
struct OpenRouterMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenRouterStreamChunk {
    #[serde(default)]
    choices: Vec<OpenRouterStreamChoice>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct OpenRouterStreamChoice {
    delta: OpenRouterDelta,
}

#[derive(Debug, Deserialize)]
struct OpenRouterDelta {
    #[serde(default)]
    content: Option<String>,
}
