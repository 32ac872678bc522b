//! LLM client abstraction: multimodal chat completion against an
//! OpenAI-compatible endpoint.
//!
//! This mirrors a provider-abstraction split seen in single-provider
//! agent clients: wire types separated from the trait, with pure
//! `build_request`/`parse_response` helpers kept free functions for
//! unit testing without a network call.

pub mod client;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// A single message exchanged with the LLM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Message role (`system`, `user`, `assistant`).
    pub role: ChatRole,
    /// Message content -- plain text or interleaved text/image parts.
    pub content: ChatContent,
}

/// Conversation participant role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    /// System instructions.
    System,
    /// Human/caller-supplied content.
    User,
    /// Prior assistant output, replayed for context.
    Assistant,
}

/// Message content: plain text, or a sequence of text/image parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatContent {
    /// Plain text content.
    Text(String),
    /// Structured content blocks (text and inline images).
    Parts(Vec<ChatContentPart>),
}

impl ChatContent {
    /// Extract the plain text, joining all text parts.
    pub fn text(&self) -> String {
        match self {
            Self::Text(t) => t.clone(),
            Self::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ChatContentPart::Text { text } => Some(text.as_str()),
                    ChatContentPart::ImageUrl { .. } => None,
                })
                .collect(),
        }
    }
}

/// One content block within a multimodal message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatContentPart {
    /// Plain text segment.
    Text {
        /// The text.
        text: String,
    },
    /// An inline image, as a `data:<mime>;base64,<b64>` URL.
    ImageUrl {
        /// The image reference.
        image_url: ImageUrlRef,
    },
}

/// An inline image reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrlRef {
    /// `data:<mime>;base64,<b64>` URL.
    pub url: String,
}

impl ChatContentPart {
    /// Build an image content part from raw bytes and a declared MIME type.
    pub fn image(mime: &str, bytes: &[u8]) -> Self {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine;
        let encoded = STANDARD.encode(bytes);
        Self::ImageUrl {
            image_url: ImageUrlRef {
                url: format!("data:{mime};base64,{encoded}"),
            },
        }
    }
}

/// Maximum images permitted per call (§4.2).
pub const MAX_IMAGES_PER_CALL: usize = 8;

/// A request to the LLM client for a completion.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Conversation turns, in order.
    pub messages: Vec<ChatMessage>,
    /// Sampling temperature. The pipeline always passes `0.0` (§4.7
    /// "every LLM call uses temperature 0").
    pub temperature: f32,
    /// Optional max tokens in the response.
    pub max_tokens: Option<u32>,
}

/// Token usage for a completion.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    /// Prompt tokens consumed.
    pub input_tokens: u32,
    /// Completion tokens generated.
    pub output_tokens: u32,
}

/// The result of a successful chat completion.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    /// Raw assistant text.
    pub text: String,
    /// Token usage for the call.
    pub usage: Usage,
}

/// Failure modes surfaced by the LLM client (§4.2).
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// The call did not complete within the configured deadline.
    #[error("llm call timed out")]
    Timeout,
    /// Transport-level failure (DNS, connection reset, etc.).
    #[error("llm transport error: {0}")]
    Transport(String),
    /// Upstream responded with a non-2xx status.
    #[error("llm endpoint returned status {status}: {body}")]
    HttpStatus {
        /// HTTP status code.
        status: u16,
        /// Sanitized response body.
        body: String,
    },
    /// Response body was not a parseable chat-completion envelope.
    #[error("llm response parse error: {0}")]
    ParseError(String),
}

/// Core LLM client interface. A single concrete implementation
/// ([`client::OpenAiCompatClient`]) backs the upstream, opaque,
/// OpenAI-compatible chat endpoint named in scope (§1).
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Request a completion from the LLM.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError`] on timeout, transport, HTTP-status, or parse
    /// failure.
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, LlmError>;
}

/// Redact API-key-shaped substrings and collapse/truncate an upstream
/// error body before it is logged or stored.
pub fn sanitize_error_body(raw: &str) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");

    let mut sanitized = collapsed;
    for pattern in [
        r"sk-[A-Za-z0-9]{20,}",
        r"Bearer [A-Za-z0-9_\-\.]{10,}",
        r"ghp_[A-Za-z0-9]{20,}",
    ] {
        if let Ok(regex) = Regex::new(pattern) {
            sanitized = regex.replace_all(&sanitized, "[REDACTED]").into_owned();
        }
    }

    const MAX_ERROR_BODY_CHARS: usize = 256;
    if sanitized.chars().count() > MAX_ERROR_BODY_CHARS {
        let shortened = sanitized.chars().take(MAX_ERROR_BODY_CHARS).collect::<String>();
        return format!("{shortened}...[truncated]");
    }
    sanitized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_extracts_from_parts() {
        let content = ChatContent::Parts(vec![
            ChatContentPart::Text { text: "a".to_owned() },
            ChatContentPart::image("image/png", b"x"),
            ChatContentPart::Text { text: "b".to_owned() },
        ]);
        assert_eq!(content.text(), "ab");
    }

    #[test]
    fn sanitize_redacts_api_keys() {
        let raw = "error: invalid key sk-abcdefghijklmnopqrstuvwxyz";
        let cleaned = sanitize_error_body(raw);
        assert!(!cleaned.contains("abcdefghijklmnopqrstuvwxyz"));
        assert!(cleaned.contains("[REDACTED]"));
    }
}
