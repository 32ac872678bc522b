//! Concrete OpenAI-compatible chat-completions client.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{sanitize_error_body, ChatContent, ChatContentPart, ChatRequest, ChatResponse, LlmClient, LlmError, Usage};

/// Network-level retry count on timeout or 5xx (§4.2).
const MAX_RETRIES: u32 = 2;
/// Backoff delays, in order, matching `MAX_RETRIES` attempts.
const RETRY_BACKOFF: [Duration; 2] = [Duration::from_millis(250), Duration::from_secs(1)];

#[derive(Debug, Serialize)]
struct WireRequest {
    model: String,
    messages: Vec<WireMessage>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: Value,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireResponseMessage,
}

#[derive(Debug, Deserialize)]
struct WireResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}

/// Build the wire request body from a [`ChatRequest`].
pub fn build_request(model: &str, request: &ChatRequest) -> WireRequest {
    let messages = request
        .messages
        .iter()
        .map(|m| WireMessage {
            role: role_str(m.role),
            content: content_to_wire(&m.content),
        })
        .collect();

    WireRequest {
        model: model.to_owned(),
        messages,
        temperature: request.temperature,
        max_tokens: request.max_tokens,
    }
}

fn role_str(role: super::ChatRole) -> &'static str {
    match role {
        super::ChatRole::System => "system",
        super::ChatRole::User => "user",
        super::ChatRole::Assistant => "assistant",
    }
}

fn content_to_wire(content: &ChatContent) -> Value {
    match content {
        ChatContent::Text(text) => Value::String(text.clone()),
        ChatContent::Parts(parts) => {
            let wire_parts: Vec<Value> = parts
                .iter()
                .map(|part| match part {
                    ChatContentPart::Text { text } => serde_json::json!({
                        "type": "text",
                        "text": text,
                    }),
                    ChatContentPart::ImageUrl { image_url } => serde_json::json!({
                        "type": "image_url",
                        "image_url": { "url": image_url.url },
                    }),
                })
                .collect();
            Value::Array(wire_parts)
        }
    }
}

/// Parse a wire response body into a [`ChatResponse`].
///
/// # Errors
///
/// Returns [`LlmError::ParseError`] when the body is not a valid
/// chat-completion envelope or carries no choices.
pub fn parse_response(body: &str) -> Result<ChatResponse, LlmError> {
    let resp: WireResponse =
        serde_json::from_str(body).map_err(|e| LlmError::ParseError(e.to_string()))?;

    let choice = resp
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| LlmError::ParseError("missing choices[0]".to_owned()))?;

    let text = choice.message.content.unwrap_or_default();

    let usage = Usage {
        input_tokens: resp.usage.as_ref().and_then(|u| u.prompt_tokens).unwrap_or(0),
        output_tokens: resp
            .usage
            .as_ref()
            .and_then(|u| u.completion_tokens)
            .unwrap_or(0),
    };

    Ok(ChatResponse { text, usage })
}

/// Concrete client for an OpenAI-compatible `/v1/chat/completions` endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiCompatClient {
    endpoint: String,
    model: String,
    api_key: String,
    timeout: Duration,
    http: reqwest::Client,
}

impl OpenAiCompatClient {
    /// Construct a new client for the given endpoint, model, and API key.
    pub fn new(endpoint: String, model: String, api_key: String, timeout_ms: u64) -> Self {
        Self {
            endpoint,
            model,
            api_key,
            timeout: Duration::from_millis(timeout_ms),
            http: reqwest::Client::new(),
        }
    }

    async fn send_once(&self, wire: &WireRequest) -> Result<String, LlmError> {
        let response = tokio::time::timeout(
            self.timeout,
            self.http
                .post(&self.endpoint)
                .header("content-type", "application/json")
                .header("authorization", format!("Bearer {}", self.api_key))
                .json(wire)
                .send(),
        )
        .await
        .map_err(|_| LlmError::Timeout)?
        .map_err(|e| LlmError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(LlmError::HttpStatus {
                status: status.as_u16(),
                body: sanitize_error_body(&body),
            });
        }

        Ok(body)
    }

    fn should_retry(err: &LlmError) -> bool {
        matches!(err, LlmError::Timeout) || matches!(err, LlmError::HttpStatus { status, .. } if *status >= 500)
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatClient {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, LlmError> {
        let wire = build_request(&self.model, &request);

        let mut attempt = 0usize;
        loop {
            match self.send_once(&wire).await {
                Ok(body) => return parse_response(&body),
                Err(err) if attempt < MAX_RETRIES as usize && Self::should_retry(&err) => {
                    tokio::time::sleep(RETRY_BACKOFF[attempt]).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ChatMessage, ChatRole};

    #[test]
    fn build_request_maps_text_message() {
        let req = ChatRequest {
            messages: vec![ChatMessage {
                role: ChatRole::User,
                content: ChatContent::Text("hello".to_owned()),
            }],
            temperature: 0.0,
            max_tokens: Some(100),
        };
        let wire = build_request("gpt-4o", &req);
        assert_eq!(wire.model, "gpt-4o");
        assert_eq!(wire.messages.len(), 1);
        assert_eq!(wire.messages[0].role, "user");
    }

    #[test]
    fn parse_response_extracts_text_and_usage() {
        let body = r#"{
            "choices": [{"message": {"content": "LAB"}}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3}
        }"#;
        let resp = parse_response(body).expect("parse");
        assert_eq!(resp.text, "LAB");
        assert_eq!(resp.usage.input_tokens, 12);
        assert_eq!(resp.usage.output_tokens, 3);
    }

    #[test]
    fn parse_response_missing_choices_is_parse_error() {
        let body = r#"{"choices": [], "usage": null}"#;
        let err = parse_response(body).unwrap_err();
        assert!(matches!(err, LlmError::ParseError(_)));
    }
}
