//! Async OpenAI chat-completions client.
//!
//! The server treats the generative backend as an opaque collaborator behind
//! the [`CompletionBackend`] trait: prompt in, text out. Failures are
//! classified as transient (worth retrying) or permanent (fail fast) so
//! callers can apply a retry policy to exactly the recoverable cases.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

const CHAT_COMPLETIONS_URL: &str = "https://api.openai.com/v1/chat/completions";

/// Error from the generative backend.
///
/// `Transient` covers rate limits, server errors and network failures;
/// `Permanent` covers auth failures and malformed requests, which no amount
/// of retrying will fix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    Transient { message: String },
    Permanent { message: String },
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient { message } => write!(f, "transient backend error: {}", message),
            Self::Permanent { message } => write!(f, "permanent backend error: {}", message),
        }
    }
}

impl std::error::Error for BackendError {}

/// One completion call: a system prompt, a user prompt, and sampling knobs.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system_prompt: String,
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Opaque generative-backend collaborator.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<String, BackendError>;
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

/// OpenAI chat-completions client.
#[derive(Clone)]
pub struct OpenAiClient {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

impl OpenAiClient {
    pub fn new(api_key: String, model: String) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("lexibot/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            api_key,
            model,
        }
    }
}

#[async_trait]
impl CompletionBackend for OpenAiClient {
    async fn complete(&self, request: CompletionRequest) -> Result<String, BackendError> {
        let body = ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: request.system_prompt,
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: request.prompt,
                },
            ],
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let response = self
            .client
            .post(CHAT_COMPLETIONS_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::Transient {
                message: format!("request failed: {}", e),
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable error body>".to_string());
            let message = format!("OpenAI API error: {} - {}", status, error_text);

            // 429 and 5xx are worth retrying; everything else in 4xx is a
            // problem with our request or credentials.
            if status.as_u16() == 429 || status.is_server_error() {
                warn!("Transient OpenAI failure: {}", message);
                return Err(BackendError::Transient { message });
            }
            return Err(BackendError::Permanent { message });
        }

        let completion: ChatCompletionResponse =
            response
                .json()
                .await
                .map_err(|e| BackendError::Transient {
                    message: format!("failed to parse completion response: {}", e),
                })?;

        completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| BackendError::Transient {
                message: "completion response contained no choices".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        let transient = BackendError::Transient {
            message: "429".to_string(),
        };
        let permanent = BackendError::Permanent {
            message: "401".to_string(),
        };
        assert!(transient.is_transient());
        assert!(!permanent.is_transient());
    }

    #[test]
    fn completion_request_serializes_both_roles() {
        let body = ChatCompletionRequest {
            model: "gpt-4o".to_string(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: "sys".to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: "hello".to_string(),
                },
            ],
            temperature: 0.7,
            max_tokens: 300,
        };

        let value = serde_json::to_value(&body).expect("Failed to serialize request");
        assert_eq!(value["model"], "gpt-4o");
        assert_eq!(value["messages"][0]["role"], "system");
        assert_eq!(value["messages"][1]["content"], "hello");
    }

    #[test]
    fn response_parsing_extracts_first_choice() {
        let raw = r#"{"choices":[{"message":{"content":"ephemeral"}}]}"#;
        let parsed: ChatCompletionResponse = serde_json::from_str(raw).expect("parse");
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content);
        assert_eq!(content.as_deref(), Some("ephemeral"));
    }
}
