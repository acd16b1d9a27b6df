//! Slack Web API client implementing `ChatPlatform`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::platform::{ChatPlatform, MessageRef, PlatformError, SenderKind, ThreadMessage};
use crate::repository::ThreadRef;

const POST_MESSAGE_URL: &str = "https://slack.com/api/chat.postMessage";
const CONVERSATIONS_REPLIES_URL: &str = "https://slack.com/api/conversations.replies";

#[derive(Clone)]
pub struct SlackClient {
    client: reqwest::Client,
    token: String,
    channel_id: String,
}

#[derive(Debug, Serialize)]
struct PostMessageRequest<'a> {
    channel: &'a str,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    thread_ts: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct PostMessageResponse {
    ok: bool,
    ts: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RepliesResponse {
    ok: bool,
    error: Option<String>,
    #[serde(default)]
    messages: Vec<RepliesMessage>,
    #[serde(default)]
    has_more: bool,
    response_metadata: Option<ResponseMetadata>,
}

#[derive(Debug, Deserialize)]
struct RepliesMessage {
    #[serde(default)]
    text: String,
    #[serde(default)]
    ts: String,
    bot_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMetadata {
    next_cursor: Option<String>,
}

/// Slack API errors that a retry can plausibly fix.
fn is_transient_api_error(error: &str) -> bool {
    matches!(
        error,
        "ratelimited" | "rate_limited" | "service_unavailable" | "internal_error" | "fatal_error"
    )
}

impl SlackClient {
    pub fn new(token: String, channel_id: String) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("lexibot/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            token,
            channel_id,
        }
    }

    fn classify_http(e: reqwest::Error) -> PlatformError {
        PlatformError::Transient {
            message: format!("request failed: {}", e),
        }
    }

    fn classify_status(status: reqwest::StatusCode, body: &str) -> PlatformError {
        let message = format!("Slack API HTTP error: {} - {}", status, body);
        if status.as_u16() == 429 || status.is_server_error() {
            PlatformError::Transient { message }
        } else {
            PlatformError::Permanent { message }
        }
    }

    fn classify_api_error(operation: &str, error: Option<String>) -> PlatformError {
        let error = error.unwrap_or_else(|| "unknown_error".to_string());
        let message = format!("{} failed: {}", operation, error);
        if is_transient_api_error(&error) {
            PlatformError::Transient { message }
        } else {
            PlatformError::Permanent { message }
        }
    }

    async fn post_message(
        &self,
        text: &str,
        thread_ts: Option<&str>,
    ) -> Result<String, PlatformError> {
        let request = PostMessageRequest {
            channel: &self.channel_id,
            text,
            thread_ts,
        };

        let response = self
            .client
            .post(POST_MESSAGE_URL)
            .bearer_auth(&self.token)
            .json(&request)
            .send()
            .await
            .map_err(Self::classify_http)?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable error body>".to_string());
            return Err(Self::classify_status(status, &body));
        }

        let parsed: PostMessageResponse =
            response.json().await.map_err(|e| PlatformError::Transient {
                message: format!("failed to parse chat.postMessage response: {}", e),
            })?;

        if !parsed.ok {
            return Err(Self::classify_api_error("chat.postMessage", parsed.error));
        }

        parsed.ts.ok_or_else(|| PlatformError::Permanent {
            message: "chat.postMessage response missing ts".to_string(),
        })
    }
}

#[async_trait]
impl ChatPlatform for SlackClient {
    async fn create_thread(&self, text: &str) -> Result<ThreadRef, PlatformError> {
        let ts = self.post_message(text, None).await?;
        info!("Created new thread with ref {}", ts);
        Ok(ThreadRef(ts))
    }

    async fn post_to_thread(
        &self,
        thread_ref: &ThreadRef,
        text: &str,
    ) -> Result<MessageRef, PlatformError> {
        let ts = self.post_message(text, Some(&thread_ref.0)).await?;
        info!("Posted message to thread {}", thread_ref);
        Ok(MessageRef(ts))
    }

    async fn get_thread_messages(
        &self,
        thread_ref: &ThreadRef,
    ) -> Result<Vec<ThreadMessage>, PlatformError> {
        let mut messages = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut query: Vec<(&str, String)> = vec![
                ("channel", self.channel_id.clone()),
                ("ts", thread_ref.0.clone()),
                ("limit", "100".to_string()),
            ];
            if let Some(cursor) = &cursor {
                query.push(("cursor", cursor.clone()));
            }

            let response = self
                .client
                .get(CONVERSATIONS_REPLIES_URL)
                .bearer_auth(&self.token)
                .query(&query)
                .send()
                .await
                .map_err(Self::classify_http)?;

            let status = response.status();
            if !status.is_success() {
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "<unreadable error body>".to_string());
                return Err(Self::classify_status(status, &body));
            }

            let parsed: RepliesResponse =
                response.json().await.map_err(|e| PlatformError::Transient {
                    message: format!("failed to parse conversations.replies response: {}", e),
                })?;

            if !parsed.ok {
                return Err(Self::classify_api_error(
                    "conversations.replies",
                    parsed.error,
                ));
            }

            messages.extend(parsed.messages.into_iter().map(|msg| ThreadMessage {
                sender: if msg.bot_id.is_some() {
                    SenderKind::Bot
                } else {
                    SenderKind::User
                },
                text: msg.text,
                ts: msg.ts,
            }));

            if !parsed.has_more {
                break;
            }

            cursor = parsed
                .response_metadata
                .and_then(|metadata| metadata.next_cursor)
                .filter(|cursor| !cursor.is_empty());

            if cursor.is_none() {
                warn!("conversations.replies reported has_more without a cursor");
                break;
            }
        }

        info!(
            "Retrieved {} messages from thread {}",
            messages.len(),
            thread_ref
        );
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_api_errors_are_classified() {
        assert!(is_transient_api_error("ratelimited"));
        assert!(is_transient_api_error("internal_error"));
        assert!(!is_transient_api_error("channel_not_found"));
        assert!(!is_transient_api_error("invalid_auth"));
    }

    #[test]
    fn replies_response_parses_bot_and_user_messages() {
        let raw = r#"{
            "ok": true,
            "messages": [
                {"text": "ephemeral", "ts": "1.0", "bot_id": "B123"},
                {"text": "what does it mean?", "ts": "2.0", "user": "U123"}
            ],
            "has_more": false
        }"#;
        let parsed: RepliesResponse = serde_json::from_str(raw).unwrap();
        assert!(parsed.ok);
        assert_eq!(parsed.messages.len(), 2);
        assert!(parsed.messages[0].bot_id.is_some());
        assert!(parsed.messages[1].bot_id.is_none());
    }

    #[test]
    fn post_message_request_omits_thread_ts_for_new_threads() {
        let request = PostMessageRequest {
            channel: "C123",
            text: "hello",
            thread_ts: None,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert!(value.get("thread_ts").is_none());
    }
}
