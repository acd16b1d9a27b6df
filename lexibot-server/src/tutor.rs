//! Conversational tutoring for follow-up messages in a word's thread.

use std::sync::Arc;

use tracing::{error, info};

use lexibot_core::prompts;
use lexibot_core::{BackendError, CompletionRequest};

use crate::platform::{SenderKind, ThreadMessage};
use crate::repository::{ThreadRef, WordEntry};
use crate::AppState;

// Slightly higher temperature and a short budget keep replies conversational.
const TUTOR_TEMPERATURE: f32 = 0.7;
const TUTOR_MAX_TOKENS: u32 = 150;

const FALLBACK_REPLY: &str = "Let me help you with that word. Could you try using it in a \
     sentence, or would you like more examples?";

/// Format a thread's history for the tutoring prompt, oldest first.
///
/// Empty messages are skipped.
pub fn format_thread_context(messages: &[ThreadMessage]) -> String {
    messages
        .iter()
        .filter(|msg| !msg.text.is_empty())
        .map(|msg| match msg.sender {
            SenderKind::Bot => format!("Bot: {}", msg.text),
            SenderKind::User => format!("User: {}", msg.text),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Produce the tutor's reply to a user message in a word's thread.
///
/// Never fails toward the user: backend or platform trouble degrades to a
/// static fallback reply, with the real error logged.
pub async fn tutor_reply(
    state: &AppState,
    entry: &WordEntry,
    thread_ref: &ThreadRef,
    user_message: &str,
) -> String {
    info!("Generating tutor response for word '{}'", entry.word);

    let thread_context = match state.platform.get_thread_messages(thread_ref).await {
        Ok(messages) => format_thread_context(&messages),
        Err(e) => {
            error!("Failed to fetch thread context for {}: {}", thread_ref, e);
            String::new()
        }
    };

    let theme = match state.repository.current_theme().await {
        Ok(theme) => theme,
        Err(e) => {
            error!("Failed to read theme for tutoring: {}", e);
            None
        }
    };

    let request = CompletionRequest {
        system_prompt: prompts::system_prompt(),
        prompt: prompts::tutor_prompt(
            &thread_context,
            user_message,
            &entry.word,
            theme.as_deref(),
        ),
        temperature: TUTOR_TEMPERATURE,
        max_tokens: TUTOR_MAX_TOKENS,
    };

    let backend = Arc::clone(&state.backend);
    let result = state
        .retry
        .run(
            "tutoring call",
            move || {
                let backend = Arc::clone(&backend);
                let request = request.clone();
                async move { backend.complete(request).await }
            },
            BackendError::is_transient,
        )
        .await;

    match result {
        Ok(reply) => reply.trim().to_string(),
        Err(e) => {
            error!("Tutoring call failed for word '{}': {}", entry.word, e);
            FALLBACK_REPLY.to_string()
        }
    }
}
