//! Message-platform collaborator contract.
//!
//! The router, workflow and tutor talk to the platform through this trait so
//! tests can substitute a mock; `SlackClient` is the production
//! implementation.

use std::fmt;

use async_trait::async_trait;

use crate::repository::ThreadRef;

/// Reference to a single posted message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRef(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderKind {
    User,
    Bot,
}

/// One message in a thread, oldest first when listed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadMessage {
    pub sender: SenderKind,
    pub text: String,
    pub ts: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformError {
    /// Rate limits, server errors, network failures. Retryable.
    Transient { message: String },
    /// Everything else: bad auth, unknown channel, malformed request.
    Permanent { message: String },
}

impl PlatformError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

impl fmt::Display for PlatformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient { message } => write!(f, "transient platform error: {}", message),
            Self::Permanent { message } => write!(f, "permanent platform error: {}", message),
        }
    }
}

impl std::error::Error for PlatformError {}

/// Opaque message-platform collaborator.
#[async_trait]
pub trait ChatPlatform: Send + Sync {
    /// Post a channel message that starts a new thread; returns the thread
    /// reference used for all subsequent replies.
    async fn create_thread(&self, text: &str) -> Result<ThreadRef, PlatformError>;

    async fn post_to_thread(
        &self,
        thread_ref: &ThreadRef,
        text: &str,
    ) -> Result<MessageRef, PlatformError>;

    /// All messages in a thread, in chronological order.
    async fn get_thread_messages(
        &self,
        thread_ref: &ThreadRef,
    ) -> Result<Vec<ThreadMessage>, PlatformError>;
}
