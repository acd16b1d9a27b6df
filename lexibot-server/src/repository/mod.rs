//! Repository abstraction for vocabulary history, settings and
//! processed-event bookkeeping.
//!
//! The `VocabRepository` trait abstracts the storage backend so the router
//! and workflow are testable against an in-memory implementation while
//! production runs on SQLite.

mod memory;
mod sqlite;

pub use memory::InMemoryRepository;
pub use sqlite::SqliteRepository;

use std::fmt;

use async_trait::async_trait;

/// Newtype for the word row id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WordId(pub i64);

impl fmt::Display for WordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque identifier binding a conversation thread to a word.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ThreadRef(pub String);

impl fmt::Display for ThreadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ThreadRef {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ThreadRef {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Tri-state resolution marker for a word.
///
/// `Pending` means the user has not yet replied in the word's thread;
/// the first substantive reply moves it to `Known` or `Learning` exactly
/// once, and it never changes again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Pending,
    Known,
    Learning,
}

impl Resolution {
    /// SQL encoding: NULL = pending, 1 = known, 0 = learning.
    pub fn to_sql(self) -> Option<i64> {
        match self {
            Self::Pending => None,
            Self::Known => Some(1),
            Self::Learning => Some(0),
        }
    }

    pub fn from_sql(value: Option<i64>) -> Self {
        match value {
            None => Self::Pending,
            Some(0) => Self::Learning,
            Some(_) => Self::Known,
        }
    }

    pub fn is_pending(self) -> bool {
        matches!(self, Self::Pending)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Known => write!(f, "known"),
            Self::Learning => write!(f, "learning"),
        }
    }
}

/// One vocabulary word and its lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WordEntry {
    pub id: WordId,
    pub word: String,
    pub resolution: Resolution,
    pub thread_ref: Option<ThreadRef>,
    /// Unix seconds.
    pub created_at: i64,
}

/// Filter for listing history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WordFilter {
    All,
    Known,
    Learning,
}

/// Outcome of recording a processed event.
///
/// `AlreadyProcessed` is the Conflict case: not an error from the caller's
/// perspective, the key had already been claimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Recorded,
    AlreadyProcessed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    /// A word with the same spelling (case-insensitive) already exists.
    DuplicateWord { word: String },
    WordNotFound { id: WordId },
    Storage {
        operation: &'static str,
        message: String,
    },
}

impl RepositoryError {
    pub fn storage(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Storage {
            operation,
            message: message.into(),
        }
    }
}

impl fmt::Display for RepositoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateWord { word } => write!(f, "word '{}' already exists", word),
            Self::WordNotFound { id } => write!(f, "word {} not found", id),
            Self::Storage { operation, message } => {
                write!(f, "storage error during {}: {}", operation, message)
            }
        }
    }
}

impl std::error::Error for RepositoryError {}

/// Storage backend for vocabulary history, the settings singleton and the
/// durable processed-event table.
#[async_trait]
pub trait VocabRepository: Send + Sync {
    /// Insert a new word in `Pending` state.
    ///
    /// Fails with `DuplicateWord` when the word already exists,
    /// case-insensitively.
    async fn create_word(
        &self,
        word: &str,
        thread_ref: Option<&ThreadRef>,
    ) -> Result<WordEntry, RepositoryError>;

    async fn find_by_thread(
        &self,
        thread_ref: &ThreadRef,
    ) -> Result<Option<WordEntry>, RepositoryError>;

    /// Case-insensitive lookup by spelling.
    async fn find_by_word(&self, word: &str) -> Result<Option<WordEntry>, RepositoryError>;

    /// Most recently created word, if any.
    async fn find_latest(&self) -> Result<Option<WordEntry>, RepositoryError>;

    /// Resolution of the most recently created word; `None` when history is
    /// empty.
    async fn latest_resolution(&self) -> Result<Option<Resolution>, RepositoryError>;

    async fn set_resolution(
        &self,
        id: WordId,
        resolution: Resolution,
    ) -> Result<WordEntry, RepositoryError>;

    async fn list_words(&self, filter: WordFilter) -> Result<Vec<WordEntry>, RepositoryError>;

    async fn count_words(&self) -> Result<u64, RepositoryError>;

    async fn current_theme(&self) -> Result<Option<String>, RepositoryError>;

    /// `None` clears the theme.
    async fn set_current_theme(&self, theme: Option<&str>) -> Result<(), RepositoryError>;

    async fn theme_thread(&self) -> Result<Option<ThreadRef>, RepositoryError>;

    async fn set_theme_thread(&self, thread_ref: &ThreadRef) -> Result<(), RepositoryError>;

    async fn is_event_processed(&self, key: &str) -> Result<bool, RepositoryError>;

    /// Set-add of an idempotency key: exactly one concurrent caller observes
    /// `Recorded`, every other one `AlreadyProcessed`.
    async fn record_event(
        &self,
        key: &str,
        event_type: &str,
    ) -> Result<RecordOutcome, RepositoryError>;

    /// Remove a recorded key so a redelivery can retry after a failed
    /// handler.
    async fn forget_event(&self, key: &str) -> Result<(), RepositoryError>;

    /// Delete processed-event rows older than the cutoff (unix seconds).
    /// Returns the number of rows removed.
    async fn purge_events_before(&self, cutoff_secs: i64) -> Result<usize, RepositoryError>;
}

/// Current unix timestamp in seconds.
pub(crate) fn now_secs() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_sql_round_trip() {
        for resolution in [Resolution::Pending, Resolution::Known, Resolution::Learning] {
            assert_eq!(Resolution::from_sql(resolution.to_sql()), resolution);
        }
    }

    #[test]
    fn resolution_pending_checks() {
        assert!(Resolution::Pending.is_pending());
        assert!(!Resolution::Known.is_pending());
        assert!(!Resolution::Learning.is_pending());
    }
}
