//! In-memory implementation of `VocabRepository`.
//!
//! All state is lost on restart; used in tests and as a reference
//! implementation of the repository contract.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{
    now_secs, RecordOutcome, RepositoryError, Resolution, ThreadRef, VocabRepository, WordEntry,
    WordFilter, WordId,
};

const THEME_KEY: &str = "current_theme";
const THEME_THREAD_KEY: &str = "theme_thread";

#[derive(Default)]
struct Inner {
    words: Vec<WordEntry>,
    next_id: i64,
    settings: HashMap<String, String>,
    /// key -> (event_type, processed_at unix seconds)
    events: HashMap<String, (String, i64)>,
}

/// In-memory repository, a `RwLock`-guarded set of tables.
#[derive(Default)]
pub struct InMemoryRepository {
    inner: RwLock<Inner>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

fn matches_filter(entry: &WordEntry, filter: WordFilter) -> bool {
    match filter {
        WordFilter::All => true,
        WordFilter::Known => entry.resolution == Resolution::Known,
        WordFilter::Learning => entry.resolution == Resolution::Learning,
    }
}

#[async_trait]
impl VocabRepository for InMemoryRepository {
    async fn create_word(
        &self,
        word: &str,
        thread_ref: Option<&ThreadRef>,
    ) -> Result<WordEntry, RepositoryError> {
        let mut inner = self.inner.write().await;

        let lowered = word.to_lowercase();
        if inner.words.iter().any(|w| w.word.to_lowercase() == lowered) {
            return Err(RepositoryError::DuplicateWord {
                word: word.to_string(),
            });
        }

        inner.next_id += 1;
        let entry = WordEntry {
            id: WordId(inner.next_id),
            word: word.to_string(),
            resolution: Resolution::Pending,
            thread_ref: thread_ref.cloned(),
            created_at: now_secs(),
        };
        inner.words.push(entry.clone());
        Ok(entry)
    }

    async fn find_by_thread(
        &self,
        thread_ref: &ThreadRef,
    ) -> Result<Option<WordEntry>, RepositoryError> {
        let inner = self.inner.read().await;
        Ok(inner
            .words
            .iter()
            .find(|w| w.thread_ref.as_ref() == Some(thread_ref))
            .cloned())
    }

    async fn find_by_word(&self, word: &str) -> Result<Option<WordEntry>, RepositoryError> {
        let inner = self.inner.read().await;
        let lowered = word.to_lowercase();
        Ok(inner
            .words
            .iter()
            .find(|w| w.word.to_lowercase() == lowered)
            .cloned())
    }

    async fn find_latest(&self) -> Result<Option<WordEntry>, RepositoryError> {
        let inner = self.inner.read().await;
        Ok(inner
            .words
            .iter()
            .max_by_key(|w| (w.created_at, w.id.0))
            .cloned())
    }

    async fn latest_resolution(&self) -> Result<Option<Resolution>, RepositoryError> {
        Ok(self.find_latest().await?.map(|entry| entry.resolution))
    }

    async fn set_resolution(
        &self,
        id: WordId,
        resolution: Resolution,
    ) -> Result<WordEntry, RepositoryError> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .words
            .iter_mut()
            .find(|w| w.id == id)
            .ok_or(RepositoryError::WordNotFound { id })?;
        entry.resolution = resolution;
        Ok(entry.clone())
    }

    async fn list_words(&self, filter: WordFilter) -> Result<Vec<WordEntry>, RepositoryError> {
        let inner = self.inner.read().await;
        Ok(inner
            .words
            .iter()
            .filter(|w| matches_filter(w, filter))
            .cloned()
            .collect())
    }

    async fn count_words(&self) -> Result<u64, RepositoryError> {
        let inner = self.inner.read().await;
        Ok(inner.words.len() as u64)
    }

    async fn current_theme(&self) -> Result<Option<String>, RepositoryError> {
        let inner = self.inner.read().await;
        Ok(inner.settings.get(THEME_KEY).cloned())
    }

    async fn set_current_theme(&self, theme: Option<&str>) -> Result<(), RepositoryError> {
        let mut inner = self.inner.write().await;
        match theme {
            Some(theme) => {
                inner.settings.insert(THEME_KEY.to_string(), theme.to_string());
            }
            None => {
                inner.settings.remove(THEME_KEY);
            }
        }
        Ok(())
    }

    async fn theme_thread(&self) -> Result<Option<ThreadRef>, RepositoryError> {
        let inner = self.inner.read().await;
        Ok(inner
            .settings
            .get(THEME_THREAD_KEY)
            .map(|s| ThreadRef(s.clone())))
    }

    async fn set_theme_thread(&self, thread_ref: &ThreadRef) -> Result<(), RepositoryError> {
        let mut inner = self.inner.write().await;
        inner
            .settings
            .insert(THEME_THREAD_KEY.to_string(), thread_ref.0.clone());
        Ok(())
    }

    async fn is_event_processed(&self, key: &str) -> Result<bool, RepositoryError> {
        let inner = self.inner.read().await;
        Ok(inner.events.contains_key(key))
    }

    async fn record_event(
        &self,
        key: &str,
        event_type: &str,
    ) -> Result<RecordOutcome, RepositoryError> {
        let mut inner = self.inner.write().await;
        if inner.events.contains_key(key) {
            return Ok(RecordOutcome::AlreadyProcessed);
        }
        inner
            .events
            .insert(key.to_string(), (event_type.to_string(), now_secs()));
        Ok(RecordOutcome::Recorded)
    }

    async fn forget_event(&self, key: &str) -> Result<(), RepositoryError> {
        let mut inner = self.inner.write().await;
        inner.events.remove(key);
        Ok(())
    }

    async fn purge_events_before(&self, cutoff_secs: i64) -> Result<usize, RepositoryError> {
        let mut inner = self.inner.write().await;
        let before = inner.events.len();
        inner.events.retain(|_, (_, at)| *at > cutoff_secs);
        Ok(before - inner.events.len())
    }
}
