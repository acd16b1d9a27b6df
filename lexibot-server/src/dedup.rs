//! Deduplication store for inbound events.
//!
//! Two layers: an advisory in-memory TTL cache (no I/O on the hot path) in
//! front of the authoritative durable processed-events table. The durable
//! write always happens first; the cache is backfilled afterwards, so a
//! crash between the two can only cause an extra durable lookup, never a
//! duplicate side effect.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::cache::TtlCache;
use crate::repository::{RecordOutcome, RepositoryError, VocabRepository};

pub struct DedupStore {
    cache: TtlCache,
    repository: Arc<dyn VocabRepository>,
}

impl DedupStore {
    pub fn new(
        repository: Arc<dyn VocabRepository>,
        cache_size: usize,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            cache: TtlCache::new(cache_size, cache_ttl),
            repository,
        }
    }

    /// Check whether the key has been handled before.
    ///
    /// Cache hit avoids the durable lookup; a durable hit backfills the
    /// cache.
    pub async fn is_duplicate(&self, key: &str) -> Result<bool, RepositoryError> {
        if self.cache.contains(key) {
            debug!("Dedup cache hit for {}", key);
            return Ok(true);
        }

        if self.repository.is_event_processed(key).await? {
            self.cache.add(key);
            return Ok(true);
        }

        Ok(false)
    }

    /// Claim the key: durable insert-unique first, cache second.
    ///
    /// `AlreadyProcessed` means another worker won the race; callers treat
    /// it as "already handled", not as an error.
    pub async fn mark_processed(
        &self,
        key: &str,
        event_type: &str,
    ) -> Result<RecordOutcome, RepositoryError> {
        let outcome = self.repository.record_event(key, event_type).await?;
        if outcome == RecordOutcome::Recorded {
            self.cache.add(key);
        }
        Ok(outcome)
    }

    /// Release a claimed key after a failed handler so a redelivery can
    /// retry.
    pub async fn release(&self, key: &str) -> Result<(), RepositoryError> {
        self.repository.forget_event(key).await?;
        self.cache.remove(key);
        Ok(())
    }

    /// Sweep durable rows older than the retention window.
    pub async fn purge_older_than(&self, retention: Duration) -> Result<usize, RepositoryError> {
        let cutoff = crate::repository::now_secs() - retention.as_secs() as i64;
        self.repository.purge_events_before(cutoff).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryRepository;

    fn store() -> DedupStore {
        DedupStore::new(
            Arc::new(InMemoryRepository::new()),
            100,
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn unseen_key_is_not_duplicate() {
        let store = store();
        assert!(!store.is_duplicate("ev-1").await.unwrap());
    }

    #[tokio::test]
    async fn marked_key_becomes_duplicate() {
        let store = store();
        assert_eq!(
            store.mark_processed("ev-1", "message").await.unwrap(),
            RecordOutcome::Recorded
        );
        assert!(store.is_duplicate("ev-1").await.unwrap());
    }

    #[tokio::test]
    async fn replayed_mark_is_a_noop_conflict() {
        let store = store();
        store.mark_processed("ev-1", "message").await.unwrap();
        assert_eq!(
            store.mark_processed("ev-1", "message").await.unwrap(),
            RecordOutcome::AlreadyProcessed
        );
    }

    #[tokio::test]
    async fn durable_hit_backfills_cache() {
        let repo: Arc<dyn VocabRepository> = Arc::new(InMemoryRepository::new());
        repo.record_event("ev-1", "message").await.unwrap();

        // A fresh store has an empty cache but must still see the durable row.
        let store = DedupStore::new(repo, 100, Duration::from_secs(60));
        assert!(store.is_duplicate("ev-1").await.unwrap());
        assert!(store.cache.contains("ev-1"));
    }

    #[tokio::test]
    async fn release_allows_retry() {
        let store = store();
        store.mark_processed("ev-1", "message").await.unwrap();
        store.release("ev-1").await.unwrap();
        assert!(!store.is_duplicate("ev-1").await.unwrap());
        assert_eq!(
            store.mark_processed("ev-1", "message").await.unwrap(),
            RecordOutcome::Recorded
        );
    }
}
