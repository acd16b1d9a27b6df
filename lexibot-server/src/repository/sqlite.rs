//! SQLite implementation of `VocabRepository`.
//!
//! This provides durable storage that survives restarts. Word history is
//! stored with explicit relational columns rather than JSON blobs for type
//! safety and queryability.
//!
//! # Schema Versioning
//!
//! The database uses SQLite's `user_version` pragma to track schema
//! versions. When the schema changes, increment `SCHEMA_VERSION` and add a
//! migration function in `run_migrations`.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension};
use tracing::warn;

use super::{
    now_secs, RecordOutcome, RepositoryError, Resolution, ThreadRef, VocabRepository, WordEntry,
    WordFilter, WordId,
};
use async_trait::async_trait;

/// Current schema version. Increment when making schema changes.
const SCHEMA_VERSION: i32 = 1;

const THEME_KEY: &str = "current_theme";
const THEME_THREAD_KEY: &str = "theme_thread";

/// SQLite-backed repository.
///
/// Uses a `Mutex<Connection>` because `rusqlite::Connection` is not `Sync`.
/// All operations run under `tokio::task::spawn_blocking` so the async
/// runtime is never blocked on database I/O.
pub struct SqliteRepository {
    /// Exposed as `pub(crate)` for test access to manipulate timestamps when
    /// testing expiry behavior.
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl SqliteRepository {
    /// Open or create the database file at the given path.
    pub fn new(path: &Path) -> Result<Self, RepositoryError> {
        let conn = Connection::open(path).map_err(|e| {
            RepositoryError::storage("open database", format!("{}: {}", path.display(), e))
        })?;
        Self::from_connection(conn)
    }

    /// Create an in-memory database (for testing).
    pub fn new_in_memory() -> Result<Self, RepositoryError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| RepositoryError::storage("open in-memory database", e.to_string()))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, RepositoryError> {
        // PRAGMA journal_mode returns the resulting mode as a row; in-memory
        // databases legitimately report "memory" instead of "wal".
        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(|e| RepositoryError::storage("set journal mode", e.to_string()))?;
        if !journal_mode.eq_ignore_ascii_case("wal")
            && !journal_mode.eq_ignore_ascii_case("memory")
        {
            return Err(RepositoryError::storage(
                "set journal mode",
                format!("failed to enable WAL mode, got '{}'", journal_mode),
            ));
        }

        conn.execute_batch("PRAGMA busy_timeout = 5000;")
            .map_err(|e| RepositoryError::storage("set busy timeout", e.to_string()))?;

        let repo = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        repo.init_schema()?;
        Ok(repo)
    }

    /// Initialize the schema and run any pending migrations.
    fn init_schema(&self) -> Result<(), RepositoryError> {
        let conn = self.conn.lock().expect("mutex poisoned");

        let current_version: i32 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .map_err(|e| RepositoryError::storage("read schema version", e.to_string()))?;

        if current_version > SCHEMA_VERSION {
            return Err(RepositoryError::storage(
                "check schema version",
                format!(
                    "database schema version {} is newer than supported version {}",
                    current_version, SCHEMA_VERSION
                ),
            ));
        }

        if current_version < SCHEMA_VERSION {
            Self::run_migrations(&conn, current_version)?;
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)
                .map_err(|e| RepositoryError::storage("update schema version", e.to_string()))?;
        }

        Ok(())
    }

    /// Run migrations from `from_version` up to `SCHEMA_VERSION`.
    fn run_migrations(conn: &Connection, from_version: i32) -> Result<(), RepositoryError> {
        if from_version < 1 {
            Self::migrate_v0_to_v1(conn)?;
        }

        // Future migrations go here:
        // if from_version < 2 {
        //     Self::migrate_v1_to_v2(conn)?;
        // }

        Ok(())
    }

    /// Migration v0 -> v1: Create initial schema.
    fn migrate_v0_to_v1(conn: &Connection) -> Result<(), RepositoryError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS word_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                -- Case-insensitive uniqueness: "Ephemeral" and "ephemeral"
                -- are the same word.
                word TEXT NOT NULL UNIQUE COLLATE NOCASE,
                -- NULL = pending, 1 = known, 0 = learning
                resolution INTEGER,
                thread_ref TEXT,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_word_history_thread
                ON word_history(thread_ref);

            CREATE TABLE IF NOT EXISTS processed_events (
                event_key TEXT PRIMARY KEY,
                event_type TEXT NOT NULL,
                processed_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_processed_events_at
                ON processed_events(processed_at);

            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT,
                updated_at INTEGER NOT NULL
            );
            "#,
        )
        .map_err(|e| RepositoryError::storage("migrate schema to v1", e.to_string()))
    }

    /// Run a closure against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, operation: &'static str, f: F) -> Result<T, RepositoryError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, RepositoryError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("mutex poisoned");
            f(&conn)
        })
        .await
        .map_err(|e| RepositoryError::storage(operation, format!("task panicked: {}", e)))?
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<WordEntry> {
    Ok(WordEntry {
        id: WordId(row.get(0)?),
        word: row.get(1)?,
        resolution: Resolution::from_sql(row.get(2)?),
        thread_ref: row.get::<_, Option<String>>(3)?.map(ThreadRef),
        created_at: row.get(4)?,
    })
}

const ENTRY_COLUMNS: &str = "id, word, resolution, thread_ref, created_at";

fn storage(operation: &'static str, e: rusqlite::Error) -> RepositoryError {
    RepositoryError::storage(operation, e.to_string())
}

fn get_setting(conn: &Connection, key: &str) -> Result<Option<String>, rusqlite::Error> {
    conn.query_row(
        "SELECT value FROM settings WHERE key = ?1",
        params![key],
        |row| row.get(0),
    )
    .optional()
    .map(Option::flatten)
}

fn put_setting(conn: &Connection, key: &str, value: &str) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![key, value, now_secs()],
    )?;
    Ok(())
}

#[async_trait]
impl VocabRepository for SqliteRepository {
    async fn create_word(
        &self,
        word: &str,
        thread_ref: Option<&ThreadRef>,
    ) -> Result<WordEntry, RepositoryError> {
        let word = word.to_string();
        let thread_ref = thread_ref.map(|t| t.0.clone());

        self.with_conn("create word", move |conn| {
            let created_at = now_secs();
            let result = conn.execute(
                "INSERT INTO word_history (word, resolution, thread_ref, created_at) \
                 VALUES (?1, NULL, ?2, ?3)",
                params![word, thread_ref, created_at],
            );

            match result {
                Ok(_) => Ok(WordEntry {
                    id: WordId(conn.last_insert_rowid()),
                    word,
                    resolution: Resolution::Pending,
                    thread_ref: thread_ref.map(ThreadRef),
                    created_at,
                }),
                Err(e) => {
                    // The UNIQUE COLLATE NOCASE constraint signals a
                    // case-insensitive duplicate.
                    if e.sqlite_error_code() == Some(rusqlite::ErrorCode::ConstraintViolation) {
                        Err(RepositoryError::DuplicateWord { word })
                    } else {
                        Err(storage("create word", e))
                    }
                }
            }
        })
        .await
    }

    async fn find_by_thread(
        &self,
        thread_ref: &ThreadRef,
    ) -> Result<Option<WordEntry>, RepositoryError> {
        let thread_ref = thread_ref.0.clone();
        self.with_conn("find word by thread", move |conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM word_history WHERE thread_ref = ?1",
                    ENTRY_COLUMNS
                ),
                params![thread_ref],
                row_to_entry,
            )
            .optional()
            .map_err(|e| storage("find word by thread", e))
        })
        .await
    }

    async fn find_by_word(&self, word: &str) -> Result<Option<WordEntry>, RepositoryError> {
        let word = word.to_string();
        self.with_conn("find word by name", move |conn| {
            conn.query_row(
                &format!("SELECT {} FROM word_history WHERE word = ?1", ENTRY_COLUMNS),
                params![word],
                row_to_entry,
            )
            .optional()
            .map_err(|e| storage("find word by name", e))
        })
        .await
    }

    async fn find_latest(&self) -> Result<Option<WordEntry>, RepositoryError> {
        self.with_conn("find latest word", move |conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM word_history ORDER BY created_at DESC, id DESC LIMIT 1",
                    ENTRY_COLUMNS
                ),
                [],
                row_to_entry,
            )
            .optional()
            .map_err(|e| storage("find latest word", e))
        })
        .await
    }

    async fn latest_resolution(&self) -> Result<Option<Resolution>, RepositoryError> {
        Ok(self.find_latest().await?.map(|entry| entry.resolution))
    }

    async fn set_resolution(
        &self,
        id: WordId,
        resolution: Resolution,
    ) -> Result<WordEntry, RepositoryError> {
        self.with_conn("set resolution", move |conn| {
            let changed = conn
                .execute(
                    "UPDATE word_history SET resolution = ?1 WHERE id = ?2",
                    params![resolution.to_sql(), id.0],
                )
                .map_err(|e| storage("set resolution", e))?;

            if changed == 0 {
                return Err(RepositoryError::WordNotFound { id });
            }

            conn.query_row(
                &format!("SELECT {} FROM word_history WHERE id = ?1", ENTRY_COLUMNS),
                params![id.0],
                row_to_entry,
            )
            .map_err(|e| storage("set resolution", e))
        })
        .await
    }

    async fn list_words(&self, filter: WordFilter) -> Result<Vec<WordEntry>, RepositoryError> {
        self.with_conn("list words", move |conn| {
            let clause = match filter {
                WordFilter::All => "",
                WordFilter::Known => " WHERE resolution = 1",
                WordFilter::Learning => " WHERE resolution = 0",
            };
            let mut statement = conn
                .prepare(&format!(
                    "SELECT {} FROM word_history{} ORDER BY created_at ASC, id ASC",
                    ENTRY_COLUMNS, clause
                ))
                .map_err(|e| storage("list words", e))?;

            let rows = statement
                .query_map([], row_to_entry)
                .map_err(|e| storage("list words", e))?;

            rows.collect::<Result<Vec<_>, _>>()
                .map_err(|e| storage("list words", e))
        })
        .await
    }

    async fn count_words(&self) -> Result<u64, RepositoryError> {
        self.with_conn("count words", move |conn| {
            conn.query_row("SELECT COUNT(*) FROM word_history", [], |row| {
                row.get::<_, i64>(0)
            })
            .map(|count| count as u64)
            .map_err(|e| storage("count words", e))
        })
        .await
    }

    async fn current_theme(&self) -> Result<Option<String>, RepositoryError> {
        self.with_conn("read theme", move |conn| {
            get_setting(conn, THEME_KEY).map_err(|e| storage("read theme", e))
        })
        .await
    }

    async fn set_current_theme(&self, theme: Option<&str>) -> Result<(), RepositoryError> {
        let theme = theme.map(|t| t.to_string());
        self.with_conn("write theme", move |conn| match theme {
            Some(theme) => put_setting(conn, THEME_KEY, &theme).map_err(|e| storage("write theme", e)),
            None => {
                conn.execute("DELETE FROM settings WHERE key = ?1", params![THEME_KEY])
                    .map_err(|e| storage("write theme", e))?;
                Ok(())
            }
        })
        .await
    }

    async fn theme_thread(&self) -> Result<Option<ThreadRef>, RepositoryError> {
        self.with_conn("read theme thread", move |conn| {
            get_setting(conn, THEME_THREAD_KEY)
                .map(|value| value.map(ThreadRef))
                .map_err(|e| storage("read theme thread", e))
        })
        .await
    }

    async fn set_theme_thread(&self, thread_ref: &ThreadRef) -> Result<(), RepositoryError> {
        let thread_ref = thread_ref.0.clone();
        self.with_conn("write theme thread", move |conn| {
            put_setting(conn, THEME_THREAD_KEY, &thread_ref)
                .map_err(|e| storage("write theme thread", e))
        })
        .await
    }

    async fn is_event_processed(&self, key: &str) -> Result<bool, RepositoryError> {
        let key = key.to_string();
        self.with_conn("check processed event", move |conn| {
            conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM processed_events WHERE event_key = ?1)",
                params![key],
                |row| row.get(0),
            )
            .map_err(|e| storage("check processed event", e))
        })
        .await
    }

    async fn record_event(
        &self,
        key: &str,
        event_type: &str,
    ) -> Result<RecordOutcome, RepositoryError> {
        let key = key.to_string();
        let event_type = event_type.to_string();
        self.with_conn("record processed event", move |conn| {
            // Atomic INSERT OR IGNORE avoids the read-then-insert race: when
            // two workers race on the same key, the loser's insert is
            // silently ignored and detected via changes() == 0.
            conn.execute(
                "INSERT OR IGNORE INTO processed_events (event_key, event_type, processed_at) \
                 VALUES (?1, ?2, ?3)",
                params![key, event_type, now_secs()],
            )
            .map_err(|e| storage("record processed event", e))?;

            if conn.changes() > 0 {
                Ok(RecordOutcome::Recorded)
            } else {
                Ok(RecordOutcome::AlreadyProcessed)
            }
        })
        .await
    }

    async fn forget_event(&self, key: &str) -> Result<(), RepositoryError> {
        let key = key.to_string();
        self.with_conn("forget processed event", move |conn| {
            conn.execute(
                "DELETE FROM processed_events WHERE event_key = ?1",
                params![key],
            )
            .map_err(|e| storage("forget processed event", e))?;
            Ok(())
        })
        .await
    }

    async fn purge_events_before(&self, cutoff_secs: i64) -> Result<usize, RepositoryError> {
        let removed = self
            .with_conn("purge processed events", move |conn| {
                conn.execute(
                    "DELETE FROM processed_events WHERE processed_at <= ?1",
                    params![cutoff_secs],
                )
                .map_err(|e| storage("purge processed events", e))
            })
            .await?;

        if removed > 0 {
            warn!("Purged {} processed-event rows past retention", removed);
        }
        Ok(removed)
    }
}
