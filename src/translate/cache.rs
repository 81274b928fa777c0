//! Persistent translation cache: in-memory LRU in front of SQLite.
//! Key: blake3 hash of the source text only. Target language is not part of the key,
//! so a changed target language can still be served older translations.

use std::num::NonZeroUsize;
use std::path::Path;

use lru::LruCache;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, warn};

/// Persistent string → string store used by the dispatcher.
pub trait TranslationStore: Send + Sync {
    fn contains(&self, original: &str) -> bool;
    fn get(&self, original: &str) -> Option<String>;
    fn set(&self, original: &str, translated: &str);
    /// Persist everything; called once on shutdown.
    fn flush(&self) -> Result<(), CacheError>;
}

#[derive(Debug)]
pub enum CacheError {
    Sqlite(rusqlite::Error),
    InvalidCapacity,
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheError::Sqlite(e) => write!(f, "cache database error: {e}"),
            CacheError::InvalidCapacity => write!(f, "cache memory capacity must be > 0"),
        }
    }
}

impl std::error::Error for CacheError {}

impl From<rusqlite::Error> for CacheError {
    fn from(e: rusqlite::Error) -> Self {
        CacheError::Sqlite(e)
    }
}

pub fn cache_key(original: &str) -> [u8; 32] {
    *blake3::hash(original.as_bytes()).as_bytes()
}

/// LRU front + SQLite back. Both behind their own lock; last writer wins.
pub struct TranslationCache {
    memory: Mutex<LruCache<[u8; 32], String>>,
    conn: Mutex<Connection>,
}

impl TranslationCache {
    /// Open (or create) the cache database at the given path.
    pub fn open(db_path: &Path, memory_capacity: usize) -> Result<Self, CacheError> {
        let conn = Connection::open(db_path)?;
        // WAL mode for concurrent readers
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        let cache = Self::with_connection(conn, memory_capacity)?;
        info!(path = %db_path.display(), entries = cache.len(), "translation cache opened");
        Ok(cache)
    }

    /// Non-persistent cache for tests and `--no-cache` style runs.
    pub fn in_memory(memory_capacity: usize) -> Result<Self, CacheError> {
        Self::with_connection(Connection::open_in_memory()?, memory_capacity)
    }

    fn with_connection(conn: Connection, memory_capacity: usize) -> Result<Self, CacheError> {
        let capacity = NonZeroUsize::new(memory_capacity).ok_or(CacheError::InvalidCapacity)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS translation_cache (
                cache_key BLOB PRIMARY KEY,
                source_text TEXT NOT NULL,
                translated_text TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );",
        )?;
        Ok(Self {
            memory: Mutex::new(LruCache::new(capacity)),
            conn: Mutex::new(conn),
        })
    }

    /// Number of persisted entries.
    pub fn len(&self) -> usize {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM translation_cache", [], |row| {
            row.get::<_, i64>(0)
        })
        .map(|n| n as usize)
        .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn load(&self, key: &[u8; 32]) -> Option<String> {
        let conn = self.conn.lock();
        match conn
            .query_row(
                "SELECT translated_text FROM translation_cache WHERE cache_key = ?1",
                params![key.as_slice()],
                |row| row.get(0),
            )
            .optional()
        {
            Ok(found) => found,
            Err(e) => {
                warn!(error = %e, "cache lookup failed");
                None
            }
        }
    }
}

impl TranslationStore for TranslationCache {
    fn contains(&self, original: &str) -> bool {
        self.get(original).is_some()
    }

    fn get(&self, original: &str) -> Option<String> {
        let key = cache_key(original);
        if let Some(hit) = self.memory.lock().get(&key) {
            return Some(hit.clone());
        }
        let found = self.load(&key)?;
        debug!("cache hit from disk");
        self.memory.lock().put(key, found.clone());
        Some(found)
    }

    fn set(&self, original: &str, translated: &str) {
        let key = cache_key(original);
        self.memory.lock().put(key, translated.to_string());
        let conn = self.conn.lock();
        if let Err(e) = conn.execute(
            "INSERT OR REPLACE INTO translation_cache
             (cache_key, source_text, translated_text, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![key.as_slice(), original, translated, now_unix()],
        ) {
            warn!(error = %e, "cache insert failed");
        }
    }

    fn flush(&self) -> Result<(), CacheError> {
        let conn = self.conn.lock();
        // file-backed databases fold the WAL back in; in-memory ones have nothing to do
        if conn.path().map(|p| !p.is_empty()).unwrap_or(false) {
            conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        }
        debug!("translation cache flushed");
        Ok(())
    }
}

/// Current time as Unix timestamp (seconds).
fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
