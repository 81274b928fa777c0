//! Display history persisted to SQLite.
//! Entries are queued on a channel and written in batches every 300ms,
//! so the display path never waits on disk I/O.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::display::{DisplayEntry, DisplaySink};

const FLUSH_INTERVAL: Duration = Duration::from_millis(300);

/// One displayed message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryRecord {
    pub entry_id: String,
    pub speaker: String,
    pub message: String,
    pub glossary_match: bool,
    pub skip_src_lang: bool,
    pub cache_hit: bool,
    pub is_error: bool,
    pub total_tokens: u32,
    pub duration_ms: Option<u64>,
    pub created_at: i64,
}

impl HistoryRecord {
    fn from_entry(entry: &DisplayEntry) -> Self {
        Self {
            entry_id: uuid::Uuid::new_v4().to_string(),
            speaker: entry.speaker.clone(),
            message: entry.message.clone(),
            glossary_match: entry.info.glossary_match,
            skip_src_lang: entry.info.skip_src_lang,
            cache_hit: entry.info.cache_hit,
            is_error: entry.is_error(),
            total_tokens: entry.info.usage.map(|u| u.total_tokens).unwrap_or(0),
            duration_ms: entry.duration.map(|d| d.as_millis() as u64),
            created_at: now_unix(),
        }
    }
}

/// Async history store: accepts records via channel, flushes to SQLite in batches.
pub struct HistoryStore {
    tx: Mutex<Option<mpsc::UnboundedSender<HistoryRecord>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    /// Direct DB connection for reads (queries).
    read_conn: Mutex<Connection>,
}

impl HistoryStore {
    /// Open (or create) the history database and spawn the batch writer.
    /// Must be called inside a Tokio runtime.
    pub fn open(db_path: &Path) -> Result<Arc<Self>, rusqlite::Error> {
        let read_conn = Connection::open(db_path)?;
        read_conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        read_conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                entry_id TEXT NOT NULL,
                speaker TEXT NOT NULL,
                message TEXT NOT NULL,
                glossary_match INTEGER DEFAULT 0,
                skip_src_lang INTEGER DEFAULT 0,
                cache_hit INTEGER DEFAULT 0,
                is_error INTEGER DEFAULT 0,
                total_tokens INTEGER DEFAULT 0,
                duration_ms INTEGER,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_history_created
                ON history(created_at);",
        )?;

        // separate connection so batch commits never hold the read lock
        let write_conn = Connection::open(db_path)?;
        write_conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(flush_loop(rx, write_conn));

        info!(path = %db_path.display(), "history store opened with batch writer");

        Ok(Arc::new(Self {
            tx: Mutex::new(Some(tx)),
            writer: Mutex::new(Some(writer)),
            read_conn: Mutex::new(read_conn),
        }))
    }

    /// Queue a record for the batch writer. Never blocks.
    pub fn record(&self, record: HistoryRecord) {
        match self.tx.lock().as_ref() {
            Some(tx) => {
                if let Err(e) = tx.send(record) {
                    warn!(error = %e, "history channel send failed (writer gone?)");
                }
            }
            None => debug!("history store closed, record dropped"),
        }
    }

    /// Stop accepting records and wait for the writer to flush what it has.
    pub async fn close(&self) {
        drop(self.tx.lock().take());
        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            if let Err(e) = writer.await {
                warn!(error = %e, "history writer task failed");
            }
        }
    }

    /// Most recent records, newest first.
    pub fn query_recent(&self, limit: usize) -> Vec<HistoryRecord> {
        let conn = self.read_conn.lock();
        let mut stmt = match conn.prepare(
            "SELECT entry_id, speaker, message, glossary_match, skip_src_lang,
                    cache_hit, is_error, total_tokens, duration_ms, created_at
             FROM history ORDER BY id DESC LIMIT ?1",
        ) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "history query prepare failed");
                return Vec::new();
            }
        };

        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok(HistoryRecord {
                    entry_id: row.get(0)?,
                    speaker: row.get(1)?,
                    message: row.get(2)?,
                    glossary_match: row.get::<_, i32>(3)? != 0,
                    skip_src_lang: row.get::<_, i32>(4)? != 0,
                    cache_hit: row.get::<_, i32>(5)? != 0,
                    is_error: row.get::<_, i32>(6)? != 0,
                    total_tokens: row.get(7)?,
                    duration_ms: row.get::<_, Option<i64>>(8)?.map(|v| v as u64),
                    created_at: row.get(9)?,
                })
            })
            .ok();

        match rows {
            Some(iter) => iter.filter_map(|r| r.ok()).collect(),
            None => Vec::new(),
        }
    }
}

/// Display sink that appends every entry to the history store.
pub struct HistorySink {
    store: Arc<HistoryStore>,
}

impl HistorySink {
    pub fn new(store: Arc<HistoryStore>) -> Self {
        Self { store }
    }
}

impl DisplaySink for HistorySink {
    fn display(&self, entry: &DisplayEntry) {
        self.store.record(HistoryRecord::from_entry(entry));
    }
}

/// Collect records and batch-insert them every flush interval until the channel closes.
async fn flush_loop(mut rx: mpsc::UnboundedReceiver<HistoryRecord>, conn: Connection) {
    let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut buffer: Vec<HistoryRecord> = Vec::with_capacity(32);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !buffer.is_empty() {
                    flush_batch(&conn, &buffer);
                    buffer.clear();
                }
            }
            msg = rx.recv() => match msg {
                Some(record) => buffer.push(record),
                None => {
                    if !buffer.is_empty() {
                        flush_batch(&conn, &buffer);
                    }
                    debug!("history flush loop exiting (channel closed)");
                    return;
                }
            }
        }
    }
}

/// Batch-insert records into SQLite within a transaction.
fn flush_batch(conn: &Connection, records: &[HistoryRecord]) {
    let start = std::time::Instant::now();

    if let Err(e) = conn.execute_batch("BEGIN TRANSACTION") {
        warn!(error = %e, "history batch begin failed");
        return;
    }

    let mut stmt = match conn.prepare_cached(
        "INSERT INTO history
         (entry_id, speaker, message, glossary_match, skip_src_lang,
          cache_hit, is_error, total_tokens, duration_ms, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
    ) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "history batch prepare failed");
            let _ = conn.execute_batch("ROLLBACK");
            return;
        }
    };

    for record in records {
        if let Err(e) = stmt.execute(params![
            record.entry_id,
            record.speaker,
            record.message,
            record.glossary_match as i32,
            record.skip_src_lang as i32,
            record.cache_hit as i32,
            record.is_error as i32,
            record.total_tokens,
            record.duration_ms.map(|v| v as i64),
            record.created_at,
        ]) {
            warn!(error = %e, entry_id = %record.entry_id, "history insert failed");
        }
    }

    drop(stmt);

    if let Err(e) = conn.execute_batch("COMMIT") {
        warn!(error = %e, "history batch commit failed");
    } else {
        debug!(
            count = records.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "history batch flushed"
        );
    }
}

/// Current time as Unix timestamp (seconds).
fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
