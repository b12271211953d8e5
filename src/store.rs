//! SQLite persistence for enriched slang and the learner's phrasebook.
//! Upserts coming from the fetch path are buffered in a channel and flushed
//! in batches every 300ms, so fetching and display never wait on disk I/O.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::slang::{RiskLevel, SlangEntry, Tone};

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("encoding error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("background writer is gone")]
    WriterClosed,
}

/// Fire-and-forget write side used by the fetch path.
pub trait SlangPersistence: Send + Sync {
    /// Queue an insert-or-overwrite keyed on `phrase`. Never blocks.
    fn upsert_by_phrase(&self, entry: SlangEntry);
}

/// A persisted slang row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSlang {
    pub id: String,
    #[serde(flatten)]
    pub entry: SlangEntry,
    pub first_seen_at: i64,
    pub last_seen_at: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A phrase the learner kept for later practice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedPhrase {
    pub id: String,
    pub text_en: String,
    pub explanation_ja: Option<String>,
    pub source_type: String,
    pub tone: Option<String>,
    pub created_at: i64,
}

enum WriteOp {
    Upsert { entry: SlangEntry, seen_at: i64 },
    Flush(oneshot::Sender<()>),
}

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS slang_entries (
        id TEXT PRIMARY KEY,
        phrase TEXT NOT NULL UNIQUE,
        reading_hint_ja TEXT,
        meaning_ja TEXT NOT NULL,
        nuance_ja TEXT,
        example_en TEXT,
        example_ja TEXT,
        tone TEXT NOT NULL,
        risk_level TEXT NOT NULL,
        region TEXT NOT NULL,
        tags TEXT NOT NULL,
        popularity_score REAL NOT NULL DEFAULT 0,
        first_seen_at INTEGER NOT NULL,
        last_seen_at INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_slang_popularity ON slang_entries(popularity_score);
    CREATE INDEX IF NOT EXISTS idx_slang_created ON slang_entries(created_at);
    CREATE TABLE IF NOT EXISTS saved_phrases (
        id TEXT PRIMARY KEY,
        text_en TEXT NOT NULL,
        explanation_ja TEXT,
        source_type TEXT NOT NULL,
        tone TEXT,
        created_at INTEGER NOT NULL
    );";

const UPSERT_SQL: &str = "INSERT INTO slang_entries
        (id, phrase, reading_hint_ja, meaning_ja, nuance_ja, example_en, example_ja,
         tone, risk_level, region, tags, popularity_score,
         first_seen_at, last_seen_at, created_at, updated_at)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13, ?13, ?13)
     ON CONFLICT(phrase) DO UPDATE SET
        reading_hint_ja = excluded.reading_hint_ja,
        meaning_ja = excluded.meaning_ja,
        nuance_ja = excluded.nuance_ja,
        example_en = excluded.example_en,
        example_ja = excluded.example_ja,
        tone = excluded.tone,
        risk_level = excluded.risk_level,
        region = excluded.region,
        tags = excluded.tags,
        popularity_score = excluded.popularity_score,
        last_seen_at = excluded.last_seen_at,
        updated_at = excluded.updated_at";

const SELECT_COLUMNS: &str = "SELECT id, phrase, reading_hint_ja, meaning_ja, nuance_ja,
        example_en, example_ja, tone, risk_level, region, tags, popularity_score,
        first_seen_at, last_seen_at, created_at, updated_at
     FROM slang_entries";

/// Slang row store: async batch writer for the fetch path, direct connection
/// for reads and the synchronous endpoints.
pub struct SlangStore {
    tx: mpsc::UnboundedSender<WriteOp>,
    read_conn: Mutex<Connection>,
}

impl SlangStore {
    /// Open (or create) the database and start the background flush loop.
    /// Must be called from within a Tokio runtime.
    pub fn open(db_path: &Path) -> Result<Arc<Self>, PersistenceError> {
        let read_conn = open_connection(db_path)?;
        read_conn.execute_batch(SCHEMA)?;

        // Separate connection for the writer so reads are not queued behind batches.
        let write_conn = open_connection(db_path)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let store = Arc::new(Self {
            tx,
            read_conn: Mutex::new(read_conn),
        });

        tokio::spawn(flush_loop(rx, write_conn));

        info!(path = %db_path.display(), "slang store opened with batch writer");
        Ok(store)
    }

    /// Wait until every upsert queued before this call is on disk.
    pub async fn flush(&self) -> Result<(), PersistenceError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(WriteOp::Flush(ack_tx))
            .map_err(|_| PersistenceError::WriterClosed)?;
        ack_rx.await.map_err(|_| PersistenceError::WriterClosed)
    }

    /// Upsert immediately and return the stored row.
    pub fn upsert_now(&self, entry: &SlangEntry) -> Result<StoredSlang, PersistenceError> {
        let conn = self.read_conn.lock();
        upsert_row(&conn, entry, now_unix())?;
        let stored = conn
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE phrase = ?1"),
                params![entry.phrase],
                map_slang_row,
            )?;
        Ok(stored)
    }

    pub fn select_random(&self) -> Result<Option<StoredSlang>, PersistenceError> {
        let conn = self.read_conn.lock();
        let row = conn
            .query_row(
                &format!("{SELECT_COLUMNS} ORDER BY RANDOM() LIMIT 1"),
                [],
                map_slang_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Most popular first.
    pub fn select_trending(&self, limit: usize) -> Result<Vec<StoredSlang>, PersistenceError> {
        self.select_many(
            &format!("{SELECT_COLUMNS} ORDER BY popularity_score DESC, rowid ASC LIMIT ?1"),
            limit,
        )
    }

    /// Newest first.
    pub fn select_recent(&self, limit: usize) -> Result<Vec<StoredSlang>, PersistenceError> {
        self.select_many(
            &format!("{SELECT_COLUMNS} ORDER BY created_at DESC, rowid DESC LIMIT ?1"),
            limit,
        )
    }

    pub fn select_by_id(&self, id: &str) -> Result<Option<StoredSlang>, PersistenceError> {
        let conn = self.read_conn.lock();
        let row = conn
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE id = ?1"),
                params![id],
                map_slang_row,
            )
            .optional()?;
        Ok(row)
    }

    fn select_many(&self, sql: &str, limit: usize) -> Result<Vec<StoredSlang>, PersistenceError> {
        let conn = self.read_conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params![limit as i64], map_slang_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Keep an entry in the phrasebook.
    pub fn save_phrase(&self, entry: &SlangEntry) -> Result<SavedPhrase, PersistenceError> {
        let phrase = SavedPhrase {
            id: uuid::Uuid::new_v4().to_string(),
            text_en: entry.phrase.clone(),
            explanation_ja: Some(entry.meaning.clone()),
            source_type: "slang".to_string(),
            tone: Some(entry.tone.as_str().to_string()),
            created_at: now_unix(),
        };
        let conn = self.read_conn.lock();
        conn.execute(
            "INSERT INTO saved_phrases (id, text_en, explanation_ja, source_type, tone, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                phrase.id,
                phrase.text_en,
                phrase.explanation_ja,
                phrase.source_type,
                phrase.tone,
                phrase.created_at,
            ],
        )?;
        debug!(phrase = %phrase.text_en, "phrase saved");
        Ok(phrase)
    }

    pub fn list_phrases(&self, limit: usize) -> Result<Vec<SavedPhrase>, PersistenceError> {
        let conn = self.read_conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, text_en, explanation_ja, source_type, tone, created_at
             FROM saved_phrases ORDER BY created_at DESC, rowid DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok(SavedPhrase {
                    id: row.get(0)?,
                    text_en: row.get(1)?,
                    explanation_ja: row.get(2)?,
                    source_type: row.get(3)?,
                    tone: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

impl SlangPersistence for SlangStore {
    fn upsert_by_phrase(&self, entry: SlangEntry) {
        let op = WriteOp::Upsert {
            entry,
            seen_at: now_unix(),
        };
        if self.tx.send(op).is_err() {
            warn!("slang writer channel closed, upsert dropped");
        }
    }
}

fn open_connection(db_path: &Path) -> Result<Connection, PersistenceError> {
    let conn = Connection::open(db_path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA busy_timeout=5000;")?;
    Ok(conn)
}

fn upsert_row(conn: &Connection, entry: &SlangEntry, seen_at: i64) -> Result<(), PersistenceError> {
    let tags = serde_json::to_string(&entry.tags)?;
    let mut stmt = conn.prepare_cached(UPSERT_SQL)?;
    stmt.execute(params![
        uuid::Uuid::new_v4().to_string(),
        entry.phrase,
        entry.reading_hint,
        entry.meaning,
        entry.nuance,
        entry.example_foreign,
        entry.example_native,
        entry.tone.as_str(),
        entry.risk_level.as_str(),
        entry.region,
        tags,
        entry.popularity,
        seen_at,
    ])?;
    Ok(())
}

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, msg)),
    )
}

fn map_slang_row(row: &Row<'_>) -> rusqlite::Result<StoredSlang> {
    let risk: String = row.get(8)?;
    let risk_level = RiskLevel::parse_label(&risk)
        .ok_or_else(|| conversion_error(8, format!("unknown risk_level {risk:?}")))?;
    let tone: String = row.get(7)?;
    let tags: String = row.get(10)?;
    let tags: Vec<String> =
        serde_json::from_str(&tags).map_err(|e| conversion_error(10, e.to_string()))?;

    Ok(StoredSlang {
        id: row.get(0)?,
        entry: SlangEntry {
            phrase: row.get(1)?,
            reading_hint: row.get(2)?,
            meaning: row.get(3)?,
            nuance: row.get(4)?,
            example_foreign: row.get(5)?,
            example_native: row.get(6)?,
            tone: Tone::parse_label(&tone),
            risk_level,
            region: row.get(9)?,
            tags,
            popularity: row.get(11)?,
        },
        first_seen_at: row.get(12)?,
        last_seen_at: row.get(13)?,
        created_at: row.get(14)?,
        updated_at: row.get(15)?,
    })
}

/// Collects upserts from the channel and writes them in one transaction
/// every 300ms, or immediately when a flush is requested.
async fn flush_loop(mut rx: mpsc::UnboundedReceiver<WriteOp>, conn: Connection) {
    let flush_interval = Duration::from_millis(300);
    let mut buffer: Vec<(SlangEntry, i64)> = Vec::with_capacity(32);
    let mut waiters: Vec<oneshot::Sender<()>> = Vec::new();

    loop {
        tokio::select! {
            _ = tokio::time::sleep(flush_interval) => {}
            msg = rx.recv() => {
                match msg {
                    Some(op) => push_op(op, &mut buffer, &mut waiters),
                    None => {
                        if !buffer.is_empty() {
                            flush_batch(&conn, &buffer);
                        }
                        info!("slang writer exiting (channel closed)");
                        return;
                    }
                }
            }
        }

        while let Ok(op) = rx.try_recv() {
            push_op(op, &mut buffer, &mut waiters);
        }

        if !buffer.is_empty() {
            flush_batch(&conn, &buffer);
            buffer.clear();
        }
        for waiter in waiters.drain(..) {
            let _ = waiter.send(());
        }
    }
}

fn push_op(op: WriteOp, buffer: &mut Vec<(SlangEntry, i64)>, waiters: &mut Vec<oneshot::Sender<()>>) {
    match op {
        WriteOp::Upsert { entry, seen_at } => buffer.push((entry, seen_at)),
        WriteOp::Flush(ack) => waiters.push(ack),
    }
}

fn flush_batch(conn: &Connection, batch: &[(SlangEntry, i64)]) {
    let start = std::time::Instant::now();

    if let Err(e) = conn.execute_batch("BEGIN TRANSACTION") {
        warn!(error = %e, "slang batch begin failed");
        return;
    }

    for (entry, seen_at) in batch {
        if let Err(e) = upsert_row(conn, entry, *seen_at) {
            warn!(error = %e, phrase = %entry.phrase, "slang upsert failed");
        }
    }

    if let Err(e) = conn.execute_batch("COMMIT") {
        warn!(error = %e, "slang batch commit failed");
        let _ = conn.execute_batch("ROLLBACK");
    } else {
        debug!(
            count = batch.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "slang batch flushed"
        );
    }
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
