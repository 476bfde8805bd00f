use std::path::Path;
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};

use crate::error::StorageError;
use crate::model::{format_timestamp, NormalizedRecord};

pub type Result<T> = std::result::Result<T, StorageError>;

pub fn connect(path: &Path, busy_timeout: Duration) -> Result<Connection> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
    }
    let conn = Connection::open(path)?;
    conn.busy_timeout(busy_timeout)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS events (
            id          TEXT PRIMARY KEY NOT NULL,
            kind        TEXT NOT NULL,
            actor       TEXT NOT NULL,
            actor_id    INTEGER,
            subject     TEXT NOT NULL,
            subject_id  INTEGER,
            visibility  BOOLEAN NOT NULL DEFAULT 1,
            occurred_at TEXT NOT NULL,
            payload     TEXT NOT NULL,
            ingested_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_events_kind_time ON events(kind, occurred_at);
        CREATE INDEX IF NOT EXISTS idx_events_subject ON events(subject, kind, occurred_at);
        CREATE INDEX IF NOT EXISTS idx_events_time ON events(occurred_at);

        -- One row per finished pipeline run; history only.
        CREATE TABLE IF NOT EXISTS runs (
            id               INTEGER PRIMARY KEY,
            run_id           TEXT NOT NULL,
            started_at       TEXT NOT NULL,
            elapsed_ms       INTEGER NOT NULL,
            pages_fetched    INTEGER NOT NULL,
            records_inserted INTEGER NOT NULL,
            stop_reason      TEXT NOT NULL,
            outcome          TEXT NOT NULL
        );
        ",
    )?;
    Ok(())
}

// ── Events ──

/// Write lock up front, so a page's dedup checks and inserts see one consistent store.
pub fn begin_batch(conn: &Connection) -> Result<Transaction<'_>> {
    Ok(Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?)
}

pub fn event_exists(conn: &Connection, id: &str) -> Result<bool> {
    let found = conn
        .prepare_cached("SELECT 1 FROM events WHERE id = ?1")?
        .query_row(params![id], |_| Ok(()))
        .optional()?;
    Ok(found.is_some())
}

/// Returns false when the id was already stored; the primary key decides, not the caller.
pub fn insert_event(conn: &Connection, r: &NormalizedRecord) -> Result<bool> {
    let changed = conn
        .prepare_cached(
            "INSERT OR IGNORE INTO events
             (id, kind, actor, actor_id, subject, subject_id, visibility, occurred_at, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )?
        .execute(params![
            r.id,
            r.kind,
            r.actor,
            r.actor_id,
            r.subject,
            r.subject_id,
            r.visibility,
            format_timestamp(&r.occurred_at),
            r.payload.as_str(),
        ])?;
    Ok(changed == 1)
}

pub fn count_events(conn: &Connection) -> Result<usize> {
    Ok(conn.query_row("SELECT COUNT(*) FROM events", [], |r| r.get(0))?)
}

// ── Runs ──

#[derive(Debug, Clone)]
pub struct RunRow {
    pub run_id: String,
    pub started_at: String,
    pub elapsed_ms: i64,
    pub pages_fetched: usize,
    pub records_inserted: usize,
    pub stop_reason: String,
    pub outcome: String,
}

pub fn insert_run(conn: &Connection, run: &RunRow) -> Result<()> {
    conn.execute(
        "INSERT INTO runs
         (run_id, started_at, elapsed_ms, pages_fetched, records_inserted, stop_reason, outcome)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            run.run_id,
            run.started_at,
            run.elapsed_ms,
            run.pages_fetched,
            run.records_inserted,
            run.stop_reason,
            run.outcome,
        ],
    )?;
    Ok(())
}

pub fn recent_runs(conn: &Connection, limit: usize) -> Result<Vec<RunRow>> {
    let mut stmt = conn.prepare(
        "SELECT run_id, started_at, elapsed_ms, pages_fetched, records_inserted, stop_reason, outcome
         FROM runs ORDER BY id DESC LIMIT ?1",
    )?;
    let rows = stmt
        .query_map(params![limit], |row| {
            Ok(RunRow {
                run_id: row.get(0)?,
                started_at: row.get(1)?,
                elapsed_ms: row.get(2)?,
                pages_fetched: row.get(3)?,
                records_inserted: row.get(4)?,
                stop_reason: row.get(5)?,
                outcome: row.get(6)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}
