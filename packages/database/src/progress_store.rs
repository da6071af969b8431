//! Durable per-window progress.
//!
//! Keyed by `(dataset, window_start)`. A completed window stays completed:
//! later attempts or failures against it are ignored, and completing it again
//! is a no-op. Only [`ProgressStore::clear`] (the operator `reset` command)
//! makes a completed window eligible again.
//!
//! The exception is a window that was clipped by an earlier range end. Its
//! record only covers `[window_start, window_end)`, so a later plan with the
//! same start and a later end treats it as pending and ingests it in full.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use duckdb::Connection;
use grid_ingest_dataset_models::{ProgressRecord, ProgressStatus, Window};

use crate::{DbError, from_stored, to_stored};

/// Durable record of which windows are done.
///
/// Every mutation is durable when it returns, and reads observe all
/// completed writes.
pub trait ProgressStore: Send + Sync {
    /// Returns the record for `(dataset, window_start)`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the store cannot be read.
    fn get(&self, dataset: &str, window_start: DateTime<Utc>)
    -> Result<Option<ProgressRecord>, DbError>;

    /// Returns `true` if all of `window` has been completed.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the store cannot be read.
    fn is_complete(&self, window: &Window) -> Result<bool, DbError> {
        Ok(self
            .get(&window.dataset, window.start)?
            .is_some_and(|r| r.covers(window)))
    }

    /// Records that an attempt at `window` started at `at`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the store cannot be written.
    fn mark_attempt(&self, window: &Window, at: DateTime<Utc>) -> Result<(), DbError>;

    /// Records that `window` was loaded from a payload with `fingerprint`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the store cannot be written.
    fn mark_complete(
        &self,
        window: &Window,
        fingerprint: &str,
        at: DateTime<Utc>,
    ) -> Result<(), DbError>;

    /// Records that the current attempt at `window` failed.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the store cannot be written.
    fn mark_failed(&self, window: &Window, reason: &str, at: DateTime<Utc>) -> Result<(), DbError>;

    /// Deletes records of `dataset` whose window starts in `[from, to)`.
    /// Returns the number of records removed.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the store cannot be written.
    fn clear(&self, dataset: &str, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<u64, DbError>;

    /// All records, optionally restricted to one dataset, ordered by
    /// dataset then window start.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the store cannot be read.
    fn records(&self, dataset: Option<&str>) -> Result<Vec<ProgressRecord>, DbError>;
}

/// A state change requested by the orchestrator.
#[derive(Debug, Clone, Copy)]
enum Transition<'a> {
    Attempt,
    Complete { fingerprint: &'a str },
    Failed { reason: &'a str },
}

/// Computes the record after `transition`, or `None` if nothing changes.
fn next_record(
    existing: Option<&ProgressRecord>,
    window: &Window,
    transition: Transition<'_>,
    at: DateTime<Utc>,
) -> Option<ProgressRecord> {
    if let Some(current) = existing
        && current.covers(window)
    {
        if let Transition::Complete { fingerprint } = transition
            && current.content_fingerprint.as_deref() != Some(fingerprint)
        {
            log::warn!(
                "{window}: already completed with fingerprint {:?}, keeping it over {fingerprint}",
                current.content_fingerprint
            );
        }
        return None;
    }

    let mut record = existing.cloned().unwrap_or_else(|| ProgressRecord {
        dataset: window.dataset.clone(),
        window_start: window.start,
        window_end: window.end,
        status: ProgressStatus::Pending,
        attempts: 0,
        last_attempt_at: None,
        content_fingerprint: None,
        last_error: None,
        updated_at: at,
    });
    record.window_end = window.end;
    record.updated_at = at;

    match transition {
        Transition::Attempt => {
            record.status = ProgressStatus::Pending;
            record.attempts = record.attempts.saturating_add(1);
            record.last_attempt_at = Some(at);
        }
        Transition::Complete { fingerprint } => {
            record.status = ProgressStatus::Completed;
            record.content_fingerprint = Some(fingerprint.to_string());
            record.last_error = None;
        }
        Transition::Failed { reason } => {
            record.status = ProgressStatus::Failed;
            record.last_error = Some(reason.to_string());
        }
    }

    Some(record)
}

// ── DuckDB ───────────────────────────────────────────────────────────────

/// [`ProgressStore`] in a `DuckDB` file.
pub struct DuckDbProgressStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for DuckDbProgressStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuckDbProgressStore").finish_non_exhaustive()
    }
}

impl DuckDbProgressStore {
    /// Opens (or creates) the store at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the file cannot be opened or the schema
    /// cannot be created.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        crate::paths::ensure_parent(path)?;
        let conn = Connection::open(path)?;
        create_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Opens a store backed by an in-memory `DuckDB` database.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the schema cannot be created.
    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        create_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn apply(
        &self,
        window: &Window,
        transition: Transition<'_>,
        at: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let conn = self.conn.lock().map_err(|_| DbError::Poisoned)?;
        let existing = select_one(&conn, &window.dataset, window.start)?;
        if let Some(record) = next_record(existing.as_ref(), window, transition, at) {
            upsert(&conn, &record)?;
        }
        Ok(())
    }
}

fn create_schema(conn: &Connection) -> Result<(), DbError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS progress (
            dataset TEXT NOT NULL,
            window_start TEXT NOT NULL,
            window_end TEXT NOT NULL,
            status TEXT NOT NULL,
            attempts INTEGER NOT NULL,
            last_attempt_at TEXT,
            content_fingerprint TEXT,
            last_error TEXT,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (dataset, window_start)
        );",
    )?;
    Ok(())
}

const SELECT_COLUMNS: &str = "SELECT dataset, window_start, window_end, status, attempts, \
     last_attempt_at, content_fingerprint, last_error, updated_at FROM progress";

/// Raw column values of one `progress` row.
type ProgressRow = (
    String,
    String,
    String,
    String,
    i64,
    Option<String>,
    Option<String>,
    Option<String>,
    String,
);

fn read_row(row: &duckdb::Row<'_>) -> duckdb::Result<ProgressRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

fn to_record(row: ProgressRow) -> Result<ProgressRecord, DbError> {
    let (
        dataset,
        window_start,
        window_end,
        status,
        attempts,
        last_attempt_at,
        content_fingerprint,
        last_error,
        updated_at,
    ) = row;
    Ok(ProgressRecord {
        dataset,
        window_start: from_stored(&window_start)?,
        window_end: from_stored(&window_end)?,
        status: status.parse().map_err(|_| DbError::Conversion {
            message: format!("unknown progress status {status:?}"),
        })?,
        attempts: u32::try_from(attempts).map_err(|_| DbError::Conversion {
            message: format!("invalid attempt count {attempts}"),
        })?,
        last_attempt_at: last_attempt_at.as_deref().map(from_stored).transpose()?,
        content_fingerprint,
        last_error,
        updated_at: from_stored(&updated_at)?,
    })
}

fn select_one(
    conn: &Connection,
    dataset: &str,
    window_start: DateTime<Utc>,
) -> Result<Option<ProgressRecord>, DbError> {
    let mut stmt = conn.prepare(&format!(
        "{SELECT_COLUMNS} WHERE dataset = ? AND window_start = ?"
    ))?;
    match stmt.query_row(duckdb::params![dataset, to_stored(&window_start)], read_row) {
        Ok(row) => to_record(row).map(Some),
        Err(duckdb::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(DbError::DuckDb(e)),
    }
}

fn upsert(conn: &Connection, record: &ProgressRecord) -> Result<(), DbError> {
    conn.execute(
        "INSERT INTO progress (dataset, window_start, window_end, status, attempts,
            last_attempt_at, content_fingerprint, last_error, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT (dataset, window_start) DO UPDATE SET
            window_end = EXCLUDED.window_end,
            status = EXCLUDED.status,
            attempts = EXCLUDED.attempts,
            last_attempt_at = EXCLUDED.last_attempt_at,
            content_fingerprint = EXCLUDED.content_fingerprint,
            last_error = EXCLUDED.last_error,
            updated_at = EXCLUDED.updated_at",
        duckdb::params![
            record.dataset,
            to_stored(&record.window_start),
            to_stored(&record.window_end),
            record.status.as_ref(),
            i64::from(record.attempts),
            record.last_attempt_at.as_ref().map(to_stored),
            record.content_fingerprint.as_deref(),
            record.last_error.as_deref(),
            to_stored(&record.updated_at),
        ],
    )?;
    Ok(())
}

impl ProgressStore for DuckDbProgressStore {
    fn get(
        &self,
        dataset: &str,
        window_start: DateTime<Utc>,
    ) -> Result<Option<ProgressRecord>, DbError> {
        let conn = self.conn.lock().map_err(|_| DbError::Poisoned)?;
        select_one(&conn, dataset, window_start)
    }

    fn mark_attempt(&self, window: &Window, at: DateTime<Utc>) -> Result<(), DbError> {
        self.apply(window, Transition::Attempt, at)
    }

    fn mark_complete(
        &self,
        window: &Window,
        fingerprint: &str,
        at: DateTime<Utc>,
    ) -> Result<(), DbError> {
        self.apply(window, Transition::Complete { fingerprint }, at)
    }

    fn mark_failed(&self, window: &Window, reason: &str, at: DateTime<Utc>) -> Result<(), DbError> {
        self.apply(window, Transition::Failed { reason }, at)
    }

    fn clear(&self, dataset: &str, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<u64, DbError> {
        let conn = self.conn.lock().map_err(|_| DbError::Poisoned)?;
        let removed = conn.execute(
            "DELETE FROM progress WHERE dataset = ? AND window_start >= ? AND window_start < ?",
            duckdb::params![dataset, to_stored(&from), to_stored(&to)],
        )?;
        Ok(u64::try_from(removed).unwrap_or(0))
    }

    fn records(&self, dataset: Option<&str>) -> Result<Vec<ProgressRecord>, DbError> {
        let conn = self.conn.lock().map_err(|_| DbError::Poisoned)?;
        let mut rows: Vec<ProgressRow> = Vec::new();
        if let Some(dataset) = dataset {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_COLUMNS} WHERE dataset = ? ORDER BY dataset, window_start"
            ))?;
            for row in stmt.query_map([dataset], read_row)? {
                rows.push(row?);
            }
        } else {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_COLUMNS} ORDER BY dataset, window_start"
            ))?;
            for row in stmt.query_map([], read_row)? {
                rows.push(row?);
            }
        }
        rows.into_iter().map(to_record).collect()
    }
}

// ── In-memory ────────────────────────────────────────────────────────────

/// [`ProgressStore`] kept in memory. Not durable; for tests.
#[derive(Debug, Default)]
pub struct MemoryProgressStore {
    records: Mutex<BTreeMap<(String, DateTime<Utc>), ProgressRecord>>,
}

impl MemoryProgressStore {
    fn apply(
        &self,
        window: &Window,
        transition: Transition<'_>,
        at: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let mut records = self.records.lock().map_err(|_| DbError::Poisoned)?;
        let key = (window.dataset.clone(), window.start);
        if let Some(record) = next_record(records.get(&key), window, transition, at) {
            records.insert(key, record);
        }
        Ok(())
    }
}

impl ProgressStore for MemoryProgressStore {
    fn get(
        &self,
        dataset: &str,
        window_start: DateTime<Utc>,
    ) -> Result<Option<ProgressRecord>, DbError> {
        let records = self.records.lock().map_err(|_| DbError::Poisoned)?;
        Ok(records.get(&(dataset.to_string(), window_start)).cloned())
    }

    fn mark_attempt(&self, window: &Window, at: DateTime<Utc>) -> Result<(), DbError> {
        self.apply(window, Transition::Attempt, at)
    }

    fn mark_complete(
        &self,
        window: &Window,
        fingerprint: &str,
        at: DateTime<Utc>,
    ) -> Result<(), DbError> {
        self.apply(window, Transition::Complete { fingerprint }, at)
    }

    fn mark_failed(&self, window: &Window, reason: &str, at: DateTime<Utc>) -> Result<(), DbError> {
        self.apply(window, Transition::Failed { reason }, at)
    }

    fn clear(&self, dataset: &str, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<u64, DbError> {
        let mut records = self.records.lock().map_err(|_| DbError::Poisoned)?;
        let before = records.len();
        records.retain(|(ds, start), _| !(ds == dataset && *start >= from && *start < to));
        Ok(u64::try_from(before - records.len()).unwrap_or(0))
    }

    fn records(&self, dataset: Option<&str>) -> Result<Vec<ProgressRecord>, DbError> {
        let records = self.records.lock().map_err(|_| DbError::Poisoned)?;
        Ok(records
            .values()
            .filter(|r| dataset.is_none_or(|d| r.dataset == d))
            .cloned()
            .collect())
    }
}
