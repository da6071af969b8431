//! Append-only log of failed windows for operator review.

use std::path::Path;
use std::sync::Mutex;

use duckdb::Connection;
use grid_ingest_dataset_models::FailureRecord;

use crate::{DbError, from_stored, to_stored};

/// Where terminal window failures are recorded.
pub trait FailureLog: Send + Sync {
    /// Appends `record`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the log cannot be written.
    fn append(&self, record: &FailureRecord) -> Result<(), DbError>;

    /// Recorded failures, oldest first, optionally restricted to one
    /// dataset.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the log cannot be read.
    fn records(&self, dataset: Option<&str>) -> Result<Vec<FailureRecord>, DbError>;
}

/// [`FailureLog`] in a `DuckDB` file.
pub struct DuckDbFailureLog {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for DuckDbFailureLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuckDbFailureLog").finish_non_exhaustive()
    }
}

impl DuckDbFailureLog {
    /// Opens (or creates) the log at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the file cannot be opened or the schema
    /// cannot be created.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        crate::paths::ensure_parent(path)?;
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE SEQUENCE IF NOT EXISTS failures_seq;
             CREATE TABLE IF NOT EXISTS failures (
                id BIGINT PRIMARY KEY DEFAULT nextval('failures_seq'),
                dataset TEXT NOT NULL,
                window_start TEXT NOT NULL,
                window_end TEXT NOT NULL,
                failed_at TEXT NOT NULL,
                stage TEXT NOT NULL,
                reason TEXT NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

type FailureRow = (String, String, String, String, String, String);

fn read_row(row: &duckdb::Row<'_>) -> duckdb::Result<FailureRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn to_record(row: FailureRow) -> Result<FailureRecord, DbError> {
    let (dataset, window_start, window_end, failed_at, stage, reason) = row;
    Ok(FailureRecord {
        dataset,
        window_start: from_stored(&window_start)?,
        window_end: from_stored(&window_end)?,
        failed_at: from_stored(&failed_at)?,
        stage: stage.parse().map_err(|_| DbError::Conversion {
            message: format!("unknown failure stage {stage:?}"),
        })?,
        reason,
    })
}

impl FailureLog for DuckDbFailureLog {
    fn append(&self, record: &FailureRecord) -> Result<(), DbError> {
        let conn = self.conn.lock().map_err(|_| DbError::Poisoned)?;
        conn.execute(
            "INSERT INTO failures (dataset, window_start, window_end, failed_at, stage, reason)
             VALUES (?, ?, ?, ?, ?, ?)",
            duckdb::params![
                record.dataset,
                to_stored(&record.window_start),
                to_stored(&record.window_end),
                to_stored(&record.failed_at),
                record.stage.as_ref(),
                record.reason,
            ],
        )?;
        Ok(())
    }

    fn records(&self, dataset: Option<&str>) -> Result<Vec<FailureRecord>, DbError> {
        const COLUMNS: &str =
            "SELECT dataset, window_start, window_end, failed_at, stage, reason FROM failures";

        let conn = self.conn.lock().map_err(|_| DbError::Poisoned)?;
        let mut rows = Vec::new();
        if let Some(dataset) = dataset {
            let mut stmt = conn.prepare(&format!("{COLUMNS} WHERE dataset = ? ORDER BY id"))?;
            for row in stmt.query_map([dataset], read_row)? {
                rows.push(row?);
            }
        } else {
            let mut stmt = conn.prepare(&format!("{COLUMNS} ORDER BY id"))?;
            for row in stmt.query_map([], read_row)? {
                rows.push(row?);
            }
        }
        rows.into_iter().map(to_record).collect()
    }
}

/// [`FailureLog`] kept in memory, for tests.
#[derive(Debug, Default)]
pub struct MemoryFailureLog {
    records: Mutex<Vec<FailureRecord>>,
}

impl FailureLog for MemoryFailureLog {
    fn append(&self, record: &FailureRecord) -> Result<(), DbError> {
        self.records
            .lock()
            .map_err(|_| DbError::Poisoned)?
            .push(record.clone());
        Ok(())
    }

    fn records(&self, dataset: Option<&str>) -> Result<Vec<FailureRecord>, DbError> {
        Ok(self
            .records
            .lock()
            .map_err(|_| DbError::Poisoned)?
            .iter()
            .filter(|r| dataset.is_none_or(|d| r.dataset == d))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeDelta, Utc};
    use grid_ingest_dataset_models::{FailureStage, Window};

    use super::*;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn failure(dataset: &str, hour: i64, stage: FailureStage) -> FailureRecord {
        let start = ts("2024-01-01T00:00:00Z") + TimeDelta::hours(hour);
        let window = Window {
            dataset: dataset.to_string(),
            start,
            end: start + TimeDelta::hours(1),
        };
        FailureRecord::new(&window, ts("2024-03-01T12:00:00Z"), stage, "HTTP 400: bad request")
    }

    #[test]
    fn duckdb_log_appends_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        let log = DuckDbFailureLog::open(&dir.path().join("state/failures.duckdb")).unwrap();

        log.append(&failure("BOD", 3, FailureStage::Fetch)).unwrap();
        log.append(&failure("FREQ", 1, FailureStage::Transform)).unwrap();
        log.append(&failure("BOD", 3, FailureStage::Load)).unwrap();

        let all = log.records(None).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0], failure("BOD", 3, FailureStage::Fetch));

        let bod = log.records(Some("BOD")).unwrap();
        assert_eq!(bod.len(), 2);
        assert_eq!(bod[1].stage, FailureStage::Load);
    }

    #[test]
    fn duckdb_log_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failures.duckdb");
        DuckDbFailureLog::open(&path)
            .unwrap()
            .append(&failure("MID", 0, FailureStage::Fetch))
            .unwrap();
        let reopened = DuckDbFailureLog::open(&path).unwrap();
        assert_eq!(reopened.records(Some("MID")).unwrap().len(), 1);
    }

    #[test]
    fn memory_log_filters_by_dataset() {
        let log = MemoryFailureLog::default();
        log.append(&failure("BOD", 0, FailureStage::Fetch)).unwrap();
        log.append(&failure("TEMP", 0, FailureStage::Fetch)).unwrap();
        assert_eq!(log.records(Some("TEMP")).unwrap().len(), 1);
        assert_eq!(log.records(None).unwrap().len(), 2);
    }
}
