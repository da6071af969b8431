//! Columnar warehouse storage for transformed rows.
//!
//! Each destination table gets its own `DuckDB` file at
//! `warehouse/<table>.duckdb`. Columns follow the dataset schema, followed by
//! metadata columns describing where each row came from. Ingestion only ever
//! appends: de-duplication happens downstream on `_business_key` plus
//! `_content_fingerprint` (or latest `_ingested_utc`). Rows are removed only
//! by the operator purge, one partition-date range at a time.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::NaiveDate;
use duckdb::Connection;
use grid_ingest_dataset_models::{DatasetSpec, FieldType, FieldValue, IngestedRow};
use grid_ingest_source::retry::{RetryPolicy, Sleeper, retry};

use crate::paths::DataPaths;
use crate::{DbError, LoadError};

/// Rows bound per multi-row INSERT statement.
const CHUNK_SIZE: usize = 2_000;

/// Metadata columns appended after the schema columns, in insert order.
pub const METADATA_COLUMNS: &[(&str, &str)] = &[
    ("_partition_date", "DATE NOT NULL"),
    ("_business_key", "TEXT NOT NULL"),
    ("_row_hash", "TEXT NOT NULL"),
    ("_content_fingerprint", "TEXT NOT NULL"),
    ("_ingested_utc", "TIMESTAMPTZ NOT NULL"),
    ("_window_from_utc", "TIMESTAMPTZ NOT NULL"),
    ("_window_to_utc", "TIMESTAMPTZ NOT NULL"),
];

/// Outcome of appending one window's rows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadResult {
    /// Rows written.
    pub rows_written: u64,
    /// Rows written per partition date.
    pub partitions: BTreeMap<NaiveDate, u64>,
}

impl LoadResult {
    fn from_rows(rows: &[IngestedRow]) -> Self {
        let mut partitions = BTreeMap::new();
        for row in rows {
            *partitions.entry(row.partition_date).or_insert(0) += 1;
        }
        Self {
            rows_written: rows.len() as u64,
            partitions,
        }
    }
}

/// Append-only destination for transformed rows.
pub trait Warehouse: Send + Sync {
    /// Appends `rows` to the dataset's table in one atomic write. A single
    /// attempt; retrying is the [`Loader`]'s job.
    ///
    /// # Errors
    ///
    /// Returns [`LoadError`] if the rows could not be written. Nothing is
    /// written on error.
    fn append(&self, spec: &DatasetSpec, rows: &[IngestedRow]) -> Result<LoadResult, LoadError>;

    /// Number of rows stored in the dataset's table.
    ///
    /// # Errors
    ///
    /// Returns [`LoadError`] if the table cannot be read.
    fn row_count(&self, spec: &DatasetSpec) -> Result<u64, LoadError>;

    /// Deletes the dataset's rows whose `_partition_date` is in
    /// `[from, to)` and returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns [`LoadError`] if the table cannot be written.
    fn delete_partitions(&self, spec: &DatasetSpec, from: NaiveDate, to: NaiveDate) -> Result<u64, LoadError>;
}

// ── DuckDB ───────────────────────────────────────────────────────────────

/// [`Warehouse`] writing one `DuckDB` file per table.
pub struct DuckDbWarehouse {
    paths: DataPaths,
    connections: Mutex<BTreeMap<String, Arc<Mutex<Connection>>>>,
}

impl std::fmt::Debug for DuckDbWarehouse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuckDbWarehouse")
            .field("paths", &self.paths)
            .finish_non_exhaustive()
    }
}

impl DuckDbWarehouse {
    /// Creates a warehouse under `paths`. Table files are opened lazily.
    #[must_use]
    pub fn new(paths: DataPaths) -> Self {
        Self {
            paths,
            connections: Mutex::new(BTreeMap::new()),
        }
    }

    /// Returns the (cached) connection for `spec`'s table, creating the file
    /// and table on first use.
    fn connection(&self, spec: &DatasetSpec) -> Result<Arc<Mutex<Connection>>, DbError> {
        let mut connections = self.connections.lock().map_err(|_| DbError::Poisoned)?;
        if let Some(conn) = connections.get(&spec.table) {
            return Ok(Arc::clone(conn));
        }

        let path = self.paths.table_db_path(&spec.table);
        crate::paths::ensure_parent(&path)?;
        let conn = Connection::open(&path)?;
        ensure_table(&conn, spec)?;
        log::debug!("Opened warehouse table {} at {}", spec.table, path.display());

        let conn = Arc::new(Mutex::new(conn));
        connections.insert(spec.table.clone(), Arc::clone(&conn));
        Ok(conn)
    }
}

const fn column_type(field_type: FieldType) -> &'static str {
    match field_type {
        FieldType::Date => "DATE",
        FieldType::Timestamp => "TIMESTAMPTZ",
        FieldType::Integer => "BIGINT",
        FieldType::Decimal => "DOUBLE",
        FieldType::String => "TEXT",
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Creates the table if missing and adds columns declared since it was
/// created.
fn ensure_table(conn: &Connection, spec: &DatasetSpec) -> Result<(), DbError> {
    let columns: Vec<String> = spec
        .fields
        .iter()
        .map(|f| format!("{} {}", quote_ident(&f.name), column_type(f.field_type)))
        .chain(
            METADATA_COLUMNS
                .iter()
                .map(|(name, ty)| format!("{} {ty}", quote_ident(name))),
        )
        .collect();
    let table = quote_ident(&spec.table);

    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {table} (\n    {}\n);",
        columns.join(",\n    ")
    ))?;

    for field in &spec.fields {
        conn.execute_batch(&format!(
            "ALTER TABLE {table} ADD COLUMN IF NOT EXISTS {} {};",
            quote_ident(&field.name),
            column_type(field.field_type)
        ))?;
    }

    Ok(())
}

fn timestamp_text(dt: &chrono::DateTime<chrono::Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S%.6f+00").to_string()
}

fn bind_value(
    stmt: &mut duckdb::Statement<'_>,
    idx: usize,
    value: &FieldValue,
) -> duckdb::Result<()> {
    match value {
        FieldValue::Null => stmt.raw_bind_parameter(idx, Option::<&str>::None),
        FieldValue::Date(d) => stmt.raw_bind_parameter(idx, d.format("%Y-%m-%d").to_string()),
        FieldValue::Timestamp(ts) => stmt.raw_bind_parameter(idx, timestamp_text(ts)),
        FieldValue::Integer(i) => stmt.raw_bind_parameter(idx, *i),
        FieldValue::Decimal(f) => stmt.raw_bind_parameter(idx, *f),
        FieldValue::String(s) => stmt.raw_bind_parameter(idx, s.as_str()),
    }
}

fn insert_rows(conn: &mut Connection, spec: &DatasetSpec, rows: &[IngestedRow]) -> Result<(), DbError> {
    let column_list: Vec<String> = spec
        .fields
        .iter()
        .map(|f| quote_ident(&f.name))
        .chain(METADATA_COLUMNS.iter().map(|(name, _)| quote_ident(name)))
        .collect();
    let width = column_list.len();
    let placeholders = format!("({})", vec!["?"; width].join(", "));
    let prefix = format!(
        "INSERT INTO {} ({}) VALUES ",
        quote_ident(&spec.table),
        column_list.join(", ")
    );

    let tx = conn.transaction()?;

    for chunk in rows.chunks(CHUNK_SIZE) {
        let mut sql = prefix.clone();
        sql.push_str(&vec![placeholders.as_str(); chunk.len()].join(", "));

        let mut stmt = tx.prepare(&sql)?;
        let mut param_idx = 1usize;

        for row in chunk {
            if row.values.len() != spec.fields.len() {
                return Err(DbError::Conversion {
                    message: format!(
                        "row has {} values but {} declares {} fields",
                        row.values.len(),
                        spec.name,
                        spec.fields.len()
                    ),
                });
            }
            for value in &row.values {
                bind_value(&mut stmt, param_idx, value)?;
                param_idx += 1;
            }
            stmt.raw_bind_parameter(param_idx, row.partition_date.format("%Y-%m-%d").to_string())?;
            stmt.raw_bind_parameter(param_idx + 1, row.business_key.as_str())?;
            stmt.raw_bind_parameter(param_idx + 2, row.row_hash.as_str())?;
            stmt.raw_bind_parameter(param_idx + 3, row.content_fingerprint.as_str())?;
            stmt.raw_bind_parameter(param_idx + 4, timestamp_text(&row.ingested_at))?;
            stmt.raw_bind_parameter(param_idx + 5, timestamp_text(&row.window_start))?;
            stmt.raw_bind_parameter(param_idx + 6, timestamp_text(&row.window_end))?;
            param_idx += METADATA_COLUMNS.len();
        }

        stmt.raw_execute()?;
    }

    tx.commit()?;
    Ok(())
}

impl Warehouse for DuckDbWarehouse {
    fn append(&self, spec: &DatasetSpec, rows: &[IngestedRow]) -> Result<LoadResult, LoadError> {
        if rows.is_empty() {
            return Ok(LoadResult::default());
        }
        let conn = self.connection(spec)?;
        let mut conn = conn.lock().map_err(|_| DbError::Poisoned)?;
        insert_rows(&mut conn, spec, rows)?;
        Ok(LoadResult::from_rows(rows))
    }

    fn row_count(&self, spec: &DatasetSpec) -> Result<u64, LoadError> {
        let conn = self.connection(spec)?;
        let conn = conn.lock().map_err(|_| DbError::Poisoned)?;
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", quote_ident(&spec.table)),
            [],
            |row| row.get(0),
        )?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    fn delete_partitions(&self, spec: &DatasetSpec, from: NaiveDate, to: NaiveDate) -> Result<u64, LoadError> {
        let conn = self.connection(spec)?;
        let conn = conn.lock().map_err(|_| DbError::Poisoned)?;
        let removed = conn.execute(
            &format!(
                "DELETE FROM {} WHERE _partition_date >= CAST(? AS DATE) AND _partition_date < CAST(? AS DATE)",
                quote_ident(&spec.table)
            ),
            duckdb::params![from.format("%Y-%m-%d").to_string(), to.format("%Y-%m-%d").to_string()],
        )?;
        log::debug!("Deleted {removed} row(s) from {} for [{from}, {to})", spec.table);
        Ok(u64::try_from(removed).unwrap_or(0))
    }
}

// ── In-memory ────────────────────────────────────────────────────────────

/// [`Warehouse`] kept in memory, with scriptable failures. For tests.
#[derive(Debug, Default)]
pub struct MemoryWarehouse {
    tables: Mutex<BTreeMap<String, Vec<IngestedRow>>>,
    failures: Mutex<VecDeque<LoadError>>,
}

impl MemoryWarehouse {
    /// Makes the next `append` calls fail with `errors`, in order.
    pub fn fail_next(&self, errors: impl IntoIterator<Item = LoadError>) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.extend(errors);
        }
    }

    /// Rows stored in `table`.
    #[must_use]
    pub fn rows(&self, table: &str) -> Vec<IngestedRow> {
        self.tables
            .lock()
            .ok()
            .and_then(|tables| tables.get(table).cloned())
            .unwrap_or_default()
    }
}

impl Warehouse for MemoryWarehouse {
    fn append(&self, spec: &DatasetSpec, rows: &[IngestedRow]) -> Result<LoadResult, LoadError> {
        if let Some(err) = self
            .failures
            .lock()
            .map_err(|_| LoadError::Permanent {
                message: "failure script lock poisoned".to_string(),
            })?
            .pop_front()
        {
            return Err(err);
        }
        self.tables
            .lock()
            .map_err(|_| LoadError::Permanent {
                message: "table lock poisoned".to_string(),
            })?
            .entry(spec.table.clone())
            .or_default()
            .extend_from_slice(rows);
        Ok(LoadResult::from_rows(rows))
    }

    fn row_count(&self, spec: &DatasetSpec) -> Result<u64, LoadError> {
        Ok(self.rows(&spec.table).len() as u64)
    }

    fn delete_partitions(&self, spec: &DatasetSpec, from: NaiveDate, to: NaiveDate) -> Result<u64, LoadError> {
        let mut tables = self.tables.lock().map_err(|_| LoadError::Permanent {
            message: "table lock poisoned".to_string(),
        })?;
        let Some(rows) = tables.get_mut(&spec.table) else {
            return Ok(0);
        };
        let before = rows.len();
        rows.retain(|row| row.partition_date < from || row.partition_date >= to);
        Ok((before - rows.len()) as u64)
    }
}

// ── Loader ───────────────────────────────────────────────────────────────

/// Appends rows through a [`Warehouse`], retrying transient failures.
#[derive(Clone)]
pub struct Loader {
    warehouse: Arc<dyn Warehouse>,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl std::fmt::Debug for Loader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Loader")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl Loader {
    /// Creates a loader.
    #[must_use]
    pub fn new(warehouse: Arc<dyn Warehouse>, policy: RetryPolicy, sleeper: Arc<dyn Sleeper>) -> Self {
        Self {
            warehouse,
            policy,
            sleeper,
        }
    }

    /// The underlying warehouse.
    #[must_use]
    pub fn warehouse(&self) -> &Arc<dyn Warehouse> {
        &self.warehouse
    }

    /// Appends `rows` for `spec`. Each attempt runs on the blocking pool.
    ///
    /// # Errors
    ///
    /// Returns [`LoadError::Permanent`] on a non-retryable failure and
    /// [`LoadError::RetriesExhausted`] when every attempt failed
    /// transiently.
    pub async fn load(
        &self,
        spec: &Arc<DatasetSpec>,
        rows: &Arc<Vec<IngestedRow>>,
        label: &str,
    ) -> Result<LoadResult, LoadError> {
        let result = retry(&self.policy, self.sleeper.as_ref(), label, |_| {
            let warehouse = Arc::clone(&self.warehouse);
            let spec = Arc::clone(spec);
            let rows = Arc::clone(rows);
            async move {
                tokio::task::spawn_blocking(move || warehouse.append(&spec, &rows))
                    .await
                    .map_err(|e| LoadError::Permanent {
                        message: format!("load task failed: {e}"),
                    })?
            }
        })
        .await;

        match result {
            Ok(done) => Ok(done.value),
            Err(failed) => match failed.value {
                LoadError::Transient { message } => Err(LoadError::RetriesExhausted {
                    attempts: failed.attempts,
                    last: message,
                }),
                other => Err(other),
            },
        }
    }
}
