#![allow(clippy::module_name_repetitions)]
//! Canonical file paths under the data directory.
//!
//! ```text
//! <data_dir>/
//!   state/progress.duckdb
//!   state/failures.duckdb
//!   warehouse/<table>.duckdb
//!   raw/<DATASET>/<window start>.json
//! ```

use std::path::{Path, PathBuf};

/// Data directory used when none is configured.
pub const DEFAULT_DATA_DIR: &str = "data";

/// Resolves every file the pipeline writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPaths {
    root: PathBuf,
}

impl Default for DataPaths {
    fn default() -> Self {
        Self::new(DEFAULT_DATA_DIR)
    }
}

impl DataPaths {
    /// Creates paths rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory for run bookkeeping.
    #[must_use]
    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    /// Progress store database.
    #[must_use]
    pub fn progress_db_path(&self) -> PathBuf {
        self.state_dir().join("progress.duckdb")
    }

    /// Failure log database.
    #[must_use]
    pub fn failure_db_path(&self) -> PathBuf {
        self.state_dir().join("failures.duckdb")
    }

    /// Directory of per-table warehouse files.
    #[must_use]
    pub fn warehouse_dir(&self) -> PathBuf {
        self.root.join("warehouse")
    }

    /// Warehouse file for `table`.
    #[must_use]
    pub fn table_db_path(&self, table: &str) -> PathBuf {
        self.warehouse_dir().join(format!("{table}.duckdb"))
    }

    /// Raw payload archive.
    #[must_use]
    pub fn raw_dir(&self) -> PathBuf {
        self.root.join("raw")
    }
}

/// Ensures a directory exists, creating it if necessary.
///
/// # Errors
///
/// Returns an I/O error if the directory cannot be created.
pub fn ensure_dir(path: &Path) -> std::io::Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}

/// Ensures the parent directory of `path` exists.
///
/// # Errors
///
/// Returns an I/O error if the directory cannot be created.
pub fn ensure_parent(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => ensure_dir(parent),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lays_out_state_and_warehouse() {
        let paths = DataPaths::new("/srv/grid");
        assert_eq!(
            paths.progress_db_path(),
            PathBuf::from("/srv/grid/state/progress.duckdb")
        );
        assert_eq!(
            paths.failure_db_path(),
            PathBuf::from("/srv/grid/state/failures.duckdb")
        );
        assert_eq!(
            paths.table_db_path("bmrs_bod"),
            PathBuf::from("/srv/grid/warehouse/bmrs_bod.duckdb")
        );
        assert_eq!(paths.raw_dir(), PathBuf::from("/srv/grid/raw"));
    }

    #[test]
    fn ensure_parent_creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a/b/c.duckdb");
        ensure_parent(&file).unwrap();
        assert!(dir.path().join("a/b").is_dir());
    }
}
