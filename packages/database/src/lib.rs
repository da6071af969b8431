#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Durable state and warehouse storage for the ingestion pipeline.
//!
//! Everything lives in `DuckDB` files under the data directory (see
//! [`paths`]): the progress store and failure log under `state/`, and one
//! file per destination table under `warehouse/`. Each store is a trait
//! with a `DuckDB` implementation and an in-memory one for tests.

pub mod failure_log;
pub mod paths;
pub mod progress_store;
pub mod warehouse;

use chrono::{DateTime, Utc};
use grid_ingest_source::retry::Retryable;

/// Errors from the progress store and failure log.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// `DuckDB` error.
    #[error("DuckDB error: {0}")]
    DuckDb(#[from] duckdb::Error),

    /// I/O error (creating directories).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored value could not be converted back.
    #[error("Data conversion error: {message}")]
    Conversion {
        /// Description of what went wrong.
        message: String,
    },

    /// A connection lock was poisoned by a panicking thread.
    #[error("Connection lock poisoned")]
    Poisoned,
}

/// Errors from appending rows to the warehouse.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LoadError {
    /// Lock contention or I/O failure. Worth retrying.
    #[error("Transient load error: {message}")]
    Transient {
        /// Description of what went wrong.
        message: String,
    },

    /// Anything else, e.g. a schema mismatch.
    #[error("Permanent load error: {message}")]
    Permanent {
        /// Description of what went wrong.
        message: String,
    },

    /// Every attempt failed transiently.
    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Attempts made.
        attempts: u32,
        /// Message of the final transient error.
        last: String,
    },
}

impl Retryable for LoadError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

impl From<DbError> for LoadError {
    fn from(e: DbError) -> Self {
        let message = e.to_string();
        let transient = match &e {
            DbError::Io(_) => true,
            DbError::DuckDb(inner) => is_transient_duckdb(inner),
            DbError::Conversion { .. } | DbError::Poisoned => false,
        };
        if transient {
            Self::Transient { message }
        } else {
            Self::Permanent { message }
        }
    }
}

impl From<duckdb::Error> for LoadError {
    fn from(e: duckdb::Error) -> Self {
        DbError::DuckDb(e).into()
    }
}

/// `DuckDB` reports lock conflicts and file-system problems as
/// `IO Error` / `Conflict` messages rather than distinct codes.
fn is_transient_duckdb(e: &duckdb::Error) -> bool {
    let message = e.to_string();
    ["IO Error", "Could not set lock", "Conflict", "database is locked"]
        .iter()
        .any(|needle| message.contains(needle))
}

/// Format used for timestamps stored as text: fixed width, so text order
/// matches time order.
const STORED_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

/// Renders a timestamp for storage.
#[must_use]
pub fn to_stored(dt: &DateTime<Utc>) -> String {
    dt.format(STORED_TIMESTAMP_FORMAT).to_string()
}

/// Parses a timestamp written by [`to_stored`].
///
/// # Errors
///
/// Returns [`DbError::Conversion`] if the text is not a valid timestamp.
pub fn from_stored(s: &str) -> Result<DateTime<Utc>, DbError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DbError::Conversion {
            message: format!("invalid stored timestamp {s:?}: {e}"),
        })
}
