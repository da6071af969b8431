#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Dataset definitions and the values that flow through the ingestion
//! pipeline.
//!
//! A [`DatasetSpec`] is loaded once at startup. The planner cuts its date
//! range into [`Window`]s, each fetch produces a [`RawPayload`], and the
//! transformer turns that payload into schema-typed [`IngestedRow`]s. The
//! durable bookkeeping types ([`ProgressRecord`], [`FailureRecord`]) live
//! here too so every crate agrees on their shape.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, SecondsFormat, TimeDelta, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};
use strum_macros::{AsRefStr, Display, EnumString};

/// Default envelope key holding the record list in API responses.
pub const DEFAULT_RECORDS_PATH: &str = "data";

// ── Schema ───────────────────────────────────────────────────────────────

/// Semantic type of a dataset field.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FieldType {
    /// Calendar date (`YYYY-MM-DD`).
    Date,
    /// Instant in time, normalized to UTC.
    Timestamp,
    /// Signed 64-bit integer.
    Integer,
    /// Floating point number.
    Decimal,
    /// Free-form text.
    String,
}

/// One declared field of a dataset schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// JSON key in the source records (also the warehouse column name).
    pub name: String,
    /// Declared semantic type.
    #[serde(rename = "type")]
    pub field_type: FieldType,
    /// Whether a missing or uncastable value may be stored as null. Rows
    /// with a null non-nullable field are dropped.
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

const fn default_nullable() -> bool {
    true
}

/// A complete, config-driven dataset definition.
///
/// Loaded from TOML at startup and treated as immutable afterwards.
#[derive(Debug, Clone, Deserialize)]
pub struct DatasetSpec {
    /// Unique dataset name (e.g., `"FUELINST"`).
    pub name: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Longest window a single request may cover.
    #[serde(deserialize_with = "deserialize_window_duration")]
    pub max_window: TimeDelta,
    /// Destination warehouse table.
    pub table: String,
    /// Native date field used to pick each row's warehouse partition.
    pub partition_field: String,
    /// Fields identifying one business record, used downstream for
    /// de-duplication together with the content fingerprint.
    #[serde(default)]
    pub business_key: Vec<String>,
    /// Path relative to the API base URL. Defaults to the dataset name.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Envelope key holding the record list. Defaults to
    /// [`DEFAULT_RECORDS_PATH`]; bare-array responses are accepted either
    /// way.
    #[serde(default)]
    pub records_path: Option<String>,
    /// Extra query parameters sent with every request.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    /// Overrides the configured maximum fraction of dropped rows.
    #[serde(default)]
    pub max_drop_fraction: Option<f64>,
    /// Datasets known to be offline are skipped unless explicitly included.
    #[serde(default)]
    pub likely_offline: bool,
    /// Ordered schema.
    pub fields: Vec<FieldSpec>,
}

impl DatasetSpec {
    /// Returns the API path for this dataset.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        self.endpoint.as_deref().unwrap_or(&self.name)
    }

    /// Returns the envelope key holding the record list.
    #[must_use]
    pub fn records_path(&self) -> &str {
        self.records_path.as_deref().unwrap_or(DEFAULT_RECORDS_PATH)
    }

    /// Returns the schema position of the named field.
    #[must_use]
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Returns the declared field with the given name.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// Error returned when a window duration string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid window duration {input:?}: expected <n>h, <n>d or <n>w with n > 0")]
pub struct DurationParseError {
    /// The rejected input.
    pub input: String,
}

/// Parses a window duration such as `"1h"`, `"1d"`, `"7d"` or `"2w"`.
///
/// # Errors
///
/// Returns [`DurationParseError`] if the unit is unknown or the amount is
/// not a positive integer.
pub fn parse_window_duration(spec: &str) -> Result<TimeDelta, DurationParseError> {
    let err = || DurationParseError {
        input: spec.to_string(),
    };
    let trimmed = spec.trim().to_ascii_lowercase();
    if trimmed.len() < 2 {
        return Err(err());
    }
    let (amount, unit) = trimmed.split_at(trimmed.len() - 1);
    let amount: i64 = amount.parse().map_err(|_| err())?;
    if amount <= 0 {
        return Err(err());
    }
    let delta = match unit {
        "h" => TimeDelta::try_hours(amount),
        "d" => TimeDelta::try_days(amount),
        "w" => TimeDelta::try_weeks(amount),
        _ => None,
    };
    delta.ok_or_else(err)
}

fn deserialize_window_duration<'de, D>(deserializer: D) -> Result<TimeDelta, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_window_duration(&raw).map_err(serde::de::Error::custom)
}

// ── Windows ──────────────────────────────────────────────────────────────

/// A half-open time interval `[start, end)` scoped to one dataset.
///
/// Identified by `(dataset, start)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Window {
    /// Owning dataset name.
    pub dataset: String,
    /// Inclusive start.
    pub start: DateTime<Utc>,
    /// Exclusive end.
    pub end: DateTime<Utc>,
}

impl Window {
    /// Length of the window.
    #[must_use]
    pub fn duration(&self) -> TimeDelta {
        self.end - self.start
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}, {})",
            self.dataset,
            format_utc(&self.start),
            format_utc(&self.end)
        )
    }
}

/// Order in which planned windows are handed out.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum WindowOrder {
    /// Systematic backfill from the start of the range.
    #[default]
    OldestFirst,
    /// Most recent data first.
    NewestFirst,
}

/// Formats a timestamp as RFC 3339 with second precision and a `Z` suffix.
#[must_use]
pub fn format_utc(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

// ── Payloads and rows ────────────────────────────────────────────────────

/// Unparsed bytes returned by one fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPayload {
    /// Response body.
    pub bytes: Vec<u8>,
    /// SHA-256 hex digest of [`Self::bytes`].
    pub fingerprint: String,
    /// When the final successful request completed.
    pub fetched_at: DateTime<Utc>,
    /// Number of HTTP attempts it took to get this payload.
    pub attempts: u32,
}

impl RawPayload {
    /// Wraps response bytes, computing the content fingerprint.
    #[must_use]
    pub fn new(bytes: Vec<u8>, fetched_at: DateTime<Utc>, attempts: u32) -> Self {
        let fingerprint = content_fingerprint(&bytes);
        Self {
            bytes,
            fingerprint,
            fetched_at,
            attempts,
        }
    }
}

/// Returns the SHA-256 hex digest of `bytes`.
#[must_use]
pub fn content_fingerprint(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// One schema-typed value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    /// Missing or uncastable.
    Null,
    /// Calendar date.
    Date(NaiveDate),
    /// UTC instant.
    Timestamp(DateTime<Utc>),
    /// Integer.
    Integer(i64),
    /// Floating point number.
    Decimal(f64),
    /// Text.
    String(String),
}

impl FieldValue {
    /// Returns `true` for [`FieldValue::Null`].
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Returns the calendar date of a date or timestamp value.
    #[must_use]
    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Self::Date(d) => Some(*d),
            Self::Timestamp(ts) => Some(ts.date_naive()),
            _ => None,
        }
    }

    /// Canonical text form used for business keys. Null renders as an
    /// empty string.
    #[must_use]
    pub fn to_key_string(&self) -> String {
        match self {
            Self::Null => String::new(),
            Self::Date(d) => d.format("%Y-%m-%d").to_string(),
            Self::Timestamp(ts) => format_utc(ts),
            Self::Integer(i) => i.to_string(),
            Self::Decimal(f) => f.to_string(),
            Self::String(s) => s.clone(),
        }
    }
}

/// One transformed record, ready for load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestedRow {
    /// Values in dataset schema order.
    pub values: Vec<FieldValue>,
    /// Warehouse partition derived from the dataset's partition field.
    pub partition_date: NaiveDate,
    /// `|`-joined business key values.
    pub business_key: String,
    /// SHA-256 hex digest of the typed values.
    pub row_hash: String,
    /// Fingerprint of the payload this row came from.
    pub content_fingerprint: String,
    /// When the row was produced.
    pub ingested_at: DateTime<Utc>,
    /// Start of the window that fetched it.
    pub window_start: DateTime<Utc>,
    /// End of the window that fetched it.
    pub window_end: DateTime<Utc>,
}

// ── Durable bookkeeping ──────────────────────────────────────────────────

/// Status of a window in the progress store.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ProgressStatus {
    /// An attempt has started and not finished.
    Pending,
    /// Loaded successfully. Never re-attempted by normal runs.
    Completed,
    /// The last attempt failed. A fresh run retries it.
    Failed,
}

/// Progress of one `(dataset, window_start)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressRecord {
    /// Dataset name.
    pub dataset: String,
    /// Window start (identity).
    pub window_start: DateTime<Utc>,
    /// Window end.
    pub window_end: DateTime<Utc>,
    /// Current status.
    pub status: ProgressStatus,
    /// Number of attempts started across all runs.
    pub attempts: u32,
    /// When the most recent attempt started.
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Fingerprint of the payload that completed the window.
    pub content_fingerprint: Option<String>,
    /// Reason of the most recent failure.
    pub last_error: Option<String>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

impl ProgressRecord {
    /// Whether this record marks all of `window` as loaded. A completed
    /// record that was clipped short of `window.end` does not count.
    #[must_use]
    pub fn covers(&self, window: &Window) -> bool {
        self.status == ProgressStatus::Completed && self.window_end >= window.end
    }
}

/// Pipeline stage at which a window failed.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FailureStage {
    /// Fetching from the remote API.
    Fetch,
    /// Parsing or schema validation.
    Transform,
    /// Appending to the warehouse.
    Load,
    /// Recording progress.
    Progress,
}

/// A window that failed terminally, kept for operator review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Dataset name.
    pub dataset: String,
    /// Window start.
    pub window_start: DateTime<Utc>,
    /// Window end.
    pub window_end: DateTime<Utc>,
    /// When the failure was recorded.
    pub failed_at: DateTime<Utc>,
    /// Stage that failed.
    pub stage: FailureStage,
    /// Human-readable reason.
    pub reason: String,
}

impl FailureRecord {
    /// Builds a record for `window`.
    #[must_use]
    pub fn new(
        window: &Window,
        failed_at: DateTime<Utc>,
        stage: FailureStage,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            dataset: window.dataset.clone(),
            window_start: window.start,
            window_end: window.end,
            failed_at,
            stage,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_window_durations() {
        assert_eq!(parse_window_duration("1h").unwrap(), TimeDelta::hours(1));
        assert_eq!(parse_window_duration("1d").unwrap(), TimeDelta::days(1));
        assert_eq!(parse_window_duration(" 7D ").unwrap(), TimeDelta::days(7));
        assert_eq!(parse_window_duration("2w").unwrap(), TimeDelta::weeks(2));
    }

    #[test]
    fn rejects_bad_window_durations() {
        for bad in ["", "d", "0d", "-1d", "1m", "abc", "1.5h"] {
            assert!(parse_window_duration(bad).is_err(), "{bad:?} should fail");
        }
    }

    #[test]
    fn fingerprint_is_sha256_hex() {
        let fp = content_fingerprint(b"abc");
        assert_eq!(
            fp,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn window_order_round_trips_through_strings() {
        assert_eq!(
            "newest-first".parse::<WindowOrder>().unwrap(),
            WindowOrder::NewestFirst
        );
        assert_eq!(WindowOrder::OldestFirst.to_string(), "oldest-first");
    }

    #[test]
    fn timestamp_values_have_dates() {
        let ts = DateTime::parse_from_rfc3339("2024-03-01T23:30:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            FieldValue::Timestamp(ts).as_date(),
            NaiveDate::from_ymd_opt(2024, 3, 1)
        );
        assert_eq!(FieldValue::Integer(3).as_date(), None);
        assert_eq!(FieldValue::Null.to_key_string(), "");
    }
}
