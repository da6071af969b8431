#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Dataset registry, window planning, and the schema-enforcing transform.
//!
//! Datasets are declared in TOML (see `datasets/`) and loaded into a
//! [`registry::Registry`]. The [`planner`] cuts a date range into windows
//! no longer than the dataset's maximum window, and the [`transform`]
//! module turns a raw API payload into schema-typed rows.

pub mod clock;
pub mod parsing;
pub mod planner;
pub mod registry;
pub mod transform;

use chrono::{DateTime, Utc};

/// Errors produced while planning windows.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    /// The range start is after the range end.
    #[error("Invalid range for {dataset}: start {start} is after end {end}")]
    InvalidRange {
        /// Dataset being planned.
        dataset: String,
        /// Requested start.
        start: DateTime<Utc>,
        /// Requested end.
        end: DateTime<Utc>,
    },

    /// The dataset's maximum window is not positive.
    #[error("Invalid maximum window for {dataset}: must be positive")]
    InvalidWindow {
        /// Dataset being planned.
        dataset: String,
    },

    /// The range cannot be represented with nanosecond arithmetic.
    #[error("Range for {dataset} is too large to plan")]
    RangeTooLarge {
        /// Dataset being planned.
        dataset: String,
    },
}

/// Errors produced while loading or validating dataset definitions.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// A TOML definition could not be parsed.
    #[error("Failed to parse dataset definition {name}: {message}")]
    Parse {
        /// File or embedded definition name.
        name: String,
        /// Parser message.
        message: String,
    },

    /// I/O error while reading definition files.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A definition parsed but is inconsistent.
    #[error("Invalid dataset {dataset}: {message}")]
    Invalid {
        /// Dataset name.
        dataset: String,
        /// What is wrong with it.
        message: String,
    },

    /// Two definitions share a name within the same source.
    #[error("Duplicate dataset definition: {dataset}")]
    Duplicate {
        /// Dataset name.
        dataset: String,
    },

    /// A requested dataset is not registered.
    #[error("Unknown dataset {dataset}. Available: {available}")]
    Unknown {
        /// Requested name.
        dataset: String,
        /// Comma-separated registered names.
        available: String,
    },
}

/// A payload that does not satisfy its dataset schema.
///
/// Always permanent: the same payload will fail the same way again.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchemaValidationError {
    /// The payload is not valid JSON.
    #[error("Malformed payload for {dataset}: {message}")]
    MalformedPayload {
        /// Dataset name.
        dataset: String,
        /// Parser message.
        message: String,
    },

    /// The payload has no record list where one is expected.
    #[error("Payload for {dataset} has no record list at {path:?}")]
    MissingRecords {
        /// Dataset name.
        dataset: String,
        /// Expected envelope key.
        path: String,
    },

    /// Too many rows failed non-nullable casts.
    #[error(
        "Payload for {dataset} dropped {dropped} of {total} records, above the allowed fraction {max_fraction}"
    )]
    TooManyDropped {
        /// Dataset name.
        dataset: String,
        /// Rows dropped.
        dropped: usize,
        /// Records in the payload.
        total: usize,
        /// Configured limit.
        max_fraction: f64,
    },
}
