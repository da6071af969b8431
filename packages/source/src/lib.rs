#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Fetching raw payloads for dataset windows.
//!
//! A [`Fetcher`] turns one [`Window`] into one [`RawPayload`]. The
//! production implementation ([`http::HttpFetcher`]) issues a single logical
//! GET per window with retry, a per-attempt timeout and a rate limit shared
//! across every dataset on the same API. [`archive`] adds on-disk raw
//! payload storage and replay.

pub mod archive;
pub mod http;
pub mod progress;
pub mod rate_limit;
pub mod retry;

use async_trait::async_trait;
use grid_ingest_dataset_models::{DatasetSpec, RawPayload, Window};

use crate::retry::Retryable;

/// Errors that can occur while fetching a window.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// Timeout, connection failure, HTTP 429 or 5xx. Worth retrying.
    #[error("Transient fetch error: {message}")]
    Transient {
        /// Description of what went wrong.
        message: String,
    },

    /// Client error or unusable response. Retrying will not help.
    #[error("Permanent fetch error: {message}")]
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

    /// I/O error reading or writing the raw archive.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FetchError {
    /// Builds a [`FetchError::Transient`].
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    /// Builds a [`FetchError::Permanent`].
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }
}

impl Retryable for FetchError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Fetches the raw payload for one window.
///
/// Implementations own their retry behaviour: the error returned is final
/// from the caller's point of view.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetches `window` of `spec`.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError`] if no usable payload could be obtained.
    async fn fetch(&self, spec: &DatasetSpec, window: &Window) -> Result<RawPayload, FetchError>;
}
