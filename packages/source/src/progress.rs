//! Progress reporting for ingestion runs.
//!
//! The orchestrator reports window-level progress through
//! [`ProgressCallback`] without knowing how it is rendered. The binary
//! plugs in `indicatif` bars; tests and library callers use
//! [`NullProgress`].

use std::sync::Arc;

/// Receives progress updates for a run.
///
/// Shared across worker tasks, so implementations must be `Send + Sync`.
pub trait ProgressCallback: Send + Sync {
    /// Sets the total number of windows in the run.
    fn set_total(&self, total: u64);

    /// Advances by `delta` finished windows (completed, skipped or failed).
    fn inc(&self, delta: u64);

    /// Shows what is currently happening (e.g., the window being loaded).
    fn set_message(&self, msg: String);

    /// Marks the run as finished with a closing message.
    fn finish(&self, msg: String);
}

/// Ignores every update.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgress;

impl ProgressCallback for NullProgress {
    fn set_total(&self, _total: u64) {}
    fn inc(&self, _delta: u64) {}
    fn set_message(&self, _msg: String) {}
    fn finish(&self, _msg: String) {}
}

/// Returns a shared [`NullProgress`].
#[must_use]
pub fn null_progress() -> Arc<dyn ProgressCallback> {
    Arc::new(NullProgress)
}
