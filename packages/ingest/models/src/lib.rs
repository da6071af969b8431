#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Window states, per-window outcomes, and run summaries.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use grid_ingest_dataset_models::{FailureRecord, FailureStage, Window};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Where a window is in its fetch → transform → load cycle.
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
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum WindowState {
    /// Produced by the planner, not yet claimed.
    Planned,
    /// Requesting the raw payload.
    Fetching,
    /// Parsing and validating the payload.
    Transforming,
    /// Appending rows to the warehouse.
    Loading,
    /// Loaded and recorded.
    Completed,
    /// Gave up on this window for the current run.
    Failed,
}

impl WindowState {
    /// Whether no further transitions happen in this run.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether `self → next` is a legal transition.
    ///
    /// `Planned → Completed` covers windows skipped because an earlier run
    /// completed them.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Planned, Self::Fetching | Self::Completed)
                | (Self::Fetching, Self::Transforming)
                | (Self::Transforming, Self::Loading)
                | (Self::Loading, Self::Completed)
                | (
                    Self::Fetching | Self::Transforming | Self::Loading,
                    Self::Failed
                )
        )
    }

    /// Failure stage attributed to a window that fails in this state.
    #[must_use]
    pub const fn failure_stage(self) -> Option<FailureStage> {
        match self {
            Self::Fetching => Some(FailureStage::Fetch),
            Self::Transforming => Some(FailureStage::Transform),
            Self::Loading => Some(FailureStage::Load),
            Self::Planned | Self::Completed | Self::Failed => None,
        }
    }
}

/// How one window ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WindowOutcome {
    /// Fetched, transformed, loaded and recorded.
    Completed {
        /// Rows appended to the warehouse.
        rows: u64,
        /// Records dropped by schema validation.
        dropped: u64,
        /// HTTP attempts behind the payload (zero when replayed).
        fetch_attempts: u32,
    },
    /// Already completed by an earlier run; not fetched.
    Skipped,
    /// Failed terminally and written to the failure log.
    Failed(FailureRecord),
}

impl WindowOutcome {
    /// Terminal state this outcome corresponds to.
    #[must_use]
    pub const fn state(&self) -> WindowState {
        match self {
            Self::Completed { .. } | Self::Skipped => WindowState::Completed,
            Self::Failed(_) => WindowState::Failed,
        }
    }
}

/// Outcome of one processed window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowReport {
    /// The window.
    pub window: Window,
    /// Whether a fetch was issued for it.
    pub fetched: bool,
    /// How it ended.
    pub outcome: WindowOutcome,
}

/// Per-dataset counters within a [`RunSummary`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetSummary {
    /// Windows completed in this run.
    pub completed: u64,
    /// Windows skipped as already complete.
    pub skipped: u64,
    /// Windows that failed.
    pub failed: u64,
    /// Rows appended to the warehouse.
    pub rows_loaded: u64,
}

/// What a run did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// Wall time the run took.
    pub duration: Duration,
    /// Windows planned across all datasets.
    pub planned: u64,
    /// Windows completed in this run.
    pub completed: u64,
    /// Windows skipped as already complete.
    pub skipped: u64,
    /// Windows that failed, in the order they finished.
    pub failures: Vec<FailureRecord>,
    /// Rows appended to the warehouse.
    pub rows_loaded: u64,
    /// Records dropped by schema validation across completed windows.
    pub rows_dropped: u64,
    /// Fetch calls issued (one per attempted window).
    pub fetches: u64,
    /// HTTP attempts behind completed windows.
    pub fetch_attempts: u64,
    /// Whether cancellation stopped the run before every window was claimed.
    pub cancelled: bool,
    /// Counters per dataset.
    pub datasets: BTreeMap<String, DatasetSummary>,
}

impl RunSummary {
    /// Creates an empty summary for a run of `planned` windows.
    #[must_use]
    pub const fn new(started_at: DateTime<Utc>, planned: u64) -> Self {
        Self {
            started_at,
            duration: Duration::ZERO,
            planned,
            completed: 0,
            skipped: 0,
            failures: Vec::new(),
            rows_loaded: 0,
            rows_dropped: 0,
            fetches: 0,
            fetch_attempts: 0,
            cancelled: false,
            datasets: BTreeMap::new(),
        }
    }

    /// Folds one window's report into the totals.
    pub fn record(&mut self, report: WindowReport) {
        let dataset = self
            .datasets
            .entry(report.window.dataset.clone())
            .or_default();
        if report.fetched {
            self.fetches += 1;
        }
        match report.outcome {
            WindowOutcome::Completed {
                rows,
                dropped,
                fetch_attempts,
            } => {
                self.completed += 1;
                self.rows_loaded += rows;
                self.rows_dropped += dropped;
                self.fetch_attempts += u64::from(fetch_attempts);
                dataset.completed += 1;
                dataset.rows_loaded += rows;
            }
            WindowOutcome::Skipped => {
                self.skipped += 1;
                dataset.skipped += 1;
            }
            WindowOutcome::Failed(record) => {
                dataset.failed += 1;
                self.failures.push(record);
            }
        }
    }

    /// Number of failed windows.
    #[must_use]
    pub fn failed(&self) -> u64 {
        self.failures.len() as u64
    }

    /// Windows that were never claimed (only non-zero after cancellation).
    #[must_use]
    pub fn not_started(&self) -> u64 {
        self.planned
            .saturating_sub(self.completed + self.skipped + self.failed())
    }

    /// Whether every planned window ended completed or skipped.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && !self.cancelled
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Windows: {} planned, {} completed, {} skipped, {} failed, {} not started",
            self.planned,
            self.completed,
            self.skipped,
            self.failed(),
            self.not_started()
        )?;
        writeln!(
            f,
            "Rows: {} loaded, {} dropped; {} fetches ({} HTTP attempts) in {:.1}s",
            self.rows_loaded,
            self.rows_dropped,
            self.fetches,
            self.fetch_attempts,
            self.duration.as_secs_f64()
        )?;
        for (name, counts) in &self.datasets {
            writeln!(
                f,
                "  {name:<12} {:>6} completed {:>6} skipped {:>4} failed {:>10} rows",
                counts.completed, counts.skipped, counts.failed, counts.rows_loaded
            )?;
        }
        if self.cancelled {
            writeln!(f, "Run was cancelled before all windows were claimed")?;
        }
        for failure in &self.failures {
            writeln!(
                f,
                "  FAILED {} [{}, {}) at {}: {}",
                failure.dataset,
                failure.window_start.to_rfc3339(),
                failure.window_end.to_rfc3339(),
                failure.stage,
                failure.reason
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;

    fn window(dataset: &str, day: u32) -> Window {
        let start = DateTime::parse_from_rfc3339(&format!("2024-01-{day:02}T00:00:00Z"))
            .unwrap()
            .with_timezone(&Utc);
        Window {
            dataset: dataset.to_string(),
            start,
            end: start + TimeDelta::days(1),
        }
    }

    #[test]
    fn active_states_can_fail_but_planned_cannot() {
        for state in [
            WindowState::Fetching,
            WindowState::Transforming,
            WindowState::Loading,
        ] {
            assert!(state.can_transition_to(WindowState::Failed));
            assert!(state.failure_stage().is_some());
        }
        assert!(!WindowState::Planned.can_transition_to(WindowState::Failed));
        assert!(!WindowState::Completed.can_transition_to(WindowState::Fetching));
        assert!(!WindowState::Failed.can_transition_to(WindowState::Completed));
        assert!(WindowState::Planned.can_transition_to(WindowState::Completed));
    }

    #[test]
    fn happy_path_is_a_chain_of_legal_transitions() {
        let path = [
            WindowState::Planned,
            WindowState::Fetching,
            WindowState::Transforming,
            WindowState::Loading,
            WindowState::Completed,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
        assert!(WindowState::Completed.is_terminal());
        assert_eq!(WindowState::Transforming.to_string(), "TRANSFORMING");
    }

    #[test]
    fn summary_counts_outcomes() {
        let started = Utc::now();
        let mut summary = RunSummary::new(started, 5);
        summary.record(WindowReport {
            window: window("BOD", 1),
            fetched: true,
            outcome: WindowOutcome::Completed {
                rows: 95,
                dropped: 5,
                fetch_attempts: 4,
            },
        });
        summary.record(WindowReport {
            window: window("BOD", 2),
            fetched: false,
            outcome: WindowOutcome::Skipped,
        });
        let failure = FailureRecord::new(&window("FREQ", 1), started, FailureStage::Fetch, "HTTP 400");
        summary.record(WindowReport {
            window: window("FREQ", 1),
            fetched: true,
            outcome: WindowOutcome::Failed(failure.clone()),
        });

        assert_eq!(summary.completed, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.failed(), 1);
        assert_eq!(summary.not_started(), 2);
        assert_eq!(summary.fetches, 2);
        assert_eq!(summary.fetch_attempts, 4);
        assert_eq!(summary.rows_loaded, 95);
        assert_eq!(summary.failures, vec![failure]);
        assert_eq!(summary.datasets["BOD"].completed, 1);
        assert_eq!(summary.datasets["FREQ"].failed, 1);
        assert!(!summary.is_success());
        assert!(summary.to_string().contains("FAILED FREQ"));
    }

    #[test]
    fn cancelled_run_is_not_a_success() {
        let mut summary = RunSummary::new(Utc::now(), 3);
        assert!(summary.is_success());
        summary.cancelled = true;
        assert!(!summary.is_success());
    }
}
