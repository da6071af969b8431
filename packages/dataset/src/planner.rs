//! Window planning.
//!
//! A date range is cut into contiguous, non-overlapping windows aligned
//! from the range start, each no longer than the dataset's `max_window`.
//! The final window is clipped to the range end. Windows are computed
//! from their index on demand, so a multi-year range of hourly windows
//! costs nothing until it is iterated.
//!
//! Both orderings yield the same set of windows; only the order in which
//! they are handed out changes. That keeps window identities stable across
//! runs that switch between oldest-first and newest-first.

use chrono::{DateTime, TimeDelta, Utc};
use grid_ingest_dataset_models::{DatasetSpec, Window, WindowOrder};

use crate::PlanError;

/// Plans the windows covering `[range_start, range_end)` for `spec`.
///
/// An empty range (`range_start == range_end`) yields no windows.
///
/// # Errors
///
/// Returns [`PlanError::InvalidRange`] if `range_start > range_end`,
/// [`PlanError::InvalidWindow`] if the dataset's window is not positive,
/// and [`PlanError::RangeTooLarge`] if the range overflows nanosecond
/// arithmetic.
pub fn plan(
    spec: &DatasetSpec,
    range_start: DateTime<Utc>,
    range_end: DateTime<Utc>,
    order: WindowOrder,
) -> Result<Windows, PlanError> {
    if range_start > range_end {
        return Err(PlanError::InvalidRange {
            dataset: spec.name.clone(),
            start: range_start,
            end: range_end,
        });
    }

    let step_ns = spec
        .max_window
        .num_nanoseconds()
        .filter(|ns| *ns > 0)
        .ok_or_else(|| PlanError::InvalidWindow {
            dataset: spec.name.clone(),
        })?;

    let total_ns = (range_end - range_start)
        .num_nanoseconds()
        .ok_or_else(|| PlanError::RangeTooLarge {
            dataset: spec.name.clone(),
        })?;

    #[allow(clippy::cast_sign_loss)]
    let count = (total_ns / step_ns + i64::from(total_ns % step_ns != 0)) as u64;

    Ok(Windows {
        dataset: spec.name.clone(),
        range_start,
        range_end,
        step_ns,
        front: 0,
        back: count,
        order,
    })
}

/// Lazy sequence of planned windows.
#[derive(Debug, Clone)]
pub struct Windows {
    dataset: String,
    range_start: DateTime<Utc>,
    range_end: DateTime<Utc>,
    step_ns: i64,
    /// Index of the oldest window not yet yielded.
    front: u64,
    /// One past the index of the newest window not yet yielded.
    back: u64,
    order: WindowOrder,
}

impl Windows {
    /// Returns the window at `index` (0 = oldest).
    #[allow(clippy::cast_possible_wrap)]
    fn window_at(&self, index: u64) -> Window {
        // Cannot overflow: index * step_ns < total_ns + step_ns.
        let offset = TimeDelta::nanoseconds(self.step_ns * index as i64);
        let start = self.range_start + offset;
        let end = (start + TimeDelta::nanoseconds(self.step_ns)).min(self.range_end);
        Window {
            dataset: self.dataset.clone(),
            start,
            end,
        }
    }

    fn pop_oldest(&mut self) -> Option<Window> {
        if self.front >= self.back {
            return None;
        }
        let window = self.window_at(self.front);
        self.front += 1;
        Some(window)
    }

    fn pop_newest(&mut self) -> Option<Window> {
        if self.front >= self.back {
            return None;
        }
        self.back -= 1;
        Some(self.window_at(self.back))
    }
}

impl Iterator for Windows {
    type Item = Window;

    fn next(&mut self) -> Option<Window> {
        match self.order {
            WindowOrder::OldestFirst => self.pop_oldest(),
            WindowOrder::NewestFirst => self.pop_newest(),
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = usize::try_from(self.back - self.front).unwrap_or(usize::MAX);
        (remaining, Some(remaining))
    }
}

impl DoubleEndedIterator for Windows {
    fn next_back(&mut self) -> Option<Window> {
        match self.order {
            WindowOrder::OldestFirst => self.pop_newest(),
            WindowOrder::NewestFirst => self.pop_oldest(),
        }
    }
}

impl ExactSizeIterator for Windows {}
