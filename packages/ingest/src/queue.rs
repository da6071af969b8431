//! Shared work queue handing planned windows to workers.
//!
//! Each dataset gets a lane holding its lazily planned windows. Lanes are
//! served round-robin and a lane with a window in flight is skipped until
//! that window is released, so windows of one dataset are processed one at
//! a time and in planner order while different datasets run concurrently.
//! The queue is the only place windows are handed out, so no window is ever
//! owned by two workers.

use std::sync::{Arc, Mutex, PoisonError};

use grid_ingest_dataset::planner::Windows;
use grid_ingest_dataset_models::{DatasetSpec, Window};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// A window handed to a worker. Return it with [`WorkQueue::release`].
#[derive(Debug)]
pub struct Claim {
    lane: usize,
    /// Dataset the window belongs to.
    pub spec: Arc<DatasetSpec>,
    /// The window.
    pub window: Window,
}

struct Lane {
    spec: Arc<DatasetSpec>,
    windows: Windows,
    in_flight: bool,
}

struct State {
    lanes: Vec<Lane>,
    cursor: usize,
}

enum Poll {
    Claimed(Claim),
    Busy,
    Drained,
}

/// Round-robin queue over per-dataset window lanes.
pub struct WorkQueue {
    state: Mutex<State>,
    released: Notify,
    cancel: CancellationToken,
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("remaining", &self.remaining())
            .finish_non_exhaustive()
    }
}

impl WorkQueue {
    /// Creates a queue. Claims stop once `cancel` fires.
    #[must_use]
    pub fn new(lanes: impl IntoIterator<Item = (Arc<DatasetSpec>, Windows)>, cancel: CancellationToken) -> Self {
        let lanes = lanes
            .into_iter()
            .map(|(spec, windows)| Lane {
                spec,
                windows,
                in_flight: false,
            })
            .collect();
        Self {
            state: Mutex::new(State { lanes, cursor: 0 }),
            released: Notify::new(),
            cancel,
        }
    }

    /// Windows not yet handed out.
    #[must_use]
    pub fn remaining(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.lanes.iter().map(|lane| lane.windows.len()).sum()
    }

    fn poll(&self) -> Poll {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let count = state.lanes.len();
        let mut busy = false;

        for offset in 0..count {
            let idx = (state.cursor + offset) % count;
            let lane = &mut state.lanes[idx];
            if lane.windows.len() == 0 {
                continue;
            }
            if lane.in_flight {
                busy = true;
                continue;
            }
            if let Some(window) = lane.windows.next() {
                lane.in_flight = true;
                let spec = Arc::clone(&lane.spec);
                state.cursor = (idx + 1) % count;
                return Poll::Claimed(Claim {
                    lane: idx,
                    spec,
                    window,
                });
            }
        }

        if busy { Poll::Busy } else { Poll::Drained }
    }

    /// Waits for the next claimable window.
    ///
    /// Returns `None` once every lane is drained or cancellation has been
    /// requested.
    pub async fn next(&self) -> Option<Claim> {
        loop {
            if self.cancel.is_cancelled() {
                return None;
            }
            let released = self.released.notified();
            match self.poll() {
                Poll::Claimed(claim) => return Some(claim),
                Poll::Drained => return None,
                Poll::Busy => {}
            }
            tokio::select! {
                () = released => {}
                () = self.cancel.cancelled() => return None,
            }
        }
    }

    /// Marks `claim`'s window finished so its dataset's next window can be
    /// claimed.
    pub fn release(&self, claim: &Claim) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(lane) = state.lanes.get_mut(claim.lane) {
                lane.in_flight = false;
            }
        }
        self.released.notify_waiters();
    }
}
