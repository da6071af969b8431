#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Resumable, windowed ingestion of time-partitioned API datasets.
//!
//! A run plans every selected dataset's range into windows, skips windows
//! the progress store already holds as completed, and drives each remaining
//! window through fetch → transform → load. A window that fails is recorded
//! in the progress store and the failure log and never stops the run.
//! Because the progress store is the only checkpoint, re-running the same
//! command after a crash or a partial failure resumes exactly where the
//! previous run stopped.

pub mod config;
pub mod queue;

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use chrono::{DateTime, NaiveDate, NaiveTime, TimeDelta, Utc};
use grid_ingest_database::failure_log::{DuckDbFailureLog, FailureLog};
use grid_ingest_database::progress_store::{DuckDbProgressStore, ProgressStore};
use grid_ingest_database::warehouse::{DuckDbWarehouse, Loader, Warehouse};
use grid_ingest_database::{DbError, LoadError};
use grid_ingest_dataset::clock::{Clock, SystemClock};
use grid_ingest_dataset::planner::plan;
use grid_ingest_dataset::registry::Registry;
use grid_ingest_dataset::transform::Transformer;
use grid_ingest_dataset::{PlanError, RegistryError};
use grid_ingest_dataset_models::{DatasetSpec, FailureRecord, FailureStage, Window, WindowOrder};
use grid_ingest_ingest_models::{RunSummary, WindowOutcome, WindowReport, WindowState};
use grid_ingest_source::Fetcher;
use grid_ingest_source::archive::{ArchiveFetcher, ArchiveMode, RawArchive};
use grid_ingest_source::http::{HttpFetcher, HttpFetcherConfig, ReqwestTransport};
use grid_ingest_source::progress::ProgressCallback;
use grid_ingest_source::rate_limit::RateLimiter;
use grid_ingest_source::retry::{Sleeper, TokioSleeper};
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigError, IngestConfig};
use crate::queue::{Claim, WorkQueue};

/// Errors that stop a run before any window is processed.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Dataset definitions could not be loaded or a name is unknown.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The requested range cannot be planned for a dataset.
    #[error(transparent)]
    Plan(#[from] PlanError),

    /// The progress store or failure log could not be opened.
    #[error("State store error: {0}")]
    Db(#[from] DbError),

    /// The HTTP client could not be built.
    #[error("Failed to build HTTP client: {0}")]
    Http(#[from] reqwest::Error),

    /// Warehouse rows could not be removed.
    #[error("Warehouse error: {0}")]
    Load(#[from] LoadError),
}

/// What to ingest.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Datasets to process.
    pub datasets: Vec<DatasetSpec>,
    /// Inclusive range start.
    pub start: DateTime<Utc>,
    /// Exclusive range end.
    pub end: DateTime<Utc>,
    /// Window order within each dataset.
    pub order: WindowOrder,
}

/// Logs and checks a window's state transitions.
struct StateTracker<'a> {
    window: &'a Window,
    state: WindowState,
    progress: &'a dyn ProgressCallback,
}

impl<'a> StateTracker<'a> {
    const fn new(window: &'a Window, progress: &'a dyn ProgressCallback) -> Self {
        Self {
            window,
            state: WindowState::Planned,
            progress,
        }
    }

    fn advance(&mut self, next: WindowState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {} -> {next}",
            self.state
        );
        log::debug!("{}: {} -> {next}", self.window, self.state);
        self.state = next;
        if !next.is_terminal() {
            self.progress.set_message(format!("{} {next}", self.window));
        }
    }

    /// Moves an active window to `Failed` and returns the stage it failed
    /// in. Failures before fetching belong to progress bookkeeping.
    fn fail(&mut self) -> FailureStage {
        let stage = self.state.failure_stage().unwrap_or(FailureStage::Progress);
        if self.state.can_transition_to(WindowState::Failed) {
            self.advance(WindowState::Failed);
        }
        stage
    }
}

/// Drives windows through fetch, transform and load.
pub struct Pipeline {
    fetcher: Arc<dyn Fetcher>,
    transformer: Transformer,
    loader: Loader,
    progress_store: Arc<dyn ProgressStore>,
    failure_log: Arc<dyn FailureLog>,
    clock: Arc<dyn Clock>,
    workers: usize,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("transformer", &self.transformer)
            .field("loader", &self.loader)
            .field("workers", &self.workers)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Creates a pipeline with a single worker.
    #[must_use]
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        transformer: Transformer,
        loader: Loader,
        progress_store: Arc<dyn ProgressStore>,
        failure_log: Arc<dyn FailureLog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            fetcher,
            transformer,
            loader,
            progress_store,
            failure_log,
            clock,
            workers: 1,
        }
    }

    /// Sets the number of concurrent workers (at least one).
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Runs `request` until every window is processed or `cancel` fires.
    ///
    /// Every dataset's range is planned before any window starts. After
    /// cancellation no new windows are claimed, but claimed windows run to
    /// completion or failure and are recorded.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::Plan`] if the range is invalid for any
    /// dataset. Per-window failures are reported in the summary instead.
    pub async fn run(
        &self,
        request: &RunRequest,
        cancel: CancellationToken,
        progress: Arc<dyn ProgressCallback>,
    ) -> Result<RunSummary, IngestError> {
        let started = Instant::now();

        let lanes = request
            .datasets
            .iter()
            .map(|spec| {
                let windows = plan(spec, request.start, request.end, request.order)?;
                Ok((Arc::new(spec.clone()), windows))
            })
            .collect::<Result<Vec<_>, PlanError>>()?;

        let planned: usize = lanes.iter().map(|(_, windows)| windows.len()).sum();
        log::info!(
            "Planned {planned} window(s) across {} dataset(s) for [{}, {}) ({}, {} worker(s))",
            lanes.len(),
            request.start.to_rfc3339(),
            request.end.to_rfc3339(),
            request.order,
            self.workers
        );
        progress.set_total(planned as u64);

        let queue = WorkQueue::new(lanes, cancel.clone());
        let summary = Mutex::new(RunSummary::new(self.clock.now(), planned as u64));

        futures::future::join_all(
            (0..self.workers).map(|id| self.worker(id, &queue, &summary, progress.as_ref())),
        )
        .await;

        let mut summary = summary.into_inner().unwrap_or_else(PoisonError::into_inner);
        summary.cancelled = cancel.is_cancelled() && summary.not_started() > 0;
        summary.duration = started.elapsed();

        if summary.cancelled {
            log::warn!(
                "Run cancelled: {} window(s) not started; re-run to resume",
                summary.not_started()
            );
        }
        progress.finish(format!(
            "{} completed, {} skipped, {} failed",
            summary.completed,
            summary.skipped,
            summary.failed()
        ));

        Ok(summary)
    }

    async fn worker(
        &self,
        id: usize,
        queue: &WorkQueue,
        summary: &Mutex<RunSummary>,
        progress: &dyn ProgressCallback,
    ) {
        while let Some(claim) = queue.next().await {
            let report = self.process(&claim, progress).await;
            queue.release(&claim);
            progress.inc(1);
            summary
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .record(report);
        }
        log::trace!("Worker {id} finished");
    }

    async fn process(&self, claim: &Claim, progress: &dyn ProgressCallback) -> WindowReport {
        let window = &claim.window;
        let spec = &claim.spec;
        let mut state = StateTracker::new(window, progress);

        match self.progress_store.is_complete(window) {
            Ok(true) => {
                log::debug!("{window}: already completed, skipping");
                state.advance(WindowState::Completed);
                return WindowReport {
                    window: window.clone(),
                    fetched: false,
                    outcome: WindowOutcome::Skipped,
                };
            }
            Ok(false) => {}
            Err(e) => {
                let stage = state.fail();
                return self.fail(window, stage, false, format!("progress lookup failed: {e}"));
            }
        }
        if let Err(e) = self.progress_store.mark_attempt(window, self.clock.now()) {
            let stage = state.fail();
            return self.fail(window, stage, false, format!("failed to record attempt: {e}"));
        }

        state.advance(WindowState::Fetching);
        let raw = match self.fetcher.fetch(spec, window).await {
            Ok(raw) => raw,
            Err(e) => {
                let stage = state.fail();
                return self.fail(window, stage, true, e.to_string());
            }
        };
        let fingerprint = raw.fingerprint.clone();
        let fetch_attempts = raw.attempts;

        state.advance(WindowState::Transforming);
        let transformed = {
            let transformer = self.transformer.clone();
            let spec = Arc::clone(spec);
            let window = window.clone();
            tokio::task::spawn_blocking(move || transformer.transform(&spec, &window, &raw)).await
        };
        let output = match transformed {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                let stage = state.fail();
                return self.fail(window, stage, true, e.to_string());
            }
            Err(e) => {
                let stage = state.fail();
                return self.fail(window, stage, true, format!("transform task failed: {e}"));
            }
        };
        state.advance(WindowState::Loading);
        let rows = Arc::new(output.rows);
        let loaded = match self.loader.load(spec, &rows, &window.to_string()).await {
            Ok(loaded) => loaded,
            Err(e) => {
                let stage = state.fail();
                return self.fail(window, stage, true, e.to_string());
            }
        };

        if let Err(e) = self
            .progress_store
            .mark_complete(window, &fingerprint, self.clock.now())
        {
            state.fail();
            return self.fail(window, FailureStage::Progress, true, format!("failed to record completion: {e}"));
        }
        state.advance(WindowState::Completed);

        log::info!(
            "{window}: loaded {} row(s) into {} across {} partition(s) ({fetch_attempts} fetch attempt(s))",
            loaded.rows_written,
            spec.table,
            loaded.partitions.len()
        );

        WindowReport {
            window: window.clone(),
            fetched: true,
            outcome: WindowOutcome::Completed {
                rows: loaded.rows_written,
                dropped: output.dropped as u64,
                fetch_attempts,
            },
        }
    }

    /// Records a terminal failure. Bookkeeping errors are logged; they never
    /// mask the original failure.
    fn fail(&self, window: &Window, stage: FailureStage, fetched: bool, reason: String) -> WindowReport {
        let now = self.clock.now();
        log::error!("{window}: {stage} failed: {reason}");

        if let Err(e) = self.progress_store.mark_failed(window, &reason, now) {
            log::error!("{window}: could not mark failed in progress store: {e}");
        }
        let record = FailureRecord::new(window, now, stage, reason);
        if let Err(e) = self.failure_log.append(&record) {
            log::error!("{window}: could not append to failure log: {e}");
        }

        WindowReport {
            window: window.clone(),
            fetched,
            outcome: WindowOutcome::Failed(record),
        }
    }
}

/// How the raw payload archive is used by a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ArchiveUse {
    /// Fetch live, keep nothing.
    #[default]
    Off,
    /// Fetch live and archive every payload.
    Record,
    /// Serve archived payloads, fetching (and archiving) missing ones.
    Replay,
    /// Serve archived payloads only; missing ones fail.
    ReplayOnly,
}

/// Per-run choices that shape the production pipeline.
#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    /// How raw payloads are archived or replayed.
    pub archive: ArchiveUse,
    /// Query parameters added to every request. A key given here replaces
    /// the dataset's own value for that key.
    pub params: Vec<(String, String)>,
}

/// What [`purge_range`] removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PurgeSummary {
    /// First purged partition date.
    pub from: NaiveDate,
    /// Partition date the purge stops before.
    pub to: NaiveDate,
    /// Warehouse rows deleted.
    pub rows: u64,
    /// Progress records cleared.
    pub windows: u64,
}

/// Deletes a dataset's warehouse rows for every partition date the range
/// `[start, end)` touches, then forgets progress for windows starting in
/// those days so the next run re-ingests them.
///
/// Partitions are whole days, so a range that starts or ends mid-day is
/// widened to midnight on both sides. A window that began before the
/// first purged day keeps its progress record.
///
/// # Errors
///
/// Returns [`IngestError::Plan`] if `start` is not before `end`,
/// [`IngestError::Load`] if the rows cannot be deleted and
/// [`IngestError::Db`] if progress cannot be cleared. Rows already deleted
/// stay deleted when clearing progress fails; re-running the purge is safe.
pub fn purge_range(
    warehouse: &dyn Warehouse,
    progress: &dyn ProgressStore,
    spec: &DatasetSpec,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<PurgeSummary, IngestError> {
    if start >= end {
        return Err(PlanError::InvalidRange {
            dataset: spec.name.clone(),
            start,
            end,
        }
        .into());
    }

    let from = start.date_naive();
    let mut to = end.date_naive();
    if end.time() != NaiveTime::MIN {
        to += TimeDelta::days(1);
    }

    let rows = warehouse.delete_partitions(spec, from, to)?;
    let windows = progress.clear(
        &spec.name,
        from.and_time(NaiveTime::MIN).and_utc(),
        to.and_time(NaiveTime::MIN).and_utc(),
    )?;
    log::info!(
        "Purged {}: {rows} row(s) in partitions [{from}, {to}), {windows} progress record(s)",
        spec.name
    );

    Ok(PurgeSummary {
        from,
        to,
        rows,
        windows,
    })
}

/// Loads the built-in dataset definitions plus any configured overrides.
///
/// # Errors
///
/// Returns [`IngestError::Registry`] if a definition is malformed.
pub fn load_registry(config: &IngestConfig) -> Result<Registry, IngestError> {
    let mut registry = Registry::builtin()?;
    if let Some(dir) = &config.pipeline.dataset_dir {
        registry.load_dir(dir)?;
    }
    Ok(registry)
}

/// Opens the `DuckDB` progress store and failure log under the data
/// directory.
///
/// # Errors
///
/// Returns [`IngestError::Db`] if either file cannot be opened.
pub fn open_state(
    config: &IngestConfig,
) -> Result<(Arc<DuckDbProgressStore>, Arc<DuckDbFailureLog>), IngestError> {
    let paths = config.data_paths();
    let progress = DuckDbProgressStore::open(&paths.progress_db_path())?;
    let failures = DuckDbFailureLog::open(&paths.failure_db_path())?;
    Ok((Arc::new(progress), Arc::new(failures)))
}

/// Builds the production pipeline: HTTP fetcher behind the shared rate
/// limiter, `DuckDB` state and warehouse under the data directory.
///
/// # Errors
///
/// Returns [`IngestError`] if the HTTP client or the state files cannot be
/// set up.
pub fn build_pipeline(config: &IngestConfig, options: PipelineOptions) -> Result<Pipeline, IngestError> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let sleeper: Arc<dyn Sleeper> = Arc::new(TokioSleeper);
    let paths = config.data_paths();

    let transport = Arc::new(ReqwestTransport::new(config.api.request_timeout())?);
    let limiter = Arc::new(RateLimiter::per_second(config.api.requests_per_second));
    let http: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new(
        HttpFetcherConfig {
            base_url: config.api.base_url.clone(),
            api_keys: config.api.api_keys.clone(),
            request_timeout: config.api.request_timeout(),
            extra_params: options.params,
        },
        transport,
        config.fetch_retry.policy(),
        Arc::clone(&sleeper),
        limiter,
        Arc::clone(&clock),
    ));

    let archive = match options.archive {
        ArchiveUse::Off if config.pipeline.archive_raw => ArchiveUse::Record,
        other => other,
    };
    let raw = RawArchive::new(paths.raw_dir());
    let fetcher: Arc<dyn Fetcher> = match archive {
        ArchiveUse::Off => http,
        ArchiveUse::Record => Arc::new(ArchiveFetcher::new(raw, ArchiveMode::Record(http), Arc::clone(&clock))),
        ArchiveUse::Replay => Arc::new(ArchiveFetcher::new(raw, ArchiveMode::Replay(Some(http)), Arc::clone(&clock))),
        ArchiveUse::ReplayOnly => Arc::new(ArchiveFetcher::new(raw, ArchiveMode::Replay(None), Arc::clone(&clock))),
    };

    let (progress_store, failure_log) = open_state(config)?;
    let loader = Loader::new(
        Arc::new(DuckDbWarehouse::new(paths)),
        config.load_retry.policy(),
        sleeper,
    );

    Ok(Pipeline::new(
        fetcher,
        Transformer::new(Arc::clone(&clock), config.pipeline.max_drop_fraction),
        loader,
        progress_store,
        failure_log,
        clock,
    )
    .with_workers(config.pipeline.workers))
}
