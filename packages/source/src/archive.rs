//! On-disk archive of raw API payloads.
//!
//! Payloads are stored verbatim at
//! `<root>/<DATASET>/<START>__<END>.json` (both as `YYYY-MM-DD_HH-MM-SS`),
//! so a later run can re-transform them without hitting the API again. A
//! window clipped by an earlier range end has a different file from the full
//! window with the same start, and is never replayed in its place.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use grid_ingest_dataset::clock::Clock;
use grid_ingest_dataset_models::{DatasetSpec, RawPayload, Window};

use crate::{FetchError, Fetcher};

/// Directory of raw payloads.
#[derive(Debug, Clone)]
pub struct RawArchive {
    root: PathBuf,
}

impl RawArchive {
    /// Creates an archive rooted at `root`. Nothing is created until the
    /// first write.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// File holding the payload for `window`.
    #[must_use]
    pub fn path_for(&self, window: &Window) -> PathBuf {
        const STAMP: &str = "%Y-%m-%d_%H-%M-%S";
        self.root.join(&window.dataset).join(format!(
            "{}__{}.json",
            window.start.format(STAMP),
            window.end.format(STAMP)
        ))
    }

    /// Writes `bytes` for `window`, replacing any earlier copy.
    ///
    /// The file is written under a temporary name and renamed into place so
    /// readers never see a partial payload.
    ///
    /// # Errors
    ///
    /// Returns [`std::io::Error`] if the directory or file cannot be
    /// written.
    pub async fn store(&self, window: &Window, bytes: &[u8]) -> std::io::Result<PathBuf> {
        let path = self.path_for(window);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(path)
    }

    /// Reads the archived payload for `window`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`std::io::Error`] for failures other than the file being
    /// absent.
    pub async fn load(&self, window: &Window) -> std::io::Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.path_for(window)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// How an [`ArchiveFetcher`] uses its archive.
pub enum ArchiveMode {
    /// Fetch live and archive every payload before it is transformed.
    Record(Arc<dyn Fetcher>),
    /// Serve archived payloads. Windows missing from the archive go to the
    /// fallback (and are archived), or fail when there is none.
    Replay(Option<Arc<dyn Fetcher>>),
}

/// [`Fetcher`] that records to or replays from a [`RawArchive`].
pub struct ArchiveFetcher {
    archive: RawArchive,
    mode: ArchiveMode,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for ArchiveFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = match &self.mode {
            ArchiveMode::Record(_) => "record",
            ArchiveMode::Replay(Some(_)) => "replay-with-fallback",
            ArchiveMode::Replay(None) => "replay",
        };
        f.debug_struct("ArchiveFetcher")
            .field("archive", &self.archive)
            .field("mode", &mode)
            .finish_non_exhaustive()
    }
}

impl ArchiveFetcher {
    /// Creates an archive-backed fetcher.
    #[must_use]
    pub fn new(archive: RawArchive, mode: ArchiveMode, clock: Arc<dyn Clock>) -> Self {
        Self {
            archive,
            mode,
            clock,
        }
    }

    async fn fetch_and_store(
        &self,
        live: &dyn Fetcher,
        spec: &DatasetSpec,
        window: &Window,
    ) -> Result<RawPayload, FetchError> {
        let payload = live.fetch(spec, window).await?;
        match self.archive.store(window, &payload.bytes).await {
            Ok(path) => log::debug!("{window}: archived raw payload to {}", path.display()),
            Err(e) => log::warn!("{window}: failed to archive raw payload: {e}"),
        }
        Ok(payload)
    }
}

#[async_trait]
impl Fetcher for ArchiveFetcher {
    async fn fetch(&self, spec: &DatasetSpec, window: &Window) -> Result<RawPayload, FetchError> {
        match &self.mode {
            ArchiveMode::Record(live) => self.fetch_and_store(live.as_ref(), spec, window).await,
            ArchiveMode::Replay(fallback) => {
                if let Some(bytes) = self.archive.load(window).await? {
                    log::debug!("{window}: replaying archived payload");
                    return Ok(RawPayload::new(bytes, self.clock.now(), 0));
                }
                match fallback {
                    Some(live) => self.fetch_and_store(live.as_ref(), spec, window).await,
                    None => Err(FetchError::permanent(format!(
                        "no archived payload at {}",
                        self.archive.path_for(window).display()
                    ))),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use chrono::{DateTime, Utc};
    use grid_ingest_dataset::clock::FixedClock;
    use grid_ingest_dataset::registry::Registry;

    use super::*;

    struct CountingFetcher {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Fetcher for CountingFetcher {
        async fn fetch(&self, _spec: &DatasetSpec, _window: &Window) -> Result<RawPayload, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(RawPayload::new(
                br#"{"data": [{"frequency": 50.01}]}"#.to_vec(),
                ts("2024-06-01T00:00:00Z"),
                2,
            ))
        }
    }

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn window() -> Window {
        Window {
            dataset: "FREQ".to_string(),
            start: ts("2024-01-01T06:30:00Z"),
            end: ts("2024-01-02T06:30:00Z"),
        }
    }

    fn spec() -> DatasetSpec {
        Registry::builtin().unwrap().get("FREQ").unwrap().clone()
    }

    fn clock() -> Arc<dyn Clock> {
        Arc::new(FixedClock(ts("2024-07-01T00:00:00Z")))
    }

    #[test]
    fn names_files_by_window_bounds() {
        let archive = RawArchive::new("/data/raw");
        assert_eq!(
            archive.path_for(&window()),
            PathBuf::from("/data/raw/FREQ/2024-01-01_06-30-00__2024-01-02_06-30-00.json")
        );
    }

    #[tokio::test]
    async fn clipped_payload_is_not_replayed_for_the_full_window() {
        let dir = tempfile::tempdir().unwrap();
        let live = Arc::new(CountingFetcher {
            calls: AtomicU32::new(0),
        });
        let replayer = ArchiveFetcher::new(
            RawArchive::new(dir.path()),
            ArchiveMode::Replay(Some(Arc::clone(&live) as Arc<dyn Fetcher>)),
            clock(),
        );
        let clipped = Window {
            end: ts("2024-01-01T18:00:00Z"),
            ..window()
        };

        replayer.fetch(&spec(), &clipped).await.unwrap();
        let full = replayer.fetch(&spec(), &window()).await.unwrap();

        assert_eq!(live.calls.load(Ordering::SeqCst), 2);
        assert_eq!(full.attempts, 2);
    }

    #[tokio::test]
    async fn record_then_replay_without_fetching() {
        let dir = tempfile::tempdir().unwrap();
        let live = Arc::new(CountingFetcher {
            calls: AtomicU32::new(0),
        });

        let recorder = ArchiveFetcher::new(
            RawArchive::new(dir.path()),
            ArchiveMode::Record(Arc::clone(&live) as Arc<dyn Fetcher>),
            clock(),
        );
        let fetched = recorder.fetch(&spec(), &window()).await.unwrap();
        assert_eq!(fetched.attempts, 2);

        let replayer = ArchiveFetcher::new(RawArchive::new(dir.path()), ArchiveMode::Replay(None), clock());
        let replayed = replayer.fetch(&spec(), &window()).await.unwrap();

        assert_eq!(live.calls.load(Ordering::SeqCst), 1);
        assert_eq!(replayed.bytes, fetched.bytes);
        assert_eq!(replayed.fingerprint, fetched.fingerprint);
        assert_eq!(replayed.attempts, 0);
        assert_eq!(replayed.fetched_at, ts("2024-07-01T00:00:00Z"));
    }

    #[tokio::test]
    async fn replay_without_fallback_fails_permanently() {
        let dir = tempfile::tempdir().unwrap();
        let replayer = ArchiveFetcher::new(RawArchive::new(dir.path()), ArchiveMode::Replay(None), clock());
        let err = replayer.fetch(&spec(), &window()).await.unwrap_err();
        assert!(matches!(err, FetchError::Permanent { .. }));
    }

    #[tokio::test]
    async fn replay_falls_back_and_archives() {
        let dir = tempfile::tempdir().unwrap();
        let live = Arc::new(CountingFetcher {
            calls: AtomicU32::new(0),
        });
        let replayer = ArchiveFetcher::new(
            RawArchive::new(dir.path()),
            ArchiveMode::Replay(Some(Arc::clone(&live) as Arc<dyn Fetcher>)),
            clock(),
        );

        replayer.fetch(&spec(), &window()).await.unwrap();
        replayer.fetch(&spec(), &window()).await.unwrap();

        assert_eq!(live.calls.load(Ordering::SeqCst), 1);
        assert!(RawArchive::new(dir.path()).path_for(&window()).exists());
    }
}
