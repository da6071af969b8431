//! HTTP fetcher for windowed JSON APIs.
//!
//! Each window is one logical GET to `<base_url>/<endpoint>` with `from` and
//! `to` set to the window bounds. Transient failures (timeouts, connection
//! errors, HTTP 429 and 5xx) are retried per the [`RetryPolicy`]; other 4xx
//! responses and bodies that are not JSON fail immediately.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use grid_ingest_dataset::clock::Clock;
use grid_ingest_dataset_models::{DatasetSpec, RawPayload, Window, format_utc};

use crate::rate_limit::RateLimiter;
use crate::retry::{RetryPolicy, Sleeper, retry};
use crate::{FetchError, Fetcher};

/// Default per-attempt timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Maximum length of the response body preview included in errors.
const BODY_PREVIEW_LEN: usize = 200;

/// Status and body of one HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body.
    pub body: Vec<u8>,
}

/// Failure below the HTTP status level.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The request did not complete in time.
    #[error("request timed out: {0}")]
    Timeout(String),

    /// The connection failed or was reset.
    #[error("connection failed: {0}")]
    Connect(String),

    /// The request could not be built or sent for a reason retrying will
    /// not fix.
    #[error("request failed: {0}")]
    Request(String),
}

/// Issues GET requests. Abstracted so tests can script responses.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends `GET url?query` and returns the full response.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if no response was received.
    async fn get(
        &self,
        url: &str,
        query: &[(String, String)],
    ) -> Result<TransportResponse, TransportError>;
}

/// [`Transport`] backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Builds a client with the given per-request timeout.
    ///
    /// # Errors
    ///
    /// Returns [`reqwest::Error`] if the TLS backend fails to initialize.
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("grid_ingest/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(
        &self,
        url: &str,
        query: &[(String, String)],
    ) -> Result<TransportResponse, TransportError> {
        let response = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(classify_reqwest)?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(classify_reqwest)?;
        Ok(TransportResponse {
            status,
            body: body.to_vec(),
        })
    }
}

fn classify_reqwest(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout(e.to_string())
    } else if e.is_connect() || e.is_request() || e.is_body() || e.is_decode() {
        TransportError::Connect(e.to_string())
    } else {
        TransportError::Request(e.to_string())
    }
}

/// Connection settings for an [`HttpFetcher`].
#[derive(Debug, Clone)]
pub struct HttpFetcherConfig {
    /// API root, without a trailing slash.
    pub base_url: String,
    /// Keys rotated round-robin as the `apiKey` parameter. Empty sends none.
    pub api_keys: Vec<String>,
    /// Per-attempt timeout.
    pub request_timeout: Duration,
    /// Run-level query parameters sent with every request, in order. A key
    /// listed here replaces the dataset's own value for that key, and may
    /// repeat (e.g. one `bmUnit` per unit).
    pub extra_params: Vec<(String, String)>,
}

/// Fetches windows from a JSON API over HTTP.
pub struct HttpFetcher {
    config: HttpFetcherConfig,
    next_key: AtomicUsize,
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    limiter: Arc<RateLimiter>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for HttpFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpFetcher")
            .field("base_url", &self.config.base_url)
            .field("api_keys", &self.config.api_keys.len())
            .field("policy", &self.policy)
            .field("limiter", &self.limiter)
            .finish_non_exhaustive()
    }
}

impl HttpFetcher {
    /// Creates a fetcher.
    ///
    /// `limiter` should be shared by every fetcher using the same API.
    #[must_use]
    pub fn new(
        config: HttpFetcherConfig,
        transport: Arc<dyn Transport>,
        policy: RetryPolicy,
        sleeper: Arc<dyn Sleeper>,
        limiter: Arc<RateLimiter>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config: HttpFetcherConfig {
                base_url: config.base_url.trim_end_matches('/').to_string(),
                ..config
            },
            next_key: AtomicUsize::new(0),
            transport,
            policy,
            sleeper,
            limiter,
            clock,
        }
    }

    /// Full URL for `spec`.
    #[must_use]
    pub fn url(&self, spec: &DatasetSpec) -> String {
        format!(
            "{}/{}",
            self.config.base_url,
            spec.endpoint().trim_start_matches('/')
        )
    }

    /// Query parameters for one attempt at `window`.
    fn query(&self, spec: &DatasetSpec, window: &Window) -> Vec<(String, String)> {
        let mut query = vec![
            ("from".to_string(), format_utc(&window.start)),
            ("to".to_string(), format_utc(&window.end)),
            ("format".to_string(), "json".to_string()),
        ];
        query.extend(
            spec.params
                .iter()
                .filter(|(k, _)| !self.config.extra_params.iter().any(|(key, _)| key == *k))
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        query.extend(self.config.extra_params.iter().cloned());
        if !self.config.api_keys.is_empty() {
            let i = self.next_key.fetch_add(1, Ordering::Relaxed) % self.config.api_keys.len();
            query.push(("apiKey".to_string(), self.config.api_keys[i].clone()));
        }
        query
    }

    /// One rate-limited, time-bounded request.
    async fn attempt(&self, url: &str, spec: &DatasetSpec, window: &Window) -> Result<Vec<u8>, FetchError> {
        self.limiter.acquire().await;
        let query = self.query(spec, window);

        let response = tokio::time::timeout(self.config.request_timeout, self.transport.get(url, &query))
            .await
            .map_err(|_| {
                FetchError::transient(format!(
                    "no response within {:?}",
                    self.config.request_timeout
                ))
            })?
            .map_err(|e| match e {
                TransportError::Timeout(_) | TransportError::Connect(_) => {
                    FetchError::transient(e.to_string())
                }
                TransportError::Request(_) => FetchError::permanent(e.to_string()),
            })?;

        classify_response(response)
    }
}

/// Maps a response to its body or a classified error.
fn classify_response(response: TransportResponse) -> Result<Vec<u8>, FetchError> {
    let status = response.status;
    match status {
        200..=299 => {
            if let Err(e) = serde_json::from_slice::<serde::de::IgnoredAny>(&response.body) {
                return Err(FetchError::permanent(format!(
                    "HTTP {status} body is not JSON: {e} (received {} bytes: {})",
                    response.body.len(),
                    preview(&response.body)
                )));
            }
            Ok(response.body)
        }
        429 => Err(FetchError::transient("HTTP 429 (rate limited)")),
        500..=599 => Err(FetchError::transient(format!(
            "HTTP {status} (server error): {}",
            preview(&response.body)
        ))),
        _ => Err(FetchError::permanent(format!(
            "HTTP {status}: {}",
            preview(&response.body)
        ))),
    }
}

fn preview(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    if text.chars().count() > BODY_PREVIEW_LEN {
        format!("{}...", text.chars().take(BODY_PREVIEW_LEN).collect::<String>())
    } else {
        text.into_owned()
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, spec: &DatasetSpec, window: &Window) -> Result<RawPayload, FetchError> {
        let url = self.url(spec);
        let label = window.to_string();

        match retry(&self.policy, self.sleeper.as_ref(), &label, |_| {
            self.attempt(&url, spec, window)
        })
        .await
        {
            Ok(done) => Ok(RawPayload::new(done.value, self.clock.now(), done.attempts)),
            Err(failed) => match failed.value {
                FetchError::Transient { message } => Err(FetchError::RetriesExhausted {
                    attempts: failed.attempts,
                    last: message,
                }),
                other => Err(other),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use chrono::{DateTime, TimeDelta, Utc};
    use grid_ingest_dataset::clock::FixedClock;
    use grid_ingest_dataset::registry::Registry;

    use super::*;
    use crate::retry::RecordingSleeper;

    type Scripted = Result<TransportResponse, TransportError>;

    /// Replays scripted responses and records every request.
    #[derive(Default)]
    struct ScriptedTransport {
        script: Mutex<VecDeque<Scripted>>,
        requests: Mutex<Vec<(String, Vec<(String, String)>)>>,
    }

    impl ScriptedTransport {
        fn new(script: impl IntoIterator<Item = Scripted>) -> Self {
            Self {
                script: Mutex::new(script.into_iter().collect()),
                requests: Mutex::default(),
            }
        }

        fn requests(&self) -> Vec<(String, Vec<(String, String)>)> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn get(
            &self,
            url: &str,
            query: &[(String, String)],
        ) -> Result<TransportResponse, TransportError> {
            self.requests
                .lock()
                .unwrap()
                .push((url.to_string(), query.to_vec()));
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::Request("script exhausted".to_string())))
        }
    }

    fn ok(body: &str) -> Scripted {
        Ok(TransportResponse {
            status: 200,
            body: body.as_bytes().to_vec(),
        })
    }

    fn status(code: u16) -> Scripted {
        Ok(TransportResponse {
            status: code,
            body: Vec::new(),
        })
    }

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn fuelinst() -> DatasetSpec {
        Registry::builtin().unwrap().get("FUELINST").unwrap().clone()
    }

    fn window(dataset: &str) -> Window {
        Window {
            dataset: dataset.to_string(),
            start: ts("2024-01-01T00:00:00Z"),
            end: ts("2024-01-02T00:00:00Z"),
        }
    }

    fn fetcher(
        transport: Arc<ScriptedTransport>,
        sleeper: Arc<RecordingSleeper>,
        api_keys: Vec<String>,
    ) -> HttpFetcher {
        fetcher_with(transport, sleeper, api_keys, Vec::new())
    }

    fn fetcher_with(
        transport: Arc<dyn Transport>,
        sleeper: Arc<RecordingSleeper>,
        api_keys: Vec<String>,
        extra_params: Vec<(String, String)>,
    ) -> HttpFetcher {
        HttpFetcher::new(
            HttpFetcherConfig {
                base_url: "https://api.example.test/datasets/".to_string(),
                api_keys,
                request_timeout: Duration::from_secs(5),
                extra_params,
            },
            transport,
            RetryPolicy::new(5, Duration::from_secs(2), Duration::from_secs(60)).without_jitter(),
            sleeper,
            Arc::new(RateLimiter::unlimited()),
            Arc::new(FixedClock(ts("2024-06-01T00:00:00Z"))),
        )
    }

    #[tokio::test]
    async fn recovers_from_rate_limiting() {
        let transport = Arc::new(ScriptedTransport::new([
            status(429),
            status(429),
            status(429),
            ok(r#"{"data": []}"#),
        ]));
        let sleeper = Arc::new(RecordingSleeper::default());
        let fetcher = fetcher(Arc::clone(&transport), Arc::clone(&sleeper), vec![]);

        let payload = fetcher.fetch(&fuelinst(), &window("FUELINST")).await.unwrap();

        assert_eq!(payload.attempts, 4);
        assert_eq!(payload.bytes, br#"{"data": []}"#);
        assert_eq!(transport.requests().len(), 4);
        assert_eq!(
            sleeper.delays(),
            vec![
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8)
            ]
        );
    }

    #[tokio::test]
    async fn sends_window_bounds_and_params() {
        let transport = Arc::new(ScriptedTransport::new([ok("[]")]));
        let fetcher = fetcher(
            Arc::clone(&transport),
            Arc::new(RecordingSleeper::default()),
            vec![],
        );
        let registry = Registry::builtin().unwrap();
        let bod = registry.get("BOD").unwrap();
        let window = Window {
            dataset: "BOD".to_string(),
            start: ts("2024-01-01T00:00:00Z"),
            end: ts("2024-01-01T00:00:00Z") + TimeDelta::hours(1),
        };

        fetcher.fetch(bod, &window).await.unwrap();

        let (url, query) = transport.requests().remove(0);
        assert_eq!(url, "https://api.example.test/datasets/BOD/stream");
        assert!(query.contains(&("from".to_string(), "2024-01-01T00:00:00Z".to_string())));
        assert!(query.contains(&("to".to_string(), "2024-01-01T01:00:00Z".to_string())));
        assert!(query.contains(&("format".to_string(), "json".to_string())));
        assert!(query.contains(&("settlementPeriodFrom".to_string(), "1".to_string())));
        assert!(!query.iter().any(|(k, _)| k == "apiKey"));
    }

    #[tokio::test]
    async fn run_params_replace_and_extend_dataset_params() {
        let transport = Arc::new(ScriptedTransport::new([ok("[]")]));
        let fetcher = fetcher_with(
            Arc::clone(&transport) as Arc<dyn Transport>,
            Arc::new(RecordingSleeper::default()),
            vec![],
            vec![
                ("settlementPeriodFrom".to_string(), "10".to_string()),
                ("bmUnit".to_string(), "T_DRAXX-1".to_string()),
                ("bmUnit".to_string(), "T_DRAXX-2".to_string()),
            ],
        );
        let registry = Registry::builtin().unwrap();

        fetcher
            .fetch(registry.get("BOD").unwrap(), &window("BOD"))
            .await
            .unwrap();

        let (_, query) = transport.requests().remove(0);
        let values = |key: &str| -> Vec<String> {
            query
                .iter()
                .filter(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
                .collect()
        };
        assert_eq!(values("settlementPeriodFrom"), ["10"]);
        assert_eq!(values("bmUnit"), ["T_DRAXX-1", "T_DRAXX-2"]);
        assert_eq!(values("from"), ["2024-01-01T00:00:00Z"]);
    }

    /// Answers after `delay`, which is longer than the request timeout.
    struct HangingTransport {
        delay: Duration,
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl Transport for HangingTransport {
        async fn get(
            &self,
            _url: &str,
            _query: &[(String, String)],
        ) -> Result<TransportResponse, TransportError> {
            *self.calls.lock().unwrap() += 1;
            tokio::time::sleep(self.delay).await;
            Ok(TransportResponse {
                status: 200,
                body: b"[]".to_vec(),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_past_the_timeout_are_retried_as_transient() {
        let transport = Arc::new(HangingTransport {
            delay: Duration::from_secs(60),
            calls: Mutex::new(0),
        });
        let sleeper = Arc::new(RecordingSleeper::default());
        let fetcher = fetcher_with(
            Arc::clone(&transport) as Arc<dyn Transport>,
            Arc::clone(&sleeper),
            vec![],
            Vec::new(),
        );

        let started = tokio::time::Instant::now();
        let err = fetcher
            .fetch(&fuelinst(), &window("FUELINST"))
            .await
            .unwrap_err();

        match err {
            FetchError::RetriesExhausted { attempts, last } => {
                assert_eq!(attempts, 5);
                assert!(last.contains("no response within"), "{last}");
            }
            other => panic!("expected RetriesExhausted, got {other}"),
        }
        assert_eq!(*transport.calls.lock().unwrap(), 5);
        assert_eq!(sleeper.delays().len(), 4);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(5 * 5), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(60), "{elapsed:?}");
    }

    #[tokio::test]
    async fn rotates_api_keys() {
        let transport = Arc::new(ScriptedTransport::new([ok("[]"), ok("[]"), ok("[]")]));
        let fetcher = fetcher(
            Arc::clone(&transport),
            Arc::new(RecordingSleeper::default()),
            vec!["k1".to_string(), "k2".to_string()],
        );
        for _ in 0..3 {
            fetcher.fetch(&fuelinst(), &window("FUELINST")).await.unwrap();
        }
        let keys: Vec<String> = transport
            .requests()
            .into_iter()
            .filter_map(|(_, q)| q.into_iter().find(|(k, _)| k == "apiKey").map(|(_, v)| v))
            .collect();
        assert_eq!(keys, ["k1", "k2", "k1"]);
    }

    #[tokio::test]
    async fn client_errors_are_permanent() {
        let transport = Arc::new(ScriptedTransport::new([status(404)]));
        let sleeper = Arc::new(RecordingSleeper::default());
        let fetcher = fetcher(Arc::clone(&transport), Arc::clone(&sleeper), vec![]);

        let err = fetcher
            .fetch(&fuelinst(), &window("FUELINST"))
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::Permanent { .. }), "{err}");
        assert_eq!(transport.requests().len(), 1);
        assert!(sleeper.delays().is_empty());
    }

    #[tokio::test]
    async fn malformed_body_is_permanent() {
        let transport = Arc::new(ScriptedTransport::new([ok("{\"data\": [")]));
        let fetcher = fetcher(transport, Arc::new(RecordingSleeper::default()), vec![]);
        let err = fetcher
            .fetch(&fuelinst(), &window("FUELINST"))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Permanent { .. }), "{err}");
    }

    #[tokio::test]
    async fn server_errors_exhaust_retries() {
        let transport = Arc::new(ScriptedTransport::new([
            status(503),
            Err(TransportError::Connect("reset".to_string())),
            status(500),
            Err(TransportError::Timeout("slow".to_string())),
            status(502),
        ]));
        let fetcher = fetcher(
            Arc::clone(&transport),
            Arc::new(RecordingSleeper::default()),
            vec![],
        );

        let err = fetcher
            .fetch(&fuelinst(), &window("FUELINST"))
            .await
            .unwrap_err();

        assert!(
            matches!(err, FetchError::RetriesExhausted { attempts: 5, .. }),
            "{err}"
        );
        assert_eq!(transport.requests().len(), 5);
    }

    #[tokio::test]
    async fn stamps_fetch_time_and_fingerprint() {
        let transport = Arc::new(ScriptedTransport::new([ok("[1]")]));
        let fetcher = fetcher(transport, Arc::new(RecordingSleeper::default()), vec![]);
        let payload = fetcher.fetch(&fuelinst(), &window("FUELINST")).await.unwrap();
        assert_eq!(payload.fetched_at, ts("2024-06-01T00:00:00Z"));
        assert_eq!(
            payload.fingerprint,
            grid_ingest_dataset_models::content_fingerprint(b"[1]")
        );
        assert_eq!(payload.attempts, 1);
    }

    #[test]
    fn previews_long_bodies() {
        let body = "x".repeat(500);
        let p = preview(body.as_bytes());
        assert_eq!(p.len(), BODY_PREVIEW_LEN + 3);
        assert!(p.ends_with("..."));
    }
}
