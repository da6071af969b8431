//! Retry with exponential backoff for transient errors.
//!
//! Both the fetcher and the warehouse loader retry through [`retry`], driven
//! by an explicit [`RetryPolicy`]. The delay before retry *n* is
//! `min(base_delay * 2^(n-1), max_delay)` passed through the policy's jitter
//! function. Waiting goes through a [`Sleeper`] so tests can record delays
//! instead of sleeping.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

/// Classifies errors for [`retry`].
pub trait Retryable {
    /// Returns `true` if the operation may succeed when attempted again.
    fn is_transient(&self) -> bool;
}

/// Maps a computed backoff delay to the delay actually waited.
pub type JitterFn = Arc<dyn Fn(Duration) -> Duration + Send + Sync>;

/// Default number of attempts (first try plus retries).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 6;

/// Default delay before the first retry.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(2);

/// Default cap on a single backoff delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

/// How many times to try and how long to wait between tries.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first. Zero is treated as one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on any single delay, before jitter.
    pub max_delay: Duration,
    jitter: JitterFn,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .finish_non_exhaustive()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

impl RetryPolicy {
    /// Creates a policy using [`equal_jitter`].
    #[must_use]
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            jitter: Arc::new(equal_jitter),
        }
    }

    /// Replaces the jitter function.
    #[must_use]
    pub fn with_jitter(mut self, jitter: impl Fn(Duration) -> Duration + Send + Sync + 'static) -> Self {
        self.jitter = Arc::new(jitter);
        self
    }

    /// Disables jitter so delays are exactly the exponential schedule.
    #[must_use]
    pub fn without_jitter(self) -> Self {
        self.with_jitter(|delay| delay)
    }

    /// Effective number of attempts.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Backoff before retry number `retry` (1 = first retry), before jitter.
    #[must_use]
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1_u32
            .checked_shl(retry.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Delay actually waited before retry number `retry`.
    #[must_use]
    pub fn delay(&self, retry: u32) -> Duration {
        (self.jitter)(self.backoff(retry))
    }
}

/// Waits somewhere between half and all of `delay`.
///
/// Spreads out clients that were throttled at the same moment without ever
/// retrying sooner than half the backoff.
#[must_use]
pub fn equal_jitter(delay: Duration) -> Duration {
    let half = delay / 2;
    half + half.mul_f64(rand::random::<f64>())
}

/// Something that can wait.
#[async_trait]
pub trait Sleeper: Send + Sync {
    /// Waits for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// Sleeps on the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Records requested delays and returns immediately.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    delays: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    /// Delays requested so far, in order.
    #[must_use]
    pub fn delays(&self) -> Vec<Duration> {
        self.delays
            .lock()
            .map(|delays| delays.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        if let Ok(mut delays) = self.delays.lock() {
            delays.push(duration);
        }
    }
}

/// Result of an operation together with the number of attempts it took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempted<T> {
    /// Success value or final error.
    pub value: T,
    /// Attempts made, counting the first.
    pub attempts: u32,
}

/// Runs `op` until it succeeds, fails permanently, or the policy runs out
/// of attempts.
///
/// `op` receives the 1-based attempt number. On failure the final error is
/// returned; it is transient exactly when attempts were exhausted.
///
/// # Errors
///
/// Returns the last error produced by `op`, with the attempt count.
pub async fn retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    label: &str,
    mut op: F,
) -> Result<Attempted<T>, Attempted<E>>
where
    E: Retryable + std::fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = policy.attempts();
    let mut attempt = 1;

    loop {
        match op(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    log::debug!("{label}: succeeded on attempt {attempt}");
                }
                return Ok(Attempted {
                    value,
                    attempts: attempt,
                });
            }
            Err(e) if e.is_transient() && attempt < max_attempts => {
                let delay = policy.delay(attempt);
                log::warn!(
                    "{label}: transient error: {e} (retry {attempt}/{} in {delay:?})",
                    max_attempts - 1
                );
                sleeper.sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                if e.is_transient() {
                    log::error!("{label}: giving up after {attempt} attempts: {e}");
                }
                return Err(Attempted {
                    value: e,
                    attempts: attempt,
                });
            }
        }
    }
}
