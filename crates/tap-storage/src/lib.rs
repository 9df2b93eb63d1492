//! Durable state for the pipeline: job queue, record stores, assignment store,
//! fallback spool, plus the retry/rate-limit primitives shared by HTTP callers.

use std::time::{Duration, Instant};

use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::Mutex;

pub mod assignments;
pub mod http;
pub mod postgres;
pub mod queue;
pub mod records;
pub mod rest;
pub mod spool;

pub use assignments::{AssignmentStore, InsertResult, MemoryAssignmentStore};
pub use http::{FetchError, HttpClient, HttpClientConfig, HttpResponse};
pub use postgres::{connect_pool, run_migrations, PgJobQueue, PgRecordStore};
pub use queue::{
    EnqueueResult, JobFilter, JobQueue, MemoryJobQueue, QueueSettings, QueueStats, ReleaseResult,
    StateCount,
};
pub use records::{CanonicalStore, MemoryRecordStore, RawEventStore, VersionInfo, VersionRegistry};
pub use rest::{RestAssignmentStore, RestStoreConfig};
pub use spool::{FallbackSpool, SpoolEntry, SpooledFile};

pub const CRATE_NAME: &str = "tap-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("conditional write lost: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error(transparent)]
    Http(#[from] FetchError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid row: {0}")]
    InvalidRow(String),
}

impl StoreError {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Database(err) => matches!(
                err,
                sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::Io(_)
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::WorkerCrashed
            ),
            StoreError::Http(err) => err.is_transient(),
            StoreError::Io(_) => true,
            _ => false,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Exponential backoff capped at `max_delay`, with a jittered lower band.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the delay that may be shaved off by jitter (0.0..=1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            jitter: 0.5,
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32
            .checked_shl(attempt_index.min(31) as u32)
            .unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    /// `unit` is a uniform sample in `[0, 1)`; the result stays within
    /// `[(1 - jitter) * d, d]` where `d` is the capped delay.
    pub fn jittered_delay(&self, attempt_index: usize, unit: f64) -> Duration {
        let delay = self.delay_for_attempt(attempt_index);
        let jitter = self.jitter.clamp(0.0, 1.0);
        let keep = 1.0 - jitter * unit.clamp(0.0, 1.0);
        delay.mul_f64(keep)
    }

    pub fn sample_delay(&self, attempt_index: usize) -> Duration {
        self.jittered_delay(attempt_index, rand::random::<f64>())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn from_config(config: TokenBucketConfig) -> Self {
        Self::new(config.capacity, config.refill_every)
    }

    fn refill(&self, state: &mut TokenBucketState) {
        let elapsed = state.last_refill.elapsed();
        if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
            let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
            state.tokens = (state.tokens.saturating_add(refills)).min(self.capacity);
            state.last_refill = Instant::now();
        }
    }

    /// Take a token without waiting.
    pub async fn try_take(&self) -> bool {
        let mut state = self.state.lock().await;
        self.refill(&mut state);
        if state.tokens > 0 {
            state.tokens -= 1;
            true
        } else {
            false
        }
    }

    pub async fn take(&self) {
        loop {
            if self.try_take().await {
                return;
            }
            tokio::time::sleep(self.refill_every.max(Duration::from_millis(1))).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            jitter: 0.0,
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(200), Duration::from_millis(350));
    }

    #[test]
    fn jitter_stays_inside_band() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(60),
            jitter: 0.5,
        };
        assert_eq!(policy.jittered_delay(0, 0.0), Duration::from_secs(10));
        assert_eq!(policy.jittered_delay(0, 1.0), Duration::from_secs(5));
        for _ in 0..50 {
            let d = policy.sample_delay(3);
            assert!(d >= Duration::from_secs(30) && d <= Duration::from_secs(60));
        }
    }

    #[test]
    fn status_classification() {
        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::BAD_REQUEST),
            RetryDisposition::NonRetryable
        );
    }

    #[tokio::test]
    async fn token_bucket_drains_then_refuses() {
        let bucket = SimpleTokenBucket::new(2, Duration::from_secs(3600));
        assert!(bucket.try_take().await);
        assert!(bucket.try_take().await);
        assert!(!bucket.try_take().await);
    }
}
