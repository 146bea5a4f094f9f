//! Sliding-window counters over the shared counter store
//!
//! A window of `window_secs` is split into fixed buckets of `bucket_secs`. Each event
//! increments the bucket containing `now`; the window count is the sum of every bucket
//! that overlaps `(now - window, now]`. [`RateLimiter::check`] counts an event only when
//! it is admitted, so a rejected attempt never pushes the window further out.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tally_core::AppError;
use tally_db::{CounterBucket, CounterRepository};

/// Window and bucket sizes, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSpec {
    pub window_secs: u64,
    pub bucket_secs: u64,
}

impl WindowSpec {
    pub fn new(window_secs: u64, bucket_secs: u64) -> Self {
        let bucket_secs = bucket_secs.clamp(1, window_secs.max(1));
        Self {
            window_secs: window_secs.max(1),
            bucket_secs,
        }
    }

    /// Start of the bucket containing `now`.
    pub fn bucket_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let bucket_millis = (self.bucket_secs as i64) * 1000;
        let millis = now.timestamp_millis();
        let start = millis - millis.rem_euclid(bucket_millis);
        DateTime::from_timestamp_millis(start).unwrap_or(now)
    }

    /// Start of the oldest bucket still inside the window ending at `now`.
    pub fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.bucket_start(now) - self.window() + self.bucket()
    }

    fn window(&self) -> Duration {
        Duration::seconds(self.window_secs as i64)
    }

    fn bucket(&self) -> Duration {
        Duration::seconds(self.bucket_secs as i64)
    }
}

/// Outcome of recording one event against a limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { count: u64, remaining: u64 },
    Limited { count: u64, retry_after_secs: u64 },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed { .. })
    }

    pub fn count(&self) -> u64 {
        match self {
            RateDecision::Allowed { count, .. } | RateDecision::Limited { count, .. } => *count,
        }
    }
}

/// Keyed sliding-window limiter
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterRepository>,
    spec: WindowSpec,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterRepository>, spec: WindowSpec) -> Self {
        Self { store, spec }
    }

    pub fn spec(&self) -> WindowSpec {
        self.spec
    }

    /// Count one event for `key` and return the number of events in the window,
    /// including this one.
    pub async fn record(&self, key: &str, now: DateTime<Utc>) -> Result<u64, AppError> {
        self.increment(key, now).await
    }

    /// Count one event if the window holds fewer than `limit` events. A limited
    /// event is not counted.
    pub async fn check(&self, key: &str, limit: u64, now: DateTime<Utc>) -> Result<RateDecision, AppError> {
        let bucket_start = self.spec.bucket_start(now);
        let window_start = self.spec.window_start(now);
        let expires_at = bucket_start + self.spec.window() + self.spec.bucket();

        if let Some(count) = self
            .store
            .increment_within_limit(key, bucket_start, expires_at, window_start, limit)
            .await?
        {
            return Ok(RateDecision::Allowed {
                count,
                remaining: limit.saturating_sub(count),
            });
        }

        let buckets = self.store.buckets_since(key, window_start).await?;
        let count: u64 = buckets.iter().map(|b| b.count).sum();
        let retry_after_secs = self.retry_after(&buckets, count, limit, now);

        tracing::debug!(key = %key, count, limit, retry_after_secs, "Rate limit exceeded");
        Ok(RateDecision::Limited {
            count,
            retry_after_secs,
        })
    }

    /// Seconds until enough of the oldest buckets leave the window for one more event.
    fn retry_after(&self, buckets: &[CounterBucket], count: u64, limit: u64, now: DateTime<Utc>) -> u64 {
        let must_expire = (count + 1).saturating_sub(limit);
        let mut expired = 0u64;
        let mut reopens_at = self.spec.bucket_start(now) + self.spec.window();
        for bucket in buckets.iter().filter(|b| b.count > 0) {
            expired += bucket.count;
            if expired >= must_expire {
                reopens_at = bucket.bucket_start + self.spec.window();
                break;
            }
        }
        let wait = reopens_at - now;
        (wait.num_milliseconds().max(0) as u64).div_ceil(1000).max(1)
    }

    async fn increment(&self, key: &str, now: DateTime<Utc>) -> Result<u64, AppError> {
        let bucket_start = self.spec.bucket_start(now);
        let expires_at = bucket_start + self.spec.window() + self.spec.bucket();
        self.store.increment(key, bucket_start, expires_at).await?;

        let buckets = self
            .store
            .buckets_since(key, self.spec.window_start(now))
            .await?;
        Ok(buckets.iter().map(|b| b.count).sum())
    }
}
