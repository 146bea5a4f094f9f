//! Abuse guard
//!
//! Hard upload cap and soft rapid-fire signal per (tenant, user), plus the bulk
//! confirmation plausibility check used during line verification.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tally_core::models::UploadWarning;
use tally_core::{AbuseConfig, AppError};
use tally_db::CounterRepository;
use tally_infra::{RateDecision, RateLimiter, WindowSpec};
use uuid::Uuid;

/// Seconds spent per confirmed line, and whether that is below `floor_secs`.
///
/// Returns `(None, false)` when nothing was confirmed.
pub fn bulk_confirmation_check(confirmed: usize, elapsed: Duration, floor_secs: f64) -> (Option<f64>, bool) {
    if confirmed == 0 {
        return (None, false);
    }
    let per_item = elapsed.as_secs_f64() / confirmed as f64;
    (Some(per_item), per_item < floor_secs)
}

#[derive(Clone)]
pub struct AbuseGuard {
    uploads: RateLimiter,
    bursts: RateLimiter,
    config: AbuseConfig,
}

impl AbuseGuard {
    pub fn new(counters: Arc<dyn CounterRepository>, config: AbuseConfig) -> Self {
        let uploads = RateLimiter::new(
            counters.clone(),
            WindowSpec::new(config.rate_window_secs, config.rate_bucket_secs),
        );
        let bursts = RateLimiter::new(counters, WindowSpec::new(config.rapid_fire_window_secs, 1));
        Self {
            uploads,
            bursts,
            config,
        }
    }

    pub fn config(&self) -> &AbuseConfig {
        &self.config
    }

    /// Count one upload attempt. Fails with `RateLimited` past the hourly cap;
    /// otherwise returns soft warnings.
    #[tracing::instrument(skip(self), fields(tenant_id = %tenant_id, user_id = %user_id))]
    pub async fn check_upload(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<UploadWarning>, AppError> {
        let limit = self.config.uploads_per_window;
        let decision = self
            .uploads
            .check(&format!("upload:{}:{}", tenant_id, user_id), limit as u64, now)
            .await?;
        if let RateDecision::Limited {
            count,
            retry_after_secs,
        } = decision
        {
            tracing::warn!(count, limit, retry_after_secs, "Upload rate limit tripped");
            return Err(AppError::RateLimited {
                retry_after_secs,
                limit,
            });
        }

        let burst = self
            .bursts
            .record(&format!("burst:{}:{}", tenant_id, user_id), now)
            .await?;
        let mut warnings = Vec::new();
        if burst >= self.config.rapid_fire_count {
            tracing::info!(count = burst, "Rapid-fire uploads detected");
            warnings.push(UploadWarning::RapidFire {
                count: burst,
                window_seconds: self.config.rapid_fire_window_secs,
            });
        }
        Ok(warnings)
    }

    /// Apply the bulk-confirmation floor from the configuration.
    pub fn assess_confirmation(&self, confirmed: usize, elapsed: Duration) -> (Option<f64>, bool) {
        bulk_confirmation_check(confirmed, elapsed, self.config.bulk_confirm_floor_secs)
    }
}
