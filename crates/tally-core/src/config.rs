//! Configuration module
//!
//! Configuration for the intake engine: database and logging settings shared by every
//! binary, plus the tuning knobs of each component (admission gate, abuse guard,
//! fingerprint store, ledger and OCR workers).

use std::env;

use crate::constants::{DEFAULT_ALLOWED_MEDIA_TYPES, MAX_UPLOAD_BYTES, MIN_UPLOAD_BYTES};
use crate::models::QualityWeights;

// Common constants
const MAX_CONNECTIONS: u32 = 20;
const CONNECTION_TIMEOUT_SECS: u64 = 30;
const QUALITY_THRESHOLD: f64 = 70.0;
const BLUR_VARIANCE_MIN: f64 = 50.0;
const BLUR_VARIANCE_MAX: f64 = 500.0;
const GLARE_LUMA_THRESHOLD: u8 = 250;
const GLARE_MAX_PERCENT: f64 = 5.0;
const CONTRAST_MIN_RATIO: f64 = 0.7;
const MIN_OCR_CHARS: usize = 10;
const UPLOADS_PER_HOUR: u32 = 50;
const RATE_WINDOW_SECS: u64 = 3600;
const RATE_BUCKET_SECS: u64 = 60;
const RAPID_FIRE_COUNT: u64 = 3;
const RAPID_FIRE_WINDOW_SECS: u64 = 5;
const BULK_CONFIRM_FLOOR_SECS: f64 = 0.2;
const DEDUP_LOOKBACK_HOURS: i64 = 24;
const COMMIT_LOCK_TIMEOUT_MS: u64 = 5000;
const COMMIT_LEASE_SECS: i64 = 60;
const OCR_MAX_WORKERS: usize = 4;
const OCR_MAX_ATTEMPTS: u32 = 3;
const OCR_TIMEOUT_SECS: u64 = 120;
const OCR_POLL_INTERVAL_MS: u64 = 1000;
const STALE_REAP_INTERVAL_SECS: u64 = 60;
const STALE_GRACE_PERIOD_SECS: i64 = 300;

/// Settings shared by every Tally binary
#[derive(Clone, Debug)]
pub struct BaseConfig {
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub db_timeout_seconds: u64,
    pub environment: String,
    pub blob_storage_path: String,
    /// Key for the audit trail HMAC signature.
    pub audit_signing_secret: String,
}

impl Default for BaseConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            db_max_connections: MAX_CONNECTIONS,
            db_timeout_seconds: CONNECTION_TIMEOUT_SECS,
            environment: "development".to_string(),
            blob_storage_path: "./data/blobs".to_string(),
            audit_signing_secret: String::new(),
        }
    }
}

/// Quality scoring and hard-check settings
#[derive(Clone, Debug)]
pub struct AdmissionConfig {
    pub quality_threshold: f64,
    pub weights: QualityWeights,
    pub blur_variance_min: f64,
    pub blur_variance_max: f64,
    pub glare_luma_threshold: u8,
    pub glare_max_percent: f64,
    pub contrast_min_ratio: f64,
    pub min_bytes: usize,
    pub max_bytes: usize,
    pub allowed_media_types: Vec<String>,
    /// Minimum non-whitespace characters OCR must return for a usable document.
    pub min_ocr_chars: usize,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            quality_threshold: QUALITY_THRESHOLD,
            weights: QualityWeights::default(),
            blur_variance_min: BLUR_VARIANCE_MIN,
            blur_variance_max: BLUR_VARIANCE_MAX,
            glare_luma_threshold: GLARE_LUMA_THRESHOLD,
            glare_max_percent: GLARE_MAX_PERCENT,
            contrast_min_ratio: CONTRAST_MIN_RATIO,
            min_bytes: MIN_UPLOAD_BYTES,
            max_bytes: MAX_UPLOAD_BYTES,
            allowed_media_types: DEFAULT_ALLOWED_MEDIA_TYPES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            min_ocr_chars: MIN_OCR_CHARS,
        }
    }
}

/// Rate limiting and anomaly detection settings
#[derive(Clone, Debug)]
pub struct AbuseConfig {
    pub uploads_per_window: u32,
    pub rate_window_secs: u64,
    /// Width of one counter bucket inside the sliding window.
    pub rate_bucket_secs: u64,
    pub rapid_fire_count: u64,
    pub rapid_fire_window_secs: u64,
    pub bulk_confirm_floor_secs: f64,
}

impl Default for AbuseConfig {
    fn default() -> Self {
        Self {
            uploads_per_window: UPLOADS_PER_HOUR,
            rate_window_secs: RATE_WINDOW_SECS,
            rate_bucket_secs: RATE_BUCKET_SECS,
            rapid_fire_count: RAPID_FIRE_COUNT,
            rapid_fire_window_secs: RAPID_FIRE_WINDOW_SECS,
            bulk_confirm_floor_secs: BULK_CONFIRM_FLOOR_SECS,
        }
    }
}

#[derive(Clone, Debug)]
pub struct FingerprintConfig {
    pub lookback_hours: i64,
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self {
            lookback_hours: DEDUP_LOOKBACK_HOURS,
        }
    }
}

/// Session commit settings
#[derive(Clone, Debug)]
pub struct LedgerConfig {
    /// Bounded wait for the session lock before giving up with a conflict.
    pub commit_lock_timeout_ms: u64,
    /// Age after which a `committing` marker is treated as abandoned.
    pub commit_lease_secs: i64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            commit_lock_timeout_ms: COMMIT_LOCK_TIMEOUT_MS,
            commit_lease_secs: COMMIT_LEASE_SECS,
        }
    }
}

/// OCR worker pool settings
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub max_workers: usize,
    pub max_attempts: u32,
    pub ocr_timeout_secs: u64,
    pub poll_interval_ms: u64,
    /// Interval in seconds between runs of the stale upload reaper. 0 = disabled.
    pub stale_reap_interval_secs: u64,
    pub stale_grace_period_secs: i64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_workers: OCR_MAX_WORKERS,
            max_attempts: OCR_MAX_ATTEMPTS,
            ocr_timeout_secs: OCR_TIMEOUT_SECS,
            poll_interval_ms: OCR_POLL_INTERVAL_MS,
            stale_reap_interval_secs: STALE_REAP_INTERVAL_SECS,
            stale_grace_period_secs: STALE_GRACE_PERIOD_SECS,
        }
    }
}

/// Full engine configuration
#[derive(Clone, Debug, Default)]
pub struct IntakeConfig {
    pub base: BaseConfig,
    pub admission: AdmissionConfig,
    pub abuse: AbuseConfig,
    pub fingerprint: FingerprintConfig,
    pub ledger: LedgerConfig,
    pub worker: WorkerConfig,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl IntakeConfig {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        dotenvy::dotenv().ok();

        let environment = env::var("ENVIRONMENT")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string());

        let base = BaseConfig {
            database_url: env::var("DATABASE_URL").ok(),
            db_max_connections: env_or("DB_MAX_CONNECTIONS", MAX_CONNECTIONS),
            db_timeout_seconds: env_or("DB_TIMEOUT_SECONDS", CONNECTION_TIMEOUT_SECS),
            environment,
            blob_storage_path: env::var("BLOB_STORAGE_PATH")
                .unwrap_or_else(|_| "./data/blobs".to_string()),
            audit_signing_secret: env::var("AUDIT_SIGNING_SECRET")
                .map_err(|_| anyhow::anyhow!("AUDIT_SIGNING_SECRET must be set"))?,
        };

        let allowed_media_types: Vec<String> = env::var("ALLOWED_MEDIA_TYPES")
            .map(|s| {
                s.split(',')
                    .map(|t| t.trim().to_lowercase())
                    .filter(|t| !t.is_empty())
                    .collect()
            })
            .unwrap_or_else(|_| {
                DEFAULT_ALLOWED_MEDIA_TYPES
                    .iter()
                    .map(|s| s.to_string())
                    .collect()
            });

        let admission = AdmissionConfig {
            quality_threshold: env_or("QUALITY_THRESHOLD", QUALITY_THRESHOLD),
            weights: QualityWeights {
                blur: env_or("QUALITY_WEIGHT_BLUR", 0.40),
                glare: env_or("QUALITY_WEIGHT_GLARE", 0.30),
                contrast: env_or("QUALITY_WEIGHT_CONTRAST", 0.30),
            },
            blur_variance_min: env_or("BLUR_VARIANCE_MIN", BLUR_VARIANCE_MIN),
            blur_variance_max: env_or("BLUR_VARIANCE_MAX", BLUR_VARIANCE_MAX),
            glare_luma_threshold: env_or("GLARE_LUMA_THRESHOLD", GLARE_LUMA_THRESHOLD),
            glare_max_percent: env_or("GLARE_MAX_PERCENT", GLARE_MAX_PERCENT),
            contrast_min_ratio: env_or("CONTRAST_MIN_RATIO", CONTRAST_MIN_RATIO),
            min_bytes: env_or("MIN_UPLOAD_BYTES", MIN_UPLOAD_BYTES),
            max_bytes: env_or("MAX_UPLOAD_BYTES", MAX_UPLOAD_BYTES),
            allowed_media_types,
            min_ocr_chars: env_or("MIN_OCR_CHARS", MIN_OCR_CHARS),
        };

        let abuse = AbuseConfig {
            uploads_per_window: env_or("UPLOADS_PER_HOUR", UPLOADS_PER_HOUR),
            rate_window_secs: env_or("RATE_WINDOW_SECS", RATE_WINDOW_SECS),
            rate_bucket_secs: env_or("RATE_BUCKET_SECS", RATE_BUCKET_SECS),
            rapid_fire_count: env_or("RAPID_FIRE_COUNT", RAPID_FIRE_COUNT),
            rapid_fire_window_secs: env_or("RAPID_FIRE_WINDOW_SECS", RAPID_FIRE_WINDOW_SECS),
            bulk_confirm_floor_secs: env_or("BULK_CONFIRM_FLOOR_SECS", BULK_CONFIRM_FLOOR_SECS),
        };

        let fingerprint = FingerprintConfig {
            lookback_hours: env_or("DEDUP_LOOKBACK_HOURS", DEDUP_LOOKBACK_HOURS),
        };

        let ledger = LedgerConfig {
            commit_lock_timeout_ms: env_or("COMMIT_LOCK_TIMEOUT_MS", COMMIT_LOCK_TIMEOUT_MS),
            commit_lease_secs: env_or("COMMIT_LEASE_SECS", COMMIT_LEASE_SECS),
        };

        let worker = WorkerConfig {
            max_workers: env_or("OCR_MAX_WORKERS", OCR_MAX_WORKERS),
            max_attempts: env_or("OCR_MAX_ATTEMPTS", OCR_MAX_ATTEMPTS),
            ocr_timeout_secs: env_or("OCR_TIMEOUT_SECS", OCR_TIMEOUT_SECS),
            poll_interval_ms: env_or("OCR_POLL_INTERVAL_MS", OCR_POLL_INTERVAL_MS),
            stale_reap_interval_secs: env_or("STALE_REAP_INTERVAL_SECS", STALE_REAP_INTERVAL_SECS),
            stale_grace_period_secs: env_or("STALE_GRACE_PERIOD_SECS", STALE_GRACE_PERIOD_SECS),
        };

        let config = IntakeConfig {
            base,
            admission,
            abuse,
            fingerprint,
            ledger,
            worker,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn is_production(&self) -> bool {
        let env = self.base.environment.to_lowercase();
        env == "production" || env == "prod"
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.base.audit_signing_secret.len() < 32 {
            return Err(anyhow::anyhow!(
                "AUDIT_SIGNING_SECRET must be at least 32 characters long"
            ));
        }

        if let Some(url) = &self.base.database_url {
            if !url.starts_with("postgres://") && !url.starts_with("postgresql://") {
                return Err(anyhow::anyhow!(
                    "DATABASE_URL must be a valid PostgreSQL connection string"
                ));
            }
        } else if self.is_production() {
            return Err(anyhow::anyhow!(
                "DATABASE_URL must be set in production; the in-memory store is single-node only"
            ));
        }

        let a = &self.admission;
        if !(0.0..=100.0).contains(&a.quality_threshold) {
            return Err(anyhow::anyhow!("QUALITY_THRESHOLD must be within [0, 100]"));
        }
        let weight_sum = a.weights.blur + a.weights.glare + a.weights.contrast;
        if (weight_sum - 1.0).abs() > 1e-6 {
            return Err(anyhow::anyhow!(
                "Quality weights must sum to 1.0 (got {:.3})",
                weight_sum
            ));
        }
        if a.blur_variance_min >= a.blur_variance_max {
            return Err(anyhow::anyhow!(
                "BLUR_VARIANCE_MIN must be lower than BLUR_VARIANCE_MAX"
            ));
        }
        if a.glare_max_percent <= 0.0 {
            return Err(anyhow::anyhow!("GLARE_MAX_PERCENT must be positive"));
        }
        if !(0.0..1.0).contains(&a.contrast_min_ratio) {
            return Err(anyhow::anyhow!("CONTRAST_MIN_RATIO must be within [0, 1)"));
        }
        if a.min_bytes >= a.max_bytes {
            return Err(anyhow::anyhow!(
                "MIN_UPLOAD_BYTES must be lower than MAX_UPLOAD_BYTES"
            ));
        }
        if a.allowed_media_types.is_empty() {
            return Err(anyhow::anyhow!("ALLOWED_MEDIA_TYPES must not be empty"));
        }

        let b = &self.abuse;
        if b.uploads_per_window == 0 {
            return Err(anyhow::anyhow!("UPLOADS_PER_HOUR must be at least 1"));
        }
        if b.rate_bucket_secs == 0 || b.rate_window_secs % b.rate_bucket_secs != 0 {
            return Err(anyhow::anyhow!(
                "RATE_WINDOW_SECS must be a positive multiple of RATE_BUCKET_SECS"
            ));
        }
        if b.rapid_fire_count < 2 || b.rapid_fire_window_secs == 0 {
            return Err(anyhow::anyhow!(
                "RAPID_FIRE_COUNT must be at least 2 with a non-zero window"
            ));
        }

        if self.fingerprint.lookback_hours <= 0 {
            return Err(anyhow::anyhow!("DEDUP_LOOKBACK_HOURS must be positive"));
        }

        if self.ledger.commit_lock_timeout_ms == 0 || self.ledger.commit_lease_secs <= 0 {
            return Err(anyhow::anyhow!(
                "COMMIT_LOCK_TIMEOUT_MS and COMMIT_LEASE_SECS must be positive"
            ));
        }

        if self.worker.max_workers == 0 || self.worker.max_attempts == 0 {
            return Err(anyhow::anyhow!(
                "OCR_MAX_WORKERS and OCR_MAX_ATTEMPTS must be at least 1"
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> IntakeConfig {
        let mut config = IntakeConfig::default();
        config.base.audit_signing_secret = "x".repeat(32);
        config
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = valid();
        assert!(config.validate().is_ok());
        assert_eq!(config.admission.quality_threshold, 70.0);
        assert_eq!(config.abuse.uploads_per_window, 50);
        assert_eq!(config.abuse.rapid_fire_count, 3);
        assert_eq!(config.fingerprint.lookback_hours, 24);
        assert_eq!(config.ledger.commit_lock_timeout_ms, 5000);
        assert_eq!(config.worker.max_workers, 4);
    }

    #[test]
    fn test_short_secret_rejected() {
        let mut config = valid();
        config.base.audit_signing_secret = "short".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_weights_must_sum_to_one() {
        let mut config = valid();
        config.admission.weights.blur = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_production_requires_database() {
        let mut config = valid();
        config.base.environment = "production".to_string();
        assert!(config.validate().is_err());
        config.base.database_url = Some("postgres://localhost/tally".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bucket_must_divide_window() {
        let mut config = valid();
        config.abuse.rate_bucket_secs = 7;
        assert!(config.validate().is_err());
    }
}
