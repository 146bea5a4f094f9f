use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Row in the per-tenant fingerprint index. One row per (tenant, content hash).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct FingerprintRecord {
    pub tenant_id: Uuid,
    pub content_hash: String,
    pub upload_id: Uuid,
    pub registered_at: DateTime<Utc>,
}

/// Outcome of a duplicate lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FingerprintMatch {
    pub is_duplicate: bool,
    pub prior_upload_id: Option<Uuid>,
    pub age_hours: Option<f64>,
}

impl FingerprintMatch {
    pub fn none() -> Self {
        Self {
            is_duplicate: false,
            prior_upload_id: None,
            age_hours: None,
        }
    }

    pub fn from_prior(record: &FingerprintRecord, now: DateTime<Utc>) -> Self {
        let age = now.signed_duration_since(record.registered_at);
        let age_hours = (age.num_milliseconds().max(0) as f64) / 3_600_000.0;
        Self {
            is_duplicate: true,
            prior_upload_id: Some(record.upload_id),
            age_hours: Some(age_hours),
        }
    }
}
