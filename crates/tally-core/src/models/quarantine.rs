use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Why an upload was moved to quarantine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(
    feature = "sqlx",
    sqlx(type_name = "quarantine_reason", rename_all = "snake_case")
)]
#[serde(rename_all = "snake_case")]
pub enum QuarantineReason {
    /// Document quality score below the admission threshold.
    QualityRejected,
    /// OCR returned too little text to be a usable document.
    InsufficientText,
}

impl QuarantineReason {
    pub fn reason_code(&self) -> &'static str {
        match self {
            QuarantineReason::QualityRejected => "QUALITY_REJECTED",
            QuarantineReason::InsufficientText => "INSUFFICIENT_TEXT",
        }
    }
}

/// Reviewer decision on a quarantined upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(
    feature = "sqlx",
    sqlx(type_name = "quarantine_resolution", rename_all = "lowercase")
)]
#[serde(rename_all = "lowercase")]
pub enum QuarantineResolution {
    /// The upload is sent back to the OCR queue.
    Released,
    /// The upload stays quarantined; the record is closed.
    Dismissed,
}

/// Retained rejected upload awaiting manual review. Bytes live in blob storage
/// under `storage_ref` and are never deleted by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct QuarantineRecord {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub upload_id: Uuid,
    pub storage_ref: String,
    pub reason: QuarantineReason,
    pub detail: JsonValue,
    pub actor_id: Uuid,
    pub quarantined_at: DateTime<Utc>,
    pub resolution: Option<QuarantineResolution>,
    pub reviewed_by: Option<Uuid>,
    pub reviewed_at: Option<DateTime<Utc>>,
}

impl QuarantineRecord {
    pub fn is_pending(&self) -> bool {
        self.resolution.is_none()
    }

    pub fn entity_ref(&self) -> String {
        format!("quarantine:{}", self.id)
    }
}
