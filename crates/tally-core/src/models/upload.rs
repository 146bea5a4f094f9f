use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::quality::QualityReport;

/// Upload lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(
    feature = "sqlx",
    sqlx(type_name = "upload_status", rename_all = "lowercase")
)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Quarantined,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Queued => "queued",
            UploadStatus::Processing => "processing",
            UploadStatus::Completed => "completed",
            UploadStatus::Failed => "failed",
            UploadStatus::Quarantined => "quarantined",
        }
    }

    /// Whether a status change from `self` to `next` is a legal lifecycle step.
    pub fn can_transition_to(&self, next: UploadStatus) -> bool {
        matches!(
            (self, next),
            (UploadStatus::Queued, UploadStatus::Processing)
                | (UploadStatus::Queued, UploadStatus::Quarantined)
                | (UploadStatus::Processing, UploadStatus::Completed)
                | (UploadStatus::Processing, UploadStatus::Failed)
                | (UploadStatus::Processing, UploadStatus::Quarantined)
                | (UploadStatus::Processing, UploadStatus::Queued)
                | (UploadStatus::Quarantined, UploadStatus::Queued)
        )
    }
}

impl std::fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A photographed document received from a crew device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Upload {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub uploader_id: Uuid,
    pub content_hash: String,
    pub byte_size: i64,
    pub media_type: String,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub quality_score: Option<f64>,
    pub quality: Option<QualityReport>,
    pub status: UploadStatus,
    pub storage_ref: String,
    pub ocr_char_count: Option<i32>,
    pub ocr_mean_confidence: Option<f64>,
    /// OCR attempts made so far.
    pub attempts: i32,
    /// Earliest time a queued upload may be claimed again after a failed attempt.
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub uploaded_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl Upload {
    pub fn entity_ref(&self) -> String {
        format!("upload:{}", self.id)
    }
}

/// Insert payload for a new upload row.
#[derive(Debug, Clone)]
pub struct NewUpload {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub uploader_id: Uuid,
    pub content_hash: String,
    pub byte_size: i64,
    pub media_type: String,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub quality: Option<QualityReport>,
    pub status: UploadStatus,
    pub storage_ref: String,
    pub uploaded_at: DateTime<Utc>,
}

impl NewUpload {
    pub fn into_upload(self) -> Upload {
        Upload {
            id: self.id,
            tenant_id: self.tenant_id,
            uploader_id: self.uploader_id,
            content_hash: self.content_hash,
            byte_size: self.byte_size,
            media_type: self.media_type,
            width: self.width,
            height: self.height,
            quality_score: self.quality.as_ref().map(|q| q.total),
            quality: self.quality,
            status: self.status,
            storage_ref: self.storage_ref,
            ocr_char_count: None,
            ocr_mean_confidence: None,
            attempts: 0,
            next_attempt_at: None,
            processing_started_at: None,
            uploaded_at: self.uploaded_at,
            processed_at: None,
        }
    }
}

/// Non-fatal signals attached to an accepted upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UploadWarning {
    /// Identical bytes were admitted for this tenant within the lookback window.
    DuplicateWarning {
        prior_upload_id: Uuid,
        age_hours: f64,
    },
    /// Several uploads from the same user arrived within a few seconds.
    RapidFire { count: u64, window_seconds: u64 },
}

/// Result of a successful intake call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadReceipt {
    pub upload: Upload,
    pub warnings: Vec<UploadWarning>,
}

impl UploadReceipt {
    pub fn is_duplicate(&self) -> bool {
        self.warnings
            .iter()
            .any(|w| matches!(w, UploadWarning::DuplicateWarning { .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_status_transitions() {
        assert!(UploadStatus::Queued.can_transition_to(UploadStatus::Processing));
        assert!(UploadStatus::Processing.can_transition_to(UploadStatus::Quarantined));
        assert!(!UploadStatus::Completed.can_transition_to(UploadStatus::Queued));
        assert!(!UploadStatus::Queued.can_transition_to(UploadStatus::Completed));
    }

    #[test]
    fn test_warning_serializes_with_reason_code() {
        let warning = UploadWarning::DuplicateWarning {
            prior_upload_id: Uuid::nil(),
            age_hours: 1.5,
        };
        let json = serde_json::to_value(&warning).unwrap();
        assert_eq!(json["code"], "DUPLICATE_WARNING");
        assert_eq!(json["age_hours"], 1.5);
    }
}
