//! OCR outcome handling
//!
//! Applies the result of one OCR attempt to a claimed upload. The worker owns claiming,
//! timeouts and retry policy; this service owns the state transitions and their audit.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tally_core::constants::SYSTEM_ACTOR_ID;
use tally_core::models::{
    AuditAction, NewAuditEntry, OcrOutput, QuarantineReason, QuarantineRecord, Upload,
};
use tally_core::{AppError, RequestContext};
use tally_db::{OcrSummary, QuarantineRepository, UploadRepository};
use tally_storage::{BlobArea, BlobStore};
use uuid::Uuid;

use crate::audit::AuditTrail;
use crate::fingerprint::FingerprintStore;

/// Where an upload ended up after OCR.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", content = "upload", rename_all = "snake_case")]
pub enum OcrDisposition {
    Completed(Upload),
    Quarantined(Upload),
}

#[derive(Clone)]
pub struct ProcessingService {
    uploads: Arc<dyn UploadRepository>,
    quarantine: Arc<dyn QuarantineRepository>,
    storage: Arc<dyn BlobStore>,
    fingerprints: FingerprintStore,
    audit: AuditTrail,
    min_ocr_chars: usize,
}

fn system_context(tenant_id: Uuid) -> RequestContext {
    RequestContext::new(tenant_id, SYSTEM_ACTOR_ID, Vec::new())
}

impl ProcessingService {
    pub fn new(
        uploads: Arc<dyn UploadRepository>,
        quarantine: Arc<dyn QuarantineRepository>,
        storage: Arc<dyn BlobStore>,
        fingerprints: FingerprintStore,
        audit: AuditTrail,
        min_ocr_chars: usize,
    ) -> Self {
        Self {
            uploads,
            quarantine,
            storage,
            fingerprints,
            audit,
            min_ocr_chars,
        }
    }

    pub async fn claim(&self, upload_id: Uuid) -> Result<Option<Upload>, AppError> {
        self.uploads.claim_upload(upload_id, Utc::now()).await
    }

    pub async fn claim_next(&self) -> Result<Option<Upload>, AppError> {
        self.uploads.claim_next_queued(Utc::now()).await
    }

    pub async fn requeue_stale(&self, started_before: DateTime<Utc>) -> Result<Vec<Uuid>, AppError> {
        self.uploads.requeue_stale(started_before).await
    }

    /// Bytes of a claimed upload.
    pub async fn load_bytes(&self, upload: &Upload) -> Result<Vec<u8>, AppError> {
        Ok(self.storage.get(&upload.storage_ref).await?)
    }

    /// Complete the upload, or quarantine it when OCR found too little text.
    #[tracing::instrument(skip(self, upload, output), fields(upload_id = %upload.id, tenant_id = %upload.tenant_id))]
    pub async fn finish(&self, upload: &Upload, output: &OcrOutput) -> Result<OcrDisposition, AppError> {
        let result = self.try_finish(upload, output).await;
        self.audit
            .audited(
                &system_context(upload.tenant_id),
                AuditAction::ProcessingFailed,
                &upload.entity_ref(),
                result,
            )
            .await
    }

    async fn try_finish(&self, upload: &Upload, output: &OcrOutput) -> Result<OcrDisposition, AppError> {
        let char_count = output.non_whitespace_chars();
        let summary = OcrSummary {
            char_count: i32::try_from(char_count).unwrap_or(i32::MAX),
            mean_confidence: output.mean_confidence(),
        };
        let now = Utc::now();
        let entity = upload.entity_ref();

        if char_count >= self.min_ocr_chars {
            let completed = self
                .uploads
                .complete_upload(upload.id, summary, now)
                .await?
                .ok_or_else(|| lost_claim(upload.id))?;
            self.audit
                .record(
                    NewAuditEntry::new(upload.tenant_id, SYSTEM_ACTOR_ID, AuditAction::UploadCompleted, &entity)
                        .with_before(json!({ "status": upload.status }))
                        .with_after(json!({
                            "status": completed.status,
                            "ocr_char_count": summary.char_count,
                            "ocr_mean_confidence": summary.mean_confidence,
                            "line_count": output.line_count,
                        })),
                )
                .await?;
            tracing::info!(char_count, "OCR completed");
            return Ok(OcrDisposition::Completed(completed));
        }

        let quarantined = self
            .uploads
            .quarantine_processed_upload(upload.id, summary, now)
            .await?
            .ok_or_else(|| lost_claim(upload.id))?;
        let quarantine_ref = self
            .storage
            .copy_to(&upload.storage_ref, BlobArea::Quarantine)
            .await?;
        let record = self
            .quarantine
            .insert_quarantine(QuarantineRecord {
                id: Uuid::new_v4(),
                tenant_id: upload.tenant_id,
                upload_id: upload.id,
                storage_ref: quarantine_ref,
                reason: QuarantineReason::InsufficientText,
                detail: json!({
                    "char_count": char_count,
                    "min_chars": self.min_ocr_chars,
                    "mean_confidence": summary.mean_confidence,
                    "line_count": output.line_count,
                }),
                actor_id: SYSTEM_ACTOR_ID,
                quarantined_at: now,
                resolution: None,
                reviewed_by: None,
                reviewed_at: None,
            })
            .await?;
        self.fingerprints
            .release(upload.tenant_id, &upload.content_hash, upload.id)
            .await?;

        self.audit
            .record(
                NewAuditEntry::new(upload.tenant_id, SYSTEM_ACTOR_ID, AuditAction::UploadQuarantined, &entity)
                    .with_before(json!({ "status": upload.status }))
                    .with_after(json!({
                        "status": quarantined.status,
                        "reason_code": record.reason.reason_code(),
                        "quarantine_id": record.id,
                        "ocr_char_count": char_count,
                    })),
            )
            .await?;
        tracing::info!(char_count, min_chars = self.min_ocr_chars, "Upload quarantined after OCR");
        Ok(OcrDisposition::Quarantined(quarantined))
    }

    /// Put the upload back in the queue after a retryable OCR failure.
    pub async fn retry_later(
        &self,
        upload: &Upload,
        next_attempt_at: DateTime<Utc>,
        reason: &str,
    ) -> Result<Option<Upload>, AppError> {
        tracing::warn!(
            upload_id = %upload.id,
            attempt = upload.attempts,
            next_attempt_at = %next_attempt_at,
            reason = %reason,
            "OCR attempt failed, retry scheduled"
        );
        self.uploads.schedule_retry(upload.id, next_attempt_at).await
    }

    /// Mark the upload failed after its last attempt.
    pub async fn give_up(&self, upload: &Upload, reason: &str) -> Result<Option<Upload>, AppError> {
        let failed = self.uploads.fail_upload(upload.id, Utc::now()).await?;
        if failed.is_some() {
            let err = AppError::UpstreamUnavailable {
                service: "ocr".to_string(),
                message: reason.to_string(),
            };
            tracing::error!(upload_id = %upload.id, attempts = upload.attempts, reason = %reason, "OCR failed permanently");
            self.audit
                .record_error(
                    &system_context(upload.tenant_id),
                    AuditAction::UploadFailed,
                    upload.entity_ref(),
                    &err,
                )
                .await;
        }
        Ok(failed)
    }
}

fn lost_claim(upload_id: Uuid) -> AppError {
    AppError::InvalidState(format!(
        "Upload {} is no longer in processing; another worker took it over",
        upload_id
    ))
}
