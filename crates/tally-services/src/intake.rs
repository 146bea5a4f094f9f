//! Upload intake
//!
//! Order of checks: hard validation, rate limit, duplicate lookup, quality score.
//! Images below the quality threshold never reach OCR; their bytes go to the
//! quarantine area with a review record.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tally_core::models::{
    AuditAction, NewAuditEntry, NewUpload, QuarantineReason, QuarantineRecord, UploadReceipt,
    UploadStatus, UploadWarning,
};
use tally_core::{Action, AppError, RequestContext};
use tally_db::{QuarantineRepository, UploadRepository};
use tally_storage::{BlobArea, BlobStore};
use uuid::Uuid;

use crate::abuse::AbuseGuard;
use crate::admission::{AdmissionGate, Screening};
use crate::audit::AuditTrail;
use crate::fingerprint::FingerprintStore;

/// Raw upload as received from a device.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub data: Vec<u8>,
    pub media_type: String,
}

/// Told about every upload queued for OCR.
#[async_trait]
pub trait UploadNotifier: Send + Sync {
    async fn notify(&self, upload_id: Uuid);
}

#[derive(Clone)]
pub struct IntakeService {
    uploads: Arc<dyn UploadRepository>,
    quarantine: Arc<dyn QuarantineRepository>,
    storage: Arc<dyn BlobStore>,
    gate: AdmissionGate,
    fingerprints: FingerprintStore,
    abuse: AbuseGuard,
    audit: AuditTrail,
    notifier: Option<Arc<dyn UploadNotifier>>,
}

impl IntakeService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        uploads: Arc<dyn UploadRepository>,
        quarantine: Arc<dyn QuarantineRepository>,
        storage: Arc<dyn BlobStore>,
        gate: AdmissionGate,
        fingerprints: FingerprintStore,
        abuse: AbuseGuard,
        audit: AuditTrail,
    ) -> Self {
        Self {
            uploads,
            quarantine,
            storage,
            gate,
            fingerprints,
            abuse,
            audit,
            notifier: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn UploadNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Admit, quarantine or reject one upload.
    #[tracing::instrument(
        skip(self, ctx, request),
        fields(tenant_id = %ctx.tenant_id, user_id = %ctx.user_id, bytes = request.data.len())
    )]
    pub async fn submit(&self, ctx: &RequestContext, request: UploadRequest) -> Result<UploadReceipt, AppError> {
        let upload_id = Uuid::new_v4();
        let entity = format!("upload:{}", upload_id);
        self.audit.authorize(ctx, Action::Upload, &entity).await?;

        let result = self.admit(ctx, upload_id, &entity, request).await;
        if let Err(err) = &result {
            if !recorded_by_admission(err) {
                tracing::error!(upload_id = %upload_id, error = %err, "Upload failed after admission checks");
                self.audit
                    .record_error(ctx, AuditAction::UploadFailed, &entity, err)
                    .await;
            }
        }
        result
    }

    async fn admit(
        &self,
        ctx: &RequestContext,
        upload_id: Uuid,
        entity: &str,
        request: UploadRequest,
    ) -> Result<UploadReceipt, AppError> {
        let byte_size = request.data.len();
        let data: Arc<[u8]> = request.data.into();

        let (image, content_hash) = match self.gate.screen(data.clone(), &request.media_type).await? {
            Screening::Passed {
                image,
                content_hash,
            } => (image, content_hash),
            Screening::Rejected(err) => {
                tracing::info!(reason = err.reason_code(), error = %err, "Upload failed hard checks");
                self.audit
                    .record(
                        NewAuditEntry::new(ctx.tenant_id, ctx.user_id, AuditAction::UploadRejected, entity)
                            .with_after(json!({
                                "reason_code": err.reason_code(),
                                "message": err.to_string(),
                                "byte_size": byte_size,
                                "declared_media_type": request.media_type,
                            })),
                    )
                    .await?;
                return Err(err.into());
            }
        };

        let now = Utc::now();
        let mut warnings = match self.abuse.check_upload(ctx.tenant_id, ctx.user_id, now).await {
            Ok(warnings) => warnings,
            Err(err @ AppError::RateLimited { .. }) => {
                self.audit
                    .record(
                        NewAuditEntry::new(
                            ctx.tenant_id,
                            ctx.user_id,
                            AuditAction::RateLimitTripped,
                            format!("user:{}", ctx.user_id),
                        )
                        .with_after(json!({ "error": err.payload(), "attempted_upload": upload_id })),
                    )
                    .await?;
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        let duplicate = self
            .fingerprints
            .check(ctx.tenant_id, &content_hash, now)
            .await?;
        if let (true, Some(prior_upload_id), Some(age_hours)) =
            (duplicate.is_duplicate, duplicate.prior_upload_id, duplicate.age_hours)
        {
            tracing::info!(prior_upload_id = %prior_upload_id, age_hours, "Duplicate upload");
            warnings.insert(
                0,
                UploadWarning::DuplicateWarning {
                    prior_upload_id,
                    age_hours,
                },
            );
        }

        let (width, height, media_type) = (image.width, image.height, image.media_type.clone());
        let report = self.gate.score(image.image).await?;

        let area = if report.passed {
            BlobArea::Accepted
        } else {
            BlobArea::Quarantine
        };
        let storage_ref = self
            .storage
            .put(area, ctx.tenant_id, &content_hash, &media_type, &data)
            .await?;

        let new_upload = NewUpload {
            id: upload_id,
            tenant_id: ctx.tenant_id,
            uploader_id: ctx.user_id,
            content_hash: content_hash.clone(),
            byte_size: byte_size as i64,
            media_type,
            width: i32::try_from(width).ok(),
            height: i32::try_from(height).ok(),
            quality: Some(report.clone()),
            status: if report.passed {
                UploadStatus::Queued
            } else {
                UploadStatus::Quarantined
            },
            storage_ref: storage_ref.clone(),
            uploaded_at: now,
        };

        if !report.passed {
            let upload = self.uploads.insert_upload(new_upload).await?;
            let record = self
                .quarantine
                .insert_quarantine(QuarantineRecord {
                    id: Uuid::new_v4(),
                    tenant_id: ctx.tenant_id,
                    upload_id,
                    storage_ref,
                    reason: QuarantineReason::QualityRejected,
                    detail: serde_json::to_value(&report)?,
                    actor_id: ctx.user_id,
                    quarantined_at: now,
                    resolution: None,
                    reviewed_by: None,
                    reviewed_at: None,
                })
                .await?;

            tracing::info!(
                upload_id = %upload.id,
                score = report.total,
                threshold = report.threshold,
                "Upload quarantined for low quality"
            );
            self.audit
                .record(
                    NewAuditEntry::new(ctx.tenant_id, ctx.user_id, AuditAction::UploadQuarantined, entity)
                        .with_after(json!({
                            "status": upload.status,
                            "reason_code": record.reason.reason_code(),
                            "quarantine_id": record.id,
                            "score": report.total,
                            "failing_dimensions": report.failing_dimensions,
                        })),
                )
                .await?;
            return Err(AppError::QualityRejected {
                upload_id,
                report: Box::new(report),
            });
        }

        let upload = self.uploads.insert_upload(new_upload).await?;
        self.fingerprints
            .register(ctx.tenant_id, &content_hash, upload.id, now)
            .await?;

        self.audit
            .record(
                NewAuditEntry::new(ctx.tenant_id, ctx.user_id, AuditAction::UploadAdmitted, entity)
                    .with_after(json!({
                        "status": upload.status,
                        "content_hash": upload.content_hash,
                        "score": report.total,
                        "warnings": warnings,
                    })),
            )
            .await?;
        tracing::info!(upload_id = %upload.id, score = report.total, "Upload admitted");

        if let Some(notifier) = &self.notifier {
            notifier.notify(upload.id).await;
        }

        Ok(UploadReceipt { upload, warnings })
    }

    pub async fn get_upload(&self, ctx: &RequestContext, upload_id: Uuid) -> Result<tally_core::models::Upload, AppError> {
        self.uploads
            .get_upload(ctx.tenant_id, upload_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Upload {} not found", upload_id)))
    }
}

/// Errors whose audit entry the admission path has already written: hard-check
/// rejections, rate-limit trips and quality quarantines.
fn recorded_by_admission(err: &AppError) -> bool {
    matches!(
        err,
        AppError::Validation(_) | AppError::RateLimited { .. } | AppError::QualityRejected { .. }
    )
}
