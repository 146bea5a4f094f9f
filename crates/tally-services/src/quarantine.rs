//! Quarantine review

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tally_core::models::{
    AuditAction, NewAuditEntry, QuarantineRecord, QuarantineResolution, Upload,
};
use tally_core::{Action, AppError, RequestContext};
use tally_db::{QuarantineRepository, UploadRepository};
use uuid::Uuid;

use crate::audit::AuditTrail;
use crate::fingerprint::FingerprintStore;
use crate::intake::UploadNotifier;

#[derive(Clone)]
pub struct QuarantineService {
    quarantine: Arc<dyn QuarantineRepository>,
    uploads: Arc<dyn UploadRepository>,
    fingerprints: FingerprintStore,
    audit: AuditTrail,
    notifier: Option<Arc<dyn UploadNotifier>>,
}

fn quarantine_ref(record_id: Uuid) -> String {
    format!("quarantine:{}", record_id)
}

impl QuarantineService {
    pub fn new(
        quarantine: Arc<dyn QuarantineRepository>,
        uploads: Arc<dyn UploadRepository>,
        fingerprints: FingerprintStore,
        audit: AuditTrail,
    ) -> Self {
        Self {
            quarantine,
            uploads,
            fingerprints,
            audit,
            notifier: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn UploadNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub async fn list_pending(&self, ctx: &RequestContext) -> Result<Vec<QuarantineRecord>, AppError> {
        self.audit
            .authorize(ctx, Action::ReviewQuarantine, &format!("tenant:{}", ctx.tenant_id))
            .await?;
        self.quarantine.list_pending_quarantine(ctx.tenant_id).await
    }

    /// Send a quarantined upload back to the OCR queue.
    ///
    /// The upload is requeued before the record is resolved, so a failed resolve leaves the
    /// record pending and the release can be repeated.
    #[tracing::instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id, user_id = %ctx.user_id))]
    pub async fn release(&self, ctx: &RequestContext, record_id: Uuid) -> Result<Upload, AppError> {
        let entity = quarantine_ref(record_id);
        self.audit
            .authorize(ctx, Action::ReviewQuarantine, &entity)
            .await?;
        let result = self.try_release(ctx, record_id, &entity).await;
        self.audit
            .audited(ctx, AuditAction::QuarantineReviewFailed, &entity, result)
            .await
    }

    async fn try_release(&self, ctx: &RequestContext, record_id: Uuid, entity: &str) -> Result<Upload, AppError> {
        let pending = self.pending(ctx, record_id).await?;

        let upload = match self
            .uploads
            .requeue_quarantined(ctx.tenant_id, pending.upload_id)
            .await?
        {
            Some(upload) => upload,
            None => {
                let upload = self
                    .uploads
                    .get_upload(ctx.tenant_id, pending.upload_id)
                    .await?
                    .ok_or_else(|| {
                        tracing::error!(
                            record_id = %record_id,
                            upload_id = %pending.upload_id,
                            "Quarantine record points at a missing upload"
                        );
                        AppError::InvalidState(format!(
                            "Upload {} is not quarantined",
                            pending.upload_id
                        ))
                    })?;
                tracing::warn!(
                    upload_id = %upload.id,
                    status = ?upload.status,
                    "Upload already left quarantine, finishing an earlier release"
                );
                upload
            }
        };
        self.fingerprints
            .register(ctx.tenant_id, &upload.content_hash, upload.id, Utc::now())
            .await?;

        let record = self
            .resolve(ctx, record_id, QuarantineResolution::Released)
            .await?;

        self.audit
            .record(
                NewAuditEntry::new(ctx.tenant_id, ctx.user_id, AuditAction::QuarantineReleased, entity)
                    .with_before(json!({
                        "resolution": null,
                        "upload_status": "quarantined",
                        "reason_code": record.reason.reason_code(),
                    }))
                    .with_after(json!({
                        "resolution": record.resolution,
                        "upload_id": upload.id,
                        "upload_status": upload.status,
                    })),
            )
            .await?;
        tracing::info!(upload_id = %upload.id, "Quarantined upload released to the OCR queue");

        if let Some(notifier) = &self.notifier {
            notifier.notify(upload.id).await;
        }
        Ok(upload)
    }

    /// Close a record without releasing the upload. The bytes stay retained.
    #[tracing::instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id, user_id = %ctx.user_id))]
    pub async fn dismiss(&self, ctx: &RequestContext, record_id: Uuid) -> Result<QuarantineRecord, AppError> {
        let entity = quarantine_ref(record_id);
        self.audit
            .authorize(ctx, Action::ReviewQuarantine, &entity)
            .await?;
        let result = self.try_dismiss(ctx, record_id, &entity).await;
        self.audit
            .audited(ctx, AuditAction::QuarantineReviewFailed, &entity, result)
            .await
    }

    async fn try_dismiss(
        &self,
        ctx: &RequestContext,
        record_id: Uuid,
        entity: &str,
    ) -> Result<QuarantineRecord, AppError> {
        let record = self
            .resolve(ctx, record_id, QuarantineResolution::Dismissed)
            .await?;

        self.audit
            .record(
                NewAuditEntry::new(ctx.tenant_id, ctx.user_id, AuditAction::QuarantineDismissed, entity)
                    .with_before(json!({ "resolution": null }))
                    .with_after(json!({
                        "resolution": record.resolution,
                        "upload_id": record.upload_id,
                    })),
            )
            .await?;
        Ok(record)
    }

    /// Load a record that has not been resolved yet.
    async fn pending(&self, ctx: &RequestContext, record_id: Uuid) -> Result<QuarantineRecord, AppError> {
        match self.quarantine.get_quarantine(ctx.tenant_id, record_id).await? {
            None => Err(not_found(record_id)),
            Some(record) if record.resolution.is_some() => Err(already_resolved(&record)),
            Some(record) => Ok(record),
        }
    }

    async fn resolve(
        &self,
        ctx: &RequestContext,
        record_id: Uuid,
        resolution: QuarantineResolution,
    ) -> Result<QuarantineRecord, AppError> {
        if let Some(record) = self
            .quarantine
            .resolve_quarantine(ctx.tenant_id, record_id, resolution, ctx.user_id, Utc::now())
            .await?
        {
            return Ok(record);
        }

        match self.quarantine.get_quarantine(ctx.tenant_id, record_id).await? {
            None => Err(not_found(record_id)),
            Some(existing) => Err(already_resolved(&existing)),
        }
    }
}

fn not_found(record_id: Uuid) -> AppError {
    AppError::NotFound(format!("Quarantine record {} not found", record_id))
}

fn already_resolved(record: &QuarantineRecord) -> AppError {
    AppError::InvalidState(format!(
        "Quarantine record {} was already {}",
        record.id,
        match record.resolution {
            Some(QuarantineResolution::Released) => "released",
            Some(QuarantineResolution::Dismissed) => "dismissed",
            None => "resolved",
        }
    ))
}
