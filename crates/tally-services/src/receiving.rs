//! Receiving workflow
//!
//! Sessions collect draft lines extracted from completed uploads. Lines can be edited
//! only while the session is open; commit is delegated to the coordinator.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tally_core::models::{
    AuditAction, CommitOutcome, DraftLine, LineDecision, NewAuditEntry, NewDraftLine,
    ReceivingSession, SessionStatus, UploadStatus, VerificationOutcome, VerificationState,
};
use tally_core::{Action, AppError, RequestContext};
use tally_db::{InventoryRepository, SessionRepository, UploadRepository};
use uuid::Uuid;

use crate::abuse::AbuseGuard;
use crate::audit::AuditTrail;
use crate::commit::SessionCommitCoordinator;

#[derive(Clone)]
pub struct ReceivingService {
    sessions: Arc<dyn SessionRepository>,
    uploads: Arc<dyn UploadRepository>,
    inventory: Arc<dyn InventoryRepository>,
    abuse: AbuseGuard,
    audit: AuditTrail,
    coordinator: SessionCommitCoordinator,
}

fn session_ref(session_id: Uuid) -> String {
    format!("session:{}", session_id)
}

impl ReceivingService {
    pub fn new(
        sessions: Arc<dyn SessionRepository>,
        uploads: Arc<dyn UploadRepository>,
        inventory: Arc<dyn InventoryRepository>,
        abuse: AbuseGuard,
        audit: AuditTrail,
        coordinator: SessionCommitCoordinator,
    ) -> Self {
        Self {
            sessions,
            uploads,
            inventory,
            abuse,
            audit,
            coordinator,
        }
    }

    #[tracing::instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id, user_id = %ctx.user_id))]
    pub async fn start_session(&self, ctx: &RequestContext) -> Result<ReceivingSession, AppError> {
        let entity = format!("tenant:{}", ctx.tenant_id);
        self.audit
            .authorize(ctx, Action::StartSession, &entity)
            .await?;
        let result = self.try_start_session(ctx).await;
        self.audit
            .audited(ctx, AuditAction::SessionUpdateFailed, &entity, result)
            .await
    }

    async fn try_start_session(&self, ctx: &RequestContext) -> Result<ReceivingSession, AppError> {
        let session = self
            .sessions
            .insert_session(ReceivingSession::new(ctx.tenant_id, ctx.user_id, Utc::now()))
            .await?;

        self.audit
            .record(
                NewAuditEntry::new(
                    ctx.tenant_id,
                    ctx.user_id,
                    AuditAction::SessionStarted,
                    session.entity_ref(),
                )
                .with_after(json!({ "status": session.status })),
            )
            .await?;
        tracing::info!(session_id = %session.id, "Receiving session started");
        Ok(session)
    }

    pub async fn get_session(&self, ctx: &RequestContext, session_id: Uuid) -> Result<ReceivingSession, AppError> {
        self.sessions
            .get_session(ctx.tenant_id, session_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Session {} not found", session_id)))
    }

    pub async fn list_lines(&self, ctx: &RequestContext, session_id: Uuid) -> Result<Vec<DraftLine>, AppError> {
        self.get_session(ctx, session_id).await?;
        self.sessions.list_lines(ctx.tenant_id, session_id).await
    }

    /// Attach lines extracted from a completed upload.
    #[tracing::instrument(skip(self, ctx, lines), fields(tenant_id = %ctx.tenant_id, lines = lines.len()))]
    pub async fn attach_lines(
        &self,
        ctx: &RequestContext,
        session_id: Uuid,
        upload_id: Uuid,
        lines: Vec<NewDraftLine>,
    ) -> Result<Vec<DraftLine>, AppError> {
        let entity = session_ref(session_id);
        self.audit
            .authorize(ctx, Action::VerifyLines, &entity)
            .await?;
        let result = self.try_attach_lines(ctx, session_id, upload_id, lines).await;
        self.audit
            .audited(ctx, AuditAction::SessionUpdateFailed, &entity, result)
            .await
    }

    async fn try_attach_lines(
        &self,
        ctx: &RequestContext,
        session_id: Uuid,
        upload_id: Uuid,
        lines: Vec<NewDraftLine>,
    ) -> Result<Vec<DraftLine>, AppError> {
        if lines.is_empty() {
            return Err(AppError::InvalidInput("No lines to attach".to_string()));
        }

        let upload = self
            .uploads
            .get_upload(ctx.tenant_id, upload_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Upload {} not found", upload_id)))?;
        if upload.status != UploadStatus::Completed {
            return Err(AppError::InvalidState(format!(
                "Upload {} is {}; only completed uploads yield draft lines",
                upload_id, upload.status
            )));
        }

        let now = Utc::now();
        let mut drafts = Vec::with_capacity(lines.len());
        for line in lines {
            let part_reference = line.part_reference.trim().to_string();
            if part_reference.is_empty() {
                return Err(AppError::InvalidInput("Part reference must not be empty".to_string()));
            }
            if line.quantity <= 0 {
                return Err(AppError::InvalidInput(format!(
                    "Line quantity must be positive, got {}",
                    line.quantity
                )));
            }
            if let Some(item_id) = line.item_id {
                self.require_item(ctx, item_id).await?;
            }
            drafts.push(DraftLine {
                id: Uuid::new_v4(),
                session_id,
                upload_id,
                tenant_id: ctx.tenant_id,
                part_reference,
                item_id: line.item_id,
                quantity: line.quantity,
                state: VerificationState::Unverified,
                created_at: now,
                verified_at: None,
                verified_by: None,
            });
        }

        let inserted = self
            .sessions
            .insert_lines(ctx.tenant_id, session_id, drafts)
            .await?;

        self.audit
            .record(
                NewAuditEntry::new(
                    ctx.tenant_id,
                    ctx.user_id,
                    AuditAction::LinesAttached,
                    session_ref(session_id),
                )
                .with_after(json!({
                    "upload_id": upload_id,
                    "line_ids": inserted.iter().map(|l| l.id).collect::<Vec<_>>(),
                })),
            )
            .await?;
        Ok(inserted)
    }

    /// Point a line at a tenant inventory item.
    pub async fn resolve_part(
        &self,
        ctx: &RequestContext,
        session_id: Uuid,
        line_id: Uuid,
        item_id: Uuid,
    ) -> Result<DraftLine, AppError> {
        let entity = session_ref(session_id);
        self.audit
            .authorize(ctx, Action::ResolveParts, &entity)
            .await?;
        let result = self.try_resolve_part(ctx, session_id, line_id, item_id).await;
        self.audit
            .audited(ctx, AuditAction::SessionUpdateFailed, &entity, result)
            .await
    }

    async fn try_resolve_part(
        &self,
        ctx: &RequestContext,
        session_id: Uuid,
        line_id: Uuid,
        item_id: Uuid,
    ) -> Result<DraftLine, AppError> {
        let item = self.require_item(ctx, item_id).await?;

        let line = self
            .sessions
            .resolve_line(ctx.tenant_id, session_id, line_id, item_id)
            .await?;

        self.audit
            .record(
                NewAuditEntry::new(ctx.tenant_id, ctx.user_id, AuditAction::PartResolved, line.entity_ref())
                    .with_after(json!({
                        "part_reference": line.part_reference,
                        "item_id": item.id,
                        "sku": item.sku,
                    })),
            )
            .await?;
        Ok(line)
    }

    /// Confirm or reject lines. `elapsed` is how long the reviewer spent on this batch;
    /// implausibly fast bulk confirmation flags the session for secondary confirmation.
    #[tracing::instrument(skip(self, ctx, decisions), fields(tenant_id = %ctx.tenant_id, decisions = decisions.len()))]
    pub async fn verify_lines(
        &self,
        ctx: &RequestContext,
        session_id: Uuid,
        decisions: Vec<LineDecision>,
        elapsed: Duration,
    ) -> Result<VerificationOutcome, AppError> {
        let entity = session_ref(session_id);
        self.audit
            .authorize(ctx, Action::VerifyLines, &entity)
            .await?;
        let result = self.try_verify_lines(ctx, session_id, decisions, elapsed).await;
        self.audit
            .audited(ctx, AuditAction::SessionUpdateFailed, &entity, result)
            .await
    }

    async fn try_verify_lines(
        &self,
        ctx: &RequestContext,
        session_id: Uuid,
        decisions: Vec<LineDecision>,
        elapsed: Duration,
    ) -> Result<VerificationOutcome, AppError> {
        let entity = session_ref(session_id);
        if decisions.is_empty() {
            return Err(AppError::InvalidInput("No line decisions supplied".to_string()));
        }

        let confirmed_count = decisions
            .iter()
            .filter(|d| d.state == VerificationState::Confirmed)
            .count();
        let (per_item_seconds, requires_secondary_confirmation) =
            self.abuse.assess_confirmation(confirmed_count, elapsed);

        let lines = self
            .sessions
            .apply_decisions(
                ctx.tenant_id,
                session_id,
                &decisions,
                ctx.user_id,
                requires_secondary_confirmation,
                Utc::now(),
            )
            .await?;

        self.audit
            .record(
                NewAuditEntry::new(ctx.tenant_id, ctx.user_id, AuditAction::LinesVerified, &entity)
                    .with_after(json!({
                        "decisions": decisions
                            .iter()
                            .map(|d| json!({ "line_id": d.line_id, "state": d.state }))
                            .collect::<Vec<_>>(),
                        "elapsed_seconds": elapsed.as_secs_f64(),
                    })),
            )
            .await?;

        if requires_secondary_confirmation {
            tracing::warn!(
                session_id = %session_id,
                confirmed_count,
                per_item_seconds = ?per_item_seconds,
                "Bulk confirmation below plausibility floor"
            );
            self.audit
                .record(
                    NewAuditEntry::new(
                        ctx.tenant_id,
                        ctx.user_id,
                        AuditAction::BulkConfirmationRequired,
                        &entity,
                    )
                    .with_after(json!({
                        "confirmed_count": confirmed_count,
                        "per_item_seconds": per_item_seconds,
                        "floor_seconds": self.abuse.config().bulk_confirm_floor_secs,
                    })),
                )
                .await?;
        }

        Ok(VerificationOutcome {
            lines,
            confirmed_count,
            per_item_seconds,
            requires_secondary_confirmation,
        })
    }

    /// Clear the bulk-confirmation interstitial.
    pub async fn acknowledge_bulk_confirmation(
        &self,
        ctx: &RequestContext,
        session_id: Uuid,
    ) -> Result<ReceivingSession, AppError> {
        let entity = session_ref(session_id);
        self.audit
            .authorize(ctx, Action::AcknowledgeBulkConfirmation, &entity)
            .await?;
        let result = self.try_acknowledge(ctx, session_id).await;
        self.audit
            .audited(ctx, AuditAction::SessionUpdateFailed, &entity, result)
            .await
    }

    async fn try_acknowledge(&self, ctx: &RequestContext, session_id: Uuid) -> Result<ReceivingSession, AppError> {
        let entity = session_ref(session_id);
        let before = self.get_session(ctx, session_id).await?;
        if !before.requires_secondary_confirmation {
            return Ok(before);
        }
        let session = self
            .sessions
            .acknowledge_confirmation(ctx.tenant_id, session_id, Utc::now())
            .await?;

        self.audit
            .record(
                NewAuditEntry::new(
                    ctx.tenant_id,
                    ctx.user_id,
                    AuditAction::BulkConfirmationAcknowledged,
                    &entity,
                )
                .with_before(json!({ "requires_secondary_confirmation": true }))
                .with_after(json!({ "requires_secondary_confirmation": false })),
            )
            .await?;
        Ok(session)
    }

    /// Cancel an open session and delete its lines. Uploads are kept.
    #[tracing::instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id))]
    pub async fn cancel_session(&self, ctx: &RequestContext, session_id: Uuid) -> Result<ReceivingSession, AppError> {
        let entity = session_ref(session_id);
        self.audit
            .authorize(ctx, Action::CancelSession, &entity)
            .await?;
        let result = self.try_cancel(ctx, session_id).await;
        self.audit
            .audited(ctx, AuditAction::SessionUpdateFailed, &entity, result)
            .await
    }

    async fn try_cancel(&self, ctx: &RequestContext, session_id: Uuid) -> Result<ReceivingSession, AppError> {
        let entity = session_ref(session_id);
        let lines = self.sessions.list_lines(ctx.tenant_id, session_id).await?;
        let Some(session) = self
            .sessions
            .cancel_session(ctx.tenant_id, session_id, Utc::now())
            .await?
        else {
            let current = self.get_session(ctx, session_id).await?;
            return Err(AppError::InvalidState(format!(
                "Session {} is {} and cannot be cancelled",
                session_id, current.status
            )));
        };

        self.audit
            .record(
                NewAuditEntry::new(ctx.tenant_id, ctx.user_id, AuditAction::SessionCancelled, &entity)
                    .with_before(json!({
                        "status": SessionStatus::Open,
                        "line_ids": lines.iter().map(|l| l.id).collect::<Vec<_>>(),
                    }))
                    .with_after(json!({ "status": session.status })),
            )
            .await?;
        tracing::info!(session_id = %session_id, lines_removed = lines.len(), "Session cancelled");
        Ok(session)
    }

    pub async fn commit(&self, ctx: &RequestContext, session_id: Uuid) -> Result<CommitOutcome, AppError> {
        self.coordinator.commit(ctx, session_id).await
    }

    async fn require_item(
        &self,
        ctx: &RequestContext,
        item_id: Uuid,
    ) -> Result<tally_core::models::InventoryItem, AppError> {
        self.inventory
            .get_item(ctx.tenant_id, item_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Inventory item {} not found", item_id)))
    }
}
