//! Audit trail
//!
//! Append-only sink for every mutating decision. Entries are signed before they are
//! written and mirrored on the `audit` tracing target.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tally_core::models::{AuditAction, AuditEntry, NewAuditEntry};
use tally_core::{Action, AppError, ErrorMetadata, RequestContext};
use tally_db::AuditRepository;
use tally_infra::AuditSigner;
use uuid::Uuid;

/// Result of re-verifying a tenant's audit log.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AuditVerification {
    pub checked: usize,
    pub invalid: Vec<Uuid>,
}

impl AuditVerification {
    pub fn is_intact(&self) -> bool {
        self.invalid.is_empty()
    }
}

#[derive(Clone)]
pub struct AuditTrail {
    repo: Arc<dyn AuditRepository>,
    signer: AuditSigner,
}

impl AuditTrail {
    pub fn new(repo: Arc<dyn AuditRepository>, signer: AuditSigner) -> Self {
        Self { repo, signer }
    }

    /// Sign and append one entry.
    pub async fn record(&self, entry: NewAuditEntry) -> Result<AuditEntry, AppError> {
        let signed = self.signer.sign(entry, Utc::now());
        self.repo.append_audit(&signed).await?;

        tracing::info!(
            target: "audit",
            audit_id = %signed.id,
            tenant_id = %signed.tenant_id,
            actor_id = %signed.actor_id,
            action = %signed.action,
            entity = %signed.entity_ref,
            "Audit entry recorded"
        );
        Ok(signed)
    }

    /// Record an entry whose failure must not change the caller's outcome.
    ///
    /// Used after a mutation has already been committed.
    pub async fn record_or_log(&self, entry: NewAuditEntry) {
        let action = entry.action;
        let entity = entry.entity_ref.clone();
        if let Err(e) = self.record(entry).await {
            tracing::error!(
                error = %e,
                action = %action,
                entity = %entity,
                "Failed to write audit entry for a committed change"
            );
        }
    }

    /// Record an error raised while handling `action_taken` on `entity_ref`.
    pub async fn record_error(
        &self,
        ctx: &RequestContext,
        action_taken: AuditAction,
        entity_ref: impl Into<String>,
        err: &AppError,
    ) {
        let entry = NewAuditEntry::new(ctx.tenant_id, ctx.user_id, action_taken, entity_ref)
            .with_after(json!({ "error": err.payload() }));
        self.record_or_log(entry).await;
    }

    /// Pass `result` through, recording its error against `entity_ref` on the way.
    pub async fn audited<T>(
        &self,
        ctx: &RequestContext,
        action_taken: AuditAction,
        entity_ref: &str,
        result: Result<T, AppError>,
    ) -> Result<T, AppError> {
        if let Err(err) = &result {
            self.record_error(ctx, action_taken, entity_ref, err).await;
        }
        result
    }

    /// Check `action` against the caller's roles. Denials are audited.
    pub async fn authorize(
        &self,
        ctx: &RequestContext,
        action: Action,
        entity_ref: &str,
    ) -> Result<(), AppError> {
        if let Err(err) = ctx.require(action) {
            tracing::warn!(
                user_id = %ctx.user_id,
                action = action.as_str(),
                entity = %entity_ref,
                "Permission denied"
            );
            let entry = NewAuditEntry::new(
                ctx.tenant_id,
                ctx.user_id,
                AuditAction::PermissionDenied,
                entity_ref,
            )
            .with_after(json!({
                "action": action.as_str(),
                "roles": ctx.roles,
                "code": err.error_code(),
            }));
            self.record_or_log(entry).await;
            return Err(err);
        }
        Ok(())
    }

    pub fn verify(&self, entry: &AuditEntry) -> bool {
        self.signer.verify(entry)
    }

    /// Read back a tenant's log and re-check every signature.
    pub async fn verify_tenant(&self, tenant_id: Uuid, limit: i64) -> Result<AuditVerification, AppError> {
        let entries = self.repo.list_audit(tenant_id, limit).await?;
        let invalid: Vec<Uuid> = entries
            .iter()
            .filter(|entry| !self.signer.verify(entry))
            .map(|entry| entry.id)
            .collect();

        if !invalid.is_empty() {
            tracing::error!(
                tenant_id = %tenant_id,
                invalid = invalid.len(),
                "Audit entries failed signature verification"
            );
        }
        Ok(AuditVerification {
            checked: entries.len(),
            invalid,
        })
    }

    /// List a tenant's entries, oldest first. Requires `read_audit`.
    pub async fn list(&self, ctx: &RequestContext, limit: i64) -> Result<Vec<AuditEntry>, AppError> {
        self.authorize(ctx, Action::ReadAudit, &format!("tenant:{}", ctx.tenant_id))
            .await?;
        self.repo.list_audit(ctx.tenant_id, limit).await
    }
}
