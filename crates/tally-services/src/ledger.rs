//! Inventory ledger
//!
//! Stock only ever moves through the repository's conditional deduct, so concurrent
//! callers can never push an item below zero.

use std::sync::Arc;

use serde_json::json;
use tally_core::models::{AuditAction, CommitResult, DeductOutcome, Deduction, NewAuditEntry};
use tally_core::{Action, AppError, RequestContext};
use tally_db::{InventoryRepository, SessionSeal};
use uuid::Uuid;

use crate::audit::AuditTrail;

#[derive(Clone)]
pub struct InventoryLedger {
    repo: Arc<dyn InventoryRepository>,
    audit: AuditTrail,
}

fn item_ref(item_id: Uuid) -> String {
    format!("item:{}", item_id)
}

impl InventoryLedger {
    pub fn new(repo: Arc<dyn InventoryRepository>, audit: AuditTrail) -> Self {
        Self { repo, audit }
    }

    /// Deduct `quantity` from one item outside any session.
    #[tracing::instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id))]
    pub async fn deduct(
        &self,
        ctx: &RequestContext,
        item_id: Uuid,
        quantity: i64,
    ) -> Result<DeductOutcome, AppError> {
        self.audit
            .authorize(ctx, Action::AdjustStock, &item_ref(item_id))
            .await?;
        if quantity <= 0 {
            let err = AppError::InvalidInput(format!(
                "Deduction quantity must be positive, got {}",
                quantity
            ));
            self.audit
                .record_error(ctx, AuditAction::DeductionFailed, item_ref(item_id), &err)
                .await;
            return Err(err);
        }

        match self.repo.deduct(ctx.tenant_id, item_id, quantity).await {
            Ok(outcome) => {
                self.audit
                    .record_or_log(
                        NewAuditEntry::new(
                            ctx.tenant_id,
                            ctx.user_id,
                            AuditAction::DeductionSucceeded,
                            item_ref(item_id),
                        )
                        .with_before(json!({ "quantity_on_hand": outcome.new_quantity + quantity }))
                        .with_after(json!({
                            "quantity_on_hand": outcome.new_quantity,
                            "deducted": quantity,
                        })),
                    )
                    .await;
                tracing::info!(item_id = %item_id, quantity, new_quantity = outcome.new_quantity, "Stock deducted");
                Ok(outcome)
            }
            Err(err) => {
                tracing::warn!(item_id = %item_id, quantity, error = %err, "Deduction failed");
                self.audit
                    .record_error(ctx, AuditAction::DeductionFailed, item_ref(item_id), &err)
                    .await;
                Err(err)
            }
        }
    }

    /// Apply a whole commit all-or-nothing and mark the session committed.
    ///
    /// Audits one entry per applied deduction, or one failure entry naming the item
    /// that could not be covered (the session when the commit lost its claim).
    pub async fn deduct_batch(
        &self,
        ctx: &RequestContext,
        deductions: &[Deduction],
        seal: SessionSeal,
    ) -> Result<CommitResult, AppError> {
        let session_id = seal.session_id;
        match self.repo.deduct_batch(ctx.tenant_id, deductions, seal).await {
            Ok(result) => {
                for receipt in &result.deductions {
                    self.audit
                        .record_or_log(
                            NewAuditEntry::new(
                                ctx.tenant_id,
                                ctx.user_id,
                                AuditAction::DeductionSucceeded,
                                item_ref(receipt.item_id),
                            )
                            .with_before(json!({
                                "quantity_on_hand": receipt.new_quantity + receipt.quantity,
                            }))
                            .with_after(json!({
                                "quantity_on_hand": receipt.new_quantity,
                                "deducted": receipt.quantity,
                                "line_id": receipt.line_id,
                                "session_id": result.session_id,
                            })),
                        )
                        .await;
                }
                Ok(result)
            }
            Err(err) => {
                let entity = match &err {
                    AppError::InsufficientStock { item_id, .. } => item_ref(*item_id),
                    _ => format!("session:{}", session_id),
                };
                self.audit
                    .record_error(ctx, AuditAction::DeductionFailed, entity, &err)
                    .await;
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::models::NewInventoryItem;
    use tally_core::Role;
    use tally_db::{AuditRepository, MemoryStore};
    use tally_infra::AuditSigner;

    fn ledger(store: &MemoryStore) -> InventoryLedger {
        let audit = AuditTrail::new(
            Arc::new(store.clone()),
            AuditSigner::new("0123456789abcdef0123456789abcdef").unwrap(),
        );
        InventoryLedger::new(Arc::new(store.clone()), audit)
    }

    #[tokio::test]
    async fn test_rejected_quantity_is_audited() {
        let store = MemoryStore::new();
        let ledger = ledger(&store);
        let ctx = RequestContext::new(Uuid::new_v4(), Uuid::new_v4(), vec![Role::Hod]);
        let item = store
            .create_item(
                ctx.tenant_id,
                NewInventoryItem {
                    sku: "BOLT-M8".to_string(),
                    name: "M8 bolt".to_string(),
                    quantity_on_hand: 10,
                },
            )
            .await
            .unwrap();

        let result = ledger.deduct(&ctx, item.id, 0).await;
        assert!(matches!(result, Err(AppError::InvalidInput(_))));

        let entries = store.list_audit(ctx.tenant_id, 10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, AuditAction::DeductionFailed);
        assert_eq!(entries[0].entity_ref, format!("item:{}", item.id));
        assert_eq!(entries[0].after.as_ref().unwrap()["error"]["kind"], "INVALID_INPUT");
        assert_eq!(store.get_item(ctx.tenant_id, item.id).await.unwrap().unwrap().quantity_on_hand, 10);
    }

    #[tokio::test]
    async fn test_insufficient_stock_names_item_in_audit() {
        let store = MemoryStore::new();
        let ledger = ledger(&store);
        let ctx = RequestContext::new(Uuid::new_v4(), Uuid::new_v4(), vec![Role::Admin]);
        let item = store
            .create_item(
                ctx.tenant_id,
                NewInventoryItem {
                    sku: "NUT-M8".to_string(),
                    name: "M8 nut".to_string(),
                    quantity_on_hand: 3,
                },
            )
            .await
            .unwrap();

        let result = ledger.deduct(&ctx, item.id, 5).await;
        assert!(matches!(result, Err(AppError::InsufficientStock { shortfall: 2, .. })));

        let entries = store.list_audit(ctx.tenant_id, 10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, AuditAction::DeductionFailed);
        assert_eq!(entries[0].after.as_ref().unwrap()["error"]["fields"]["shortfall"], 2);
    }
}
