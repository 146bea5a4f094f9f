//! Stock administration
//!
//! Creating items and adding stock. Removing stock goes through [`InventoryLedger`].
//!
//! [`InventoryLedger`]: crate::ledger::InventoryLedger

use std::sync::Arc;

use serde_json::json;
use tally_core::models::{AuditAction, InventoryItem, NewAuditEntry, NewInventoryItem};
use tally_core::{Action, AppError, RequestContext};
use tally_db::InventoryRepository;
use uuid::Uuid;

use crate::audit::AuditTrail;

#[derive(Clone)]
pub struct StockService {
    inventory: Arc<dyn InventoryRepository>,
    audit: AuditTrail,
}

impl StockService {
    pub fn new(inventory: Arc<dyn InventoryRepository>, audit: AuditTrail) -> Self {
        Self { inventory, audit }
    }

    #[tracing::instrument(skip(self, ctx, item), fields(tenant_id = %ctx.tenant_id, sku = %item.sku))]
    pub async fn create_item(&self, ctx: &RequestContext, item: NewInventoryItem) -> Result<InventoryItem, AppError> {
        let entity = format!("tenant:{}", ctx.tenant_id);
        self.audit
            .authorize(ctx, Action::AdjustStock, &entity)
            .await?;
        let result = self.try_create_item(ctx, item).await;
        self.audit
            .audited(ctx, AuditAction::StockUpdateFailed, &entity, result)
            .await
    }

    async fn try_create_item(&self, ctx: &RequestContext, item: NewInventoryItem) -> Result<InventoryItem, AppError> {
        let item = NewInventoryItem {
            sku: item.sku.trim().to_string(),
            name: item.name.trim().to_string(),
            quantity_on_hand: item.quantity_on_hand,
        };
        if item.sku.is_empty() {
            return Err(AppError::InvalidInput("SKU must not be empty".to_string()));
        }
        if item.name.is_empty() {
            return Err(AppError::InvalidInput("Item name must not be empty".to_string()));
        }
        if item.quantity_on_hand < 0 {
            return Err(AppError::InvalidInput(format!(
                "Initial quantity must not be negative, got {}",
                item.quantity_on_hand
            )));
        }

        let created = self.inventory.create_item(ctx.tenant_id, item).await?;
        self.audit
            .record(
                NewAuditEntry::new(ctx.tenant_id, ctx.user_id, AuditAction::ItemCreated, created.entity_ref())
                    .with_after(json!({
                        "sku": created.sku,
                        "name": created.name,
                        "quantity_on_hand": created.quantity_on_hand,
                    })),
            )
            .await?;
        tracing::info!(item_id = %created.id, "Inventory item created");
        Ok(created)
    }

    #[tracing::instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id))]
    pub async fn restock(
        &self,
        ctx: &RequestContext,
        item_id: Uuid,
        quantity: i64,
    ) -> Result<InventoryItem, AppError> {
        let entity = format!("item:{}", item_id);
        self.audit
            .authorize(ctx, Action::AdjustStock, &entity)
            .await?;
        let result = self.try_restock(ctx, &entity, item_id, quantity).await;
        self.audit
            .audited(ctx, AuditAction::StockUpdateFailed, &entity, result)
            .await
    }

    async fn try_restock(
        &self,
        ctx: &RequestContext,
        entity: &str,
        item_id: Uuid,
        quantity: i64,
    ) -> Result<InventoryItem, AppError> {
        if quantity <= 0 {
            return Err(AppError::InvalidInput(format!(
                "Restock quantity must be positive, got {}",
                quantity
            )));
        }

        let item = self.inventory.restock(ctx.tenant_id, item_id, quantity).await?;
        self.audit
            .record(
                NewAuditEntry::new(ctx.tenant_id, ctx.user_id, AuditAction::ItemRestocked, entity)
                    .with_before(json!({ "quantity_on_hand": item.quantity_on_hand - quantity }))
                    .with_after(json!({
                        "quantity_on_hand": item.quantity_on_hand,
                        "added": quantity,
                    })),
            )
            .await?;
        Ok(item)
    }

    pub async fn get_item(&self, ctx: &RequestContext, item_id: Uuid) -> Result<InventoryItem, AppError> {
        self.inventory
            .get_item(ctx.tenant_id, item_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Inventory item {} not found", item_id)))
    }

    pub async fn find_by_sku(&self, ctx: &RequestContext, sku: &str) -> Result<Option<InventoryItem>, AppError> {
        self.inventory.find_item_by_sku(ctx.tenant_id, sku.trim()).await
    }

    pub async fn list_items(&self, ctx: &RequestContext) -> Result<Vec<InventoryItem>, AppError> {
        self.inventory.list_items(ctx.tenant_id).await
    }
}
