use async_trait::async_trait;
use chrono::Utc;
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool, Row};
use tally_core::models::{
    CommitResult, DeductOutcome, Deduction, DeductionReceipt, InventoryItem, NewInventoryItem,
    SessionStatus,
};
use tally_core::AppError;
use uuid::Uuid;

use crate::db::repository::{order_deductions, InventoryRepository, SessionSeal};
use crate::db::transaction::{is_unique_violation, TransactionGuard};

const ITEM_COLUMNS: &str = "id, tenant_id, sku, name, quantity_on_hand, created_at, updated_at";

/// Postgres-backed inventory ledger
#[derive(Clone)]
pub struct PgInventoryRepository {
    pool: PgPool,
}

impl PgInventoryRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Check and decrement in one statement. Returns the new quantity, or the shortfall
/// error when the row holds less than `quantity`.
async fn conditional_deduct(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    item_id: Uuid,
    line_id: Option<Uuid>,
    quantity: i64,
) -> Result<i64, AppError> {
    let updated: Option<i64> = sqlx::query_scalar(
        r#"
        UPDATE inventory_items
        SET quantity_on_hand = quantity_on_hand - $3, updated_at = NOW()
        WHERE id = $1 AND tenant_id = $2 AND quantity_on_hand >= $3
        RETURNING quantity_on_hand
        "#,
    )
    .bind(item_id)
    .bind(tenant_id)
    .bind(quantity)
    .fetch_optional(&mut *conn)
    .await?;

    if let Some(new_quantity) = updated {
        return Ok(new_quantity);
    }

    // Distinguish a missing item from a short one; the read only shapes the error.
    let available: Option<i64> = sqlx::query_scalar(
        "SELECT quantity_on_hand FROM inventory_items WHERE id = $1 AND tenant_id = $2",
    )
    .bind(item_id)
    .bind(tenant_id)
    .fetch_optional(&mut *conn)
    .await?;

    match available {
        None => Err(AppError::NotFound(format!("Inventory item {} not found", item_id))),
        Some(available) => Err(AppError::InsufficientStock {
            item_id,
            line_id,
            requested: quantity,
            available,
            shortfall: quantity - available,
        }),
    }
}

#[async_trait]
impl InventoryRepository for PgInventoryRepository {
    #[tracing::instrument(skip(self, item), fields(sku = %item.sku))]
    async fn create_item(&self, tenant_id: Uuid, item: NewInventoryItem) -> Result<InventoryItem, AppError> {
        let sql = format!(
            r#"
            INSERT INTO inventory_items (id, tenant_id, sku, name, quantity_on_hand)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {}
            "#,
            ITEM_COLUMNS
        );
        let result = sqlx::query_as::<_, InventoryItem>(&sql)
            .bind(Uuid::new_v4())
            .bind(tenant_id)
            .bind(&item.sku)
            .bind(&item.name)
            .bind(item.quantity_on_hand)
            .fetch_one(&self.pool)
            .await;

        match result {
            Ok(created) => Ok(created),
            Err(err) if is_unique_violation(&err) => Err(AppError::InvalidInput(format!(
                "SKU '{}' already exists",
                item.sku
            ))),
            Err(err) => Err(err.into()),
        }
    }

    async fn get_item(&self, tenant_id: Uuid, item_id: Uuid) -> Result<Option<InventoryItem>, AppError> {
        let sql = format!(
            "SELECT {} FROM inventory_items WHERE id = $1 AND tenant_id = $2",
            ITEM_COLUMNS
        );
        let item = sqlx::query_as::<_, InventoryItem>(&sql)
            .bind(item_id)
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(item)
    }

    async fn find_item_by_sku(&self, tenant_id: Uuid, sku: &str) -> Result<Option<InventoryItem>, AppError> {
        let sql = format!(
            "SELECT {} FROM inventory_items WHERE tenant_id = $1 AND sku = $2",
            ITEM_COLUMNS
        );
        let item = sqlx::query_as::<_, InventoryItem>(&sql)
            .bind(tenant_id)
            .bind(sku)
            .fetch_optional(&self.pool)
            .await?;
        Ok(item)
    }

    async fn list_items(&self, tenant_id: Uuid) -> Result<Vec<InventoryItem>, AppError> {
        let sql = format!(
            "SELECT {} FROM inventory_items WHERE tenant_id = $1 ORDER BY sku ASC",
            ITEM_COLUMNS
        );
        let items = sqlx::query_as::<_, InventoryItem>(&sql)
            .bind(tenant_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(items)
    }

    #[tracing::instrument(skip(self))]
    async fn deduct(
        &self,
        tenant_id: Uuid,
        item_id: Uuid,
        quantity: i64,
    ) -> Result<DeductOutcome, AppError> {
        let mut conn = self.pool.acquire().await?;
        let new_quantity = conditional_deduct(&mut conn, tenant_id, item_id, None, quantity).await?;
        Ok(DeductOutcome {
            item_id,
            new_quantity,
        })
    }

    #[tracing::instrument(skip(self))]
    async fn restock(&self, tenant_id: Uuid, item_id: Uuid, quantity: i64) -> Result<InventoryItem, AppError> {
        let sql = format!(
            r#"
            UPDATE inventory_items
            SET quantity_on_hand = quantity_on_hand + $3, updated_at = NOW()
            WHERE id = $1 AND tenant_id = $2
            RETURNING {}
            "#,
            ITEM_COLUMNS
        );
        let item = sqlx::query_as::<_, InventoryItem>(&sql)
            .bind(item_id)
            .bind(tenant_id)
            .bind(quantity)
            .fetch_optional(&self.pool)
            .await?;
        item.ok_or_else(|| AppError::NotFound(format!("Inventory item {} not found", item_id)))
    }

    #[tracing::instrument(skip(self, deductions), fields(session_id = %seal.session_id, lines = deductions.len()))]
    async fn deduct_batch(
        &self,
        tenant_id: Uuid,
        deductions: &[Deduction],
        seal: SessionSeal,
    ) -> Result<CommitResult, AppError> {
        let mut tx = TransactionGuard::begin(&self.pool).await?;

        // The seal must still own the committing marker.
        let row = sqlx::query(
            r#"
            SELECT status, commit_token
            FROM receiving_sessions
            WHERE id = $1 AND tenant_id = $2
            FOR UPDATE
            "#,
        )
        .bind(seal.session_id)
        .bind(tenant_id)
        .fetch_optional(tx.conn()?)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Err(AppError::NotFound(format!(
                "Session {} not found",
                seal.session_id
            )));
        };
        let status: SessionStatus = row.try_get("status")?;
        let token: Option<Uuid> = row.try_get("commit_token")?;
        if status != SessionStatus::Committing || token != Some(seal.commit_token) {
            tx.rollback().await?;
            return Err(AppError::CommitConflict {
                session_id: seal.session_id,
                reason: "Commit marker is no longer held by this attempt".to_string(),
            });
        }

        let mut receipts = Vec::with_capacity(deductions.len());
        for deduction in order_deductions(deductions) {
            let outcome = conditional_deduct(
                tx.conn()?,
                tenant_id,
                deduction.item_id,
                Some(deduction.line_id),
                deduction.quantity,
            )
            .await;

            match outcome {
                Ok(new_quantity) => receipts.push(DeductionReceipt {
                    line_id: deduction.line_id,
                    item_id: deduction.item_id,
                    quantity: deduction.quantity,
                    new_quantity,
                }),
                Err(err) => {
                    tx.rollback().await?;
                    return Err(err);
                }
            }
        }

        let result = CommitResult {
            session_id: seal.session_id,
            deductions: receipts,
            committed_by: seal.committed_by,
            committed_at: seal.committed_at,
        };

        sqlx::query(
            r#"
            UPDATE receiving_sessions
            SET status = 'committed', commit_result = $3, committed_at = $4,
                commit_token = NULL, commit_started_at = NULL, updated_at = $5
            WHERE id = $1 AND tenant_id = $2
            "#,
        )
        .bind(seal.session_id)
        .bind(tenant_id)
        .bind(Json(&result))
        .bind(seal.committed_at)
        .bind(Utc::now())
        .execute(tx.conn()?)
        .await?;

        tx.commit().await?;
        Ok(result)
    }
}
