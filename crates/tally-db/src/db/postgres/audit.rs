use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tally_core::models::{AuditAction, AuditEntry};
use tally_core::AppError;
use uuid::Uuid;

use crate::db::repository::AuditRepository;

fn audit_from_row(row: &PgRow) -> Result<AuditEntry, AppError> {
    let action: String = row.try_get("action")?;
    let action = AuditAction::parse(&action)
        .ok_or_else(|| AppError::Internal(format!("Unknown audit action in storage: {}", action)))?;

    Ok(AuditEntry {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        actor_id: row.try_get("actor_id")?,
        action,
        entity_ref: row.try_get("entity_ref")?,
        before: row.try_get("before_state")?,
        after: row.try_get("after_state")?,
        recorded_at: row.try_get("recorded_at")?,
        signature: row.try_get("signature")?,
    })
}

/// Postgres-backed append-only audit log. A trigger rejects UPDATE and DELETE.
#[derive(Clone)]
pub struct PgAuditRepository {
    pool: PgPool,
}

impl PgAuditRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditRepository for PgAuditRepository {
    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO audit_entries (
                id, tenant_id, actor_id, action, entity_ref, before_state, after_state,
                recorded_at, signature
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(entry.id)
        .bind(entry.tenant_id)
        .bind(entry.actor_id)
        .bind(entry.action.as_str())
        .bind(&entry.entity_ref)
        .bind(&entry.before)
        .bind(&entry.after)
        .bind(entry.recorded_at)
        .bind(&entry.signature)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_audit(&self, tenant_id: Uuid, limit: i64) -> Result<Vec<AuditEntry>, AppError> {
        let rows = sqlx::query(
            r#"
            SELECT id, tenant_id, actor_id, action, entity_ref, before_state, after_state,
                recorded_at, signature
            FROM audit_entries
            WHERE tenant_id = $1
            ORDER BY recorded_at ASC, id ASC
            LIMIT $2
            "#,
        )
        .bind(tenant_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(audit_from_row).collect()
    }
}
