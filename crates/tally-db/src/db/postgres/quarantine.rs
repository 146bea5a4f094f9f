use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tally_core::models::{QuarantineRecord, QuarantineResolution};
use tally_core::AppError;
use uuid::Uuid;

use crate::db::repository::QuarantineRepository;

const QUARANTINE_COLUMNS: &str = r#"
    id, tenant_id, upload_id, storage_ref, reason, detail, actor_id, quarantined_at,
    resolution, reviewed_by, reviewed_at
"#;

/// Postgres-backed quarantine records
#[derive(Clone)]
pub struct PgQuarantineRepository {
    pool: PgPool,
}

impl PgQuarantineRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl QuarantineRepository for PgQuarantineRepository {
    #[tracing::instrument(skip(self, record), fields(upload_id = %record.upload_id))]
    async fn insert_quarantine(&self, record: QuarantineRecord) -> Result<QuarantineRecord, AppError> {
        let sql = format!(
            r#"
            INSERT INTO quarantine_records (
                id, tenant_id, upload_id, storage_ref, reason, detail, actor_id, quarantined_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {}
            "#,
            QUARANTINE_COLUMNS
        );

        let stored = sqlx::query_as::<_, QuarantineRecord>(&sql)
            .bind(record.id)
            .bind(record.tenant_id)
            .bind(record.upload_id)
            .bind(&record.storage_ref)
            .bind(record.reason)
            .bind(&record.detail)
            .bind(record.actor_id)
            .bind(record.quarantined_at)
            .fetch_one(&self.pool)
            .await?;

        Ok(stored)
    }

    async fn get_quarantine(
        &self,
        tenant_id: Uuid,
        record_id: Uuid,
    ) -> Result<Option<QuarantineRecord>, AppError> {
        let sql = format!(
            "SELECT {} FROM quarantine_records WHERE id = $1 AND tenant_id = $2",
            QUARANTINE_COLUMNS
        );
        let record = sqlx::query_as::<_, QuarantineRecord>(&sql)
            .bind(record_id)
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    async fn list_pending_quarantine(&self, tenant_id: Uuid) -> Result<Vec<QuarantineRecord>, AppError> {
        let sql = format!(
            r#"
            SELECT {} FROM quarantine_records
            WHERE tenant_id = $1 AND resolution IS NULL
            ORDER BY quarantined_at ASC
            "#,
            QUARANTINE_COLUMNS
        );
        let records = sqlx::query_as::<_, QuarantineRecord>(&sql)
            .bind(tenant_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(records)
    }

    async fn resolve_quarantine(
        &self,
        tenant_id: Uuid,
        record_id: Uuid,
        resolution: QuarantineResolution,
        reviewer_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<QuarantineRecord>, AppError> {
        let sql = format!(
            r#"
            UPDATE quarantine_records
            SET resolution = $3, reviewed_by = $4, reviewed_at = $5
            WHERE id = $1 AND tenant_id = $2 AND resolution IS NULL
            RETURNING {}
            "#,
            QUARANTINE_COLUMNS
        );
        let record = sqlx::query_as::<_, QuarantineRecord>(&sql)
            .bind(record_id)
            .bind(tenant_id)
            .bind(resolution)
            .bind(reviewer_id)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }
}
