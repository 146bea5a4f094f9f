use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tally_core::models::FingerprintRecord;
use tally_core::AppError;
use uuid::Uuid;

use crate::db::repository::FingerprintRepository;

/// Postgres-backed fingerprint index, unique on (tenant, content hash)
#[derive(Clone)]
pub struct PgFingerprintRepository {
    pool: PgPool,
}

impl PgFingerprintRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FingerprintRepository for PgFingerprintRepository {
    async fn find_fingerprint(
        &self,
        tenant_id: Uuid,
        content_hash: &str,
    ) -> Result<Option<FingerprintRecord>, AppError> {
        let record = sqlx::query_as::<_, FingerprintRecord>(
            r#"
            SELECT tenant_id, content_hash, upload_id, registered_at
            FROM upload_fingerprints
            WHERE tenant_id = $1 AND content_hash = $2
            "#,
        )
        .bind(tenant_id)
        .bind(content_hash)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn upsert_fingerprint(
        &self,
        tenant_id: Uuid,
        content_hash: &str,
        upload_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<FingerprintRecord, AppError> {
        let record = sqlx::query_as::<_, FingerprintRecord>(
            r#"
            INSERT INTO upload_fingerprints (tenant_id, content_hash, upload_id, registered_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (tenant_id, content_hash)
            DO UPDATE SET upload_id = EXCLUDED.upload_id, registered_at = EXCLUDED.registered_at
            RETURNING tenant_id, content_hash, upload_id, registered_at
            "#,
        )
        .bind(tenant_id)
        .bind(content_hash)
        .bind(upload_id)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    async fn remove_fingerprint(
        &self,
        tenant_id: Uuid,
        content_hash: &str,
        upload_id: Uuid,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            DELETE FROM upload_fingerprints
            WHERE tenant_id = $1 AND content_hash = $2 AND upload_id = $3
            "#,
        )
        .bind(tenant_id)
        .bind(content_hash)
        .bind(upload_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
