use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tally_core::models::{NewUpload, QualityReport, Upload, UploadStatus};
use tally_core::AppError;
use uuid::Uuid;

use crate::db::repository::{OcrSummary, UploadRepository};

const UPLOAD_COLUMNS: &str = r#"
    id, tenant_id, uploader_id, content_hash, byte_size, media_type, width, height,
    quality_score, quality, status, storage_ref, ocr_char_count, ocr_mean_confidence,
    attempts, next_attempt_at, processing_started_at, uploaded_at, processed_at
"#;

fn upload_from_row(row: &PgRow) -> Result<Upload, sqlx::Error> {
    let quality: Option<Json<QualityReport>> = row.try_get("quality")?;
    Ok(Upload {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        uploader_id: row.try_get("uploader_id")?,
        content_hash: row.try_get("content_hash")?,
        byte_size: row.try_get("byte_size")?,
        media_type: row.try_get("media_type")?,
        width: row.try_get("width")?,
        height: row.try_get("height")?,
        quality_score: row.try_get("quality_score")?,
        quality: quality.map(|q| q.0),
        status: row.try_get("status")?,
        storage_ref: row.try_get("storage_ref")?,
        ocr_char_count: row.try_get("ocr_char_count")?,
        ocr_mean_confidence: row.try_get("ocr_mean_confidence")?,
        attempts: row.try_get("attempts")?,
        next_attempt_at: row.try_get("next_attempt_at")?,
        processing_started_at: row.try_get("processing_started_at")?,
        uploaded_at: row.try_get("uploaded_at")?,
        processed_at: row.try_get("processed_at")?,
    })
}

/// Postgres-backed upload repository
#[derive(Clone)]
pub struct PgUploadRepository {
    pool: PgPool,
}

impl PgUploadRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run a conditional status update and map the returned row.
    async fn transition(
        &self,
        sql: &str,
        upload_id: Uuid,
        summary: Option<OcrSummary>,
        at: DateTime<Utc>,
    ) -> Result<Option<Upload>, AppError> {
        let mut query = sqlx::query(sql).bind(upload_id).bind(at);
        if let Some(summary) = summary {
            query = query
                .bind(summary.char_count)
                .bind(summary.mean_confidence);
        }
        let row = query.fetch_optional(&self.pool).await?;
        Ok(row.as_ref().map(upload_from_row).transpose()?)
    }
}

#[async_trait]
impl UploadRepository for PgUploadRepository {
    #[tracing::instrument(skip(self, upload), fields(upload_id = %upload.id))]
    async fn insert_upload(&self, upload: NewUpload) -> Result<Upload, AppError> {
        let quality_score = upload.quality.as_ref().map(|q| q.total);
        let sql = format!(
            r#"
            INSERT INTO uploads (
                id, tenant_id, uploader_id, content_hash, byte_size, media_type,
                width, height, quality_score, quality, status, storage_ref, uploaded_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING {}
            "#,
            UPLOAD_COLUMNS
        );

        let row = sqlx::query(&sql)
            .bind(upload.id)
            .bind(upload.tenant_id)
            .bind(upload.uploader_id)
            .bind(&upload.content_hash)
            .bind(upload.byte_size)
            .bind(&upload.media_type)
            .bind(upload.width)
            .bind(upload.height)
            .bind(quality_score)
            .bind(upload.quality.as_ref().map(Json))
            .bind(upload.status)
            .bind(&upload.storage_ref)
            .bind(upload.uploaded_at)
            .fetch_one(&self.pool)
            .await?;

        Ok(upload_from_row(&row)?)
    }

    async fn get_upload(&self, tenant_id: Uuid, upload_id: Uuid) -> Result<Option<Upload>, AppError> {
        let sql = format!(
            "SELECT {} FROM uploads WHERE id = $1 AND tenant_id = $2",
            UPLOAD_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(upload_id)
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(upload_from_row).transpose()?)
    }

    #[tracing::instrument(skip(self))]
    async fn claim_upload(&self, upload_id: Uuid, now: DateTime<Utc>) -> Result<Option<Upload>, AppError> {
        let sql = format!(
            r#"
            UPDATE uploads
            SET status = 'processing', attempts = attempts + 1,
                processing_started_at = $2, next_attempt_at = NULL
            WHERE id = $1 AND status = 'queued'
            RETURNING {}
            "#,
            UPLOAD_COLUMNS
        );
        self.transition(&sql, upload_id, None, now).await
    }

    #[tracing::instrument(skip(self))]
    async fn claim_next_queued(&self, now: DateTime<Utc>) -> Result<Option<Upload>, AppError> {
        let sql = format!(
            r#"
            UPDATE uploads
            SET status = 'processing', attempts = attempts + 1,
                processing_started_at = $1, next_attempt_at = NULL
            WHERE id = (
                SELECT id FROM uploads
                WHERE status = 'queued'
                    AND (next_attempt_at IS NULL OR next_attempt_at <= $1)
                ORDER BY uploaded_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {}
            "#,
            UPLOAD_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(upload_from_row).transpose()?)
    }

    async fn complete_upload(
        &self,
        upload_id: Uuid,
        summary: OcrSummary,
        now: DateTime<Utc>,
    ) -> Result<Option<Upload>, AppError> {
        let sql = format!(
            r#"
            UPDATE uploads
            SET status = 'completed', processed_at = $2,
                ocr_char_count = $3, ocr_mean_confidence = $4
            WHERE id = $1 AND status = 'processing'
            RETURNING {}
            "#,
            UPLOAD_COLUMNS
        );
        self.transition(&sql, upload_id, Some(summary), now).await
    }

    async fn quarantine_processed_upload(
        &self,
        upload_id: Uuid,
        summary: OcrSummary,
        now: DateTime<Utc>,
    ) -> Result<Option<Upload>, AppError> {
        let sql = format!(
            r#"
            UPDATE uploads
            SET status = 'quarantined', processed_at = $2,
                ocr_char_count = $3, ocr_mean_confidence = $4
            WHERE id = $1 AND status = 'processing'
            RETURNING {}
            "#,
            UPLOAD_COLUMNS
        );
        self.transition(&sql, upload_id, Some(summary), now).await
    }

    async fn fail_upload(&self, upload_id: Uuid, now: DateTime<Utc>) -> Result<Option<Upload>, AppError> {
        let sql = format!(
            r#"
            UPDATE uploads
            SET status = 'failed', processed_at = $2
            WHERE id = $1 AND status = 'processing'
            RETURNING {}
            "#,
            UPLOAD_COLUMNS
        );
        self.transition(&sql, upload_id, None, now).await
    }

    async fn schedule_retry(
        &self,
        upload_id: Uuid,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<Option<Upload>, AppError> {
        let sql = format!(
            r#"
            UPDATE uploads
            SET status = 'queued', next_attempt_at = $2, processing_started_at = NULL
            WHERE id = $1 AND status = 'processing'
            RETURNING {}
            "#,
            UPLOAD_COLUMNS
        );
        self.transition(&sql, upload_id, None, next_attempt_at).await
    }

    async fn requeue_quarantined(&self, tenant_id: Uuid, upload_id: Uuid) -> Result<Option<Upload>, AppError> {
        let sql = format!(
            r#"
            UPDATE uploads
            SET status = 'queued', attempts = 0, next_attempt_at = NULL,
                processing_started_at = NULL, processed_at = NULL
            WHERE id = $1 AND tenant_id = $2 AND status = 'quarantined'
            RETURNING {}
            "#,
            UPLOAD_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(upload_id)
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(upload_from_row).transpose()?)
    }

    #[tracing::instrument(skip(self))]
    async fn requeue_stale(&self, started_before: DateTime<Utc>) -> Result<Vec<Uuid>, AppError> {
        let rows = sqlx::query(
            r#"
            UPDATE uploads
            SET status = 'queued', processing_started_at = NULL, next_attempt_at = NULL
            WHERE status = 'processing' AND processing_started_at < $1
            RETURNING id
            "#,
        )
        .bind(started_before)
        .fetch_all(&self.pool)
        .await?;

        let ids = rows
            .iter()
            .map(|row| row.try_get::<Uuid, _>("id"))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::postgres::test_support::test_pool;

    fn new_upload(tenant_id: Uuid) -> NewUpload {
        NewUpload {
            id: Uuid::new_v4(),
            tenant_id,
            uploader_id: Uuid::new_v4(),
            content_hash: format!("{:064x}", Uuid::new_v4().as_u128()),
            byte_size: 2048,
            media_type: "image/png".to_string(),
            width: Some(640),
            height: Some(480),
            quality: None,
            status: UploadStatus::Queued,
            storage_ref: "accepted/x/ab/abc.png".to_string(),
            uploaded_at: Utc::now(),
        }
    }

    #[tokio::test]
    #[ignore] // Requires TEST_DATABASE_URL
    async fn test_claim_is_exclusive() {
        let Some(pool) = test_pool().await else {
            return;
        };
        let repo = PgUploadRepository::new(pool);
        let upload = repo.insert_upload(new_upload(Uuid::new_v4())).await.unwrap();

        let first = repo.claim_upload(upload.id, Utc::now()).await.unwrap();
        let second = repo.claim_upload(upload.id, Utc::now()).await.unwrap();

        assert_eq!(first.unwrap().status, UploadStatus::Processing);
        assert!(second.is_none());
    }
}
