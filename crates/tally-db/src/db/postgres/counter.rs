use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tally_core::AppError;

use crate::db::repository::{CounterBucket, CounterRepository};
use crate::db::transaction::TransactionGuard;

/// Postgres-backed time-bucketed counters, shareable across instances
#[derive(Clone)]
pub struct PgCounterRepository {
    pool: PgPool,
}

impl PgCounterRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CounterRepository for PgCounterRepository {
    async fn increment(
        &self,
        key: &str,
        bucket_start: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO rate_counters (counter_key, bucket_start, count, expires_at)
            VALUES ($1, $2, 1, $3)
            ON CONFLICT (counter_key, bucket_start)
            DO UPDATE SET count = rate_counters.count + 1
            RETURNING count
            "#,
        )
        .bind(key)
        .bind(bucket_start)
        .bind(expires_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(count.max(0) as u64)
    }

    async fn increment_within_limit(
        &self,
        key: &str,
        bucket_start: DateTime<Utc>,
        expires_at: DateTime<Utc>,
        window_start: DateTime<Utc>,
        limit: u64,
    ) -> Result<Option<u64>, AppError> {
        let mut tx = TransactionGuard::begin(&self.pool).await?;

        // Serializes check-and-count per key across instances; released at commit
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(key)
            .execute(tx.conn()?)
            .await?;

        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(count), 0)::BIGINT
            FROM rate_counters
            WHERE counter_key = $1 AND bucket_start >= $2
            "#,
        )
        .bind(key)
        .bind(window_start)
        .fetch_one(tx.conn()?)
        .await?;
        let total = total.max(0) as u64;

        if total >= limit {
            tx.rollback().await?;
            return Ok(None);
        }

        sqlx::query(
            r#"
            INSERT INTO rate_counters (counter_key, bucket_start, count, expires_at)
            VALUES ($1, $2, 1, $3)
            ON CONFLICT (counter_key, bucket_start)
            DO UPDATE SET count = rate_counters.count + 1
            "#,
        )
        .bind(key)
        .bind(bucket_start)
        .bind(expires_at)
        .execute(tx.conn()?)
        .await?;

        tx.commit().await?;
        Ok(Some(total + 1))
    }

    async fn buckets_since(&self, key: &str, since: DateTime<Utc>) -> Result<Vec<CounterBucket>, AppError> {
        let rows = sqlx::query(
            r#"
            SELECT bucket_start, count
            FROM rate_counters
            WHERE counter_key = $1 AND bucket_start >= $2
            ORDER BY bucket_start ASC
            "#,
        )
        .bind(key)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let count: i64 = row.try_get("count")?;
                Ok(CounterBucket {
                    bucket_start: row.try_get("bucket_start")?,
                    count: count.max(0) as u64,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(AppError::from)
    }

    #[tracing::instrument(skip(self))]
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM rate_counters WHERE expires_at < $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::postgres::test_support::test_pool;
    use chrono::Duration;
    use uuid::Uuid;

    #[tokio::test]
    #[ignore] // Requires TEST_DATABASE_URL
    async fn test_full_window_is_not_counted() {
        let Some(pool) = test_pool().await else {
            return;
        };
        let repo = PgCounterRepository::new(pool);
        let key = format!("upload:{}", Uuid::new_v4());
        let bucket = DateTime::from_timestamp(1_800_000_000, 0).unwrap();
        let expires = bucket + Duration::hours(2);
        let window_start = bucket - Duration::minutes(59);

        assert_eq!(repo.increment_within_limit(&key, bucket, expires, window_start, 2).await.unwrap(), Some(1));
        assert_eq!(repo.increment_within_limit(&key, bucket, expires, window_start, 2).await.unwrap(), Some(2));
        assert_eq!(repo.increment_within_limit(&key, bucket, expires, window_start, 2).await.unwrap(), None);

        let buckets = repo.buckets_since(&key, window_start).await.unwrap();
        assert_eq!(buckets.iter().map(|b| b.count).sum::<u64>(), 2);
    }
}
