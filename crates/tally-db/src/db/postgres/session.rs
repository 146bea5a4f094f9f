use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tally_core::models::{
    CommitResult, DraftLine, LineDecision, ReceivingSession, SessionStatus, VerificationState,
};
use tally_core::AppError;
use uuid::Uuid;

use crate::db::repository::{CommitClaim, SessionRepository};
use crate::db::transaction::{is_lock_timeout, TransactionGuard};

const SESSION_COLUMNS: &str = r#"
    id, tenant_id, opened_by, status, requires_secondary_confirmation, commit_token,
    commit_started_at, commit_result, created_at, updated_at, committed_at
"#;

const LINE_COLUMNS: &str = r#"
    id, session_id, upload_id, tenant_id, part_reference, item_id, quantity, state,
    created_at, verified_at, verified_by
"#;

fn session_from_row(row: &PgRow) -> Result<ReceivingSession, sqlx::Error> {
    let commit_result: Option<Json<CommitResult>> = row.try_get("commit_result")?;
    Ok(ReceivingSession {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        opened_by: row.try_get("opened_by")?,
        status: row.try_get("status")?,
        requires_secondary_confirmation: row.try_get("requires_secondary_confirmation")?,
        commit_token: row.try_get("commit_token")?,
        commit_started_at: row.try_get("commit_started_at")?,
        commit_result: commit_result.map(|r| r.0),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        committed_at: row.try_get("committed_at")?,
    })
}

fn line_from_row(row: &PgRow) -> Result<DraftLine, sqlx::Error> {
    Ok(DraftLine {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        upload_id: row.try_get("upload_id")?,
        tenant_id: row.try_get("tenant_id")?,
        part_reference: row.try_get("part_reference")?,
        item_id: row.try_get("item_id")?,
        quantity: row.try_get("quantity")?,
        state: row.try_get("state")?,
        created_at: row.try_get("created_at")?,
        verified_at: row.try_get("verified_at")?,
        verified_by: row.try_get("verified_by")?,
    })
}

/// Postgres-backed sessions and draft lines. The session row is the commit
/// idempotency record.
#[derive(Clone)]
pub struct PgSessionRepository {
    pool: PgPool,
    lock_timeout_ms: u64,
}

impl PgSessionRepository {
    pub fn new(pool: PgPool, lock_timeout_ms: u64) -> Self {
        Self {
            pool,
            lock_timeout_ms,
        }
    }

    /// Lock the session row and fail unless it is open.
    async fn lock_open_session(
        tx: &mut TransactionGuard<'_>,
        tenant_id: Uuid,
        session_id: Uuid,
    ) -> Result<ReceivingSession, AppError> {
        let sql = format!(
            "SELECT {} FROM receiving_sessions WHERE id = $1 AND tenant_id = $2 FOR UPDATE",
            SESSION_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(session_id)
            .bind(tenant_id)
            .fetch_optional(tx.conn()?)
            .await?;
        let session = row
            .as_ref()
            .map(session_from_row)
            .transpose()?
            .ok_or_else(|| AppError::NotFound(format!("Session {} not found", session_id)))?;

        if session.status != SessionStatus::Open {
            return Err(AppError::InvalidState(format!(
                "Session {} is {}; lines can only change while it is open",
                session_id, session.status
            )));
        }
        Ok(session)
    }
}

#[async_trait]
impl SessionRepository for PgSessionRepository {
    async fn insert_session(&self, session: ReceivingSession) -> Result<ReceivingSession, AppError> {
        let sql = format!(
            r#"
            INSERT INTO receiving_sessions (id, tenant_id, opened_by, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {}
            "#,
            SESSION_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(session.id)
            .bind(session.tenant_id)
            .bind(session.opened_by)
            .bind(session.status)
            .bind(session.created_at)
            .bind(session.updated_at)
            .fetch_one(&self.pool)
            .await?;
        Ok(session_from_row(&row)?)
    }

    async fn get_session(
        &self,
        tenant_id: Uuid,
        session_id: Uuid,
    ) -> Result<Option<ReceivingSession>, AppError> {
        let sql = format!(
            "SELECT {} FROM receiving_sessions WHERE id = $1 AND tenant_id = $2",
            SESSION_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(session_id)
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(session_from_row).transpose()?)
    }

    async fn list_lines(&self, tenant_id: Uuid, session_id: Uuid) -> Result<Vec<DraftLine>, AppError> {
        let sql = format!(
            r#"
            SELECT {} FROM draft_lines
            WHERE session_id = $1 AND tenant_id = $2
            ORDER BY created_at ASC, id ASC
            "#,
            LINE_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(session_id)
            .bind(tenant_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(line_from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }

    #[tracing::instrument(skip(self, lines), fields(count = lines.len()))]
    async fn insert_lines(
        &self,
        tenant_id: Uuid,
        session_id: Uuid,
        lines: Vec<DraftLine>,
    ) -> Result<Vec<DraftLine>, AppError> {
        let mut tx = TransactionGuard::begin(&self.pool).await?;
        Self::lock_open_session(&mut tx, tenant_id, session_id).await?;

        let sql = format!(
            r#"
            INSERT INTO draft_lines (
                id, session_id, upload_id, tenant_id, part_reference, item_id, quantity, state,
                created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {}
            "#,
            LINE_COLUMNS
        );

        let mut inserted = Vec::with_capacity(lines.len());
        for line in lines {
            let row = sqlx::query(&sql)
                .bind(line.id)
                .bind(session_id)
                .bind(line.upload_id)
                .bind(tenant_id)
                .bind(&line.part_reference)
                .bind(line.item_id)
                .bind(line.quantity)
                .bind(line.state)
                .bind(line.created_at)
                .fetch_one(tx.conn()?)
                .await?;
            inserted.push(line_from_row(&row)?);
        }

        tx.commit().await?;
        Ok(inserted)
    }

    #[tracing::instrument(skip(self, decisions), fields(count = decisions.len()))]
    async fn apply_decisions(
        &self,
        tenant_id: Uuid,
        session_id: Uuid,
        decisions: &[LineDecision],
        verifier_id: Uuid,
        requires_secondary_confirmation: bool,
        now: DateTime<Utc>,
    ) -> Result<Vec<DraftLine>, AppError> {
        let mut tx = TransactionGuard::begin(&self.pool).await?;
        Self::lock_open_session(&mut tx, tenant_id, session_id).await?;

        let sql = format!(
            r#"
            UPDATE draft_lines
            SET state = $3, verified_at = $4, verified_by = $5
            WHERE id = $1 AND session_id = $2
            RETURNING {}
            "#,
            LINE_COLUMNS
        );

        let mut updated = Vec::with_capacity(decisions.len());
        for decision in decisions {
            let verified_at = match decision.state {
                VerificationState::Unverified => None,
                _ => Some(now),
            };
            let verified_by = verified_at.map(|_| verifier_id);
            let row = sqlx::query(&sql)
                .bind(decision.line_id)
                .bind(session_id)
                .bind(decision.state)
                .bind(verified_at)
                .bind(verified_by)
                .fetch_optional(tx.conn()?)
                .await?;
            match row {
                Some(row) => updated.push(line_from_row(&row)?),
                None => {
                    tx.rollback().await?;
                    return Err(AppError::NotFound(format!(
                        "Line {} not found in session {}",
                        decision.line_id, session_id
                    )));
                }
            }
        }

        if requires_secondary_confirmation {
            sqlx::query(
                r#"
                UPDATE receiving_sessions
                SET requires_secondary_confirmation = TRUE, updated_at = $2
                WHERE id = $1
                "#,
            )
            .bind(session_id)
            .bind(now)
            .execute(tx.conn()?)
            .await?;
        }

        tx.commit().await?;
        Ok(updated)
    }

    async fn resolve_line(
        &self,
        tenant_id: Uuid,
        session_id: Uuid,
        line_id: Uuid,
        item_id: Uuid,
    ) -> Result<DraftLine, AppError> {
        let mut tx = TransactionGuard::begin(&self.pool).await?;
        Self::lock_open_session(&mut tx, tenant_id, session_id).await?;

        let sql = format!(
            r#"
            UPDATE draft_lines SET item_id = $3
            WHERE id = $1 AND session_id = $2
            RETURNING {}
            "#,
            LINE_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(line_id)
            .bind(session_id)
            .bind(item_id)
            .fetch_optional(tx.conn()?)
            .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Err(AppError::NotFound(format!(
                "Line {} not found in session {}",
                line_id, session_id
            )));
        };
        let line = line_from_row(&row)?;
        tx.commit().await?;
        Ok(line)
    }

    async fn acknowledge_confirmation(
        &self,
        tenant_id: Uuid,
        session_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ReceivingSession, AppError> {
        let mut tx = TransactionGuard::begin(&self.pool).await?;
        Self::lock_open_session(&mut tx, tenant_id, session_id).await?;

        let sql = format!(
            r#"
            UPDATE receiving_sessions
            SET requires_secondary_confirmation = FALSE, updated_at = $2
            WHERE id = $1
            RETURNING {}
            "#,
            SESSION_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(session_id)
            .bind(now)
            .fetch_one(tx.conn()?)
            .await?;
        let session = session_from_row(&row)?;
        tx.commit().await?;
        Ok(session)
    }

    #[tracing::instrument(skip(self))]
    async fn cancel_session(
        &self,
        tenant_id: Uuid,
        session_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<ReceivingSession>, AppError> {
        let mut tx = TransactionGuard::begin(&self.pool).await?;

        let sql = format!(
            r#"
            UPDATE receiving_sessions
            SET status = 'cancelled', requires_secondary_confirmation = FALSE, updated_at = $3
            WHERE id = $1 AND tenant_id = $2 AND status = 'open'
            RETURNING {}
            "#,
            SESSION_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(session_id)
            .bind(tenant_id)
            .bind(now)
            .fetch_optional(tx.conn()?)
            .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };
        let session = session_from_row(&row)?;

        sqlx::query("DELETE FROM draft_lines WHERE session_id = $1")
            .bind(session_id)
            .execute(tx.conn()?)
            .await?;

        tx.commit().await?;
        Ok(Some(session))
    }

    #[tracing::instrument(skip(self))]
    async fn claim_commit(
        &self,
        tenant_id: Uuid,
        session_id: Uuid,
        commit_token: Uuid,
        now: DateTime<Utc>,
        lease_started_before: DateTime<Utc>,
    ) -> Result<CommitClaim, AppError> {
        let mut tx = TransactionGuard::begin(&self.pool).await?;
        tx.set_lock_timeout(self.lock_timeout_ms).await?;

        let sql = format!(
            "SELECT {} FROM receiving_sessions WHERE id = $1 AND tenant_id = $2 FOR UPDATE",
            SESSION_COLUMNS
        );
        let row = match sqlx::query(&sql)
            .bind(session_id)
            .bind(tenant_id)
            .fetch_optional(tx.conn()?)
            .await
        {
            Ok(row) => row,
            Err(err) if is_lock_timeout(&err) => {
                return Err(AppError::CommitConflict {
                    session_id,
                    reason: "Timed out waiting for the session lock".to_string(),
                });
            }
            Err(err) => return Err(err.into()),
        };

        let Some(row) = row else {
            tx.rollback().await?;
            return Err(AppError::NotFound(format!("Session {} not found", session_id)));
        };
        let session = session_from_row(&row)?;

        let claimable = match session.status {
            SessionStatus::Open => true,
            SessionStatus::Committing => session
                .commit_started_at
                .map(|started| started < lease_started_before)
                .unwrap_or(true),
            SessionStatus::Committed => {
                tx.rollback().await?;
                return match session.commit_result {
                    Some(result) => Ok(CommitClaim::AlreadyCommitted(result)),
                    None => Err(AppError::Internal(format!(
                        "Session {} is committed without a stored result",
                        session_id
                    ))),
                };
            }
            SessionStatus::Cancelled => {
                tx.rollback().await?;
                return Ok(CommitClaim::NotCommittable(SessionStatus::Cancelled));
            }
        };

        if !claimable {
            tx.rollback().await?;
            return Ok(CommitClaim::InFlight {
                started_at: session.commit_started_at,
            });
        }

        if session.status == SessionStatus::Committing {
            tracing::warn!(
                session_id = %session_id,
                stale_token = ?session.commit_token,
                "Reclaiming abandoned commit marker"
            );
        }

        let update = format!(
            r#"
            UPDATE receiving_sessions
            SET status = 'committing', commit_token = $2, commit_started_at = $3, updated_at = $3
            WHERE id = $1
            RETURNING {}
            "#,
            SESSION_COLUMNS
        );
        let row = sqlx::query(&update)
            .bind(session_id)
            .bind(commit_token)
            .bind(now)
            .fetch_one(tx.conn()?)
            .await?;
        let claimed = session_from_row(&row)?;
        tx.commit().await?;

        Ok(CommitClaim::Claimed(claimed))
    }

    async fn release_commit(
        &self,
        tenant_id: Uuid,
        session_id: Uuid,
        commit_token: Uuid,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE receiving_sessions
            SET status = 'open', commit_token = NULL, commit_started_at = NULL, updated_at = NOW()
            WHERE id = $1 AND tenant_id = $2 AND status = 'committing' AND commit_token = $3
            "#,
        )
        .bind(session_id)
        .bind(tenant_id)
        .bind(commit_token)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::postgres::test_support::test_pool;

    #[tokio::test]
    #[ignore] // Requires TEST_DATABASE_URL
    async fn test_second_claim_sees_in_flight() {
        let Some(pool) = test_pool().await else {
            return;
        };
        let repo = PgSessionRepository::new(pool, 5000);
        let tenant_id = Uuid::new_v4();
        let now = Utc::now();
        let session = repo
            .insert_session(ReceivingSession::new(tenant_id, Uuid::new_v4(), now))
            .await
            .unwrap();

        let lease = now - chrono::Duration::seconds(60);
        let first = repo
            .claim_commit(tenant_id, session.id, Uuid::new_v4(), now, lease)
            .await
            .unwrap();
        let second = repo
            .claim_commit(tenant_id, session.id, Uuid::new_v4(), now, lease)
            .await
            .unwrap();

        assert!(matches!(first, CommitClaim::Claimed(_)));
        assert!(matches!(second, CommitClaim::InFlight { .. }));
    }

    #[tokio::test]
    #[ignore] // Requires TEST_DATABASE_URL
    async fn test_claim_gives_up_on_held_row_lock() {
        let Some(pool) = test_pool().await else {
            return;
        };
        let repo = PgSessionRepository::new(pool.clone(), 100);
        let tenant_id = Uuid::new_v4();
        let now = Utc::now();
        let session = repo
            .insert_session(ReceivingSession::new(tenant_id, Uuid::new_v4(), now))
            .await
            .unwrap();

        let mut holder = pool.begin().await.unwrap();
        sqlx::query("SELECT id FROM receiving_sessions WHERE id = $1 FOR UPDATE")
            .bind(session.id)
            .execute(&mut *holder)
            .await
            .unwrap();

        let started = std::time::Instant::now();
        let result = repo
            .claim_commit(tenant_id, session.id, Uuid::new_v4(), now, now - chrono::Duration::seconds(60))
            .await;
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
        assert!(matches!(result, Err(AppError::CommitConflict { .. })));

        holder.rollback().await.unwrap();
        let after = repo.get_session(tenant_id, session.id).await.unwrap().unwrap();
        assert_eq!(after.status, SessionStatus::Open);
    }
}
