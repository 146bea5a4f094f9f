//! Database transaction utilities
//!
//! Multi-step operations (batch deduction, commit claims, line edits under a session
//! lock) run inside a [`TransactionGuard`].

use anyhow::Context;
use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use tally_core::AppError;

/// A transaction wrapper with explicit commit/rollback.
///
/// ```ignore
/// use tally_db::db::transaction::TransactionGuard;
///
/// async fn example(pool: &sqlx::PgPool) -> Result<(), tally_core::AppError> {
///     let mut tx = TransactionGuard::begin(pool).await?;
///     sqlx::query("UPDATE ...").execute(tx.conn()?).await?;
///     tx.commit().await
/// }
/// ```
pub struct TransactionGuard<'a> {
    transaction: Option<Transaction<'a, Postgres>>,
}

impl<'a> TransactionGuard<'a> {
    pub async fn begin(pool: &'a PgPool) -> Result<Self, AppError> {
        let transaction = pool
            .begin()
            .await
            .context("Failed to begin database transaction")?;

        Ok(Self {
            transaction: Some(transaction),
        })
    }

    /// Bound how long statements in this transaction wait for row locks.
    pub async fn set_lock_timeout(&mut self, timeout_ms: u64) -> Result<(), AppError> {
        // SET LOCAL does not accept bind parameters
        let statement = format!("SET LOCAL lock_timeout = '{}ms'", timeout_ms);
        sqlx::query(&statement).execute(self.conn()?).await?;
        Ok(())
    }

    /// Connection to run statements on.
    pub fn conn(&mut self) -> Result<&mut PgConnection, AppError> {
        match self.transaction.as_mut() {
            Some(tx) => Ok(&mut **tx),
            None => Err(AppError::Internal(
                "Transaction was already committed or rolled back".to_string(),
            )),
        }
    }

    pub async fn commit(mut self) -> Result<(), AppError> {
        if let Some(tx) = self.transaction.take() {
            tx.commit()
                .await
                .context("Failed to commit database transaction")?;
        }
        Ok(())
    }

    pub async fn rollback(mut self) -> Result<(), AppError> {
        if let Some(tx) = self.transaction.take() {
            tx.rollback()
                .await
                .context("Failed to rollback database transaction")?;
        }
        Ok(())
    }
}

impl<'a> Drop for TransactionGuard<'a> {
    fn drop(&mut self) {
        // sqlx rolls the transaction back when the inner value drops
        if self.transaction.is_some() {
            tracing::debug!("Transaction dropped without explicit commit, rolling back");
        }
    }
}

/// Whether a database error is Postgres `lock_not_available` (lock_timeout expired).
pub fn is_lock_timeout(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("55P03"),
        _ => false,
    }
}

/// Whether a database error is a unique constraint violation.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("23505"),
        _ => false,
    }
}
