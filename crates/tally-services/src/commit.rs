//! Session commit coordinator
//!
//! `open -> committing -> committed`, or back to `open` when any step fails. The
//! `committing` marker carries a per-attempt token; only the holder of the token can
//! seal the session, and a marker older than the lease is treated as abandoned.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use serde_json::json;
use tally_core::models::{
    AuditAction, CommitOutcome, CommitResult, Deduction, NewAuditEntry, ReceivingSession,
    SessionStatus, VerificationState,
};
use tally_core::{Action, AppError, LedgerConfig, RequestContext};
use tally_db::{CommitClaim, SessionRepository, SessionSeal};
use uuid::Uuid;

use crate::audit::AuditTrail;
use crate::ledger::InventoryLedger;

#[derive(Clone)]
pub struct SessionCommitCoordinator {
    sessions: Arc<dyn SessionRepository>,
    ledger: InventoryLedger,
    audit: AuditTrail,
    lock_timeout: StdDuration,
    lease: Duration,
    bulk_floor_secs: f64,
}

enum Claimed {
    Session(ReceivingSession),
    Replay(CommitResult),
}

fn session_ref(session_id: Uuid) -> String {
    format!("session:{}", session_id)
}

impl SessionCommitCoordinator {
    pub fn new(
        sessions: Arc<dyn SessionRepository>,
        ledger: InventoryLedger,
        audit: AuditTrail,
        config: &LedgerConfig,
        bulk_floor_secs: f64,
    ) -> Self {
        Self {
            sessions,
            ledger,
            audit,
            lock_timeout: StdDuration::from_millis(config.commit_lock_timeout_ms),
            lease: Duration::seconds(config.commit_lease_secs),
            bulk_floor_secs,
        }
    }

    /// Commit a session exactly once.
    ///
    /// Safe to call repeatedly or concurrently: a committed session returns its stored
    /// result with `replayed = true`; a commit held by another live attempt fails with
    /// `CommitConflict`. Failures to claim are audited as `commit_failed`; failures after
    /// the claim roll the session back and are audited as `session_rolled_back`.
    #[tracing::instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id, user_id = %ctx.user_id))]
    pub async fn commit(&self, ctx: &RequestContext, session_id: Uuid) -> Result<CommitOutcome, AppError> {
        let entity = session_ref(session_id);
        self.audit
            .authorize(ctx, Action::CommitSession, &entity)
            .await?;

        let token = Uuid::new_v4();
        let claimed = self.claim(ctx, session_id, token).await;
        let session = match self
            .audit
            .audited(ctx, AuditAction::CommitFailed, &entity, claimed)
            .await?
        {
            Claimed::Session(session) => session,
            Claimed::Replay(result) => {
                tracing::info!(session_id = %session_id, "Replaying stored commit result");
                return Ok(CommitOutcome {
                    result,
                    replayed: true,
                });
            }
        };

        match self.apply(ctx, &session, token).await {
            Ok(result) => {
                tracing::info!(
                    session_id = %session_id,
                    deductions = result.deductions.len(),
                    "Session committed"
                );
                self.audit
                    .record_or_log(
                        NewAuditEntry::new(ctx.tenant_id, ctx.user_id, AuditAction::SessionCommitted, &entity)
                            .with_before(json!({ "status": SessionStatus::Committing }))
                            .with_after(json!({
                                "status": SessionStatus::Committed,
                                "result": result,
                            })),
                    )
                    .await;
                Ok(CommitOutcome {
                    result,
                    replayed: false,
                })
            }
            Err(err) => {
                self.roll_back(ctx, session_id, token, &err).await;
                Err(err)
            }
        }
    }

    /// Take the session's commit marker, waiting at most `lock_timeout` for the lock.
    async fn claim(&self, ctx: &RequestContext, session_id: Uuid, token: Uuid) -> Result<Claimed, AppError> {
        let now = Utc::now();
        let claim = tokio::time::timeout(
            self.lock_timeout,
            self.sessions
                .claim_commit(ctx.tenant_id, session_id, token, now, now - self.lease),
        )
        .await
        .map_err(|_| AppError::CommitConflict {
            session_id,
            reason: format!(
                "Timed out after {}ms waiting for the session lock",
                self.lock_timeout.as_millis()
            ),
        })??;

        match claim {
            CommitClaim::Claimed(session) => Ok(Claimed::Session(session)),
            CommitClaim::AlreadyCommitted(result) => Ok(Claimed::Replay(result)),
            CommitClaim::InFlight { started_at } => {
                tracing::warn!(session_id = %session_id, started_at = ?started_at, "Commit already in flight");
                Err(AppError::CommitConflict {
                    session_id,
                    reason: "Another commit for this session is in progress".to_string(),
                })
            }
            CommitClaim::NotCommittable(status) => Err(AppError::InvalidState(format!(
                "Session {} is {} and cannot be committed",
                session_id, status
            ))),
        }
    }

    /// Validate the claimed session and hand its confirmed lines to the ledger.
    async fn apply(
        &self,
        ctx: &RequestContext,
        session: &ReceivingSession,
        token: Uuid,
    ) -> Result<CommitResult, AppError> {
        if session.requires_secondary_confirmation {
            return Err(AppError::ConfirmationRequired {
                session_id: session.id,
                floor: self.bulk_floor_secs,
            });
        }

        let lines = self.sessions.list_lines(ctx.tenant_id, session.id).await?;
        let confirmed: Vec<_> = lines
            .iter()
            .filter(|line| line.state == VerificationState::Confirmed)
            .collect();

        let unresolved: Vec<Uuid> = confirmed
            .iter()
            .filter(|line| !line.is_resolved())
            .map(|line| line.id)
            .collect();
        if !unresolved.is_empty() {
            return Err(AppError::UnresolvedParts {
                line_ids: unresolved,
            });
        }
        if confirmed.is_empty() {
            return Err(AppError::InvalidState(format!(
                "Session {} has no confirmed lines to commit",
                session.id
            )));
        }

        let deductions: Vec<Deduction> = confirmed
            .iter()
            .filter_map(|line| {
                line.item_id.map(|item_id| Deduction {
                    line_id: line.id,
                    item_id,
                    quantity: line.quantity,
                })
            })
            .collect();

        let seal = SessionSeal {
            session_id: session.id,
            commit_token: token,
            committed_by: ctx.user_id,
            committed_at: Utc::now(),
        };
        self.ledger.deduct_batch(ctx, &deductions, seal).await
    }

    /// Return the session to `open` and record why the attempt failed.
    async fn roll_back(&self, ctx: &RequestContext, session_id: Uuid, token: Uuid, err: &AppError) {
        let released = match self.sessions.release_commit(ctx.tenant_id, session_id, token).await {
            Ok(released) => released,
            Err(e) => {
                // The marker expires with the lease and is reclaimed by the next attempt.
                tracing::error!(session_id = %session_id, error = %e, "Failed to release commit marker");
                false
            }
        };
        tracing::warn!(session_id = %session_id, error = %err, released, "Commit rolled back");
        self.audit
            .record_error(ctx, AuditAction::SessionRolledBack, session_ref(session_id), err)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::DateTime;
    use tally_core::models::{DraftLine, LineDecision};
    use tally_core::Role;
    use tally_db::{AuditRepository, MemoryStore};
    use tally_infra::AuditSigner;

    /// Session store whose commit claim waits `delay` before answering, like a row lock
    /// held by another transaction.
    struct SlowClaimSessions {
        inner: MemoryStore,
        delay: StdDuration,
    }

    #[async_trait]
    impl SessionRepository for SlowClaimSessions {
        async fn insert_session(&self, session: ReceivingSession) -> Result<ReceivingSession, AppError> {
            self.inner.insert_session(session).await
        }

        async fn get_session(&self, tenant_id: Uuid, session_id: Uuid) -> Result<Option<ReceivingSession>, AppError> {
            self.inner.get_session(tenant_id, session_id).await
        }

        async fn list_lines(&self, tenant_id: Uuid, session_id: Uuid) -> Result<Vec<DraftLine>, AppError> {
            self.inner.list_lines(tenant_id, session_id).await
        }

        async fn insert_lines(
            &self,
            tenant_id: Uuid,
            session_id: Uuid,
            lines: Vec<DraftLine>,
        ) -> Result<Vec<DraftLine>, AppError> {
            self.inner.insert_lines(tenant_id, session_id, lines).await
        }

        async fn apply_decisions(
            &self,
            tenant_id: Uuid,
            session_id: Uuid,
            decisions: &[LineDecision],
            verifier_id: Uuid,
            requires_secondary_confirmation: bool,
            now: DateTime<Utc>,
        ) -> Result<Vec<DraftLine>, AppError> {
            self.inner
                .apply_decisions(tenant_id, session_id, decisions, verifier_id, requires_secondary_confirmation, now)
                .await
        }

        async fn resolve_line(
            &self,
            tenant_id: Uuid,
            session_id: Uuid,
            line_id: Uuid,
            item_id: Uuid,
        ) -> Result<DraftLine, AppError> {
            self.inner.resolve_line(tenant_id, session_id, line_id, item_id).await
        }

        async fn acknowledge_confirmation(
            &self,
            tenant_id: Uuid,
            session_id: Uuid,
            now: DateTime<Utc>,
        ) -> Result<ReceivingSession, AppError> {
            self.inner.acknowledge_confirmation(tenant_id, session_id, now).await
        }

        async fn cancel_session(
            &self,
            tenant_id: Uuid,
            session_id: Uuid,
            now: DateTime<Utc>,
        ) -> Result<Option<ReceivingSession>, AppError> {
            self.inner.cancel_session(tenant_id, session_id, now).await
        }

        async fn claim_commit(
            &self,
            tenant_id: Uuid,
            session_id: Uuid,
            commit_token: Uuid,
            now: DateTime<Utc>,
            lease_started_before: DateTime<Utc>,
        ) -> Result<CommitClaim, AppError> {
            tokio::time::sleep(self.delay).await;
            self.inner
                .claim_commit(tenant_id, session_id, commit_token, now, lease_started_before)
                .await
        }

        async fn release_commit(&self, tenant_id: Uuid, session_id: Uuid, commit_token: Uuid) -> Result<bool, AppError> {
            self.inner.release_commit(tenant_id, session_id, commit_token).await
        }
    }

    fn coordinator(store: &MemoryStore, sessions: Arc<dyn SessionRepository>, lock_timeout_ms: u64) -> SessionCommitCoordinator {
        let audit = AuditTrail::new(
            Arc::new(store.clone()),
            AuditSigner::new("0123456789abcdef0123456789abcdef").unwrap(),
        );
        let ledger = InventoryLedger::new(Arc::new(store.clone()), audit.clone());
        let config = LedgerConfig {
            commit_lock_timeout_ms: lock_timeout_ms,
            commit_lease_secs: 60,
        };
        SessionCommitCoordinator::new(sessions, ledger, audit, &config, 0.2)
    }

    async fn audit_actions(store: &MemoryStore, tenant_id: Uuid) -> Vec<AuditAction> {
        store
            .list_audit(tenant_id, 100)
            .await
            .unwrap()
            .into_iter()
            .map(|entry| entry.action)
            .collect()
    }

    #[tokio::test]
    async fn test_lock_wait_past_timeout_is_a_conflict() {
        let store = MemoryStore::new();
        let sessions = Arc::new(SlowClaimSessions {
            inner: store.clone(),
            delay: StdDuration::from_secs(5),
        });
        let coordinator = coordinator(&store, sessions.clone(), 50);
        let ctx = RequestContext::new(Uuid::new_v4(), Uuid::new_v4(), vec![Role::Crew]);
        let session = sessions
            .insert_session(ReceivingSession::new(ctx.tenant_id, ctx.user_id, Utc::now()))
            .await
            .unwrap();

        let started = std::time::Instant::now();
        let result = coordinator.commit(&ctx, session.id).await;

        assert!(started.elapsed() < StdDuration::from_secs(2), "commit blocked on the lock");
        match result {
            Err(AppError::CommitConflict { session_id, reason }) => {
                assert_eq!(session_id, session.id);
                assert!(reason.contains("50ms"));
            }
            other => panic!("expected CommitConflict, got {other:?}"),
        }
        assert_eq!(audit_actions(&store, ctx.tenant_id).await, vec![AuditAction::CommitFailed]);

        let unchanged = store.get_session(ctx.tenant_id, session.id).await.unwrap().unwrap();
        assert_eq!(unchanged.status, SessionStatus::Open);
    }

    #[tokio::test]
    async fn test_claim_failures_are_audited() {
        let store = MemoryStore::new();
        let coordinator = coordinator(&store, Arc::new(store.clone()), 5000);
        let ctx = RequestContext::new(Uuid::new_v4(), Uuid::new_v4(), vec![Role::Crew]);

        let missing = coordinator.commit(&ctx, Uuid::new_v4()).await;
        assert!(matches!(missing, Err(AppError::NotFound(_))));

        let session = store
            .insert_session(ReceivingSession::new(ctx.tenant_id, ctx.user_id, Utc::now()))
            .await
            .unwrap();
        store
            .cancel_session(ctx.tenant_id, session.id, Utc::now())
            .await
            .unwrap();
        let cancelled = coordinator.commit(&ctx, session.id).await;
        assert!(matches!(cancelled, Err(AppError::InvalidState(_))));

        let entries = store.list_audit(ctx.tenant_id, 100).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.action == AuditAction::CommitFailed));
        assert_eq!(entries[0].after.as_ref().unwrap()["error"]["kind"], "NOT_FOUND");
        assert_eq!(entries[1].after.as_ref().unwrap()["error"]["kind"], "INVALID_STATE");
        assert_eq!(entries[1].entity_ref, format!("session:{}", session.id));
    }
}
