//! Repository traits
//!
//! Every check-then-mutate operation below is a single atomic storage operation or runs
//! under a lock held across both steps. Callers never combine a read and a write to
//! enforce an invariant.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tally_core::models::{
    AuditEntry, CommitResult, Deduction, DeductOutcome, DraftLine, FingerprintRecord,
    InventoryItem, LineDecision, NewInventoryItem, NewUpload, QuarantineRecord,
    QuarantineResolution, ReceivingSession, SessionStatus, Upload,
};
use tally_core::AppError;
use uuid::Uuid;

/// OCR statistics written when an upload leaves `processing`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct OcrSummary {
    pub char_count: i32,
    pub mean_confidence: Option<f64>,
}

#[async_trait]
pub trait UploadRepository: Send + Sync {
    async fn insert_upload(&self, upload: NewUpload) -> Result<Upload, AppError>;

    async fn get_upload(&self, tenant_id: Uuid, upload_id: Uuid) -> Result<Option<Upload>, AppError>;

    /// Conditional `queued -> processing` for one upload. `None` when the upload is not
    /// queued, which means another worker already owns it.
    async fn claim_upload(&self, upload_id: Uuid, now: DateTime<Utc>) -> Result<Option<Upload>, AppError>;

    /// Claim the oldest queued upload whose retry time has passed, across all tenants.
    async fn claim_next_queued(&self, now: DateTime<Utc>) -> Result<Option<Upload>, AppError>;

    /// Conditional `processing -> completed`.
    async fn complete_upload(
        &self,
        upload_id: Uuid,
        summary: OcrSummary,
        now: DateTime<Utc>,
    ) -> Result<Option<Upload>, AppError>;

    /// Conditional `processing -> quarantined`.
    async fn quarantine_processed_upload(
        &self,
        upload_id: Uuid,
        summary: OcrSummary,
        now: DateTime<Utc>,
    ) -> Result<Option<Upload>, AppError>;

    /// Conditional `processing -> failed`.
    async fn fail_upload(&self, upload_id: Uuid, now: DateTime<Utc>) -> Result<Option<Upload>, AppError>;

    /// Conditional `processing -> queued` with a retry time.
    async fn schedule_retry(
        &self,
        upload_id: Uuid,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<Option<Upload>, AppError>;

    /// Conditional `quarantined -> queued`; resets the attempt counter.
    async fn requeue_quarantined(&self, tenant_id: Uuid, upload_id: Uuid) -> Result<Option<Upload>, AppError>;

    /// Move uploads stuck in `processing` since before `started_before` back to `queued`.
    async fn requeue_stale(&self, started_before: DateTime<Utc>) -> Result<Vec<Uuid>, AppError>;
}

#[async_trait]
pub trait FingerprintRepository: Send + Sync {
    async fn find_fingerprint(
        &self,
        tenant_id: Uuid,
        content_hash: &str,
    ) -> Result<Option<FingerprintRecord>, AppError>;

    /// Insert or refresh the fingerprint so it points at `upload_id` as of `now`.
    async fn upsert_fingerprint(
        &self,
        tenant_id: Uuid,
        content_hash: &str,
        upload_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<FingerprintRecord, AppError>;

    /// Remove the fingerprint only while it still points at `upload_id`.
    async fn remove_fingerprint(
        &self,
        tenant_id: Uuid,
        content_hash: &str,
        upload_id: Uuid,
    ) -> Result<bool, AppError>;
}

#[async_trait]
pub trait QuarantineRepository: Send + Sync {
    async fn insert_quarantine(&self, record: QuarantineRecord) -> Result<QuarantineRecord, AppError>;

    async fn get_quarantine(
        &self,
        tenant_id: Uuid,
        record_id: Uuid,
    ) -> Result<Option<QuarantineRecord>, AppError>;

    async fn list_pending_quarantine(&self, tenant_id: Uuid) -> Result<Vec<QuarantineRecord>, AppError>;

    /// Close a pending record. `None` when it was already resolved.
    async fn resolve_quarantine(
        &self,
        tenant_id: Uuid,
        record_id: Uuid,
        resolution: QuarantineResolution,
        reviewer_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<QuarantineRecord>, AppError>;
}

/// Outcome of trying to take the commit marker on a session.
#[derive(Debug, Clone)]
pub enum CommitClaim {
    /// The session was open (or its marker was stale) and is now `committing` under our token.
    Claimed(ReceivingSession),
    /// The session is already committed; replay this result.
    AlreadyCommitted(CommitResult),
    /// Another attempt holds a live `committing` marker.
    InFlight { started_at: Option<DateTime<Utc>> },
    /// The session is cancelled or missing its marker in a way that forbids committing.
    NotCommittable(SessionStatus),
}

/// Identifies the commit attempt that is allowed to seal a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSeal {
    pub session_id: Uuid,
    pub commit_token: Uuid,
    pub committed_by: Uuid,
    pub committed_at: DateTime<Utc>,
}

#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn insert_session(&self, session: ReceivingSession) -> Result<ReceivingSession, AppError>;

    async fn get_session(
        &self,
        tenant_id: Uuid,
        session_id: Uuid,
    ) -> Result<Option<ReceivingSession>, AppError>;

    async fn list_lines(&self, tenant_id: Uuid, session_id: Uuid) -> Result<Vec<DraftLine>, AppError>;

    /// Append lines. Fails with `InvalidState` unless the session is open.
    async fn insert_lines(
        &self,
        tenant_id: Uuid,
        session_id: Uuid,
        lines: Vec<DraftLine>,
    ) -> Result<Vec<DraftLine>, AppError>;

    /// Apply verification decisions and set the interstitial flag in one step.
    /// Fails with `InvalidState` unless the session is open.
    async fn apply_decisions(
        &self,
        tenant_id: Uuid,
        session_id: Uuid,
        decisions: &[LineDecision],
        verifier_id: Uuid,
        requires_secondary_confirmation: bool,
        now: DateTime<Utc>,
    ) -> Result<Vec<DraftLine>, AppError>;

    /// Point a line at an inventory item. Fails with `InvalidState` unless the session is open.
    async fn resolve_line(
        &self,
        tenant_id: Uuid,
        session_id: Uuid,
        line_id: Uuid,
        item_id: Uuid,
    ) -> Result<DraftLine, AppError>;

    /// Clear the interstitial flag. Fails with `InvalidState` unless the session is open.
    async fn acknowledge_confirmation(
        &self,
        tenant_id: Uuid,
        session_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ReceivingSession, AppError>;

    /// Conditional `open -> cancelled`, deleting the session's lines. `None` when not open.
    async fn cancel_session(
        &self,
        tenant_id: Uuid,
        session_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<ReceivingSession>, AppError>;

    /// Lock the session row and take the `committing` marker. A marker older than
    /// `lease_started_before` is treated as abandoned and taken over.
    async fn claim_commit(
        &self,
        tenant_id: Uuid,
        session_id: Uuid,
        commit_token: Uuid,
        now: DateTime<Utc>,
        lease_started_before: DateTime<Utc>,
    ) -> Result<CommitClaim, AppError>;

    /// Conditional `committing -> open` for the holder of `commit_token`.
    async fn release_commit(
        &self,
        tenant_id: Uuid,
        session_id: Uuid,
        commit_token: Uuid,
    ) -> Result<bool, AppError>;
}

#[async_trait]
pub trait InventoryRepository: Send + Sync {
    async fn create_item(&self, tenant_id: Uuid, item: NewInventoryItem) -> Result<InventoryItem, AppError>;

    async fn get_item(&self, tenant_id: Uuid, item_id: Uuid) -> Result<Option<InventoryItem>, AppError>;

    async fn find_item_by_sku(&self, tenant_id: Uuid, sku: &str) -> Result<Option<InventoryItem>, AppError>;

    async fn list_items(&self, tenant_id: Uuid) -> Result<Vec<InventoryItem>, AppError>;

    /// Single conditional decrement. `InsufficientStock` leaves the row untouched.
    async fn deduct(
        &self,
        tenant_id: Uuid,
        item_id: Uuid,
        quantity: i64,
    ) -> Result<DeductOutcome, AppError>;

    /// Atomic increment.
    async fn restock(&self, tenant_id: Uuid, item_id: Uuid, quantity: i64) -> Result<InventoryItem, AppError>;

    /// Deduct every line and seal the session in one transaction. Either every deduction
    /// applies and the session becomes `committed`, or nothing changes. Deductions are
    /// applied in ascending item id order.
    async fn deduct_batch(
        &self,
        tenant_id: Uuid,
        deductions: &[Deduction],
        seal: SessionSeal,
    ) -> Result<CommitResult, AppError>;
}

#[async_trait]
pub trait AuditRepository: Send + Sync {
    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), AppError>;

    /// Entries for a tenant, oldest first.
    async fn list_audit(&self, tenant_id: Uuid, limit: i64) -> Result<Vec<AuditEntry>, AppError>;
}

/// One time bucket of a sliding-window counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterBucket {
    pub bucket_start: DateTime<Utc>,
    pub count: u64,
}

#[async_trait]
pub trait CounterRepository: Send + Sync {
    /// Atomically add one to the bucket and return the bucket's new count.
    async fn increment(
        &self,
        key: &str,
        bucket_start: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<u64, AppError>;

    /// Add one to the bucket only if the buckets starting at or after `window_start`
    /// sum to less than `limit`. Returns the new window total, or `None` when the
    /// window is full and nothing was counted. The read and the increment are atomic
    /// per key.
    async fn increment_within_limit(
        &self,
        key: &str,
        bucket_start: DateTime<Utc>,
        expires_at: DateTime<Utc>,
        window_start: DateTime<Utc>,
        limit: u64,
    ) -> Result<Option<u64>, AppError>;

    /// Buckets for `key` starting at or after `since`, oldest first.
    async fn buckets_since(&self, key: &str, since: DateTime<Utc>) -> Result<Vec<CounterBucket>, AppError>;

    /// Drop buckets whose expiry has passed. Returns how many were removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, AppError>;
}

/// Sort deductions by item id (then line id) so concurrent commits lock rows in the same order.
pub fn order_deductions(deductions: &[Deduction]) -> Vec<Deduction> {
    let mut ordered = deductions.to_vec();
    ordered.sort_by(|a, b| a.item_id.cmp(&b.item_id).then(a.line_id.cmp(&b.line_id)));
    ordered
}
