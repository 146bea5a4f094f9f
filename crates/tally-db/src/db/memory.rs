//! In-process repositories
//!
//! [`MemoryStore`] implements every repository trait over one state guarded by a single
//! async mutex, so each trait method is atomic exactly like its Postgres counterpart.
//! Rate counters live in a separate sharded map to keep the hot path off the main lock.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tally_core::models::{
    AuditEntry, CommitResult, DeductOutcome, Deduction, DeductionReceipt, DraftLine,
    FingerprintRecord, InventoryItem, LineDecision, NewInventoryItem, NewUpload,
    QuarantineRecord, QuarantineResolution, ReceivingSession, SessionStatus, Upload, UploadStatus,
    VerificationState,
};
use tally_core::AppError;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::db::repository::{
    order_deductions, AuditRepository, CommitClaim, CounterBucket, CounterRepository,
    FingerprintRepository, InventoryRepository, OcrSummary, QuarantineRepository,
    SessionRepository, SessionSeal, UploadRepository,
};

const COUNTER_SHARDS: usize = 16;

#[derive(Default)]
struct MemoryState {
    uploads: HashMap<Uuid, Upload>,
    fingerprints: HashMap<(Uuid, String), FingerprintRecord>,
    quarantine: HashMap<Uuid, QuarantineRecord>,
    sessions: HashMap<Uuid, ReceivingSession>,
    lines: HashMap<Uuid, DraftLine>,
    items: HashMap<Uuid, InventoryItem>,
    audit: Vec<AuditEntry>,
}

struct CounterEntry {
    buckets: BTreeMap<DateTime<Utc>, (u64, DateTime<Utc>)>,
}

/// In-process implementation of every repository trait
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    counter_shards: Vec<Arc<Mutex<HashMap<String, CounterEntry>>>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            counter_shards: (0..COUNTER_SHARDS)
                .map(|_| Arc::new(Mutex::new(HashMap::new())))
                .collect(),
        }
    }

    fn shard_index(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.counter_shards.len()
    }

    /// Number of audit entries across all tenants.
    pub async fn audit_len(&self) -> usize {
        self.state.lock().await.audit.len()
    }
}

fn require_open(state: &MemoryState, tenant_id: Uuid, session_id: Uuid) -> Result<(), AppError> {
    let session = state
        .sessions
        .get(&session_id)
        .filter(|s| s.tenant_id == tenant_id)
        .ok_or_else(|| AppError::NotFound(format!("Session {} not found", session_id)))?;
    if session.status != SessionStatus::Open {
        return Err(AppError::InvalidState(format!(
            "Session {} is {}; lines can only change while it is open",
            session_id, session.status
        )));
    }
    Ok(())
}

fn check_stock(
    state: &MemoryState,
    tenant_id: Uuid,
    item_id: Uuid,
    line_id: Option<Uuid>,
    quantity: i64,
) -> Result<(), AppError> {
    let item = state
        .items
        .get(&item_id)
        .filter(|i| i.tenant_id == tenant_id)
        .ok_or_else(|| AppError::NotFound(format!("Inventory item {} not found", item_id)))?;
    if item.quantity_on_hand < quantity {
        return Err(AppError::InsufficientStock {
            item_id,
            line_id,
            requested: quantity,
            available: item.quantity_on_hand,
            shortfall: quantity - item.quantity_on_hand,
        });
    }
    Ok(())
}

/// Apply a conditional transition on an upload held in `state`.
fn transition_upload(
    state: &mut MemoryState,
    upload_id: Uuid,
    from: UploadStatus,
    apply: impl FnOnce(&mut Upload),
) -> Option<Upload> {
    let upload = state.uploads.get_mut(&upload_id)?;
    if upload.status != from {
        return None;
    }
    apply(upload);
    Some(upload.clone())
}

#[async_trait]
impl UploadRepository for MemoryStore {
    async fn insert_upload(&self, upload: NewUpload) -> Result<Upload, AppError> {
        let mut state = self.state.lock().await;
        if state.uploads.contains_key(&upload.id) {
            return Err(AppError::InvalidInput(format!(
                "Upload {} already exists",
                upload.id
            )));
        }
        let upload = upload.into_upload();
        state.uploads.insert(upload.id, upload.clone());
        Ok(upload)
    }

    async fn get_upload(&self, tenant_id: Uuid, upload_id: Uuid) -> Result<Option<Upload>, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .uploads
            .get(&upload_id)
            .filter(|u| u.tenant_id == tenant_id)
            .cloned())
    }

    async fn claim_upload(&self, upload_id: Uuid, now: DateTime<Utc>) -> Result<Option<Upload>, AppError> {
        let mut state = self.state.lock().await;
        Ok(transition_upload(&mut state, upload_id, UploadStatus::Queued, |u| {
            u.status = UploadStatus::Processing;
            u.attempts += 1;
            u.processing_started_at = Some(now);
            u.next_attempt_at = None;
        }))
    }

    async fn claim_next_queued(&self, now: DateTime<Utc>) -> Result<Option<Upload>, AppError> {
        let mut state = self.state.lock().await;
        let next = state
            .uploads
            .values()
            .filter(|u| u.status == UploadStatus::Queued)
            .filter(|u| u.next_attempt_at.map(|at| at <= now).unwrap_or(true))
            .min_by_key(|u| (u.uploaded_at, u.id))
            .map(|u| u.id);

        Ok(next.and_then(|id| {
            transition_upload(&mut state, id, UploadStatus::Queued, |u| {
                u.status = UploadStatus::Processing;
                u.attempts += 1;
                u.processing_started_at = Some(now);
                u.next_attempt_at = None;
            })
        }))
    }

    async fn complete_upload(
        &self,
        upload_id: Uuid,
        summary: OcrSummary,
        now: DateTime<Utc>,
    ) -> Result<Option<Upload>, AppError> {
        let mut state = self.state.lock().await;
        Ok(transition_upload(&mut state, upload_id, UploadStatus::Processing, |u| {
            u.status = UploadStatus::Completed;
            u.processed_at = Some(now);
            u.ocr_char_count = Some(summary.char_count);
            u.ocr_mean_confidence = summary.mean_confidence;
        }))
    }

    async fn quarantine_processed_upload(
        &self,
        upload_id: Uuid,
        summary: OcrSummary,
        now: DateTime<Utc>,
    ) -> Result<Option<Upload>, AppError> {
        let mut state = self.state.lock().await;
        Ok(transition_upload(&mut state, upload_id, UploadStatus::Processing, |u| {
            u.status = UploadStatus::Quarantined;
            u.processed_at = Some(now);
            u.ocr_char_count = Some(summary.char_count);
            u.ocr_mean_confidence = summary.mean_confidence;
        }))
    }

    async fn fail_upload(&self, upload_id: Uuid, now: DateTime<Utc>) -> Result<Option<Upload>, AppError> {
        let mut state = self.state.lock().await;
        Ok(transition_upload(&mut state, upload_id, UploadStatus::Processing, |u| {
            u.status = UploadStatus::Failed;
            u.processed_at = Some(now);
        }))
    }

    async fn schedule_retry(
        &self,
        upload_id: Uuid,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<Option<Upload>, AppError> {
        let mut state = self.state.lock().await;
        Ok(transition_upload(&mut state, upload_id, UploadStatus::Processing, |u| {
            u.status = UploadStatus::Queued;
            u.next_attempt_at = Some(next_attempt_at);
            u.processing_started_at = None;
        }))
    }

    async fn requeue_quarantined(&self, tenant_id: Uuid, upload_id: Uuid) -> Result<Option<Upload>, AppError> {
        let mut state = self.state.lock().await;
        let owned = state
            .uploads
            .get(&upload_id)
            .map(|u| u.tenant_id == tenant_id)
            .unwrap_or(false);
        if !owned {
            return Ok(None);
        }
        Ok(transition_upload(&mut state, upload_id, UploadStatus::Quarantined, |u| {
            u.status = UploadStatus::Queued;
            u.attempts = 0;
            u.next_attempt_at = None;
            u.processing_started_at = None;
            u.processed_at = None;
        }))
    }

    async fn requeue_stale(&self, started_before: DateTime<Utc>) -> Result<Vec<Uuid>, AppError> {
        let mut state = self.state.lock().await;
        let mut requeued = Vec::new();
        for upload in state.uploads.values_mut() {
            let stale = upload.status == UploadStatus::Processing
                && upload
                    .processing_started_at
                    .map(|at| at < started_before)
                    .unwrap_or(true);
            if stale {
                upload.status = UploadStatus::Queued;
                upload.processing_started_at = None;
                upload.next_attempt_at = None;
                requeued.push(upload.id);
            }
        }
        Ok(requeued)
    }
}

#[async_trait]
impl FingerprintRepository for MemoryStore {
    async fn find_fingerprint(
        &self,
        tenant_id: Uuid,
        content_hash: &str,
    ) -> Result<Option<FingerprintRecord>, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .fingerprints
            .get(&(tenant_id, content_hash.to_string()))
            .cloned())
    }

    async fn upsert_fingerprint(
        &self,
        tenant_id: Uuid,
        content_hash: &str,
        upload_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<FingerprintRecord, AppError> {
        let mut state = self.state.lock().await;
        let record = FingerprintRecord {
            tenant_id,
            content_hash: content_hash.to_string(),
            upload_id,
            registered_at: now,
        };
        state
            .fingerprints
            .insert((tenant_id, content_hash.to_string()), record.clone());
        Ok(record)
    }

    async fn remove_fingerprint(
        &self,
        tenant_id: Uuid,
        content_hash: &str,
        upload_id: Uuid,
    ) -> Result<bool, AppError> {
        let mut state = self.state.lock().await;
        let key = (tenant_id, content_hash.to_string());
        let matches = state
            .fingerprints
            .get(&key)
            .map(|r| r.upload_id == upload_id)
            .unwrap_or(false);
        if matches {
            state.fingerprints.remove(&key);
        }
        Ok(matches)
    }
}

#[async_trait]
impl QuarantineRepository for MemoryStore {
    async fn insert_quarantine(&self, record: QuarantineRecord) -> Result<QuarantineRecord, AppError> {
        let mut state = self.state.lock().await;
        state.quarantine.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_quarantine(
        &self,
        tenant_id: Uuid,
        record_id: Uuid,
    ) -> Result<Option<QuarantineRecord>, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .quarantine
            .get(&record_id)
            .filter(|r| r.tenant_id == tenant_id)
            .cloned())
    }

    async fn list_pending_quarantine(&self, tenant_id: Uuid) -> Result<Vec<QuarantineRecord>, AppError> {
        let state = self.state.lock().await;
        let mut pending: Vec<QuarantineRecord> = state
            .quarantine
            .values()
            .filter(|r| r.tenant_id == tenant_id && r.is_pending())
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.quarantined_at);
        Ok(pending)
    }

    async fn resolve_quarantine(
        &self,
        tenant_id: Uuid,
        record_id: Uuid,
        resolution: QuarantineResolution,
        reviewer_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<QuarantineRecord>, AppError> {
        let mut state = self.state.lock().await;
        let Some(record) = state
            .quarantine
            .get_mut(&record_id)
            .filter(|r| r.tenant_id == tenant_id && r.is_pending())
        else {
            return Ok(None);
        };
        record.resolution = Some(resolution);
        record.reviewed_by = Some(reviewer_id);
        record.reviewed_at = Some(now);
        Ok(Some(record.clone()))
    }
}

#[async_trait]
impl SessionRepository for MemoryStore {
    async fn insert_session(&self, session: ReceivingSession) -> Result<ReceivingSession, AppError> {
        let mut state = self.state.lock().await;
        state.sessions.insert(session.id, session.clone());
        Ok(session)
    }

    async fn get_session(
        &self,
        tenant_id: Uuid,
        session_id: Uuid,
    ) -> Result<Option<ReceivingSession>, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .sessions
            .get(&session_id)
            .filter(|s| s.tenant_id == tenant_id)
            .cloned())
    }

    async fn list_lines(&self, tenant_id: Uuid, session_id: Uuid) -> Result<Vec<DraftLine>, AppError> {
        let state = self.state.lock().await;
        let mut lines: Vec<DraftLine> = state
            .lines
            .values()
            .filter(|l| l.session_id == session_id && l.tenant_id == tenant_id)
            .cloned()
            .collect();
        lines.sort_by_key(|l| (l.created_at, l.id));
        Ok(lines)
    }

    async fn insert_lines(
        &self,
        tenant_id: Uuid,
        session_id: Uuid,
        lines: Vec<DraftLine>,
    ) -> Result<Vec<DraftLine>, AppError> {
        let mut state = self.state.lock().await;
        require_open(&state, tenant_id, session_id)?;
        let mut inserted = Vec::with_capacity(lines.len());
        for mut line in lines {
            line.session_id = session_id;
            line.tenant_id = tenant_id;
            state.lines.insert(line.id, line.clone());
            inserted.push(line);
        }
        Ok(inserted)
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
        let mut state = self.state.lock().await;
        require_open(&state, tenant_id, session_id)?;

        // Validate every line before touching any of them.
        for decision in decisions {
            let found = state
                .lines
                .get(&decision.line_id)
                .map(|l| l.session_id == session_id)
                .unwrap_or(false);
            if !found {
                return Err(AppError::NotFound(format!(
                    "Line {} not found in session {}",
                    decision.line_id, session_id
                )));
            }
        }

        let mut updated = Vec::with_capacity(decisions.len());
        for decision in decisions {
            if let Some(line) = state.lines.get_mut(&decision.line_id) {
                line.state = decision.state;
                if decision.state == VerificationState::Unverified {
                    line.verified_at = None;
                    line.verified_by = None;
                } else {
                    line.verified_at = Some(now);
                    line.verified_by = Some(verifier_id);
                }
                updated.push(line.clone());
            }
        }

        if requires_secondary_confirmation {
            if let Some(session) = state.sessions.get_mut(&session_id) {
                session.requires_secondary_confirmation = true;
                session.updated_at = now;
            }
        }
        Ok(updated)
    }

    async fn resolve_line(
        &self,
        tenant_id: Uuid,
        session_id: Uuid,
        line_id: Uuid,
        item_id: Uuid,
    ) -> Result<DraftLine, AppError> {
        let mut state = self.state.lock().await;
        require_open(&state, tenant_id, session_id)?;
        let line = state
            .lines
            .get_mut(&line_id)
            .filter(|l| l.session_id == session_id)
            .ok_or_else(|| {
                AppError::NotFound(format!("Line {} not found in session {}", line_id, session_id))
            })?;
        line.item_id = Some(item_id);
        Ok(line.clone())
    }

    async fn acknowledge_confirmation(
        &self,
        tenant_id: Uuid,
        session_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ReceivingSession, AppError> {
        let mut state = self.state.lock().await;
        require_open(&state, tenant_id, session_id)?;
        let session = state
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| AppError::NotFound(format!("Session {} not found", session_id)))?;
        session.requires_secondary_confirmation = false;
        session.updated_at = now;
        Ok(session.clone())
    }

    async fn cancel_session(
        &self,
        tenant_id: Uuid,
        session_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<ReceivingSession>, AppError> {
        let mut state = self.state.lock().await;
        let Some(session) = state
            .sessions
            .get_mut(&session_id)
            .filter(|s| s.tenant_id == tenant_id && s.status == SessionStatus::Open)
        else {
            return Ok(None);
        };
        session.status = SessionStatus::Cancelled;
        session.requires_secondary_confirmation = false;
        session.updated_at = now;
        let cancelled = session.clone();
        state.lines.retain(|_, line| line.session_id != session_id);
        Ok(Some(cancelled))
    }

    async fn claim_commit(
        &self,
        tenant_id: Uuid,
        session_id: Uuid,
        commit_token: Uuid,
        now: DateTime<Utc>,
        lease_started_before: DateTime<Utc>,
    ) -> Result<CommitClaim, AppError> {
        let mut state = self.state.lock().await;
        let session = state
            .sessions
            .get_mut(&session_id)
            .filter(|s| s.tenant_id == tenant_id)
            .ok_or_else(|| AppError::NotFound(format!("Session {} not found", session_id)))?;

        match session.status {
            SessionStatus::Committed => {
                return match &session.commit_result {
                    Some(result) => Ok(CommitClaim::AlreadyCommitted(result.clone())),
                    None => Err(AppError::Internal(format!(
                        "Session {} is committed without a stored result",
                        session_id
                    ))),
                };
            }
            SessionStatus::Cancelled => {
                return Ok(CommitClaim::NotCommittable(SessionStatus::Cancelled));
            }
            SessionStatus::Committing => {
                let stale = session
                    .commit_started_at
                    .map(|started| started < lease_started_before)
                    .unwrap_or(true);
                if !stale {
                    return Ok(CommitClaim::InFlight {
                        started_at: session.commit_started_at,
                    });
                }
                tracing::warn!(
                    session_id = %session_id,
                    stale_token = ?session.commit_token,
                    "Reclaiming abandoned commit marker"
                );
            }
            SessionStatus::Open => {}
        }

        session.status = SessionStatus::Committing;
        session.commit_token = Some(commit_token);
        session.commit_started_at = Some(now);
        session.updated_at = now;
        Ok(CommitClaim::Claimed(session.clone()))
    }

    async fn release_commit(
        &self,
        tenant_id: Uuid,
        session_id: Uuid,
        commit_token: Uuid,
    ) -> Result<bool, AppError> {
        let mut state = self.state.lock().await;
        let Some(session) = state.sessions.get_mut(&session_id).filter(|s| {
            s.tenant_id == tenant_id
                && s.status == SessionStatus::Committing
                && s.commit_token == Some(commit_token)
        }) else {
            return Ok(false);
        };
        session.status = SessionStatus::Open;
        session.commit_token = None;
        session.commit_started_at = None;
        session.updated_at = Utc::now();
        Ok(true)
    }
}

#[async_trait]
impl InventoryRepository for MemoryStore {
    async fn create_item(&self, tenant_id: Uuid, item: NewInventoryItem) -> Result<InventoryItem, AppError> {
        let mut state = self.state.lock().await;
        let duplicate = state
            .items
            .values()
            .any(|i| i.tenant_id == tenant_id && i.sku == item.sku);
        if duplicate {
            return Err(AppError::InvalidInput(format!(
                "SKU '{}' already exists",
                item.sku
            )));
        }
        let now = Utc::now();
        let created = InventoryItem {
            id: Uuid::new_v4(),
            tenant_id,
            sku: item.sku,
            name: item.name,
            quantity_on_hand: item.quantity_on_hand,
            created_at: now,
            updated_at: now,
        };
        state.items.insert(created.id, created.clone());
        Ok(created)
    }

    async fn get_item(&self, tenant_id: Uuid, item_id: Uuid) -> Result<Option<InventoryItem>, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .items
            .get(&item_id)
            .filter(|i| i.tenant_id == tenant_id)
            .cloned())
    }

    async fn find_item_by_sku(&self, tenant_id: Uuid, sku: &str) -> Result<Option<InventoryItem>, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .items
            .values()
            .find(|i| i.tenant_id == tenant_id && i.sku == sku)
            .cloned())
    }

    async fn list_items(&self, tenant_id: Uuid) -> Result<Vec<InventoryItem>, AppError> {
        let state = self.state.lock().await;
        let mut items: Vec<InventoryItem> = state
            .items
            .values()
            .filter(|i| i.tenant_id == tenant_id)
            .cloned()
            .collect();
        items.sort_by(|a, b| a.sku.cmp(&b.sku));
        Ok(items)
    }

    async fn deduct(
        &self,
        tenant_id: Uuid,
        item_id: Uuid,
        quantity: i64,
    ) -> Result<DeductOutcome, AppError> {
        let mut state = self.state.lock().await;
        check_stock(&state, tenant_id, item_id, None, quantity)?;
        let item = state
            .items
            .get_mut(&item_id)
            .ok_or_else(|| AppError::NotFound(format!("Inventory item {} not found", item_id)))?;
        item.quantity_on_hand -= quantity;
        item.updated_at = Utc::now();
        Ok(DeductOutcome {
            item_id,
            new_quantity: item.quantity_on_hand,
        })
    }

    async fn restock(&self, tenant_id: Uuid, item_id: Uuid, quantity: i64) -> Result<InventoryItem, AppError> {
        let mut state = self.state.lock().await;
        let item = state
            .items
            .get_mut(&item_id)
            .filter(|i| i.tenant_id == tenant_id)
            .ok_or_else(|| AppError::NotFound(format!("Inventory item {} not found", item_id)))?;
        item.quantity_on_hand += quantity;
        item.updated_at = Utc::now();
        Ok(item.clone())
    }

    async fn deduct_batch(
        &self,
        tenant_id: Uuid,
        deductions: &[Deduction],
        seal: SessionSeal,
    ) -> Result<CommitResult, AppError> {
        let mut state = self.state.lock().await;

        let holds_marker = state
            .sessions
            .get(&seal.session_id)
            .filter(|s| s.tenant_id == tenant_id)
            .map(|s| s.status == SessionStatus::Committing && s.commit_token == Some(seal.commit_token))
            .ok_or_else(|| AppError::NotFound(format!("Session {} not found", seal.session_id)))?;
        if !holds_marker {
            return Err(AppError::CommitConflict {
                session_id: seal.session_id,
                reason: "Commit marker is no longer held by this attempt".to_string(),
            });
        }

        // Dry run over a scratch copy of the touched quantities, then apply.
        let ordered = order_deductions(deductions);
        let mut remaining: HashMap<Uuid, i64> = HashMap::new();
        let mut receipts = Vec::with_capacity(ordered.len());
        for deduction in &ordered {
            let available = match remaining.get(&deduction.item_id) {
                Some(qty) => *qty,
                None => {
                    check_stock(&state, tenant_id, deduction.item_id, Some(deduction.line_id), 0)?;
                    state
                        .items
                        .get(&deduction.item_id)
                        .map(|i| i.quantity_on_hand)
                        .unwrap_or(0)
                }
            };
            if available < deduction.quantity {
                return Err(AppError::InsufficientStock {
                    item_id: deduction.item_id,
                    line_id: Some(deduction.line_id),
                    requested: deduction.quantity,
                    available,
                    shortfall: deduction.quantity - available,
                });
            }
            let new_quantity = available - deduction.quantity;
            remaining.insert(deduction.item_id, new_quantity);
            receipts.push(DeductionReceipt {
                line_id: deduction.line_id,
                item_id: deduction.item_id,
                quantity: deduction.quantity,
                new_quantity,
            });
        }

        let now = Utc::now();
        for (item_id, quantity) in remaining {
            if let Some(item) = state.items.get_mut(&item_id) {
                item.quantity_on_hand = quantity;
                item.updated_at = now;
            }
        }

        let result = CommitResult {
            session_id: seal.session_id,
            deductions: receipts,
            committed_by: seal.committed_by,
            committed_at: seal.committed_at,
        };
        if let Some(session) = state.sessions.get_mut(&seal.session_id) {
            session.status = SessionStatus::Committed;
            session.commit_result = Some(result.clone());
            session.committed_at = Some(seal.committed_at);
            session.commit_token = None;
            session.commit_started_at = None;
            session.updated_at = now;
        }
        Ok(result)
    }
}

#[async_trait]
impl AuditRepository for MemoryStore {
    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        state.audit.push(entry.clone());
        Ok(())
    }

    async fn list_audit(&self, tenant_id: Uuid, limit: i64) -> Result<Vec<AuditEntry>, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .audit
            .iter()
            .filter(|e| e.tenant_id == tenant_id)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl CounterRepository for MemoryStore {
    async fn increment(
        &self,
        key: &str,
        bucket_start: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let shard = &self.counter_shards[self.shard_index(key)];
        let mut counters = shard.lock().await;
        let entry = counters
            .entry(key.to_string())
            .or_insert_with(|| CounterEntry {
                buckets: BTreeMap::new(),
            });
        let bucket = entry.buckets.entry(bucket_start).or_insert((0, expires_at));
        bucket.0 += 1;
        Ok(bucket.0)
    }

    async fn increment_within_limit(
        &self,
        key: &str,
        bucket_start: DateTime<Utc>,
        expires_at: DateTime<Utc>,
        window_start: DateTime<Utc>,
        limit: u64,
    ) -> Result<Option<u64>, AppError> {
        let shard = &self.counter_shards[self.shard_index(key)];
        let mut counters = shard.lock().await;
        let entry = counters
            .entry(key.to_string())
            .or_insert_with(|| CounterEntry {
                buckets: BTreeMap::new(),
            });
        let total: u64 = entry.buckets.range(window_start..).map(|(_, (count, _))| *count).sum();
        if total >= limit {
            return Ok(None);
        }
        let bucket = entry.buckets.entry(bucket_start).or_insert((0, expires_at));
        bucket.0 += 1;
        Ok(Some(total + 1))
    }

    async fn buckets_since(&self, key: &str, since: DateTime<Utc>) -> Result<Vec<CounterBucket>, AppError> {
        let shard = &self.counter_shards[self.shard_index(key)];
        let counters = shard.lock().await;
        Ok(counters
            .get(key)
            .map(|entry| {
                entry
                    .buckets
                    .range(since..)
                    .map(|(start, (count, _))| CounterBucket {
                        bucket_start: *start,
                        count: *count,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, AppError> {
        let mut purged = 0u64;
        for shard in &self.counter_shards {
            let mut counters = shard.lock().await;
            for entry in counters.values_mut() {
                let before = entry.buckets.len();
                entry.buckets.retain(|_, (_, expires_at)| *expires_at >= now);
                purged += (before - entry.buckets.len()) as u64;
            }
            counters.retain(|_, entry| !entry.buckets.is_empty());
        }
        if purged > 0 {
            tracing::debug!(buckets_purged = purged, "Purged expired rate counter buckets");
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn seeded_item(store: &MemoryStore, tenant_id: Uuid, qty: i64) -> InventoryItem {
        store
            .create_item(
                tenant_id,
                NewInventoryItem {
                    sku: format!("SKU-{}", Uuid::new_v4()),
                    name: "Gasket".to_string(),
                    quantity_on_hand: qty,
                },
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_concurrent_deductions_never_overdraw() {
        let store = MemoryStore::new();
        let tenant_id = Uuid::new_v4();
        let item = seeded_item(&store, tenant_id, 10).await;

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.deduct(tenant_id, item.id, 5).await })
            })
            .collect();

        let mut ok = 0;
        let mut short = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => ok += 1,
                Err(AppError::InsufficientStock { shortfall, .. }) => {
                    assert_eq!(shortfall, 5);
                    short += 1;
                }
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!((ok, short), (2, 1));
        let item = store.get_item(tenant_id, item.id).await.unwrap().unwrap();
        assert_eq!(item.quantity_on_hand, 0);
    }

    #[tokio::test]
    async fn test_deduct_from_other_tenant_is_not_found() {
        let store = MemoryStore::new();
        let item = seeded_item(&store, Uuid::new_v4(), 10).await;
        let result = store.deduct(Uuid::new_v4(), item.id, 1).await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_batch_is_all_or_nothing() {
        let store = MemoryStore::new();
        let tenant_id = Uuid::new_v4();
        let plenty = seeded_item(&store, tenant_id, 10).await;
        let scarce = seeded_item(&store, tenant_id, 1).await;

        let now = Utc::now();
        let session = store
            .insert_session(ReceivingSession::new(tenant_id, Uuid::new_v4(), now))
            .await
            .unwrap();
        let token = Uuid::new_v4();
        store
            .claim_commit(tenant_id, session.id, token, now, now - Duration::seconds(60))
            .await
            .unwrap();

        let scarce_line = Uuid::new_v4();
        let deductions = [
            Deduction {
                line_id: Uuid::new_v4(),
                item_id: plenty.id,
                quantity: 4,
            },
            Deduction {
                line_id: scarce_line,
                item_id: scarce.id,
                quantity: 2,
            },
        ];
        let seal = SessionSeal {
            session_id: session.id,
            commit_token: token,
            committed_by: Uuid::new_v4(),
            committed_at: now,
        };

        let err = store.deduct_batch(tenant_id, &deductions, seal).await.unwrap_err();
        match err {
            AppError::InsufficientStock {
                item_id,
                line_id,
                shortfall,
                ..
            } => {
                assert_eq!(item_id, scarce.id);
                assert_eq!(line_id, Some(scarce_line));
                assert_eq!(shortfall, 1);
            }
            other => panic!("unexpected error: {other}"),
        }

        let plenty = store.get_item(tenant_id, plenty.id).await.unwrap().unwrap();
        assert_eq!(plenty.quantity_on_hand, 10);
        let session = store.get_session(tenant_id, session.id).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Committing);
    }

    #[tokio::test]
    async fn test_batch_sums_lines_on_same_item() {
        let store = MemoryStore::new();
        let tenant_id = Uuid::new_v4();
        let item = seeded_item(&store, tenant_id, 5).await;
        let now = Utc::now();
        let session = store
            .insert_session(ReceivingSession::new(tenant_id, Uuid::new_v4(), now))
            .await
            .unwrap();
        let token = Uuid::new_v4();
        store
            .claim_commit(tenant_id, session.id, token, now, now - Duration::seconds(60))
            .await
            .unwrap();

        let deductions = [
            Deduction {
                line_id: Uuid::new_v4(),
                item_id: item.id,
                quantity: 3,
            },
            Deduction {
                line_id: Uuid::new_v4(),
                item_id: item.id,
                quantity: 3,
            },
        ];
        let seal = SessionSeal {
            session_id: session.id,
            commit_token: token,
            committed_by: Uuid::new_v4(),
            committed_at: now,
        };
        let result = store.deduct_batch(tenant_id, &deductions, seal).await;
        assert!(matches!(result, Err(AppError::InsufficientStock { available: 2, .. })));
        let item = store.get_item(tenant_id, item.id).await.unwrap().unwrap();
        assert_eq!(item.quantity_on_hand, 5);
    }

    #[tokio::test]
    async fn test_claim_commit_states() {
        let store = MemoryStore::new();
        let tenant_id = Uuid::new_v4();
        let now = Utc::now();
        let session = store
            .insert_session(ReceivingSession::new(tenant_id, Uuid::new_v4(), now))
            .await
            .unwrap();
        let lease = now - Duration::seconds(60);

        let first_token = Uuid::new_v4();
        let first = store
            .claim_commit(tenant_id, session.id, first_token, now, lease)
            .await
            .unwrap();
        assert!(matches!(first, CommitClaim::Claimed(_)));

        let second = store
            .claim_commit(tenant_id, session.id, Uuid::new_v4(), now, lease)
            .await
            .unwrap();
        assert!(matches!(second, CommitClaim::InFlight { .. }));

        // A marker older than the lease is taken over.
        let later = now + Duration::seconds(120);
        let takeover = store
            .claim_commit(
                tenant_id,
                session.id,
                Uuid::new_v4(),
                later,
                later - Duration::seconds(60),
            )
            .await
            .unwrap();
        assert!(matches!(takeover, CommitClaim::Claimed(_)));

        // The original holder can no longer release it.
        assert!(!store
            .release_commit(tenant_id, session.id, first_token)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_cancel_removes_lines_and_blocks_edits() {
        let store = MemoryStore::new();
        let tenant_id = Uuid::new_v4();
        let now = Utc::now();
        let session = store
            .insert_session(ReceivingSession::new(tenant_id, Uuid::new_v4(), now))
            .await
            .unwrap();
        let line = DraftLine {
            id: Uuid::new_v4(),
            session_id: session.id,
            upload_id: Uuid::new_v4(),
            tenant_id,
            part_reference: "PN-1".to_string(),
            item_id: None,
            quantity: 1,
            state: VerificationState::Unverified,
            created_at: now,
            verified_at: None,
            verified_by: None,
        };
        store
            .insert_lines(tenant_id, session.id, vec![line.clone()])
            .await
            .unwrap();

        let cancelled = store.cancel_session(tenant_id, session.id, now).await.unwrap();
        assert_eq!(cancelled.unwrap().status, SessionStatus::Cancelled);
        assert!(store.list_lines(tenant_id, session.id).await.unwrap().is_empty());

        let result = store.insert_lines(tenant_id, session.id, vec![line]).await;
        assert!(matches!(result, Err(AppError::InvalidState(_))));
        assert!(store
            .cancel_session(tenant_id, session.id, now)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_upload_claim_is_exclusive() {
        let store = MemoryStore::new();
        let upload = store
            .insert_upload(NewUpload {
                id: Uuid::new_v4(),
                tenant_id: Uuid::new_v4(),
                uploader_id: Uuid::new_v4(),
                content_hash: "ab".repeat(32),
                byte_size: 4096,
                media_type: "image/png".to_string(),
                width: None,
                height: None,
                quality: None,
                status: UploadStatus::Queued,
                storage_ref: "accepted/t/ab/ab.png".to_string(),
                uploaded_at: Utc::now(),
            })
            .await
            .unwrap();

        let now = Utc::now();
        assert!(store.claim_upload(upload.id, now).await.unwrap().is_some());
        assert!(store.claim_upload(upload.id, now).await.unwrap().is_none());
        assert!(store.claim_next_queued(now).await.unwrap().is_none());

        let requeued = store
            .requeue_stale(now + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(requeued, vec![upload.id]);
        let claimed = store.claim_next_queued(now).await.unwrap().unwrap();
        assert_eq!(claimed.attempts, 2);
    }

    #[tokio::test]
    async fn test_counters_bucket_and_purge() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let expires = now + Duration::seconds(60);

        assert_eq!(store.increment("k", now, expires).await.unwrap(), 1);
        assert_eq!(store.increment("k", now, expires).await.unwrap(), 2);
        let buckets = store.buckets_since("k", now - Duration::seconds(1)).await.unwrap();
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].count, 2);

        let purged = store.purge_expired(expires + Duration::seconds(1)).await.unwrap();
        assert_eq!(purged, 1);
        assert!(store.buckets_since("k", now - Duration::seconds(1)).await.unwrap().is_empty());
    }
}
