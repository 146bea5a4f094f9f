use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Receiving session lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(
    feature = "sqlx",
    sqlx(type_name = "session_status", rename_all = "lowercase")
)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Open,
    Committing,
    Committed,
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Open => "open",
            SessionStatus::Committing => "committing",
            SessionStatus::Committed => "committed",
            SessionStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Committed | SessionStatus::Cancelled)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Groups the draft lines of one receiving event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceivingSession {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub opened_by: Uuid,
    pub status: SessionStatus,
    /// Set by the bulk-confirmation check; cleared by an explicit acknowledgement.
    pub requires_secondary_confirmation: bool,
    /// Token of the commit attempt currently holding the `committing` marker.
    pub commit_token: Option<Uuid>,
    pub commit_started_at: Option<DateTime<Utc>>,
    pub commit_result: Option<CommitResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub committed_at: Option<DateTime<Utc>>,
}

impl ReceivingSession {
    pub fn new(tenant_id: Uuid, opened_by: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            opened_by,
            status: SessionStatus::Open,
            requires_secondary_confirmation: false,
            commit_token: None,
            commit_started_at: None,
            commit_result: None,
            created_at: now,
            updated_at: now,
            committed_at: None,
        }
    }

    pub fn entity_ref(&self) -> String {
        format!("session:{}", self.id)
    }
}

/// Verification state of a draft line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(
    feature = "sqlx",
    sqlx(type_name = "verification_state", rename_all = "lowercase")
)]
#[serde(rename_all = "lowercase")]
pub enum VerificationState {
    Unverified,
    Confirmed,
    Rejected,
}

/// Machine-extracted candidate inventory movement awaiting human verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DraftLine {
    pub id: Uuid,
    pub session_id: Uuid,
    pub upload_id: Uuid,
    pub tenant_id: Uuid,
    /// Part text as read from the document.
    pub part_reference: String,
    /// Inventory item the part reference resolved to, if any.
    pub item_id: Option<Uuid>,
    pub quantity: i64,
    pub state: VerificationState,
    pub created_at: DateTime<Utc>,
    pub verified_at: Option<DateTime<Utc>>,
    pub verified_by: Option<Uuid>,
}

impl DraftLine {
    pub fn is_resolved(&self) -> bool {
        self.item_id.is_some()
    }

    pub fn entity_ref(&self) -> String {
        format!("line:{}", self.id)
    }
}

/// Line payload extracted from a completed upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDraftLine {
    pub part_reference: String,
    pub quantity: i64,
    #[serde(default)]
    pub item_id: Option<Uuid>,
}

/// Reviewer decision on one line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineDecision {
    pub line_id: Uuid,
    pub state: VerificationState,
}

/// Outcome of a verification batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationOutcome {
    pub lines: Vec<DraftLine>,
    pub confirmed_count: usize,
    pub per_item_seconds: Option<f64>,
    pub requires_secondary_confirmation: bool,
}

/// One successful stock movement performed by a commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeductionReceipt {
    pub line_id: Uuid,
    pub item_id: Uuid,
    pub quantity: i64,
    pub new_quantity: i64,
}

/// Stored result of a committed session, replayed on every repeat commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitResult {
    pub session_id: Uuid,
    pub deductions: Vec<DeductionReceipt>,
    pub committed_by: Uuid,
    pub committed_at: DateTime<Utc>,
}

/// What a caller sees from `commit`: the stored result and whether it was a replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitOutcome {
    pub result: CommitResult,
    pub replayed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(SessionStatus::Committed.is_terminal());
        assert!(SessionStatus::Cancelled.is_terminal());
        assert!(!SessionStatus::Open.is_terminal());
        assert!(!SessionStatus::Committing.is_terminal());
    }

    #[test]
    fn test_new_session_is_open() {
        let session = ReceivingSession::new(Uuid::new_v4(), Uuid::new_v4(), Utc::now());
        assert_eq!(session.status, SessionStatus::Open);
        assert!(!session.requires_secondary_confirmation);
        assert!(session.commit_result.is_none());
    }
}
