use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Mutating decisions recorded in the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    UploadAdmitted,
    UploadRejected,
    UploadQuarantined,
    UploadCompleted,
    UploadFailed,
    ProcessingFailed,
    RateLimitTripped,
    PermissionDenied,
    SessionStarted,
    SessionUpdateFailed,
    LinesAttached,
    LinesVerified,
    PartResolved,
    BulkConfirmationRequired,
    BulkConfirmationAcknowledged,
    SessionCancelled,
    DeductionSucceeded,
    DeductionFailed,
    SessionCommitted,
    SessionRolledBack,
    CommitFailed,
    QuarantineReleased,
    QuarantineDismissed,
    QuarantineReviewFailed,
    ItemCreated,
    ItemRestocked,
    StockUpdateFailed,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::UploadAdmitted => "upload_admitted",
            AuditAction::UploadRejected => "upload_rejected",
            AuditAction::UploadQuarantined => "upload_quarantined",
            AuditAction::UploadCompleted => "upload_completed",
            AuditAction::UploadFailed => "upload_failed",
            AuditAction::ProcessingFailed => "processing_failed",
            AuditAction::RateLimitTripped => "rate_limit_tripped",
            AuditAction::PermissionDenied => "permission_denied",
            AuditAction::SessionStarted => "session_started",
            AuditAction::SessionUpdateFailed => "session_update_failed",
            AuditAction::LinesAttached => "lines_attached",
            AuditAction::LinesVerified => "lines_verified",
            AuditAction::PartResolved => "part_resolved",
            AuditAction::BulkConfirmationRequired => "bulk_confirmation_required",
            AuditAction::BulkConfirmationAcknowledged => "bulk_confirmation_acknowledged",
            AuditAction::SessionCancelled => "session_cancelled",
            AuditAction::DeductionSucceeded => "deduction_succeeded",
            AuditAction::DeductionFailed => "deduction_failed",
            AuditAction::SessionCommitted => "session_committed",
            AuditAction::SessionRolledBack => "session_rolled_back",
            AuditAction::CommitFailed => "commit_failed",
            AuditAction::QuarantineReleased => "quarantine_released",
            AuditAction::QuarantineDismissed => "quarantine_dismissed",
            AuditAction::QuarantineReviewFailed => "quarantine_review_failed",
            AuditAction::ItemCreated => "item_created",
            AuditAction::ItemRestocked => "item_restocked",
            AuditAction::StockUpdateFailed => "stock_update_failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let action = match value {
            "upload_admitted" => AuditAction::UploadAdmitted,
            "upload_rejected" => AuditAction::UploadRejected,
            "upload_quarantined" => AuditAction::UploadQuarantined,
            "upload_completed" => AuditAction::UploadCompleted,
            "upload_failed" => AuditAction::UploadFailed,
            "processing_failed" => AuditAction::ProcessingFailed,
            "rate_limit_tripped" => AuditAction::RateLimitTripped,
            "permission_denied" => AuditAction::PermissionDenied,
            "session_started" => AuditAction::SessionStarted,
            "session_update_failed" => AuditAction::SessionUpdateFailed,
            "lines_attached" => AuditAction::LinesAttached,
            "lines_verified" => AuditAction::LinesVerified,
            "part_resolved" => AuditAction::PartResolved,
            "bulk_confirmation_required" => AuditAction::BulkConfirmationRequired,
            "bulk_confirmation_acknowledged" => AuditAction::BulkConfirmationAcknowledged,
            "session_cancelled" => AuditAction::SessionCancelled,
            "deduction_succeeded" => AuditAction::DeductionSucceeded,
            "deduction_failed" => AuditAction::DeductionFailed,
            "session_committed" => AuditAction::SessionCommitted,
            "session_rolled_back" => AuditAction::SessionRolledBack,
            "commit_failed" => AuditAction::CommitFailed,
            "quarantine_released" => AuditAction::QuarantineReleased,
            "quarantine_dismissed" => AuditAction::QuarantineDismissed,
            "quarantine_review_failed" => AuditAction::QuarantineReviewFailed,
            "item_created" => AuditAction::ItemCreated,
            "item_restocked" => AuditAction::ItemRestocked,
            "stock_update_failed" => AuditAction::StockUpdateFailed,
            _ => return None,
        };
        Some(action)
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audit entry before signing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAuditEntry {
    pub tenant_id: Uuid,
    pub actor_id: Uuid,
    pub action: AuditAction,
    pub entity_ref: String,
    pub before: Option<JsonValue>,
    pub after: Option<JsonValue>,
}

impl NewAuditEntry {
    pub fn new(tenant_id: Uuid, actor_id: Uuid, action: AuditAction, entity_ref: impl Into<String>) -> Self {
        Self {
            tenant_id,
            actor_id,
            action,
            entity_ref: entity_ref.into(),
            before: None,
            after: None,
        }
    }

    pub fn with_before(mut self, before: JsonValue) -> Self {
        self.before = Some(before);
        self
    }

    pub fn with_after(mut self, after: JsonValue) -> Self {
        self.after = Some(after);
        self
    }
}

/// Immutable, signed audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub actor_id: Uuid,
    pub action: AuditAction,
    pub entity_ref: String,
    pub before: Option<JsonValue>,
    pub after: Option<JsonValue>,
    pub recorded_at: DateTime<Utc>,
    /// Lowercase hex HMAC-SHA256 over every other field except `id`.
    pub signature: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_names_round_trip() {
        for action in [
            AuditAction::UploadAdmitted,
            AuditAction::RateLimitTripped,
            AuditAction::SessionRolledBack,
            AuditAction::ItemRestocked,
            AuditAction::CommitFailed,
            AuditAction::SessionUpdateFailed,
        ] {
            assert_eq!(AuditAction::parse(action.as_str()), Some(action));
            let json = serde_json::to_value(action).unwrap();
            assert_eq!(json, serde_json::Value::String(action.as_str().to_string()));
        }
        assert_eq!(AuditAction::parse("nope"), None);
    }
}
