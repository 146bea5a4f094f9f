//! Role-based permissions
//!
//! Roles and actions are closed enumerations; [`is_allowed`] is the single source of truth
//! for what each role may do.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Crew,
    /// Head of department
    Hod,
    Admin,
}

impl std::str::FromStr for Role {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "crew" => Ok(Role::Crew),
            "hod" => Ok(Role::Hod),
            "admin" => Ok(Role::Admin),
            other => Err(AppError::InvalidInput(format!("Unknown role: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Upload,
    StartSession,
    VerifyLines,
    CommitSession,
    CancelSession,
    ResolveParts,
    AcknowledgeBulkConfirmation,
    ReviewQuarantine,
    AdjustStock,
    ReadAudit,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Upload => "upload",
            Action::StartSession => "start_session",
            Action::VerifyLines => "verify_lines",
            Action::CommitSession => "commit_session",
            Action::CancelSession => "cancel_session",
            Action::ResolveParts => "resolve_parts",
            Action::AcknowledgeBulkConfirmation => "acknowledge_bulk_confirmation",
            Action::ReviewQuarantine => "review_quarantine",
            Action::AdjustStock => "adjust_stock",
            Action::ReadAudit => "read_audit",
        }
    }
}

/// Whether `role` may perform `action`.
pub fn is_allowed(role: Role, action: Action) -> bool {
    match role {
        Role::Admin => true,
        Role::Hod => true,
        Role::Crew => matches!(
            action,
            Action::Upload
                | Action::StartSession
                | Action::VerifyLines
                | Action::ResolveParts
                | Action::CommitSession
                | Action::AcknowledgeBulkConfirmation
        ),
    }
}

/// Verified identity supplied by the calling layer. Trusted as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    pub tenant_id: Uuid,
    pub user_id: Uuid,
    pub roles: Vec<Role>,
}

impl RequestContext {
    pub fn new(tenant_id: Uuid, user_id: Uuid, roles: Vec<Role>) -> Self {
        Self {
            tenant_id,
            user_id,
            roles,
        }
    }

    pub fn can(&self, action: Action) -> bool {
        self.roles.iter().any(|role| is_allowed(*role, action))
    }

    pub fn require(&self, action: Action) -> Result<(), AppError> {
        if self.can(action) {
            Ok(())
        } else {
            Err(AppError::Forbidden(format!(
                "Action '{}' is not permitted for this user",
                action.as_str()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_ACTIONS: [Action; 10] = [
        Action::Upload,
        Action::StartSession,
        Action::VerifyLines,
        Action::CommitSession,
        Action::CancelSession,
        Action::ResolveParts,
        Action::AcknowledgeBulkConfirmation,
        Action::ReviewQuarantine,
        Action::AdjustStock,
        Action::ReadAudit,
    ];

    #[test]
    fn test_crew_cannot_cancel_or_review() {
        assert!(is_allowed(Role::Crew, Action::Upload));
        assert!(is_allowed(Role::Crew, Action::CommitSession));
        assert!(!is_allowed(Role::Crew, Action::CancelSession));
        assert!(!is_allowed(Role::Crew, Action::ReviewQuarantine));
        assert!(!is_allowed(Role::Crew, Action::AdjustStock));
        assert!(!is_allowed(Role::Crew, Action::ReadAudit));
    }

    #[test]
    fn test_hod_and_admin_have_everything() {
        for action in ALL_ACTIONS {
            assert!(is_allowed(Role::Hod, action));
            assert!(is_allowed(Role::Admin, action));
        }
    }

    #[test]
    fn test_context_requires_any_matching_role() {
        let ctx = RequestContext::new(Uuid::new_v4(), Uuid::new_v4(), vec![Role::Crew]);
        assert!(ctx.require(Action::Upload).is_ok());
        assert!(matches!(
            ctx.require(Action::CancelSession),
            Err(AppError::Forbidden(_))
        ));

        let empty = RequestContext::new(Uuid::new_v4(), Uuid::new_v4(), vec![]);
        assert!(empty.require(Action::Upload).is_err());
    }

    #[test]
    fn test_role_parsing() {
        assert_eq!("HOD".parse::<Role>().unwrap(), Role::Hod);
        assert!("captain".parse::<Role>().is_err());
    }
}
