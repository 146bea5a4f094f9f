//! Error types module
//!
//! All failures raised by Tally components are unified under [`AppError`]. Each variant
//! self-describes how it should be presented through [`ErrorMetadata`], and
//! [`AppError::payload`] renders the structured kind + message + machine fields
//! returned to callers.
//!
//! The `Database` variant and `From<sqlx::Error>` are gated behind the `sqlx` feature.

use std::io;

use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use uuid::Uuid;

#[cfg(feature = "sqlx")]
use sqlx::Error as SqlxError;

use crate::models::QualityReport;

/// Log level for error reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Debug level - for expected errors like validation failures
    Debug,
    /// Warning level - for rejected but well-formed requests
    Warn,
    /// Error level - for unexpected failures
    Error,
}

/// Metadata for error responses - defines how an error should be presented
pub trait ErrorMetadata {
    /// HTTP-equivalent status code
    fn http_status_code(&self) -> u16;

    /// Machine-readable error code (e.g., "INSUFFICIENT_STOCK")
    fn error_code(&self) -> &'static str;

    /// Whether this error is recoverable (can be retried)
    fn is_recoverable(&self) -> bool;

    /// Suggested action for the client
    fn suggested_action(&self) -> Option<&'static str>;

    /// Client-facing message (may differ from internal error message)
    fn client_message(&self) -> String;

    /// Whether details should be hidden from clients
    fn is_sensitive(&self) -> bool;

    /// Log level for this error
    fn log_level(&self) -> LogLevel;
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[cfg(feature = "sqlx")]
    #[error("Database error: {0}")]
    Database(#[source] SqlxError),

    #[cfg(not(feature = "sqlx"))]
    #[error("Database error: {0}")]
    Database(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Upload {upload_id} rejected: quality score {} below threshold {}", .report.total, .report.threshold)]
    QualityRejected {
        upload_id: Uuid,
        report: Box<QualityReport>,
    },

    #[error("Rate limit exceeded: {limit} uploads per window, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64, limit: u32 },

    #[error("Insufficient stock for item {item_id}: requested {requested}, available {available}")]
    InsufficientStock {
        item_id: Uuid,
        line_id: Option<Uuid>,
        requested: i64,
        available: i64,
        shortfall: i64,
    },

    #[error("Commit conflict on session {session_id}: {reason}")]
    CommitConflict { session_id: Uuid, reason: String },

    #[error("{service} unavailable: {message}")]
    UpstreamUnavailable { service: String, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Unresolved part references on {} confirmed line(s)", .line_ids.len())]
    UnresolvedParts { line_ids: Vec<Uuid> },

    #[error("Session {session_id} requires secondary confirmation (floor {floor}s per item)")]
    ConfirmationRequired { session_id: Uuid, floor: f64 },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Internal error with source")]
    InternalWithSource {
        message: String,
        #[source]
        source: anyhow::Error,
    },
}

#[cfg(feature = "sqlx")]
impl From<SqlxError> for AppError {
    fn from(err: SqlxError) -> Self {
        AppError::Database(err)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::InternalWithSource {
            message: err.to_string(),
            source: err,
        }
    }
}

impl From<io::Error> for AppError {
    fn from(err: io::Error) -> Self {
        AppError::Internal(format!("IO error: {}", err))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::InvalidInput(format!("JSON parsing error: {}", err))
    }
}

impl From<uuid::Error> for AppError {
    fn from(err: uuid::Error) -> Self {
        AppError::InvalidInput(format!("UUID parsing error: {}", err))
    }
}

/// Static metadata for each variant: (http_status, error_code, recoverable, suggested_action, sensitive, log_level).
fn app_error_static_metadata(
    err: &AppError,
) -> (
    u16,
    &'static str,
    bool,
    Option<&'static str>,
    bool,
    LogLevel,
) {
    match err {
        AppError::Database(_) => (
            503,
            "UPSTREAM_UNAVAILABLE",
            true,
            Some("Retry after a short delay"),
            true,
            LogLevel::Error,
        ),
        AppError::Validation(_) => (
            422,
            "VALIDATION_ERROR",
            false,
            Some("Upload a supported image between 1 KiB and 15 MiB"),
            false,
            LogLevel::Debug,
        ),
        AppError::QualityRejected { .. } => (
            422,
            "QUALITY_REJECTED",
            false,
            Some("Retake the photo with steady focus, even lighting and no glare"),
            false,
            LogLevel::Debug,
        ),
        AppError::RateLimited { .. } => (
            429,
            "RATE_LIMITED",
            true,
            Some("Wait for the retry-after period before uploading again"),
            false,
            LogLevel::Warn,
        ),
        AppError::InsufficientStock { .. } => (
            409,
            "INSUFFICIENT_STOCK",
            false,
            Some("Adjust the line quantity or restock the item"),
            false,
            LogLevel::Warn,
        ),
        AppError::CommitConflict { .. } => (
            409,
            "COMMIT_CONFLICT",
            true,
            Some("Retry the commit after the in-flight attempt finishes"),
            false,
            LogLevel::Warn,
        ),
        AppError::UpstreamUnavailable { .. } => (
            503,
            "UPSTREAM_UNAVAILABLE",
            true,
            Some("Wait 30-60 seconds and retry"),
            false,
            LogLevel::Error,
        ),
        AppError::NotFound(_) => (
            404,
            "NOT_FOUND",
            false,
            Some("Verify the resource ID exists"),
            false,
            LogLevel::Debug,
        ),
        AppError::Forbidden(_) => (
            403,
            "FORBIDDEN",
            false,
            Some("Ask a head of department to perform this action"),
            false,
            LogLevel::Warn,
        ),
        AppError::InvalidState(_) => (
            409,
            "INVALID_STATE",
            false,
            Some("Reload the resource and check its status"),
            false,
            LogLevel::Debug,
        ),
        AppError::UnresolvedParts { .. } => (
            422,
            "UNRESOLVED_PARTS",
            false,
            Some("Resolve every confirmed line to an inventory item"),
            false,
            LogLevel::Debug,
        ),
        AppError::ConfirmationRequired { .. } => (
            428,
            "CONFIRMATION_REQUIRED",
            false,
            Some("Acknowledge the bulk confirmation before committing"),
            false,
            LogLevel::Debug,
        ),
        AppError::InvalidInput(_) => (
            400,
            "INVALID_INPUT",
            false,
            Some("Check request parameters and try again"),
            false,
            LogLevel::Debug,
        ),
        AppError::Internal(_) => (
            500,
            "INTERNAL_ERROR",
            true,
            Some("Retry after a short delay"),
            true,
            LogLevel::Error,
        ),
        AppError::InternalWithSource { .. } => (
            500,
            "INTERNAL_ERROR",
            true,
            Some("Retry after a short delay"),
            true,
            LogLevel::Error,
        ),
    }
}

/// Structured error body: kind + message + machine fields.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorPayload {
    pub kind: &'static str,
    pub message: String,
    pub fields: JsonValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_action: Option<&'static str>,
    pub recoverable: bool,
}

impl AppError {
    /// Get the error type name for detailed error responses
    pub fn error_type(&self) -> &str {
        match self {
            AppError::Database(_) => "Database",
            AppError::Validation(_) => "ValidationError",
            AppError::QualityRejected { .. } => "QualityRejected",
            AppError::RateLimited { .. } => "RateLimited",
            AppError::InsufficientStock { .. } => "InsufficientStock",
            AppError::CommitConflict { .. } => "CommitConflict",
            AppError::UpstreamUnavailable { .. } => "UpstreamUnavailable",
            AppError::NotFound(_) => "NotFound",
            AppError::Forbidden(_) => "Forbidden",
            AppError::InvalidState(_) => "InvalidState",
            AppError::UnresolvedParts { .. } => "UnresolvedParts",
            AppError::ConfirmationRequired { .. } => "ConfirmationRequired",
            AppError::InvalidInput(_) => "InvalidInput",
            AppError::Internal(_) => "Internal",
            AppError::InternalWithSource { .. } => "Internal",
        }
    }

    /// Get detailed error information including error chain
    pub fn detailed_message(&self) -> String {
        use std::error::Error;

        let mut details = self.to_string();

        let mut source = self.source();
        let mut depth = 0;
        while let Some(err) = source {
            depth += 1;
            if depth > 5 {
                details.push_str("\n  ... (truncated)");
                break;
            }
            details.push_str(&format!("\n  Caused by: {}", err));
            source = err.source();
        }

        details
    }

    /// Machine fields attached to the structured payload.
    pub fn fields(&self) -> JsonValue {
        match self {
            AppError::QualityRejected { upload_id, report } => json!({
                "upload_id": upload_id,
                "score": report.total,
                "threshold": report.threshold,
                "blur": report.blur_score,
                "glare": report.glare_score,
                "contrast": report.contrast_score,
                "failing_dimensions": report.failing_dimensions,
            }),
            AppError::RateLimited {
                retry_after_secs,
                limit,
            } => json!({ "retry_after_secs": retry_after_secs, "limit": limit }),
            AppError::InsufficientStock {
                item_id,
                line_id,
                requested,
                available,
                shortfall,
            } => json!({
                "item_id": item_id,
                "line_id": line_id,
                "requested": requested,
                "available": available,
                "shortfall": shortfall,
            }),
            AppError::CommitConflict { session_id, .. } => json!({ "session_id": session_id }),
            AppError::UpstreamUnavailable { service, .. } => json!({ "service": service }),
            AppError::Database(_) => json!({ "service": "database" }),
            AppError::UnresolvedParts { line_ids } => json!({ "line_ids": line_ids }),
            AppError::ConfirmationRequired { session_id, floor } => {
                json!({ "session_id": session_id, "floor_seconds": floor })
            }
            _ => json!({}),
        }
    }

    pub fn payload(&self) -> ErrorPayload {
        ErrorPayload {
            kind: self.error_code(),
            message: self.client_message(),
            fields: self.fields(),
            suggested_action: self.suggested_action(),
            recoverable: self.is_recoverable(),
        }
    }
}

impl ErrorMetadata for AppError {
    fn http_status_code(&self) -> u16 {
        app_error_static_metadata(self).0
    }

    fn error_code(&self) -> &'static str {
        app_error_static_metadata(self).1
    }

    fn is_recoverable(&self) -> bool {
        app_error_static_metadata(self).2
    }

    fn suggested_action(&self) -> Option<&'static str> {
        app_error_static_metadata(self).3
    }

    fn is_sensitive(&self) -> bool {
        app_error_static_metadata(self).4
    }

    fn log_level(&self) -> LogLevel {
        app_error_static_metadata(self).5
    }

    fn client_message(&self) -> String {
        match self {
            AppError::Database(_) => "Failed to access database".to_string(),
            AppError::Validation(ref msg) => msg.clone(),
            AppError::QualityRejected { report, .. } => {
                let dims: Vec<String> = report
                    .failing_dimensions
                    .iter()
                    .map(|d| d.to_string())
                    .collect();
                if dims.is_empty() {
                    format!(
                        "Image quality {:.2} is below the required {:.0}",
                        report.total, report.threshold
                    )
                } else {
                    format!(
                        "Image quality {:.2} is below the required {:.0} (weak: {})",
                        report.total,
                        report.threshold,
                        dims.join(", ")
                    )
                }
            }
            AppError::RateLimited {
                retry_after_secs, ..
            } => format!(
                "Too many uploads, retry in {} seconds",
                retry_after_secs
            ),
            AppError::InsufficientStock {
                item_id, shortfall, ..
            } => format!("Item {} is short by {}", item_id, shortfall),
            AppError::CommitConflict { reason, .. } => reason.clone(),
            AppError::UpstreamUnavailable { service, .. } => {
                format!("{} is temporarily unavailable", service)
            }
            AppError::NotFound(ref msg) => msg.clone(),
            AppError::Forbidden(ref msg) => msg.clone(),
            AppError::InvalidState(ref msg) => msg.clone(),
            AppError::UnresolvedParts { line_ids } => format!(
                "{} confirmed line(s) have no inventory item",
                line_ids.len()
            ),
            AppError::ConfirmationRequired { .. } => {
                "Lines were confirmed too quickly; acknowledge before committing".to_string()
            }
            AppError::InvalidInput(ref msg) => msg.clone(),
            AppError::Internal(_) => "Internal server error".to_string(),
            AppError::InternalWithSource { .. } => "Internal server error".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::QualityWeights;

    #[test]
    fn test_error_metadata_database() {
        #[cfg(feature = "sqlx")]
        let err = AppError::from(sqlx::Error::PoolClosed);
        #[cfg(not(feature = "sqlx"))]
        let err = AppError::Database("pool closed".to_string());
        assert_eq!(err.http_status_code(), 503);
        assert_eq!(err.error_code(), "UPSTREAM_UNAVAILABLE");
        assert!(err.is_recoverable());
        assert_eq!(err.client_message(), "Failed to access database");
        assert!(err.is_sensitive());
        assert_eq!(err.log_level(), LogLevel::Error);

        let payload = err.payload();
        assert_eq!(payload.kind, "UPSTREAM_UNAVAILABLE");
        assert_eq!(payload.fields["service"], "database");
        assert!(payload.recoverable);
    }

    #[test]
    fn test_insufficient_stock_payload_names_item_and_shortfall() {
        let item_id = Uuid::new_v4();
        let err = AppError::InsufficientStock {
            item_id,
            line_id: None,
            requested: 5,
            available: 0,
            shortfall: 5,
        };
        let payload = err.payload();
        assert_eq!(payload.kind, "INSUFFICIENT_STOCK");
        assert_eq!(payload.fields["shortfall"], 5);
        assert_eq!(payload.fields["item_id"], item_id.to_string());
        assert!(payload.message.contains(&item_id.to_string()));
    }

    #[test]
    fn test_quality_rejected_lists_sub_scores() {
        let report = QualityReport::from_subscores(86.7, 0.0, 100.0, QualityWeights::default(), 70.0);
        let err = AppError::QualityRejected {
            upload_id: Uuid::nil(),
            report: Box::new(report),
        };
        let payload = err.payload();
        assert_eq!(payload.fields["score"], 64.68);
        assert_eq!(payload.fields["glare"], 0.0);
        assert_eq!(payload.fields["failing_dimensions"][0], "glare");
        assert!(payload.message.contains("glare"));
    }

    #[test]
    fn test_rate_limited_is_recoverable() {
        let err = AppError::RateLimited {
            retry_after_secs: 120,
            limit: 50,
        };
        assert_eq!(err.http_status_code(), 429);
        assert!(err.is_recoverable());
        assert_eq!(err.payload().fields["retry_after_secs"], 120);
    }

    #[test]
    fn test_detailed_message_includes_source_chain() {
        let err = AppError::from(anyhow::anyhow!("inner").context("outer"));
        assert!(err.detailed_message().contains("outer"));
        assert_eq!(err.error_type(), "Internal");
    }
}
