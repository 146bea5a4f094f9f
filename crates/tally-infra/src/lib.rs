//! Tally Infrastructure Library
//!
//! Shared infrastructure used by the intake services, worker and CLI:
//! - Telemetry initialization
//! - Sliding-window rate limiting over the counter store
//! - Audit entry signing and verification

#[cfg(feature = "observability-basic")]
pub mod telemetry;

#[cfg(feature = "rate-limit")]
pub mod rate_limit;

#[cfg(feature = "audit-signing")]
pub mod signing;

#[cfg(feature = "observability-basic")]
pub use telemetry::{init_telemetry, LogFormat};

#[cfg(feature = "rate-limit")]
pub use rate_limit::{RateDecision, RateLimiter, WindowSpec};

#[cfg(feature = "audit-signing")]
pub use signing::AuditSigner;
