//! Shared constants

use uuid::Uuid;

/// Actor id recorded for decisions made by background workers rather than a user.
pub const SYSTEM_ACTOR_ID: Uuid = Uuid::nil();

/// Smallest accepted upload, in bytes.
pub const MIN_UPLOAD_BYTES: usize = 1024;

/// Largest accepted upload, in bytes.
pub const MAX_UPLOAD_BYTES: usize = 15 * 1024 * 1024;

/// Media types accepted by the intake pipeline.
pub const DEFAULT_ALLOWED_MEDIA_TYPES: &[&str] = &["image/jpeg", "image/png", "image/webp"];
