//! Database repositories for data access layer
//!
//! Each repository trait owns one table family. `postgres/` holds the sqlx
//! implementations; `memory` implements every trait over a single in-process state.
//
// Repository traits and shared row types
pub mod repository;
//
// Postgres implementations
pub mod postgres;
//
// In-process implementation
pub mod memory;
//
// Transaction utilities
pub mod transaction;

pub use memory::MemoryStore;
pub use postgres::{
    connect, run_migrations, PgAuditRepository, PgCounterRepository, PgFingerprintRepository,
    PgInventoryRepository, PgQuarantineRepository, PgSessionRepository, PgUploadRepository,
};
pub use repository::{
    AuditRepository, CommitClaim, CounterBucket, CounterRepository, FingerprintRepository,
    InventoryRepository, OcrSummary, QuarantineRepository, SessionRepository, SessionSeal,
    UploadRepository,
};
