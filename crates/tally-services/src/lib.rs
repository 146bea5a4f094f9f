//! Tally Services Layer
//!
//! Business services for intake admission and inventory reconciliation. Each service
//! checks the caller's permission first, performs its mutation through the repository
//! traits and records exactly one audit entry per state transition.

pub mod abuse;
pub mod admission;
pub mod audit;
pub mod commit;
pub mod fingerprint;
pub mod intake;
pub mod ledger;
pub mod processing;
pub mod quarantine;
pub mod receiving;
pub mod stock;
pub mod stores;

pub use abuse::{bulk_confirmation_check, AbuseGuard};
pub use admission::{AdmissionGate, Screening};
pub use audit::{AuditTrail, AuditVerification};
pub use commit::SessionCommitCoordinator;
pub use fingerprint::FingerprintStore;
pub use intake::{IntakeService, UploadNotifier, UploadRequest};
pub use ledger::InventoryLedger;
pub use processing::{OcrDisposition, ProcessingService};
pub use quarantine::QuarantineService;
pub use receiving::ReceivingService;
pub use stock::StockService;
pub use stores::Stores;

pub use tally_infra::{AuditSigner, RateDecision, RateLimiter, WindowSpec};
pub use tally_processing::{content_hash, ImageValidator, QualityScorer, ValidationError};
pub use tally_storage::{BlobArea, BlobStore, LocalStorage, StorageError};
