//! Tally Core Library
//!
//! This crate provides the domain models, error types, configuration and permission
//! rules shared by every Tally component.

pub mod config;
pub mod constants;
pub mod error;
pub mod hooks;
pub mod models;
pub mod permissions;

// Re-export commonly used types
pub use config::{
    AbuseConfig, AdmissionConfig, BaseConfig, FingerprintConfig, IntakeConfig, LedgerConfig,
    WorkerConfig,
};
pub use error::{AppError, ErrorMetadata, ErrorPayload, LogLevel};
pub use hooks::{OcrEngine, OcrError};
pub use permissions::{is_allowed, Action, RequestContext, Role};
