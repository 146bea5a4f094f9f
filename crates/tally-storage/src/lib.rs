//! Tally Blob Storage
//!
//! Content-addressable storage for upload bytes. Accepted uploads and quarantined
//! rejects live in separate areas of the same backend.
//!
//! # Storage key format
//!
//! `{area}/{tenant_id}/{hash[0..2]}/{hash}.{ext}` where `area` is `accepted` or
//! `quarantine` and `hash` is the lowercase hex SHA-256 of the bytes. Identical bytes
//! from the same tenant map to the same key, so a repeated `put` is a no-op.
//!
//! Keys must not contain `..` or a leading `/`.

pub mod keys;
#[cfg(feature = "storage-local")]
pub mod local;
pub mod traits;

pub use keys::{blob_key, BlobArea};
#[cfg(feature = "storage-local")]
pub use local::LocalStorage;
pub use traits::{BlobStore, StorageError, StorageResult};
