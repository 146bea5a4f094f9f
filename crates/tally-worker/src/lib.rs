//! Tally OCR Worker
//!
//! Bounded pool that takes admitted uploads through text extraction.

pub mod queue;

pub use queue::{compute_retry_backoff_seconds, OcrQueue, MAX_RETRY_BACKOFF_SECS};
