//! Image admission checks
//!
//! Pure, synchronous analysis of uploaded bytes: hard validation (size, declared and
//! sniffed media type, decodability), the document quality score and the content digest.
//! Callers run the CPU-heavy parts on a blocking thread.

pub mod fingerprint;
pub mod quality;
pub mod validator;

pub use fingerprint::content_hash;
pub use quality::{blur_subscore, contrast_subscore, glare_subscore, QualityScorer};
pub use validator::{DecodedImage, ImageValidator, ValidationError};
