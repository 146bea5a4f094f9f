//! Admission gate
//!
//! Hard checks and quality scoring run on the blocking pool; decoding and the
//! Laplacian pass are CPU-bound and must not stall the async workers.

use std::sync::Arc;

use image::DynamicImage;
use tally_core::models::QualityReport;
use tally_core::{AdmissionConfig, AppError};
use tally_processing::{content_hash, DecodedImage, ImageValidator, QualityScorer, ValidationError};

/// Outcome of the hard checks.
pub enum Screening {
    Rejected(ValidationError),
    Passed {
        image: DecodedImage,
        content_hash: String,
    },
}

#[derive(Clone)]
pub struct AdmissionGate {
    validator: ImageValidator,
    scorer: QualityScorer,
    min_ocr_chars: usize,
}

impl AdmissionGate {
    pub fn new(config: &AdmissionConfig) -> Self {
        Self {
            validator: ImageValidator::from_config(config),
            scorer: QualityScorer::new(config.clone()),
            min_ocr_chars: config.min_ocr_chars,
        }
    }

    pub fn min_ocr_chars(&self) -> usize {
        self.min_ocr_chars
    }

    /// Size, media type and decode checks, plus the content digest.
    pub async fn screen(&self, data: Arc<[u8]>, declared_media_type: &str) -> Result<Screening, AppError> {
        let validator = self.validator.clone();
        let declared = declared_media_type.to_string();
        tokio::task::spawn_blocking(move || match validator.validate(&data, &declared) {
            Ok(image) => Screening::Passed {
                content_hash: content_hash(&data),
                image,
            },
            Err(err) => Screening::Rejected(err),
        })
        .await
        .map_err(|e| AppError::Internal(format!("Image screening task failed: {}", e)))
    }

    /// Document quality score for an image that passed screening.
    pub async fn score(&self, image: DynamicImage) -> Result<QualityReport, AppError> {
        let scorer = self.scorer.clone();
        tokio::task::spawn_blocking(move || scorer.score(&image))
            .await
            .map_err(|e| AppError::Internal(format!("Quality scoring task failed: {}", e)))
    }
}
