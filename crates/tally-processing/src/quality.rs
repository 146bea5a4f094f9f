//! Document quality score
//!
//! DQS is a weighted blend of three sub-scores, each in [0, 100], computed on the
//! luma channel of an image downscaled to at most [`ANALYSIS_MAX_EDGE`] pixels:
//!
//! - blur: variance of the Laplacian, rescaled between calibrated bounds
//! - glare: share of near-white pixels, 0% maps to 100 and the configured maximum to 0
//! - contrast: Michelson ratio over the 1st and 99th luma percentiles

use image::{DynamicImage, GenericImageView, GrayImage};
use imageproc::filter::laplacian_filter;
use tally_core::models::{QualityMeasurements, QualityReport};
use tally_core::AdmissionConfig;

/// Longest edge, in pixels, of the image the metrics are computed on.
pub const ANALYSIS_MAX_EDGE: u32 = 1024;

/// Map a Laplacian variance onto [0, 100].
pub fn blur_subscore(variance: f64, min_variance: f64, max_variance: f64) -> f64 {
    if max_variance <= min_variance {
        return if variance >= max_variance { 100.0 } else { 0.0 };
    }
    let clamped = variance.clamp(min_variance, max_variance);
    (clamped - min_variance) / (max_variance - min_variance) * 100.0
}

/// Map a glare percentage onto [0, 100]. Saturates at `max_percent`.
pub fn glare_subscore(glare_percent: f64, max_percent: f64) -> f64 {
    if max_percent <= 0.0 {
        return if glare_percent <= 0.0 { 100.0 } else { 0.0 };
    }
    (100.0 * (1.0 - glare_percent / max_percent)).clamp(0.0, 100.0)
}

/// Map a Michelson contrast ratio onto [0, 100].
pub fn contrast_subscore(ratio: f64, min_ratio: f64) -> f64 {
    if ratio < min_ratio {
        return 0.0;
    }
    if ratio >= 1.0 || min_ratio >= 1.0 {
        return 100.0;
    }
    (ratio - min_ratio) / (1.0 - min_ratio) * 100.0
}

/// Computes the quality report for decoded images.
#[derive(Debug, Clone)]
pub struct QualityScorer {
    config: AdmissionConfig,
}

impl QualityScorer {
    pub fn new(config: AdmissionConfig) -> Self {
        Self { config }
    }

    pub fn threshold(&self) -> f64 {
        self.config.quality_threshold
    }

    pub fn score(&self, image: &DynamicImage) -> QualityReport {
        let luma = analysis_luma(image);
        let measurements = measure(&luma, self.config.glare_luma_threshold);

        let blur = blur_subscore(
            measurements.laplacian_variance,
            self.config.blur_variance_min,
            self.config.blur_variance_max,
        );
        let glare = glare_subscore(measurements.glare_percent, self.config.glare_max_percent);
        let contrast = contrast_subscore(measurements.contrast_ratio, self.config.contrast_min_ratio);

        let report = QualityReport::from_subscores(
            blur,
            glare,
            contrast,
            self.config.weights,
            self.config.quality_threshold,
        )
        .with_measurements(measurements);

        tracing::debug!(
            blur = report.blur_score,
            glare = report.glare_score,
            contrast = report.contrast_score,
            total = report.total,
            passed = report.passed,
            "Scored document quality"
        );
        report
    }
}

fn analysis_luma(image: &DynamicImage) -> GrayImage {
    let (width, height) = image.dimensions();
    if width.max(height) > ANALYSIS_MAX_EDGE {
        image.thumbnail(ANALYSIS_MAX_EDGE, ANALYSIS_MAX_EDGE).to_luma8()
    } else {
        image.to_luma8()
    }
}

fn measure(luma: &GrayImage, glare_threshold: u8) -> QualityMeasurements {
    let pixel_count = (luma.width() as u64) * (luma.height() as u64);
    if pixel_count == 0 {
        return QualityMeasurements::default();
    }

    let mut histogram = [0u64; 256];
    for pixel in luma.pixels() {
        histogram[pixel.0[0] as usize] += 1;
    }

    let glare_pixels: u64 = histogram[glare_threshold as usize..].iter().sum();
    let glare_percent = glare_pixels as f64 / pixel_count as f64 * 100.0;

    let low = percentile(&histogram, pixel_count, 0.01) as f64;
    let high = percentile(&histogram, pixel_count, 0.99) as f64;
    let contrast_ratio = if high + low > 0.0 {
        (high - low) / (high + low)
    } else {
        0.0
    };

    QualityMeasurements {
        laplacian_variance: laplacian_variance(luma),
        glare_percent,
        contrast_ratio,
    }
}

/// Smallest luma value whose cumulative share reaches `fraction`.
fn percentile(histogram: &[u64; 256], total: u64, fraction: f64) -> u8 {
    let target = ((total as f64) * fraction).ceil().max(1.0) as u64;
    let mut cumulative = 0u64;
    for (value, count) in histogram.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return value as u8;
        }
    }
    u8::MAX
}

fn laplacian_variance(luma: &GrayImage) -> f64 {
    let response = laplacian_filter(luma);
    let n = (response.width() as f64) * (response.height() as f64);
    if n == 0.0 {
        return 0.0;
    }
    let mean = response.pixels().map(|p| p.0[0] as f64).sum::<f64>() / n;
    response
        .pixels()
        .map(|p| {
            let d = p.0[0] as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n
}
