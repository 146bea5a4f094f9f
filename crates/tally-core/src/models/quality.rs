use serde::{Deserialize, Serialize};

/// Image quality dimension scored by the admission gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityDimension {
    Blur,
    Glare,
    Contrast,
}

impl std::fmt::Display for QualityDimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QualityDimension::Blur => f.write_str("blur"),
            QualityDimension::Glare => f.write_str("glare"),
            QualityDimension::Contrast => f.write_str("contrast"),
        }
    }
}

/// Weights applied to the sub-scores. Expected to sum to 1.0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityWeights {
    pub blur: f64,
    pub glare: f64,
    pub contrast: f64,
}

impl Default for QualityWeights {
    fn default() -> Self {
        Self {
            blur: 0.40,
            glare: 0.30,
            contrast: 0.30,
        }
    }
}

/// Raw image measurements behind the sub-scores, kept for reviewers.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct QualityMeasurements {
    pub laplacian_variance: f64,
    pub glare_percent: f64,
    pub contrast_ratio: f64,
}

/// Document Quality Score with itemized sub-scores, each in [0, 100].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub blur_score: f64,
    pub glare_score: f64,
    pub contrast_score: f64,
    pub total: f64,
    pub threshold: f64,
    pub passed: bool,
    /// Dimensions whose own sub-score falls below the threshold.
    pub failing_dimensions: Vec<QualityDimension>,
    #[serde(default)]
    pub measurements: QualityMeasurements,
}

impl QualityReport {
    /// Combine sub-scores into a report. Sub-scores are clamped to [0, 100] and the
    /// total is rounded to two decimals before comparison with the threshold.
    pub fn from_subscores(
        blur_score: f64,
        glare_score: f64,
        contrast_score: f64,
        weights: QualityWeights,
        threshold: f64,
    ) -> Self {
        let blur_score = clamp_score(blur_score);
        let glare_score = clamp_score(glare_score);
        let contrast_score = clamp_score(contrast_score);

        let raw = weights.blur * blur_score
            + weights.glare * glare_score
            + weights.contrast * contrast_score;
        let total = (raw * 100.0).round() / 100.0;

        let failing_dimensions = [
            (QualityDimension::Blur, blur_score),
            (QualityDimension::Glare, glare_score),
            (QualityDimension::Contrast, contrast_score),
        ]
        .into_iter()
        .filter(|(_, score)| *score < threshold)
        .map(|(dimension, _)| dimension)
        .collect();

        Self {
            blur_score,
            glare_score,
            contrast_score,
            total,
            threshold,
            passed: total >= threshold,
            failing_dimensions,
            measurements: QualityMeasurements::default(),
        }
    }

    pub fn with_measurements(mut self, measurements: QualityMeasurements) -> Self {
        self.measurements = measurements;
        self
    }

    pub fn score_for(&self, dimension: QualityDimension) -> f64 {
        match dimension {
            QualityDimension::Blur => self.blur_score,
            QualityDimension::Glare => self.glare_score,
            QualityDimension::Contrast => self.contrast_score,
        }
    }
}

fn clamp_score(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weighted_total_below_threshold() {
        let report = QualityReport::from_subscores(86.7, 0.0, 100.0, QualityWeights::default(), 70.0);
        assert_eq!(report.total, 64.68);
        assert!(!report.passed);
        assert_eq!(report.failing_dimensions, vec![QualityDimension::Glare]);
    }

    #[test]
    fn test_total_at_threshold_passes() {
        let report = QualityReport::from_subscores(70.0, 70.0, 70.0, QualityWeights::default(), 70.0);
        assert_eq!(report.total, 70.0);
        assert!(report.passed);
        assert!(report.failing_dimensions.is_empty());
    }

    #[test]
    fn test_subscores_are_clamped() {
        let report =
            QualityReport::from_subscores(140.0, -5.0, f64::NAN, QualityWeights::default(), 70.0);
        assert_eq!(report.blur_score, 100.0);
        assert_eq!(report.glare_score, 0.0);
        assert_eq!(report.contrast_score, 0.0);
        assert_eq!(report.total, 40.0);
    }
}
