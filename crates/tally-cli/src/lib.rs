//! Helpers shared by the `tally` operator binary.

use std::path::Path;

use tally_core::models::{QualityReport, QuarantineRecord};
use tally_core::AdmissionConfig;
use tally_processing::{ImageValidator, QualityScorer, ValidationError};

/// Media type implied by a file extension, if it is one the engine accepts.
pub fn media_type_for_path(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}

/// Run the same hard checks and scoring as intake, without touching storage.
pub fn score_bytes(
    data: &[u8],
    media_type: &str,
    config: &AdmissionConfig,
) -> Result<QualityReport, ValidationError> {
    let decoded = ImageValidator::from_config(config).validate(data, media_type)?;
    Ok(QualityScorer::new(config.clone()).score(&decoded.image))
}

pub fn render_report(report: &QualityReport) -> String {
    let verdict = if report.passed { "PASS" } else { "REJECT" };
    let failing = if report.failing_dimensions.is_empty() {
        "-".to_string()
    } else {
        report
            .failing_dimensions
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    };
    format!(
        "{:<10} {:>7.2}   (laplacian variance {:.1})\n\
         {:<10} {:>7.2}   ({:.2}% near-white)\n\
         {:<10} {:>7.2}   (ratio {:.3})\n\
         {:<10} {:>7.2} / {:.2}  {}\n\
         {:<10} {}",
        "blur",
        report.blur_score,
        report.measurements.laplacian_variance,
        "glare",
        report.glare_score,
        report.measurements.glare_percent,
        "contrast",
        report.contrast_score,
        report.measurements.contrast_ratio,
        "total",
        report.total,
        report.threshold,
        verdict,
        "failing",
        failing,
    )
}

pub fn render_quarantine_row(record: &QuarantineRecord) -> String {
    format!(
        "{}  {}  {:<18} {}  {}",
        record.id,
        record.upload_id,
        record.reason.reason_code(),
        record.quarantined_at.format("%Y-%m-%d %H:%M:%S"),
        truncate_string(&record.detail.to_string(), 60),
    )
}

/// Truncate a string to max_len characters, appending "..." if truncated.
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, ImageFormat, Luma};
    use std::io::Cursor;

    fn checkerboard_png() -> Vec<u8> {
        let mut state: u32 = 7;
        let img = GrayImage::from_fn(200, 200, |x, y| {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            let jitter = (state >> 28) as u8;
            if (x + y) % 2 == 0 {
                Luma([20 + jitter])
            } else {
                Luma([215 + jitter])
            }
        });
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn media_type_from_extension() {
        assert_eq!(media_type_for_path(Path::new("scan.JPG")), Some("image/jpeg"));
        assert_eq!(media_type_for_path(Path::new("a/b/note.png")), Some("image/png"));
        assert_eq!(media_type_for_path(Path::new("note.pdf")), None);
        assert_eq!(media_type_for_path(Path::new("README")), None);
    }

    #[test]
    fn scores_a_sharp_page() {
        let report = score_bytes(&checkerboard_png(), "image/png", &AdmissionConfig::default()).unwrap();
        assert!(report.passed, "total {}", report.total);
        let rendered = render_report(&report);
        assert!(rendered.contains("PASS"));
        assert!(rendered.contains("failing    -"));
    }

    #[test]
    fn hard_checks_apply_before_scoring() {
        let err = score_bytes(&[0u8; 16], "image/png", &AdmissionConfig::default()).unwrap_err();
        assert_eq!(err.reason_code(), "FILE_TOO_SMALL");
    }

    #[test]
    fn truncate_string_counts_characters() {
        assert_eq!(truncate_string("hello", 10), "hello");
        assert_eq!(truncate_string("hello world", 8), "hello...");
        assert_eq!(truncate_string("ééééé", 4), "é...");
    }
}
