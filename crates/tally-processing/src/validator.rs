use std::io::Cursor;

use image::{DynamicImage, GenericImageView, ImageFormat, ImageReader};
use tally_core::{AdmissionConfig, AppError};

/// Hard admission failures, independent of the quality score
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("File too small: {size} bytes (min: {min} bytes)")]
    FileTooSmall { size: usize, min: usize },

    #[error("File too large: {size} bytes (max: {max} bytes)")]
    FileTooLarge { size: usize, max: usize },

    #[error("Unsupported media type: {media_type} (allowed: {allowed:?})")]
    UnsupportedMediaType {
        media_type: String,
        allowed: Vec<String>,
    },

    #[error("Declared media type {declared} does not match file content ({sniffed})")]
    MediaTypeMismatch { declared: String, sniffed: String },

    #[error("Image could not be decoded: {0}")]
    Undecodable(String),
}

impl ValidationError {
    /// Structured reason code carried by rejection responses and audit entries.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ValidationError::FileTooSmall { .. } => "FILE_TOO_SMALL",
            ValidationError::FileTooLarge { .. } => "FILE_TOO_LARGE",
            ValidationError::UnsupportedMediaType { .. } => "UNSUPPORTED_MEDIA_TYPE",
            ValidationError::MediaTypeMismatch { .. } => "MEDIA_TYPE_MISMATCH",
            ValidationError::Undecodable(_) => "UNDECODABLE_IMAGE",
        }
    }
}

impl From<ValidationError> for AppError {
    fn from(err: ValidationError) -> Self {
        AppError::Validation(err.to_string())
    }
}

/// Image that passed every hard check.
pub struct DecodedImage {
    pub image: DynamicImage,
    pub width: u32,
    pub height: u32,
    /// Media type derived from the file signature.
    pub media_type: String,
}

/// Upload validator
///
/// Checks run cheapest first: byte bounds, declared type, sniffed signature, full decode.
#[derive(Debug, Clone)]
pub struct ImageValidator {
    min_bytes: usize,
    max_bytes: usize,
    allowed_media_types: Vec<String>,
}

impl ImageValidator {
    pub fn new(min_bytes: usize, max_bytes: usize, allowed_media_types: Vec<String>) -> Self {
        Self {
            min_bytes,
            max_bytes,
            allowed_media_types: allowed_media_types
                .into_iter()
                .map(|t| t.to_lowercase())
                .collect(),
        }
    }

    pub fn from_config(config: &AdmissionConfig) -> Self {
        Self::new(
            config.min_bytes,
            config.max_bytes,
            config.allowed_media_types.clone(),
        )
    }

    pub fn validate_size(&self, size: usize) -> Result<(), ValidationError> {
        if size < self.min_bytes {
            return Err(ValidationError::FileTooSmall {
                size,
                min: self.min_bytes,
            });
        }
        if size > self.max_bytes {
            return Err(ValidationError::FileTooLarge {
                size,
                max: self.max_bytes,
            });
        }
        Ok(())
    }

    pub fn validate_media_type(&self, media_type: &str) -> Result<String, ValidationError> {
        let normalized = normalize_media_type(media_type);
        if !self.allowed_media_types.iter().any(|t| t == &normalized) {
            return Err(ValidationError::UnsupportedMediaType {
                media_type: media_type.to_string(),
                allowed: self.allowed_media_types.clone(),
            });
        }
        Ok(normalized)
    }

    /// Run every hard check and return the decoded image.
    pub fn validate(&self, data: &[u8], declared_media_type: &str) -> Result<DecodedImage, ValidationError> {
        self.validate_size(data.len())?;
        let declared = self.validate_media_type(declared_media_type)?;

        let reader = ImageReader::new(Cursor::new(data))
            .with_guessed_format()
            .map_err(|e| ValidationError::Undecodable(e.to_string()))?;
        let sniffed = reader
            .format()
            .map(media_type_for_format)
            .ok_or_else(|| ValidationError::Undecodable("unrecognized file signature".to_string()))?;

        if sniffed != declared {
            return Err(ValidationError::MediaTypeMismatch {
                declared,
                sniffed: sniffed.to_string(),
            });
        }

        let image = reader
            .decode()
            .map_err(|e| ValidationError::Undecodable(e.to_string()))?;
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(ValidationError::Undecodable("image has no pixels".to_string()));
        }

        tracing::debug!(width, height, media_type = %declared, "Upload passed hard checks");

        Ok(DecodedImage {
            image,
            width,
            height,
            media_type: declared,
        })
    }
}

/// Lowercase the type and drop parameters such as `; charset=binary`.
fn normalize_media_type(media_type: &str) -> String {
    let base = media_type.split(';').next().unwrap_or_default().trim().to_lowercase();
    match base.as_str() {
        "image/jpg" | "image/pjpeg" => "image/jpeg".to_string(),
        _ => base,
    }
}

fn media_type_for_format(format: ImageFormat) -> &'static str {
    match format {
        ImageFormat::Jpeg => "image/jpeg",
        ImageFormat::Png => "image/png",
        ImageFormat::WebP => "image/webp",
        ImageFormat::Gif => "image/gif",
        ImageFormat::Bmp => "image/bmp",
        ImageFormat::Tiff => "image/tiff",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn noisy_png(width: u32, height: u32) -> Vec<u8> {
        let mut state: u32 = 0x1234_5678;
        let img = RgbImage::from_fn(width, height, |_, _| {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            let v = (state >> 24) as u8;
            Rgb([v, v.wrapping_add(40), v.wrapping_add(80)])
        });
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    fn validator() -> ImageValidator {
        ImageValidator::from_config(&AdmissionConfig::default())
    }

    #[test]
    fn test_accepts_valid_png() {
        let bytes = noisy_png(64, 64);
        let decoded = validator().validate(&bytes, "image/png").unwrap();
        assert_eq!((decoded.width, decoded.height), (64, 64));
        assert_eq!(decoded.media_type, "image/png");
    }

    #[test]
    fn test_size_bounds() {
        let v = validator();
        assert!(matches!(
            v.validate_size(1023),
            Err(ValidationError::FileTooSmall { min: 1024, .. })
        ));
        assert!(v.validate_size(1024).is_ok());
        assert!(v.validate_size(15 * 1024 * 1024).is_ok());
        assert!(matches!(
            v.validate_size(15 * 1024 * 1024 + 1),
            Err(ValidationError::FileTooLarge { .. })
        ));
    }

    #[test]
    fn test_declared_type_must_match_content() {
        let bytes = noisy_png(64, 64);
        let err = validator().validate(&bytes, "image/jpeg").err().unwrap();
        assert_eq!(err.reason_code(), "MEDIA_TYPE_MISMATCH");
    }

    #[test]
    fn test_unsupported_type() {
        let bytes = noisy_png(64, 64);
        let err = validator().validate(&bytes, "application/pdf").err().unwrap();
        assert_eq!(err.reason_code(), "UNSUPPORTED_MEDIA_TYPE");
    }

    #[test]
    fn test_garbage_bytes_are_undecodable() {
        let bytes = vec![0x42u8; 4096];
        let err = validator().validate(&bytes, "image/png").err().unwrap();
        assert_eq!(err.reason_code(), "UNDECODABLE_IMAGE");
    }

    #[test]
    fn test_truncated_png_is_undecodable() {
        let mut bytes = noisy_png(64, 64);
        bytes.truncate(bytes.len() / 2);
        let err = validator().validate(&bytes, "image/png").err().unwrap();
        assert_eq!(err.reason_code(), "UNDECODABLE_IMAGE");
    }

    #[test]
    fn test_media_type_normalization() {
        assert_eq!(normalize_media_type("Image/JPG"), "image/jpeg");
        assert_eq!(normalize_media_type("image/png; charset=binary"), "image/png");
    }
}
