//! External collaborator traits
//!
//! Text extraction is performed by an engine outside this workspace. The engine is
//! opaque, slow and fallible; callers wrap it with timeouts and retries.

use async_trait::async_trait;

use crate::models::OcrOutput;

#[derive(Debug, thiserror::Error)]
pub enum OcrError {
    #[error("OCR engine unavailable: {0}")]
    Unavailable(String),

    #[error("OCR engine rejected the image: {0}")]
    Rejected(String),
}

impl OcrError {
    /// Rejections are permanent; unavailability is worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, OcrError::Unavailable(_))
    }
}

/// Extracts text and per-word confidences from image bytes.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    async fn extract(&self, image: &[u8]) -> Result<OcrOutput, OcrError>;
}

/// Engine that never returns text. Useful for wiring a pipeline without OCR.
pub struct NoOpOcrEngine;

#[async_trait]
impl OcrEngine for NoOpOcrEngine {
    async fn extract(&self, _image: &[u8]) -> Result<OcrOutput, OcrError> {
        Ok(OcrOutput::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_engine_returns_empty_text() {
        let output = NoOpOcrEngine.extract(b"bytes").await.unwrap();
        assert_eq!(output.non_whitespace_chars(), 0);
    }

    #[test]
    fn test_retryable_errors() {
        assert!(OcrError::Unavailable("down".into()).is_retryable());
        assert!(!OcrError::Rejected("corrupt".into()).is_retryable());
    }
}
