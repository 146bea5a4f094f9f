use serde::{Deserialize, Serialize};

/// Text returned by the external OCR engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OcrOutput {
    pub text: String,
    pub word_confidences: Vec<f64>,
    pub line_count: u32,
}

impl OcrOutput {
    pub fn non_whitespace_chars(&self) -> usize {
        self.text.chars().filter(|c| !c.is_whitespace()).count()
    }

    pub fn mean_confidence(&self) -> Option<f64> {
        if self.word_confidences.is_empty() {
            return None;
        }
        let sum: f64 = self.word_confidences.iter().sum();
        Some(sum / self.word_confidences.len() as f64)
    }
}
