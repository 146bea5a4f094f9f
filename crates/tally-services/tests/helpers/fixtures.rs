use std::io::Cursor;

use image::{GrayImage, ImageFormat, Luma};
use tally_core::models::OcrOutput;

fn lcg(seed: u32) -> impl FnMut() -> u32 {
    let mut state = seed;
    move || {
        state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        state >> 24
    }
}

fn encode_png(img: GrayImage) -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png).unwrap();
    out.into_inner()
}

/// Sharp high-contrast page. Different seeds give different bytes.
pub fn sharp_document_png(seed: u32) -> Vec<u8> {
    let mut next = lcg(seed);
    encode_png(GrayImage::from_fn(200, 200, |x, y| {
        let jitter = (next() % 16) as u8;
        if (x + y) % 2 == 0 {
            Luma([20 + jitter])
        } else {
            Luma([215 + jitter])
        }
    }))
}

/// Washed-out low-contrast page that decodes fine but scores below the threshold.
pub fn washed_out_png(seed: u32) -> Vec<u8> {
    let mut next = lcg(seed);
    encode_png(GrayImage::from_fn(200, 200, |_, _| Luma([120 + (next() % 8) as u8])))
}

pub fn ocr_text(text: &str) -> OcrOutput {
    let words = text.split_whitespace().count();
    OcrOutput {
        text: text.to_string(),
        word_confidences: vec![0.9; words],
        line_count: text.lines().count() as u32,
    }
}
