//! Image decoding into a color view and a grayscale view.

use image::{GrayImage, Luma, RgbImage};
use thiserror::Error;

// ITU-R BT.601 luma weights in 14-bit fixed point; they sum to 1 << 14.
const LUMA_SHIFT: u32 = 14;
const LUMA_R: u32 = 4899;
const LUMA_G: u32 = 9617;
const LUMA_B: u32 = 1868;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("unsupported or malformed image: {0}")]
    Image(#[from] image::ImageError),
    #[error("image has zero area ({width}x{height})")]
    Empty { width: u32, height: u32 },
}

/// Decoded image: RGB pixels plus the luma derivative of the same size.
#[derive(Debug, Clone)]
pub struct Preprocessed {
    pub color: RgbImage,
    pub gray: GrayImage,
}

impl Preprocessed {
    pub fn width(&self) -> u32 {
        self.color.width()
    }

    pub fn height(&self) -> u32 {
        self.color.height()
    }

    /// Build both views from an already decoded color image.
    pub fn from_rgb(color: RgbImage) -> Result<Self, DecodeError> {
        let (width, height) = color.dimensions();
        if width == 0 || height == 0 {
            return Err(DecodeError::Empty { width, height });
        }
        let gray = to_luma(&color);
        Ok(Self { color, gray })
    }
}

/// BT.601 grayscale (0.299 R + 0.587 G + 0.114 B, rounded in fixed point).
///
/// Neutral pixels map to themselves.
pub fn to_luma(color: &RgbImage) -> GrayImage {
    GrayImage::from_fn(color.width(), color.height(), |x, y| {
        let [r, g, b] = color.get_pixel(x, y).0;
        let y = (r as u32 * LUMA_R + g as u32 * LUMA_G + b as u32 * LUMA_B + (1 << (LUMA_SHIFT - 1)))
            >> LUMA_SHIFT;
        Luma([y as u8])
    })
}

/// Decode encoded image bytes (format sniffed from content).
pub fn decode(bytes: &[u8]) -> Result<Preprocessed, DecodeError> {
    let img = image::load_from_memory(bytes)?;
    tracing::debug!(
        width = img.width(),
        height = img.height(),
        color = ?img.color(),
        "decoded image"
    );
    Preprocessed::from_rgb(img.to_rgb8())
}
