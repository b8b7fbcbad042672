//! Face template encoder.
//!
//! Pads and crops the detected face from the color image, resizes it to a
//! canonical square patch, converts to grayscale, equalizes the histogram,
//! smooths with a 5×5 Gaussian, and flattens the normalized intensities
//! row-major into a [`FaceTemplate`].

use crate::preprocess::{to_luma, DecodeError, Preprocessed};
use crate::types::{BoundingBox, Encoding, FaceTemplate, TemplateError, PATCH_SIZE};
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// --- Defaults ---
const DEFAULT_PADDING_RATIO: f64 = 0.1;
const DEFAULT_MIN_CONFIDENCE: f64 = 0.3;
/// Confidence gain applied to the face/image area ratio.
const CONFIDENCE_GAIN: f64 = 10.0;
const MAX_INTENSITY: f64 = 255.0;
/// Binomial approximation of a 5-tap Gaussian (sigma ≈ 1.1); sums to 16.
const GAUSSIAN_5: [u32; 5] = [1, 4, 6, 4, 1];

#[derive(Error, Debug)]
pub enum EncodingError {
    #[error("padded face region {region:?} is empty")]
    EmptyCrop { region: BoundingBox },
    #[error("invalid encoder config: {0}")]
    InvalidConfig(String),
    #[error("face confidence {confidence:.3} is below the enrollment minimum {minimum:.3}")]
    LowConfidence { confidence: f64, minimum: f64 },
    #[error("template construction failed: {0}")]
    Template(#[from] TemplateError),
}

/// Errors from the byte-level encode/enroll entry points.
#[derive(Error, Debug)]
pub enum EncodeError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("no face detected")]
    NoFaceDetected,
    #[error("encoding failed: {0}")]
    Encoding(#[from] EncodingError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Padding added on every side, as a fraction of the face width.
    pub padding_ratio: f64,
    /// Side of the square patch; templates have `patch_size²` components.
    pub patch_size: u32,
    /// Enrollment quality gate.
    pub min_confidence: f64,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            padding_ratio: DEFAULT_PADDING_RATIO,
            patch_size: PATCH_SIZE,
            min_confidence: DEFAULT_MIN_CONFIDENCE,
        }
    }
}

impl EncoderConfig {
    /// Component count of templates produced with this config.
    pub fn template_len(&self) -> usize {
        self.patch_size as usize * self.patch_size as usize
    }

    fn validate(&self) -> Result<(), EncodingError> {
        if self.patch_size == 0 {
            return Err(EncodingError::InvalidConfig("patch_size must be positive".into()));
        }
        if !(self.padding_ratio >= 0.0 && self.padding_ratio.is_finite()) {
            return Err(EncodingError::InvalidConfig(format!(
                "padding_ratio must be >= 0, got {}",
                self.padding_ratio
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct FeatureEncoder {
    config: EncoderConfig,
}

impl FeatureEncoder {
    pub fn new(config: EncoderConfig) -> Result<Self, EncodingError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    /// Encode the face at `face` into a template.
    pub fn encode(&self, image: &Preprocessed, face: BoundingBox) -> Result<Encoding, EncodingError> {
        let (width, height) = (image.width(), image.height());
        let pad = (self.config.padding_ratio * face.width as f64) as u32;
        let region = face.padded(pad, width, height);
        if region.width == 0 || region.height == 0 {
            return Err(EncodingError::EmptyCrop { region });
        }

        let crop = imageops::crop_imm(&image.color, region.x, region.y, region.width, region.height)
            .to_image();
        let side = self.config.patch_size;
        let resized = imageops::resize(&crop, side, side, FilterType::Triangle);

        let mut gray = to_luma(&resized);
        equalize_histogram(&mut gray);
        let smoothed = gaussian_blur_5x5(&gray);

        let values: Vec<f64> = smoothed.iter().map(|&v| v as f64 / MAX_INTENSITY).collect();
        let template = FaceTemplate::new(values)?;
        let confidence = face_confidence(&face, width, height);

        tracing::debug!(
            ?face,
            ?region,
            confidence,
            head = ?&template.values()[..template.len().min(8)],
            "encoded face"
        );

        Ok(Encoding {
            template,
            confidence,
            face,
        })
    }

    /// Reject encodings below the enrollment confidence minimum.
    pub fn check_quality(&self, encoding: &Encoding) -> Result<(), EncodingError> {
        if encoding.confidence < self.config.min_confidence {
            return Err(EncodingError::LowConfidence {
                confidence: encoding.confidence,
                minimum: self.config.min_confidence,
            });
        }
        Ok(())
    }
}

/// Face-size heuristic: `min(1, face_area / image_area × 10)`.
pub fn face_confidence(face: &BoundingBox, width: u32, height: u32) -> f64 {
    let image_area = width as f64 * height as f64;
    if image_area == 0.0 {
        return 0.0;
    }
    (face.area() as f64 / image_area * CONFIDENCE_GAIN).min(1.0)
}

/// Global histogram equalization in place.
///
/// Builds the cumulative histogram from the first occupied bin so the
/// darkest present intensity maps to 0 and the brightest to 255. A
/// single-intensity image is left unchanged.
pub fn equalize_histogram(gray: &mut GrayImage) {
    let total = gray.as_raw().len() as u64;
    if total == 0 {
        return;
    }

    let mut hist = [0u64; 256];
    for &p in gray.as_raw() {
        hist[p as usize] += 1;
    }

    let first = hist.iter().position(|&c| c > 0).unwrap_or(0);
    if hist[first] == total {
        return;
    }

    let scale = 255.0 / (total - hist[first]) as f64;
    let mut lut = [0u8; 256];
    let mut cdf = 0u64;
    for (i, entry) in lut.iter_mut().enumerate().skip(first + 1) {
        cdf += hist[i];
        *entry = (cdf as f64 * scale).round().clamp(0.0, 255.0) as u8;
    }

    for p in gray.pixels_mut() {
        p.0[0] = lut[p.0[0] as usize];
    }
}

/// Reflect-101 border index (`dcb|abcd|cba`).
fn reflect101(i: isize, n: usize) -> usize {
    let n = n as isize;
    if n == 1 {
        return 0;
    }
    let mut i = i;
    while i < 0 || i >= n {
        i = if i < 0 { -i } else { 2 * n - 2 - i };
    }
    i as usize
}

/// Separable 5×5 binomial smoothing with reflect-101 borders, rounded to 8 bits.
pub fn gaussian_blur_5x5(gray: &GrayImage) -> Array2<u8> {
    let (w, h) = (gray.width() as usize, gray.height() as usize);
    let src = Array2::from_shape_fn((h, w), |(y, x)| gray.as_raw()[y * w + x] as u32);

    let mut horizontal = Array2::<u32>::zeros((h, w));
    for ((y, x), out) in horizontal.indexed_iter_mut() {
        *out = GAUSSIAN_5
            .iter()
            .enumerate()
            .map(|(k, &c)| c * src[[y, reflect101(x as isize + k as isize - 2, w)]])
            .sum();
    }

    Array2::from_shape_fn((h, w), |(y, x)| {
        let acc: u32 = GAUSSIAN_5
            .iter()
            .enumerate()
            .map(|(k, &c)| c * horizontal[[reflect101(y as isize + k as isize - 2, h), x]])
            .sum();
        ((acc + 128) >> 8).min(255) as u8
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, Rgb, RgbImage};

    fn uniform(width: u32, height: u32, v: u8) -> Preprocessed {
        Preprocessed::from_rgb(RgbImage::from_pixel(width, height, Rgb([v, v, v]))).unwrap()
    }

    #[test]
    fn test_confidence_formula() {
        let face = BoundingBox::new(75, 75, 50, 50);
        assert!((face_confidence(&face, 200, 200) - 0.625).abs() < 1e-12);
    }

    #[test]
    fn test_confidence_saturates() {
        let face = BoundingBox::new(0, 0, 150, 150);
        assert_eq!(face_confidence(&face, 200, 200), 1.0);
    }

    #[test]
    fn test_template_shape_and_range() {
        let img = Preprocessed::from_rgb(RgbImage::from_fn(200, 200, |x, y| {
            let v = ((x * 7 + y * 3) % 256) as u8;
            Rgb([v, v / 2, 255 - v])
        }))
        .unwrap();
        let encoder = FeatureEncoder::new(EncoderConfig::default()).unwrap();
        let enc = encoder.encode(&img, BoundingBox::new(60, 60, 50, 50)).unwrap();
        assert_eq!(enc.template.len(), 16384);
        assert!(enc.template.values().iter().all(|&v| (0.0..=1.0).contains(&v)));
        assert!((enc.confidence - 0.625).abs() < 1e-12);
    }

    #[test]
    fn test_encode_at_every_edge_and_corner() {
        let img = uniform(100, 80, 90);
        let encoder = FeatureEncoder::new(EncoderConfig::default()).unwrap();
        let boxes = [
            BoundingBox::new(0, 0, 30, 30),
            BoundingBox::new(70, 0, 30, 30),
            BoundingBox::new(0, 50, 30, 30),
            BoundingBox::new(70, 50, 30, 30),
            BoundingBox::new(35, 0, 30, 30),
            BoundingBox::new(0, 25, 30, 30),
            BoundingBox::new(0, 0, 100, 80),
        ];
        for face in boxes {
            let enc = encoder.encode(&img, face).unwrap();
            assert_eq!(enc.template.len(), 16384, "{face:?}");
        }
    }

    #[test]
    fn test_empty_crop_is_encoding_error() {
        let img = uniform(50, 50, 90);
        let encoder = FeatureEncoder::new(EncoderConfig::default()).unwrap();
        let err = encoder.encode(&img, BoundingBox::new(60, 60, 10, 10)).unwrap_err();
        assert!(matches!(err, EncodingError::EmptyCrop { .. }));
    }

    #[test]
    fn test_custom_patch_size() {
        let img = uniform(64, 64, 100);
        let config = EncoderConfig {
            patch_size: 32,
            ..EncoderConfig::default()
        };
        let encoder = FeatureEncoder::new(config).unwrap();
        let enc = encoder.encode(&img, BoundingBox::new(10, 10, 40, 40)).unwrap();
        assert_eq!(enc.template.len(), 32 * 32);
        // Uniform input stays uniform through equalization and smoothing.
        assert!(enc.template.values().iter().all(|&v| (v - 100.0 / 255.0).abs() < 1e-12));
    }

    #[test]
    fn test_color_patch_uses_bt601_luma() {
        let encoder = FeatureEncoder::new(EncoderConfig {
            patch_size: 16,
            ..EncoderConfig::default()
        })
        .unwrap();
        for (rgb, luma) in [([255, 0, 0], 76.0), ([0, 0, 255], 29.0)] {
            let img = Preprocessed::from_rgb(RgbImage::from_pixel(40, 40, Rgb(rgb))).unwrap();
            let enc = encoder.encode(&img, BoundingBox::new(5, 5, 30, 30)).unwrap();
            assert!(
                enc.template.values().iter().all(|&v| (v - luma / 255.0).abs() < 1e-12),
                "{rgb:?}"
            );
        }
    }

    #[test]
    fn test_zero_patch_size_rejected() {
        let config = EncoderConfig {
            patch_size: 0,
            ..EncoderConfig::default()
        };
        assert!(matches!(
            FeatureEncoder::new(config),
            Err(EncodingError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_quality_gate() {
        let encoder = FeatureEncoder::new(EncoderConfig::default()).unwrap();
        let template = FaceTemplate::new(vec![0.5; 4]).unwrap();
        let low = Encoding {
            template: template.clone(),
            confidence: 0.29,
            face: BoundingBox::new(0, 0, 1, 1),
        };
        assert!(matches!(
            encoder.check_quality(&low),
            Err(EncodingError::LowConfidence { .. })
        ));
        let ok = Encoding {
            template,
            confidence: 0.3,
            face: BoundingBox::new(0, 0, 1, 1),
        };
        assert!(encoder.check_quality(&ok).is_ok());
    }

    #[test]
    fn test_equalize_stretches_two_levels() {
        let mut img = GrayImage::from_fn(4, 4, |x, _| Luma([if x < 2 { 100 } else { 110 }]));
        equalize_histogram(&mut img);
        assert_eq!(img.get_pixel(0, 0).0[0], 0);
        assert_eq!(img.get_pixel(3, 0).0[0], 255);
    }

    #[test]
    fn test_equalize_constant_image_unchanged() {
        let mut img = GrayImage::from_pixel(8, 8, Luma([77]));
        equalize_histogram(&mut img);
        assert!(img.pixels().all(|p| p.0[0] == 77));
    }

    #[test]
    fn test_equalize_increases_contrast() {
        // Low-contrast 16x16 image: all pixels between 100–110
        let mut img = GrayImage::from_fn(16, 16, |x, y| Luma([100 + ((y * 16 + x) % 11) as u8]));
        let before = stddev(img.as_raw());
        equalize_histogram(&mut img);
        let after = stddev(img.as_raw());
        assert!(after > before, "before={before:.2}, after={after:.2}");
    }

    #[test]
    fn test_blur_preserves_uniform() {
        let img = GrayImage::from_pixel(9, 7, Luma([200]));
        let out = gaussian_blur_5x5(&img);
        assert!(out.iter().all(|&v| v == 200));
    }

    #[test]
    fn test_blur_spreads_impulse() {
        let mut img = GrayImage::from_pixel(9, 9, Luma([0]));
        img.put_pixel(4, 4, Luma([255]));
        let out = gaussian_blur_5x5(&img);
        // Center weight 36/256.
        assert_eq!(out[[4, 4]], ((255 * 36 + 128) >> 8) as u8);
        assert_eq!(out[[4, 3]], out[[4, 5]]);
        assert_eq!(out[[3, 4]], out[[5, 4]]);
        assert_eq!(out[[0, 0]], 0);
    }

    #[test]
    fn test_reflect101() {
        assert_eq!(reflect101(-1, 5), 1);
        assert_eq!(reflect101(-2, 5), 2);
        assert_eq!(reflect101(5, 5), 3);
        assert_eq!(reflect101(6, 5), 2);
        assert_eq!(reflect101(3, 1), 0);
        assert_eq!(reflect101(-2, 2), 0);
    }

    fn stddev(data: &[u8]) -> f64 {
        let n = data.len() as f64;
        let mean = data.iter().map(|&b| b as f64).sum::<f64>() / n;
        let variance = data.iter().map(|&b| (b as f64 - mean).powi(2)).sum::<f64>() / n;
        variance.sqrt()
    }
}
