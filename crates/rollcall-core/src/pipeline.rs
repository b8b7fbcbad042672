//! Byte-level entry points: decode → detect → encode.

use crate::detector::{select_largest, DetectorConfig, DetectorError, FaceDetector};
use crate::encoder::{face_confidence, EncodeError, EncoderConfig, EncodingError, FeatureEncoder};
use crate::preprocess::{self, DecodeError, Preprocessed};
use crate::types::{DetectionResult, Encoding, MatchStage};

/// Detector and encoder pair shared by every request.
///
/// Holds no per-request state; cloning shares the classifier model.
#[derive(Clone)]
pub struct FacePipeline {
    detector: FaceDetector,
    encoder: FeatureEncoder,
}

impl FacePipeline {
    pub fn new(detector: FaceDetector, encoder: FeatureEncoder) -> Self {
        Self { detector, encoder }
    }

    /// Built-in cascade with the given policy configs.
    pub fn with_configs(detector: DetectorConfig, encoder: EncoderConfig) -> Result<Self, PipelineError> {
        Ok(Self::new(
            FaceDetector::builtin(detector)?,
            FeatureEncoder::new(encoder)?,
        ))
    }

    /// Built-in cascade, default configs.
    pub fn builtin() -> Result<Self, PipelineError> {
        Self::with_configs(DetectorConfig::default(), EncoderConfig::default())
    }

    pub fn detector(&self) -> &FaceDetector {
        &self.detector
    }

    pub fn encoder(&self) -> &FeatureEncoder {
        &self.encoder
    }

    /// Decode and detect. "No face" is a normal result, not an error.
    pub fn detect(&self, image: &[u8]) -> Result<DetectionResult, DecodeError> {
        let image = preprocess::decode(image)?;
        Ok(self.detect_image(&image))
    }

    pub fn detect_image(&self, image: &Preprocessed) -> DetectionResult {
        tracing::debug!(stage = ?MatchStage::Detecting, "pipeline");
        let candidates = self.detector.detect(&image.gray);
        let face = select_largest(&candidates).map(|c| c.bbox);
        DetectionResult {
            face,
            confidence: face.map(|f| face_confidence(&f, image.width(), image.height())),
            count: candidates.len(),
            image_width: image.width(),
            image_height: image.height(),
        }
    }

    /// Decode, detect the largest face, and encode it.
    pub fn encode(&self, image: &[u8]) -> Result<Encoding, EncodeError> {
        let image = preprocess::decode(image)?;
        self.encode_image(&image)
    }

    pub fn encode_image(&self, image: &Preprocessed) -> Result<Encoding, EncodeError> {
        let detection = self.detect_image(image);
        let Some(face) = detection.face else {
            tracing::debug!(stage = ?MatchStage::Failed, "no face detected");
            return Err(EncodeError::NoFaceDetected);
        };

        tracing::debug!(stage = ?MatchStage::Encoding, ?face, candidates = detection.count, "pipeline");
        let encoding = self.encoder.encode(image, face)?;
        Ok(encoding)
    }

    /// Encode, then apply the enrollment quality gate.
    pub fn enroll(&self, image: &[u8]) -> Result<Encoding, EncodeError> {
        let encoding = self.encode(image)?;
        if let Err(e) = self.encoder.check_quality(&encoding) {
            tracing::warn!(
                confidence = encoding.confidence,
                minimum = self.encoder.config().min_confidence,
                "enrollment rejected"
            );
            return Err(e.into());
        }
        tracing::info!(face = ?encoding.face, confidence = encoding.confidence, "enrollment accepted");
        Ok(encoding)
    }
}

/// Pipeline construction failures.
#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("encoder: {0}")]
    Encoder(#[from] EncodingError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    fn png(img: &RgbImage) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    #[test]
    fn test_detect_blank_is_not_an_error() {
        let pipeline = FacePipeline::builtin().unwrap();
        let blank = png(&RgbImage::from_pixel(120, 90, Rgb([128, 128, 128])));
        let result = pipeline.detect(&blank).unwrap();
        assert!(result.face.is_none());
        assert!(result.confidence.is_none());
        assert_eq!(result.count, 0);
        assert_eq!((result.image_width, result.image_height), (120, 90));
    }

    #[test]
    fn test_encode_blank_is_no_face() {
        let pipeline = FacePipeline::builtin().unwrap();
        let blank = png(&RgbImage::from_pixel(64, 64, Rgb([10, 10, 10])));
        assert!(matches!(pipeline.encode(&blank), Err(EncodeError::NoFaceDetected)));
        assert!(matches!(pipeline.enroll(&blank), Err(EncodeError::NoFaceDetected)));
    }

    #[test]
    fn test_garbage_bytes_are_decode_errors() {
        let pipeline = FacePipeline::builtin().unwrap();
        assert!(pipeline.detect(b"not an image").is_err());
        assert!(matches!(pipeline.encode(b"not an image"), Err(EncodeError::Decode(_))));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let detector = DetectorConfig {
            scale_factor: 1.0,
            ..Default::default()
        };
        assert!(matches!(
            FacePipeline::with_configs(detector, EncoderConfig::default()),
            Err(PipelineError::Detector(DetectorError::InvalidConfig(_)))
        ));
    }
}
