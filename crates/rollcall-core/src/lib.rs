//! rollcall-core — face detection, template encoding, and matching.
//!
//! Detection runs a Haar-feature cascade over an integral image; templates
//! are equalized, smoothed grayscale face patches compared by cosine
//! similarity. Pure computation: no storage, network, or UI.

pub mod cascade;
pub mod detector;
pub mod encoder;
pub mod integral;
pub mod matcher;
pub mod pipeline;
pub mod preprocess;
pub mod types;

pub use detector::{DetectorConfig, FaceDetector};
pub use encoder::{EncodeError, EncoderConfig, EncodingError, FeatureEncoder};
pub use matcher::{
    compare, search, verify, Gallery, MatchError, Matcher, MatchingOrchestrator, SimilarityMatcher,
    DEFAULT_MATCH_THRESHOLD,
};
pub use pipeline::{FacePipeline, PipelineError};
pub use preprocess::{DecodeError, Preprocessed};
pub use types::{
    BoundingBox, DetectionResult, Encoding, Enrollment, FaceTemplate, MatchResult, MatchStage,
    TemplateError, TEMPLATE_LEN, TEMPLATE_WIRE_BYTES,
};
