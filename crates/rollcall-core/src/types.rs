use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Side length of the canonical face patch.
pub const PATCH_SIZE: u32 = 128;
/// Number of components in a template produced with the default patch size.
pub const TEMPLATE_LEN: usize = (PATCH_SIZE * PATCH_SIZE) as usize;
/// Width in bytes of one template component on the wire (IEEE-754 binary64).
pub const TEMPLATE_ELEMENT_BYTES: usize = std::mem::size_of::<f64>();
/// Size in bytes of a persisted default-length template.
pub const TEMPLATE_WIRE_BYTES: usize = TEMPLATE_LEN * TEMPLATE_ELEMENT_BYTES;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TemplateError {
    #[error("template length mismatch: {left} vs {right}")]
    LengthMismatch { left: usize, right: usize },
    #[error("template byte buffer is {actual} bytes, expected {expected}")]
    ByteLength { expected: usize, actual: usize },
    #[error("template is empty")]
    Empty,
    #[error("template has a non-finite component at index {0}")]
    NonFinite(usize),
    #[error("template has zero norm")]
    ZeroNorm,
}

/// Axis-aligned face rectangle in source-image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Exclusive right edge.
    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    /// Exclusive bottom edge.
    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }

    /// Grow the box by `pad` pixels on every side, clamped to a `width`×`height` image.
    pub fn padded(&self, pad: u32, width: u32, height: u32) -> BoundingBox {
        let x1 = self.x.saturating_sub(pad).min(width);
        let y1 = self.y.saturating_sub(pad).min(height);
        let x2 = self.right().saturating_add(pad).min(width);
        let y2 = self.bottom().saturating_add(pad).min(height);
        BoundingBox {
            x: x1,
            y: y1,
            width: x2.saturating_sub(x1),
            height: y2.saturating_sub(y1),
        }
    }
}

/// Encoded face: a row-major flattened, normalized grayscale patch.
///
/// Wire format: `len` components, each an 8-byte IEEE-754 double in the
/// platform's native byte order, no header. The default length is
/// [`TEMPLATE_LEN`] (131072 bytes); callers must know the length out-of-band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceTemplate {
    values: Vec<f64>,
}

impl FaceTemplate {
    /// Wrap raw components. Rejects empty vectors and NaN/infinite values.
    pub fn new(values: Vec<f64>) -> Result<Self, TemplateError> {
        if values.is_empty() {
            return Err(TemplateError::Empty);
        }
        if let Some(idx) = values.iter().position(|v| !v.is_finite()) {
            return Err(TemplateError::NonFinite(idx));
        }
        Ok(Self { values })
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn norm(&self) -> f64 {
        self.values.iter().map(|v| v * v).sum::<f64>().sqrt()
    }

    /// Serialize to the persisted byte layout.
    pub fn to_bytes(&self) -> Vec<u8> {
        bytemuck::cast_slice::<f64, u8>(&self.values).to_vec()
    }

    /// Parse a persisted default-length template.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TemplateError> {
        Self::from_bytes_with_len(bytes, TEMPLATE_LEN)
    }

    /// Parse a persisted template of `len` components.
    pub fn from_bytes_with_len(bytes: &[u8], len: usize) -> Result<Self, TemplateError> {
        let expected = len * TEMPLATE_ELEMENT_BYTES;
        if bytes.len() != expected {
            return Err(TemplateError::ByteLength {
                expected,
                actual: bytes.len(),
            });
        }
        let values = bytes
            .chunks_exact(TEMPLATE_ELEMENT_BYTES)
            .map(bytemuck::pod_read_unaligned::<f64>)
            .collect();
        Self::new(values)
    }

    /// Cosine similarity in [-1, 1].
    ///
    /// Unlike a best-effort score, degenerate input is a contract violation:
    /// mismatched lengths and zero-norm vectors are errors.
    pub fn similarity(&self, other: &FaceTemplate) -> Result<f64, TemplateError> {
        self.check_comparable(other)?;

        let mut dot = 0.0f64;
        let mut norm_a = 0.0f64;
        let mut norm_b = 0.0f64;
        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        if norm_a == 0.0 || norm_b == 0.0 {
            return Err(TemplateError::ZeroNorm);
        }
        // Clamp guards against rounding pushing |cos| past 1.
        Ok((dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0))
    }

    /// Euclidean distance. Diagnostic only; never part of a match decision.
    pub fn euclidean_distance(&self, other: &FaceTemplate) -> Result<f64, TemplateError> {
        self.check_comparable(other)?;
        Ok(self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f64>()
            .sqrt())
    }

    fn check_comparable(&self, other: &FaceTemplate) -> Result<(), TemplateError> {
        if self.len() != other.len() {
            return Err(TemplateError::LengthMismatch {
                left: self.len(),
                right: other.len(),
            });
        }
        Ok(())
    }
}

/// An enrolled identity and its template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Enrollment {
    pub identity: String,
    pub template: FaceTemplate,
}

impl Enrollment {
    pub fn new(identity: impl Into<String>, template: FaceTemplate) -> Self {
        Self {
            identity: identity.into(),
            template,
        }
    }
}

/// Outcome of a detection pass. No face is a normal outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionResult {
    /// Largest detected face, if any.
    pub face: Option<BoundingBox>,
    /// Face-size confidence of `face` (see [`Encoding::confidence`]).
    pub confidence: Option<f64>,
    /// Number of grouped face candidates.
    pub count: usize,
    pub image_width: u32,
    pub image_height: u32,
}

/// Successful encoding of one face.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Encoding {
    pub template: FaceTemplate,
    /// Face-size heuristic in [0, 1]; not a match probability.
    pub confidence: f64,
    pub face: BoundingBox,
}

/// Result of comparing a probe against one template or a gallery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub matched: bool,
    /// Cosine similarity of the reported comparison (best seen for searches).
    pub similarity: f64,
    /// Identity of the accepted match (gallery searches and identity verifies).
    pub identity: Option<String>,
}

/// Per-request pipeline stage, used in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchStage {
    Detecting,
    Encoding,
    Comparing,
    Matched,
    NotMatched,
    Failed,
}
