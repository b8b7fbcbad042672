//! Boosted cascade of Haar-like rectangle features.
//!
//! The model mirrors OpenCV's `CascadeClassifier` layout: a shared table of
//! rectangle features over a square base window, and a list of stages, each
//! a sum of weak decision trees. A node compares the feature's weighted
//! rectangle sum against `threshold × area × σ`, where `area` and `σ` are
//! taken over the window inset by one base pixel. A window is a candidate
//! only when every stage sum reaches its stage threshold.
//!
//! Models load from this crate's JSON layout or from OpenCV's cascade XML
//! (`haarcascade_frontalface_default.xml` and friends). The built-in model is
//! embedded at compile time from `models/frontal_face.json` and parsed once
//! per process.

mod opencv;

use crate::integral::IntegralImage;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, OnceLock};
use thiserror::Error;

const BUILTIN_MODEL: &str = include_str!("../models/frontal_face.json");

static BUILTIN: OnceLock<Result<Arc<Cascade>, String>> = OnceLock::new();

#[derive(Error, Debug)]
pub enum CascadeError {
    #[error("cascade model not found: {0}")]
    ModelNotFound(String),
    #[error("reading cascade model {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing cascade model: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("parsing cascade XML: {0}")]
    Xml(String),
    #[error("invalid cascade model: {0}")]
    Invalid(String),
}

/// One weighted rectangle, in base-window pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightedRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub weight: f64,
}

/// Haar-like feature: the weighted sum of its rectangles' pixel sums.
///
/// With two or more rectangles, the first rectangle's weight is recomputed
/// at every scale so the feature stays zero-sum after rounding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub rects: Vec<WeightedRect>,
}

/// Split node of a weak tree.
///
/// `left`/`right` name the next node when positive, otherwise the leaf
/// at index `-left`/`-right`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub feature: usize,
    pub threshold: f64,
    pub left: i32,
    pub right: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeakClassifier {
    pub nodes: Vec<Node>,
    pub leaves: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub threshold: f64,
    pub classifiers: Vec<WeakClassifier>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cascade {
    #[serde(default)]
    pub name: String,
    /// Side of the square base window.
    pub window: u32,
    /// Windows whose variance is at or below this are rejected outright.
    #[serde(default)]
    pub min_variance: f64,
    pub features: Vec<Feature>,
    pub stages: Vec<Stage>,
}

impl Cascade {
    /// The embedded frontal-face model, parsed on first use and shared read-only.
    pub fn builtin() -> Result<Arc<Cascade>, CascadeError> {
        BUILTIN
            .get_or_init(|| {
                Cascade::from_json(BUILTIN_MODEL)
                    .map(Arc::new)
                    .map_err(|e| e.to_string())
            })
            .clone()
            .map_err(CascadeError::Invalid)
    }

    /// Load a model from disk: OpenCV XML for `.xml` files, JSON otherwise.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CascadeError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(CascadeError::ModelNotFound(path.display().to_string()));
        }
        let raw = std::fs::read_to_string(path).map_err(|source| CascadeError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let is_xml = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("xml"))
            || raw.trim_start().starts_with('<');
        let cascade = if is_xml {
            Self::from_opencv_xml(&raw)?
        } else {
            Self::from_json(&raw)?
        };

        tracing::info!(
            path = %path.display(),
            name = %cascade.name,
            window = cascade.window,
            stages = cascade.stages.len(),
            features = cascade.features.len(),
            "loaded cascade model"
        );
        Ok(cascade)
    }

    pub fn from_json(raw: &str) -> Result<Self, CascadeError> {
        let cascade: Cascade = serde_json::from_str(raw)?;
        cascade.validate()?;
        Ok(cascade)
    }

    /// Parse an OpenCV `opencv-cascade-classifier` XML document (HAAR, BOOST).
    pub fn from_opencv_xml(raw: &str) -> Result<Self, CascadeError> {
        let cascade = opencv::parse(raw)?;
        cascade.validate()?;
        Ok(cascade)
    }

    fn validate(&self) -> Result<(), CascadeError> {
        if self.window < 3 {
            return Err(CascadeError::Invalid(format!(
                "window must be at least 3 pixels, got {}",
                self.window
            )));
        }
        if self.stages.is_empty() {
            return Err(CascadeError::Invalid("model has no stages".into()));
        }
        if !self.min_variance.is_finite() || self.min_variance < 0.0 {
            return Err(CascadeError::Invalid(format!(
                "min_variance must be a non-negative number, got {}",
                self.min_variance
            )));
        }
        for (f, feature) in self.features.iter().enumerate() {
            if feature.rects.is_empty() {
                return Err(CascadeError::Invalid(format!("feature {f} has no rectangles")));
            }
            for r in &feature.rects {
                let inside = r.width > 0
                    && r.height > 0
                    && r.x.checked_add(r.width).is_some_and(|end| end <= self.window)
                    && r.y.checked_add(r.height).is_some_and(|end| end <= self.window);
                if !inside || r.weight == 0.0 || !r.weight.is_finite() {
                    return Err(CascadeError::Invalid(format!(
                        "feature {f} has a bad rectangle {r:?}"
                    )));
                }
            }
        }
        for (s, stage) in self.stages.iter().enumerate() {
            if stage.classifiers.is_empty() {
                return Err(CascadeError::Invalid(format!("stage {s} has no classifiers")));
            }
            if !stage.threshold.is_finite() {
                return Err(CascadeError::Invalid(format!("stage {s} threshold is not finite")));
            }
            for (c, weak) in stage.classifiers.iter().enumerate() {
                self.validate_tree(weak)
                    .map_err(|why| CascadeError::Invalid(format!("stage {s} classifier {c}: {why}")))?;
            }
        }
        Ok(())
    }

    /// Children must point forward so evaluation always reaches a leaf.
    fn validate_tree(&self, weak: &WeakClassifier) -> Result<(), String> {
        if weak.nodes.is_empty() {
            return Err("no nodes".into());
        }
        if weak.leaves.iter().any(|l| !l.is_finite()) {
            return Err("non-finite leaf value".into());
        }
        for (i, node) in weak.nodes.iter().enumerate() {
            if node.feature >= self.features.len() {
                return Err(format!("node {i} uses missing feature {}", node.feature));
            }
            if !node.threshold.is_finite() {
                return Err(format!("node {i} threshold is not finite"));
            }
            for child in [node.left, node.right] {
                let ok = if child > 0 {
                    (child as usize) > i && (child as usize) < weak.nodes.len()
                } else {
                    (child.unsigned_abs() as usize) < weak.leaves.len()
                };
                if !ok {
                    return Err(format!("node {i} has a dangling child {child}"));
                }
            }
        }
        Ok(())
    }

    /// Side of the scanning window at `scale`.
    pub fn window_at(&self, scale: f64) -> u32 {
        (self.window as f64 * scale).round() as u32
    }

    /// Features and normalization region mapped to `scale`.
    pub fn at_scale(&self, scale: f64) -> ScaledCascade<'_> {
        let window = self.window_at(scale);
        let features = self
            .features
            .iter()
            .map(|feature| ScaledFeature::new(feature, scale, window))
            .collect();
        ScaledCascade {
            cascade: self,
            window,
            border: scale.round() as u32,
            inner: ((self.window - 2) as f64 * scale).round() as u32,
            features,
        }
    }
}

/// A rectangle in window pixels with its effective weight.
#[derive(Debug, Clone, Copy)]
struct ScaledRect {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    weight: f64,
}

#[derive(Debug, Clone)]
struct ScaledFeature {
    rects: Vec<ScaledRect>,
}

impl ScaledFeature {
    fn new(feature: &Feature, scale: f64, window: u32) -> Self {
        let mut rects: Vec<ScaledRect> = feature
            .rects
            .iter()
            .map(|r| {
                let x = ((r.x as f64 * scale).round() as u32).min(window - 1);
                let y = ((r.y as f64 * scale).round() as u32).min(window - 1);
                ScaledRect {
                    x,
                    y,
                    width: ((r.width as f64 * scale).round() as u32).clamp(1, window - x),
                    height: ((r.height as f64 * scale).round() as u32).clamp(1, window - y),
                    weight: r.weight,
                }
            })
            .collect();

        if rects.len() > 1 {
            let rest: f64 = rects[1..]
                .iter()
                .map(|r| r.weight * (r.width * r.height) as f64)
                .sum();
            rects[0].weight = -rest / (rects[0].width * rects[0].height) as f64;
        }
        Self { rects }
    }

    fn value(&self, ii: &IntegralImage, x: u32, y: u32) -> f64 {
        self.rects
            .iter()
            .map(|r| r.weight * ii.rect_sum(x + r.x, y + r.y, r.width, r.height) as f64)
            .sum()
    }
}

/// A cascade prepared for one pyramid scale.
pub struct ScaledCascade<'a> {
    cascade: &'a Cascade,
    window: u32,
    border: u32,
    inner: u32,
    features: Vec<ScaledFeature>,
}

impl ScaledCascade<'_> {
    pub fn window(&self) -> u32 {
        self.window
    }

    /// Run every stage on the window whose top-left corner is (`x`, `y`).
    ///
    /// The window must lie inside the integral image.
    pub fn classify(&self, ii: &IntegralImage, x: u32, y: u32) -> bool {
        let (nx, ny) = (x + self.border, y + self.border);
        let area = self.inner as f64 * self.inner as f64;
        let mean = ii.rect_sum(nx, ny, self.inner, self.inner) as f64 / area;
        let variance = ii.rect_sq_sum(nx, ny, self.inner, self.inner) as f64 / area - mean * mean;
        if variance <= self.cascade.min_variance {
            return false;
        }
        let norm = variance.sqrt() * area;

        self.cascade.stages.iter().all(|stage| {
            let sum: f64 = stage
                .classifiers
                .iter()
                .map(|weak| self.evaluate(weak, ii, x, y, norm))
                .sum();
            sum >= stage.threshold
        })
    }

    fn evaluate(&self, weak: &WeakClassifier, ii: &IntegralImage, x: u32, y: u32, norm: f64) -> f64 {
        let mut idx = 0usize;
        loop {
            let node = &weak.nodes[idx];
            let value = self.features[node.feature].value(ii, x, y);
            let next = if value < node.threshold * norm {
                node.left
            } else {
                node.right
            };
            if next > 0 {
                idx = next as usize;
            } else {
                return weak.leaves[next.unsigned_abs() as usize];
            }
        }
    }
}
