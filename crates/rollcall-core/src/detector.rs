//! Multi-scale sliding-window face detector.
//!
//! Scans a grayscale frame with a [`Cascade`], groups overlapping raw hits
//! the way OpenCV's `groupRectangles` does, and picks the largest surviving
//! candidate as the subject.

use crate::cascade::{Cascade, CascadeError};
use crate::integral::IntegralImage;
use crate::types::BoundingBox;
use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

// --- Defaults ---
const DEFAULT_MIN_FACE_SIZE: u32 = 30;
const DEFAULT_SCALE_FACTOR: f64 = 1.1;
const DEFAULT_MIN_NEIGHBORS: usize = 5;
const DEFAULT_GROUP_EPS: f64 = 0.2;
/// Window stride in base-window pixels; multiplied by the current scale.
const BASE_STRIDE: f64 = 2.0;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("no face detected")]
    NoFaceDetected,
    #[error("invalid detector config: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Cascade(#[from] CascadeError),
}

/// Detector policy knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Smallest (width, height) a face window may have, in pixels.
    pub min_face_size: (u32, u32),
    /// Window growth per pyramid level; must be > 1.
    pub scale_factor: f64,
    /// A group counts as a face only with more raw hits than this.
    pub min_neighbors: usize,
    /// Relative edge tolerance when grouping raw hits.
    pub group_eps: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            min_face_size: (DEFAULT_MIN_FACE_SIZE, DEFAULT_MIN_FACE_SIZE),
            scale_factor: DEFAULT_SCALE_FACTOR,
            min_neighbors: DEFAULT_MIN_NEIGHBORS,
            group_eps: DEFAULT_GROUP_EPS,
        }
    }
}

impl DetectorConfig {
    fn validate(&self) -> Result<(), DetectorError> {
        if !(self.scale_factor > 1.0 && self.scale_factor.is_finite()) {
            return Err(DetectorError::InvalidConfig(format!(
                "scale_factor must be > 1.0, got {}",
                self.scale_factor
            )));
        }
        if !(self.group_eps >= 0.0 && self.group_eps.is_finite()) {
            return Err(DetectorError::InvalidConfig(format!(
                "group_eps must be >= 0, got {}",
                self.group_eps
            )));
        }
        Ok(())
    }
}

/// A grouped face candidate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub bbox: BoundingBox,
    /// Number of raw window hits merged into this candidate.
    pub neighbors: usize,
}

/// Cascade-based face detector. Cheap to clone; the model is shared.
#[derive(Clone)]
pub struct FaceDetector {
    cascade: Arc<Cascade>,
    config: DetectorConfig,
}

impl FaceDetector {
    pub fn new(cascade: Arc<Cascade>, config: DetectorConfig) -> Result<Self, DetectorError> {
        config.validate()?;
        Ok(Self { cascade, config })
    }

    /// Detector backed by the embedded frontal-face model.
    pub fn builtin(config: DetectorConfig) -> Result<Self, DetectorError> {
        Self::new(Cascade::builtin()?, config)
    }

    /// Detector backed by a JSON or OpenCV XML model on disk.
    pub fn load(model_path: impl AsRef<Path>, config: DetectorConfig) -> Result<Self, DetectorError> {
        Self::new(Arc::new(Cascade::load(model_path)?), config)
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// All grouped face candidates, in scan order.
    pub fn detect(&self, gray: &GrayImage) -> Vec<Candidate> {
        let hits = self.scan(gray);
        let candidates = group_rectangles(&hits, self.config.min_neighbors, self.config.group_eps);
        tracing::debug!(
            width = gray.width(),
            height = gray.height(),
            raw_hits = hits.len(),
            candidates = candidates.len(),
            "cascade scan complete"
        );
        candidates
    }

    /// The largest face in the frame, or [`DetectorError::NoFaceDetected`].
    pub fn locate(&self, gray: &GrayImage) -> Result<BoundingBox, DetectorError> {
        select_largest(&self.detect(gray))
            .map(|c| c.bbox)
            .ok_or(DetectorError::NoFaceDetected)
    }

    /// Raw window hits over every pyramid scale.
    fn scan(&self, gray: &GrayImage) -> Vec<BoundingBox> {
        let ii = IntegralImage::new(gray);
        let (width, height) = (ii.width(), ii.height());
        let (min_w, min_h) = self.config.min_face_size;

        let mut hits = Vec::new();
        let mut scale = 1.0f64;
        loop {
            let win = self.cascade.window_at(scale);
            if win > width || win > height {
                break;
            }
            if win >= min_w && win >= min_h {
                let scaled = self.cascade.at_scale(scale);
                let stride = ((BASE_STRIDE * scale).round() as u32).max(1);
                for y in (0..=height - win).step_by(stride as usize) {
                    for x in (0..=width - win).step_by(stride as usize) {
                        if scaled.classify(&ii, x, y) {
                            hits.push(BoundingBox::new(x, y, win, win));
                        }
                    }
                }
            }
            scale *= self.config.scale_factor;
        }
        hits
    }
}

/// Largest candidate by area; the earliest wins ties.
pub fn select_largest(candidates: &[Candidate]) -> Option<Candidate> {
    candidates.iter().copied().reduce(|best, c| {
        if c.bbox.area() > best.bbox.area() {
            c
        } else {
            best
        }
    })
}

/// OpenCV's rectangle similarity: every edge within `eps` of the mean size.
fn similar(a: &BoundingBox, b: &BoundingBox, eps: f64) -> bool {
    let delta = eps * (a.width.min(b.width) + a.height.min(b.height)) as f64 * 0.5;
    let close = |p: u32, q: u32| (p as f64 - q as f64).abs() <= delta;
    close(a.x, b.x) && close(a.y, b.y) && close(a.right(), b.right()) && close(a.bottom(), b.bottom())
}

fn find(parent: &mut [usize], mut i: usize) -> usize {
    while parent[i] != i {
        parent[i] = parent[parent[i]];
        i = parent[i];
    }
    i
}

/// Cluster raw hits, average each cluster, and drop weak or nested clusters.
///
/// A cluster survives with more than `min_neighbors` members. With
/// `min_neighbors == 0` the raw hits are returned ungrouped.
fn group_rectangles(hits: &[BoundingBox], min_neighbors: usize, eps: f64) -> Vec<Candidate> {
    if min_neighbors == 0 {
        return hits
            .iter()
            .map(|&bbox| Candidate { bbox, neighbors: 1 })
            .collect();
    }

    // Union-find; each root is the earliest member of its cluster.
    let mut parent: Vec<usize> = (0..hits.len()).collect();
    for i in 0..hits.len() {
        for j in (i + 1)..hits.len() {
            if similar(&hits[i], &hits[j], eps) {
                let a = find(&mut parent, i);
                let b = find(&mut parent, j);
                if a != b {
                    parent[a.max(b)] = a.min(b);
                }
            }
        }
    }

    // Clusters in order of first member.
    let mut roots: Vec<usize> = Vec::new();
    let mut sums: Vec<[u64; 4]> = Vec::new();
    let mut counts: Vec<usize> = Vec::new();
    for (i, hit) in hits.iter().enumerate() {
        let root = find(&mut parent, i);
        let slot = match roots.iter().position(|&r| r == root) {
            Some(slot) => slot,
            None => {
                roots.push(root);
                sums.push([0; 4]);
                counts.push(0);
                roots.len() - 1
            }
        };
        let s = &mut sums[slot];
        s[0] += hit.x as u64;
        s[1] += hit.y as u64;
        s[2] += hit.width as u64;
        s[3] += hit.height as u64;
        counts[slot] += 1;
    }

    let clusters: Vec<Candidate> = sums
        .iter()
        .zip(counts.iter())
        .filter(|(_, &n)| n > min_neighbors)
        .map(|(s, &n)| {
            let avg = |v: u64| (v as f64 / n as f64).round() as u32;
            Candidate {
                bbox: BoundingBox::new(avg(s[0]), avg(s[1]), avg(s[2]), avg(s[3])),
                neighbors: n,
            }
        })
        .collect();

    // Drop clusters sitting inside a stronger one.
    clusters
        .iter()
        .enumerate()
        .filter(|&(i, inner)| {
            !clusters.iter().enumerate().any(|(j, outer)| {
                i != j && nested(inner, outer, eps)
            })
        })
        .map(|(_, c)| *c)
        .collect()
}

fn nested(inner: &Candidate, outer: &Candidate, eps: f64) -> bool {
    let (a, b) = (&inner.bbox, &outer.bbox);
    let dx = (b.width as f64 * eps).round() as i64;
    let dy = (b.height as f64 * eps).round() as i64;
    let inside = a.x as i64 >= b.x as i64 - dx
        && a.y as i64 >= b.y as i64 - dy
        && a.right() as i64 <= b.right() as i64 + dx
        && a.bottom() as i64 <= b.bottom() as i64 + dy;
    inside && (outer.neighbors > inner.neighbors.max(3) || inner.neighbors < 3)
}
