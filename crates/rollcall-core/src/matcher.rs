//! Template comparison: pairwise cosine matching, single-identity
//! verification, and gallery search.

use crate::types::{Enrollment, FaceTemplate, MatchResult, TemplateError};
use rayon::prelude::*;
use thiserror::Error;

/// Default acceptance threshold for cosine similarity.
pub const DEFAULT_MATCH_THRESHOLD: f64 = 0.7;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("invalid template: {0}")]
    InvalidTemplate(#[from] TemplateError),
    #[error("invalid template enrolled for {identity}: {source}")]
    InvalidGalleryTemplate {
        identity: String,
        #[source]
        source: TemplateError,
    },
    #[error("no template enrolled for {0}")]
    TemplateNotEnrolled(String),
}

/// Cosine similarity with a strict `>` acceptance threshold.
#[derive(Debug, Clone, Copy)]
pub struct SimilarityMatcher {
    pub threshold: f64,
}

impl Default for SimilarityMatcher {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_MATCH_THRESHOLD,
        }
    }
}

impl SimilarityMatcher {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    /// Compare two templates. Symmetric in its arguments.
    pub fn compare(&self, a: &FaceTemplate, b: &FaceTemplate) -> Result<MatchResult, MatchError> {
        let similarity = a.similarity(b)?;
        // Logged for diagnostics only; the decision uses cosine similarity alone.
        let distance = a.euclidean_distance(b)?;
        tracing::debug!(similarity, distance, threshold = self.threshold, "compared templates");

        Ok(MatchResult {
            matched: similarity > self.threshold,
            similarity,
            identity: None,
        })
    }
}

/// Strategy for matching a probe against enrolled templates.
pub trait Matcher {
    /// Probe vs one claimed identity's template (`None` when not enrolled).
    fn verify(
        &self,
        probe: &FaceTemplate,
        enrolled: Option<&FaceTemplate>,
        identity: &str,
    ) -> Result<MatchResult, MatchError>;

    /// Probe vs every enrolled identity; the best accepted identity wins.
    fn search(&self, probe: &FaceTemplate, gallery: &[Enrollment]) -> Result<MatchResult, MatchError>;

    /// Look `identity` up in `gallery` and verify against it.
    fn verify_identity(
        &self,
        probe: &FaceTemplate,
        gallery: &[Enrollment],
        identity: &str,
    ) -> Result<MatchResult, MatchError> {
        self.verify(probe, Gallery::new(gallery).get(identity), identity)
    }
}

/// Verify/search orchestration over a [`SimilarityMatcher`].
///
/// Search scores the gallery in parallel and reduces with an associative,
/// commutative max over (similarity, earliest gallery position), which is
/// exactly the sequential ratchet: the first identity to strictly beat the
/// running best above the threshold is kept.
#[derive(Debug, Clone, Copy, Default)]
pub struct MatchingOrchestrator {
    matcher: SimilarityMatcher,
}

impl MatchingOrchestrator {
    pub fn new(threshold: f64) -> Self {
        Self {
            matcher: SimilarityMatcher::new(threshold),
        }
    }

    pub fn threshold(&self) -> f64 {
        self.matcher.threshold
    }
}

impl Matcher for MatchingOrchestrator {
    fn verify(
        &self,
        probe: &FaceTemplate,
        enrolled: Option<&FaceTemplate>,
        identity: &str,
    ) -> Result<MatchResult, MatchError> {
        let enrolled = enrolled.ok_or_else(|| MatchError::TemplateNotEnrolled(identity.to_string()))?;
        let mut result = self.matcher.compare(enrolled, probe)?;
        if result.matched {
            result.identity = Some(identity.to_string());
        }
        tracing::info!(identity, matched = result.matched, similarity = result.similarity, "verify");
        Ok(result)
    }

    fn search(&self, probe: &FaceTemplate, gallery: &[Enrollment]) -> Result<MatchResult, MatchError> {
        let threshold = self.matcher.threshold;
        let scan = gallery
            .par_iter()
            .enumerate()
            .map(|(idx, entry)| {
                let similarity = entry.template.similarity(probe).map_err(|source| {
                    MatchError::InvalidGalleryTemplate {
                        identity: entry.identity.clone(),
                        source,
                    }
                })?;
                Ok::<_, MatchError>(Scan::single(idx, similarity, threshold))
            })
            .try_reduce_with(|a, b| Ok(a.merge(b)))
            .transpose()?
            .unwrap_or_default();

        let result = match scan.best {
            Some((idx, similarity)) => MatchResult {
                matched: true,
                similarity,
                identity: Some(gallery[idx].identity.clone()),
            },
            None => MatchResult {
                matched: false,
                similarity: scan.highest.unwrap_or(0.0),
                identity: None,
            },
        };

        tracing::info!(
            gallery = gallery.len(),
            threshold,
            highest = scan.highest.unwrap_or(0.0),
            matched = result.matched,
            identity = result.identity.as_deref().unwrap_or(""),
            "gallery search"
        );
        Ok(result)
    }
}

/// Partial search state; merging is associative and commutative.
#[derive(Debug, Clone, Copy, Default)]
struct Scan {
    /// Highest similarity seen, accepted or not.
    highest: Option<f64>,
    /// Best accepted (gallery index, similarity).
    best: Option<(usize, f64)>,
}

impl Scan {
    fn single(idx: usize, similarity: f64, threshold: f64) -> Self {
        Self {
            highest: Some(similarity),
            best: (similarity > threshold).then_some((idx, similarity)),
        }
    }

    fn merge(self, other: Scan) -> Scan {
        let highest = match (self.highest, other.highest) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        let best = match (self.best, other.best) {
            (Some(a), Some(b)) => {
                let b_wins = b.1 > a.1 || (b.1 == a.1 && b.0 < a.0);
                Some(if b_wins { b } else { a })
            }
            (a, b) => a.or(b),
        };
        Scan { highest, best }
    }
}

/// Caller-owned, read-only view of enrolled templates, valid for one call.
#[derive(Debug, Clone, Copy)]
pub struct Gallery<'a> {
    entries: &'a [Enrollment],
}

impl<'a> Gallery<'a> {
    pub fn new(entries: &'a [Enrollment]) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, identity: &str) -> Option<&'a FaceTemplate> {
        self.entries
            .iter()
            .find(|e| e.identity == identity)
            .map(|e| &e.template)
    }

    pub fn verify(&self, probe: &FaceTemplate, identity: &str, threshold: f64) -> Result<MatchResult, MatchError> {
        MatchingOrchestrator::new(threshold).verify_identity(probe, self.entries, identity)
    }

    pub fn search(&self, probe: &FaceTemplate, threshold: f64) -> Result<MatchResult, MatchError> {
        MatchingOrchestrator::new(threshold).search(probe, self.entries)
    }
}

/// Compare two templates with `threshold`.
pub fn compare(a: &FaceTemplate, b: &FaceTemplate, threshold: f64) -> Result<MatchResult, MatchError> {
    SimilarityMatcher::new(threshold).compare(a, b)
}

/// Verify a probe against one claimed identity's template.
pub fn verify(
    probe: &FaceTemplate,
    enrolled: Option<&FaceTemplate>,
    identity: &str,
    threshold: f64,
) -> Result<MatchResult, MatchError> {
    MatchingOrchestrator::new(threshold).verify(probe, enrolled, identity)
}

/// Search a gallery for the best identity above `threshold`.
pub fn search(probe: &FaceTemplate, gallery: &[Enrollment], threshold: f64) -> Result<MatchResult, MatchError> {
    MatchingOrchestrator::new(threshold).search(probe, gallery)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand::rngs::StdRng;

    fn template(values: &[f64]) -> FaceTemplate {
        FaceTemplate::new(values.to_vec()).unwrap()
    }

    /// Unit vector whose cosine with `[1, 0]` is `cos`.
    fn at_cosine(cos: f64) -> FaceTemplate {
        template(&[cos, (1.0 - cos * cos).sqrt()])
    }

    fn enrolled(identity: &str, t: FaceTemplate) -> Enrollment {
        Enrollment::new(identity, t)
    }

    fn random_template(rng: &mut StdRng, len: usize) -> FaceTemplate {
        template(&(0..len).map(|_| rng.gen_range(0.0..1.0)).collect::<Vec<_>>())
    }

    #[test]
    fn test_compare_symmetric_and_self_similar() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..20 {
            let a = random_template(&mut rng, 64);
            let b = random_template(&mut rng, 64);
            let ab = compare(&a, &b, 0.7).unwrap();
            let ba = compare(&b, &a, 0.7).unwrap();
            assert_eq!(ab, ba);
            assert!((compare(&a, &a, 0.7).unwrap().similarity - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_threshold_monotonicity() {
        let mut rng = StdRng::seed_from_u64(11);
        let thresholds = [0.0, 0.3, 0.5, 0.7, 0.75, 0.8, 0.9, 0.99];
        for _ in 0..20 {
            let a = random_template(&mut rng, 32);
            let b = random_template(&mut rng, 32);
            for (i, &t1) in thresholds.iter().enumerate() {
                for &t2 in &thresholds[i + 1..] {
                    if compare(&a, &b, t2).unwrap().matched {
                        assert!(compare(&a, &b, t1).unwrap().matched);
                    }
                }
            }
        }
    }

    #[test]
    fn test_match_is_strictly_greater_than_threshold() {
        let probe = template(&[1.0, 0.0]);
        let result = compare(&probe, &probe, 1.0).unwrap();
        assert!(!result.matched);
        assert!(compare(&probe, &at_cosine(0.65), 0.7).unwrap().similarity < 0.7);
        assert!(!compare(&probe, &at_cosine(0.65), 0.7).unwrap().matched);
    }

    #[test]
    fn test_compare_zero_norm_is_invalid_template() {
        let err = compare(&template(&[0.0, 0.0]), &template(&[1.0, 1.0]), 0.7).unwrap_err();
        assert_eq!(err, MatchError::InvalidTemplate(TemplateError::ZeroNorm));
    }

    #[test]
    fn test_compare_length_mismatch_is_invalid_template() {
        let err = compare(&template(&[1.0]), &template(&[1.0, 1.0]), 0.7).unwrap_err();
        assert!(matches!(err, MatchError::InvalidTemplate(TemplateError::LengthMismatch { .. })));
    }

    #[test]
    fn test_search_picks_best_above_threshold() {
        let probe = template(&[1.0, 0.0]);
        let gallery = vec![
            enrolled("alice", at_cosine(0.5)),
            enrolled("bob", at_cosine(0.82)),
            enrolled("carol", at_cosine(0.4)),
        ];
        let result = search(&probe, &gallery, 0.7).unwrap();
        assert!(result.matched);
        assert_eq!(result.identity.as_deref(), Some("bob"));
        assert!((result.similarity - 0.82).abs() < 1e-9);
    }

    #[test]
    fn test_search_below_threshold_is_no_match() {
        let probe = template(&[1.0, 0.0]);
        for size in [1, 2, 10, 100] {
            let gallery: Vec<Enrollment> = (0..size)
                .map(|i| enrolled(&format!("s{i}"), at_cosine(0.65)))
                .collect();
            let result = search(&probe, &gallery, 0.7).unwrap();
            assert!(!result.matched);
            assert!(result.identity.is_none());
            assert!((result.similarity - 0.65).abs() < 1e-9);
        }
    }

    #[test]
    fn test_search_tie_keeps_first_found() {
        let probe = template(&[1.0, 0.0]);
        let gallery: Vec<Enrollment> = (0..64)
            .map(|i| {
                let cos = if i == 17 || i == 40 { 0.9 } else { 0.75 };
                enrolled(&format!("s{i}"), at_cosine(cos))
            })
            .collect();
        for _ in 0..10 {
            let result = search(&probe, &gallery, 0.7).unwrap();
            assert_eq!(result.identity.as_deref(), Some("s17"));
        }
    }

    #[test]
    fn test_search_matches_sequential_ratchet() {
        let mut rng = StdRng::seed_from_u64(3);
        let probe = random_template(&mut rng, 16);
        let gallery: Vec<Enrollment> = (0..200)
            .map(|i| enrolled(&format!("s{i}"), random_template(&mut rng, 16)))
            .collect();

        for threshold in [0.7, 0.75, 0.8, 0.85, 0.99] {
            let mut best: Option<&str> = None;
            let mut best_sim = threshold;
            for e in &gallery {
                let sim = e.template.similarity(&probe).unwrap();
                if sim > threshold && sim > best_sim {
                    best = Some(&e.identity);
                    best_sim = sim;
                }
            }
            let result = search(&probe, &gallery, threshold).unwrap();
            assert_eq!(result.identity.as_deref(), best, "threshold {threshold}");
        }
    }

    #[test]
    fn test_search_empty_gallery() {
        let result = search(&template(&[1.0]), &[], 0.7).unwrap();
        assert!(!result.matched);
        assert_eq!(result.similarity, 0.0);
    }

    #[test]
    fn test_search_invalid_gallery_template_names_identity() {
        let probe = template(&[1.0, 0.0]);
        let gallery = vec![
            enrolled("alice", at_cosine(0.9)),
            enrolled("broken", template(&[1.0, 0.0, 0.0])),
        ];
        let err = search(&probe, &gallery, 0.7).unwrap_err();
        assert!(matches!(
            err,
            MatchError::InvalidGalleryTemplate { ref identity, .. } if identity == "broken"
        ));
    }

    #[test]
    fn test_verify_not_enrolled() {
        let probe = template(&[1.0, 0.0]);
        let err = verify(&probe, None, "dave", 0.7).unwrap_err();
        assert_eq!(err, MatchError::TemplateNotEnrolled("dave".into()));

        let gallery = vec![enrolled("alice", probe.clone())];
        let err = MatchingOrchestrator::default()
            .verify_identity(&probe, &gallery, "dave")
            .unwrap_err();
        assert_eq!(err, MatchError::TemplateNotEnrolled("dave".into()));
    }

    #[test]
    fn test_verify_identity_match() {
        let probe = template(&[1.0, 0.0]);
        let gallery = vec![
            enrolled("alice", at_cosine(0.3)),
            enrolled("bob", at_cosine(0.95)),
        ];
        let orchestrator = MatchingOrchestrator::default();
        let bob = orchestrator.verify_identity(&probe, &gallery, "bob").unwrap();
        assert!(bob.matched);
        assert_eq!(bob.identity.as_deref(), Some("bob"));

        let alice = orchestrator.verify_identity(&probe, &gallery, "alice").unwrap();
        assert!(!alice.matched);
        assert!(alice.identity.is_none());
    }

    #[test]
    fn test_gallery_view() {
        let probe = template(&[1.0, 0.0]);
        let entries = vec![enrolled("alice", at_cosine(0.9)), enrolled("bob", at_cosine(0.2))];
        let gallery = Gallery::new(&entries);
        assert_eq!(gallery.len(), 2);
        assert!(gallery.get("carol").is_none());

        let alice = gallery.verify(&probe, "alice", 0.7).unwrap();
        assert_eq!(alice.identity.as_deref(), Some("alice"));
        assert!(matches!(
            gallery.verify(&probe, "carol", 0.7),
            Err(MatchError::TemplateNotEnrolled(_))
        ));
        assert_eq!(gallery.search(&probe, 0.95).unwrap().identity, None);
    }

    #[test]
    fn test_scan_merge_commutative() {
        let a = Scan::single(0, 0.8, 0.7);
        let b = Scan::single(1, 0.8, 0.7);
        let c = Scan::single(2, 0.6, 0.7);
        assert_eq!(a.merge(b).best, b.merge(a).best);
        assert_eq!(a.merge(b).merge(c).best, a.merge(b.merge(c)).best);
        assert_eq!(a.merge(b).best.map(|(i, _)| i), Some(0));
    }
}
