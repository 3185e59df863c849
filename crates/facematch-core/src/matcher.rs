//! Identity decisions over embeddings: single-pair verification, pool
//! scans for similar faces, and nearest-match search over a gallery.

use crate::codec::{self, MalformedEmbedding};
use crate::distance::{euclidean_distance, DimensionMismatch};
use crate::types::{Candidate, Embedding, MatchThreshold, SampleCap};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("malformed stored embedding: {0}")]
    Malformed(#[from] MalformedEmbedding),
    #[error(transparent)]
    DimensionMismatch(#[from] DimensionMismatch),
    #[error("query vector has a non-finite value at position {position}")]
    NonFiniteQuery { position: usize },
}

/// Distance between the primary vector of a stored embedding and a probe.
///
/// A probe holding `NaN` or an infinity is rejected, since its distance
/// would compare as a silent non-match.
pub fn distance_to_stored(stored: &str, probe: &[f32]) -> Result<f32, MatchError> {
    if let Some(position) = probe.iter().position(|x| !x.is_finite()) {
        return Err(MatchError::NonFiniteQuery { position });
    }
    let stored = codec::decode(stored)?;
    Ok(euclidean_distance(stored.primary(), probe)?)
}

/// Verify a probe against one stored embedding.
///
/// Compares against the first stored vector only, and returns `true` iff
/// the distance is strictly below `threshold`. Decode, dimension and
/// non-finite probe errors are returned, never folded into `false`.
pub fn is_same_identity(
    stored: &str,
    probe: &[f32],
    threshold: MatchThreshold,
) -> Result<bool, MatchError> {
    distance_to_stored(stored, probe).map(|d| threshold.accepts(d))
}

/// Identifiers of every pool entry that matches `probe`.
///
/// With a [`SampleCap`] smaller than the pool, only a random subset is
/// evaluated, so a true duplicate can be missed. Result order is
/// unspecified. The first decode or dimension error aborts the scan.
pub fn find_similar<I: Clone>(
    pool: &[Candidate<I>],
    probe: &[f32],
    threshold: MatchThreshold,
    cap: SampleCap,
) -> Result<Vec<I>, MatchError> {
    find_similar_with_rng(pool, probe, threshold, cap, &mut rand::thread_rng())
}

/// [`find_similar`] with an explicit random source for the subsample.
pub fn find_similar_with_rng<I: Clone, R: Rng + ?Sized>(
    pool: &[Candidate<I>],
    probe: &[f32],
    threshold: MatchThreshold,
    cap: SampleCap,
    rng: &mut R,
) -> Result<Vec<I>, MatchError> {
    let mut matches = Vec::new();
    for candidate in sample(pool, cap, rng) {
        if is_same_identity(&candidate.embedding, probe, threshold)? {
            matches.push(candidate.identifier.clone());
        }
    }
    Ok(matches)
}

/// Outcome of a tolerant pool scan.
#[derive(Debug, Clone)]
pub struct SimilarityScan<I> {
    /// Identifiers whose stored embedding matched the probe.
    pub matches: Vec<I>,
    /// Number of candidates actually compared (after sampling).
    pub evaluated: usize,
    /// Candidates that could not be compared, with the reason.
    pub failures: Vec<(I, MatchError)>,
}

impl<I> SimilarityScan<I> {
    pub fn is_match(&self) -> bool {
        !self.matches.is_empty()
    }
}

/// Like [`find_similar`], but keeps scanning past bad candidates and
/// reports them in [`SimilarityScan::failures`].
pub fn scan_similar<I: Clone>(
    pool: &[Candidate<I>],
    probe: &[f32],
    threshold: MatchThreshold,
    cap: SampleCap,
) -> SimilarityScan<I> {
    scan_similar_with_rng(pool, probe, threshold, cap, &mut rand::thread_rng())
}

pub fn scan_similar_with_rng<I: Clone, R: Rng + ?Sized>(
    pool: &[Candidate<I>],
    probe: &[f32],
    threshold: MatchThreshold,
    cap: SampleCap,
    rng: &mut R,
) -> SimilarityScan<I> {
    let mut scan = SimilarityScan {
        matches: Vec::new(),
        evaluated: 0,
        failures: Vec::new(),
    };

    for candidate in sample(pool, cap, rng) {
        scan.evaluated += 1;
        match is_same_identity(&candidate.embedding, probe, threshold) {
            Ok(true) => scan.matches.push(candidate.identifier.clone()),
            Ok(false) => {}
            Err(e) => scan.failures.push((candidate.identifier.clone(), e)),
        }
    }

    scan
}

fn sample<'a, T, R: Rng + ?Sized>(pool: &'a [T], cap: SampleCap, rng: &mut R) -> Vec<&'a T> {
    match cap {
        Some(n) if pool.len() > n.get() => pool.choose_multiple(rng, n.get()).collect(),
        _ => pool.iter().collect(),
    }
}

/// A decoded, enrolled embedding with its identifier.
#[derive(Debug, Clone)]
pub struct GalleryEntry<I> {
    pub identifier: I,
    pub embedding: Embedding,
}

/// Result of matching a probe embedding against a gallery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult<I> {
    pub matched: bool,
    /// Distance to the nearest entry, `None` for an empty gallery.
    pub distance: Option<f32>,
    /// Identifier of the nearest entry when it matched.
    pub identifier: Option<I>,
}

/// Strategy for comparing a probe embedding against a gallery of enrolled faces.
///
/// The probe is expected to be finite, e.g. [`Embedding::primary`] of a
/// validated embedding.
pub trait Matcher<I> {
    fn compare(
        &self,
        probe: &[f32],
        gallery: &[GalleryEntry<I>],
        threshold: MatchThreshold,
    ) -> Result<MatchResult<I>, DimensionMismatch>;
}

/// Nearest-neighbour matcher under Euclidean distance.
///
/// Always visits every gallery entry; ties keep the earliest entry.
pub struct EuclideanMatcher;

impl<I: Clone> Matcher<I> for EuclideanMatcher {
    fn compare(
        &self,
        probe: &[f32],
        gallery: &[GalleryEntry<I>],
        threshold: MatchThreshold,
    ) -> Result<MatchResult<I>, DimensionMismatch> {
        let mut best: Option<(usize, f32)> = None;

        for (i, entry) in gallery.iter().enumerate() {
            let d = euclidean_distance(entry.embedding.primary(), probe)?;
            if best.map_or(true, |(_, best_d)| d < best_d) {
                best = Some((i, d));
            }
        }

        Ok(match best {
            Some((idx, d)) if threshold.accepts(d) => MatchResult {
                matched: true,
                distance: Some(d),
                identifier: Some(gallery[idx].identifier.clone()),
            },
            _ => MatchResult {
                matched: false,
                distance: best.map(|(_, d)| d),
                identifier: None,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;
    use std::num::NonZeroUsize;

    fn threshold(t: f32) -> MatchThreshold {
        MatchThreshold::new(t).unwrap()
    }

    fn entry(id: &str, values: Vec<f32>) -> GalleryEntry<String> {
        GalleryEntry {
            identifier: id.to_string(),
            embedding: Embedding::from_vector(values).unwrap(),
        }
    }

    #[test]
    fn test_threshold_boundary() {
        let stored = "[[0.0, 0.0]]";
        // Distance is exactly 5.0.
        assert!(!is_same_identity(stored, &[3.0, 4.0], threshold(5.0)).unwrap());
        assert!(is_same_identity(stored, &[3.0, 4.0], threshold(5.001)).unwrap());
        assert!(!is_same_identity(stored, &[3.0, 4.0], threshold(4.999)).unwrap());
    }

    #[test]
    fn test_verification_scenario() {
        let stored = "[[0.0, 0.0]]";
        assert!(is_same_identity(stored, &[0.5, 0.4], threshold(0.65)).unwrap());
        assert!(!is_same_identity(stored, &[0.5, 0.5], threshold(0.65)).unwrap());
    }

    #[test]
    fn test_zero_threshold_never_matches() {
        assert!(!is_same_identity("[[1.0]]", &[1.0], threshold(0.0)).unwrap());
    }

    #[test]
    fn test_uses_first_stored_vector() {
        let stored = "[[0.0, 0.0], [10.0, 10.0]]";
        assert!(is_same_identity(stored, &[0.1, 0.1], threshold(0.5)).unwrap());
        assert!(!is_same_identity(stored, &[10.0, 10.0], threshold(0.5)).unwrap());
    }

    #[test]
    fn test_errors_are_not_masked() {
        assert!(matches!(
            is_same_identity("garbage", &[0.0], threshold(1.0)),
            Err(MatchError::Malformed(MalformedEmbedding::MissingBrackets))
        ));
        let stored = crate::codec::encode(&[vec![0.0f32; 192]]);
        assert_eq!(
            is_same_identity(&stored, &[0.0; 4], threshold(1.0)),
            Err(MatchError::DimensionMismatch(DimensionMismatch { left: 192, right: 4 }))
        );
    }

    #[test]
    fn test_non_finite_query_is_rejected() {
        let stored = "[[0.0, 0.0]]";
        assert_eq!(
            is_same_identity(stored, &[f32::NAN, 0.0], threshold(0.65)),
            Err(MatchError::NonFiniteQuery { position: 0 })
        );
        assert_eq!(
            is_same_identity(stored, &[0.0, f32::INFINITY], threshold(0.65)),
            Err(MatchError::NonFiniteQuery { position: 1 })
        );

        let pool = vec![Candidate::new("a", stored), Candidate::new("b", "[[1.0, 1.0]]")];
        let scan = scan_similar(&pool, &[0.0, f32::NAN], threshold(10.0), None);
        assert!(!scan.is_match());
        assert_eq!(scan.failures.len(), 2);
        assert!(matches!(scan.failures[0].1, MatchError::NonFiniteQuery { position: 1 }));
        assert!(find_similar(&pool, &[f32::NEG_INFINITY, 0.0], threshold(10.0), None).is_err());
    }

    #[test]
    fn test_find_similar_exhaustive() {
        let pool = vec![
            Candidate::new("near", "[[0.1, 0.0]]"),
            Candidate::new("far", "[[5.0, 5.0]]"),
            Candidate::new("also-near", "[[0.0, -0.2]]"),
        ];
        let mut found = find_similar(&pool, &[0.0, 0.0], threshold(0.65), None).unwrap();
        found.sort();
        assert_eq!(found, vec!["also-near", "near"]);
    }

    #[test]
    fn test_find_similar_empty_pool() {
        let pool: Vec<Candidate<u32>> = Vec::new();
        assert!(find_similar(&pool, &[0.0], threshold(1.0), NonZeroUsize::new(10))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_find_similar_propagates_errors() {
        let pool = vec![
            Candidate::new(1, "[[0.0, 0.0]]"),
            Candidate::new(2, "[[0.0, 0.0, 0.0]]"),
        ];
        assert!(matches!(
            find_similar(&pool, &[0.0, 0.0], threshold(1.0), None),
            Err(MatchError::DimensionMismatch(_))
        ));
    }

    #[test]
    fn test_find_similar_sampling_cap() {
        // Every candidate matches, so the result size equals the number evaluated.
        let pool: Vec<Candidate<usize>> = (0..1000).map(|i| Candidate::new(i, "[[0.0]]")).collect();
        let cap = NonZeroUsize::new(500);
        let mut rng = StdRng::seed_from_u64(42);

        let first = find_similar_with_rng(&pool, &[0.0], threshold(1.0), cap, &mut rng).unwrap();
        assert_eq!(first.len(), 500);
        let unique: HashSet<_> = first.iter().copied().collect();
        assert_eq!(unique.len(), 500);
        assert!(first.iter().all(|id| *id < 1000));

        let second = find_similar_with_rng(&pool, &[0.0], threshold(1.0), cap, &mut rng).unwrap();
        assert_eq!(second.len(), 500);
        assert_ne!(first, second);
    }

    #[test]
    fn test_find_similar_cap_larger_than_pool() {
        let pool: Vec<Candidate<usize>> = (0..10).map(|i| Candidate::new(i, "[[0.0]]")).collect();
        let found = find_similar(&pool, &[0.0], threshold(1.0), NonZeroUsize::new(500)).unwrap();
        assert_eq!(found, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_find_similar_sampled_subset_of_matches() {
        let pool: Vec<Candidate<usize>> = (0..1000)
            .map(|i| {
                let text = if i % 2 == 0 { "[[0.0]]" } else { "[[9.0]]" };
                Candidate::new(i, text)
            })
            .collect();
        let mut rng = StdRng::seed_from_u64(3);
        let found =
            find_similar_with_rng(&pool, &[0.0], threshold(1.0), NonZeroUsize::new(500), &mut rng)
                .unwrap();
        assert!(found.len() <= 500);
        assert!(found.iter().all(|id| id % 2 == 0));
    }

    #[test]
    fn test_scan_similar_collects_failures() {
        let pool = vec![
            Candidate::new("ok", "[[0.0, 0.0]]"),
            Candidate::new("corrupt", "[[0.0, oops]]"),
            Candidate::new("stale", "[[0.0]]"),
            Candidate::new("far", "[[3.0, 4.0]]"),
        ];
        let scan = scan_similar(&pool, &[0.0, 0.0], threshold(0.65), None);
        assert_eq!(scan.evaluated, 4);
        assert_eq!(scan.matches, vec!["ok"]);
        assert!(scan.is_match());
        let failed: Vec<_> = scan.failures.iter().map(|(id, _)| *id).collect();
        assert_eq!(failed, vec!["corrupt", "stale"]);
        assert!(matches!(scan.failures[0].1, MatchError::Malformed(_)));
        assert!(matches!(scan.failures[1].1, MatchError::DimensionMismatch(_)));
    }

    #[test]
    fn test_scan_similar_respects_cap() {
        let pool: Vec<Candidate<usize>> = (0..100).map(|i| Candidate::new(i, "[[0.0]]")).collect();
        let mut rng = StdRng::seed_from_u64(9);
        let scan =
            scan_similar_with_rng(&pool, &[0.0], threshold(1.0), NonZeroUsize::new(25), &mut rng);
        assert_eq!(scan.evaluated, 25);
        assert_eq!(scan.matches.len(), 25);
    }

    #[test]
    fn test_euclidean_matcher_visits_all() {
        // Best match is the last entry.
        let gallery = vec![
            entry("decoy1", vec![0.0, 1.0, 0.0]),
            entry("decoy2", vec![0.0, 0.0, 1.0]),
            entry("match", vec![1.0, 0.0, 0.0]),
        ];
        let result = EuclideanMatcher.compare(&[1.0, 0.0, 0.0], &gallery, threshold(0.5)).unwrap();
        assert!(result.matched);
        assert_eq!(result.identifier.as_deref(), Some("match"));
        assert_eq!(result.distance, Some(0.0));
    }

    #[test]
    fn test_euclidean_matcher_no_match() {
        let gallery = vec![entry("other", vec![0.0, 1.0, 0.0])];
        let result = EuclideanMatcher.compare(&[1.0, 0.0, 0.0], &gallery, threshold(0.5)).unwrap();
        assert!(!result.matched);
        assert_eq!(result.identifier, None);
        let d = result.distance.unwrap();
        assert!((d - 2.0f32.sqrt()).abs() < 1e-6);
    }

    #[test]
    fn test_euclidean_matcher_empty_gallery() {
        let result = EuclideanMatcher
            .compare(&[1.0, 0.0], &Vec::<GalleryEntry<String>>::new(), threshold(0.5))
            .unwrap();
        assert!(!result.matched);
        assert_eq!(result.distance, None);
    }

    #[test]
    fn test_euclidean_matcher_dimension_mismatch() {
        let gallery = vec![entry("a", vec![0.0, 0.0]), entry("b", vec![0.0])];
        let err = EuclideanMatcher.compare(&[0.0, 0.0], &gallery, threshold(0.5)).unwrap_err();
        assert_eq!(err, DimensionMismatch { left: 1, right: 2 });
    }

    #[test]
    fn test_euclidean_matcher_tie_keeps_first() {
        let gallery = vec![entry("first", vec![1.0, 0.0]), entry("second", vec![-1.0, 0.0])];
        let result = EuclideanMatcher.compare(&[0.0, 0.0], &gallery, threshold(2.0)).unwrap();
        assert_eq!(result.identifier.as_deref(), Some("first"));
    }
}
