use crate::codec::{self, MalformedEmbedding};
use crate::distance::DimensionMismatch;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroUsize;
use std::str::FromStr;
use thiserror::Error;

/// Face embedding: one or more equal-length vectors produced by the
/// recognition model (typically a single 192-dimensional vector).
///
/// Only the first vector takes part in comparisons; see [`Embedding::primary`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Vec<f32>>", into = "Vec<Vec<f32>>")]
pub struct Embedding {
    vectors: Vec<Vec<f32>>,
}

impl Embedding {
    /// Build an embedding from raw model output.
    ///
    /// Rejects an empty structure, empty inner vectors, inner vectors of
    /// differing lengths, and non-finite values.
    pub fn new(vectors: Vec<Vec<f32>>) -> Result<Self, MalformedEmbedding> {
        let first_len = match vectors.first() {
            Some(v) => v.len(),
            None => return Err(MalformedEmbedding::Empty),
        };

        for (i, v) in vectors.iter().enumerate() {
            if v.is_empty() {
                return Err(MalformedEmbedding::EmptyVector { vector: i });
            }
            if v.len() != first_len {
                return Err(MalformedEmbedding::Ragged {
                    vector: i,
                    expected: first_len,
                    found: v.len(),
                });
            }
            if let Some(pos) = v.iter().position(|x| !x.is_finite()) {
                return Err(MalformedEmbedding::NonFinite {
                    vector: i,
                    position: pos,
                });
            }
        }

        Ok(Self { vectors })
    }

    /// Convenience constructor for the common single-vector case.
    pub fn from_vector(values: Vec<f32>) -> Result<Self, MalformedEmbedding> {
        Self::new(vec![values])
    }

    /// The vector used for identity comparison (always the first one).
    pub fn primary(&self) -> &[f32] {
        // Non-empty by construction.
        &self.vectors[0]
    }

    /// All stored vectors, in order.
    pub fn vectors(&self) -> &[Vec<f32>] {
        &self.vectors
    }

    /// Length shared by every inner vector.
    pub fn dim(&self) -> usize {
        self.primary().len()
    }

    /// Fail with [`DimensionMismatch`] unless the embedding has `expected` dimensions.
    pub fn expect_dim(&self, expected: usize) -> Result<(), DimensionMismatch> {
        if self.dim() == expected {
            Ok(())
        } else {
            Err(DimensionMismatch {
                left: self.dim(),
                right: expected,
            })
        }
    }

    pub fn into_vectors(self) -> Vec<Vec<f32>> {
        self.vectors
    }
}

impl fmt::Display for Embedding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&codec::encode(&self.vectors))
    }
}

impl FromStr for Embedding {
    type Err = MalformedEmbedding;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        codec::decode(s)
    }
}

impl TryFrom<Vec<Vec<f32>>> for Embedding {
    type Error = MalformedEmbedding;

    fn try_from(vectors: Vec<Vec<f32>>) -> Result<Self, Self::Error> {
        Self::new(vectors)
    }
}

impl From<Embedding> for Vec<Vec<f32>> {
    fn from(e: Embedding) -> Self {
        e.vectors
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq)]
#[error("match threshold must be a finite, non-negative distance, got {0}")]
pub struct InvalidThreshold(pub f32);

/// Maximum Euclidean distance at which two embeddings count as the same
/// identity. Comparisons are strict: a distance equal to the threshold is
/// a non-match.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize)]
pub struct MatchThreshold(f32);

impl MatchThreshold {
    pub fn new(value: f32) -> Result<Self, InvalidThreshold> {
        if value.is_finite() && value >= 0.0 {
            Ok(Self(value))
        } else {
            Err(InvalidThreshold(value))
        }
    }

    pub fn get(self) -> f32 {
        self.0
    }

    /// `true` when `distance` falls strictly below the threshold.
    pub fn accepts(self, distance: f32) -> bool {
        distance < self.0
    }
}

impl TryFrom<f32> for MatchThreshold {
    type Error = InvalidThreshold;

    fn try_from(value: f32) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl fmt::Display for MatchThreshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Upper bound on how many pool entries a similarity scan evaluates.
///
/// `None` scans the whole pool. `Some(n)` scans a random subset of `n`
/// entries when the pool is larger than `n`, trading recall for latency:
/// a scan under a cap is not exhaustive and can miss a true duplicate.
pub type SampleCap = Option<NonZeroUsize>;

/// One entry of a candidate pool: an identifier plus its stored embedding text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate<I> {
    pub identifier: I,
    pub embedding: String,
}

impl<I> Candidate<I> {
    pub fn new(identifier: I, embedding: impl Into<String>) -> Self {
        Self {
            identifier,
            embedding: embedding.into(),
        }
    }
}
