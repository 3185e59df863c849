//! facematch-core: embedding codec, distance and identity decisions.
//!
//! Everything here is a pure function over its inputs: no I/O, no logging,
//! no shared state. Embeddings come from an external recognition model and
//! are stored as canonical text (see [`codec`]).

pub mod blob;
pub mod codec;
pub mod distance;
pub mod matcher;
pub mod types;

pub use codec::{decode, encode, MalformedEmbedding};
pub use distance::{euclidean_distance, DimensionMismatch};
pub use matcher::{
    distance_to_stored, find_similar, is_same_identity, scan_similar, EuclideanMatcher,
    GalleryEntry, MatchError, MatchResult, Matcher, SimilarityScan,
};
pub use types::{Candidate, Embedding, InvalidThreshold, MatchThreshold, SampleCap};
