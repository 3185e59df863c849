//! Canonical text form of an embedding.
//!
//! Stored embeddings are a bracketed list of bracketed, comma-separated
//! float literals: `[[0.123, -0.456, 7.0E-4]]`. Encoding uses the shortest
//! representation that parses back to the same `f32`, so a decode of an
//! encode reproduces identical bits and identical distances.
//!
//! The decoder also accepts text written by older clients: `E`/`e`
//! exponents, a leading `+`, and any whitespace around tokens.

use crate::types::Embedding;
use std::fmt::Write;
use thiserror::Error;

const SEPARATOR: &str = ", ";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MalformedEmbedding {
    #[error("embedding text is not a bracketed list of bracketed vectors")]
    MissingBrackets,
    #[error("embedding contains no vectors")]
    Empty,
    #[error("vector {vector} is empty")]
    EmptyVector { vector: usize },
    #[error("vector {vector}, position {position}: {token:?} is not a number")]
    InvalidNumber {
        vector: usize,
        position: usize,
        token: String,
    },
    #[error("vector {vector}, position {position}: value is not finite")]
    NonFinite { vector: usize, position: usize },
    #[error("vector {vector} has {found} values, expected {expected}")]
    Ragged {
        vector: usize,
        expected: usize,
        found: usize,
    },
    #[error("binary embedding: {0}")]
    InvalidBlob(String),
}

/// Render vectors in canonical text form.
///
/// Deterministic: equal input always yields byte-identical output.
pub fn encode<V: AsRef<[f32]>>(vectors: &[V]) -> String {
    let mut out = String::with_capacity(2 + vectors.len() * 16);
    out.push('[');
    for (i, v) in vectors.iter().enumerate() {
        if i > 0 {
            out.push_str(SEPARATOR);
        }
        out.push('[');
        for (j, x) in v.as_ref().iter().enumerate() {
            if j > 0 {
                out.push_str(SEPARATOR);
            }
            // Writing into a String cannot fail.
            let _ = write!(out, "{x:?}");
        }
        out.push(']');
    }
    out.push(']');
    out
}

/// Parse canonical text back into an [`Embedding`].
///
/// Every inner vector is preserved; callers pick [`Embedding::primary`]
/// for comparison.
pub fn decode(text: &str) -> Result<Embedding, MalformedEmbedding> {
    let body = text
        .trim()
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .ok_or(MalformedEmbedding::MissingBrackets)?;

    let mut rest = body.trim();
    if rest.is_empty() {
        return Err(MalformedEmbedding::Empty);
    }

    let mut vectors = Vec::new();
    loop {
        let open = rest
            .strip_prefix('[')
            .ok_or(MalformedEmbedding::MissingBrackets)?;
        let close = open.find(']').ok_or(MalformedEmbedding::MissingBrackets)?;
        let inner = &open[..close];
        if inner.contains('[') {
            return Err(MalformedEmbedding::MissingBrackets);
        }
        vectors.push(parse_vector(inner, vectors.len())?);

        rest = open[close + 1..].trim_start();
        if rest.is_empty() {
            break;
        }
        rest = rest
            .strip_prefix(',')
            .ok_or(MalformedEmbedding::MissingBrackets)?
            .trim_start();
    }

    Embedding::new(vectors)
}

fn parse_vector(inner: &str, vector: usize) -> Result<Vec<f32>, MalformedEmbedding> {
    if inner.trim().is_empty() {
        return Err(MalformedEmbedding::EmptyVector { vector });
    }

    inner
        .split(',')
        .enumerate()
        .map(|(position, raw)| {
            let token = raw.trim();
            let value: f32 = token.parse().map_err(|_| MalformedEmbedding::InvalidNumber {
                vector,
                position,
                token: token.to_string(),
            })?;
            if value.is_finite() {
                Ok(value)
            } else {
                Err(MalformedEmbedding::NonFinite { vector, position })
            }
        })
        .collect()
}
