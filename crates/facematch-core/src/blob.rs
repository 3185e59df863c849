//! Fixed-width binary form of an embedding, the target of the one-time
//! migration away from text storage.
//!
//! Layout, all little-endian: `u32` vector count, `u32` dimension, then
//! `count * dim` `f32` values in row order.

use crate::codec::MalformedEmbedding;
use crate::types::Embedding;

const HEADER_LEN: usize = 8;

/// Pack `embedding` into the binary layout.
///
/// Fails with [`MalformedEmbedding::InvalidBlob`] when the vector count or
/// dimension does not fit the `u32` header fields.
pub fn to_blob(embedding: &Embedding) -> Result<Vec<u8>, MalformedEmbedding> {
    let count = embedding.vectors().len();
    let dim = embedding.dim();
    let mut out = Vec::with_capacity(HEADER_LEN + count * dim * 4);
    out.extend_from_slice(&header(count, dim)?);
    for v in embedding.vectors() {
        for x in v {
            out.extend_from_slice(&x.to_le_bytes());
        }
    }
    Ok(out)
}

fn header(count: usize, dim: usize) -> Result<[u8; HEADER_LEN], MalformedEmbedding> {
    let too_large = |field: &str, n: usize| {
        MalformedEmbedding::InvalidBlob(format!("{field} {n} exceeds the u32 header range"))
    };
    let count = u32::try_from(count).map_err(|_| too_large("vector count", count))?;
    let dim = u32::try_from(dim).map_err(|_| too_large("dimension", dim))?;

    let mut out = [0u8; HEADER_LEN];
    out[0..4].copy_from_slice(&count.to_le_bytes());
    out[4..8].copy_from_slice(&dim.to_le_bytes());
    Ok(out)
}

pub fn from_blob(bytes: &[u8]) -> Result<Embedding, MalformedEmbedding> {
    if bytes.len() < HEADER_LEN {
        return Err(MalformedEmbedding::InvalidBlob(format!(
            "header needs {HEADER_LEN} bytes, got {}",
            bytes.len()
        )));
    }

    let count = read_u32(&bytes[0..4]) as usize;
    let dim = read_u32(&bytes[4..8]) as usize;
    // Shape is checked before anything is sized from the header.
    if count == 0 {
        return Err(MalformedEmbedding::Empty);
    }
    if dim == 0 {
        return Err(MalformedEmbedding::EmptyVector { vector: 0 });
    }

    let expected = count
        .checked_mul(dim)
        .and_then(|n| n.checked_mul(4))
        .and_then(|n| n.checked_add(HEADER_LEN))
        .ok_or_else(|| MalformedEmbedding::InvalidBlob(format!("{count}x{dim} overflows")))?;

    if bytes.len() != expected {
        return Err(MalformedEmbedding::InvalidBlob(format!(
            "{count}x{dim} needs {expected} bytes, got {}",
            bytes.len()
        )));
    }

    let values: Vec<f32> = bytes[HEADER_LEN..]
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    Embedding::new(values.chunks(dim).map(<[f32]>::to_vec).collect())
}

fn read_u32(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}
