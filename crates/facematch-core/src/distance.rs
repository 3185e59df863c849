use thiserror::Error;

/// Two vectors being compared have different lengths, typically an
/// embedding stored by a different model version.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("embedding dimension mismatch: {left} vs {right}")]
pub struct DimensionMismatch {
    pub left: usize,
    pub right: usize,
}

/// Euclidean distance between two equal-length vectors.
///
/// Squared differences are summed left to right in `f32` and the root is
/// taken in `f64`, so repeated calls on the same input give the same value.
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> Result<f32, DimensionMismatch> {
    if a.len() != b.len() {
        return Err(DimensionMismatch {
            left: a.len(),
            right: b.len(),
        });
    }

    let sum = a
        .iter()
        .zip(b)
        .fold(0.0f32, |acc, (x, y)| {
            let d = x - y;
            acc + d * d
        });

    Ok(f64::from(sum).sqrt() as f32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_three_four_five() {
        assert_eq!(euclidean_distance(&[0.0, 0.0, 0.0], &[3.0, 4.0, 0.0]), Ok(5.0));
    }

    #[test]
    fn test_identity_is_zero() {
        let a = [0.3, -1.2, 7.5, 0.0];
        assert_eq!(euclidean_distance(&a, &a), Ok(0.0));
    }

    #[test]
    fn test_symmetric_and_non_negative() {
        let a = [0.12, -0.98, 0.33, 0.5];
        let b = [-0.4, 0.25, 0.1, 0.5];
        let ab = euclidean_distance(&a, &b).unwrap();
        let ba = euclidean_distance(&b, &a).unwrap();
        assert_eq!(ab, ba);
        assert!(ab >= 0.0);
    }

    #[test]
    fn test_dimension_mismatch() {
        let long = vec![0.0f32; 192];
        let short = vec![0.0f32; 4];
        assert_eq!(
            euclidean_distance(&long, &short),
            Err(DimensionMismatch { left: 192, right: 4 })
        );
        assert_eq!(
            euclidean_distance(&short, &long),
            Err(DimensionMismatch { left: 4, right: 192 })
        );
    }

    #[test]
    fn test_empty_vectors() {
        assert_eq!(euclidean_distance(&[], &[]), Ok(0.0));
    }

    #[test]
    fn test_deterministic() {
        let a: Vec<f32> = (0..192).map(|i| (i as f32 * 0.37).sin()).collect();
        let b: Vec<f32> = (0..192).map(|i| (i as f32 * 0.11).cos()).collect();
        let first = euclidean_distance(&a, &b).unwrap();
        for _ in 0..10 {
            assert_eq!(euclidean_distance(&a, &b).unwrap().to_bits(), first.to_bits());
        }
    }
}
