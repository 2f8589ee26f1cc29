//! Vector similarity helpers.

/// Cosine similarity between two vectors.
/// Returns 0.0 for mismatched, empty, or zero-magnitude vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (mut dot, mut mag_a, mut mag_b) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b.iter()) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        mag_a += x * x;
        mag_b += y * y;
    }
    let denom = mag_a.sqrt() * mag_b.sqrt();
    if denom < f64::EPSILON {
        0.0
    } else {
        (dot / denom).clamp(-1.0, 1.0)
    }
}

/// Dot product, 0.0 on mismatched lengths.
pub fn dot_product(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() {
        return 0.0;
    }
    a.iter().zip(b).map(|(x, y)| *x as f64 * *y as f64).sum()
}

/// Euclidean distance, infinite on mismatched lengths.
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() {
        return f64::INFINITY;
    }
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = *x as f64 - *y as f64;
            d * d
        })
        .sum::<f64>()
        .sqrt()
}

/// L2-normalized mean of `vectors`.
///
/// `None` when there are no vectors, their dimensions disagree, or the mean is
/// the zero vector.
pub fn normalized_centroid<'a, I>(vectors: I) -> Option<Vec<f32>>
where
    I: IntoIterator<Item = &'a [f32]>,
{
    let mut sum: Vec<f64> = Vec::new();
    let mut count = 0usize;
    for vector in vectors {
        if count == 0 {
            sum = vec![0.0; vector.len()];
        } else if vector.len() != sum.len() {
            return None;
        }
        for (acc, v) in sum.iter_mut().zip(vector) {
            *acc += *v as f64;
        }
        count += 1;
    }
    if count == 0 || sum.is_empty() {
        return None;
    }

    let norm = sum.iter().map(|v| v * v).sum::<f64>().sqrt();
    if norm < f64::EPSILON {
        return None;
    }
    Some(sum.iter().map(|v| (v / norm) as f32).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_vectors_have_similarity_one() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn orthogonal_vectors_have_similarity_zero() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-9);
    }

    #[test]
    fn mismatched_lengths_return_zero() {
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn centroid_is_unit_length() {
        let a = [1.0f32, 0.0];
        let b = [0.0f32, 1.0];
        let c = normalized_centroid([&a[..], &b[..]]).unwrap();
        let norm: f32 = c.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
        assert!((c[0] - c[1]).abs() < 1e-6);
    }

    #[test]
    fn centroid_rejects_degenerate_input() {
        assert!(normalized_centroid(std::iter::empty::<&[f32]>()).is_none());
        let a = [1.0f32, 0.0];
        let b = [-1.0f32, 0.0];
        assert!(normalized_centroid([&a[..], &b[..]]).is_none());
        let c = [1.0f32];
        assert!(normalized_centroid([&a[..], &c[..]]).is_none());
    }

    #[test]
    fn euclidean_and_dot() {
        assert!((euclidean_distance(&[0.0, 3.0], &[4.0, 0.0]) - 5.0).abs() < 1e-9);
        assert!((dot_product(&[1.0, 2.0], &[3.0, 4.0]) - 11.0).abs() < 1e-9);
    }
}
