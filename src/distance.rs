//! Distance computations for the refinement stage.

/// Squared Euclidean distance between two equal-length vectors.
#[inline]
pub fn l2_squared(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

/// Euclidean distance between two equal-length vectors.
#[inline]
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    l2_squared(a, b).sqrt()
}

/// The admissible distance for refinement: `epsilon * sqrt(D) * (1 - threshold)`.
///
/// `epsilon` bounds each dimension independently during candidate discovery,
/// so the worst-case true distance of a candidate is `epsilon * sqrt(D)`.
/// `threshold` in `[0, 1]` tightens that bound; at 1 only exact hits remain.
#[inline]
pub fn admissible_distance(epsilon: f32, dimensions: usize, threshold: f32) -> f32 {
    epsilon * (dimensions as f32).sqrt() * (1.0 - threshold)
}
