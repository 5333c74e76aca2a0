//! Scalar quantization of f32 vectors to 8-bit integers.
//!
//! Each vector is quantized independently against its own `[min, max]` range:
//!
//! 1. `scale = 255 / (max - min)`
//! 2. `q[i] = round((v[i] - min) * scale)`, clamped to `[0, 255]`
//!
//! This shrinks stored keys roughly 4x and supports a cheap approximate
//! distance directly in quantized space. Exact search always dequantizes.

use thiserror::Error;

/// Errors from combining quantized vectors.
#[derive(Error, Debug)]
pub enum QuantizationError {
    #[error("quantized vector dimension mismatch: {0} vs {1}")]
    DimensionMismatch(usize, usize),
}

/// A vector compressed to one byte per dimension with a per-vector range.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedVector {
    /// Quantized components.
    pub values: Vec<u8>,
    /// Minimum of the original vector.
    pub min: f32,
    /// Maximum of the original vector.
    pub max: f32,
}

impl QuantizedVector {
    /// Quantize a vector. A constant vector (max == min) quantizes to all
    /// zero bytes and dequantizes back to the constant.
    pub fn quantize(vector: &[f32]) -> Self {
        let mut min = f32::INFINITY;
        let mut max = f32::NEG_INFINITY;
        for &v in vector {
            min = min.min(v);
            max = max.max(v);
        }

        if vector.is_empty() {
            return Self {
                values: Vec::new(),
                min: 0.0,
                max: 0.0,
            };
        }

        if max == min {
            return Self {
                values: vec![0u8; vector.len()],
                min,
                max,
            };
        }

        let scale = 255.0 / (max - min);
        let values = vector
            .iter()
            .map(|&v| ((v - min) * scale).round().clamp(0.0, 255.0) as u8)
            .collect();

        Self { values, min, max }
    }

    /// Reconstruct the f32 vector: `v[i] = min + q[i] * (max - min) / 255`.
    pub fn dequantize(&self) -> Vec<f32> {
        let scale = (self.max - self.min) / 255.0;
        self.values
            .iter()
            .map(|&q| self.min + q as f32 * scale)
            .collect()
    }

    /// Dimension count.
    #[inline]
    pub fn dimensions(&self) -> usize {
        self.values.len()
    }

    /// Approximate Euclidean distance computed in quantized space.
    ///
    /// The two vectors may have different ranges; their scales are averaged,
    /// which makes this an approximation. Use dequantized vectors when exact
    /// distances are required.
    pub fn approximate_distance(&self, other: &Self) -> Result<f32, QuantizationError> {
        if self.dimensions() != other.dimensions() {
            return Err(QuantizationError::DimensionMismatch(
                self.dimensions(),
                other.dimensions(),
            ));
        }

        let mut sum: u64 = 0;
        for (&a, &b) in self.values.iter().zip(other.values.iter()) {
            let diff = a as i32 - b as i32;
            sum += (diff * diff) as u64;
        }

        let s1 = (self.max - self.min) / 255.0;
        let s2 = (other.max - other.min) / 255.0;
        let scale = (s1 + s2) / 2.0;

        Ok((sum as f32).sqrt() * scale)
    }

    /// Serialized size of the key block: one byte per dimension plus the
    /// two-f32 range.
    #[inline]
    pub fn size_bytes(&self) -> usize {
        self.values.len() + 8
    }
}

/// Root-mean-square reconstruction error of a quantized vector.
pub fn quantization_error(original: &[f32], quantized: &QuantizedVector) -> f32 {
    debug_assert_eq!(original.len(), quantized.dimensions());
    if original.is_empty() {
        return 0.0;
    }

    let reconstructed = quantized.dequantize();
    let sum_sq: f32 = original
        .iter()
        .zip(reconstructed.iter())
        .map(|(&a, &b)| {
            let d = a - b;
            d * d
        })
        .sum();

    (sum_sq / original.len() as f32).sqrt()
}
