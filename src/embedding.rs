//! The embedding-provider seam.
//!
//! The index never turns text into vectors itself; front ends hand it vectors
//! produced by some model server (local or remote). This trait is the only
//! contract between the two sides. Provider failures are surfaced to the
//! caller untranslated.

/// A source of text embeddings.
pub trait EmbeddingProvider {
    /// The provider's own error type (network failure, unsupported model, ...).
    type Error: std::error::Error + Send + Sync + 'static;

    /// Embed one text into a vector. The provider determines the dimension
    /// count; callers are responsible for matching it to their collection.
    fn embed(&self, text: &str) -> Result<Vec<f32>, Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    /// Deterministic toy provider: hashes bytes into a fixed-width vector.
    struct ToyProvider {
        dimensions: usize,
    }

    impl EmbeddingProvider for ToyProvider {
        type Error = Infallible;

        fn embed(&self, text: &str) -> Result<Vec<f32>, Infallible> {
            let mut out = vec![0.0f32; self.dimensions];
            for (i, b) in text.bytes().enumerate() {
                out[i % self.dimensions] += b as f32 / 255.0;
            }
            Ok(out)
        }
    }

    #[test]
    fn test_provider_produces_fixed_width() {
        let provider = ToyProvider { dimensions: 8 };
        let v = provider.embed("hello world").unwrap();
        assert_eq!(v.len(), 8);
    }

    #[test]
    fn test_provider_is_deterministic() {
        let provider = ToyProvider { dimensions: 4 };
        assert_eq!(
            provider.embed("same text").unwrap(),
            provider.embed("same text").unwrap()
        );
    }
}
