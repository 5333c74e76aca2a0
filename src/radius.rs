//! Semantic-radius vocabulary: human-friendly words for the per-dimension
//! search radius. Consumed by front ends so users can ask for "similar" or
//! "fuzzy" matches without tuning epsilon by hand.

/// The fixed word-to-epsilon table, tightest first.
pub const SEMANTIC_RADII: [(&str, f32); 6] = [
    ("exact", 0.10),
    ("precise", 0.15),
    ("similar", 0.25),
    ("related", 0.35),
    ("broad", 0.45),
    ("fuzzy", 0.60),
];

/// Look up the epsilon for a radius word. Matching is case-insensitive.
pub fn semantic_radius(word: &str) -> Option<f32> {
    let lower = word.to_ascii_lowercase();
    SEMANTIC_RADII
        .iter()
        .find(|(name, _)| *name == lower)
        .map(|&(_, eps)| eps)
}

/// Look up a radius word, falling back to `default` for unknown words.
pub fn radius_or_default(word: &str, default: f32) -> f32 {
    semantic_radius(word).unwrap_or(default)
}
