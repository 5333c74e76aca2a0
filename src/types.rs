//! Core data types shared across the crate.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::storage::StorageError;

/// Node position inside a collection. Positions are assigned in insertion
/// order and are the node's stable identity.
pub type Pos = u32;

/// Node metadata: short string keys mapped to JSON-shaped values.
///
/// A `BTreeMap` keeps the serialized form deterministic, which in turn keeps
/// container files byte-for-byte reproducible for identical contents.
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// A single entry in a collection. Immutable once inserted.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    /// The vector key. Its length equals the collection's dimension count.
    pub key: Vec<f32>,
    /// The stored payload (UTF-8 text).
    pub value: String,
    /// Creation instant. Wall-clock; monotonicity is not required.
    pub timestamp: DateTime<Utc>,
    /// Optional metadata. `None` is equivalent to an empty mapping.
    pub metadata: Option<Metadata>,
}

impl Node {
    /// Create a node stamped with the current time.
    pub fn new(key: Vec<f32>, value: impl Into<String>) -> Self {
        Self::with_metadata(key, value, None)
    }

    /// Create a node with metadata, stamped with the current time.
    pub fn with_metadata(
        key: Vec<f32>,
        value: impl Into<String>,
        metadata: Option<Metadata>,
    ) -> Self {
        Self {
            key,
            value: value.into(),
            timestamp: Utc::now(),
            metadata,
        }
    }
}

/// The seam between the query engine and a vector representation.
///
/// Both the eager [`Tree`](crate::tree::Tree) and the lazy
/// [`MmapStorage`](crate::storage::MmapStorage) implement this, so the search
/// path is written once. Callers must ensure permutations are current before
/// querying; `dim_permutation` does not rebuild.
pub trait VectorSource: Sync {
    /// Number of nodes.
    fn node_count(&self) -> usize;

    /// Fixed dimension count of every key.
    fn dimensions(&self) -> usize;

    /// The value of one dimension of one node's key.
    fn dim_value(&self, pos: Pos, dim: usize) -> f32;

    /// The permutation of node positions sorted ascending by
    /// `(key[dim], position)`.
    fn dim_permutation(&self, dim: usize) -> Arc<Vec<Pos>>;

    /// Materialize the full node at `pos`.
    fn load_node(&self, pos: Pos) -> Result<Node, StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_node_new_has_empty_metadata() {
        let node = Node::new(vec![0.1, 0.2], "hello");
        assert_eq!(node.key, vec![0.1, 0.2]);
        assert_eq!(node.value, "hello");
        assert!(node.metadata.is_none());
    }

    #[test]
    fn test_node_with_metadata() {
        let mut meta = Metadata::new();
        meta.insert("category".to_string(), json!("note"));
        let node = Node::with_metadata(vec![1.0], "x", Some(meta));
        assert_eq!(
            node.metadata.as_ref().unwrap().get("category"),
            Some(&json!("note"))
        );
    }

    #[test]
    fn test_metadata_serialization_is_deterministic() {
        let mut a = Metadata::new();
        a.insert("z".to_string(), json!(1));
        a.insert("a".to_string(), json!(2));

        let mut b = Metadata::new();
        b.insert("a".to_string(), json!(2));
        b.insert("z".to_string(), json!(1));

        assert_eq!(
            serde_json::to_vec(&a).unwrap(),
            serde_json::to_vec(&b).unwrap()
        );
    }
}
