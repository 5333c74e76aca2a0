//! The eager index engine: an append-only node array plus one sorted
//! permutation of node positions per dimension.
//!
//! `index[d]` orders positions ascending by `(key[d], position)`. A query
//! binary-searches each permutation for its epsilon interval, so the
//! permutations must be current before any search. Two maintenance paths
//! keep them current:
//!
//! - single inserts splice the new position into every permutation while the
//!   index is clean;
//! - bulk paths (batch insert, file load) mark the index dirty and rebuild
//!   all permutations at once, in parallel across dimensions.

use rayon::prelude::*;
use std::cmp::Ordering;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::storage::StorageError;
use crate::types::{Metadata, Node, Pos, VectorSource};

/// Errors from tree construction and mutation.
#[derive(Error, Debug)]
pub enum TreeError {
    #[error("vector dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// One item of a batch insert.
#[derive(Debug, Clone)]
pub struct BatchItem {
    pub key: Vec<f32>,
    pub value: String,
    pub metadata: Option<Metadata>,
}

impl BatchItem {
    pub fn new(key: Vec<f32>, value: impl Into<String>) -> Self {
        Self {
            key,
            value: value.into(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// An in-memory collection: nodes plus per-dimension sorted permutations.
pub struct Tree {
    dimensions: usize,
    nodes: Vec<Node>,
    index: Vec<Arc<Vec<Pos>>>,
    dirty: bool,
}

impl Tree {
    /// Create an empty tree with a fixed dimension count.
    pub fn new(dimensions: usize) -> Result<Self, TreeError> {
        if dimensions == 0 {
            return Err(TreeError::InvalidArgument(
                "dimension count must be positive".to_string(),
            ));
        }

        Ok(Self {
            dimensions,
            nodes: Vec::new(),
            index: (0..dimensions).map(|_| Arc::new(Vec::new())).collect(),
            dirty: false,
        })
    }

    /// Assemble a tree from decoded nodes. The index starts dirty and is
    /// rebuilt on first use.
    pub(crate) fn from_parts(dimensions: usize, nodes: Vec<Node>) -> Self {
        Self {
            dimensions,
            index: (0..dimensions).map(|_| Arc::new(Vec::new())).collect(),
            nodes,
            dirty: true,
        }
    }

    /// Fixed dimension count of every key.
    #[inline]
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Number of nodes.
    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the tree holds no nodes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Whether the permutations are stale.
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// The node at `pos`, if in range.
    pub fn node(&self, pos: Pos) -> Option<&Node> {
        self.nodes.get(pos as usize)
    }

    /// All nodes in insertion order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Append a node built from a key and value.
    pub fn insert(&mut self, key: Vec<f32>, value: impl Into<String>) -> Result<(), TreeError> {
        self.insert_node(Node::new(key, value))
    }

    /// Append a node built from a key, value, and metadata.
    pub fn insert_with_metadata(
        &mut self,
        key: Vec<f32>,
        value: impl Into<String>,
        metadata: Option<Metadata>,
    ) -> Result<(), TreeError> {
        self.insert_node(Node::with_metadata(key, value, metadata))
    }

    /// Append one node. While the index is clean the new position is spliced
    /// into every permutation; otherwise the index stays dirty and the next
    /// query rebuilds it.
    pub fn insert_node(&mut self, node: Node) -> Result<(), TreeError> {
        self.check_dimensions(node.key.len())?;

        let pos = self.nodes.len() as Pos;
        self.nodes.push(node);

        if self.dirty {
            return Ok(());
        }

        let nodes = &self.nodes;
        for (dim, perm) in self.index.iter_mut().enumerate() {
            let key_d = nodes[pos as usize].key[dim];
            let perm = Arc::make_mut(perm);
            // <= keeps equal keys ordered by position: the new node has the
            // largest position and lands after all its ties
            let at = perm.partition_point(|&p| nodes[p as usize].key[dim] <= key_d);
            perm.insert(at, pos);
        }

        Ok(())
    }

    /// Append many nodes at once. Every item's dimension count is validated
    /// before any mutation; on failure the tree is unchanged. On success all
    /// items are appended and the index is rebuilt exactly once.
    pub fn batch_insert(&mut self, items: Vec<BatchItem>) -> Result<(), TreeError> {
        for item in &items {
            self.check_dimensions(item.key.len())?;
        }

        let count = items.len();
        for item in items {
            self.nodes
                .push(Node::with_metadata(item.key, item.value, item.metadata));
        }

        self.dirty = true;
        self.rebuild_index();
        debug!(count, total = self.nodes.len(), "batch insert complete");
        Ok(())
    }

    /// Rebuild every permutation from scratch, in parallel across dimensions.
    pub fn rebuild_index(&mut self) {
        let nodes = &self.nodes;
        self.index = (0..self.dimensions)
            .into_par_iter()
            .map(|dim| {
                let mut perm: Vec<Pos> = (0..nodes.len() as Pos).collect();
                perm.sort_unstable_by(|&a, &b| {
                    let va = nodes[a as usize].key[dim];
                    let vb = nodes[b as usize].key[dim];
                    match va.partial_cmp(&vb) {
                        Some(Ordering::Equal) | None => a.cmp(&b),
                        Some(ord) => ord,
                    }
                });
                Arc::new(perm)
            })
            .collect();
        self.dirty = false;
    }

    /// Rebuild the index only if it is stale.
    pub fn ensure_index(&mut self) {
        if self.dirty {
            debug!(nodes = self.nodes.len(), "rebuilding stale index");
            self.rebuild_index();
        }
    }

    fn check_dimensions(&self, got: usize) -> Result<(), TreeError> {
        if got != self.dimensions {
            return Err(TreeError::DimensionMismatch {
                expected: self.dimensions,
                got,
            });
        }
        Ok(())
    }
}

impl VectorSource for Tree {
    fn node_count(&self) -> usize {
        self.nodes.len()
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    #[inline]
    fn dim_value(&self, pos: Pos, dim: usize) -> f32 {
        self.nodes[pos as usize].key[dim]
    }

    fn dim_permutation(&self, dim: usize) -> Arc<Vec<Pos>> {
        debug_assert!(!self.dirty, "permutations accessed while dirty");
        Arc::clone(&self.index[dim])
    }

    fn load_node(&self, pos: Pos) -> Result<Node, StorageError> {
        Ok(self.nodes[pos as usize].clone())
    }
}
