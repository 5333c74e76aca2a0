//! The collection facade: one tree plus its storage handle.
//!
//! This is the API the front ends use. It enforces the dimension contract,
//! keeps the index current across mutations, and owns the flush policy:
//! appends accumulate in memory and hit disk every [`AUTO_FLUSH_INTERVAL`]
//! inserts, after every batch, or on an explicit [`Collection::flush`].
//!
//! Single-writer invariant: all mutating methods take `&mut self`, so the
//! borrow checker rules out two concurrent writers. Searches take `&self`
//! and may run concurrently; the interior lock exists only so a search can
//! briefly become a writer when it finds the index stale.

use parking_lot::{RwLock, RwLockWriteGuard};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::quantization::{quantization_error, QuantizedVector};
use crate::query::{self, QueryError, SearchFilter, SearchMatch, SearchParams};
use crate::storage::{FileStorage, StorageError};
use crate::tree::{BatchItem, Tree, TreeError};
use crate::types::Metadata;

/// Appends between automatic flushes.
pub const AUTO_FLUSH_INTERVAL: usize = 100;

/// Errors surfaced by the facade.
#[derive(Error, Debug)]
pub enum CollectionError {
    #[error(transparent)]
    Tree(#[from] TreeError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Compression effectiveness over a collection's current contents.
#[derive(Debug, Clone)]
pub struct CompressionStats {
    pub nodes: usize,
    pub original_bytes: u64,
    pub compressed_bytes: u64,
    pub ratio: f64,
    pub mean_quantization_error: f32,
}

/// An embedded vector collection backed by a single container file.
pub struct Collection {
    tree: RwLock<Tree>,
    storage: FileStorage,
    pending_appends: usize,
}

impl Collection {
    /// Open a collection, creating it if the file is absent or empty.
    ///
    /// When the file exists its header supplies the dimension count; a
    /// non-zero `dimensions` that disagrees with it is a `DimensionMismatch`.
    /// For a new collection `dimensions` must be positive.
    pub fn open(path: impl Into<PathBuf>, dimensions: usize) -> Result<Self, CollectionError> {
        let path = path.into();
        let storage = FileStorage::new(&path);

        let exists = fs::metadata(&path).map(|m| m.len() > 0).unwrap_or(false);
        let tree = if exists {
            let tree = storage.load()?;
            if dimensions != 0 && tree.dimensions() != dimensions {
                return Err(TreeError::DimensionMismatch {
                    expected: dimensions,
                    got: tree.dimensions(),
                }
                .into());
            }
            tree
        } else {
            Tree::new(dimensions)?
        };

        info!(
            path = %path.display(),
            nodes = tree.len(),
            dimensions = tree.dimensions(),
            "collection opened"
        );

        Ok(Self {
            tree: RwLock::new(tree),
            storage,
            pending_appends: 0,
        })
    }

    /// Switch subsequent flushes to the scalar-quantized container variant.
    pub fn with_compression(mut self, compress: bool) -> Self {
        self.storage = self.storage.clone().with_compression(compress);
        self
    }

    /// The container path.
    pub fn path(&self) -> &Path {
        self.storage.path()
    }

    /// Fixed dimension count of every key.
    pub fn dimensions(&self) -> usize {
        self.tree.read().dimensions()
    }

    /// Number of nodes.
    pub fn node_count(&self) -> usize {
        self.tree.read().len()
    }

    /// Append one node.
    pub fn insert(
        &mut self,
        key: Vec<f32>,
        value: impl Into<String>,
    ) -> Result<(), CollectionError> {
        self.insert_with_metadata(key, value, None)
    }

    /// Append one node with metadata.
    pub fn insert_with_metadata(
        &mut self,
        key: Vec<f32>,
        value: impl Into<String>,
        metadata: Option<Metadata>,
    ) -> Result<(), CollectionError> {
        self.tree.get_mut().insert_with_metadata(key, value, metadata)?;
        self.pending_appends += 1;

        if self.pending_appends >= AUTO_FLUSH_INTERVAL {
            debug!(pending = self.pending_appends, "auto-flush");
            self.flush()?;
        }
        Ok(())
    }

    /// Append many nodes. Every item is validated before any mutation; on
    /// failure the collection is unchanged. The index is rebuilt once and
    /// the result is flushed.
    pub fn batch_insert(&mut self, items: Vec<BatchItem>) -> Result<(), CollectionError> {
        self.tree.get_mut().batch_insert(items)?;
        self.flush()?;
        Ok(())
    }

    /// Search, returning stored values ordered by distance.
    pub fn search(
        &self,
        key: &[f32],
        epsilon: f32,
        threshold: f32,
        top_k: usize,
    ) -> Result<Vec<String>, CollectionError> {
        Ok(self
            .search_nodes(key, &SearchParams::new(epsilon, threshold, top_k), None)?
            .into_iter()
            .map(|m| m.node.value)
            .collect())
    }

    /// Search with a metadata/time filter, returning stored values.
    pub fn search_with_filter(
        &self,
        key: &[f32],
        epsilon: f32,
        threshold: f32,
        top_k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<String>, CollectionError> {
        Ok(self
            .search_nodes(key, &SearchParams::new(epsilon, threshold, top_k), Some(filter))?
            .into_iter()
            .map(|m| m.node.value)
            .collect())
    }

    /// Search, returning full matches with positions and distances.
    ///
    /// Rebuilds the index first when it is stale.
    pub fn search_nodes(
        &self,
        key: &[f32],
        params: &SearchParams,
        filter: Option<&SearchFilter>,
    ) -> Result<Vec<SearchMatch>, CollectionError> {
        let tree = self.tree.read();
        if !tree.is_dirty() {
            return Ok(query::execute(&*tree, key, params, filter)?);
        }
        drop(tree);

        let mut tree = self.tree.write();
        tree.ensure_index();
        let tree = RwLockWriteGuard::downgrade(tree);
        Ok(query::execute(&*tree, key, params, filter)?)
    }

    /// Write the current state to disk. The container is replaced
    /// atomically; on error the in-memory state is untouched.
    pub fn flush(&mut self) -> Result<(), CollectionError> {
        self.storage.save(self.tree.get_mut())?;
        self.pending_appends = 0;
        Ok(())
    }

    /// Analyze how well scalar quantization would compress this collection.
    pub fn compression_stats(&self) -> CompressionStats {
        let tree = self.tree.read();

        let mut original_bytes = 0u64;
        let mut compressed_bytes = 0u64;
        let mut total_error = 0.0f32;

        for node in tree.nodes() {
            let qv = QuantizedVector::quantize(&node.key);
            original_bytes += (node.key.len() * 4 + node.value.len()) as u64;
            compressed_bytes += (qv.size_bytes() + node.value.len()) as u64;
            total_error += quantization_error(&node.key, &qv);
        }

        let nodes = tree.len();
        CompressionStats {
            nodes,
            original_bytes,
            compressed_bytes,
            ratio: if compressed_bytes > 0 {
                original_bytes as f64 / compressed_bytes as f64
            } else {
                0.0
            },
            mean_quantization_error: if nodes > 0 {
                total_error / nodes as f32
            } else {
                0.0
            },
        }
    }
}

impl Drop for Collection {
    fn drop(&mut self) {
        if self.pending_appends > 0 {
            if let Err(e) = self.flush() {
                warn!(error = %e, "flush on drop failed; recent appends not persisted");
            }
        }
    }
}
