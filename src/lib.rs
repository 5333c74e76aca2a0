//! Engram - an embedded, file-backed exact nearest-neighbor vector index.
//!
//! Engram serves agent-memory and embedded-search workloads that need
//! deterministic exact recall at sub-millisecond to low-millisecond latency,
//! with one file per collection, near-instant cold start, and no server
//! components.
//!
//! # How search works
//!
//! Every collection keeps one sorted permutation of node positions per
//! dimension. A query with radius `epsilon` binary-searches each permutation
//! for its epsilon interval, intersects the per-dimension hits, then refines
//! the survivors by true Euclidean distance against the bound
//! `epsilon * sqrt(D) * (1 - threshold)`. Dimension scans run as a rayon
//! fork-join; results are deterministic regardless of scheduling.
//!
//! # Persistence
//!
//! A collection is a single little-endian container file holding framed node
//! records, in an uncompressed or scalar-quantized variant. Flushes assemble
//! a temporary file and rename it into place. [`MmapStorage`] opens a
//! container read-only in time proportional to the node count and builds
//! per-dimension indices lazily on first use.
//!
//! # Example
//!
//! ```rust
//! use engram::prelude::*;
//!
//! let dir = tempfile::tempdir().unwrap();
//! let mut collection = Collection::open(dir.path().join("memory.bin"), 3).unwrap();
//!
//! collection.insert(vec![0.1, 0.2, 0.3], "first note").unwrap();
//! collection.insert(vec![0.1, 0.3, 0.2], "second note").unwrap();
//! collection.flush().unwrap();
//!
//! let hits = collection.search(&[0.1, 0.25, 0.25], 0.2, 0.5, 2).unwrap();
//! assert_eq!(hits[0], "first note");
//! ```
//!
//! # Filtered search
//!
//! ```rust
//! use engram::prelude::*;
//! use serde_json::json;
//!
//! let dir = tempfile::tempdir().unwrap();
//! let mut collection = Collection::open(dir.path().join("memory.bin"), 2).unwrap();
//!
//! let meta = Metadata::from([("channel".to_string(), json!("support"))]);
//! collection
//!     .insert_with_metadata(vec![0.4, 0.6], "ticket", Some(meta))
//!     .unwrap();
//!
//! let filter = SearchFilter::new().eq("channel", "support");
//! let hits = collection
//!     .search_with_filter(&[0.4, 0.6], 0.1, 0.0, 5, &filter)
//!     .unwrap();
//! assert_eq!(hits, vec!["ticket"]);
//! ```

pub mod collection;
pub mod distance;
pub mod embedding;
pub mod quantization;
pub mod query;
pub mod radius;
pub mod storage;
pub mod tree;
pub mod types;

#[cfg(test)]
mod e2e_tests;

/// Prelude module for convenient imports.
///
/// Use `use engram::prelude::*;` to import commonly used types.
pub mod prelude {
    pub use crate::collection::{
        Collection, CollectionError, CompressionStats, AUTO_FLUSH_INTERVAL,
    };
    pub use crate::distance::{admissible_distance, euclidean_distance, l2_squared};
    pub use crate::embedding::EmbeddingProvider;
    pub use crate::quantization::{quantization_error, QuantizationError, QuantizedVector};
    pub use crate::query::{QueryError, SearchFilter, SearchMatch, SearchParams};
    pub use crate::radius::{radius_or_default, semantic_radius, SEMANTIC_RADII};
    pub use crate::storage::{FileStorage, MmapStorage, StorageError};
    pub use crate::tree::{BatchItem, Tree, TreeError};
    pub use crate::types::{Metadata, Node, Pos, VectorSource};
}
