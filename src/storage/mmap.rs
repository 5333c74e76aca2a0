//! Memory-mapped, lazily indexed access to a collection container.
//!
//! Opening costs one pass over the framing fields to record each node's byte
//! offset; vector payloads are never touched until a query needs them. The
//! per-dimension sorted permutations are built on first access to that
//! dimension and cached, so the time from open to first result is
//! proportional to the node count and the dimensions actually scanned, not
//! to the file size.

use memmap2::{Mmap, MmapOptions};
use parking_lot::RwLock;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use super::{read_node, StorageError, COMPRESSION_FLAG, HEADER_SIZE};
use crate::query::{self, QueryError, SearchFilter, SearchMatch, SearchParams};
use crate::types::{Node, Pos, VectorSource};

/// A read-only memory-mapped view of an uncompressed container.
///
/// The mapping is immutable for its lifetime; all access is by position. The
/// lazy permutations use one reader-writer lock per dimension with
/// double-checked locking, so concurrent searches only ever block on the
/// first build of a dimension they share.
pub struct MmapStorage {
    mmap: Mmap,
    path: PathBuf,
    dimensions: usize,
    node_count: usize,
    offsets: Vec<usize>,
    lazy_index: Vec<RwLock<Option<Arc<Vec<Pos>>>>>,
}

impl MmapStorage {
    /// Map a container read-only and build its offset table.
    ///
    /// Compressed containers are rejected; their key blocks cannot be read
    /// by direct offset, so they take the eager load path instead.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let file = File::open(&path)?;
        if file.metadata()?.len() < HEADER_SIZE as u64 {
            return Err(StorageError::Truncated("header"));
        }
        let mmap = unsafe { MmapOptions::new().map(&file)? };

        let dimensions = u32::from_le_bytes(mmap[0..4].try_into().unwrap()) as usize;
        let node_count = u64::from_le_bytes(mmap[4..12].try_into().unwrap()) as usize;
        if dimensions == 0 {
            return Err(StorageError::Corrupt(
                "header declares zero dimensions".to_string(),
            ));
        }

        if node_count > 0
            && mmap.len() > HEADER_SIZE
            && mmap[HEADER_SIZE] == COMPRESSION_FLAG
            && (dimensions & 0xff) != COMPRESSION_FLAG as usize
        {
            return Err(StorageError::Corrupt(
                "compressed container cannot be memory-mapped; load it eagerly".to_string(),
            ));
        }

        let offsets = build_offset_table(&mmap, dimensions, node_count)?;
        let lazy_index = (0..dimensions).map(|_| RwLock::new(None)).collect();

        debug!(
            path = %path.display(),
            nodes = node_count,
            dimensions,
            "container mapped"
        );

        Ok(Self {
            mmap,
            path,
            dimensions,
            node_count,
            offsets,
            lazy_index,
        })
    }

    /// Number of nodes in the container.
    #[inline]
    pub fn node_count(&self) -> usize {
        self.node_count
    }

    /// Fixed dimension count of every key.
    #[inline]
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// The container path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read one dimension of one node's key directly from the mapping.
    ///
    /// # Panics
    ///
    /// Panics if `pos >= node_count()` or `dim >= dimensions()`.
    #[inline]
    pub fn dim_value(&self, pos: Pos, dim: usize) -> f32 {
        debug_assert!(dim < self.dimensions);
        let offset = self.offsets[pos as usize] + 4 + dim * 4;
        f32::from_le_bytes(self.mmap[offset..offset + 4].try_into().unwrap())
    }

    /// Parse the full node record at `pos`, allocating its key and value.
    ///
    /// # Panics
    ///
    /// Panics if `pos >= node_count()`.
    pub fn get_node(&self, pos: Pos) -> Result<Node, StorageError> {
        let mut slice = &self.mmap[self.offsets[pos as usize]..];
        read_node(&mut slice, self.dimensions)
    }

    /// The sorted permutation for one dimension, built on first use.
    ///
    /// The build holds that dimension's writer lock; readers of other
    /// dimensions proceed unblocked. The first completed build wins and is
    /// reused by every later caller.
    pub fn dim_permutation(&self, dim: usize) -> Arc<Vec<Pos>> {
        if let Some(perm) = self.lazy_index[dim].read().as_ref() {
            return Arc::clone(perm);
        }

        let mut slot = self.lazy_index[dim].write();
        if let Some(perm) = slot.as_ref() {
            return Arc::clone(perm);
        }

        let mut perm: Vec<Pos> = (0..self.node_count as Pos).collect();
        perm.sort_unstable_by(|&a, &b| {
            let va = self.dim_value(a, dim);
            let vb = self.dim_value(b, dim);
            match va.partial_cmp(&vb) {
                Some(std::cmp::Ordering::Equal) | None => a.cmp(&b),
                Some(ord) => ord,
            }
        });

        debug!(dim, nodes = self.node_count, "lazy dimension index built");
        let perm = Arc::new(perm);
        *slot = Some(Arc::clone(&perm));
        perm
    }

    /// How many dimension permutations have been built so far.
    pub fn built_index_count(&self) -> usize {
        self.lazy_index
            .iter()
            .filter(|slot| slot.read().is_some())
            .count()
    }

    /// Search the mapped container through the shared query engine.
    pub fn search(
        &self,
        query: &[f32],
        params: &SearchParams,
        filter: Option<&SearchFilter>,
    ) -> Result<Vec<SearchMatch>, QueryError> {
        query::execute(self, query, params, filter)
    }
}

impl VectorSource for MmapStorage {
    fn node_count(&self) -> usize {
        self.node_count
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    #[inline]
    fn dim_value(&self, pos: Pos, dim: usize) -> f32 {
        MmapStorage::dim_value(self, pos, dim)
    }

    fn dim_permutation(&self, dim: usize) -> Arc<Vec<Pos>> {
        MmapStorage::dim_permutation(self, dim)
    }

    fn load_node(&self, pos: Pos) -> Result<Node, StorageError> {
        self.get_node(pos)
    }
}

/// One forward pass over the framing fields, recording each node's offset
/// without decoding any payload.
fn build_offset_table(
    data: &[u8],
    dimensions: usize,
    node_count: usize,
) -> Result<Vec<usize>, StorageError> {
    let mut offsets = Vec::with_capacity(node_count);
    let mut offset = HEADER_SIZE;

    for _ in 0..node_count {
        offsets.push(offset);

        let node_dims = read_u32_at(data, &mut offset, "node dimension count")? as usize;
        if node_dims != dimensions {
            return Err(StorageError::Corrupt(format!(
                "node declares {node_dims} dimensions, header says {dimensions}"
            )));
        }
        offset = skip(data, offset, dimensions * 4, "node key")?;

        let value_len = read_u64_at(data, &mut offset, "value length")? as usize;
        offset = skip(data, offset, value_len, "value")?;

        // older containers end right after the value
        if offset == data.len() {
            continue;
        }
        let ts_len = read_u32_at(data, &mut offset, "timestamp length")? as usize;
        offset = skip(data, offset, ts_len, "timestamp")?;

        if offset == data.len() {
            continue;
        }
        let md_len = read_u32_at(data, &mut offset, "metadata length")? as usize;
        offset = skip(data, offset, md_len, "metadata")?;
    }

    Ok(offsets)
}

fn read_u32_at(data: &[u8], offset: &mut usize, what: &'static str) -> Result<u32, StorageError> {
    let end = offset
        .checked_add(4)
        .filter(|&e| e <= data.len())
        .ok_or(StorageError::Truncated(what))?;
    let value = u32::from_le_bytes(data[*offset..end].try_into().unwrap());
    *offset = end;
    Ok(value)
}

fn read_u64_at(data: &[u8], offset: &mut usize, what: &'static str) -> Result<u64, StorageError> {
    let end = offset
        .checked_add(8)
        .filter(|&e| e <= data.len())
        .ok_or(StorageError::Truncated(what))?;
    let value = u64::from_le_bytes(data[*offset..end].try_into().unwrap());
    *offset = end;
    Ok(value)
}

fn skip(data: &[u8], offset: usize, len: usize, what: &'static str) -> Result<usize, StorageError> {
    offset
        .checked_add(len)
        .filter(|&e| e <= data.len())
        .ok_or(StorageError::Truncated(what))
}
