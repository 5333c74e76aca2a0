//! The on-disk container format and its file-backed storage handle.
//!
//! A container is a single little-endian file per collection:
//!
//! ```text
//! u32 dimensions
//! u64 node_count
//! [u8 == 1]                       optional compression flag
//! per node, in insertion order:
//!   u32 per_node_dim              validated against the header
//!   f32[dim] key                  or: f32 min, f32 max, u8[dim] quantized
//!   u64 value_len, value bytes
//!   u32 timestamp_len, bytes      absent in older containers
//!   u32 metadata_len, json bytes  absent in older containers
//! ```
//!
//! Readers probe the compression flag by peeking one byte and rewinding when
//! it turns out to be the start of a node record, so containers written
//! before the flag existed still load. A clean end-of-stream where the
//! timestamp or metadata length would start is treated as a zero-length
//! field, never an error.

pub mod mmap;

pub use mmap::MmapStorage;

use chrono::{DateTime, Utc};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use crate::quantization::QuantizedVector;
use crate::tree::Tree;
use crate::types::Node;

/// Byte size of the container header (`u32` dimensions + `u64` node count).
pub const HEADER_SIZE: usize = 12;

/// The flag byte marking a compressed container.
pub(crate) const COMPRESSION_FLAG: u8 = 1;

/// Errors from encoding, decoding, and file handling.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("container truncated while reading {0}")]
    Truncated(&'static str),

    #[error("container dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("unknown container version marker: {0:#04x}")]
    VersionUnknown(u8),

    #[error("container corrupt: {0}")]
    Corrupt(String),
}

/// A file-backed storage handle for one collection.
#[derive(Debug, Clone)]
pub struct FileStorage {
    path: PathBuf,
    compress: bool,
}

impl FileStorage {
    /// A handle writing the uncompressed variant.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            compress: false,
        }
    }

    /// Choose the scalar-quantized variant for subsequent saves. Loading
    /// auto-detects the variant regardless of this setting.
    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    /// The container path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the tree to disk. The container is assembled in a sibling
    /// temporary file and renamed into place, so readers of the old file
    /// never observe a partial write.
    pub fn save(&self, tree: &Tree) -> Result<(), StorageError> {
        let tmp = temp_path(&self.path);
        {
            let file = File::create(&tmp)?;
            let mut writer = BufWriter::new(file);

            writer.write_all(&(tree.dimensions() as u32).to_le_bytes())?;
            writer.write_all(&(tree.len() as u64).to_le_bytes())?;
            if self.compress {
                writer.write_all(&[COMPRESSION_FLAG])?;
            }

            for node in tree.nodes() {
                if self.compress {
                    write_compressed_node(&mut writer, node)?;
                } else {
                    write_node(&mut writer, node)?;
                }
            }

            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;

        debug!(
            path = %self.path.display(),
            nodes = tree.len(),
            compressed = self.compress,
            "container flushed"
        );
        Ok(())
    }

    /// Read the whole container into a tree. The returned tree's index is
    /// stale and rebuilds on first query.
    pub fn load(&self) -> Result<Tree, StorageError> {
        let file = File::open(&self.path)?;
        let mut reader = BufReader::new(file);

        let dims = read_u32(&mut reader, "header dimensions")? as usize;
        if dims == 0 {
            return Err(StorageError::Corrupt(
                "header declares zero dimensions".to_string(),
            ));
        }
        let count = read_u64(&mut reader, "header node count")?;
        let compressed = probe_compression(&mut reader, dims)?;

        let mut nodes = Vec::with_capacity(count.min(1 << 20) as usize);
        for _ in 0..count {
            let node = if compressed {
                read_compressed_node(&mut reader, dims)?
            } else {
                read_node(&mut reader, dims)?
            };
            nodes.push(node);
        }

        debug!(
            path = %self.path.display(),
            nodes = nodes.len(),
            dimensions = dims,
            compressed,
            "container loaded"
        );
        Ok(Tree::from_parts(dims, nodes))
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "collection".into());
    name.push(".tmp");
    path.with_file_name(name)
}

/// Decide the container variant by peeking at the byte after the header.
///
/// `1` is the compression flag; the low byte of the header dimension count is
/// the start of an unflagged node record (rewind); anything else is a format
/// marker this reader does not know.
fn probe_compression<R: Read + Seek>(reader: &mut R, dims: usize) -> Result<bool, StorageError> {
    let mut byte = [0u8; 1];
    let n = loop {
        match reader.read(&mut byte) {
            Ok(n) => break n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    };
    if n == 0 {
        return Ok(false);
    }

    if byte[0] == COMPRESSION_FLAG {
        Ok(true)
    } else if byte[0] == (dims & 0xff) as u8 {
        reader.seek(SeekFrom::Current(-1))?;
        Ok(false)
    } else {
        Err(StorageError::VersionUnknown(byte[0]))
    }
}

// --- node codec ---

pub(crate) fn write_node<W: Write>(w: &mut W, node: &Node) -> Result<(), StorageError> {
    w.write_all(&(node.key.len() as u32).to_le_bytes())?;
    for &v in &node.key {
        w.write_all(&v.to_le_bytes())?;
    }
    write_node_tail(w, node)
}

pub(crate) fn write_compressed_node<W: Write>(w: &mut W, node: &Node) -> Result<(), StorageError> {
    let qv = QuantizedVector::quantize(&node.key);
    w.write_all(&(qv.dimensions() as u32).to_le_bytes())?;
    w.write_all(&qv.min.to_le_bytes())?;
    w.write_all(&qv.max.to_le_bytes())?;
    w.write_all(&qv.values)?;
    write_node_tail(w, node)
}

fn write_node_tail<W: Write>(w: &mut W, node: &Node) -> Result<(), StorageError> {
    w.write_all(&(node.value.len() as u64).to_le_bytes())?;
    w.write_all(node.value.as_bytes())?;

    let ts = encode_timestamp(&node.timestamp);
    w.write_all(&(ts.len() as u32).to_le_bytes())?;
    w.write_all(&ts)?;

    match &node.metadata {
        Some(meta) if !meta.is_empty() => {
            let bytes = serde_json::to_vec(meta)
                .map_err(|e| StorageError::Corrupt(format!("metadata encoding: {e}")))?;
            w.write_all(&(bytes.len() as u32).to_le_bytes())?;
            w.write_all(&bytes)?;
        }
        _ => w.write_all(&0u32.to_le_bytes())?,
    }
    Ok(())
}

pub(crate) fn read_node<R: Read>(r: &mut R, dims: usize) -> Result<Node, StorageError> {
    check_node_dims(read_u32(r, "node dimension count")? as usize, dims)?;

    let mut buf = vec![0u8; dims * 4];
    read_exact(r, &mut buf, "node key")?;
    let key = buf
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
        .collect();

    read_node_tail(r, key)
}

pub(crate) fn read_compressed_node<R: Read>(r: &mut R, dims: usize) -> Result<Node, StorageError> {
    check_node_dims(read_u32(r, "node dimension count")? as usize, dims)?;

    let min = read_f32(r, "quantized minimum")?;
    let max = read_f32(r, "quantized maximum")?;
    let mut values = vec![0u8; dims];
    read_exact(r, &mut values, "quantized key")?;

    let key = QuantizedVector { values, min, max }.dequantize();
    read_node_tail(r, key)
}

fn check_node_dims(got: usize, expected: usize) -> Result<(), StorageError> {
    if got != expected {
        return Err(StorageError::Corrupt(format!(
            "node declares {got} dimensions, header says {expected}"
        )));
    }
    Ok(())
}

fn read_node_tail<R: Read>(r: &mut R, key: Vec<f32>) -> Result<Node, StorageError> {
    let value_len = read_u64(r, "value length")? as usize;
    let mut value_bytes = vec![0u8; value_len];
    read_exact(r, &mut value_bytes, "value")?;
    let value = String::from_utf8(value_bytes)
        .map_err(|_| StorageError::Corrupt("value is not valid UTF-8".to_string()))?;

    // older containers end right after the value
    let ts_len = match read_u32_opt(r, "timestamp length")? {
        None => {
            return Ok(Node {
                key,
                value,
                timestamp: DateTime::UNIX_EPOCH,
                metadata: None,
            })
        }
        Some(n) => n as usize,
    };
    let mut ts_bytes = vec![0u8; ts_len];
    read_exact(r, &mut ts_bytes, "timestamp")?;
    let timestamp = decode_timestamp(&ts_bytes);

    let metadata = match read_u32_opt(r, "metadata length")? {
        None | Some(0) => None,
        Some(n) => {
            let mut md_bytes = vec![0u8; n as usize];
            read_exact(r, &mut md_bytes, "metadata")?;
            Some(
                serde_json::from_slice(&md_bytes)
                    .map_err(|e| StorageError::Corrupt(format!("metadata json: {e}")))?,
            )
        }
    };

    Ok(Node {
        key,
        value,
        timestamp,
        metadata,
    })
}

// --- timestamps ---

/// Timestamps are stored as 8-byte little-endian Unix microseconds inside the
/// length-prefixed field, so the byte sequence round-trips exactly.
pub(crate) fn encode_timestamp(ts: &DateTime<Utc>) -> [u8; 8] {
    ts.timestamp_micros().to_le_bytes()
}

/// Unrecognized encodings decode to the epoch rather than failing, matching
/// the zero-length-field behavior of older containers.
pub(crate) fn decode_timestamp(bytes: &[u8]) -> DateTime<Utc> {
    if bytes.len() == 8 {
        let micros = i64::from_le_bytes(bytes.try_into().unwrap());
        if let Some(ts) = DateTime::from_timestamp_micros(micros) {
            return ts;
        }
    }
    DateTime::UNIX_EPOCH
}

// --- primitive reads, mapping clean EOF to Truncated ---

fn read_exact<R: Read>(r: &mut R, buf: &mut [u8], what: &'static str) -> Result<(), StorageError> {
    r.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            StorageError::Truncated(what)
        } else {
            StorageError::Io(e)
        }
    })
}

fn read_u32<R: Read>(r: &mut R, what: &'static str) -> Result<u32, StorageError> {
    let mut buf = [0u8; 4];
    read_exact(r, &mut buf, what)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(r: &mut R, what: &'static str) -> Result<u64, StorageError> {
    let mut buf = [0u8; 8];
    read_exact(r, &mut buf, what)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_f32<R: Read>(r: &mut R, what: &'static str) -> Result<f32, StorageError> {
    let mut buf = [0u8; 4];
    read_exact(r, &mut buf, what)?;
    Ok(f32::from_le_bytes(buf))
}

/// Read a `u32` that may legitimately be absent: `None` at a clean end of
/// stream, `Truncated` if the stream ends mid-field.
fn read_u32_opt<R: Read>(r: &mut R, what: &'static str) -> Result<Option<u32>, StorageError> {
    let mut buf = [0u8; 4];
    let mut filled = 0;
    while filled < 4 {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(StorageError::Io(e)),
        }
    }
    match filled {
        0 => Ok(None),
        4 => Ok(Some(u32::from_le_bytes(buf))),
        _ => Err(StorageError::Truncated(what)),
    }
}
