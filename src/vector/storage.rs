//! On-disk format for facet index snapshots.
//!
//! # Storage Format
//!
//! Little-endian throughout:
//! - Header (28 bytes): magic `BSFX`, version, dimension, metric tag, tree count,
//!   slot count, item count
//! - Items: `item count` records of `id: u32` followed by `dimension` f32 values
//! - Trees: per tree a node count, then nodes tagged `0` (split: left, right,
//!   offset, normal) or `1` (leaf: count, ids)
//! - Footer: SHA-256 over every preceding byte
//!
//! Snapshots are loaded through a read-only memory map and fully validated
//! before a [`Forest`] is handed out, so a truncated or partially written file
//! is always reported instead of producing a broken index.

use std::fs::File;
use std::io;
use std::path::Path;

use memmap2::MmapOptions;
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::forest::{Forest, Node, Tree};
use super::metric::Metric;
use super::types::{VectorDimension, VectorError};

/// Current storage format version.
const STORAGE_VERSION: u32 = 1;

/// Size of the storage header in bytes.
const HEADER_SIZE: usize = 28;

/// Magic bytes to identify forest snapshot files.
const MAGIC_BYTES: &[u8; 4] = b"BSFX";

/// Length of the trailing SHA-256 digest.
const DIGEST_SIZE: usize = 32;

const TAG_SPLIT: u8 = 0;
const TAG_LEAF: u8 = 1;

/// Errors specific to snapshot storage operations.
#[derive(Error, Debug)]
pub enum VectorStorageError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid storage format: {0}")]
    InvalidFormat(String),

    #[error("Checksum mismatch: snapshot content does not match its digest")]
    ChecksumMismatch,

    #[error("Metric mismatch: index was built with {actual}, configuration expects {expected}")]
    MetricMismatch { expected: Metric, actual: Metric },

    #[error("Vector error: {0}")]
    Vector(#[from] VectorError),
}

/// Serializes a forest into the snapshot format.
pub fn encode_forest(forest: &Forest) -> Vec<u8> {
    let dim = forest.dimension().get();
    let mut out = Vec::with_capacity(HEADER_SIZE + forest.len() * (4 + dim * 4) + DIGEST_SIZE);

    out.extend_from_slice(MAGIC_BYTES);
    put_u32(&mut out, STORAGE_VERSION);
    put_u32(&mut out, dim as u32);
    put_u32(&mut out, u32::from(forest.metric().tag()));
    put_u32(&mut out, forest.n_trees() as u32);
    put_u32(&mut out, forest.n_slots() as u32);
    put_u32(&mut out, forest.len() as u32);

    let data = forest.raw_data();
    for id in forest.ids() {
        put_u32(&mut out, id.value());
        let start = id.as_index() * dim;
        for value in &data[start..start + dim] {
            out.extend_from_slice(&value.to_le_bytes());
        }
    }

    for tree in &forest.trees {
        put_u32(&mut out, tree.nodes.len() as u32);
        for node in &tree.nodes {
            match node {
                Node::Split {
                    normal,
                    offset,
                    left,
                    right,
                } => {
                    out.push(TAG_SPLIT);
                    put_u32(&mut out, *left);
                    put_u32(&mut out, *right);
                    out.extend_from_slice(&offset.to_le_bytes());
                    for value in normal {
                        out.extend_from_slice(&value.to_le_bytes());
                    }
                }
                Node::Leaf { items } => {
                    out.push(TAG_LEAF);
                    put_u32(&mut out, items.len() as u32);
                    for id in items {
                        put_u32(&mut out, *id);
                    }
                }
            }
        }
    }

    let digest = Sha256::digest(&out);
    out.extend_from_slice(digest.as_slice());
    out
}

/// Parses and validates snapshot bytes.
pub fn decode_forest(bytes: &[u8]) -> Result<Forest, VectorStorageError> {
    if bytes.len() < HEADER_SIZE + DIGEST_SIZE {
        return Err(VectorStorageError::InvalidFormat(format!(
            "file too small: {} bytes",
            bytes.len()
        )));
    }

    let (body, digest) = bytes.split_at(bytes.len() - DIGEST_SIZE);
    if Sha256::digest(body).as_slice() != digest {
        return Err(VectorStorageError::ChecksumMismatch);
    }

    let mut reader = ByteReader::new(body);
    if reader.take(4)? != MAGIC_BYTES {
        return Err(VectorStorageError::InvalidFormat(
            "invalid magic bytes".to_string(),
        ));
    }

    let version = reader.u32()?;
    if version != STORAGE_VERSION {
        return Err(VectorError::VersionMismatch {
            expected: STORAGE_VERSION,
            actual: version,
        }
        .into());
    }

    let dimension = VectorDimension::new(reader.u32()? as usize)?;
    let metric_tag = reader.u32()?;
    let metric = u8::try_from(metric_tag)
        .ok()
        .and_then(Metric::from_tag)
        .ok_or_else(|| {
            VectorStorageError::InvalidFormat(format!("unknown metric tag {metric_tag}"))
        })?;
    let n_trees = reader.u32()? as usize;
    let n_slots = reader.u32()? as usize;
    let item_count = reader.u32()? as usize;

    if item_count > n_slots {
        return Err(VectorStorageError::InvalidFormat(format!(
            "item count {item_count} exceeds slot count {n_slots}"
        )));
    }

    let dim = dimension.get();
    let mut data = vec![0.0; n_slots * dim];
    let mut present = vec![false; n_slots];
    for _ in 0..item_count {
        let id = reader.u32()? as usize;
        if id >= n_slots || present[id] {
            return Err(VectorStorageError::InvalidFormat(format!(
                "invalid or duplicate item id {id}"
            )));
        }
        present[id] = true;
        for value in &mut data[id * dim..(id + 1) * dim] {
            *value = reader.f32()?;
        }
    }

    let mut trees = Vec::with_capacity(n_trees);
    for _ in 0..n_trees {
        let node_count = reader.u32()? as usize;
        let mut nodes = Vec::with_capacity(node_count.min(body.len()));
        for _ in 0..node_count {
            let node = match reader.u8()? {
                TAG_SPLIT => {
                    let left = reader.u32()?;
                    let right = reader.u32()?;
                    if left as usize >= node_count || right as usize >= node_count {
                        return Err(VectorStorageError::InvalidFormat(
                            "split node points outside its tree".to_string(),
                        ));
                    }
                    let offset = reader.f32()?;
                    let normal = (0..dim)
                        .map(|_| reader.f32())
                        .collect::<Result<Vec<_>, _>>()?;
                    Node::Split {
                        normal,
                        offset,
                        left,
                        right,
                    }
                }
                TAG_LEAF => {
                    let count = reader.u32()? as usize;
                    let items = (0..count)
                        .map(|_| reader.u32())
                        .collect::<Result<Vec<_>, _>>()?;
                    if items
                        .iter()
                        .any(|id| !present.get(*id as usize).copied().unwrap_or(false))
                    {
                        return Err(VectorStorageError::InvalidFormat(
                            "leaf references an unknown item".to_string(),
                        ));
                    }
                    Node::Leaf { items }
                }
                tag => {
                    return Err(VectorStorageError::InvalidFormat(format!(
                        "unknown node tag {tag}"
                    )));
                }
            };
            nodes.push(node);
        }
        if nodes.is_empty() {
            return Err(VectorStorageError::InvalidFormat(
                "tree without nodes".to_string(),
            ));
        }
        trees.push(Tree { nodes });
    }

    if !reader.is_exhausted() {
        return Err(VectorStorageError::InvalidFormat(
            "trailing bytes after last tree".to_string(),
        ));
    }

    Ok(Forest::from_parts(dimension, metric, data, present, trees))
}

/// Maps a snapshot file and decodes it, checking it matches the expected
/// dimension and metric.
pub fn load_forest(
    path: &Path,
    dimension: VectorDimension,
    metric: Metric,
) -> Result<Forest, VectorStorageError> {
    let file = File::open(path)?;
    let len = file.metadata()?.len();
    if (len as usize) < HEADER_SIZE + DIGEST_SIZE {
        return Err(VectorStorageError::InvalidFormat(format!(
            "file too small: {len} bytes"
        )));
    }

    let mmap = unsafe { MmapOptions::new().map(&file)? };
    let forest = decode_forest(&mmap)?;

    if forest.dimension() != dimension {
        return Err(VectorError::DimensionMismatch {
            expected: dimension.get(),
            actual: forest.dimension().get(),
        }
        .into());
    }
    if forest.metric() != metric {
        return Err(VectorStorageError::MetricMismatch {
            expected: metric,
            actual: forest.metric(),
        });
    }

    Ok(forest)
}

impl Forest {
    /// Serialized snapshot bytes, digest included.
    pub fn to_bytes(&self) -> Vec<u8> {
        encode_forest(self)
    }

    /// Writes the snapshot directly to `path` without any swap protocol.
    pub fn save(&self, path: &Path) -> Result<(), VectorStorageError> {
        std::fs::write(path, self.to_bytes())?;
        Ok(())
    }

    pub fn load(
        path: &Path,
        dimension: VectorDimension,
        metric: Metric,
    ) -> Result<Self, VectorStorageError> {
        load_forest(path, dimension, metric)
    }
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

/// Bounds-checked cursor over snapshot bytes.
struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], VectorStorageError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| {
                VectorStorageError::InvalidFormat(format!(
                    "unexpected end of data at offset {}",
                    self.pos
                ))
            })?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, VectorStorageError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, VectorStorageError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn f32(&mut self) -> Result<f32, VectorStorageError> {
        let b = self.take(4)?;
        Ok(f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn is_exhausted(&self) -> bool {
        self.pos == self.bytes.len()
    }
}
