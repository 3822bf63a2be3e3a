//! Tiger Tree Hash (TTH) content identifiers and Merkle trees.
//!
//! A file's TTH is the root of a Merkle tree built from Tiger hashes: data is
//! split into 1 KiB base segments, each hashed with a `0x00` prefix, and
//! internal nodes combine child hashes with a `0x01` prefix. Clients exchange
//! tree leaves at a coarser *block* granularity — a power of two chosen per
//! file so the leaf count stays within a bounded budget — and verify
//! downloaded blocks leaf-by-leaf.

use digest::Digest;
use serde::{Deserialize, Serialize};
use tiger::Tiger;

/// Size of a hash in bytes
pub const HASH_SIZE: usize = 24;

/// Smallest supported block size
pub const MIN_BLOCK_SIZE: u64 = 64 * 1024;

/// Maximum leaves kept per file; block size doubles until this holds
pub const MAX_LEAVES: u64 = 512;

/// Base segment size fixed by the hash-tree construction
const BASE_SEGMENT: usize = 1024;

/// A 24-byte Tiger tree root, rendered as unpadded base32 (39 chars)
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tth(pub [u8; HASH_SIZE]);

impl Tth {
    /// Parse from the 39-character base32 form
    pub fn from_base32(s: &str) -> Option<Self> {
        let bytes = data_encoding::BASE32_NOPAD.decode(s.as_bytes()).ok()?;
        let arr: [u8; HASH_SIZE] = bytes.try_into().ok()?;
        Some(Self(arr))
    }
}

impl std::fmt::Display for Tth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", data_encoding::BASE32_NOPAD.encode(&self.0))
    }
}

impl std::fmt::Debug for Tth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Tth({self})")
    }
}

impl std::str::FromStr for Tth {
    type Err = InvalidTth;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Tth::from_base32(s).ok_or(InvalidTth)
    }
}

/// Error parsing a TTH string
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid TTH")]
pub struct InvalidTth;

impl Serialize for Tth {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Tth {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Tth::from_base32(&s).ok_or_else(|| serde::de::Error::custom("invalid TTH"))
    }
}

fn leaf_hash(data: &[u8]) -> [u8; HASH_SIZE] {
    let mut h = Tiger::new();
    h.update([0u8]);
    h.update(data);
    h.finalize().into()
}

fn node_hash(left: &[u8; HASH_SIZE], right: &[u8; HASH_SIZE]) -> [u8; HASH_SIZE] {
    let mut h = Tiger::new();
    h.update([1u8]);
    h.update(left);
    h.update(right);
    h.finalize().into()
}

/// Combine a level of hashes into the next level up; an unpaired hash is
/// promoted unchanged.
fn combine_level(level: &[[u8; HASH_SIZE]]) -> Vec<[u8; HASH_SIZE]> {
    let mut out = Vec::with_capacity(level.len().div_ceil(2));
    let mut chunks = level.chunks_exact(2);
    for pair in &mut chunks {
        out.push(node_hash(&pair[0], &pair[1]));
    }
    if let [odd] = chunks.remainder() {
        out.push(*odd);
    }
    out
}

/// Reduce a list of hashes to a single root
fn root_of(mut hashes: Vec<[u8; HASH_SIZE]>) -> [u8; HASH_SIZE] {
    debug_assert!(!hashes.is_empty());
    while hashes.len() > 1 {
        hashes = combine_level(&hashes);
    }
    hashes[0]
}

/// Hash one block of data down to a single tree node
fn hash_block(data: &[u8]) -> [u8; HASH_SIZE] {
    if data.is_empty() {
        return leaf_hash(&[]);
    }
    let leaves: Vec<_> = data.chunks(BASE_SEGMENT).map(leaf_hash).collect();
    root_of(leaves)
}

/// Pick the block size for a file: the smallest power of two `>= MIN_BLOCK_SIZE`
/// yielding at most [`MAX_LEAVES`] leaves.
pub fn block_size_for(file_size: u64) -> u64 {
    let mut block = MIN_BLOCK_SIZE;
    while file_size.div_ceil(block.max(1)) > MAX_LEAVES {
        block *= 2;
    }
    block
}

/// A computed Tiger tree: leaf hashes at block granularity plus the root
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TigerTree {
    block_size: u64,
    leaves: Vec<[u8; HASH_SIZE]>,
    root: Tth,
}

impl TigerTree {
    /// Block granularity of the leaves
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Leaf hashes in file order
    pub fn leaves(&self) -> &[[u8; HASH_SIZE]] {
        &self.leaves
    }

    /// The root hash (the file's TTH)
    pub fn root(&self) -> Tth {
        self.root
    }

    /// Verify one block of data against the stored leaf.
    ///
    /// Returns false for an out-of-range index.
    pub fn verify_block(&self, index: usize, data: &[u8]) -> bool {
        match self.leaves.get(index) {
            Some(expected) => hash_block(data) == *expected,
            None => false,
        }
    }

    /// Rebuild a tree from persisted leaves, recomputing the root
    pub fn from_leaves(block_size: u64, leaves: Vec<[u8; HASH_SIZE]>) -> Option<Self> {
        if leaves.is_empty() {
            return None;
        }
        let root = Tth(root_of(leaves.clone()));
        Some(Self {
            block_size,
            leaves,
            root,
        })
    }
}

/// Incremental Tiger tree builder.
///
/// Feed arbitrary byte chunks; the builder keeps at most one base segment of
/// buffered data plus a hash stack, so memory stays constant regardless of
/// block size.
pub struct TigerTreeBuilder {
    block_size: u64,
    /// Segment hashes accumulated for the current block
    block_leaves: Vec<[u8; HASH_SIZE]>,
    /// Completed block hashes
    leaves: Vec<[u8; HASH_SIZE]>,
    buf: Vec<u8>,
    block_fill: u64,
    total: u64,
}

impl TigerTreeBuilder {
    /// Start a tree with the given block size (a power of two, `>= MIN_BLOCK_SIZE`)
    pub fn new(block_size: u64) -> Self {
        debug_assert!(block_size.is_power_of_two() && block_size >= MIN_BLOCK_SIZE);
        Self {
            block_size,
            block_leaves: Vec::new(),
            leaves: Vec::new(),
            buf: Vec::with_capacity(BASE_SEGMENT),
            block_fill: 0,
            total: 0,
        }
    }

    /// Start a tree with the block size derived from the final file size
    pub fn for_file_size(file_size: u64) -> Self {
        Self::new(block_size_for(file_size))
    }

    /// Total bytes fed so far
    pub fn bytes_hashed(&self) -> u64 {
        self.total
    }

    /// Feed the next chunk of file data
    pub fn update(&mut self, mut data: &[u8]) {
        self.total += data.len() as u64;
        while !data.is_empty() {
            let seg_space = BASE_SEGMENT - self.buf.len();
            let block_space = (self.block_size - self.block_fill) as usize;
            let take = data.len().min(seg_space).min(block_space);
            self.buf.extend_from_slice(&data[..take]);
            self.block_fill += take as u64;
            data = &data[take..];

            if self.buf.len() == BASE_SEGMENT {
                let h = leaf_hash(&self.buf);
                self.block_leaves.push(h);
                self.buf.clear();
            }
            if self.block_fill == self.block_size {
                self.finish_block();
            }
        }
    }

    fn finish_block(&mut self) {
        if !self.buf.is_empty() {
            let h = leaf_hash(&self.buf);
            self.block_leaves.push(h);
            self.buf.clear();
        }
        if !self.block_leaves.is_empty() {
            let block = root_of(std::mem::take(&mut self.block_leaves));
            self.leaves.push(block);
        }
        self.block_fill = 0;
    }

    /// Finish hashing and return the tree
    pub fn finish(mut self) -> TigerTree {
        self.finish_block();
        if self.leaves.is_empty() {
            // Zero-byte file: single empty leaf
            self.leaves.push(leaf_hash(&[]));
        }
        let root = Tth(root_of(self.leaves.clone()));
        TigerTree {
            block_size: self.block_size,
            leaves: self.leaves,
            root,
        }
    }
}

/// Hash a complete in-memory buffer (tests, small files)
pub fn hash_buffer(data: &[u8]) -> TigerTree {
    let mut b = TigerTreeBuilder::for_file_size(data.len() as u64);
    b.update(data);
    b.finish()
}
