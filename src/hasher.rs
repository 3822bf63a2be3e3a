//! File hashing worker support.
//!
//! Streams files through the Tiger tree builder for indexing and recheck.
//! Hashing can be paused globally: a share refresh takes a scoped
//! [`HashPauser`]; the hashing side observes the pause between files, never
//! mid-file.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::io::AsyncReadExt;

use crate::tth::{TigerTree, TigerTreeBuilder};

const READ_BUF: usize = 256 * 1024;

/// Scoped pause guard. Hashing stays paused while any guard is alive.
pub struct HashPauser {
    counter: Arc<AtomicUsize>,
}

impl Drop for HashPauser {
    fn drop(&mut self) {
        let left = self.counter.fetch_sub(1, Ordering::AcqRel) - 1;
        tracing::debug!(pausers_left = left, "hash pauser released");
    }
}

/// Shared hashing state
#[derive(Clone, Default)]
pub struct Hasher {
    pause_count: Arc<AtomicUsize>,
}

impl Hasher {
    /// Create an unpaused hasher
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a pause guard; hashing resumes when every guard is dropped
    pub fn pause(&self) -> HashPauser {
        self.pause_count.fetch_add(1, Ordering::AcqRel);
        HashPauser {
            counter: Arc::clone(&self.pause_count),
        }
    }

    /// True while at least one pause guard is alive
    pub fn is_paused(&self) -> bool {
        self.pause_count.load(Ordering::Acquire) > 0
    }

    /// Wait until hashing is unpaused. Checked between files, not mid-hash.
    pub async fn wait_unpaused(&self) {
        while self.is_paused() {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
    }

    /// Hash a whole file into a Tiger tree.
    ///
    /// The block size is derived from the on-disk size before reading.
    pub async fn hash_file(&self, path: &Path) -> std::io::Result<TigerTree> {
        let meta = tokio::fs::metadata(path).await?;
        let mut file = tokio::fs::File::open(path).await?;
        let mut builder = TigerTreeBuilder::for_file_size(meta.len());
        let mut buf = vec![0u8; READ_BUF];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            builder.update(&buf[..n]);
        }
        Ok(builder.finish())
    }
}

/// Outcome of verifying a file's blocks against a stored tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockVerification {
    /// Indices of blocks that hashed to the stored leaf
    pub verified: Vec<usize>,
    /// Indices of blocks that did not
    pub failed: Vec<usize>,
    /// On-disk size of the file that was read
    pub file_size: u64,
}

/// Stream a file and compare every block to the stored tree leaves.
///
/// Blocks past the stored leaf count are graded failed; a short final block is
/// hashed as-is (the tree was built the same way).
pub async fn verify_file_blocks(
    path: &Path,
    tree: &TigerTree,
) -> std::io::Result<BlockVerification> {
    let meta = tokio::fs::metadata(path).await?;
    let mut file = tokio::fs::File::open(path).await?;
    let block_size = tree.block_size() as usize;

    let mut verified = Vec::new();
    let mut failed = Vec::new();
    let mut block = vec![0u8; block_size];
    let mut index = 0usize;

    loop {
        let mut filled = 0usize;
        while filled < block_size {
            let n = file.read(&mut block[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            break;
        }
        if tree.verify_block(index, &block[..filled]) {
            verified.push(index);
        } else {
            failed.push(index);
        }
        index += 1;
        if filled < block_size {
            break;
        }
    }

    Ok(BlockVerification {
        verified,
        failed,
        file_size: meta.len(),
    })
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::tth::{MIN_BLOCK_SIZE, hash_buffer};
    use std::io::Write;

    fn temp_file(data: &[u8]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(data).unwrap();
        f.flush().unwrap();
        f
    }

    #[tokio::test]
    async fn hash_file_matches_in_memory_hash() {
        let data: Vec<u8> = (0..300_000u32).map(|i| (i % 241) as u8).collect();
        let f = temp_file(&data);

        let tree = Hasher::new().hash_file(f.path()).await.unwrap();
        assert_eq!(tree.root(), hash_buffer(&data).root());
    }

    #[tokio::test]
    async fn pause_guard_blocks_until_dropped() {
        let hasher = Hasher::new();
        assert!(!hasher.is_paused());

        let guard = hasher.pause();
        assert!(hasher.is_paused());
        let second = hasher.pause();
        drop(guard);
        assert!(hasher.is_paused(), "still one guard alive");
        drop(second);
        assert!(!hasher.is_paused());
        hasher.wait_unpaused().await;
    }

    #[tokio::test]
    async fn verify_reports_every_intact_block() {
        let block = MIN_BLOCK_SIZE as usize;
        let data: Vec<u8> = (0..block * 3 + 500).map(|i| (i % 239) as u8).collect();
        let tree = hash_buffer(&data);
        let f = temp_file(&data);

        let v = verify_file_blocks(f.path(), &tree).await.unwrap();
        assert_eq!(v.verified, vec![0, 1, 2, 3]);
        assert!(v.failed.is_empty());
        assert_eq!(v.file_size, data.len() as u64);
    }

    #[tokio::test]
    async fn verify_flags_a_corrupted_block() {
        let block = MIN_BLOCK_SIZE as usize;
        let mut data: Vec<u8> = (0..block * 5).map(|i| (i % 239) as u8).collect();
        let tree = hash_buffer(&data);

        // Corrupt block 4, leaving blocks 0-3 intact
        data[block * 4 + 17] ^= 0xFF;
        let f = temp_file(&data);

        let v = verify_file_blocks(f.path(), &tree).await.unwrap();
        assert_eq!(v.verified, vec![0, 1, 2, 3]);
        assert_eq!(v.failed, vec![4]);
    }

    #[tokio::test]
    async fn verify_grades_extra_blocks_failed() {
        let block = MIN_BLOCK_SIZE as usize;
        let data: Vec<u8> = vec![1u8; block];
        let tree = hash_buffer(&data);

        // File grew past the hashed size
        let grown: Vec<u8> = vec![1u8; block * 2];
        let f = temp_file(&grown);

        let v = verify_file_blocks(f.path(), &tree).await.unwrap();
        assert_eq!(v.verified, vec![0]);
        assert_eq!(v.failed, vec![1], "block outside the tree cannot verify");
    }
}
