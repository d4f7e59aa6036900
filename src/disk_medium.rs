//! §4.7 `DiskMedium` — variant dispatch over an in-memory-only pool file or
//! a disk-backed [`BufferedFile`]. Owns the current [`FileHeaderBlock`],
//! publishes a new one behind a memory barrier on commit, and forwards
//! session creation and file-stream housekeeping to whichever variant is
//! active.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::buffered_file::{BlockArguments, BlockResult, BufferedFile, FileHeaderBlock};
use crate::error::Result;
use crate::memory_pool::MemoryPool;
use crate::memory_stream::MemoryStreamCore;
use crate::page_cache::PageLock;

/// The memory-only variant of §4.7: a bare [`MemoryStreamCore`] with no
/// committed region, no headers, and no backing file. Commit/rollback are
/// no-ops over the pool stream, as the spec calls for; everything written is
/// immediately "current" since there is nothing else to promote it past.
pub struct MemoryPoolFile {
    stream: MemoryStreamCore,
    block_size: u32,
    snapshot_sequence_number: AtomicU32,
    high_water_mark: AtomicU64,
}

impl MemoryPoolFile {
    pub fn new(pool: Arc<MemoryPool>, block_size: u32) -> Self {
        Self {
            stream: MemoryStreamCore::new(pool, 0),
            block_size,
            snapshot_sequence_number: AtomicU32::new(0),
            high_water_mark: AtomicU64::new(0),
        }
    }

    fn get_block(&self, args: BlockArguments) -> Result<BlockResult> {
        let view = self.stream.get_block(args.position)?;
        let end = args.position + view.length as u64;
        self.high_water_mark.fetch_max(end, Ordering::SeqCst);
        Ok(BlockResult {
            first_position: view.first_position,
            ptr: view.ptr,
            length: view.length,
            supports_writing: true,
        })
    }

    fn header(&self) -> FileHeaderBlock {
        let last_allocated_block = (self.high_water_mark.load(Ordering::SeqCst) / self.block_size as u64)
            .saturating_sub(1) as u32;
        FileHeaderBlock {
            block_size: self.block_size,
            header_block_count: 0,
            last_allocated_block,
            snapshot_sequence_number: self.snapshot_sequence_number.load(Ordering::SeqCst),
            archive_id: [0u8; 16],
            flags: 0,
        }
    }

    fn commit(&self, header: FileHeaderBlock) {
        self.snapshot_sequence_number
            .store(header.snapshot_sequence_number, Ordering::SeqCst);
    }
}

/// A handle pinning at most one cached page, valid for whichever variant
/// produced it. The memory variant needs no pin: every position is always
/// backed directly by the pool stream.
pub enum MediumLock {
    Memory,
    File(PageLock),
}

/// §4.7 `DiskMedium`.
pub enum DiskMedium {
    Memory(MemoryPoolFile),
    File(Arc<BufferedFile>),
}

impl DiskMedium {
    pub fn new_lock(&self) -> MediumLock {
        match self {
            DiskMedium::Memory(_) => MediumLock::Memory,
            DiskMedium::File(bf) => MediumLock::File(bf.new_session()),
        }
    }

    pub fn get_block(&self, lock: &mut MediumLock, args: BlockArguments) -> Result<BlockResult> {
        match (self, lock) {
            (DiskMedium::Memory(m), MediumLock::Memory) => m.get_block(args),
            (DiskMedium::File(bf), MediumLock::File(page_lock)) => bf.get_block(page_lock, args),
            _ => Err(crate::error::StorageError::Other(
                "lock variant does not match the medium it was created from",
            )),
        }
    }

    pub fn header(&self) -> FileHeaderBlock {
        match self {
            DiskMedium::Memory(m) => m.header(),
            DiskMedium::File(bf) => bf.header(),
        }
    }

    pub fn commit(&self, header: FileHeaderBlock) -> Result<()> {
        match self {
            DiskMedium::Memory(m) => {
                m.commit(header);
                Ok(())
            }
            DiskMedium::File(bf) => bf.commit(header),
        }
    }

    pub fn rollback(&self) {
        match self {
            DiskMedium::Memory(_) => {}
            DiskMedium::File(bf) => bf.rollback(),
        }
    }

    pub fn change_extension(&self, new_path: impl AsRef<std::path::Path>) -> Result<()> {
        match self {
            DiskMedium::Memory(_) => Err(crate::error::StorageError::Other(
                "a memory-only medium has no backing file to rename",
            )),
            DiskMedium::File(bf) => bf.change_extension(new_path),
        }
    }

    pub fn change_share_mode(&self, read_only: bool) -> Result<()> {
        match self {
            DiskMedium::Memory(_) => Ok(()),
            DiskMedium::File(bf) => bf.change_share_mode(read_only),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageOptions;

    fn pool() -> Arc<MemoryPool> {
        let mut opts = StorageOptions::new();
        opts.page_size(4096).unwrap();
        opts.maximum_pool_size(Some(8 * 1024 * 1024));
        Arc::new(MemoryPool::new(&opts))
    }

    #[test]
    fn memory_medium_get_block_and_commit_are_trivial() {
        let medium = DiskMedium::Memory(MemoryPoolFile::new(pool(), 4096));
        let mut lock = medium.new_lock();
        let block = medium
            .get_block(&mut lock, BlockArguments { position: 0, is_writing: true })
            .unwrap();
        assert!(block.supports_writing);
        let mut header = medium.header();
        header.snapshot_sequence_number = 1;
        medium.commit(header).unwrap();
        assert_eq!(medium.header().snapshot_sequence_number, 1);
        medium.rollback();
    }
}
