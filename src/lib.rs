//! Transactional, block-addressed storage core for a time-series historian:
//! a paged memory pool, a quasi-LRU page cache, copy-on-write shadow paging
//! over a triplicate-header file format, and snapshot-isolated sessions.
//!
//! The sorted-tree indices, key/value types, match/seek filters, the RPC
//! server, archive-list lifecycle (rollover/deletion scheduling), access
//! control, and CLI/config parsing are all external collaborators built on
//! top of the block-addressable API this crate exposes (§1, §6). This crate
//! only speaks in block offsets and raw byte payloads.

pub mod archive_log;
pub mod buffered_file;
pub mod config;
pub mod disk_io;
pub mod disk_medium;
pub mod error;
pub mod file_stream;
pub mod footer;
pub mod memory_pool;
pub mod memory_stream;
pub mod page_cache;

pub use archive_log::ArchiveListLog;
pub use buffered_file::{BlockArguments, BlockResult, BufferedFile, FileHeaderBlock};
pub use config::{StorageOptions, UtilizationLevel};
pub use disk_io::{DiskIo, DiskIoSession};
pub use disk_medium::DiskMedium;
pub use error::{Result, StorageError};
pub use file_stream::CustomFileStream;
pub use footer::{ChecksumState, Footer};
pub use memory_pool::{CollectionEvent, CollectionSubscriber, MemoryPool};
pub use page_cache::PageReplacementAlgorithm;

use std::path::Path;
use std::sync::Arc;

/// The top-level handle a consumer opens against one archive file: wires the
/// memory pool, page cache, file stream, and buffered file together per
/// §2's dependency order, and registers the buffered file as a collection
/// subscriber so pool pressure evicts its cached pages (§4.1, §4.5).
pub struct Archive {
    pool: Arc<MemoryPool>,
    cache: Arc<PageReplacementAlgorithm>,
    buffered: Arc<BufferedFile>,
    disk_io: DiskIo,
    file_structure_block_size: u64,
}

impl Archive {
    fn assemble(
        options: &StorageOptions,
        file_id_number: u16,
        buffered: Result<BufferedFile>,
        pool: Arc<MemoryPool>,
        cache: Arc<PageReplacementAlgorithm>,
    ) -> Result<Self> {
        let buffered = Arc::new(buffered?);
        let subscriber: Arc<dyn CollectionSubscriber> = buffered.clone();
        pool.register_subscriber(&subscriber);
        let file_structure_block_size = options.file_structure_block_size_get() as u64;
        let disk_io = DiskIo::new(
            Arc::new(DiskMedium::File(buffered.clone())),
            file_structure_block_size,
            file_id_number,
        );
        Ok(Self {
            pool,
            cache,
            buffered,
            disk_io,
            file_structure_block_size,
        })
    }

    /// Create a brand-new archive file at `path`. Fails with
    /// [`StorageError::AlreadyExists`]-shaped callers' expectations are not
    /// enforced here; `path` is simply opened/created and a fresh header
    /// written (§4.5, §9 steady-state initializer).
    pub fn create(options: &StorageOptions, path: impl AsRef<Path>, file_id_number: u16) -> Result<Self> {
        let path = path.as_ref();
        let pool = Arc::new(MemoryPool::new(options));
        let cache = PageReplacementAlgorithm::new(pool.clone());
        let block_size = options.file_structure_block_size_get();
        let file = Arc::new(CustomFileStream::open(path, false, block_size)?);
        let archive_id = random_archive_id();
        let buffered = BufferedFile::create(
            file.clone(),
            pool.clone(),
            cache.clone(),
            block_size as u64,
            options.header_block_count_get(),
            archive_id,
        );
        Self::assemble(options, file_id_number, buffered, pool, cache)
    }

    /// Like [`Self::create`], but writes header slot 0 `header_block_count`
    /// times rather than once, for bit-for-bit compatibility with the
    /// canonical new-file initializer (§9 Open Question).
    pub fn create_legacy(
        options: &StorageOptions,
        path: impl AsRef<Path>,
        file_id_number: u16,
    ) -> Result<Self> {
        let path = path.as_ref();
        let pool = Arc::new(MemoryPool::new(options));
        let cache = PageReplacementAlgorithm::new(pool.clone());
        let block_size = options.file_structure_block_size_get();
        let file = Arc::new(CustomFileStream::open(path, false, block_size)?);
        let archive_id = random_archive_id();
        let buffered = BufferedFile::create_legacy(
            file.clone(),
            pool.clone(),
            cache.clone(),
            block_size as u64,
            options.header_block_count_get(),
            archive_id,
        );
        Self::assemble(options, file_id_number, buffered, pool, cache)
    }

    /// Open an existing archive file, recovering its header from whichever
    /// of the ten slots holds the largest valid snapshot sequence (§9).
    pub fn open(
        options: &StorageOptions,
        path: impl AsRef<Path>,
        read_only: bool,
        file_id_number: u16,
    ) -> Result<Self> {
        let path = path.as_ref();
        let pool = Arc::new(MemoryPool::new(options));
        let cache = PageReplacementAlgorithm::new(pool.clone());
        let block_size = options.file_structure_block_size_get();
        let file = Arc::new(CustomFileStream::open(path, read_only, block_size)?);
        let buffered = BufferedFile::open(
            file.clone(),
            pool.clone(),
            cache.clone(),
            block_size as u64,
            options.header_block_count_get(),
        );
        Self::assemble(options, file_id_number, buffered, pool, cache)
    }

    /// The current committed [`FileHeaderBlock`].
    pub fn header(&self) -> FileHeaderBlock {
        self.disk_io.header()
    }

    /// Open a session bound to `snapshot` (a reader's isolation point, or a
    /// writer's in-progress snapshot).
    pub fn create_session(&self, read_only: bool, snapshot: u32) -> DiskIoSession {
        self.disk_io.create_session(read_only, snapshot)
    }

    /// The snapshot sequence number a new writer session should commit
    /// under.
    pub fn next_snapshot_sequence_number(&self) -> u32 {
        self.buffered.next_snapshot_sequence_number()
    }

    /// Atomically promote `new_header`'s write-buffer contents to the
    /// committed region and rotate headers (§4.5 commit protocol).
    pub fn commit(&self, new_header: FileHeaderBlock) -> Result<()> {
        self.disk_io.commit(new_header)
    }

    /// Discard the write buffer, leaving the committed region untouched.
    pub fn rollback(&self) {
        self.disk_io.rollback()
    }

    pub fn change_extension(&self, new_path: impl AsRef<Path>) -> Result<()> {
        self.disk_io.change_extension(new_path)
    }

    pub fn change_share_mode(&self, read_only: bool) -> Result<()> {
        self.disk_io.change_share_mode(read_only)
    }

    pub fn pool(&self) -> &Arc<MemoryPool> {
        &self.pool
    }

    pub fn cache(&self) -> &Arc<PageReplacementAlgorithm> {
        &self.cache
    }

    pub fn file_structure_block_size(&self) -> u64 {
        self.file_structure_block_size
    }
}

/// Archive identifiers are plain 16-byte GUIDs (§3); this crate does not
/// depend on a UUID crate since it never parses or formats them, only
/// stores and compares the raw bytes. A simple xorshift-seeded generator is
/// enough to make fresh archives distinguishable from one another.
fn random_archive_id() -> [u8; 16] {
    use std::time::{SystemTime, UNIX_EPOCH};
    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
        ^ (std::process::id() as u64).wrapping_mul(0x9E3779B97F4A7C15);
    let mut state = seed | 1;
    let mut id = [0u8; 16];
    for chunk in id.chunks_mut(8) {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        chunk.copy_from_slice(&state.to_le_bytes());
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> StorageOptions {
        let mut opts = StorageOptions::new();
        opts.page_size(4096).unwrap();
        opts.maximum_pool_size(Some(16 * 1024 * 1024));
        opts.file_structure_block_size(4096).unwrap();
        opts
    }

    #[test]
    fn create_open_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archive.d");
        let opts = options();
        {
            let archive = Archive::create(&opts, &path, 1).unwrap();
            let old_end = archive.header().committed_end();
            let block_index = old_end / 4096;
            let mut writer = archive.create_session(false, archive.next_snapshot_sequence_number());
            writer.write_to_new_block(block_index, 7, 0).unwrap().fill(0x42);
            writer.finish_write(block_index);
            let mut header = archive.header();
            header.last_allocated_block = block_index as u32;
            header.snapshot_sequence_number = archive.next_snapshot_sequence_number();
            archive.commit(header).unwrap();
        }

        let reopened = Archive::open(&opts, &path, true, 1).unwrap();
        let block_index = reopened.header().committed_end() / 4096 - 1;
        let mut reader = reopened.create_session(true, reopened.header().snapshot_sequence_number);
        let data = reader.read(block_index, 7, 0).unwrap();
        assert!(data.iter().all(|b| *b == 0x42));
    }
}
