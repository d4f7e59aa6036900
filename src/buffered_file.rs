//! §4.5 `BufferedFile` — composes the page cache (§4.3) and the file stream
//! (§4.4): serves committed reads through the cache, serves everything past
//! `committed_end` from an in-memory write buffer, and implements the commit
//! protocol and triplicate header rotation.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use bytemuck::{Pod, Zeroable};

use crate::error::{Result, StorageError};
use crate::file_stream::CustomFileStream;
use crate::memory_pool::{CollectionEvent, CollectionSubscriber, MemoryPool};
use crate::memory_stream::MemoryStreamCore;
use crate::page_cache::{PageLock, PageReplacementAlgorithm};

/// Number of header slots in the canonical on-disk layout (§3, §6).
pub const CANONICAL_HEADER_BLOCK_COUNT: u8 = 10;

/// §3 `FileHeaderBlock`: persistent metadata rotated through the ten header
/// slots on every commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeaderBlock {
    pub block_size: u32,
    pub header_block_count: u8,
    pub last_allocated_block: u32,
    pub snapshot_sequence_number: u32,
    pub archive_id: [u8; 16],
    pub flags: u32,
}

impl FileHeaderBlock {
    /// `last_allocated_block` starts at `header_block_count` rather than
    /// `header_block_count - 1`: per §6, block indices `0..=10` are reserved
    /// header slots even though only ten physical slots are written (block
    /// index 10 is a reserved boundary block, never allocated to data) — see
    /// scenario 1 of §8, where the first data block committed is index 11.
    pub fn new(block_size: u32, header_block_count: u8, archive_id: [u8; 16]) -> Self {
        Self {
            block_size,
            header_block_count,
            last_allocated_block: header_block_count as u32,
            snapshot_sequence_number: 0,
            archive_id,
            flags: 0,
        }
    }

    /// Length in bytes of the immutable committed region this header
    /// describes: `(lastAllocatedBlock + 1) * blockSize`.
    pub fn committed_end(&self) -> u64 {
        (self.last_allocated_block as u64 + 1) * self.block_size as u64
    }

    pub fn header_span(&self) -> u64 {
        self.header_block_count as u64 * self.block_size as u64
    }
}

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct RawHeader {
    magic: [u8; 8],
    block_size: u32,
    header_block_count: u8,
    _reserved: [u8; 3],
    last_allocated_block: u32,
    snapshot_sequence_number: u32,
    archive_id: [u8; 16],
    flags: u32,
    checksum: u64,
}

const HEADER_MAGIC: [u8; 8] = *b"hstcore1";

fn header_checksum(raw: &RawHeader) -> u64 {
    let mut copy = *raw;
    copy.checksum = 0;
    xxhash_rust::xxh3::xxh3_64(bytemuck::bytes_of(&copy))
}

impl FileHeaderBlock {
    fn to_raw(self) -> RawHeader {
        let mut raw = RawHeader {
            magic: HEADER_MAGIC,
            block_size: self.block_size,
            header_block_count: self.header_block_count,
            _reserved: [0; 3],
            last_allocated_block: self.last_allocated_block,
            snapshot_sequence_number: self.snapshot_sequence_number,
            archive_id: self.archive_id,
            flags: self.flags,
            checksum: 0,
        };
        raw.checksum = header_checksum(&raw);
        raw
    }

    /// Serialize into `dest[..size_of::<RawHeader>()]`. `dest` must be at
    /// least one header slot (`blockSize`) long; the remainder is zeroed.
    pub fn write_to(self, dest: &mut [u8]) {
        let raw = self.to_raw();
        let bytes = bytemuck::bytes_of(&raw);
        dest[..bytes.len()].copy_from_slice(bytes);
        dest[bytes.len()..].fill(0);
    }

    /// Parse a slot's bytes, validating the magic and checksum. Returns
    /// `None` for a slot that was never written or was corrupted by a torn
    /// write — §9 "pick the header with the largest valid snapshot".
    pub fn read_from(src: &[u8]) -> Option<FileHeaderBlock> {
        if src.len() < std::mem::size_of::<RawHeader>() {
            return None;
        }
        let raw: &RawHeader = bytemuck::from_bytes(&src[..std::mem::size_of::<RawHeader>()]);
        if raw.magic != HEADER_MAGIC {
            return None;
        }
        if header_checksum(raw) != raw.checksum {
            return None;
        }
        Some(FileHeaderBlock {
            block_size: raw.block_size,
            header_block_count: raw.header_block_count,
            last_allocated_block: raw.last_allocated_block,
            snapshot_sequence_number: raw.snapshot_sequence_number,
            archive_id: raw.archive_id,
            flags: raw.flags,
        })
    }

    /// §9 "No redo log": scan every configured slot and recover the header
    /// with the largest valid `snapshotSequenceNumber`. `block_size` and
    /// `header_block_count` must already be known (from the caller's open
    /// options) since a slot may itself be unreadable.
    pub fn recover(slots: &[Vec<u8>]) -> Option<FileHeaderBlock> {
        slots
            .iter()
            .filter_map(|slot| FileHeaderBlock::read_from(slot))
            .max_by_key(|h| h.snapshot_sequence_number)
    }
}

/// §3 `BlockArguments` / result of [`BufferedFile::get_block`].
pub struct BlockArguments {
    pub position: u64,
    pub is_writing: bool,
}

pub struct BlockResult {
    pub first_position: u64,
    pub ptr: *mut u8,
    pub length: usize,
    pub supports_writing: bool,
}

unsafe impl Send for BlockResult {}

/// §4.5 `BufferedFile`.
pub struct BufferedFile {
    file: Arc<CustomFileStream>,
    cache: Arc<PageReplacementAlgorithm>,
    pool: Arc<MemoryPool>,
    header: RwLock<FileHeaderBlock>,
    committed_end: AtomicU64,
    write_buffer: RwLock<MemoryStreamCore>,
    file_structure_block_size: u64,
    /// Serializes dispose/rollback/commit so only one mutates the write
    /// buffer at a time (§5 `BufferedFile.syncRoot`).
    sync_root: Mutex<()>,
    next_snapshot_hint: AtomicU32,
}

impl BufferedFile {
    /// Open an existing file, recovering the header from whichever of the
    /// ten slots holds the largest valid snapshot sequence.
    pub fn open(
        file: Arc<CustomFileStream>,
        pool: Arc<MemoryPool>,
        cache: Arc<PageReplacementAlgorithm>,
        file_structure_block_size: u64,
        header_block_count: u8,
    ) -> Result<Self> {
        let slot_count = header_block_count as u64;
        let mut slots = Vec::with_capacity(slot_count as usize);
        for i in 0..slot_count {
            let mut buf = vec![0u8; file_structure_block_size as usize];
            file.read_raw(i * file_structure_block_size, &mut buf)?;
            slots.push(buf);
        }
        let header = FileHeaderBlock::recover(&slots)
            .ok_or(StorageError::Other("no valid header slot found on open"))?;
        let committed_end = header.committed_end();
        let write_buffer = MemoryStreamCore::new(pool.clone(), committed_end);
        Ok(Self {
            file,
            cache,
            pool,
            committed_end: AtomicU64::new(committed_end),
            header: RwLock::new(header),
            write_buffer: RwLock::new(write_buffer),
            file_structure_block_size,
            sync_root: Mutex::new(()),
            next_snapshot_hint: AtomicU32::new(header.snapshot_sequence_number.wrapping_add(1)),
        })
    }

    /// Initialize a brand-new file. Per §9's Open Question, the steady-state
    /// initializer writes header slot 0 once; [`Self::create_legacy`] is kept
    /// for bit-for-bit compatibility with the canonical (if arguably
    /// accidental) "write slot 0 repeatedly" behavior.
    pub fn create(
        file: Arc<CustomFileStream>,
        pool: Arc<MemoryPool>,
        cache: Arc<PageReplacementAlgorithm>,
        file_structure_block_size: u64,
        header_block_count: u8,
        archive_id: [u8; 16],
    ) -> Result<Self> {
        let header = FileHeaderBlock::new(
            file_structure_block_size as u32,
            header_block_count,
            archive_id,
        );
        let mut buf = vec![0u8; file_structure_block_size as usize];
        header.write_to(&mut buf);
        file.write_raw(0, &buf)?;
        file.sync()?;
        let committed_end = header.committed_end();
        let write_buffer = MemoryStreamCore::new(pool.clone(), committed_end);
        Ok(Self {
            file,
            cache,
            pool,
            committed_end: AtomicU64::new(committed_end),
            header: RwLock::new(header),
            write_buffer: RwLock::new(write_buffer),
            file_structure_block_size,
            sync_root: Mutex::new(()),
            next_snapshot_hint: AtomicU32::new(1),
        })
    }

    /// §9 Open Question, literal compatibility mode: write header slot 0
    /// `header_block_count` times in a row without advancing the target
    /// offset, exactly as the canonical new-file initializer does.
    pub fn create_legacy(
        file: Arc<CustomFileStream>,
        pool: Arc<MemoryPool>,
        cache: Arc<PageReplacementAlgorithm>,
        file_structure_block_size: u64,
        header_block_count: u8,
        archive_id: [u8; 16],
    ) -> Result<Self> {
        let header = FileHeaderBlock::new(
            file_structure_block_size as u32,
            header_block_count,
            archive_id,
        );
        let mut buf = vec![0u8; file_structure_block_size as usize];
        header.write_to(&mut buf);
        for _ in 0..header_block_count {
            file.write_raw(0, &buf)?;
        }
        file.sync()?;
        let committed_end = header.committed_end();
        let write_buffer = MemoryStreamCore::new(pool.clone(), committed_end);
        Ok(Self {
            file,
            cache,
            pool,
            committed_end: AtomicU64::new(committed_end),
            header: RwLock::new(header),
            write_buffer: RwLock::new(write_buffer),
            file_structure_block_size,
            sync_root: Mutex::new(()),
            next_snapshot_hint: AtomicU32::new(1),
        })
    }

    pub fn header(&self) -> FileHeaderBlock {
        *self.header.read().unwrap()
    }

    pub fn committed_end(&self) -> u64 {
        self.committed_end.load(Ordering::SeqCst)
    }

    pub fn header_span(&self) -> u64 {
        self.header().header_span()
    }

    pub fn new_session(self: &Arc<Self>) -> PageLock {
        self.cache.new_session()
    }

    /// §4.5 `GetBlock` semantics.
    pub fn get_block(&self, lock: &mut PageLock, args: BlockArguments) -> Result<BlockResult> {
        let committed_end = self.committed_end();
        let header_span = self.header_span();

        if args.position >= committed_end {
            let buffer = self.write_buffer.read().unwrap();
            let view = buffer.get_block(args.position)?;
            return Ok(BlockResult {
                first_position: view.first_position,
                ptr: view.ptr,
                length: view.length,
                supports_writing: true,
            });
        }

        if args.position < header_span {
            return Err(StorageError::OutOfRange {
                position: args.position,
                reason: "cannot access the header region via the block API",
            });
        }

        if args.is_writing {
            return Err(StorageError::ReadOnly);
        }

        let page_size = self.pool.page_size() as u64;
        let page_start = (args.position / page_size) * page_size;

        if let Some(ptr) = lock.try_get_sub_page(page_start)? {
            let length = ((committed_end - page_start) as usize).min(page_size as usize);
            return Ok(BlockResult {
                first_position: page_start,
                ptr: ptr as *mut u8,
                length,
                supports_writing: false,
            });
        }

        let handle = self.pool.allocate_page()?;
        let candidate_index = handle.page_index;
        let mut scratch = vec![0u8; page_size as usize];
        self.file.read(page_start, &mut scratch)?;
        unsafe {
            std::ptr::copy_nonoverlapping(scratch.as_ptr(), handle.ptr, scratch.len());
        }
        let (ptr, was_added) = lock.get_or_add_page(page_start, handle)?;
        if !was_added {
            // Lost the race with another session faulting in the same page.
            self.pool.release_page(candidate_index);
        }
        let length = ((committed_end - page_start) as usize).min(page_size as usize);
        Ok(BlockResult {
            first_position: page_start,
            ptr: ptr as *mut u8,
            length,
            supports_writing: false,
        })
    }

    /// §4.5 commit protocol: promote the write buffer's contents through
    /// `new_header.last_allocated_block` into the immutable committed
    /// region, rotate headers, fsync, and fault the new tail into the cache.
    pub fn commit(&self, mut new_header: FileHeaderBlock) -> Result<()> {
        let _guard = self.sync_root.lock().unwrap();

        let old_end = self.committed_end();
        let new_end = new_header.committed_end();
        if new_end < old_end {
            return Err(StorageError::Other(
                "commit cannot shrink the committed region",
            ));
        }
        let copy_len = new_end - old_end;

        // Step 1-2: persist the new committed tail with freshly computed
        // per-block checksums.
        if copy_len > 0 {
            let buffer = self.write_buffer.read().unwrap();
            self.file.write_from(
                old_end,
                |rel, dest| buffer.copy_to(old_end + rel, dest),
                copy_len,
                true,
            )?;
        } else {
            self.file.sync()?;
        }

        // Step 3: triplicate header rotation. Per spec.md:141, a non-canonical
        // `headerBlockCount` writes every configured slot instead of rotating
        // through slots 2-9 — exactly `header_block_count` slots, never more.
        let block_size = new_header.block_size as u64;
        let mut buf = vec![0u8; block_size as usize];
        new_header.write_to(&mut buf);
        if new_header.header_block_count == CANONICAL_HEADER_BLOCK_COUNT {
            let rotating_slot = ((new_header.snapshot_sequence_number & 7) as u64) + 2;
            self.file.write_raw(0, &buf)?;
            self.file.write_raw(block_size, &buf)?;
            self.file.write_raw(rotating_slot * block_size, &buf)?;
        } else {
            for slot in 0..new_header.header_block_count as u64 {
                self.file.write_raw(slot * block_size, &buf)?;
            }
        }

        // Step 4: fsync the header writes.
        self.file.sync()?;

        // Publication of the new header happens after fsync, behind the
        // full memory barrier `RwLock` gives us on unlock (§5).
        *self.header.write().unwrap() = new_header;

        // Step 5: fault the new tail into the cache.
        self.promote_write_buffer_to_cache(old_end, new_end)?;

        // Step 6-7: advance committed_end, install a fresh write buffer.
        self.committed_end.store(new_end, Ordering::SeqCst);
        *self.write_buffer.write().unwrap() = MemoryStreamCore::new(self.pool.clone(), new_end);

        Ok(())
    }

    fn promote_write_buffer_to_cache(&self, old_end: u64, new_end: u64) -> Result<()> {
        let page_size = self.pool.page_size() as u64;
        let buffer = self.write_buffer.read().unwrap();

        // Tail-fill the page that `old_end` straddled, if any.
        let old_page_start = (old_end / page_size) * page_size;
        if old_end % page_size != 0 {
            let mut session = self.cache.new_session();
            if let Some(ptr) = session.try_get_sub_page(old_page_start)? {
                let tail_len = (page_size - (old_end - old_page_start))
                    .min(new_end - old_end) as usize;
                let mut scratch = vec![0u8; tail_len];
                buffer.copy_to(old_end, &mut scratch)?;
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        scratch.as_ptr(),
                        (ptr as *mut u8).add((old_end - old_page_start) as usize),
                        tail_len,
                    );
                }
            }
        }

        // Every fully new page becomes a freshly-inserted cache entry.
        let mut page_start = if old_end % page_size == 0 {
            old_page_start
        } else {
            old_page_start + page_size
        };
        while page_start < new_end {
            let handle = self.pool.allocate_page()?;
            let mut scratch = vec![0u8; page_size as usize];
            let have = (new_end - page_start).min(page_size);
            buffer.copy_to(page_start, &mut scratch[..have as usize])?;
            unsafe {
                std::ptr::copy_nonoverlapping(scratch.as_ptr(), handle.ptr, scratch.len());
            }
            let page_index = handle.page_index;
            if !self.cache.try_add_page(page_start, handle)? {
                self.pool.release_page(page_index);
            }
            page_start += page_size;
        }
        Ok(())
    }

    /// §4.5 rollback: discard the write buffer, leaving the committed region
    /// and headers untouched.
    pub fn rollback(&self) {
        let _guard = self.sync_root.lock().unwrap();
        let committed_end = self.committed_end();
        *self.write_buffer.write().unwrap() = MemoryStreamCore::new(self.pool.clone(), committed_end);
    }

    /// The next snapshot sequence number a writer should use for its next
    /// commit header.
    pub fn next_snapshot_sequence_number(&self) -> u32 {
        self.header().snapshot_sequence_number.wrapping_add(1)
    }

    pub fn change_extension(&self, new_path: impl AsRef<std::path::Path>) -> Result<()> {
        self.file.change_extension(new_path)
    }

    pub fn change_share_mode(&self, read_only: bool) -> Result<()> {
        self.file.change_share_mode(read_only)
    }
}

impl CollectionSubscriber for BufferedFile {
    fn request_collection(&self, event: CollectionEvent) {
        self.cache.do_collection(event);
        if matches!(event, CollectionEvent::Critical { .. }) {
            self.cache.do_collection(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageOptions;

    fn setup(dir: &std::path::Path) -> (Arc<BufferedFile>, Arc<MemoryPool>) {
        let mut opts = StorageOptions::new();
        opts.page_size(4096).unwrap();
        opts.maximum_pool_size(Some(16 * 1024 * 1024));
        opts.file_structure_block_size(4096).unwrap();
        let pool = Arc::new(MemoryPool::new(&opts));
        let cache = PageReplacementAlgorithm::new(pool.clone());
        let path = dir.join("test.dat");
        let stream = Arc::new(CustomFileStream::open(&path, false, 4096).unwrap());
        let bf = Arc::new(
            BufferedFile::create(stream, pool.clone(), cache, 4096, 10, [7u8; 16]).unwrap(),
        );
        (bf, pool)
    }

    #[test]
    fn new_file_header_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let (bf, _pool) = setup(dir.path());
        let header = bf.header();
        assert_eq!(header.snapshot_sequence_number, 0);
        assert_eq!(header.committed_end(), bf.committed_end());
    }

    #[test]
    fn write_commit_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let (bf, _pool) = setup(dir.path());
        let old_end = bf.committed_end();

        let mut session = bf.new_session();
        let payload = vec![0x5Au8; 4096];
        {
            let block = bf
                .get_block(&mut session, BlockArguments { position: old_end, is_writing: true })
                .unwrap();
            assert!(block.supports_writing);
            unsafe {
                std::ptr::copy_nonoverlapping(payload.as_ptr(), block.ptr, payload.len());
            }
        }

        let mut new_header = bf.header();
        new_header.last_allocated_block += 1;
        new_header.snapshot_sequence_number = 1;
        bf.commit(new_header).unwrap();

        assert_eq!(bf.committed_end(), old_end + 4096);

        let mut reader = bf.new_session();
        let block = bf
            .get_block(&mut reader, BlockArguments { position: old_end, is_writing: false })
            .unwrap();
        let read_back = unsafe { std::slice::from_raw_parts(block.ptr, 4096) };
        assert_eq!(read_back, payload.as_slice());
    }

    #[test]
    fn rollback_discards_uncommitted_writes() {
        let dir = tempfile::tempdir().unwrap();
        let (bf, _pool) = setup(dir.path());
        let old_end = bf.committed_end();
        {
            let mut session = bf.new_session();
            let block = bf
                .get_block(&mut session, BlockArguments { position: old_end, is_writing: true })
                .unwrap();
            unsafe {
                std::ptr::write_bytes(block.ptr, 0xEE, 4096);
            }
        }
        bf.rollback();
        assert_eq!(bf.committed_end(), old_end);
    }

    #[test]
    fn header_region_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (bf, _pool) = setup(dir.path());
        let mut session = bf.new_session();
        let result = bf.get_block(&mut session, BlockArguments { position: 0, is_writing: false });
        assert!(matches!(result, Err(StorageError::OutOfRange { .. })));
    }
}
