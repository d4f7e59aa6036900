//! §4.6 `DiskIo` / `DiskIoSession` — typed, checksum-validated block access
//! layered over [`crate::buffered_file::BlockArguments`]'s raw pointer API.
//!
//! §9 "Unmanaged buffers and pointer arithmetic": the block API is exposed
//! here as a borrow scoped to the session, invalidated by [`DiskIoSession::clear`],
//! a fresh read/write call at a different block, or the session's own drop.
//! The footer region is never exposed; every payload is trimmed to
//! `blockSize - 32`.

use std::sync::Arc;

use crate::buffered_file::{BlockArguments, FileHeaderBlock};
use crate::disk_medium::{DiskMedium, MediumLock};
use crate::error::{Result, StorageError};
use crate::footer::{Footer, FOOTER_SIZE};

/// §4.6 `DiskIo`: the per-file handle consumers open sessions against.
pub struct DiskIo {
    medium: Arc<DiskMedium>,
    block_size: u64,
    file_id_number: u16,
}

impl DiskIo {
    pub fn new(medium: Arc<DiskMedium>, block_size: u64, file_id_number: u16) -> Self {
        Self {
            medium,
            block_size,
            file_id_number,
        }
    }

    pub fn header(&self) -> FileHeaderBlock {
        self.medium.header()
    }

    pub fn commit(&self, header: FileHeaderBlock) -> Result<()> {
        self.medium.commit(header)
    }

    pub fn rollback(&self) {
        self.medium.rollback()
    }

    pub fn change_extension(&self, new_path: impl AsRef<std::path::Path>) -> Result<()> {
        self.medium.change_extension(new_path)
    }

    pub fn change_share_mode(&self, read_only: bool) -> Result<()> {
        self.medium.change_share_mode(read_only)
    }

    /// Open a session bound to `snapshot` (a reader's isolation point, or a
    /// writer's in-progress snapshot). §5: readers bound to an old snapshot
    /// keep observing it even as the writer commits a newer one.
    pub fn create_session(&self, read_only: bool, snapshot: u32) -> DiskIoSession {
        DiskIoSession {
            medium: self.medium.clone(),
            lock: self.medium.new_lock(),
            block_size: self.block_size,
            file_id_number: self.file_id_number,
            current_snapshot: snapshot,
            read_only,
            cached_first_position: None,
            cached_ptr: std::ptr::null_mut(),
            cached_length: 0,
            cached_supports_writing: false,
            lookup: 0,
            cached_lookup: 0,
        }
    }
}

/// §4.6 `DiskIoSession`.
pub struct DiskIoSession {
    medium: Arc<DiskMedium>,
    lock: MediumLock,
    block_size: u64,
    file_id_number: u16,
    current_snapshot: u32,
    read_only: bool,
    cached_first_position: Option<u64>,
    cached_ptr: *mut u8,
    cached_length: usize,
    cached_supports_writing: bool,
    /// Count of calls that required a fresh lookup through the medium.
    pub lookup: u64,
    /// Count of calls satisfied by the session's already-pinned range.
    pub cached_lookup: u64,
}

unsafe impl Send for DiskIoSession {}

impl DiskIoSession {
    fn ensure_range(&mut self, position: u64, is_writing: bool) -> Result<()> {
        if let Some(first) = self.cached_first_position {
            let covers = position >= first
                && position + self.block_size <= first + self.cached_length as u64;
            if covers && (!is_writing || self.cached_supports_writing) {
                self.cached_lookup += 1;
                return Ok(());
            }
        }
        self.lookup += 1;
        let block = self.medium.get_block(
            &mut self.lock,
            BlockArguments {
                position,
                is_writing,
            },
        )?;
        self.cached_first_position = Some(block.first_position);
        self.cached_ptr = block.ptr;
        self.cached_length = block.length;
        self.cached_supports_writing = block.supports_writing;
        Ok(())
    }

    fn block_ptr(&self, position: u64) -> *mut u8 {
        let first = self.cached_first_position.expect("ensure_range must run first");
        unsafe { self.cached_ptr.add((position - first) as usize) }
    }

    fn validate_footer(
        &self,
        block: &[u8],
        block_index: u64,
        expected_type: u8,
        expected_index: u32,
        strict_snapshot: bool,
    ) -> Result<()> {
        let footer = Footer::read(block);
        if footer.state == crate::footer::ChecksumState::NotValid {
            return Err(StorageError::ChecksumInvalid {
                block_index,
            });
        }
        if footer.block_type != expected_type {
            return Err(StorageError::BlockTypeMismatch {
                block_index,
                expected: expected_type,
                actual: footer.block_type,
            });
        }
        if footer.index_value != expected_index {
            return Err(StorageError::IndexNumberMismatch {
                block_index,
                expected: expected_index,
                actual: footer.index_value,
            });
        }
        let too_new = if strict_snapshot {
            footer.snapshot_sequence >= self.current_snapshot
        } else {
            footer.snapshot_sequence > self.current_snapshot
        };
        if too_new {
            return Err(StorageError::PageNewerThanSnapshot {
                block_index,
                current: self.current_snapshot,
                actual: footer.snapshot_sequence,
            });
        }
        if footer.file_id != self.file_id_number {
            return Err(StorageError::FileIdMismatch {
                block_index,
                expected: self.file_id_number,
                actual: footer.file_id,
            });
        }
        Ok(())
    }

    fn payload_len(&self) -> usize {
        self.block_size as usize - FOOTER_SIZE
    }

    /// Read `block_index`, validating its footer against `expected_type`/
    /// `expected_index` and the session's snapshot.
    pub fn read(&mut self, block_index: u64, expected_type: u8, expected_index: u32) -> Result<&[u8]> {
        let position = block_index * self.block_size;
        self.ensure_range(position, false)?;
        let ptr = self.block_ptr(position);
        let block_size = self.block_size as usize;
        let block = unsafe { std::slice::from_raw_parts(ptr, block_size) };
        self.validate_footer(block, block_index, expected_type, expected_index, false)?;
        Ok(&block[..self.payload_len()])
    }

    /// Like [`Self::read`] but requires the block's snapshot to be strictly
    /// older than the session's.
    pub fn read_old(&mut self, block_index: u64, expected_type: u8, expected_index: u32) -> Result<&[u8]> {
        let position = block_index * self.block_size;
        self.ensure_range(position, false)?;
        let ptr = self.block_ptr(position);
        let block_size = self.block_size as usize;
        let block = unsafe { std::slice::from_raw_parts(ptr, block_size) };
        self.validate_footer(block, block_index, expected_type, expected_index, true)?;
        Ok(&block[..self.payload_len()])
    }

    /// Write to a block that already exists at the session's current
    /// snapshot, validating its footer with strict equality first.
    pub fn write_to_existing_block(
        &mut self,
        block_index: u64,
        expected_type: u8,
        expected_index: u32,
    ) -> Result<&mut [u8]> {
        if self.read_only {
            return Err(StorageError::ReadOnly);
        }
        if block_index <= 10 {
            return Err(StorageError::OutOfRange {
                position: block_index * self.block_size,
                reason: "cannot write to a reserved header block",
            });
        }
        let position = block_index * self.block_size;
        self.ensure_range(position, true)?;
        let ptr = self.block_ptr(position);
        let block_size = self.block_size as usize;
        let block = unsafe { std::slice::from_raw_parts(ptr, block_size) };
        let footer = Footer::read(block);
        if footer.state == crate::footer::ChecksumState::NotValid {
            return Err(StorageError::ChecksumInvalid { block_index });
        }
        if footer.block_type != expected_type {
            return Err(StorageError::BlockTypeMismatch {
                block_index,
                expected: expected_type,
                actual: footer.block_type,
            });
        }
        if footer.index_value != expected_index {
            return Err(StorageError::IndexNumberMismatch {
                block_index,
                expected: expected_index,
                actual: footer.index_value,
            });
        }
        if footer.snapshot_sequence != self.current_snapshot {
            return Err(StorageError::PageNewerThanSnapshot {
                block_index,
                current: self.current_snapshot,
                actual: footer.snapshot_sequence,
            });
        }
        let payload_len = self.payload_len();
        let block_mut = unsafe { std::slice::from_raw_parts_mut(ptr, block_size) };
        Ok(&mut block_mut[..payload_len])
    }

    /// Write to a block index that has no prior valid content: clears the
    /// footer and writes fresh identity fields with `MustBeRecomputed`,
    /// skipping validation entirely.
    pub fn write_to_new_block(
        &mut self,
        block_index: u64,
        block_type: u8,
        index_value: u32,
    ) -> Result<&mut [u8]> {
        if self.read_only {
            return Err(StorageError::ReadOnly);
        }
        let position = block_index * self.block_size;
        self.ensure_range(position, true)?;
        let ptr = self.block_ptr(position);
        let block_size = self.block_size as usize;
        let block_mut = unsafe { std::slice::from_raw_parts_mut(ptr, block_size) };
        Footer::write_identity(
            block_mut,
            block_type,
            self.file_id_number,
            index_value,
            self.current_snapshot,
        );
        let payload_len = self.payload_len();
        Ok(&mut block_mut[..payload_len])
    }

    /// Compute and store the checksum for whichever block is currently
    /// pinned. Call after writing a payload via [`Self::write_to_new_block`]
    /// or [`Self::write_to_existing_block`].
    pub fn finish_write(&mut self, block_index: u64) {
        let position = block_index * self.block_size;
        let Some(first) = self.cached_first_position else {
            return;
        };
        if position < first || position + self.block_size > first + self.cached_length as u64 {
            return;
        }
        let ptr = self.block_ptr(position);
        let block_size = self.block_size as usize;
        let block_mut = unsafe { std::slice::from_raw_parts_mut(ptr, block_size) };
        crate::footer::compute_checksum(block_mut);
    }

    /// Invalidate the cached pinned range and release the session's pin.
    pub fn clear(&mut self) {
        self.cached_first_position = None;
        self.cached_ptr = std::ptr::null_mut();
        self.cached_length = 0;
        if let MediumLock::File(page_lock) = &mut self.lock {
            page_lock.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffered_file::BufferedFile;
    use crate::config::StorageOptions;
    use crate::file_stream::CustomFileStream;
    use crate::memory_pool::MemoryPool;
    use crate::page_cache::PageReplacementAlgorithm;
    use std::sync::Arc;

    fn make_disk_io(dir: &std::path::Path) -> DiskIo {
        let mut opts = StorageOptions::new();
        opts.page_size(4096).unwrap();
        opts.maximum_pool_size(Some(16 * 1024 * 1024));
        opts.file_structure_block_size(4096).unwrap();
        let pool = Arc::new(MemoryPool::new(&opts));
        let cache = PageReplacementAlgorithm::new(pool.clone());
        let path = dir.join("disk_io.dat");
        let stream = Arc::new(CustomFileStream::open(&path, false, 4096).unwrap());
        let bf = Arc::new(
            BufferedFile::create(stream, pool, cache, 4096, 10, [1u8; 16]).unwrap(),
        );
        DiskIo::new(Arc::new(DiskMedium::File(bf)), 4096, 1)
    }

    #[test]
    fn write_new_block_then_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let disk_io = make_disk_io(dir.path());
        let old_end = disk_io.header().committed_end();
        let block_index = old_end / 4096;

        let mut writer = disk_io.create_session(false, 1);
        {
            let payload = writer.write_to_new_block(block_index, 1, 0).unwrap();
            payload.fill(0x11);
        }
        writer.finish_write(block_index);

        let mut header = disk_io.header();
        header.last_allocated_block = block_index as u32;
        header.snapshot_sequence_number = 1;
        disk_io.commit(header).unwrap();

        let mut reader = disk_io.create_session(true, 1);
        let data = reader.read(block_index, 1, 0).unwrap();
        assert!(data.iter().all(|b| *b == 0x11));
    }

    #[test]
    fn block_type_mismatch_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let disk_io = make_disk_io(dir.path());
        let old_end = disk_io.header().committed_end();
        let block_index = old_end / 4096;

        let mut writer = disk_io.create_session(false, 1);
        writer.write_to_new_block(block_index, 1, 0).unwrap().fill(0x22);
        writer.finish_write(block_index);
        let mut header = disk_io.header();
        header.last_allocated_block = block_index as u32;
        header.snapshot_sequence_number = 1;
        disk_io.commit(header).unwrap();

        let mut reader = disk_io.create_session(true, 1);
        let result = reader.read(block_index, 2, 0);
        assert!(matches!(result, Err(StorageError::BlockTypeMismatch { .. })));
    }

    #[test]
    fn repeated_read_of_same_block_hits_the_cached_range() {
        let dir = tempfile::tempdir().unwrap();
        let disk_io = make_disk_io(dir.path());
        let old_end = disk_io.header().committed_end();
        let block_index = old_end / 4096;

        let mut writer = disk_io.create_session(false, 1);
        writer.write_to_new_block(block_index, 1, 0).unwrap().fill(0x33);
        writer.finish_write(block_index);
        let mut header = disk_io.header();
        header.last_allocated_block = block_index as u32;
        header.snapshot_sequence_number = 1;
        disk_io.commit(header).unwrap();

        let mut reader = disk_io.create_session(true, 1);
        assert_eq!(reader.lookup, 0);
        assert_eq!(reader.cached_lookup, 0);

        let first = reader.read(block_index, 1, 0).unwrap().as_ptr();
        assert_eq!(reader.lookup, 1);
        assert_eq!(reader.cached_lookup, 0);

        let second = reader.read(block_index, 1, 0).unwrap().as_ptr();
        assert_eq!(reader.lookup, 1, "second read of the same block must not re-lookup");
        assert_eq!(reader.cached_lookup, 1);
        assert_eq!(first, second);

        // A different session reading the same block shares the same
        // underlying cached page (pointer equality across sessions).
        let mut other_reader = disk_io.create_session(true, 1);
        let third = other_reader.read(block_index, 1, 0).unwrap().as_ptr();
        assert_eq!(first, third);
    }
}
