//! §4.2 `MemoryStreamCore` — the write buffer: an unbounded logical byte
//! sequence built from pool pages, addressed by logical offset.
//!
//! The teacher's copy-on-grow page-index array published under a memory
//! barrier (§9 "Version-checked concurrent index") is modeled here with a
//! `RwLock<Vec<Page>>`: growth takes the write lock once to push new pages,
//! readers take the read lock to fetch the current snapshot. No lock-free
//! crate is part of the teacher's stack, so a standard `RwLock` stands in
//! for the atomic-pointer design note.

use std::sync::{Arc, RwLock};

use crate::error::{Result, StorageError};
use crate::memory_pool::{MemoryPool, PageHandle};

struct Page {
    handle: PageHandle,
}

unsafe impl Send for Page {}
unsafe impl Sync for Page {}

/// The in-memory write buffer underlying a [`crate::buffered_file::BufferedFile`].
pub struct MemoryStreamCore {
    pool: Arc<MemoryPool>,
    pages: RwLock<Vec<Page>>,
    first_valid_position: u64,
    alignment: usize,
}

/// Result of [`MemoryStreamCore::get_block`]: a pointer into the page
/// containing the requested position, its logical start, and the usable
/// length trimmed by alignment.
pub struct BlockView {
    pub ptr: *mut u8,
    pub first_position: u64,
    pub length: usize,
}

unsafe impl Send for BlockView {}

impl MemoryStreamCore {
    /// Construct an empty write buffer aligned so that logical offset 0
    /// corresponds to `base_position` in the file.
    pub fn new(pool: Arc<MemoryPool>, base_position: u64) -> Self {
        Self {
            pool,
            pages: RwLock::new(Vec::new()),
            first_valid_position: base_position,
            alignment: 1,
        }
    }

    /// `alignment` must divide the pool's page size; reads below
    /// `first_valid_position` fail.
    pub fn configure_alignment(&mut self, first_valid_position: u64, alignment: usize) -> Result<()> {
        if self.pool.page_size() % alignment != 0 {
            return Err(StorageError::Other(
                "alignment must divide the pool's page size",
            ));
        }
        self.first_valid_position = first_valid_position;
        self.alignment = alignment;
        Ok(())
    }

    pub fn base_position(&self) -> u64 {
        self.first_valid_position
    }

    fn page_size(&self) -> usize {
        self.pool.page_size()
    }

    /// Logical length currently backed by allocated pages.
    pub fn len(&self) -> u64 {
        self.pages.read().unwrap().len() as u64 * self.page_size() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_capacity(&self, end_position: u64) -> Result<()> {
        let page_size = self.page_size() as u64;
        let needed_pages = end_position.saturating_sub(self.first_valid_position).div_ceil(page_size) as usize;
        loop {
            let have = self.pages.read().unwrap().len();
            if have >= needed_pages {
                return Ok(());
            }
            let handle = self.pool.allocate_page()?;
            let mut pages = self.pages.write().unwrap();
            if pages.len() < needed_pages {
                pages.push(Page { handle });
            } else {
                // Lost the race with another grower; return the spare page.
                self.pool.release_page(handle.page_index);
            }
        }
    }

    /// Get a pointer into the page containing `position`, auto-growing the
    /// buffer if `position` is beyond what's currently allocated.
    pub fn get_block(&self, position: u64) -> Result<BlockView> {
        if position < self.first_valid_position {
            return Err(StorageError::OutOfRange {
                position,
                reason: "below the write buffer's first valid position",
            });
        }
        let page_size = self.page_size() as u64;
        self.ensure_capacity(position + 1)?;
        let rel = position - self.first_valid_position;
        let page_idx = (rel / page_size) as usize;
        let offset_in_page = (rel % page_size) as usize;
        let pages = self.pages.read().unwrap();
        let page = &pages[page_idx];
        let first_position = self.first_valid_position + page_idx as u64 * page_size;
        let aligned_offset = offset_in_page - (offset_in_page % self.alignment);
        let ptr = unsafe { page.handle.ptr.add(aligned_offset) };
        Ok(BlockView {
            ptr,
            first_position: first_position + aligned_offset as u64,
            length: page.handle.len - aligned_offset,
        })
    }

    /// Read-only variant of [`get_block`](Self::get_block): returns a byte
    /// slice instead of a raw pointer.
    pub fn read_block(&self, position: u64) -> Result<&[u8]> {
        let view = self.get_block(position)?;
        Ok(unsafe { std::slice::from_raw_parts(view.ptr, view.length) })
    }

    /// Stream `len` bytes starting at logical `pos` into `dest`, crossing
    /// page boundaries as needed.
    pub fn copy_to(&self, pos: u64, dest: &mut [u8]) -> Result<()> {
        let mut remaining = dest.len();
        let mut src_pos = pos;
        let mut dst_off = 0usize;
        while remaining > 0 {
            let view = self.get_block(src_pos)?;
            let chunk = remaining.min(view.length);
            unsafe {
                std::ptr::copy_nonoverlapping(view.ptr, dest.as_mut_ptr().add(dst_off), chunk);
            }
            dst_off += chunk;
            src_pos += chunk as u64;
            remaining -= chunk;
        }
        Ok(())
    }

    /// Copy `src` into the write buffer starting at logical `pos`, growing
    /// as needed.
    pub fn write_from(&self, pos: u64, src: &[u8]) -> Result<()> {
        let mut remaining = src.len();
        let mut dst_pos = pos;
        let mut src_off = 0usize;
        while remaining > 0 {
            let view = self.get_block(dst_pos)?;
            let chunk = remaining.min(view.length);
            unsafe {
                std::ptr::copy_nonoverlapping(src.as_ptr().add(src_off), view.ptr, chunk);
            }
            src_off += chunk;
            dst_pos += chunk as u64;
            remaining -= chunk;
        }
        Ok(())
    }
}

impl Drop for MemoryStreamCore {
    fn drop(&mut self) {
        let pages = self.pages.get_mut().unwrap();
        let indices: Vec<u64> = pages.iter().map(|p| p.handle.page_index).collect();
        self.pool.release_pages(indices);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageOptions;

    fn pool(page_size: usize) -> Arc<MemoryPool> {
        let mut opts = StorageOptions::new();
        opts.page_size(page_size).unwrap();
        opts.maximum_pool_size(Some(10 * 1024 * 1024));
        Arc::new(MemoryPool::new(&opts))
    }

    #[test]
    fn write_then_read_back() {
        let stream = MemoryStreamCore::new(pool(4096), 0);
        let data = vec![0x42u8; 10_000];
        stream.write_from(0, &data).unwrap();
        let mut out = vec![0u8; 10_000];
        stream.copy_to(0, &mut out).unwrap();
        assert_eq!(data, out);
    }

    #[test]
    fn reads_below_base_position_fail() {
        let stream = MemoryStreamCore::new(pool(4096), 4096);
        assert!(stream.get_block(0).is_err());
        assert!(stream.get_block(4096).is_ok());
    }

    #[test]
    fn dispose_returns_pages_to_pool() {
        let p = pool(4096);
        {
            let stream = MemoryStreamCore::new(p.clone(), 0);
            stream.write_from(0, &[1u8; 4096 * 4]).unwrap();
        }
        let (used, _free) = p.accounting();
        assert_eq!(used, 0);
    }
}
