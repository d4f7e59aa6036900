//! §4.1 `MemoryPool` — arena allocator of fixed-size pages with best-effort
//! capacity management and a collection-broadcast eviction protocol.
//!
//! Pages are carved out of `MemoryBlock`s (plain heap allocations, never
//! mmap'd — this storage core talks to the OS file through `CustomFileStream`
//! with `pread`/`pwrite`, not through a memory map, so the teacher's
//! `memmap2`-backed arena is replaced by a boxed-slice arena here).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::config::{StorageOptions, UtilizationLevel, UtilizationThresholds};
use crate::error::{Result, StorageError};

/// Escalation level of a collection broadcast (§4.1, §9 glossary).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionEvent {
    Normal,
    Emergency { target_pages: u64 },
    Critical { target_pages: u64 },
}

/// A subscriber to pool collection broadcasts. Implementors must release
/// unused pages when invoked, and must not call back into
/// [`MemoryPool::allocate_page`] from within `request_collection` — doing so
/// deadlocks on `syncAllocate` (see §5).
pub trait CollectionSubscriber: Send + Sync {
    fn request_collection(&self, event: CollectionEvent);
}

/// One OS-level allocation holding an integer number of pages.
struct MemoryBlock {
    data: Box<[u8]>,
    page_count: usize,
}

impl MemoryBlock {
    fn new(page_count: usize, page_size: usize) -> Self {
        Self {
            data: vec![0u8; page_count * page_size].into_boxed_slice(),
            page_count,
        }
    }

    fn page_ptr(&mut self, local_index: usize, page_size: usize) -> *mut u8 {
        unsafe { self.data.as_mut_ptr().add(local_index * page_size) }
    }
}

struct PoolInner {
    blocks: Vec<MemoryBlock>,
    /// Parallel to `blocks`: `free[i]` is a per-page free bitmap for `blocks[i]`.
    free: Vec<Vec<bool>>,
    maximum_pool_size: u64,
    utilization_level: UtilizationLevel,
    thresholds: UtilizationThresholds,
}

impl PoolInner {
    fn capacity_bytes(&self, page_size: usize) -> u64 {
        self.blocks.iter().map(|b| b.page_count as u64).sum::<u64>() * page_size as u64
    }

    fn free_bytes(&self, page_size: usize) -> u64 {
        self.free
            .iter()
            .flat_map(|f| f.iter())
            .filter(|free| **free)
            .count() as u64
            * page_size as u64
    }

    /// Lock-free-from-the-caller's-perspective take: scan for any free page.
    fn try_take(&mut self) -> Option<(u64, usize, usize)> {
        let mut global = 0u64;
        for (block_idx, free) in self.free.iter_mut().enumerate() {
            for (local_idx, slot) in free.iter_mut().enumerate() {
                if *slot {
                    *slot = false;
                    return Some((global + local_idx as u64, block_idx, local_idx));
                }
            }
            global += free.len() as u64;
        }
        None
    }

    fn page_index_to_location(&self, page_index: u64) -> Option<(usize, usize)> {
        let mut global = 0u64;
        for (block_idx, block) in self.blocks.iter().enumerate() {
            let end = global + block.page_count as u64;
            if page_index < end {
                return Some((block_idx, (page_index - global) as usize));
            }
            global = end;
        }
        None
    }

    /// Collection level 0..=5 derived from current free space, per §4.1.
    fn collection_level(&self, page_size: usize) -> u8 {
        let free = self.free_bytes(page_size) as f64;
        let t = &self.thresholds;
        if free < t.none {
            5
        } else if free < t.low {
            4
        } else if free < t.normal {
            3
        } else if free < t.high {
            2
        } else if free < t.very_high {
            1
        } else {
            0
        }
    }
}

/// §4.1 `MemoryPool`. Supplies fixed-size pages with best-effort capacity
/// management, shared across multiple storage instances.
pub struct MemoryPool {
    inner: Mutex<PoolInner>,
    /// Serializes allocations that need to grow the pool (`syncAllocate`).
    allocate_mutex: Mutex<()>,
    page_size: usize,
    pages_per_memory_block: usize,
    release_page_version: AtomicU64,
    subscribers: Mutex<Vec<Weak<dyn CollectionSubscriber>>>,
}

/// A handle to a single page allocated from a [`MemoryPool`].
///
/// # Safety
/// The pointer is valid for `page_size` bytes for as long as the page has
/// not been released back to the pool via [`MemoryPool::release_page`]. It
/// is the caller's responsibility not to retain the pointer past release.
pub struct PageHandle {
    pub page_index: u64,
    pub ptr: *mut u8,
    pub len: usize,
}

unsafe impl Send for PageHandle {}

impl MemoryPool {
    /// Construct a pool from the given options. Maximum size is resolved
    /// from system memory if not explicitly set (§4.1).
    pub fn new(options: &StorageOptions) -> Self {
        let maximum_pool_size = options.resolve_maximum_pool_size();
        let page_size = options.page_size_get();
        let utilization_level = options.utilization_level_get();
        let thresholds = utilization_level.thresholds(maximum_pool_size);
        // Pages per block chosen so a block is a few MiB, never above the pool max.
        let pages_per_memory_block = (4 * 1024 * 1024 / page_size).max(1);
        Self {
            inner: Mutex::new(PoolInner {
                blocks: Vec::new(),
                free: Vec::new(),
                maximum_pool_size,
                utilization_level,
                thresholds,
            }),
            allocate_mutex: Mutex::new(()),
            page_size,
            pages_per_memory_block,
            release_page_version: AtomicU64::new(0),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn release_page_version(&self) -> u64 {
        self.release_page_version.load(Ordering::SeqCst)
    }

    pub fn maximum_pool_size(&self) -> u64 {
        self.inner.lock().unwrap().maximum_pool_size
    }

    /// Register a collection subscriber. The pool holds only a weak
    /// reference; a dropped subscriber is silently skipped on broadcast.
    pub fn register_subscriber(&self, subscriber: &Arc<dyn CollectionSubscriber>) {
        self.subscribers.lock().unwrap().push(Arc::downgrade(subscriber));
    }

    fn broadcast(&self, event: CollectionEvent) {
        log::debug!("memory pool collection broadcast: {:?}", event);
        let mut subs = self.subscribers.lock().unwrap();
        subs.retain(|weak| {
            if let Some(sub) = weak.upgrade() {
                sub.request_collection(event);
                true
            } else {
                false
            }
        });
    }

    /// §4.1 allocation algorithm.
    pub fn allocate_page(&self) -> Result<PageHandle> {
        loop {
            // Step 1: lock-free-from-caller's-perspective take.
            if let Some(handle) = self.try_take_and_ptr() {
                return Ok(handle);
            }

            // Step 2: acquire the allocate mutex, re-attempt.
            let _guard = self.allocate_mutex.lock().unwrap();
            if let Some(handle) = self.try_take_and_ptr() {
                return Ok(handle);
            }

            let version = self.release_page_version.load(Ordering::SeqCst);

            // Step 3: a normal collection round, then recompute thresholds.
            self.broadcast(CollectionEvent::Normal);
            self.recompute_thresholds();

            // Step 4: escalate to emergency/critical if still critically low.
            let (free, maximum) = {
                let inner = self.inner.lock().unwrap();
                (inner.free_bytes(self.page_size), inner.maximum_pool_size)
            };
            let five_percent = (maximum as f64 * 0.05) as u64;
            if free < five_percent {
                let target_pages = (five_percent - free) / self.page_size as u64;
                self.broadcast(CollectionEvent::Emergency { target_pages });
                let free_after = self.inner.lock().unwrap().free_bytes(self.page_size);
                if free_after < five_percent {
                    let residual = (five_percent - free_after) / self.page_size as u64;
                    self.broadcast(CollectionEvent::Critical {
                        target_pages: residual,
                    });
                }
            }

            // Step 5: grow by up to 10% of maximum if below ceiling.
            self.try_grow()?;

            // Step 6: final attempt.
            if let Some(handle) = self.try_take_and_ptr() {
                return Ok(handle);
            }
            if self.release_page_version.load(Ordering::SeqCst) == version {
                return Err(StorageError::OutOfMemory);
            }
            // Otherwise progress was made elsewhere; loop and retry.
        }
    }

    fn try_take_and_ptr(&self) -> Option<PageHandle> {
        let mut inner = self.inner.lock().unwrap();
        let (page_index, block_idx, local_idx) = inner.try_take()?;
        let page_size = self.page_size;
        let ptr = inner.blocks[block_idx].page_ptr(local_idx, page_size);
        Some(PageHandle {
            page_index,
            ptr,
            len: page_size,
        })
    }

    fn recompute_thresholds(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.thresholds = inner.utilization_level.thresholds(inner.maximum_pool_size);
    }

    /// Grow the pool by up to 10% of `maximum_pool_size`, capped at the
    /// ceiling. No-op if already at or above the ceiling.
    fn try_grow(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let current = inner.capacity_bytes(self.page_size);
        if current >= inner.maximum_pool_size {
            return Ok(());
        }
        let max_growth = ((inner.maximum_pool_size as f64) * 0.10) as u64;
        let room = inner.maximum_pool_size - current;
        let growth = max_growth.min(room).max(self.page_size as u64 * self.pages_per_memory_block as u64).min(room);
        if growth == 0 {
            return Ok(());
        }
        let pages = (growth as usize / self.page_size).max(1);
        let block = MemoryBlock::new(pages, self.page_size);
        inner.free.push(vec![true; pages]);
        inner.blocks.push(block);
        Ok(())
    }

    /// Idempotent by contract; callers must not double-release the same
    /// page index concurrently.
    pub fn release_page(&self, page_index: u64) {
        self.release_pages(std::iter::once(page_index));
    }

    /// Bulk release with a single version bump.
    pub fn release_pages(&self, pages: impl IntoIterator<Item = u64>) {
        let mut inner = self.inner.lock().unwrap();
        let mut any = false;
        for page_index in pages {
            if let Some((block_idx, local_idx)) = inner.page_index_to_location(page_index) {
                inner.free[block_idx][local_idx] = true;
                any = true;
            }
        }
        drop(inner);
        if any {
            self.release_page_version.fetch_add(1, Ordering::SeqCst);
            self.shrink_if_possible();
        }
    }

    /// §4.1 shrink policy: release wholly-free blocks back to the OS once
    /// capacity sits comfortably above the stop-shrink limit.
    fn shrink_if_possible(&self) {
        let mut inner = self.inner.lock().unwrap();
        let stop_shrink = (inner.maximum_pool_size as f64 * 0.85)
            .max(inner.maximum_pool_size as f64 * 0.05) as u64;
        let capacity = inner.capacity_bytes(self.page_size);
        if capacity <= stop_shrink {
            return;
        }
        let mut keep_blocks = Vec::new();
        let mut keep_free = Vec::new();
        for (block, free) in inner.blocks.drain(..).zip(inner.free.drain(..)) {
            if free.iter().all(|f| *f) {
                log::debug!("memory pool releasing a fully-free block back to the OS");
                drop(block);
            } else {
                keep_blocks.push(block);
                keep_free.push(free);
            }
        }
        inner.blocks = keep_blocks;
        inner.free = keep_free;
    }

    pub fn set_maximum_pool_size(&self, bytes: u64) -> u64 {
        let ceiling = crate::config::pool_ceiling_from_system_memory();
        let clamped = bytes.clamp(crate::config::MINIMUM_POOL_FLOOR, ceiling.max(crate::config::MINIMUM_POOL_FLOOR));
        let mut inner = self.inner.lock().unwrap();
        inner.maximum_pool_size = clamped;
        inner.thresholds = inner.utilization_level.thresholds(clamped);
        clamped
    }

    pub fn set_target_utilization_level(&self, level: UtilizationLevel) {
        let mut inner = self.inner.lock().unwrap();
        inner.utilization_level = level;
        inner.thresholds = level.thresholds(inner.maximum_pool_size);
    }

    /// In-use + free bytes, for the invariant in §8.
    pub fn accounting(&self) -> (u64, u64) {
        let inner = self.inner.lock().unwrap();
        let capacity = inner.capacity_bytes(self.page_size);
        let free = inner.free_bytes(self.page_size);
        (capacity - free, free)
    }

    pub fn collection_level(&self) -> u8 {
        self.inner.lock().unwrap().collection_level(self.page_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn options(page_size: usize, max_pool: u64) -> StorageOptions {
        let mut opts = StorageOptions::new();
        opts.page_size(page_size).unwrap();
        opts.maximum_pool_size(Some(max_pool));
        opts
    }

    #[test]
    fn allocate_and_release_roundtrip() {
        let pool = MemoryPool::new(&options(4096, MINIMUM_POOL_FLOOR_TEST));
        let page = pool.allocate_page().unwrap();
        let (used, free) = pool.accounting();
        assert!(used >= 4096);
        pool.release_page(page.page_index);
        let (used2, _free2) = pool.accounting();
        assert!(used2 < used);
        let _ = free;
    }

    const MINIMUM_POOL_FLOOR_TEST: u64 = 10 * 1024 * 1024;

    #[test]
    fn distinct_pages_get_distinct_indices() {
        let pool = MemoryPool::new(&options(4096, MINIMUM_POOL_FLOOR_TEST));
        let a = pool.allocate_page().unwrap();
        let b = pool.allocate_page().unwrap();
        assert_ne!(a.page_index, b.page_index);
    }

    #[test]
    fn oom_after_drain_with_no_subscribers() {
        let pool = MemoryPool::new(&options(4096, MINIMUM_POOL_FLOOR_TEST));
        let mut held = Vec::new();
        let version_before = pool.release_page_version();
        loop {
            match pool.allocate_page() {
                Ok(p) => held.push(p),
                Err(StorageError::OutOfMemory) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
            if held.len() > 1_000_000 {
                panic!("allocator did not report OOM");
            }
        }
        // No subscribers means no pages were ever released during collection.
        assert_eq!(pool.release_page_version(), version_before);
        let _ = AtomicUsize::new(0);
    }
}
