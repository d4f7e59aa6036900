//! §4.3 `PageReplacementAlgorithm` — a thread-safe cache mapping
//! *file-offset → page*, with per-session locks ([`PageLock`]) that pin
//! pages against eviction, and reference-count-shift LRU eviction driven by
//! the pool's collection signal.
//!
//! §9 "Weak registration of sessions": rather than relying on a GC-backed
//! weak-reference list (the teacher's CLR original), sessions register under
//! a stable integer id in a registry owned by the algorithm, with an
//! explicit `unregister` on [`PageLock`] drop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{Result, StorageError};
use crate::memory_pool::{CollectionEvent, CollectionSubscriber, MemoryPool, PageHandle};

/// Reference count given to a page on first insertion. A page survives one
/// collection round untouched before becoming eligible for eviction on the
/// next; this is what the teacher's "quasi-LRU" gives a freshly faulted-in
/// page over one that's aged out (§4.3).
const INITIAL_REF_COUNT: u32 = 2;

struct CachedPage {
    ptr: *mut u8,
    pool_page_index: u64,
    ref_count: u32,
}

unsafe impl Send for CachedPage {}

struct CacheInner {
    /// Keyed by `fileOffsetIndex = absolutePosition >> log2(pageSize)`.
    pages: HashMap<u64, CachedPage>,
    /// Registry of active sessions: session id -> currently-pinned file
    /// offset index, if any. Stands in for the teacher's weak-reference list
    /// of `PageLock`s (§9).
    locks: HashMap<u64, Option<u64>>,
}

/// §4.3 `PageReplacementAlgorithm`.
pub struct PageReplacementAlgorithm {
    pool: Arc<MemoryPool>,
    page_size: usize,
    inner: Mutex<CacheInner>,
    next_session_id: AtomicU64,
}

impl PageReplacementAlgorithm {
    pub fn new(pool: Arc<MemoryPool>) -> Arc<Self> {
        let page_size = pool.page_size();
        Arc::new(Self {
            pool,
            page_size,
            inner: Mutex::new(CacheInner {
                pages: HashMap::new(),
                locks: HashMap::new(),
            }),
            next_session_id: AtomicU64::new(1),
        })
    }

    fn file_offset_index(&self, absolute_position: u64) -> Result<u64> {
        if absolute_position % self.page_size as u64 != 0 {
            return Err(StorageError::OutOfRange {
                position: absolute_position,
                reason: "position must align on the page size",
            });
        }
        let max_index = ((1u64 << 31) - 1) * self.page_size as u64;
        if absolute_position > max_index {
            return Err(StorageError::OutOfRange {
                position: absolute_position,
                reason: "position exceeds the maximum cacheable offset",
            });
        }
        Ok(absolute_position / self.page_size as u64)
    }

    /// Insert a page at `absolute_position` if no cached page already owns
    /// it. Returns `false` (without taking ownership of `handle`) if another
    /// cached page already owns the position.
    pub fn try_add_page(&self, absolute_position: u64, handle: PageHandle) -> Result<bool> {
        let idx = self.file_offset_index(absolute_position)?;
        let mut inner = self.inner.lock().unwrap();
        if inner.pages.contains_key(&idx) {
            return Ok(false);
        }
        inner.pages.insert(
            idx,
            CachedPage {
                ptr: handle.ptr,
                pool_page_index: handle.page_index,
                ref_count: INITIAL_REF_COUNT,
            },
        );
        Ok(true)
    }

    /// Create a new session (`PageLock`/`IoSession`) pinning at most one
    /// cached page at a time.
    pub fn new_session(self: &Arc<Self>) -> PageLock {
        let id = self.next_session_id.fetch_add(1, Ordering::SeqCst);
        self.inner.lock().unwrap().locks.insert(id, None);
        PageLock {
            algorithm: self.clone(),
            id,
            current: None,
        }
    }

    fn unpin(&self, session_id: u64) {
        if let Some(slot) = self.inner.lock().unwrap().locks.get_mut(&session_id) {
            *slot = None;
        }
    }

    fn unregister(&self, session_id: u64) {
        self.inner.lock().unwrap().locks.remove(&session_id);
    }

    fn try_get_sub_page(&self, session_id: u64, absolute_position: u64) -> Result<Option<*const u8>> {
        let idx = self.file_offset_index(absolute_position)?;
        let mut inner = self.inner.lock().unwrap();
        let Some(page) = inner.pages.get_mut(&idx) else {
            return Ok(None);
        };
        page.ref_count = page.ref_count.saturating_add(1).min(u32::MAX);
        let ptr = page.ptr;
        if let Some(slot) = inner.locks.get_mut(&session_id) {
            *slot = Some(idx);
        }
        Ok(Some(ptr))
    }

    fn get_or_add_page(
        &self,
        session_id: u64,
        absolute_position: u64,
        handle: PageHandle,
    ) -> Result<(*const u8, bool)> {
        let idx = self.file_offset_index(absolute_position)?;
        let mut inner = self.inner.lock().unwrap();
        if let Some(page) = inner.pages.get_mut(&idx) {
            page.ref_count = page.ref_count.saturating_add(1).min(u32::MAX);
            let ptr = page.ptr;
            if let Some(slot) = inner.locks.get_mut(&session_id) {
                *slot = Some(idx);
            }
            // The caller still owns `handle` and must release it to the pool.
            return Ok((ptr, false));
        }
        let ptr = handle.ptr;
        inner.pages.insert(
            idx,
            CachedPage {
                ptr: handle.ptr,
                pool_page_index: handle.page_index,
                ref_count: INITIAL_REF_COUNT,
            },
        );
        if let Some(slot) = inner.locks.get_mut(&session_id) {
            *slot = Some(idx);
        }
        Ok((ptr, true))
    }

    /// Release every cached page not currently pinned, per §4.3.
    /// `Critical` collection shifts reference counts twice.
    pub fn do_collection(&self, event: CollectionEvent) {
        let mut inner = self.inner.lock().unwrap();
        let pinned: std::collections::HashSet<u64> =
            inner.locks.values().filter_map(|v| *v).collect();
        let passes = match event {
            CollectionEvent::Critical { .. } => 2,
            _ => 1,
        };
        let mut to_release = Vec::new();
        for _ in 0..passes {
            let mut evicted = Vec::new();
            for (idx, page) in inner.pages.iter_mut() {
                if pinned.contains(idx) {
                    continue;
                }
                page.ref_count >>= 1;
                if page.ref_count == 0 {
                    evicted.push(*idx);
                }
            }
            for idx in evicted {
                if let Some(page) = inner.pages.remove(&idx) {
                    to_release.push(page.pool_page_index);
                }
            }
        }
        drop(inner);
        if !to_release.is_empty() {
            log::debug!("page cache evicting {} pages", to_release.len());
            self.pool.release_pages(to_release);
        }
    }

    pub fn cached_page_count(&self) -> usize {
        self.inner.lock().unwrap().pages.len()
    }
}

impl CollectionSubscriber for PageReplacementAlgorithm {
    fn request_collection(&self, event: CollectionEvent) {
        self.do_collection(event);
    }
}

/// §4.3 `PageLock` / I/O session: a handle pinning at most one cached page.
/// State machine: Idle -> Pinned via a successful lookup/insert; Pinned ->
/// Idle via [`PageLock::clear`] or re-pinning a different position; any ->
/// Disposed on drop, which unregisters the session from the algorithm.
pub struct PageLock {
    algorithm: Arc<PageReplacementAlgorithm>,
    id: u64,
    current: Option<u64>,
}

impl PageLock {
    /// Look up `absolute_position` in the cache without inserting.
    pub fn try_get_sub_page(&mut self, absolute_position: u64) -> Result<Option<*const u8>> {
        let result = self.algorithm.try_get_sub_page(self.id, absolute_position)?;
        if result.is_some() {
            self.current = Some(absolute_position / self.algorithm.page_size as u64);
        }
        Ok(result)
    }

    /// Race-safe insert-or-get. If the page was already cached, `was_added`
    /// is `false` and the caller must release `handle` back to the pool.
    pub fn get_or_add_page(
        &mut self,
        absolute_position: u64,
        handle: PageHandle,
    ) -> Result<(*const u8, bool)> {
        let (ptr, was_added) = self
            .algorithm
            .get_or_add_page(self.id, absolute_position, handle)?;
        self.current = Some(absolute_position / self.algorithm.page_size as u64);
        Ok((ptr, was_added))
    }

    /// Unpin the currently-held page, returning to the idle state.
    pub fn clear(&mut self) {
        self.algorithm.unpin(self.id);
        self.current = None;
    }

    pub fn is_pinned(&self) -> bool {
        self.current.is_some()
    }
}

impl Drop for PageLock {
    fn drop(&mut self) {
        self.algorithm.unregister(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageOptions;

    fn pool() -> Arc<MemoryPool> {
        let mut opts = StorageOptions::new();
        opts.page_size(4096).unwrap();
        opts.maximum_pool_size(Some(10 * 1024 * 1024));
        Arc::new(MemoryPool::new(&opts))
    }

    #[test]
    fn insert_then_hit_via_another_session() {
        let pool = pool();
        let algo = PageReplacementAlgorithm::new(pool.clone());
        let mut writer = algo.new_session();
        let handle = pool.allocate_page().unwrap();
        let (ptr1, added) = writer.get_or_add_page(4096, handle).unwrap();
        assert!(added);

        let mut reader = algo.new_session();
        let ptr2 = reader.try_get_sub_page(4096).unwrap().unwrap();
        assert_eq!(ptr1, ptr2);
    }

    #[test]
    fn collision_returns_false_and_caller_must_release() {
        let pool = pool();
        let algo = PageReplacementAlgorithm::new(pool.clone());
        let mut s1 = algo.new_session();
        let h1 = pool.allocate_page().unwrap();
        s1.get_or_add_page(8192, h1).unwrap();

        let mut s2 = algo.new_session();
        let h2 = pool.allocate_page().unwrap();
        let h2_index = h2.page_index;
        let (_ptr, added) = s2.get_or_add_page(8192, h2).unwrap();
        assert!(!added);
        pool.release_page(h2_index);
    }

    #[test]
    fn collection_evicts_unpinned_pages() {
        let pool = pool();
        let algo = PageReplacementAlgorithm::new(pool.clone());
        {
            let mut writer = algo.new_session();
            let h = pool.allocate_page().unwrap();
            writer.get_or_add_page(4096, h).unwrap();
            writer.clear();
        }
        assert_eq!(algo.cached_page_count(), 1);
        algo.do_collection(CollectionEvent::Normal);
        assert_eq!(algo.cached_page_count(), 1, "refcount shifted from 1 to 0, still present until next collection pass");
        algo.do_collection(CollectionEvent::Normal);
        assert_eq!(algo.cached_page_count(), 0);
    }

    #[test]
    fn pinned_page_survives_collection() {
        let pool = pool();
        let algo = PageReplacementAlgorithm::new(pool.clone());
        let mut session = algo.new_session();
        let h = pool.allocate_page().unwrap();
        session.get_or_add_page(4096, h).unwrap();
        algo.do_collection(CollectionEvent::Critical { target_pages: 10 });
        algo.do_collection(CollectionEvent::Critical { target_pages: 10 });
        assert_eq!(algo.cached_page_count(), 1);
    }
}
