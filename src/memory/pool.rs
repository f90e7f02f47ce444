use std::ptr::NonNull;

use super::central_cache::CentralCache;
use super::classes::{ALIGN, MAX_SMALL, align_up};
use super::free_list::BlockList;
use super::stats;
use super::thread_cache::ThreadCache;
use crate::sync::OnceLock;
use crate::sync::cell::UnsafeCell;

/// A complete three-tier pool instance: the central cache plus the page
/// cache it owns. Thread caches are not part of the instance; callers
/// either go through [`GlobalMemoryPool`] (which keeps one per thread in
/// TLS) or hand their own [`ThreadCache`] to `alloc_with_cache`.
///
/// Dropping a pool unmaps everything it ever obtained from the OS. The
/// global instance lives in a `OnceLock` and is reclaimed by process
/// teardown instead.
pub struct MemoryPool {
    central: CentralCache,
}

impl Default for MemoryPool {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPool {
    pub fn new() -> Self {
        Self {
            central: CentralCache::new(),
        }
    }

    /// Allocate without a thread cache: straight to the central tier.
    ///
    /// Returns a region of at least `align_up(size, ALIGN)` bytes, aligned
    /// to [`ALIGN`]. `size == 0` and out-of-memory both yield `None`.
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        let size = align_up(size, ALIGN);
        if size > MAX_SMALL {
            return self.central.allocate_large(size);
        }
        let mut batch = self.central.allocate(size, 1)?;
        batch.pop()
    }

    /// Return a region obtained from [`allocate`](Self::allocate).
    ///
    /// A null `ptr` or `size == 0` is a no-op.
    ///
    /// # Safety
    /// - A non-null `ptr` must have been returned by this pool and not yet
    ///   freed.
    /// - `size` must round up to the same size class the region was
    ///   allocated with (for large regions, to the same byte length).
    pub unsafe fn deallocate(&self, ptr: *mut u8, size: usize) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };
        if size == 0 {
            return;
        }
        let size = align_up(size, ALIGN);
        if size > MAX_SMALL {
            self.central.deallocate_large(ptr, size);
            return;
        }
        let mut list = BlockList::new();
        list.push(ptr);
        self.central.deallocate(list, size);
    }

    pub(crate) fn alloc_with_cache(
        &self,
        cache: &mut ThreadCache,
        size: usize,
    ) -> Option<NonNull<u8>> {
        cache.allocate(&self.central, size)
    }

    pub(crate) fn free_with_cache(&self, cache: &mut ThreadCache, ptr: NonNull<u8>, size: usize) {
        cache.deallocate(&self.central, ptr, size);
    }

    pub(crate) fn central(&self) -> &CentralCache {
        &self.central
    }

    /// Snapshot of the process-wide diagnostic gauges. Counters are shared
    /// across pool instances and eventually consistent; see `stats.rs`.
    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            total_mapped: stats::TOTAL_MAPPED.get(),
            page_cache_free: stats::PAGE_CACHE_FREE.get(),
            central_cached_blocks: stats::CENTRAL_CACHED_BLOCKS.get(),
            large_live: stats::LARGE_LIVE.get(),
        }
    }
}

pub struct MemoryStats {
    /// Bytes currently mapped from the OS.
    pub total_mapped: usize,
    /// Bytes parked in page-cache free runs.
    pub page_cache_free: usize,
    /// Slots parked on central free lists, all classes.
    pub central_cached_blocks: usize,
    /// Bytes of live large-object allocations.
    pub large_live: usize,
}

// ----------------------------------------------------------------------------
// Global facade
// ----------------------------------------------------------------------------

static GLOBAL_POOL: OnceLock<MemoryPool> = OnceLock::new();

thread_local! {
    static GLOBAL_THREAD_CACHE: ThreadCacheHandle = ThreadCacheHandle::new();
}

/// Per-thread handle owning the thread-local cache.
///
/// # Safety
///
/// `cache` is wrapped in `UnsafeCell` because it is only ever accessed by
/// the owning thread (via TLS). Neither `alloc_with_cache` nor
/// `free_with_cache` re-enter the TLS access point — they talk to the
/// central and page tiers directly, and so does the drop-time flush.
struct ThreadCacheHandle {
    cache: UnsafeCell<ThreadCache>,
}

// Safety: ThreadCacheHandle is confined to a single thread via thread_local!.
unsafe impl Sync for ThreadCacheHandle {}

impl ThreadCacheHandle {
    fn new() -> Self {
        Self {
            cache: UnsafeCell::new(ThreadCache::new()),
        }
    }
}

impl Drop for ThreadCacheHandle {
    fn drop(&mut self) {
        // Residual slots drain to the central cache on thread exit. The
        // global pool is 'static, so the central cache is necessarily
        // still alive here.
        let cache = crate::sync::unsafe_cell_get_mut!(self.cache);
        cache.flush(GlobalMemoryPool::instance().central());
    }
}

/// The four public operations, backed by the process-wide pool and a
/// per-thread cache. The pool is built lazily on first use.
pub struct GlobalMemoryPool;

impl GlobalMemoryPool {
    fn instance() -> &'static MemoryPool {
        GLOBAL_POOL.get_or_init(MemoryPool::new)
    }

    /// Allocate at least `align_up(size, ALIGN)` bytes, aligned to
    /// [`ALIGN`]. `size == 0` and out-of-memory both yield `None`.
    pub fn allocate(size: usize) -> Option<NonNull<u8>> {
        let pool = Self::instance();
        GLOBAL_THREAD_CACHE
            .try_with(|handle| {
                // Safety: single-threaded TLS access; no re-entrancy possible
                // (the cache talks to central/page tiers, never back to TLS).
                let cache = crate::sync::unsafe_cell_get_mut!(handle.cache);
                pool.alloc_with_cache(cache, size)
            })
            // TLS torn down (thread exit path): skip the cache tier
            .unwrap_or_else(|_| pool.allocate(size))
    }

    /// Return a region obtained from [`allocate`](Self::allocate).
    ///
    /// A null `ptr` or `size == 0` is a no-op.
    ///
    /// # Safety
    /// - A non-null `ptr` must have been returned by this pool and not yet
    ///   freed (concurrent frees of the same pointer are a double-free).
    /// - `size` must round up to the same size class the region was
    ///   allocated with (for large regions, to the same byte length).
    pub unsafe fn deallocate(ptr: *mut u8, size: usize) {
        let Some(nn) = NonNull::new(ptr) else {
            return;
        };
        let pool = Self::instance();
        let routed = GLOBAL_THREAD_CACHE.try_with(|handle| {
            // Safety: single-threaded TLS access; see allocate().
            let cache = crate::sync::unsafe_cell_get_mut!(handle.cache);
            pool.free_with_cache(cache, nn, size);
        });
        if routed.is_err() {
            // Safety: forwarded caller contract.
            unsafe { pool.deallocate(ptr, size) };
        }
    }

    /// Set this thread's recycle threshold: the per-class byte budget above
    /// which the thread cache drains half a free list to the central cache.
    /// Other threads are unaffected.
    pub fn set_recycle_threshold(bytes: usize) {
        GLOBAL_THREAD_CACHE.with(|handle| {
            // Safety: single-threaded TLS access.
            let cache = crate::sync::unsafe_cell_get_mut!(handle.cache);
            cache.set_recycle_threshold(bytes);
        });
    }

    /// Read this thread's recycle threshold.
    pub fn get_recycle_threshold() -> usize {
        GLOBAL_THREAD_CACHE.with(|handle| {
            // Safety: single-threaded TLS access.
            let cache = crate::sync::unsafe_cell_get_mut!(handle.cache);
            cache.recycle_threshold()
        })
    }

    /// Diagnostic gauge snapshot; see [`MemoryPool::stats`].
    pub fn stats() -> MemoryStats {
        Self::instance().stats()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub(crate) fn global_central() -> &'static CentralCache {
        GlobalMemoryPool::instance().central()
    }
}
