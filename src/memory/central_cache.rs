use std::collections::BTreeMap;
use std::ptr::NonNull;

use super::classes::{ALIGN, MAX_SMALL, MAX_UNITS, NUM_CLASSES, size_class_of, span_pages};
use super::free_list::BlockList;
use super::page_cache::PageCache;
use super::span::PageSpan;
use super::stats;
use crate::sync::Mutex;
use crate::sync::atomic::{AtomicBool, Ordering};
use crate::sync::cell::UnsafeCell;
use crate::sync::thread;

/// Per-class shared state: slots ready to hand out, plus the registry of
/// spans currently carved for this class, keyed by base address so a slot
/// pointer maps to its owning span in logarithmic time.
struct ClassShard {
    free: BlockList,
    spans: BTreeMap<usize, PageSpan>,
}

/// Test-and-set spin flag guarding one class shard.
///
/// Critical sections are short: pointer splicing plus map updates. Most
/// allocations never reach this tier at all. Distinct classes never
/// contend.
struct ClassLock {
    flag: AtomicBool,
    shard: UnsafeCell<ClassShard>,
}

// Safety: the shard is only reachable through lock(), which enforces
// mutual exclusion via the flag.
unsafe impl Send for ClassLock {}
unsafe impl Sync for ClassLock {}

impl ClassLock {
    fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
            shard: UnsafeCell::new(ClassShard {
                free: BlockList::new(),
                spans: BTreeMap::new(),
            }),
        }
    }

    fn lock(&self) -> ClassGuard<'_> {
        while self.flag.swap(true, Ordering::Acquire) {
            thread::yield_now();
        }
        ClassGuard { lock: self }
    }
}

/// RAII guard: the flag clears on drop, so an unwinding refill cannot
/// leave a class locked.
struct ClassGuard<'a> {
    lock: &'a ClassLock,
}

impl ClassGuard<'_> {
    fn shard(&mut self) -> &mut ClassShard {
        // Safety: holding the guard means the flag is set and no other
        // thread can reach the shard.
        crate::sync::unsafe_cell_get_mut!(self.lock.shard)
    }
}

impl Drop for ClassGuard<'_> {
    fn drop(&mut self) {
        self.lock.flag.store(false, Ordering::Release);
    }
}

/// Middle tier: one shard per size class plus the page cache underneath.
///
/// Lock order is always shard flag first, then the page-cache mutex; the
/// page-cache mutex is never held across a flag acquisition.
pub(crate) struct CentralCache {
    shards: [ClassLock; NUM_CLASSES],
    pages: Mutex<PageCache>,
}

impl CentralCache {
    pub fn new() -> Self {
        Self {
            shards: std::array::from_fn(|_| ClassLock::new()),
            pages: Mutex::new(PageCache::new()),
        }
    }

    /// Hand out `count` slots of the given (aligned, small) size.
    ///
    /// If the class free list cannot cover the request, one full-capacity
    /// span of [`MAX_UNITS`] slots is fetched and carved, regardless of the
    /// immediate need. Hot classes then refill from the leftovers instead
    /// of going back to the page cache.
    pub fn allocate(&self, size: usize, count: usize) -> Option<BlockList> {
        if size == 0 || count == 0 {
            return None;
        }
        debug_assert!(size.is_multiple_of(ALIGN));
        debug_assert!(size <= MAX_SMALL);
        debug_assert!(count <= MAX_UNITS);

        let class = size_class_of(size);
        let mut guard = self.shards[class].lock();
        let shard = guard.shard();
        let mut result = BlockList::new();

        if shard.free.len() < count {
            // Carve a fresh span; whatever is on the free list stays there.
            let region = {
                let mut pages = self
                    .pages
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                pages.allocate_pages(span_pages(size))?
            };
            let mut span = PageSpan::new(region, size);
            debug_assert_eq!(span.capacity(), MAX_UNITS);

            let base = region.addr();
            for unit in 0..MAX_UNITS {
                let addr = base + unit * size;
                // Safety: addr lies inside the mapped span region.
                let ptr = unsafe { NonNull::new_unchecked(addr as *mut u8) };
                if unit < count {
                    span.mark_allocated(addr);
                    result.push(ptr);
                } else {
                    shard.free.push(ptr);
                }
            }

            let previous = shard.spans.insert(base, span);
            debug_assert!(previous.is_none(), "span registered twice at {base:#x}");
            stats::CENTRAL_CACHED_BLOCKS.add(MAX_UNITS - count);
        } else {
            for _ in 0..count {
                let ptr = shard.free.pop().expect("free list shorter than its length");
                Self::mark_allocated_in_span(shard, ptr.as_ptr() as usize);
                result.push(ptr);
            }
            stats::sub_saturating(&stats::CENTRAL_CACHED_BLOCKS, count);
        }

        debug_assert_eq!(result.len(), count);
        Some(result)
    }

    /// Take back a batch of slots, all of the same class.
    ///
    /// Each slot returns to the class free list and clears its span bitmap
    /// bit; a span whose bitmap empties is swept out of the free list,
    /// deregistered, and its page run handed back to the page cache before
    /// this call returns.
    pub fn deallocate(&self, mut list: BlockList, size: usize) {
        if list.is_empty() {
            return;
        }
        debug_assert!(size.is_multiple_of(ALIGN));
        debug_assert!(size <= MAX_SMALL);

        let class = size_class_of(size);
        let mut guard = self.shards[class].lock();
        let shard = guard.shard();
        let mut returned = 0usize;
        let mut swept = 0usize;

        while let Some(ptr) = list.pop() {
            let addr = ptr.as_ptr() as usize;
            shard.free.push(ptr);
            returned += 1;

            let Some((&base, span)) = shard.spans.range_mut(..=addr).next_back() else {
                debug_assert!(false, "slot {addr:#x} has no owning span");
                continue;
            };
            debug_assert!(span.contains(addr), "slot {addr:#x} outside its span");
            debug_assert_eq!(span.unit_size(), size);
            span.mark_free(addr);

            if span.is_empty() {
                let region = span.region();
                let capacity = span.capacity();
                let removed = shard.free.remove_in_range(region.addr(), region.end_addr());
                debug_assert_eq!(removed, capacity, "span sweep missed slots");
                swept += removed;
                shard.spans.remove(&base);

                let mut pages = self
                    .pages
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                pages.deallocate_pages(region);
            }
        }

        stats::CENTRAL_CACHED_BLOCKS.add(returned);
        stats::sub_saturating(&stats::CENTRAL_CACHED_BLOCKS, swept);
    }

    /// Whole-region allocation for sizes above [`MAX_SMALL`]; no tier
    /// caches these.
    pub fn allocate_large(&self, bytes: usize) -> Option<NonNull<u8>> {
        debug_assert!(bytes > MAX_SMALL);
        self.pages
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .allocate_large(bytes)
    }

    pub fn deallocate_large(&self, ptr: NonNull<u8>, bytes: usize) {
        debug_assert!(bytes > MAX_SMALL);
        self.pages
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .deallocate_large(ptr, bytes);
    }

    fn mark_allocated_in_span(shard: &mut ClassShard, addr: usize) {
        let Some((_, span)) = shard.spans.range_mut(..=addr).next_back() else {
            debug_assert!(false, "slot {addr:#x} has no owning span");
            return;
        };
        debug_assert!(span.contains(addr), "slot {addr:#x} outside its span");
        span.mark_allocated(addr);
    }

    // ------------------------------------------------------------------
    // Test observability
    // ------------------------------------------------------------------

    #[cfg(test)]
    pub fn span_count(&self, class: usize) -> usize {
        let mut guard = self.shards[class].lock();
        guard.shard().spans.len()
    }

    #[cfg(test)]
    pub fn has_span_at(&self, class: usize, addr: usize) -> bool {
        let mut guard = self.shards[class].lock();
        guard.shard().spans.contains_key(&addr)
    }

    #[cfg(test)]
    pub fn free_len(&self, class: usize) -> usize {
        let mut guard = self.shards[class].lock();
        guard.shard().free.len()
    }

    #[cfg(test)]
    pub fn with_pages<R>(&self, f: impl FnOnce(&mut PageCache) -> R) -> R {
        let mut pages = self
            .pages
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut pages)
    }
}
