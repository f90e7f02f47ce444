use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ptr::NonNull;

use super::classes::{BULK_PAGES, PAGE_SIZE, align_up};
use super::span::Region;
use super::stats;
use super::vm::{PlatformVmOps, VmOps};

/// Bottom tier: owns every byte obtained from the OS and hands out runs of
/// whole pages.
///
/// Free runs are indexed two ways: by length (for best-fit allocation) and
/// by base address (for coalescing on return). The two views are mutated
/// together, always. Pages are never given back to the OS before the cache
/// itself is dropped; the design prefers reuse over release.
pub(crate) struct PageCache {
    /// run length in pages → base addresses of free runs of that length.
    free_by_len: BTreeMap<usize, BTreeSet<usize>>,
    /// base address → run length in pages.
    free_by_addr: BTreeMap<usize, usize>,
    /// Every mapping ever obtained from the OS, unmapped on drop.
    os_regions: Vec<Region>,
    /// Outstanding large objects: base address → exact byte length.
    large_live: HashMap<usize, usize>,
}

impl PageCache {
    pub fn new() -> Self {
        Self {
            free_by_len: BTreeMap::new(),
            free_by_addr: BTreeMap::new(),
            os_regions: Vec::new(),
            large_live: HashMap::new(),
        }
    }

    /// Allocate a run of exactly `pages` pages.
    ///
    /// Best-fit: the shortest free run that satisfies the request wins,
    /// lowest base address on ties. Returns `None` only when the OS
    /// refuses to grow the pool.
    pub fn allocate_pages(&mut self, pages: usize) -> Option<Region> {
        debug_assert!(pages >= 1);
        loop {
            let found = self
                .free_by_len
                .range(pages..)
                .next()
                .and_then(|(&len, bases)| bases.first().map(|&addr| (len, addr)));

            let Some((len, addr)) = found else {
                if !self.grow(pages) {
                    return None;
                }
                continue;
            };

            self.remove_free_run(addr, len);
            if len > pages {
                // trailing remainder goes back as its own run; it cannot
                // adjoin another free run because the run it came from didn't
                self.insert_free_run(addr + pages * PAGE_SIZE, len - pages);
            }
            let base = NonNull::new(addr as *mut u8)?;
            return Some(Region::new(base, pages * PAGE_SIZE));
        }
    }

    /// Allocate a whole region of at least `bytes` bytes, recording the
    /// exact length so the matching deallocate can return it unaided.
    pub fn allocate_large(&mut self, bytes: usize) -> Option<NonNull<u8>> {
        debug_assert!(bytes > 0);
        let pages = align_up(bytes, PAGE_SIZE) / PAGE_SIZE;
        let region = self.allocate_pages(pages)?;
        let previous = self.large_live.insert(region.addr(), bytes);
        debug_assert!(previous.is_none(), "large region registered twice");
        stats::LARGE_LIVE.add(bytes);
        Some(region.base())
    }

    /// Return a page run (from the central cache, on span emptying).
    pub fn deallocate_pages(&mut self, region: Region) {
        self.release_run(region.addr(), region.pages());
    }

    /// Return a large object. The registry remembers the exact byte length;
    /// `bytes` is only cross-checked in debug builds.
    pub fn deallocate_large(&mut self, ptr: NonNull<u8>, bytes: usize) {
        let addr = ptr.as_ptr() as usize;
        let Some(recorded) = self.large_live.remove(&addr) else {
            debug_assert!(false, "large free of unknown pointer {addr:#x}");
            return;
        };
        debug_assert_eq!(recorded, bytes, "large free with mismatched size");
        stats::sub_saturating(&stats::LARGE_LIVE, recorded);
        let pages = align_up(recorded, PAGE_SIZE) / PAGE_SIZE;
        self.release_run(addr, pages);
    }

    /// Insert a run, merging with immediately adjacent free neighbours.
    /// The forward and backward checks are independent; zero, one, or both
    /// may fire.
    fn release_run(&mut self, mut addr: usize, mut pages: usize) {
        debug_assert!(pages >= 1);
        if let Some(&upper_len) = self.free_by_addr.get(&(addr + pages * PAGE_SIZE)) {
            self.remove_free_run(addr + pages * PAGE_SIZE, upper_len);
            pages += upper_len;
        }
        if let Some((&lower_addr, &lower_len)) = self.free_by_addr.range(..addr).next_back() {
            if lower_addr + lower_len * PAGE_SIZE == addr {
                self.remove_free_run(lower_addr, lower_len);
                addr = lower_addr;
                pages += lower_len;
            }
        }
        self.insert_free_run(addr, pages);
    }

    /// Map `max(min_pages, BULK_PAGES)` fresh pages from the OS and install
    /// them as a free run. Returns false when the OS refuses.
    fn grow(&mut self, min_pages: usize) -> bool {
        let pages = min_pages.max(BULK_PAGES);
        let len = pages * PAGE_SIZE;
        // Safety: len is non-zero and page-aligned.
        let base = match unsafe { PlatformVmOps::map(len) } {
            Ok(p) => p,
            Err(_) => return false,
        };
        stats::TOTAL_MAPPED.add(len);
        self.os_regions.push(Region::new(base, len));
        // A fresh mapping may happen to adjoin an existing free run, so it
        // goes through the coalescing path like any other returned run.
        self.release_run(base.as_ptr() as usize, pages);
        true
    }

    fn insert_free_run(&mut self, addr: usize, pages: usize) {
        let previous = self.free_by_addr.insert(addr, pages);
        debug_assert!(previous.is_none(), "free run inserted twice at {addr:#x}");
        self.free_by_len.entry(pages).or_default().insert(addr);
        stats::PAGE_CACHE_FREE.add(pages * PAGE_SIZE);
    }

    fn remove_free_run(&mut self, addr: usize, pages: usize) {
        let removed = self.free_by_addr.remove(&addr);
        debug_assert_eq!(removed, Some(pages), "free views disagree at {addr:#x}");
        if let Some(bases) = self.free_by_len.get_mut(&pages) {
            let was_present = bases.remove(&addr);
            debug_assert!(was_present, "free views disagree at {addr:#x}");
            if bases.is_empty() {
                self.free_by_len.remove(&pages);
            }
        }
        stats::sub_saturating(&stats::PAGE_CACHE_FREE, pages * PAGE_SIZE);
    }

    // ------------------------------------------------------------------
    // Test observability
    // ------------------------------------------------------------------

    #[cfg(test)]
    pub fn free_run_count(&self) -> usize {
        self.free_by_addr.len()
    }

    #[cfg(test)]
    pub fn free_run_at(&self, addr: usize) -> Option<usize> {
        self.free_by_addr.get(&addr).copied()
    }

    #[cfg(test)]
    pub fn free_pages_total(&self) -> usize {
        self.free_by_addr.values().sum()
    }

    #[cfg(test)]
    pub fn large_registered(&self, addr: usize) -> bool {
        self.large_live.contains_key(&addr)
    }

    /// Both views hold the same set of runs, and no two runs are adjacent.
    #[cfg(test)]
    pub fn check_free_views(&self) {
        let from_len: usize = self.free_by_len.values().map(BTreeSet::len).sum();
        assert_eq!(from_len, self.free_by_addr.len(), "view cardinality mismatch");
        for (&addr, &pages) in &self.free_by_addr {
            assert!(
                self.free_by_len.get(&pages).is_some_and(|s| s.contains(&addr)),
                "run at {addr:#x} missing from length view"
            );
        }
        let mut prev_end: Option<usize> = None;
        for (&addr, &pages) in &self.free_by_addr {
            if let Some(end) = prev_end {
                assert_ne!(end, addr, "adjacent free runs at {addr:#x} were not coalesced");
            }
            prev_end = Some(addr + pages * PAGE_SIZE);
        }
    }
}

impl Drop for PageCache {
    fn drop(&mut self) {
        let free_bytes: usize = self.free_by_addr.values().map(|p| p * PAGE_SIZE).sum();
        for region in self.os_regions.drain(..) {
            // Safety: region was mapped by grow() with this exact length and
            // nothing inside it is reachable once the cache is gone.
            unsafe {
                drop(PlatformVmOps::unmap(region.base(), region.len()));
            }
            stats::sub_saturating(&stats::TOTAL_MAPPED, region.len());
        }
        stats::sub_saturating(&stats::PAGE_CACHE_FREE, free_bytes);
        stats::sub_saturating(
            &stats::LARGE_LIVE,
            self.large_live.values().sum::<usize>(),
        );
    }
}
