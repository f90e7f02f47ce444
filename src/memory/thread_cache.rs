use std::ptr::NonNull;

use super::central_cache::CentralCache;
use super::classes::{
    ALIGN, MAX_SMALL, MAX_UNITS, NUM_CLASSES, WATERMARK_BYTES, align_up, class_size, size_class_of,
};
use super::free_list::BlockList;

/// Per-class state: the local free list plus the adaptive batch counter
/// driving the next central-cache refill.
struct ClassCache {
    free: BlockList,
    next_batch: usize,
}

/// Top tier: one free list per size class, private to the owning thread.
///
/// Nothing here is synchronized; the cache talks to the rest of the world
/// only through the `CentralCache` handed into each call. Repeated traffic
/// on a class doubles the refill batch; a class whose cached bytes outgrow
/// the recycle threshold drains the cold half of its list back to the
/// central cache and halves the batch, damping ping-pong between tiers.
pub(crate) struct ThreadCache {
    classes: Vec<ClassCache>,
    recycle_threshold: usize,
}

impl ThreadCache {
    pub fn new() -> Self {
        Self {
            classes: (0..NUM_CLASSES)
                .map(|_| ClassCache {
                    free: BlockList::new(),
                    next_batch: 0,
                })
                .collect(),
            recycle_threshold: WATERMARK_BYTES,
        }
    }

    /// Per-class byte budget; crossing it triggers a drain on deallocate.
    pub fn set_recycle_threshold(&mut self, bytes: usize) {
        self.recycle_threshold = bytes;
    }

    pub fn recycle_threshold(&self) -> usize {
        self.recycle_threshold
    }

    pub fn allocate(&mut self, central: &CentralCache, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        let size = align_up(size, ALIGN);
        if size > MAX_SMALL {
            return central.allocate_large(size);
        }
        let class = size_class_of(size);
        if let Some(ptr) = self.classes[class].free.pop() {
            return Some(ptr);
        }
        self.refill(central, class, size)
    }

    pub fn deallocate(&mut self, central: &CentralCache, ptr: NonNull<u8>, size: usize) {
        if size == 0 {
            return;
        }
        let size = align_up(size, ALIGN);
        if size > MAX_SMALL {
            central.deallocate_large(ptr, size);
            return;
        }
        let class = size_class_of(size);
        let entry = &mut self.classes[class];
        entry.free.push(ptr);

        if entry.free.len() * size > self.recycle_threshold {
            let drained = entry.free.split_tail_half();
            central.deallocate(drained, size);
            entry.next_batch /= 2;
        }
    }

    /// Return every cached slot to the central cache (thread exit, or an
    /// explicit drain).
    pub fn flush(&mut self, central: &CentralCache) {
        for class in 0..NUM_CLASSES {
            let entry = &mut self.classes[class];
            if !entry.free.is_empty() {
                central.deallocate(entry.free.take_all(), class_size(class));
            }
            entry.next_batch = 0;
        }
    }

    #[cold]
    fn refill(&mut self, central: &CentralCache, class: usize, size: usize) -> Option<NonNull<u8>> {
        let count = self.next_batch_size(class, size);
        let mut batch = central.allocate(size, count)?;
        let ptr = batch.pop()?;
        self.classes[class].free.append(batch);
        Some(ptr)
    }

    /// Adaptive batch sizing: start at 4, double on every refill, capped by
    /// the span capacity and by half the class budget (so one refill never
    /// blows straight through the recycle threshold).
    fn next_batch_size(&mut self, class: usize, size: usize) -> usize {
        let entry = &mut self.classes[class];
        let batch = entry.next_batch.max(4);
        entry.next_batch = (batch * 2)
            .min(MAX_UNITS)
            .min(self.recycle_threshold / size / 2);
        batch
    }

    // ------------------------------------------------------------------
    // Test observability
    // ------------------------------------------------------------------

    #[cfg(test)]
    pub fn cached_len(&self, class: usize) -> usize {
        self.classes[class].free.len()
    }

    #[cfg(test)]
    pub fn next_batch(&self, class: usize) -> usize {
        self.classes[class].next_batch
    }
}
