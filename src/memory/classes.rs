//! Size-class math shared by every tier.
//!
//! Classes are uniform: class `i` serves slots of `(i + 1) * ALIGN` bytes,
//! so the size-to-class mapping is pure arithmetic and needs no lookup
//! table. Anything above [`MAX_SMALL`] bypasses the caches entirely.

/// Minimum slot size and pointer alignment: one machine word.
pub const ALIGN: usize = std::mem::size_of::<usize>();

/// Page granularity used for all page-cache bookkeeping.
pub const PAGE_SIZE: usize = 4096;

/// Number of small size classes.
pub const NUM_CLASSES: usize = 64;

/// Largest byte size served by the small path.
pub const MAX_SMALL: usize = NUM_CLASSES * ALIGN;

/// Largest number of slots any single span carries.
pub const MAX_UNITS: usize = PAGE_SIZE / ALIGN;

/// Default per-class byte budget for the thread cache. Above this the
/// thread cache drains half of the class's free list to the central cache.
pub(crate) const WATERMARK_BYTES: usize = 256 * 1024;

/// Minimum number of pages requested from the OS in one call.
#[cfg(not(loom))]
pub(crate) const BULK_PAGES: usize = 2048;

/// Under loom every model iteration rebuilds the pool from scratch, and an
/// 8 MiB zeroed mock mapping per interleaving would dominate the run.
#[cfg(loom)]
pub(crate) const BULK_PAGES: usize = 8;

const _: () = assert!(ALIGN.is_power_of_two());
const _: () = assert!(PAGE_SIZE.is_power_of_two());
const _: () = assert!(MAX_SMALL % ALIGN == 0);
const _: () = assert!(MAX_UNITS * ALIGN == PAGE_SIZE);

/// Round `n` up to the next multiple of power-of-two `a`.
#[inline]
pub(crate) fn align_up(n: usize, a: usize) -> usize {
    debug_assert!(a.is_power_of_two());
    (n + a - 1) & !(a - 1)
}

/// Slot size served by class `class`.
#[inline]
pub(crate) fn class_size(class: usize) -> usize {
    debug_assert!(class < NUM_CLASSES);
    (class + 1) * ALIGN
}

/// Map an already-aligned small size to its class index.
#[inline]
pub(crate) fn size_class_of(size: usize) -> usize {
    debug_assert!(size > 0 && size <= MAX_SMALL);
    align_up(size, ALIGN) / ALIGN - 1
}

/// Pages needed for a full-capacity span of the given slot size:
/// every span is carved into exactly [`MAX_UNITS`] slots.
#[inline]
pub(crate) fn span_pages(slot_size: usize) -> usize {
    align_up(slot_size * MAX_UNITS, PAGE_SIZE) / PAGE_SIZE
}
