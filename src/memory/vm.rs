use std::fmt;
use std::ptr::NonNull;

#[cfg(all(not(unix), not(any(loom, miri))))]
compile_error!("tierpool requires a unix target (or the loom/miri heap-backed mock).");

#[derive(Debug)]
pub enum VmError {
    MapFailed(std::io::Error),
    UnmapFailed(std::io::Error),
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::MapFailed(e) => write!(f, "VM map failed: {e}"),
            VmError::UnmapFailed(e) => write!(f, "VM unmap failed: {e}"),
        }
    }
}

impl std::error::Error for VmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VmError::MapFailed(e) | VmError::UnmapFailed(e) => Some(e),
        }
    }
}

/// Abstract interface for virtual memory operations.
///
/// The pool commits eagerly: every mapping is readable and writable from
/// the moment `map` returns, and stays mapped until `unmap`. Fresh
/// mappings are zero-filled by the OS; reused pool memory carries no such
/// guarantee.
pub(crate) trait VmOps {
    /// Map `len` bytes of zero-filled anonymous memory.
    unsafe fn map(len: usize) -> Result<NonNull<u8>, VmError>;

    /// Unmap a range previously returned by [`map`](VmOps::map), with the
    /// same length.
    unsafe fn unmap(ptr: NonNull<u8>, len: usize) -> Result<(), VmError>;

    /// OS page size.
    fn page_size() -> usize;
}

pub(crate) struct PlatformVmOps;

#[cfg(all(unix, not(any(loom, miri))))]
mod unix {
    use super::{NonNull, PlatformVmOps, VmError, VmOps};
    use std::io;

    impl VmOps for PlatformVmOps {
        unsafe fn map(len: usize) -> Result<NonNull<u8>, VmError> {
            if len == 0 {
                return Err(VmError::MapFailed(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "zero-size mapping",
                )));
            }
            // Safety: FFI call to mmap.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANON,
                    -1,
                    0,
                )
            };

            if ptr == libc::MAP_FAILED {
                return Err(VmError::MapFailed(io::Error::last_os_error()));
            }

            match NonNull::new(ptr.cast::<u8>()) {
                Some(p) => Ok(p),
                None => Err(VmError::MapFailed(io::Error::other("mmap returned null"))),
            }
        }

        unsafe fn unmap(ptr: NonNull<u8>, len: usize) -> Result<(), VmError> {
            // Safety: FFI call to munmap.
            if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), len) } != 0 {
                return Err(VmError::UnmapFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        fn page_size() -> usize {
            use crate::sync::OnceLock;
            static CACHED: OnceLock<usize> = OnceLock::new();
            *CACHED.get_or_init(|| {
                // Safety: FFI call to sysconf.
                let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                assert!(
                    raw > 0,
                    "sysconf(_SC_PAGESIZE) failed: {}",
                    io::Error::last_os_error()
                );
                // PORTABILITY: this crate supports only 64-bit targets; page size
                // fits in usize there.
                #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                {
                    raw as usize
                }
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Loom/Miri mock: heap-backed VmOps (no real mmap)
//
// Under `cfg(loom)` we cannot issue real VM syscalls — loom runs inside a
// single OS process with its own scheduler. Instead we back every mapping
// with a plain heap allocation (via `std::alloc::alloc_zeroed`), which also
// reproduces the zero-fill guarantee of anonymous mappings. This is
// sufficient for testing the synchronization logic of the caches (loom)
// and for detecting undefined behaviour in unsafe pointer code (Miri).
// ---------------------------------------------------------------------------
#[cfg(any(loom, miri))]
impl VmOps for PlatformVmOps {
    unsafe fn map(len: usize) -> Result<NonNull<u8>, VmError> {
        if len == 0 {
            return Err(VmError::MapFailed(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "zero-size mapping",
            )));
        }
        let layout = std::alloc::Layout::from_size_align(len, 4096)
            .map_err(|e| VmError::MapFailed(std::io::Error::other(e)))?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or_else(|| {
            VmError::MapFailed(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "alloc returned null",
            ))
        })
    }

    unsafe fn unmap(ptr: NonNull<u8>, len: usize) -> Result<(), VmError> {
        let layout = std::alloc::Layout::from_size_align(len, 4096)
            .map_err(|e| VmError::UnmapFailed(std::io::Error::other(e)))?;
        // Safety: ptr was allocated with the same layout via `map`.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }

    fn page_size() -> usize {
        4096
    }
}

#[cfg(all(test, not(any(loom, miri))))]
mod tests {
    use super::*;

    #[test]
    fn test_map_write_unmap() {
        let len = PlatformVmOps::page_size();
        // Safety: Test code.
        unsafe {
            let ptr = PlatformVmOps::map(len).expect("map failed");
            let slice = std::slice::from_raw_parts_mut(ptr.as_ptr(), len);
            slice[0] = 42;
            slice[len - 1] = 24;
            assert_eq!(slice[0], 42);
            assert_eq!(slice[len - 1], 24);
            PlatformVmOps::unmap(ptr, len).expect("unmap failed");
        }
    }

    #[test]
    fn test_map_zero_size_fails() {
        // Safety: Test code.
        let result = unsafe { PlatformVmOps::map(0) };
        assert!(result.is_err(), "mapping 0 bytes should fail");
    }

    #[test]
    fn test_fresh_mapping_is_zero_filled() {
        let len = PlatformVmOps::page_size() * 2;
        // Safety: Test code.
        unsafe {
            let ptr = PlatformVmOps::map(len).expect("map failed");
            let slice = std::slice::from_raw_parts(ptr.as_ptr().cast_const(), len);
            assert!(slice.iter().all(|&b| b == 0), "fresh mapping not zeroed");
            PlatformVmOps::unmap(ptr, len).expect("unmap failed");
        }
    }

    #[test]
    fn test_multiple_mappings_independent() {
        let len = PlatformVmOps::page_size();
        // Safety: Test code.
        unsafe {
            let a = PlatformVmOps::map(len).expect("map a failed");
            let b = PlatformVmOps::map(len).expect("map b failed");
            assert_ne!(a, b);

            *a.as_ptr() = 1;
            *b.as_ptr() = 2;
            assert_eq!(*a.as_ptr(), 1);
            assert_eq!(*b.as_ptr(), 2);

            PlatformVmOps::unmap(a, len).expect("unmap a failed");
            // b must still be valid
            assert_eq!(*b.as_ptr(), 2);
            PlatformVmOps::unmap(b, len).expect("unmap b failed");
        }
    }

    #[test]
    fn test_page_size_is_power_of_two() {
        let size = PlatformVmOps::page_size();
        assert!(size > 0);
        assert!(size.is_power_of_two(), "page size {size} is not a power of two");
    }

    #[test]
    fn test_map_large() {
        // 64 MiB: large enough to exercise a multi-page mapping, small
        // enough for CI machines.
        let len = 64 * 1024 * 1024;
        // Safety: Test code.
        unsafe {
            let ptr = PlatformVmOps::map(len).expect("failed to map 64 MiB");
            // touch the first and last page
            *ptr.as_ptr() = 0xAB;
            *ptr.as_ptr().add(len - 1) = 0xCD;
            PlatformVmOps::unmap(ptr, len).expect("unmap failed");
        }
    }
}
