#[cfg(not(target_pointer_width = "64"))]
compile_error!("tierpool supports only 64-bit targets.");

pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod memory;

// allocator facade
pub use memory::pool::{GlobalMemoryPool, MemoryPool, MemoryStats};

// size constants callers may want for sizing decisions
pub use memory::classes::{ALIGN, MAX_SMALL, PAGE_SIZE};

// errors
pub use memory::vm::VmError;
