#[cfg(all(test, not(loom)))]
mod tests {
    use crate::memory::classes::{BULK_PAGES, MAX_UNITS, size_class_of};
    use crate::memory::pool::{GlobalMemoryPool, MemoryPool};
    use crate::memory::thread_cache::ThreadCache;
    use crate::sync::Arc;
    use crate::sync::thread;

    #[test]
    fn test_adjacent_spans_coalesce_on_return() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let pool = MemoryPool::new();
        let central = pool.central();
        let size = 64;
        let class = size_class_of(size);

        // Two full-capacity carves in a row land on adjacent page runs.
        let first = central.allocate(size, MAX_UNITS).unwrap();
        let second = central.allocate(size, MAX_UNITS).unwrap();
        assert_eq!(central.span_count(class), 2);

        central.deallocate(second, size);
        central.deallocate(first, size);

        // Both spans emptied; the page cache holds one merged run again.
        assert_eq!(central.span_count(class), 0);
        central.with_pages(|pc| {
            assert_eq!(pc.free_run_count(), 1);
            assert_eq!(pc.free_pages_total(), BULK_PAGES);
            pc.check_free_views();
        });
    }

    #[test]
    fn test_work_cycle_restores_page_cache() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let pool = MemoryPool::new();
        let mut tc = ThreadCache::new();

        let sizes = [16usize, 48, 128, 512];
        let mut held = Vec::new();
        for round in 0..1000 {
            let size = sizes[round % sizes.len()];
            let ptr = pool.alloc_with_cache(&mut tc, size).unwrap();
            // Safety: Test code.
            unsafe { std::ptr::write_bytes(ptr.as_ptr(), (round % 255) as u8, size) };
            held.push((ptr, size));
            if round % 3 == 0 {
                let (p, s) = held.swap_remove(round % held.len());
                pool.free_with_cache(&mut tc, p, s);
            }
        }
        for (p, s) in held {
            pool.free_with_cache(&mut tc, p, s);
        }
        tc.flush(pool.central());

        // Every span came back and the free runs coalesced into the
        // original bulk mapping.
        for &size in &sizes {
            assert_eq!(pool.central().span_count(size_class_of(size)), 0);
        }
        pool.central().with_pages(|pc| {
            assert_eq!(pc.free_run_count(), 1);
            assert_eq!(pc.free_pages_total(), BULK_PAGES);
            pc.check_free_views();
        });
    }

    #[test]
    fn test_thread_exit_drains_to_central() {
        // Writer lock: asserts on the shared global pool's state.
        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        // 488 rounds to class 60, which no other test touches.
        let size = 488;
        let class = size_class_of(size);

        thread::spawn(move || {
            let ptr = GlobalMemoryPool::allocate(size).unwrap();
            // Safety: Test code.
            unsafe {
                std::ptr::write_bytes(ptr.as_ptr(), 0x77, size);
                GlobalMemoryPool::deallocate(ptr.as_ptr(), size);
            }
            // the freed slot stays in this thread's cache until exit
        })
        .join()
        .unwrap();

        // The exiting thread flushed its cache; the span emptied and left
        // the registry.
        let central = crate::memory::pool::test_support::global_central();
        assert_eq!(central.span_count(class), 0);
        assert_eq!(central.free_len(class), 0);
    }

    #[test]
    fn test_multithreaded_stress_mixed_sizes() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let num_threads = 8;
        let iters = 300usize;
        let barrier = Arc::new(crate::sync::barrier::Barrier::new(num_threads));

        let handles: Vec<_> = (0..num_threads)
            .map(|t| {
                let barrier = barrier.clone();
                thread::spawn(move || {
                    let sizes = [8usize, 24, 64, 200, 512, 600, 4096, 9000];
                    let mut live: Vec<(std::ptr::NonNull<u8>, usize, u8)> =
                        Vec::with_capacity(iters);

                    barrier.wait();

                    for i in 0..iters {
                        let size = sizes[(t + i) % sizes.len()];
                        let ptr = GlobalMemoryPool::allocate(size).unwrap();
                        // stamp the slot so cross-thread overlap shows up
                        let val = ((t * 31 + i) % 251) as u8;
                        // Safety: Test code.
                        unsafe { std::ptr::write_bytes(ptr.as_ptr(), val, size) };
                        live.push((ptr, size, val));

                        if i % 4 == 0 {
                            let (p, s, _) = live.swap_remove((t + i) % live.len());
                            // Safety: Test code.
                            unsafe { GlobalMemoryPool::deallocate(p.as_ptr(), s) };
                        }
                    }

                    // verify the stamps before releasing everything
                    for &(ptr, size, val) in &live {
                        // Safety: Test code.
                        unsafe {
                            assert_eq!(*ptr.as_ptr(), val, "corrupt {size}-byte slot");
                            assert_eq!(*ptr.as_ptr().add(size - 1), val, "corrupt {size}-byte slot");
                        }
                    }
                    for (p, s, _) in live {
                        // Safety: Test code.
                        unsafe { GlobalMemoryPool::deallocate(p.as_ptr(), s) };
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn test_cross_thread_free_via_central() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let pool = Arc::new(MemoryPool::new());

        // One thread allocates, another frees: the slots travel through the
        // central cache rather than any thread-local state.
        let producer_pool = pool.clone();
        let ptrs = thread::spawn(move || {
            let mut tc = ThreadCache::new();
            let out: Vec<usize> = (0..64)
                .map(|_| {
                    producer_pool
                        .alloc_with_cache(&mut tc, 96)
                        .unwrap()
                        .as_ptr() as usize
                })
                .collect();
            tc.flush(producer_pool.central());
            out
        })
        .join()
        .unwrap();

        let consumer_pool = pool.clone();
        thread::spawn(move || {
            let mut tc = ThreadCache::new();
            for addr in ptrs {
                let ptr = std::ptr::NonNull::new(addr as *mut u8).unwrap();
                consumer_pool.free_with_cache(&mut tc, ptr, 96);
            }
            tc.flush(consumer_pool.central());
        })
        .join()
        .unwrap();

        assert_eq!(pool.central().span_count(size_class_of(96)), 0);
    }

    #[test]
    fn test_allocation_failure_leaves_pool_usable() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let pool = MemoryPool::new();

        // An absurd request must fail cleanly, not poison any tier.
        assert!(pool.allocate(usize::MAX / 2).is_none());

        let ptr = pool.allocate(64).expect("pool unusable after failed allocation");
        // Safety: Test code.
        unsafe { pool.deallocate(ptr.as_ptr(), 64) };
    }

    #[test]
    fn test_small_and_large_regions_do_not_overlap() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let pool = MemoryPool::new();
        let mut tc = ThreadCache::new();

        // (address, usable length, requested size)
        let mut regions: Vec<(usize, usize, usize)> = Vec::new();
        for size in [32usize, 512, 513, 8192, 32, 4096] {
            let ptr = pool.alloc_with_cache(&mut tc, size).unwrap();
            let usable = crate::memory::classes::align_up(size, crate::memory::classes::ALIGN);
            regions.push((ptr.as_ptr() as usize, usable, size));
        }
        regions.sort_unstable();
        for pair in regions.windows(2) {
            let (a_start, a_len, _) = pair[0];
            let (b_start, _, _) = pair[1];
            assert!(a_start + a_len <= b_start, "live regions overlap");
        }
        for (addr, _, size) in regions {
            let ptr = std::ptr::NonNull::new(addr as *mut u8).unwrap();
            pool.free_with_cache(&mut tc, ptr, size);
        }
        tc.flush(pool.central());
    }
}
