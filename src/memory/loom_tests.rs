/// Loom-based concurrency tests.
///
/// Run w/ `RUSTFLAGS="--cfg loom" cargo test --lib --release`
///
/// Exercise the per-class spin flag and the page-cache mutex under every
/// thread interleaving loom can explore.
///
/// # Design notes
///
/// Loom exhaustively enumerates thread interleavings, so:
///   - Thread counts kept to 2 (state space is exponential).
///   - Loop iterations minimised to 1-3 per thread.
///   - Tests create a fresh CentralCache per iteration; the VM layer is
///     the heap-backed mock under cfg(loom), and BULK_PAGES shrinks so a
///     model iteration maps kilobytes, not megabytes.
///   - GlobalMemoryPool is NOT modelled directly: its OnceLock static does
///     not reset between loom iterations. Everything it synchronises (the
///     class flags and the page-cache mutex) is reachable through
///     instance-based CentralCache tests.
#[cfg(loom)]
mod tests {
    use crate::memory::central_cache::CentralCache;
    use crate::sync::Arc;

    #[test]
    fn loom_counter_concurrent_add_sub() {
        use crate::memory::stats::Counter;

        loom::model(|| {
            let counter = Arc::new(Counter::new());
            let c1 = counter.clone();
            let c2 = counter.clone();

            let t1 = loom::thread::spawn(move || {
                c1.add(10);
                c1.add(5);
            });

            let t2 = loom::thread::spawn(move || {
                c2.sub(3);
                c2.add(8);
            });

            t1.join().unwrap();
            t2.join().unwrap();

            // 10 + 5 - 3 + 8 = 20
            assert_eq!(counter.get(), 20);
        });
    }

    #[test]
    fn loom_same_class_refill_and_drain() {
        loom::model(|| {
            let central = Arc::new(CentralCache::new());

            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let central = central.clone();
                    loom::thread::spawn(move || {
                        let mut batch = central.allocate(8, 1).expect("refill failed");
                        let ptr = batch.pop().unwrap();
                        // write through the slot while holding it
                        unsafe { ptr.as_ptr().write(0xA5) };
                        let mut back = crate::memory::free_list::BlockList::new();
                        back.push(ptr);
                        central.deallocate(back, 8);
                    })
                })
                .collect();

            for h in handles {
                h.join().unwrap();
            }

            // both slots came back, so the span emptied and was returned
            let class = crate::memory::classes::size_class_of(8);
            assert_eq!(central.span_count(class), 0);
            assert_eq!(central.free_len(class), 0);
        });
    }

    #[test]
    fn loom_distinct_classes_never_block_each_other() {
        loom::model(|| {
            let central = Arc::new(CentralCache::new());

            let c1 = central.clone();
            let t1 = loom::thread::spawn(move || {
                let mut batch = c1.allocate(8, 2).unwrap();
                let mut back = crate::memory::free_list::BlockList::new();
                while let Some(p) = batch.pop() {
                    back.push(p);
                }
                c1.deallocate(back, 8);
            });

            let c2 = central.clone();
            let t2 = loom::thread::spawn(move || {
                let mut batch = c2.allocate(16, 2).unwrap();
                let mut back = crate::memory::free_list::BlockList::new();
                while let Some(p) = batch.pop() {
                    back.push(p);
                }
                c2.deallocate(back, 16);
            });

            t1.join().unwrap();
            t2.join().unwrap();
        });
    }
}
