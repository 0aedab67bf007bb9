/// Loom-based concurrency tests.
///
/// Run w/ `RUSTFLAGS="--cfg loom" cargo test --lib --release`
///
/// The allocator keeps no shared structures on its hot path: the only shared
/// state is the counters, the once-only geometry cell and the report-once
/// flag. These tests explore every interleaving of those.
///
/// # Design notes
///
/// Loom exhaustively enumerates thread interleavings, so:
///   - Thread counts kept to 2 (state space is exponential).
///   - Loop iterations minimised to 1-2 per thread.
///   - Every test builds a fresh `HugeAlloc` inside the model closure; a
///     static would not reset between loom iterations.
///   - Under cfg(loom) `PlatformVmOps` is the heap-backed mock, so huge
///     mappings always fail and large requests land on regular pages.
#[cfg(loom)]
mod tests {
    use crate::memory::huge::{HugeAlloc, HugeAllocConfig};
    use crate::memory::vm::PlatformVmOps;
    use crate::sync::Arc;
    use std::alloc::Layout;

    const THRESHOLD: usize = 64 * 1024;

    fn bounded(preemption: usize) -> loom::model::Builder {
        let mut b = loom::model::Builder::new();
        b.preemption_bound = Some(preemption);
        b
    }

    // =====================================================================
    // 1. stats::Counter
    // =====================================================================

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

    // =====================================================================
    // 2. HugeAlloc: concurrent large allocate/deallocate
    // =====================================================================

    /// Two threads each allocate and release one large block.
    /// Exercises geometry init racing with the counters.
    #[test]
    fn loom_large_alloc_free_concurrent() {
        bounded(2).check(|| {
            let alloc = Arc::new(HugeAlloc::<PlatformVmOps>::new(HugeAllocConfig::new(THRESHOLD)));
            let l = Layout::from_size_align(THRESHOLD, 8).unwrap();

            let spawn_one = |a: Arc<HugeAlloc<PlatformVmOps>>| {
                loom::thread::spawn(move || {
                    let ptr = a.allocate(l).unwrap();
                    unsafe {
                        *ptr.as_ptr() = 1;
                        a.deallocate(ptr, l);
                    }
                })
            };
            let t1 = spawn_one(alloc.clone());
            let t2 = spawn_one(alloc.clone());

            t1.join().unwrap();
            t2.join().unwrap();

            let s = alloc.stats().unwrap();
            assert_eq!(s.regular_allocs, 2);
            assert_eq!(s.failed_huge_attempts, 2);
            assert_eq!(s.large_frees, 2);
            assert_eq!(s.live_large, 0);
            assert_eq!(s.live_mapped(), 0);
        });
    }

    /// One thread holds a large block while the other cycles small and large
    /// ones. Gauges must settle at exactly the held block.
    #[test]
    fn loom_mixed_sizes_gauges_settle() {
        bounded(2).check(|| {
            let alloc = Arc::new(HugeAlloc::<PlatformVmOps>::new(HugeAllocConfig::new(THRESHOLD)));
            let a1 = alloc.clone();
            let a2 = alloc.clone();
            let held = Layout::from_size_align(THRESHOLD * 2, 64).unwrap();

            let t1 = loom::thread::spawn(move || a1.allocate(held).unwrap().as_ptr() as usize);

            let t2 = loom::thread::spawn(move || {
                for size in [32, THRESHOLD] {
                    let l = Layout::from_size_align(size, 8).unwrap();
                    let ptr = a2.allocate(l).unwrap();
                    unsafe { a2.deallocate(ptr, l) };
                }
            });

            let held_addr = t1.join().unwrap();
            t2.join().unwrap();

            let s = alloc.stats().unwrap();
            assert_eq!(s.total_allocs(), 3);
            assert_eq!(s.live_large, 1);
            assert_eq!(s.live_requested, THRESHOLD * 2);

            let ptr = std::ptr::NonNull::new(held_addr as *mut u8).unwrap();
            unsafe { alloc.deallocate(ptr, held) };
            assert_eq!(alloc.stats().unwrap().live_mapped(), 0);
        });
    }
}
