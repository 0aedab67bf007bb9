#[cfg(all(test, not(loom)))]
mod tests {
    use crate::memory::huge::tests::{NoMappings, THRESHOLD, fake_huge_pool, layout};
    use crate::memory::huge::{HugeAlloc, HugeAllocConfig, OutOfMemory};
    use crate::memory::vm::PlatformVmOps;
    use crate::sync::Arc;
    use crate::sync::atomic::{AtomicBool, Ordering};
    use crate::sync::thread;

    const MB: usize = 1024 * 1024;

    #[test]
    fn test_integration_thread_contention() {
        // X1: many threads allocating and releasing through one instance
        let num_threads = 8usize;
        let iters = 200usize;
        fake_huge_pool!(Pool4, 4);
        let alloc = Arc::new(HugeAlloc::<Pool4>::new(HugeAllocConfig::new(THRESHOLD)));
        let barrier = Arc::new(crate::sync::barrier::Barrier::new(num_threads));

        let handles: Vec<_> = (0..num_threads)
            .map(|t| {
                let a = alloc.clone();
                let b = barrier.clone();
                thread::spawn(move || {
                    let sizes = [48, THRESHOLD, 3 * MB, 9 * MB];
                    let mut live = Vec::with_capacity(4);

                    b.wait(); // Synchronize start

                    for i in 0..iters {
                        let l = layout(sizes[(i + t) % sizes.len()], 16);
                        let ptr = a.allocate(l).unwrap();
                        let tag = u8::try_from(t).unwrap();
                        // Safety: Test code.
                        unsafe {
                            *ptr.as_ptr() = tag;
                            *ptr.as_ptr().add(l.size() - 1) = tag;
                        }
                        live.push((ptr, l, tag));

                        if live.len() == 4 {
                            for (p, l, tag) in live.drain(..) {
                                // Safety: Test code.
                                unsafe {
                                    assert_eq!(*p.as_ptr(), tag, "corrupted by another thread");
                                    assert_eq!(*p.as_ptr().add(l.size() - 1), tag);
                                    a.deallocate(p, l);
                                }
                            }
                        }
                    }
                    for (p, l, _) in live {
                        // Safety: Test code.
                        unsafe { a.deallocate(p, l) };
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        let s = alloc.stats().unwrap();
        assert_eq!(s.total_allocs(), num_threads * iters);
        // A quarter are small, the rest large. 9MB never fits the pool; the
        // others fit unless live blocks of other threads hold the pages.
        assert_eq!(s.large_allocs(), num_threads * iters * 3 / 4);
        assert_eq!(s.huge_allocs + s.regular_allocs, s.large_allocs());
        assert!(s.regular_allocs >= num_threads * iters / 4);
        assert_eq!(s.failed_huge_attempts, s.regular_allocs);
        assert_eq!(Pool4::pages_in_use(), 0);
        assert_eq!(s.large_frees, s.large_allocs());
        assert_eq!(s.live_large, 0);
        assert_eq!(s.live_requested, 0);
        assert_eq!(s.live_mapped(), 0);
    }

    #[test]
    fn test_integration_leak_check() {
        // X2: repeated threshold-sized cycles leave nothing mapped
        let alloc = HugeAlloc::<PlatformVmOps>::new(HugeAllocConfig::new(THRESHOLD));
        let l = layout(THRESHOLD, 8);

        for i in 0..1000u32 {
            let ptr = alloc.allocate(l).unwrap();
            // Safety: Test code.
            unsafe {
                *ptr.as_ptr() = i.to_le_bytes()[0];
                alloc.deallocate(ptr, l);
            }
            if i % 100 == 0 {
                let s = alloc.stats().unwrap();
                assert_eq!(s.live_mapped(), 0, "mapping leaked after {i} cycles");
            }
        }

        let s = alloc.stats().unwrap();
        assert_eq!(s.large_allocs(), 1000);
        assert_eq!(s.large_frees, 1000);
        assert_eq!(s.live_large, 0);
    }

    #[test]
    fn test_integration_high_pressure_stress() {
        // X3: many large blocks live at once, no overlap
        fake_huge_pool!(Pool1024, 1024);
        let alloc = HugeAlloc::<Pool1024>::new(HugeAllocConfig::new(THRESHOLD));
        let mut blocks = Vec::new();

        for i in 0..64usize {
            let l = layout(THRESHOLD + i * 4096 + 7, 8 << (i % 5));
            let ptr = alloc.allocate(l).unwrap();
            let tag = u8::try_from(i).unwrap();
            // Safety: Test code.
            unsafe { ptr.as_ptr().write_bytes(tag, l.size()) };
            blocks.push((ptr, l, tag));
        }

        let s = alloc.stats().unwrap();
        assert_eq!(s.live_large, 64);
        assert!(s.efficiency() <= 100);

        for (ptr, l, tag) in blocks.into_iter().rev() {
            // Safety: Test code.
            unsafe {
                let bytes = std::slice::from_raw_parts(ptr.as_ptr(), l.size());
                assert!(bytes.iter().all(|&b| b == tag), "block {tag} overwritten");
                alloc.deallocate(ptr, l);
            }
        }
        assert_eq!(alloc.stats().unwrap().live_mapped(), 0);
    }

    #[test]
    fn test_integration_oom_handling() {
        // X4: every backing fails: typed error, nothing counted
        let alloc = HugeAlloc::<NoMappings>::new(HugeAllocConfig::new(THRESHOLD));
        let l = layout(1 << 62, 8);
        assert_eq!(
            alloc.allocate(l),
            Err(OutOfMemory {
                size: 1 << 62,
                align: 8
            })
        );

        let s = alloc.stats().unwrap();
        assert_eq!(s.total_allocs(), 0);
        assert_eq!(s.live_large, 0);
    }

    #[test]
    fn test_integration_failed_realloc_keeps_old_block() {
        let alloc = HugeAlloc::<NoMappings>::new(HugeAllocConfig::new(THRESHOLD));
        let l = layout(THRESHOLD, 8);
        let ptr = alloc.allocate(l).unwrap();
        // Safety: Test code.
        unsafe {
            ptr.as_ptr().write_bytes(0x42, THRESHOLD);
            assert!(alloc.reallocate(ptr, l, 1 << 62).is_err());
            assert_eq!(*ptr.as_ptr().add(THRESHOLD - 1), 0x42);
            alloc.deallocate(ptr, l);
        }
        assert_eq!(alloc.stats().unwrap().live_large, 0);
    }

    #[test]
    fn test_global_stats_no_negative() {
        // X5: snapshots taken mid-flight never go negative or explode
        fake_huge_pool!(Pool2, 2);
        let alloc = Arc::new(HugeAlloc::<Pool2>::new(HugeAllocConfig::new(THRESHOLD)));
        let _ = alloc.geometry();
        let done = Arc::new(AtomicBool::new(false));

        let reader = {
            let a = alloc.clone();
            let d = done.clone();
            thread::spawn(move || {
                while !d.load(Ordering::Acquire) {
                    let s = a.stats().unwrap();
                    assert!(s.live_large <= 4 * 100);
                    assert!(s.live_mapped() < 4 * 100 * 8 * MB);
                }
            })
        };

        let writers: Vec<_> = (0..4)
            .map(|_| {
                let a = alloc.clone();
                thread::spawn(move || {
                    for i in 0..100usize {
                        let l = layout(THRESHOLD * (1 + i % 8), 64);
                        let ptr = a.allocate(l).unwrap();
                        // Safety: Test code.
                        unsafe { a.deallocate(ptr, l) };
                    }
                })
            })
            .collect();

        for w in writers {
            w.join().unwrap();
        }
        done.store(true, Ordering::Release);
        reader.join().unwrap();

        let s = alloc.stats().unwrap();
        assert_eq!(s.large_allocs(), 400);
        assert_eq!(s.live_mapped(), 0);
    }
}
