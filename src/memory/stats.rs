//! All counters use `Relaxed` ordering. Individual counter values are
//! eventually consistent. Cross-counter snapshots may be transiently
//! inconsistent (e.g., the live huge gauge may briefly disagree with the
//! allocation totals while another thread is mid-allocation). This is
//! acceptable for diagnostic display. Do NOT use these values for allocation
//! decisions.

use super::header::BackingKind;
use crate::sync::atomic::{AtomicIsize, Ordering};

/// Diagnostic-only counter.
///
/// Monotonic totals only ever `add`. Gauges (`live_*`) also `sub`; under
/// contention subtract-before-add races are tolerated and the raw value may
/// transiently dip below zero. Readers should always use `get()`, which clamps
/// negative values to zero.
pub struct Counter(AtomicIsize);

impl Counter {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[inline]
    fn delta(val: usize) -> isize {
        // Diagnostic counters only: clamp absurd deltas instead of panicking.
        std::cmp::min(val, isize::MAX as usize).cast_signed()
    }

    #[inline]
    pub fn add(&self, val: usize) {
        self.0.fetch_add(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(&self, val: usize) {
        self.0.fetch_sub(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn incr(&self) {
        self.add(1);
    }

    #[inline]
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed).max(0).cast_unsigned()
    }
}

/// Returned by [`HugeAlloc::stats`](crate::HugeAlloc::stats) when the
/// counters cannot be read yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StatsError {
    #[error("allocator statistics unavailable: platform geometry not resolved yet")]
    Uninitialized,
}

/// Counters owned by one allocator instance.
///
/// For the `#[global_allocator]` instance these are the process-wide
/// counters.
pub(crate) struct AllocStats {
    huge_allocs: Counter,
    huge_bytes: Counter,
    regular_allocs: Counter,
    regular_bytes: Counter,
    system_allocs: Counter,
    system_bytes: Counter,
    last_resort_allocs: Counter,
    failed_huge: Counter,
    large_frees: Counter,

    // Gauges over live large allocations.
    live_large: Counter,
    live_requested: Counter,
    live_huge_mapped: Counter,
    live_regular_mapped: Counter,
    live_system_mapped: Counter,
}

impl AllocStats {
    #[cfg(not(loom))]
    pub(crate) const fn new() -> Self {
        Self {
            huge_allocs: Counter::new(),
            huge_bytes: Counter::new(),
            regular_allocs: Counter::new(),
            regular_bytes: Counter::new(),
            system_allocs: Counter::new(),
            system_bytes: Counter::new(),
            last_resort_allocs: Counter::new(),
            failed_huge: Counter::new(),
            large_frees: Counter::new(),
            live_large: Counter::new(),
            live_requested: Counter::new(),
            live_huge_mapped: Counter::new(),
            live_regular_mapped: Counter::new(),
            live_system_mapped: Counter::new(),
        }
    }

    #[cfg(loom)]
    pub(crate) fn new() -> Self {
        Self {
            huge_allocs: Counter::new(),
            huge_bytes: Counter::new(),
            regular_allocs: Counter::new(),
            regular_bytes: Counter::new(),
            system_allocs: Counter::new(),
            system_bytes: Counter::new(),
            last_resort_allocs: Counter::new(),
            failed_huge: Counter::new(),
            large_frees: Counter::new(),
            live_large: Counter::new(),
            live_requested: Counter::new(),
            live_huge_mapped: Counter::new(),
            live_regular_mapped: Counter::new(),
            live_system_mapped: Counter::new(),
        }
    }

    /// A request served by the platform allocator without a header.
    #[inline]
    pub(crate) fn record_small(&self, size: usize) {
        self.system_allocs.incr();
        self.system_bytes.add(size);
    }

    /// A large request completed with `backing`.
    pub(crate) fn record_large(&self, backing: BackingKind, size: usize, extent: usize) {
        if backing != BackingKind::HugePage {
            self.failed_huge.incr();
        }
        match backing {
            BackingKind::HugePage => {
                self.huge_allocs.incr();
                self.huge_bytes.add(size);
                self.live_huge_mapped.add(extent);
            }
            BackingKind::RegularPage => {
                self.regular_allocs.incr();
                self.regular_bytes.add(size);
                self.live_regular_mapped.add(extent);
            }
            BackingKind::System => {
                self.system_allocs.incr();
                self.system_bytes.add(size);
                self.last_resort_allocs.incr();
                self.live_system_mapped.add(extent);
            }
        }
        self.live_large.incr();
        self.live_requested.add(size);
    }

    /// A large allocation was released.
    pub(crate) fn record_large_free(&self, backing: BackingKind, size: usize, extent: usize) {
        match backing {
            BackingKind::HugePage => self.live_huge_mapped.sub(extent),
            BackingKind::RegularPage => self.live_regular_mapped.sub(extent),
            BackingKind::System => self.live_system_mapped.sub(extent),
        }
        self.large_frees.incr();
        self.live_large.sub(1);
        self.live_requested.sub(size);
    }

    pub(crate) fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            huge_allocs: self.huge_allocs.get(),
            huge_bytes: self.huge_bytes.get(),
            regular_allocs: self.regular_allocs.get(),
            regular_bytes: self.regular_bytes.get(),
            system_allocs: self.system_allocs.get(),
            system_bytes: self.system_bytes.get(),
            last_resort_allocs: self.last_resort_allocs.get(),
            failed_huge_attempts: self.failed_huge.get(),
            large_frees: self.large_frees.get(),
            live_large: self.live_large.get(),
            live_requested: self.live_requested.get(),
            live_huge_mapped: self.live_huge_mapped.get(),
            live_regular_mapped: self.live_regular_mapped.get(),
            live_system_mapped: self.live_system_mapped.get(),
        }
    }
}

/// Point-in-time view of an allocator's counters.
///
/// Totals are monotonic. Byte totals count requested bytes; the `live_*`
/// mapped gauges count what was actually mapped or allocated, headers and
/// page rounding included.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Large allocations backed by huge pages.
    pub huge_allocs: usize,
    /// Requested bytes of huge-page-backed allocations.
    pub huge_bytes: usize,
    /// Large allocations that fell back to regular pages.
    pub regular_allocs: usize,
    /// Requested bytes of regular-page fallbacks.
    pub regular_bytes: usize,
    /// Allocations served by the platform allocator: small requests plus
    /// large requests that exhausted both mapping strategies.
    pub system_allocs: usize,
    /// Requested bytes of platform allocator allocations.
    pub system_bytes: usize,
    /// Large requests that ended on the platform allocator.
    pub last_resort_allocs: usize,
    /// Large requests whose huge page attempt did not produce the block.
    pub failed_huge_attempts: usize,
    /// Large allocations released.
    pub large_frees: usize,

    /// Large allocations currently live.
    pub live_large: usize,
    /// Requested bytes of live large allocations.
    pub live_requested: usize,
    /// Bytes currently mapped with huge pages.
    pub live_huge_mapped: usize,
    /// Bytes currently mapped with regular pages.
    pub live_regular_mapped: usize,
    /// Bytes of live large allocations held by the platform allocator.
    pub live_system_mapped: usize,
}

impl StatsSnapshot {
    /// Total allocations of every kind.
    #[must_use]
    pub fn total_allocs(&self) -> usize {
        self.huge_allocs + self.regular_allocs + self.system_allocs
    }

    /// Large allocations made so far (any backing).
    #[must_use]
    pub fn large_allocs(&self) -> usize {
        self.huge_allocs + self.regular_allocs + self.last_resort_allocs
    }

    /// Bytes currently held for live large allocations.
    #[must_use]
    pub fn live_mapped(&self) -> usize {
        self.live_huge_mapped + self.live_regular_mapped + self.live_system_mapped
    }

    /// Percentage of mapped large memory the caller actually asked for.
    /// 100 when nothing is mapped.
    #[must_use]
    pub fn efficiency(&self) -> usize {
        match self.live_mapped() {
            0 => 100,
            mapped => self.live_requested.saturating_mul(100) / mapped,
        }
    }
}
