use super::header::{self, BackingKind, Block};
use super::mapper::{Mapping, PageMapper};
use super::select::{self, SizeClass};
use super::stats::{AllocStats, StatsError, StatsSnapshot};
use super::vm::{PAGE_SIZE_2MB, PlatformVmOps, VmError, VmOps};
use crate::sync::OnceLock;
use crate::sync::atomic::{AtomicBool, Ordering};
use std::alloc::{GlobalAlloc, Layout, System};
use std::io;
use std::marker::PhantomData;
use std::ptr::NonNull;

/// Default size at or above which a request is backed by page mappings.
pub const DEFAULT_THRESHOLD: usize = 1024 * 1024;

/// Fallback order for large requests. Each strategy either yields a block or
/// a typed failure; the first block that can hold the request wins.
const STRATEGIES: [BackingKind; 3] = [
    BackingKind::HugePage,
    BackingKind::RegularPage,
    BackingKind::System,
];

/// Configuration for [`HugeAlloc`]. Fixed for the allocator's lifetime.
///
/// Page sizes are not configured: they are discovered from the platform on
/// first use (see [`PlatformGeometry`]).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HugeAllocConfig {
    /// Requests of at least this many bytes are "large": they get a header
    /// and are backed by huge pages when possible. Default: 1 MiB.
    pub threshold: usize,

    /// Attempt explicit huge pages for large requests. When false, large
    /// requests start at regular pages. Default: true.
    pub use_huge_pages: bool,
}

impl HugeAllocConfig {
    #[must_use]
    pub const fn new(threshold: usize) -> Self {
        Self {
            threshold,
            use_huge_pages: true,
        }
    }

    /// Same threshold, huge pages never attempted.
    #[must_use]
    pub const fn without_huge_pages(self) -> Self {
        Self {
            use_huge_pages: false,
            ..self
        }
    }
}

impl Default for HugeAllocConfig {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD)
    }
}

/// Page sizes resolved from the platform.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlatformGeometry {
    /// Regular page size.
    pub page_size: usize,
    /// Huge page size. When the platform has no huge pages this is still set
    /// (to 2 MiB) because it bounds which alignments count as large.
    pub huge_page_size: usize,
    /// Whether the platform has a huge page mechanism at all.
    pub huge_pages_supported: bool,
}

impl PlatformGeometry {
    fn probe<V: VmOps>() -> Self {
        let page_size = V::page_size();
        let huge = V::huge_page_size().filter(|&h| h > page_size && h.is_power_of_two());
        Self {
            page_size,
            huge_page_size: huge.unwrap_or(PAGE_SIZE_2MB.max(page_size)),
            huge_pages_supported: huge.is_some(),
        }
    }
}

/// Every applicable backing failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("out of memory: {size} bytes aligned to {align}")]
pub struct OutOfMemory {
    pub size: usize,
    pub align: usize,
}

impl From<Layout> for OutOfMemory {
    fn from(layout: Layout) -> Self {
        Self {
            size: layout.size(),
            align: layout.align(),
        }
    }
}

/// General-purpose allocator that backs large requests with huge pages.
///
/// Small requests go straight to the platform allocator. Large requests try a
/// huge page mapping, then a regular page mapping, then the platform allocator,
/// and record the outcome in a header just before the returned pointer, so a
/// release never has to consult shared state.
///
/// To use as the global memory allocator:
///
/// ```rust
/// use hugepage_alloc::{HugeAlloc, HugeAllocConfig};
///
/// #[global_allocator]
/// static GLOBAL: HugeAlloc = HugeAlloc::new(HugeAllocConfig::new(1024 * 1024));
///
/// fn main() {
///     let v = vec![0u8; 4 * 1024 * 1024];
///     assert!(GLOBAL.stats().unwrap().large_allocs() >= 1);
///     drop(v);
/// }
/// ```
pub struct HugeAlloc<V = PlatformVmOps> {
    config: HugeAllocConfig,
    geometry: OnceLock<PlatformGeometry>,
    stats: AllocStats,
    huge_reported: AtomicBool,
    _vm: PhantomData<fn() -> V>,
}

impl<V: VmOps> HugeAlloc<V> {
    /// Create an allocator. `const` so it can initialise a
    /// `#[global_allocator]` static; nothing touches the platform until the
    /// first allocation.
    ///
    /// # Panics
    ///
    /// Panics (at compile time for statics) if `config.threshold` is zero.
    #[cfg(not(loom))]
    #[must_use]
    pub const fn new(config: HugeAllocConfig) -> Self {
        assert!(config.threshold > 0, "HugeAlloc threshold must be non-zero");
        Self {
            config,
            geometry: OnceLock::new(),
            stats: AllocStats::new(),
            huge_reported: AtomicBool::new(false),
            _vm: PhantomData,
        }
    }

    #[cfg(loom)]
    #[must_use]
    pub fn new(config: HugeAllocConfig) -> Self {
        assert!(config.threshold > 0, "HugeAlloc threshold must be non-zero");
        Self {
            config,
            geometry: OnceLock::new(),
            stats: AllocStats::new(),
            huge_reported: AtomicBool::new(false),
            _vm: PhantomData,
        }
    }

    #[must_use]
    pub fn config(&self) -> HugeAllocConfig {
        self.config
    }

    /// Page sizes in use, probing the platform on the first call.
    pub fn geometry(&self) -> PlatformGeometry {
        *self.geometry.get_or_init(PlatformGeometry::probe::<V>)
    }

    /// Snapshot of the counters.
    ///
    /// # Errors
    ///
    /// Returns [`StatsError::Uninitialized`] until the first allocation (or a
    /// call to [`geometry`](Self::geometry)) has resolved the platform.
    pub fn stats(&self) -> Result<StatsSnapshot, StatsError> {
        self.geometry
            .get()
            .map(|_| self.stats.snapshot())
            .ok_or(StatsError::Uninitialized)
    }

    #[inline]
    fn classify(&self, layout: Layout, geometry: &PlatformGeometry) -> SizeClass {
        select::decide(
            layout.size(),
            layout.align(),
            self.config.threshold,
            geometry.huge_page_size,
        )
    }

    #[inline]
    fn dangling(align: usize) -> NonNull<u8> {
        debug_assert!(align.is_power_of_two());
        // Safety: align is non-zero (power of two).
        unsafe { NonNull::new_unchecked(std::ptr::without_provenance_mut(align)) }
    }

    /// Allocate memory for `layout`.
    ///
    /// Zero-sized layouts get a dangling, well-aligned pointer.
    ///
    /// # Errors
    ///
    /// Returns [`OutOfMemory`] when the platform allocator fails a small
    /// request, or when every backing fails a large one.
    pub fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, OutOfMemory> {
        self.allocate_inner(layout, false)
    }

    /// Like [`allocate`](Self::allocate), but the memory is zeroed.
    /// Anonymous mappings are zero already, so only the platform allocator
    /// paths do any work.
    ///
    /// # Errors
    ///
    /// Same as [`allocate`](Self::allocate).
    pub fn allocate_zeroed(&self, layout: Layout) -> Result<NonNull<u8>, OutOfMemory> {
        self.allocate_inner(layout, true)
    }

    fn allocate_inner(&self, layout: Layout, zeroed: bool) -> Result<NonNull<u8>, OutOfMemory> {
        if layout.size() == 0 {
            return Ok(Self::dangling(layout.align()));
        }
        let geometry = self.geometry();

        match self.classify(layout, &geometry) {
            SizeClass::Small => {
                // Safety: layout has non-zero size.
                let ptr = unsafe {
                    if zeroed {
                        System.alloc_zeroed(layout)
                    } else {
                        System.alloc(layout)
                    }
                };
                let ptr = NonNull::new(ptr).ok_or(OutOfMemory::from(layout))?;
                self.stats.record_small(layout.size());
                Ok(ptr)
            }
            SizeClass::Large => self.allocate_large(layout, &geometry, zeroed),
        }
    }

    fn allocate_large(
        &self,
        layout: Layout,
        geometry: &PlatformGeometry,
        zeroed: bool,
    ) -> Result<NonNull<u8>, OutOfMemory> {
        for backing in STRATEGIES {
            if backing == BackingKind::HugePage
                && !(self.config.use_huge_pages && geometry.huge_pages_supported)
            {
                continue;
            }

            let block = match self.acquire(backing, layout, geometry, zeroed) {
                Ok(block) => block,
                Err(e) => {
                    if backing == BackingKind::HugePage {
                        self.report_huge_failure(&e);
                    }
                    continue;
                }
            };

            // Safety: block is a fresh, writable region aligned to at least
            // HEADER_ALIGN (page aligned, or allocated with that alignment).
            match unsafe { header::place(block, layout.size(), layout.align()) } {
                Ok(user) => {
                    self.stats.record_large(backing, layout.size(), block.extent);
                    return Ok(user);
                }
                Err(block) => {
                    // The mapper returned less alignment than promised; give
                    // the block back and try the next strategy.
                    // Safety: block was never handed out.
                    unsafe { self.release(block, layout.align(), geometry) };
                }
            }
        }
        Err(OutOfMemory::from(layout))
    }

    /// Obtain a block large enough for `layout` plus its header.
    fn acquire(
        &self,
        backing: BackingKind,
        layout: Layout,
        geometry: &PlatformGeometry,
        zeroed: bool,
    ) -> Result<Block, VmError> {
        let (size, align) = (layout.size(), layout.align());
        let mapper = match backing {
            BackingKind::HugePage => PageMapper::<V>::huge(geometry.huge_page_size),
            BackingKind::RegularPage => PageMapper::<V>::regular(geometry.page_size),
            BackingKind::System => {
                let granularity = align.max(header::HEADER_ALIGN);
                let len = header::block_len(size, align, granularity).ok_or_else(oom)?;
                let sys_layout = header::system_layout(len, align).ok_or_else(oom)?;
                // Safety: sys_layout has non-zero size (it includes the header).
                let ptr = unsafe {
                    if zeroed {
                        System.alloc_zeroed(sys_layout)
                    } else {
                        System.alloc(sys_layout)
                    }
                };
                let base = NonNull::new(ptr).ok_or_else(oom)?;
                return Ok(Block {
                    base,
                    extent: len,
                    backing,
                });
            }
        };

        let len = header::block_len(size, align, mapper.granularity()).ok_or_else(oom)?;
        let Mapping { base, extent } = mapper.map(len)?;
        Ok(Block {
            base,
            extent,
            backing,
        })
    }

    /// Release a whole block to the backing recorded for it.
    ///
    /// # Safety
    /// `block` must be live and no longer referenced; `align` must be the
    /// alignment of the request it was acquired for.
    unsafe fn release(&self, block: Block, align: usize, geometry: &PlatformGeometry) {
        let mapping = Mapping {
            base: block.base,
            extent: block.extent,
        };
        let unmapped = match block.backing {
            // Safety: upheld by caller; the mapping is exactly what `map` returned.
            BackingKind::HugePage => unsafe {
                PageMapper::<V>::huge(geometry.huge_page_size).unmap(mapping)
            },
            // Safety: as above.
            BackingKind::RegularPage => unsafe {
                PageMapper::<V>::regular(geometry.page_size).unmap(mapping)
            },
            BackingKind::System => {
                let Some(layout) = header::system_layout(block.extent, align) else {
                    header::contract_violation("large allocation extent cannot form a layout");
                };
                // Safety: same base and layout the block was allocated with.
                unsafe { System.dealloc(block.base.as_ptr(), layout) };
                Ok(())
            }
        };
        if unmapped.is_err() {
            header::contract_violation("unmap of a recorded large allocation failed");
        }
    }

    /// Release memory returned by [`allocate`](Self::allocate).
    ///
    /// # Safety
    /// - `ptr` must have been returned by this allocator and not released yet.
    /// - `layout` must be exactly the layout used to allocate it.
    ///
    /// A large release whose header is missing or corrupt aborts the process.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        if layout.size() == 0 {
            return;
        }
        let geometry = self.geometry();

        match self.classify(layout, &geometry) {
            // Safety: small blocks come straight from System with this layout.
            SizeClass::Small => unsafe { System.dealloc(ptr.as_ptr(), layout) },
            SizeClass::Large => {
                // Safety: upheld by caller.
                let block = unsafe { header::take(ptr, layout.size(), layout.align()) };
                self.stats
                    .record_large_free(block.backing, layout.size(), block.extent);
                // Safety: header consumed; the block is no longer referenced.
                unsafe { self.release(block, layout.align(), &geometry) };
            }
        }
    }

    /// Resize an allocation, keeping its alignment.
    ///
    /// Always allocates a new block, copies `min(old, new)` bytes and
    /// releases the old one; mappings are never resized in place. When both
    /// sizes are small the platform allocator's own `realloc` is used.
    ///
    /// # Errors
    ///
    /// Returns [`OutOfMemory`] if the new block cannot be obtained; the old
    /// allocation is then left untouched.
    ///
    /// # Safety
    /// Same as [`deallocate`](Self::deallocate) for `ptr` and `old_layout`.
    pub unsafe fn reallocate(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_size: usize,
    ) -> Result<NonNull<u8>, OutOfMemory> {
        let new_layout = Layout::from_size_align(new_size, old_layout.align()).map_err(|_| OutOfMemory {
            size: new_size,
            align: old_layout.align(),
        })?;

        if old_layout.size() == 0 {
            return self.allocate(new_layout);
        }
        if new_size == 0 {
            // Safety: upheld by caller.
            unsafe { self.deallocate(ptr, old_layout) };
            return Ok(Self::dangling(old_layout.align()));
        }

        let geometry = self.geometry();
        if self.classify(old_layout, &geometry) == SizeClass::Small
            && self.classify(new_layout, &geometry) == SizeClass::Small
        {
            // Safety: ptr is a small block from System with old_layout.
            let new_ptr = unsafe { System.realloc(ptr.as_ptr(), old_layout, new_size) };
            let new_ptr = NonNull::new(new_ptr).ok_or(OutOfMemory::from(new_layout))?;
            self.stats.record_small(new_size);
            return Ok(new_ptr);
        }

        let new_ptr = self.allocate(new_layout)?;
        // Safety: both regions are live, distinct, and at least this long.
        unsafe {
            std::ptr::copy_nonoverlapping(
                ptr.as_ptr(),
                new_ptr.as_ptr(),
                old_layout.size().min(new_size),
            );
            self.deallocate(ptr, old_layout);
        }
        Ok(new_ptr)
    }

    /// First failed huge mapping of this allocator, debug builds only.
    /// Raw writes to fd 2 with the errno only: `eprintln!` may lock and grow
    /// a captured output buffer, which re-enters this allocator.
    fn report_huge_failure(&self, err: &VmError) {
        #[cfg(debug_assertions)]
        if !self.huge_reported.swap(true, Ordering::Relaxed) {
            let mut digits = [0u8; 11];
            let errno: &[u8] = match err.raw_os_error() {
                Some(code) => header::format_decimal(code, &mut digits),
                None => b"unknown",
            };
            header::write_stderr(&[
                b"[hugepage-alloc] huge page mapping failed (os error ",
                errno,
                b"); falling back to regular pages\n",
            ]);
        }
        #[cfg(not(debug_assertions))]
        let _ = (err, &self.huge_reported, Ordering::Relaxed);
    }
}

fn oom() -> VmError {
    VmError::MapFailed(io::Error::from(io::ErrorKind::OutOfMemory))
}

// Safety: Implementation follows GlobalAlloc contract; every pointer handed
// out is released through the backing recorded for it.
unsafe impl<V: VmOps> GlobalAlloc for HugeAlloc<V> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.allocate(layout).map_or(std::ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        self.allocate_zeroed(layout)
            .map_or(std::ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            // Safety: Deallocating ptr with the layout it was allocated with.
            unsafe { self.deallocate(ptr, layout) };
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let Some(ptr) = NonNull::new(ptr) else {
            return std::ptr::null_mut();
        };
        // Safety: upheld by caller.
        unsafe { self.reallocate(ptr, layout, new_size) }
            .map_or(std::ptr::null_mut(), NonNull::as_ptr)
    }
}
