use std::io;
use std::ptr::NonNull;

/// The x86_64 default huge page size.
pub const PAGE_SIZE_2MB: usize = 2 * 1024 * 1024;

/// Failure of a virtual memory primitive.
///
/// Huge page failures are routine (empty hugetlb pool, missing privilege,
/// unsupported hardware) and are recovered by the allocator; they are never
/// surfaced to callers of [`HugeAlloc`](crate::HugeAlloc).
#[derive(Debug, thiserror::Error)]
pub enum VmError {
    #[error("VM mapping failed: {0}")]
    MapFailed(#[source] io::Error),
    #[error("VM huge page mapping failed: {0}")]
    HugeMapFailed(#[source] io::Error),
    #[error("VM unmap failed: {0}")]
    UnmapFailed(#[source] io::Error),
}

impl VmError {
    /// Raw OS error code, if the failure came from the kernel.
    ///
    /// Used for diagnostics inside the allocator where formatting an
    /// `io::Error` (which allocates its message) is not allowed.
    #[must_use]
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            VmError::MapFailed(e) | VmError::HugeMapFailed(e) | VmError::UnmapFailed(e) => {
                e.raw_os_error()
            }
        }
    }
}

/// Abstract interface for anonymous virtual memory mappings.
///
/// Implementations must never allocate from the heap: they run underneath the
/// process-wide global allocator.
pub trait VmOps {
    /// Map an anonymous, private, read-write region of `size` bytes backed by
    /// regular pages. `size` must be a non-zero multiple of [`page_size`].
    ///
    /// # Safety
    /// The returned region must be released with [`unmap`] using the same
    /// `size`.
    ///
    /// [`page_size`]: VmOps::page_size
    /// [`unmap`]: VmOps::unmap
    unsafe fn map(size: usize) -> Result<NonNull<u8>, VmError>;

    /// Map an anonymous, private, read-write region backed by explicit huge
    /// pages. The region is physically backed immediately and is aligned to
    /// `huge_page_size`.
    ///
    /// # Arguments
    /// * `size`: Must be a non-zero multiple of `huge_page_size`.
    /// * `huge_page_size`: Requested page granularity (power of two).
    ///
    /// # Platform Notes
    /// - **Linux**: `MAP_HUGETLB` with the page size encoded above
    ///   `MAP_HUGE_SHIFT`. Requires pre-allocated hugetlb pages
    ///   (`/proc/sys/vm/nr_hugepages`); fails with `ENOMEM` otherwise.
    /// - **macOS `x86_64`**: XNU superpages (2MB only).
    /// - **macOS `aarch64`**: Not supported; always fails.
    ///
    /// # Safety
    /// Free with [`unmap`](VmOps::unmap) using the same `size`.
    unsafe fn map_huge(size: usize, huge_page_size: usize) -> Result<NonNull<u8>, VmError>;

    /// Release a region previously returned by [`map`](VmOps::map) or
    /// [`map_huge`](VmOps::map_huge). After this the pointer is invalid.
    ///
    /// # Safety
    /// `ptr` and `size` must be exactly the pair the mapping was created
    /// with; unmapping a sub-range is not allowed.
    unsafe fn unmap(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// OS page size (default/minimum).
    fn page_size() -> usize;

    /// Default huge page size of the platform, or `None` when the platform has
    /// no huge page mechanism at all.
    ///
    /// This reports what the kernel *supports*, not what is currently
    /// reserved; [`map_huge`](VmOps::map_huge) may still fail.
    fn huge_page_size() -> Option<usize>;
}

pub struct PlatformVmOps;

#[cfg(all(unix, not(any(loom, miri))))]
mod unix {
    use super::{NonNull, PlatformVmOps, VmError, VmOps, io};

    // ----------------------------------------------------------------
    // Huge page mapping: platform-specific helpers
    // ----------------------------------------------------------------

    /// Linux: MAP_HUGETLB with log₂(page size) encoded in bits [31:26].
    /// Requires pre-allocated hugetlb pages:
    ///   2MB:  echo N > /proc/sys/vm/nr_hugepages
    ///   1GB:  boot param `hugepagesz=1G hugepages=N` (boot-time only)
    #[cfg(target_os = "linux")]
    unsafe fn map_huge_impl(size: usize, huge_page_size: usize) -> Result<NonNull<u8>, VmError> {
        const MAP_HUGE_SHIFT: libc::c_int = 26;

        // trailing_zeros of a usize is at most 64.
        #[allow(clippy::cast_possible_wrap)]
        let log2 = huge_page_size.trailing_zeros() as libc::c_int;
        let huge_flag = libc::MAP_HUGETLB | (log2 << MAP_HUGE_SHIFT);

        // Safety: FFI call to mmap.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON | huge_flag,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(VmError::HugeMapFailed(io::Error::last_os_error()));
        }

        NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| VmError::HugeMapFailed(io::Error::from(io::ErrorKind::Other)))
    }

    /// macOS Intel (x86_64): XNU superpages via mmap flag.
    ///
    /// `VM_FLAGS_SUPERPAGE_SIZE_2MB` (1) << `VM_FLAGS_SUPERPAGE_SHIFT` (16)
    /// = 0x10000, carried in the upper bits of `flags` when `MAP_ANON` is set.
    #[cfg(all(target_os = "macos", target_arch = "x86_64"))]
    unsafe fn map_huge_impl(size: usize, huge_page_size: usize) -> Result<NonNull<u8>, VmError> {
        const SUPERPAGE_2MB: libc::c_int = 1 << 16;

        if huge_page_size != super::PAGE_SIZE_2MB {
            return Err(VmError::HugeMapFailed(io::Error::from(io::ErrorKind::Unsupported)));
        }

        // Safety: FFI call to mmap.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON | SUPERPAGE_2MB,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(VmError::HugeMapFailed(io::Error::last_os_error()));
        }

        NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| VmError::HugeMapFailed(io::Error::from(io::ErrorKind::Other)))
    }

    /// Apple Silicon and other unix targets: no huge page mapping.
    #[cfg(not(any(target_os = "linux", all(target_os = "macos", target_arch = "x86_64"))))]
    unsafe fn map_huge_impl(
        _size: usize,
        _huge_page_size: usize,
    ) -> Result<NonNull<u8>, VmError> {
        Err(VmError::HugeMapFailed(io::Error::from(io::ErrorKind::Unsupported)))
    }

    // ----------------------------------------------------------------
    // Huge page size probing: platform-specific helpers
    // ----------------------------------------------------------------

    /// Linux: read the `Hugepagesize:` line of /proc/meminfo. This is the
    /// size of the pool controlled by /proc/sys/vm/nr_hugepages.
    ///
    /// Uses raw `open`/`read` into a stack buffer: this runs on the first
    /// allocation of the process-wide allocator and must not allocate.
    #[cfg(target_os = "linux")]
    fn probe_huge_page_size() -> Option<usize> {
        const KEY: &[u8] = b"Hugepagesize:";
        let mut buf = [0u8; 8192];

        // Safety: FFI call to open with a NUL-terminated path.
        let fd = unsafe {
            libc::open(c"/proc/meminfo".as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC)
        };
        if fd < 0 {
            return None;
        }
        let mut len = 0;
        while len < buf.len() {
            // Safety: FFI call to read into the unfilled tail of `buf`.
            let n = unsafe {
                libc::read(fd, buf[len..].as_mut_ptr().cast::<libc::c_void>(), buf.len() - len)
            };
            match usize::try_from(n) {
                Ok(read) if read > 0 => len += read,
                _ => break,
            }
        }
        // Safety: FFI call to close the descriptor opened above.
        unsafe { libc::close(fd) };

        let text = &buf[..len];
        let start = text.windows(KEY.len()).position(|w| w == KEY)? + KEY.len();
        let kb = text[start..]
            .iter()
            .skip_while(|b| b.is_ascii_whitespace())
            .take_while(|b| b.is_ascii_digit())
            .try_fold(0usize, |acc, b| acc.checked_mul(10)?.checked_add(usize::from(b - b'0')))?;

        let bytes = kb.checked_mul(1024)?;
        (bytes.is_power_of_two() && bytes > PlatformVmOps::page_size()).then_some(bytes)
    }

    /// macOS: Intel supports 2MB superpages; Apple Silicon has none.
    #[cfg(target_os = "macos")]
    fn probe_huge_page_size() -> Option<usize> {
        #[cfg(target_arch = "x86_64")]
        {
            Some(super::PAGE_SIZE_2MB)
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            None
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    fn probe_huge_page_size() -> Option<usize> {
        None
    }

    // ----------------------------------------------------------------

    impl VmOps for PlatformVmOps {
        unsafe fn map(size: usize) -> Result<NonNull<u8>, VmError> {
            // Safety: FFI call to mmap.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
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
                None => Err(VmError::MapFailed(io::Error::from(io::ErrorKind::Other))),
            }
        }

        unsafe fn map_huge(size: usize, huge_page_size: usize) -> Result<NonNull<u8>, VmError> {
            debug_assert!(
                size != 0 && huge_page_size != 0 && size.is_multiple_of(huge_page_size),
                "map_huge: size ({size}) must be a non-zero multiple of huge_page_size ({huge_page_size})"
            );
            debug_assert!(
                huge_page_size.is_power_of_two(),
                "map_huge: huge_page_size ({huge_page_size}) must be a power of two"
            );

            // Safety: map_huge_impl is unsafe because it performs FFI.
            // We have verified preconditions above.
            unsafe { map_huge_impl(size, huge_page_size) }
        }

        unsafe fn unmap(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to munmap.
            if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), size) } != 0 {
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
                // sysconf cannot fail for _SC_PAGESIZE on supported targets;
                // 4KB is the smallest page size any of them use.
                usize::try_from(raw).ok().filter(|&p| p > 0).unwrap_or(4096)
            })
        }

        fn huge_page_size() -> Option<usize> {
            use crate::sync::OnceLock;
            static CACHED: OnceLock<Option<usize>> = OnceLock::new();
            *CACHED.get_or_init(probe_huge_page_size)
        }
    }
}

// ---------------------------------------------------------------------------
// Heap-backed VmOps (no real mmap)
//
// Under `cfg(loom)` we cannot issue real VM syscalls: loom runs inside a
// single OS process with its own scheduler. Miri cannot model mmap either, and
// non-unix targets have no anonymous mapping primitive here. Every "mapping"
// is a page-aligned zeroed block from `std::alloc::System` (never the global
// allocator, which may be this crate).
//
// `map_huge` always fails: this backend has no huge pages, so the allocator
// exercises its regular-page fallback. Actual huge-page behaviour is tested by
// the real platform implementation in normal builds.
// ---------------------------------------------------------------------------
#[cfg(any(loom, miri, not(unix)))]
impl VmOps for PlatformVmOps {
    unsafe fn map(size: usize) -> Result<NonNull<u8>, VmError> {
        use std::alloc::{GlobalAlloc, Layout, System};

        if size == 0 {
            return Err(VmError::MapFailed(io::Error::from(io::ErrorKind::InvalidInput)));
        }
        let layout = Layout::from_size_align(size, Self::page_size())
            .map_err(|_| VmError::MapFailed(io::Error::from(io::ErrorKind::InvalidInput)))?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { System.alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or_else(|| VmError::MapFailed(io::Error::from(io::ErrorKind::OutOfMemory)))
    }

    unsafe fn map_huge(_size: usize, _huge_page_size: usize) -> Result<NonNull<u8>, VmError> {
        Err(VmError::HugeMapFailed(io::Error::from(io::ErrorKind::Unsupported)))
    }

    unsafe fn unmap(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
        use std::alloc::{GlobalAlloc, Layout, System};

        let layout = Layout::from_size_align(size, Self::page_size())
            .map_err(|_| VmError::UnmapFailed(io::Error::from(io::ErrorKind::InvalidInput)))?;
        // Safety: ptr was allocated with the same layout via `map`.
        unsafe { System.dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }

    fn page_size() -> usize {
        4096
    }

    fn huge_page_size() -> Option<usize> {
        Some(PAGE_SIZE_2MB)
    }
}
