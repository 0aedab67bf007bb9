use super::vm::{VmError, VmOps};
use std::io;
use std::marker::PhantomData;
use std::ptr::NonNull;

/// A region returned by [`PageMapper::map`]. Must be handed back to the same
/// mapper's [`unmap`](PageMapper::unmap) unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Mapping {
    pub base: NonNull<u8>,
    pub extent: usize,
}

/// Anonymous mappings at one page granularity.
///
/// Holds no state beyond its granularity: a mapper is rebuilt from the
/// allocator's geometry on both the allocate and the release path.
pub(crate) struct PageMapper<V> {
    granularity: usize,
    huge: bool,
    _vm: PhantomData<fn() -> V>,
}

impl<V: VmOps> PageMapper<V> {
    pub(crate) const fn regular(page_size: usize) -> Self {
        Self {
            granularity: page_size,
            huge: false,
            _vm: PhantomData,
        }
    }

    pub(crate) const fn huge(huge_page_size: usize) -> Self {
        Self {
            granularity: huge_page_size,
            huge: true,
            _vm: PhantomData,
        }
    }

    #[inline]
    pub(crate) const fn granularity(&self) -> usize {
        self.granularity
    }

    /// Map at least `len` bytes, rounded up to the granularity.
    ///
    /// Huge failures are expected (empty hugetlb pool) and are reported as an
    /// ordinary `Err` for the caller to fall back on.
    pub(crate) fn map(&self, len: usize) -> Result<Mapping, VmError> {
        let extent = len
            .max(1)
            .checked_next_multiple_of(self.granularity)
            .ok_or_else(|| self.fail(io::ErrorKind::OutOfMemory))?;

        // Safety: extent is a non-zero multiple of the granularity; the
        // mapping is released through `unmap` with the same extent.
        let base = unsafe {
            if self.huge {
                V::map_huge(extent, self.granularity)?
            } else {
                V::map(extent)?
            }
        };
        Ok(Mapping { base, extent })
    }

    /// Release a mapping produced by [`map`](Self::map).
    ///
    /// # Safety
    /// `mapping` must come from `map` on a mapper of the same kind and must
    /// not be used afterwards.
    pub(crate) unsafe fn unmap(&self, mapping: Mapping) -> Result<(), VmError> {
        // Safety: upheld by caller.
        unsafe { V::unmap(mapping.base, mapping.extent) }
    }

    fn fail(&self, kind: io::ErrorKind) -> VmError {
        if self.huge {
            VmError::HugeMapFailed(io::Error::from(kind))
        } else {
            VmError::MapFailed(io::Error::from(kind))
        }
    }
}
