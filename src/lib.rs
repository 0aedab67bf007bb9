//! A general-purpose allocator that backs large requests with huge pages.
//!
//! Requests at or above a threshold are mapped with explicit huge pages,
//! falling back to regular pages and then to the platform allocator. Smaller
//! requests are forwarded to the platform allocator unchanged. Install it with
//! `#[global_allocator]` (see [`HugeAlloc`]).

#[cfg(not(target_pointer_width = "64"))]
compile_error!("hugepage-alloc supports only 64-bit targets.");

pub(crate) mod sync;

pub mod memory;

// allocator
pub use memory::huge::{DEFAULT_THRESHOLD, HugeAlloc, HugeAllocConfig, OutOfMemory, PlatformGeometry};

// routing/layout
pub use memory::header::{BackingKind, HEADER_SIZE};
pub use memory::select::{SizeClass, decide};

// stats
pub use memory::stats::{StatsError, StatsSnapshot};

// platform
pub use memory::vm::{PAGE_SIZE_2MB, PlatformVmOps, VmError, VmOps};
