//! Block/user-pointer arithmetic for large allocations.
//!
//! A large allocation is a *block* (a mapping or a platform allocation) with
//! the user-visible pointer somewhere inside it:
//!
//! ```text
//! base                      user - HEADER_SIZE   user
//! |<-------------- header_offset --------------->|
//! [ padding (alignment slack) ][ LargeHeader     ][ user data (size) ... ]
//! |<------------------------- extent ---------------------------------->|
//! ```
//!
//! The header always ends exactly at the user pointer, so it is found at a
//! fixed displacement without knowing `header_offset`. The recorded offset is
//! only used to get back to `base` for the release call. All unsafe pointer
//! arithmetic of the allocator lives in this module.

use std::alloc::Layout;
use std::fmt;
use std::mem::{align_of, size_of};
use std::ptr::NonNull;

/// `b"HUGE"`; written into every live header and cleared on release.
const HEADER_MAGIC: u32 = 0x4855_4745;

/// Size of the metadata record preceding every large allocation.
pub const HEADER_SIZE: usize = size_of::<LargeHeader>();

/// Minimum alignment of a block start, so the header is always aligned.
pub(crate) const HEADER_ALIGN: usize = align_of::<LargeHeader>();

/// Memory source that ultimately satisfied a large request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BackingKind {
    /// Platform default allocator (last resort).
    System = 1,
    /// Anonymous mapping with regular pages.
    RegularPage = 2,
    /// Anonymous mapping with huge pages.
    HugePage = 3,
}

impl BackingKind {
    pub(crate) const fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(BackingKind::System),
            2 => Some(BackingKind::RegularPage),
            3 => Some(BackingKind::HugePage),
            _ => None,
        }
    }
}

#[repr(C)]
struct LargeHeader {
    magic: u32,
    backing: u8,
    _pad: [u8; 3],
    header_offset: usize,
    mapped_extent: usize,
}

/// Why a header could not be trusted on release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HeaderError {
    Misaligned,
    BadMagic,
    UnknownBacking,
    BadOffset,
    BadExtent,
}

impl HeaderError {
    /// Static message for the abort path (no formatting, no allocation).
    pub(crate) const fn as_str(self) -> &'static str {
        match self {
            HeaderError::Misaligned => "released pointer does not satisfy its layout alignment",
            HeaderError::BadMagic => "large allocation header missing or corrupt (bad magic)",
            HeaderError::UnknownBacking => "large allocation header records an unknown backing",
            HeaderError::BadOffset => "large allocation header records an impossible offset",
            HeaderError::BadExtent => "large allocation header extent does not cover the request",
        }
    }
}

impl fmt::Display for HeaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The underlying region of a large allocation. Owns the memory; the user
/// pointer is a derived view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Block {
    pub base: NonNull<u8>,
    pub extent: usize,
    pub backing: BackingKind,
}

/// Worst-case block length for `size` bytes at `align`, when the block start
/// is only guaranteed to be aligned to `granularity`.
///
/// If the block is at least `align`-aligned the user pointer sits at
/// `round_up(HEADER_SIZE, align)`. A coarser block (a regular mapping for a
/// request aligned above the page size) needs `align - granularity` bytes of
/// slack on top of that.
pub(crate) const fn block_len(size: usize, align: usize, granularity: usize) -> Option<usize> {
    let Some(offset) = HEADER_SIZE.checked_next_multiple_of(align) else {
        return None;
    };
    let slack = align.saturating_sub(granularity);
    match offset.checked_add(slack) {
        Some(prefix) => prefix.checked_add(size),
        None => None,
    }
}

/// Layout handed to the platform allocator for a large request on the
/// last-resort path. The same layout is rebuilt on release from the recorded
/// extent and the caller's alignment.
pub(crate) fn system_layout(extent: usize, align: usize) -> Option<Layout> {
    Layout::from_size_align(extent, align.max(HEADER_ALIGN)).ok()
}

/// Offset of the user pointer inside a block starting at `base_addr`.
fn user_offset(base_addr: usize, align: usize) -> Option<usize> {
    let user = base_addr.checked_add(HEADER_SIZE)?.checked_next_multiple_of(align)?;
    Some(user - base_addr)
}

/// Write the header into `block` and return the user pointer.
///
/// Fails (returning the block untouched) when the block cannot hold `size`
/// bytes at `align` after the header; the caller releases it and moves on to
/// the next backing.
///
/// # Safety
/// `block` must be a live, writable region of `block.extent` bytes whose start
/// is aligned to at least [`HEADER_ALIGN`].
pub(crate) unsafe fn place(block: Block, size: usize, align: usize) -> Result<NonNull<u8>, Block> {
    debug_assert!(block.base.as_ptr() as usize % HEADER_ALIGN == 0);

    let Some(offset) = user_offset(block.base.as_ptr() as usize, align) else {
        return Err(block);
    };
    if offset.checked_add(size).is_none_or(|end| end > block.extent) {
        return Err(block);
    }

    // Safety: offset + size <= extent, so both pointers are inside the block.
    // base and HEADER_SIZE are multiples of HEADER_ALIGN, so user (and the
    // header ending at it) is HEADER_ALIGN-aligned whatever `align` is.
    unsafe {
        let user = block.base.add(offset);
        let header = user.sub(HEADER_SIZE).cast::<LargeHeader>();
        header.write(LargeHeader {
            magic: HEADER_MAGIC,
            backing: block.backing as u8,
            _pad: [0; 3],
            header_offset: offset,
            mapped_extent: block.extent,
        });
        Ok(user)
    }
}

/// Validate the header preceding `user` and recover its block.
///
/// # Safety
/// The `HEADER_SIZE` bytes before `user` must be readable, which holds for
/// any pointer returned by [`place`] that has not been released yet.
pub(crate) unsafe fn read(user: NonNull<u8>, size: usize, align: usize) -> Result<Block, HeaderError> {
    if user.as_ptr() as usize % align.max(HEADER_ALIGN) != 0 {
        return Err(HeaderError::Misaligned);
    }

    // Safety: upheld by caller; alignment checked above.
    let header = unsafe { user.sub(HEADER_SIZE).cast::<LargeHeader>().read() };

    if header.magic != HEADER_MAGIC {
        return Err(HeaderError::BadMagic);
    }
    let backing = BackingKind::from_raw(header.backing).ok_or(HeaderError::UnknownBacking)?;
    let offset = header.header_offset;
    if offset < HEADER_SIZE || offset > user.as_ptr() as usize {
        return Err(HeaderError::BadOffset);
    }
    if header.mapped_extent < offset || header.mapped_extent - offset < size {
        return Err(HeaderError::BadExtent);
    }

    Ok(Block {
        // Safety: offset <= address of user; the block start precedes it
        // inside the same allocation.
        base: unsafe { user.sub(offset) },
        extent: header.mapped_extent,
        backing,
    })
}

/// Consume the header preceding `user`: validate it, clear its magic, and
/// return the block to release. Aborts the process on an invalid header,
/// since releasing a guessed region could corrupt unrelated memory.
///
/// # Safety
/// Same as [`read`]; additionally `user` must not be used after this call.
pub(crate) unsafe fn take(user: NonNull<u8>, size: usize, align: usize) -> Block {
    // Safety: upheld by caller.
    match unsafe { read(user, size, align) } {
        Ok(block) => {
            // Safety: the header was just validated in place.
            unsafe {
                let header = user.sub(HEADER_SIZE).cast::<LargeHeader>();
                (&raw mut (*header.as_ptr()).magic).write(0);
            }
            block
        }
        Err(e) => contract_violation(e.as_str()),
    }
}

/// Write `parts` to stderr with raw `write(2)` calls. Never allocates or
/// locks, so it is usable from inside the allocator.
pub(crate) fn write_stderr(parts: &[&[u8]]) {
    #[cfg(unix)]
    for part in parts {
        // Safety: FFI call to write with a valid buffer; errors ignored.
        unsafe { libc::write(2, part.as_ptr().cast::<libc::c_void>(), part.len()) };
    }
    #[cfg(not(unix))]
    let _ = parts;
}

/// Decimal text of `value`, rendered into `buf`.
#[cfg_attr(not(debug_assertions), allow(dead_code))]
pub(crate) fn format_decimal(value: i32, buf: &mut [u8; 11]) -> &[u8] {
    let mut n = value.unsigned_abs();
    let mut pos = buf.len();
    loop {
        pos -= 1;
        buf[pos] = b"0123456789"[(n % 10) as usize];
        n /= 10;
        if n == 0 {
            break;
        }
    }
    if value < 0 {
        pos -= 1;
        buf[pos] = b'-';
    }
    &buf[pos..]
}

/// Report a broken allocator contract and abort.
///
/// Writes straight to fd 2: formatting or buffering could allocate, and the
/// allocator is in an unknown state.
#[cold]
pub(crate) fn contract_violation(reason: &'static str) -> ! {
    write_stderr(&[b"[hugepage-alloc] fatal: ", reason.as_bytes(), b"\n"]);
    std::process::abort()
}
