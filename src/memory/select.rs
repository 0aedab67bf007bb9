/// Routing decision for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeClass {
    /// Forwarded to the platform allocator, no header.
    Small,
    /// Eligible for huge pages; always carries a header.
    Large,
}

/// Classify a request.
///
/// Evaluated once when a block is allocated and again when it is released;
/// both evaluations see the same `(size, align)` and the same immutable
/// configuration, so they agree. Over-aligned requests (`align` above the huge
/// page size) are always small: no mapping can promise that alignment.
#[inline]
#[must_use]
pub const fn decide(size: usize, align: usize, threshold: usize, huge_page_size: usize) -> SizeClass {
    if align <= huge_page_size && size >= threshold {
        SizeClass::Large
    } else {
        SizeClass::Small
    }
}
