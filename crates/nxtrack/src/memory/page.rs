//! Page Alignment Helpers
//!
//! Handles are protected at page granularity. These helpers turn an
//! arbitrary `(address, size)` request into the page-aligned range that
//! encloses it. `page_size` must be a power of two.

/// System page size, as reported by the OS
pub fn system_page_size() -> u64 {
    page_size::get() as u64
}

/// Align address down to a page boundary
#[inline]
pub fn align_down(address: u64, page_size: u64) -> u64 {
    address & !(page_size - 1)
}

/// Align address up to a page boundary
#[inline]
pub fn align_up(address: u64, page_size: u64) -> u64 {
    (address + page_size - 1) & !(page_size - 1)
}

/// Check if value is page-aligned
#[inline]
pub fn is_page_aligned(value: u64, page_size: u64) -> bool {
    value & (page_size - 1) == 0
}

/// Smallest page-aligned range enclosing `[address, address + size)`
#[inline]
pub fn page_align(address: u64, size: u64, page_size: u64) -> (u64, u64) {
    let start = align_down(address, page_size);
    let end = align_up(address + size, page_size);
    (start, end - start)
}
