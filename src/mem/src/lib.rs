mod access_type;
mod addr;

pub use access_type::AccessType;
pub use addr::*;

pub const PAGE_SHIFT: i32 = 12;
pub const PAGE_SIZE: i32 = 1 << PAGE_SHIFT;

/// Page-aligned offset within a backing object, in pages.
pub type PgOff = u64;

#[inline]
pub fn bytes_to_pgoff(offset: u64) -> PgOff {
    offset >> PAGE_SHIFT
}

/// Number of whole-or-partial pages covering `size` bytes.
#[inline]
pub fn size_in_pages(size: u64) -> u64 {
    (size + PAGE_SIZE as u64 - 1) >> PAGE_SHIFT
}
