use core::alloc::Layout;
use core::fmt;
use core::ptr::NonNull;
use std::alloc::{alloc, dealloc};

use crate::alloc::system::syscall::{self, OS_PAGE_SIZE};

/// Rounds `value` up to the next multiple of `align` (a power of two).
pub const fn align_up(value: usize, align: usize) -> usize {
    if align == 0 {
        value
    } else {
        (value + (align - 1)) & !(align - 1)
    }
}

/// [`align_up`] that returns `None` instead of overflowing.
pub const fn checked_align_up(value: usize, align: usize) -> Option<usize> {
    if align == 0 {
        return Some(value);
    }
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

/// A source of fixed-size pages for the bucket engine.
///
/// Every page a pool uses comes from one of these, and goes back to the same
/// one. Implementations must honor `layout.align()`; pools never ask for more
/// than 4096-byte alignment unless the minimum allocation size is larger.
pub trait PageAlloc: Send + Sync {
    /// Allocates one page of `layout.size()` bytes, or `None` when out of memory.
    fn alloc_page(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// Returns a page.
    ///
    /// # Safety
    /// `page` must come from `alloc_page` on this provider with the same `layout`,
    /// and must not be used afterwards.
    unsafe fn dealloc_page(&self, page: NonNull<u8>, layout: Layout);
}

impl fmt::Debug for dyn PageAlloc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("dyn PageAlloc")
    }
}

/// A page allocator that uses the global Rust allocator.
#[derive(Default, Clone, Copy, Debug)]
pub struct GlobalPageAlloc;

impl PageAlloc for GlobalPageAlloc {
    fn alloc_page(&self, layout: Layout) -> Option<NonNull<u8>> {
        if layout.size() == 0 {
            return None;
        }
        // SAFETY: non-zero size checked above.
        NonNull::new(unsafe { alloc(layout) })
    }

    unsafe fn dealloc_page(&self, page: NonNull<u8>, layout: Layout) {
        dealloc(page.as_ptr(), layout)
    }
}

/// A page allocator that maps pages straight from the OS (mmap/VirtualAlloc).
///
/// Mappings are only OS-page aligned, so layouts asking for more are refused.
#[derive(Default, Clone, Copy, Debug)]
pub struct SyscallPageAlloc;

impl PageAlloc for SyscallPageAlloc {
    fn alloc_page(&self, layout: Layout) -> Option<NonNull<u8>> {
        if layout.align() > OS_PAGE_SIZE {
            return None;
        }
        // SAFETY: released only through `dealloc_page` with the same layout.
        unsafe { syscall::map(layout.size()) }
    }

    unsafe fn dealloc_page(&self, page: NonNull<u8>, layout: Layout) {
        syscall::unmap(page, layout.size());
    }
}
