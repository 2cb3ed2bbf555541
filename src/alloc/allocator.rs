use core::alloc::Layout;
use core::panic::Location;
use core::ptr::NonNull;
use std::sync::Arc;

use crate::alloc::page::PageAlloc;
use crate::error::PoolError;

/// One allocation request with the metadata a record keeps about it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocRequest {
    pub size: usize,
    pub align: usize,
    /// Caller-defined tag, stored in the allocation record.
    pub flags: u32,
    pub name: Option<&'static str>,
    pub file: Option<&'static str>,
    pub line: u32,
    /// Skip the call-stack capture for this request even if the pool records stacks.
    pub suppress_stack_record: bool,
}

impl AllocRequest {
    pub const fn new(size: usize, align: usize) -> Self {
        Self {
            size,
            align,
            flags: 0,
            name: None,
            file: None,
            line: 0,
            suppress_stack_record: false,
        }
    }

    pub const fn named(mut self, name: &'static str) -> Self {
        self.name = Some(name);
        self
    }

    pub const fn at(mut self, file: &'static str, line: u32) -> Self {
        self.file = Some(file);
        self.line = line;
        self
    }

    /// Records the caller's source location.
    #[track_caller]
    pub fn here(self) -> Self {
        let caller = Location::caller();
        self.at(caller.file(), caller.line())
    }

    pub const fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub const fn without_stack_record(mut self) -> Self {
        self.suppress_stack_record = true;
        self
    }
}

impl From<Layout> for AllocRequest {
    fn from(layout: Layout) -> Self {
        Self::new(layout.size(), layout.align())
    }
}

/// The allocator interface pools expose to the rest of a program.
///
/// Pool elements never change size: [`resize`](PoolAlloc::resize) and
/// [`reallocate`](PoolAlloc::reallocate) always fail.
pub trait PoolAlloc {
    /// Allocates one element for `request`.
    ///
    /// # Errors
    /// Fails when the request is too large, its alignment cannot be honored,
    /// or no page can be obtained.
    fn allocate(&self, request: AllocRequest) -> Result<NonNull<u8>, PoolError>;

    /// Frees an element. `size` may be 0 when unknown.
    ///
    /// Bad pointers are reported as heap corruption and otherwise ignored.
    ///
    /// # Safety
    /// `ptr` must not be used after this call.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize, align: usize);

    /// Always 0.
    fn resize(&self, ptr: NonNull<u8>, new_size: usize) -> usize;

    /// Always `Err(PoolError::Unsupported)`.
    fn reallocate(
        &self,
        ptr: NonNull<u8>,
        new_size: usize,
        new_align: usize,
    ) -> Result<NonNull<u8>, PoolError>;

    /// Usable bytes behind `ptr`, 0 if the pointer is not from this pool.
    fn allocation_size(&self, ptr: NonNull<u8>) -> usize;

    fn garbage_collect(&self);

    /// The largest request this pool accepts.
    fn max_contiguous_allocation_size(&self) -> usize;

    fn num_allocated_bytes(&self) -> usize;

    fn capacity(&self) -> usize;

    /// The page source the pool was given, if it was not the default one.
    fn sub_allocator(&self) -> Option<Arc<dyn PageAlloc>>;
}
