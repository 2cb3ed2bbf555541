//! Construction-time configuration for pool allocators.

use core::alloc::Layout;
use core::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::alloc::page::{checked_align_up, PageAlloc};
use crate::error::PoolError;

/// Smallest element size any bucket may have.
pub const MIN_ELEMENT_SIZE: usize = 8;

/// Page alignment requested from providers when the page size allows it.
pub const MAX_PAGE_ALIGN: usize = 4096;

/// Bytes of guard value placed after each user region when guards are on.
pub const GUARD_SIZE: usize = 4;

/// Pool configuration.
///
/// Every field has a default, so partial JSON documents are accepted:
///
/// ```
/// use shardpool::Descriptor;
///
/// let desc = Descriptor::from_json(r#"{ "max_allocation_size": 256, "memory_guards": true }"#).unwrap();
/// assert_eq!(desc.page_size, 4096);
/// assert_eq!(desc.max_allocation_size, 256);
/// ```
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Descriptor {
    /// Bytes per page.
    pub page_size: usize,
    /// Smallest bucket; raised to at least 8 and to a power of two.
    pub min_allocation_size: usize,
    /// Largest request the pool accepts.
    pub max_allocation_size: usize,
    /// Whether pages beyond `num_static_pages` may be requested on demand.
    pub is_dynamic: bool,
    /// Pages acquired up front. In static mode this is the whole budget.
    pub num_static_pages: usize,
    /// Page source. `None` uses the global Rust allocator.
    #[serde(skip)]
    pub page_allocator: Option<Arc<dyn PageAlloc>>,
    /// Keep a record (size, name, file, line, stack) for every live allocation.
    pub allocation_records: bool,
    /// Stamp freed elements with [`UNALLOCATED_MARK`](crate::alloc::debug::UNALLOCATED_MARK).
    pub mark_unallocated_memory: bool,
    /// Place a guard value after every allocation. Needs `allocation_records`.
    pub memory_guards: bool,
    /// Frames of call stack kept per record; 0 disables stack capture.
    pub stack_record_levels: u8,
}

impl Default for Descriptor {
    fn default() -> Self {
        Self {
            page_size: 4 * 1024,
            min_allocation_size: 8,
            max_allocation_size: 512,
            is_dynamic: true,
            num_static_pages: 0,
            page_allocator: None,
            allocation_records: false,
            mark_unallocated_memory: false,
            memory_guards: false,
            stack_record_levels: 0,
        }
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Descriptor")
            .field("page_size", &self.page_size)
            .field("min_allocation_size", &self.min_allocation_size)
            .field("max_allocation_size", &self.max_allocation_size)
            .field("is_dynamic", &self.is_dynamic)
            .field("num_static_pages", &self.num_static_pages)
            .field("page_allocator", &self.page_allocator.is_some())
            .field("allocation_records", &self.allocation_records)
            .field("mark_unallocated_memory", &self.mark_unallocated_memory)
            .field("memory_guards", &self.memory_guards)
            .field("stack_record_levels", &self.stack_record_levels)
            .finish()
    }
}

impl Descriptor {
    /// Parses a descriptor from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Uses `provider` as the page source.
    pub fn with_page_allocator(mut self, provider: Arc<dyn PageAlloc>) -> Self {
        self.page_allocator = Some(provider);
        self
    }

    /// Whether a trailing guard value is written after each allocation.
    pub fn uses_guards(&self) -> bool {
        self.memory_guards && self.allocation_records
    }

    /// Resolves the descriptor into the sizes the bucket engine works with.
    ///
    /// `max_allocation_size` stays the caller-visible limit; the returned
    /// `bucket_max` may be larger to fit the guard value. Sizes that overflow
    /// the address space are rejected instead of wrapping.
    pub fn normalize(&self) -> Result<PoolGeometry, PoolError> {
        let min = self
            .min_allocation_size
            .max(MIN_ELEMENT_SIZE)
            .checked_next_power_of_two()
            .ok_or(PoolError::InvalidDescriptor("min_allocation_size is too large"))?;
        let visible_max = self.max_allocation_size.max(min);
        let guard = if self.uses_guards() { GUARD_SIZE } else { 0 };
        let bucket_max = guarded_bucket_max(visible_max, min, guard)
            .ok_or(PoolError::InvalidDescriptor("max_allocation_size is too large"))?;
        let page_size = checked_align_up(self.page_size.max(bucket_max), min)
            .ok_or(PoolError::InvalidDescriptor("page_size is too large"))?;

        // Elements are indexed with 32 bits inside a page.
        if page_size / min > u32::MAX as usize {
            return Err(PoolError::InvalidDescriptor("page holds more than u32::MAX elements"));
        }
        if self.num_static_pages.checked_mul(page_size).is_none() {
            return Err(PoolError::InvalidDescriptor("num_static_pages overflows the address space"));
        }

        // Largest power of two dividing the page size; always >= min here.
        let natural = page_size & page_size.wrapping_neg();
        let page_align = natural.min(MAX_PAGE_ALIGN).max(min);
        let page_layout = Layout::from_size_align(page_size, page_align)
            .map_err(|_| PoolError::InvalidDescriptor("page size overflows a layout"))?;

        Ok(PoolGeometry {
            min_allocation_size: min,
            visible_max,
            bucket_max,
            guard,
            page_layout,
            is_dynamic: self.is_dynamic,
            num_static_pages: self.num_static_pages,
            mark_unallocated: self.mark_unallocated_memory,
        })
    }
}

/// Element size of the last bucket.
///
/// Without guards this is `visible_max` rounded to `min`. With guards it must
/// also hold `size + guard` rounded up to any alignment the unguarded pool
/// would have accepted for `size`. That rounding adds at most one alignment
/// step, and no accepted alignment exceeds the unguarded maximum or
/// [`MAX_PAGE_ALIGN`].
fn guarded_bucket_max(visible_max: usize, min: usize, guard: usize) -> Option<usize> {
    let base = checked_align_up(visible_max, min)?;
    if guard == 0 {
        return Some(base);
    }
    let widest_align = 1usize << (usize::BITS - 1 - base.min(MAX_PAGE_ALIGN).leading_zeros());
    base.checked_add(widest_align.max(min))
}

/// The normalized sizes derived from a [`Descriptor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolGeometry {
    pub min_allocation_size: usize,
    /// Largest request callers may make.
    pub visible_max: usize,
    /// Element size of the last bucket.
    pub bucket_max: usize,
    /// Guard bytes appended to every request (0 when guards are off).
    pub guard: usize,
    pub page_layout: Layout,
    pub is_dynamic: bool,
    pub num_static_pages: usize,
    /// Fill elements with the unallocated mark when they are freed.
    pub mark_unallocated: bool,
}

impl PoolGeometry {
    pub fn page_size(&self) -> usize {
        self.page_layout.size()
    }

    pub fn page_align(&self) -> usize {
        self.page_layout.align()
    }

    /// Number of buckets: `(max - min) / min + 1`.
    pub fn bucket_count(&self) -> usize {
        (self.bucket_max - self.min_allocation_size) / self.min_allocation_size + 1
    }
}
