//! Allocation records, guard bytes and corruption reporting layered over any
//! sharding strategy.

mod records;

use core::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;

use crate::alloc::allocator::AllocRequest;
use crate::alloc::descriptor::{Descriptor, PoolGeometry};
use crate::error::{Corruption, CorruptionKind};

pub use self::records::{AllocationRecord, AllocationRecords};

/// Byte written after every allocation when memory guards are on.
pub const GUARD_VALUE: u8 = 0xFD;

/// Byte freed elements are filled with when unallocated memory is marked.
pub const UNALLOCATED_MARK: u8 = 0xCD;

/// What a pool tells an external allocation tracker about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DebugConfig {
    /// `true` when the pool keeps no records of its own.
    pub exclude_from_debugging: bool,
    pub stack_record_levels: u8,
    pub marks_unallocated_memory: bool,
    pub uses_memory_guards: bool,
}

impl DebugConfig {
    pub fn from_descriptor(desc: &Descriptor) -> Self {
        Self {
            exclude_from_debugging: !desc.allocation_records,
            stack_record_levels: desc.stack_record_levels,
            marks_unallocated_memory: desc.mark_unallocated_memory,
            uses_memory_guards: desc.uses_guards(),
        }
    }
}

pub(crate) struct DebugLayer {
    config: DebugConfig,
    guard: usize,
    records: Option<AllocationRecords>,
    corruptions: AtomicUsize,
}

impl DebugLayer {
    pub(crate) fn new(desc: &Descriptor, geometry: &PoolGeometry) -> Self {
        Self {
            config: DebugConfig::from_descriptor(desc),
            guard: geometry.guard,
            records: desc.allocation_records.then(AllocationRecords::default),
            corruptions: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub(crate) fn config(&self) -> DebugConfig {
        self.config
    }

    #[inline]
    pub(crate) fn records(&self) -> Option<&AllocationRecords> {
        self.records.as_ref()
    }

    /// Bytes to request from the engine for a caller request of `size`.
    #[inline]
    pub(crate) fn inner_size(&self, size: usize) -> usize {
        size + self.guard
    }

    /// Caller-usable bytes of an element of `element_size`.
    #[inline]
    pub(crate) fn usable_size(&self, element_size: usize) -> usize {
        element_size.saturating_sub(self.guard)
    }

    pub(crate) fn corruption_events(&self) -> usize {
        self.corruptions.load(Ordering::Relaxed)
    }

    /// Writes the guard and records a fresh allocation.
    ///
    /// # Safety
    /// `ptr` must address at least `inner_size(request.size)` writable bytes.
    pub(crate) unsafe fn on_allocate(&self, ptr: NonNull<u8>, request: &AllocRequest) {
        if self.guard > 0 {
            ptr.as_ptr().add(request.size).write_bytes(GUARD_VALUE, self.guard);
        }
        if let Some(records) = &self.records {
            records.insert(
                ptr.as_ptr(),
                AllocationRecord::new(request, self.config.stack_record_levels),
            );
        }
    }

    /// Checks a pointer on its way back. Returns the size hint to pass to the
    /// engine, or `None` if the free must be skipped.
    ///
    /// A damaged guard is reported but the free still goes ahead.
    ///
    /// # Safety
    /// If records are on and `ptr` is recorded, its element must still be live.
    pub(crate) unsafe fn on_deallocate(&self, pool: &str, ptr: NonNull<u8>, size: usize) -> Option<usize> {
        let Some(records) = &self.records else {
            return Some(size);
        };
        let Some(record) = records.remove(ptr.as_ptr()) else {
            self.report(pool, Corruption::new(CorruptionKind::UnknownPointer, ptr.as_ptr()));
            return None;
        };

        if self.guard > 0 {
            let guard = core::slice::from_raw_parts(ptr.as_ptr().add(record.size), self.guard);
            if guard.iter().any(|&b| b != GUARD_VALUE) {
                self.report(pool, Corruption::new(CorruptionKind::GuardOverrun, ptr.as_ptr()));
                tracing::error!(
                    allocator = pool,
                    size = record.size,
                    name = record.name,
                    file = record.file,
                    line = record.line,
                    "overrun allocation"
                );
            }
        }
        Some(self.inner_size(record.size))
    }

    pub(crate) fn report(&self, pool: &str, corruption: Corruption) {
        self.corruptions.fetch_add(1, Ordering::Relaxed);
        tracing::error!(allocator = pool, ptr = corruption.ptr, kind = ?corruption.kind, "heap corruption: {corruption}");
    }

    /// Logs every allocation still live and forgets it.
    pub(crate) fn report_leaks(&self, pool: &str) -> usize {
        let Some(records) = &self.records else {
            return 0;
        };
        let leaks = records.drain();
        for (addr, record) in &leaks {
            tracing::warn!(
                allocator = pool,
                ptr = addr,
                size = record.size,
                name = record.name,
                file = record.file,
                line = record.line,
                "leaked allocation"
            );
        }
        leaks.len()
    }
}
