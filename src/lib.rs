//! # `shardpool` - fixed-size-class pool allocators
//!
//! Pools serve small, frequently churned allocations from per-size buckets.
//! Each bucket is a free stack of equally sized elements cut out of pages, so
//! allocation and free are O(1) and never touch the general-purpose heap once
//! the pages exist.
//!
//! ## Flavors
//!
//! - [`PoolAllocator`]: one engine, single-threaded (`!Sync`).
//! - [`ThreadPoolAllocator`]: one engine per calling thread. Any thread may
//!   free any element; the free is routed to the engine that owns its page.
//!
//! Both are [`Pool`]s over a [`Sharding`] strategy and implement [`PoolAlloc`].
//! Custom thread pools with their own thread-local slot are declared with
//! [`thread_slot!`].
//!
//! ## Debugging
//!
//! A [`Descriptor`] can turn on allocation records (with optional call
//! stacks), trailing guard bytes and stamping of freed memory. Heap corruption
//! found at free time is logged through `tracing` and counted; it never panics.
//!
//! ## Example
//!
//! ```rust
//! use shardpool::{AllocRequest, Descriptor, PoolAlloc, PoolAllocator};
//!
//! let mut pool = PoolAllocator::new("Particles", "short-lived particle nodes");
//! pool.create(&Descriptor::default()).unwrap();
//!
//! let p = pool.allocate(AllocRequest::new(48, 8).named("node")).unwrap();
//! assert_eq!(pool.allocation_size(p), 48);
//! unsafe { pool.deallocate(p, 48, 8) };
//!
//! pool.garbage_collect();
//! assert_eq!(pool.capacity(), 0);
//! ```

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod alloc;
pub mod error;
mod sync;

pub use alloc::{
    AllocRequest, AllocationRecord, AllocationRecords, AllocatorInfo, AllocatorManager, BucketAllocator,
    DebugConfig, Descriptor, GlobalPageAlloc, KeyedSlot, PageAlloc, Pool, PoolAlloc, PoolAllocator,
    PoolGeometry, PoolStats, Sharding, SingleInstance, SlotKey, SyscallPageAlloc, ThreadLocalRouter,
    ThreadPoolAllocator, ThreadPoolData, ThreadSlot,
};
pub use error::{Corruption, CorruptionKind, FreeError, PoolError};

// Compile-time checks on the element layout.
const _: () = {
    use crate::alloc::descriptor::{GUARD_SIZE, MAX_PAGE_ALIGN, MIN_ELEMENT_SIZE};

    assert!(MIN_ELEMENT_SIZE.is_power_of_two());
    assert!(MAX_PAGE_ALIGN.is_power_of_two());
    // A guard always fits in one extra minimum-sized step.
    assert!(GUARD_SIZE < MIN_ELEMENT_SIZE);
};
