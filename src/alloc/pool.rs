//! The public pool types.
//!
//! [`Pool`] puts the debug layer in front of a [`Sharding`] strategy:
//! [`SingleInstance`] is one engine for one caller, [`ThreadLocalRouter`] is
//! one engine per thread. The two ready-made flavors are [`PoolAllocator`] and
//! [`ThreadPoolAllocator`].

use core::cell::RefCell;
use core::ptr::NonNull;
use std::sync::Arc;

use serde::Serialize;

use crate::alloc::allocator::{AllocRequest, PoolAlloc};
use crate::alloc::bucket::BucketAllocator;
use crate::alloc::debug::{AllocationRecords, DebugConfig, DebugLayer};
use crate::alloc::descriptor::{Descriptor, PoolGeometry};
use crate::alloc::manager::AllocatorManager;
use crate::alloc::page::{GlobalPageAlloc, PageAlloc};
use crate::alloc::thread::{KeyedSlot, ThreadLocalRouter, ThreadSlot};
use crate::error::{Corruption, FreeError, PoolError};

/// How a pool spreads its engines over callers.
pub trait Sharding: Send {
    /// Name used when a pool is built without one.
    const DEFAULT_NAME: &'static str;
    /// Registry kind.
    const KIND: &'static str;

    fn create(
        geometry: PoolGeometry,
        provider: Arc<dyn PageAlloc>,
        manager: &Arc<AllocatorManager>,
    ) -> Result<Self, PoolError>
    where
        Self: Sized;

    fn allocate(&self, size: usize, align: usize) -> Result<NonNull<u8>, PoolError>;

    /// # Safety
    /// `ptr` must not be used after this call.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) -> Result<(), FreeError>;

    /// Element size behind `ptr`, 0 if not ours.
    fn allocation_size(&self, ptr: *const u8) -> usize;

    /// Returns the number of pages detached.
    fn garbage_collect(&self) -> usize;

    fn num_allocated_bytes(&self) -> usize;

    fn capacity(&self) -> usize;

    /// Number of engines in use.
    fn shard_count(&self) -> usize;

    fn destroy(&self);
}

/// A single engine. Not `Sync`: callers sharing one across threads must wrap
/// it in their own lock.
pub struct SingleInstance {
    engine: RefCell<BucketAllocator>,
}

impl Sharding for SingleInstance {
    const DEFAULT_NAME: &'static str = "PoolAllocator";
    const KIND: &'static str = "pool";

    fn create(
        geometry: PoolGeometry,
        provider: Arc<dyn PageAlloc>,
        _manager: &Arc<AllocatorManager>,
    ) -> Result<Self, PoolError> {
        let mut engine = BucketAllocator::new();
        engine.create_with(geometry, provider)?;
        Ok(Self { engine: RefCell::new(engine) })
    }

    fn allocate(&self, size: usize, align: usize) -> Result<NonNull<u8>, PoolError> {
        self.engine.borrow_mut().allocate(size, align)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) -> Result<(), FreeError> {
        self.engine.borrow_mut().deallocate(ptr, size)
    }

    fn allocation_size(&self, ptr: *const u8) -> usize {
        self.engine.borrow().allocation_size(ptr)
    }

    fn garbage_collect(&self) -> usize {
        self.engine.borrow_mut().garbage_collect()
    }

    fn num_allocated_bytes(&self) -> usize {
        self.engine.borrow().num_allocated_bytes()
    }

    fn capacity(&self) -> usize {
        self.engine.borrow().capacity()
    }

    fn shard_count(&self) -> usize {
        usize::from(self.engine.borrow().is_initialized())
    }

    fn destroy(&self) {
        self.engine.borrow_mut().destroy();
    }
}

impl<S: ThreadSlot> Sharding for ThreadLocalRouter<S> {
    const DEFAULT_NAME: &'static str = "ThreadPoolAllocator";
    const KIND: &'static str = "thread_pool";

    fn create(
        geometry: PoolGeometry,
        provider: Arc<dyn PageAlloc>,
        manager: &Arc<AllocatorManager>,
    ) -> Result<Self, PoolError> {
        Ok(ThreadLocalRouter::new(geometry, provider, Arc::clone(manager)))
    }

    fn allocate(&self, size: usize, align: usize) -> Result<NonNull<u8>, PoolError> {
        ThreadLocalRouter::allocate(self, size, align)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) -> Result<(), FreeError> {
        ThreadLocalRouter::deallocate(self, ptr, size)
    }

    fn allocation_size(&self, ptr: *const u8) -> usize {
        ThreadLocalRouter::allocation_size(self, ptr)
    }

    fn garbage_collect(&self) -> usize {
        ThreadLocalRouter::garbage_collect(self)
    }

    fn num_allocated_bytes(&self) -> usize {
        ThreadLocalRouter::num_allocated_bytes(self)
    }

    fn capacity(&self) -> usize {
        ThreadLocalRouter::capacity(self)
    }

    fn shard_count(&self) -> usize {
        ThreadLocalRouter::shard_count(self)
    }

    fn destroy(&self) {
        ThreadLocalRouter::destroy(self)
    }
}

/// Single-threaded pool. Use one per thread or guard it with a lock.
pub type PoolAllocator = Pool<SingleInstance>;

/// Pool with one engine per calling thread; may be shared freely.
///
/// Every allocation locks the calling thread's shard. That lock is a
/// `parking_lot` mutex only contended by frees from other threads and by
/// pool-wide calls such as [`garbage_collect`](PoolAlloc::garbage_collect),
/// so the common path is one uncontended atomic acquire and release.
pub type ThreadPoolAllocator = Pool<ThreadLocalRouter<KeyedSlot>>;

/// Point-in-time numbers for one pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub name: String,
    pub num_allocated_bytes: usize,
    pub capacity: usize,
    pub live_records: usize,
    pub corruption_events: usize,
    pub shards: usize,
}

struct Live<S> {
    sharding: S,
    debug: DebugLayer,
    geometry: PoolGeometry,
    sub_allocator: Option<Arc<dyn PageAlloc>>,
    registration: u64,
}

/// A fixed-size-class pool with optional debug instrumentation.
///
/// Built in two steps: [`Pool::new`] names it, [`Pool::create`] sizes it.
pub struct Pool<S: Sharding> {
    name: String,
    description: String,
    manager: Arc<AllocatorManager>,
    live: Option<Live<S>>,
}

impl<S: Sharding> Pool<S> {
    /// An uncreated pool registered with the global manager once created.
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self::with_manager(name, description, AllocatorManager::global())
    }

    pub fn with_manager(
        name: impl Into<String>,
        description: impl Into<String>,
        manager: Arc<AllocatorManager>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            manager,
            live: None,
        }
    }

    /// Shorthand for `new` + `create` with the default name.
    pub fn with_descriptor(desc: &Descriptor) -> Result<Self, PoolError> {
        let mut pool = Self::new(S::DEFAULT_NAME, "");
        pool.create(desc)?;
        Ok(pool)
    }

    /// Sizes the pool and registers it with its manager.
    ///
    /// # Errors
    /// [`PoolError::AlreadyInitialized`] on a created pool; descriptor and
    /// page provider errors otherwise.
    pub fn create(&mut self, desc: &Descriptor) -> Result<(), PoolError> {
        if self.live.is_some() {
            return Err(PoolError::AlreadyInitialized);
        }
        let geometry = desc.normalize()?;
        let provider = desc
            .page_allocator
            .clone()
            .unwrap_or_else(|| Arc::new(GlobalPageAlloc));
        let sharding = S::create(geometry, provider, &self.manager)?;
        let registration = self.manager.register(&self.name, &self.description, S::KIND);

        tracing::debug!(
            allocator = %self.name,
            kind = S::KIND,
            max = geometry.visible_max,
            page_size = geometry.page_size(),
            records = desc.allocation_records,
            guards = desc.uses_guards(),
            "pool created"
        );
        self.live = Some(Live {
            sharding,
            debug: DebugLayer::new(desc, &geometry),
            geometry,
            sub_allocator: desc.page_allocator.clone(),
            registration,
        });
        Ok(())
    }

    /// Releases every page and unregisters. Live allocations are logged as
    /// leaks. Safe to call more than once.
    pub fn destroy(&mut self) {
        if let Some(live) = self.live.take() {
            let leaks = live.debug.report_leaks(&self.name);
            live.sharding.destroy();
            self.manager.unregister(live.registration);
            tracing::debug!(allocator = %self.name, leaks, "pool destroyed");
        }
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        self.live.is_some()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn manager(&self) -> &Arc<AllocatorManager> {
        &self.manager
    }

    pub fn geometry(&self) -> Option<&PoolGeometry> {
        self.live.as_ref().map(|l| &l.geometry)
    }

    /// Debug settings for an external allocation tracker.
    pub fn debug_config(&self) -> Option<DebugConfig> {
        self.live.as_ref().map(|l| l.debug.config())
    }

    /// Live allocation records, when the pool keeps them.
    pub fn records(&self) -> Option<&AllocationRecords> {
        self.live.as_ref().and_then(|l| l.debug.records())
    }

    pub fn corruption_events(&self) -> usize {
        self.live.as_ref().map_or(0, |l| l.debug.corruption_events())
    }

    pub fn stats(&self) -> PoolStats {
        let (num_allocated_bytes, capacity, shards) = self.live.as_ref().map_or((0, 0, 0), |l| {
            (
                l.sharding.num_allocated_bytes(),
                l.sharding.capacity(),
                l.sharding.shard_count(),
            )
        });
        PoolStats {
            name: self.name.clone(),
            num_allocated_bytes,
            capacity,
            live_records: self.records().map_or(0, AllocationRecords::len),
            corruption_events: self.corruption_events(),
            shards,
        }
    }

    /// Like [`PoolAlloc::garbage_collect`], returning how many pages were detached.
    pub fn collect_pages(&self) -> usize {
        self.live.as_ref().map_or(0, |l| l.sharding.garbage_collect())
    }
}

impl<S: Sharding> PoolAlloc for Pool<S> {
    fn allocate(&self, request: AllocRequest) -> Result<NonNull<u8>, PoolError> {
        let live = self.live.as_ref().ok_or(PoolError::NotInitialized)?;
        if request.size > live.geometry.visible_max {
            return Err(PoolError::TooLarge {
                size: request.size,
                max: live.geometry.visible_max,
            });
        }
        let ptr = live
            .sharding
            .allocate(live.debug.inner_size(request.size), request.align)
            .map_err(|err| match err {
                // The engine only sees the guarded size.
                PoolError::TooLarge { .. } => PoolError::TooLarge {
                    size: request.size,
                    max: live.geometry.visible_max,
                },
                other => other,
            })?;
        // SAFETY: the element holds at least size + guard bytes.
        unsafe { live.debug.on_allocate(ptr, &request) };
        Ok(ptr)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize, _align: usize) {
        let Some(live) = self.live.as_ref() else {
            tracing::error!(allocator = %self.name, ptr = ptr.as_ptr() as usize, "free on a pool that is not created");
            return;
        };
        let Some(hint) = live.debug.on_deallocate(&self.name, ptr, size) else {
            return;
        };
        if let Err(err) = live.sharding.deallocate(ptr, hint) {
            live.debug.report(&self.name, Corruption::new(err.into(), ptr.as_ptr()));
        }
    }

    fn resize(&self, ptr: NonNull<u8>, new_size: usize) -> usize {
        tracing::warn!(allocator = %self.name, ptr = ptr.as_ptr() as usize, new_size, "resize is not supported by pool allocators");
        0
    }

    fn reallocate(
        &self,
        ptr: NonNull<u8>,
        new_size: usize,
        _new_align: usize,
    ) -> Result<NonNull<u8>, PoolError> {
        tracing::warn!(allocator = %self.name, ptr = ptr.as_ptr() as usize, new_size, "reallocate is not supported by pool allocators");
        Err(PoolError::Unsupported("reallocate"))
    }

    fn allocation_size(&self, ptr: NonNull<u8>) -> usize {
        self.live.as_ref().map_or(0, |l| {
            l.debug.usable_size(l.sharding.allocation_size(ptr.as_ptr()))
        })
    }

    fn garbage_collect(&self) {
        self.collect_pages();
    }

    fn max_contiguous_allocation_size(&self) -> usize {
        self.live.as_ref().map_or(0, |l| l.geometry.visible_max)
    }

    fn num_allocated_bytes(&self) -> usize {
        self.live.as_ref().map_or(0, |l| l.sharding.num_allocated_bytes())
    }

    fn capacity(&self) -> usize {
        self.live.as_ref().map_or(0, |l| l.sharding.capacity())
    }

    fn sub_allocator(&self) -> Option<Arc<dyn PageAlloc>> {
        self.live.as_ref().and_then(|l| l.sub_allocator.clone())
    }
}

impl<S: Sharding> Drop for Pool<S> {
    fn drop(&mut self) {
        self.destroy();
    }
}
