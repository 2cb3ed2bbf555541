//! Thread-sharded routing over per-thread bucket engines.
//!
//! Each thread that allocates through a [`ThreadLocalRouter`] gets its own
//! [`BucketAllocator`] (a shard), found again through the router's
//! [`ThreadSlot`]. Frees may come from any thread: the router looks up the
//! shard that owns the page and either frees directly or leaves the element on
//! that shard's remote-free stack for the owner to collect.

mod registry;
mod remote;
pub mod slot;

use core::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

use crate::alloc::bucket::BucketAllocator;
use crate::alloc::descriptor::PoolGeometry;
use crate::alloc::manager::AllocatorManager;
use crate::alloc::page::PageAlloc;
use crate::error::{Corruption, FreeError, PoolError};

use self::registry::{PageOwners, TrackedPageAlloc};
use self::remote::RemoteFrees;
pub use self::slot::{KeyedSlot, ThreadSlot};

/// Router ids are unique across managers: slot types like those declared with
/// [`thread_slot!`](crate::thread_slot) are shared by every router that uses
/// them, whichever manager it was built with.
static NEXT_ROUTER_ID: AtomicU64 = AtomicU64::new(1);

/// One thread's shard: its engine plus the frees other threads left for it.
///
/// The engine mutex is only contended when another thread frees into this
/// shard or the router collects garbage.
pub struct ThreadPoolData {
    router: u64,
    index: usize,
    thread: ThreadId,
    engine: Mutex<BucketAllocator>,
    remote: CachePadded<RemoteFrees>,
}

impl ThreadPoolData {
    /// Position of this shard in its router's creation order.
    pub fn index(&self) -> usize {
        self.index
    }

    /// The thread the shard was created for.
    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    /// Frees everything other threads pushed onto the remote stack.
    fn drain_remote(&self, engine: &mut BucketAllocator) {
        if self.remote.is_empty() {
            return;
        }
        // SAFETY: the engine lock is held, so this is the only consumer.
        let drained = unsafe {
            self.remote.drain(|elem| {
                if let Err(err) = engine.deallocate(elem, 0) {
                    let report = Corruption::new(err.into(), elem.as_ptr());
                    tracing::error!(shard = self.index, %report, "rejected remote free");
                }
            })
        };
        tracing::trace!(shard = self.index, drained, "remote frees collected");
    }
}

/// Routes requests to a per-thread [`BucketAllocator`].
pub struct ThreadLocalRouter<S: ThreadSlot = KeyedSlot> {
    id: u64,
    geometry: PoolGeometry,
    provider: Arc<dyn PageAlloc>,
    owners: Arc<PageOwners>,
    shards: Mutex<Vec<Arc<ThreadPoolData>>>,
    slot: S,
    manager: Arc<AllocatorManager>,
    destroyed: AtomicBool,
}

impl<S: ThreadSlot> ThreadLocalRouter<S> {
    /// Shards are created lazily; nothing is allocated here.
    pub fn new(
        geometry: PoolGeometry,
        provider: Arc<dyn PageAlloc>,
        manager: Arc<AllocatorManager>,
    ) -> Self {
        Self {
            id: NEXT_ROUTER_ID.fetch_add(1, Ordering::Relaxed),
            geometry,
            provider,
            owners: Arc::new(PageOwners::default()),
            shards: Mutex::new(Vec::new()),
            slot: S::for_router(&manager),
            manager,
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn geometry(&self) -> &PoolGeometry {
        &self.geometry
    }

    /// Allocates from the calling thread's shard, creating it on first use.
    ///
    /// Takes that shard's lock, which only waits while another thread is
    /// freeing into the shard or a pool-wide call is visiting it.
    pub fn allocate(&self, size: usize, align: usize) -> Result<NonNull<u8>, PoolError> {
        let shard = self.local_shard()?;
        let mut engine = shard.engine.lock();
        shard.drain_remote(&mut engine);
        engine.allocate(size, align)
    }

    /// Frees `ptr` into the shard that owns its page.
    ///
    /// The calling thread's own shard is freed directly. Another shard is
    /// freed directly when its lock is free, otherwise the element waits on
    /// that shard's remote stack.
    ///
    /// # Safety
    /// `ptr` must not be used after this call.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) -> Result<(), FreeError> {
        let addr = ptr.as_ptr() as usize;
        let owner = self.owners.owner_of(addr).ok_or(FreeError::UnknownPointer)?;

        if owner.thread == thread::current().id() {
            let mut engine = owner.engine.lock();
            return engine.deallocate(ptr, size);
        }
        if let Some(mut engine) = owner.engine.try_lock() {
            owner.drain_remote(&mut engine);
            return engine.deallocate(ptr, size);
        }

        owner.remote.push(ptr);
        tracing::trace!(ptr = addr, shard = owner.index, "free deferred to owning shard");
        Ok(())
    }

    /// Element size behind `ptr`, 0 if no shard owns it.
    pub fn allocation_size(&self, ptr: *const u8) -> usize {
        self.owners
            .owner_of(ptr as usize)
            .map_or(0, |owner| owner.engine.lock().allocation_size(ptr))
    }

    pub fn owns(&self, ptr: *const u8) -> bool {
        self.owners
            .owner_of(ptr as usize)
            .map_or(false, |owner| owner.engine.lock().owns(ptr))
    }

    /// Collects empty pages in every shard, not just the caller's.
    pub fn garbage_collect(&self) -> usize {
        self.for_each_engine(|engine| engine.garbage_collect())
    }

    pub fn num_allocated_bytes(&self) -> usize {
        self.for_each_engine(|engine| engine.num_allocated_bytes())
    }

    pub fn capacity(&self) -> usize {
        self.for_each_engine(|engine| engine.capacity())
    }

    pub fn max_contiguous_allocation_size(&self) -> usize {
        self.geometry.bucket_max
    }

    /// Number of shards created so far.
    pub fn shard_count(&self) -> usize {
        self.shards.lock().len()
    }

    /// Pages currently registered to any shard.
    pub fn registered_pages(&self) -> usize {
        self.owners.len()
    }

    /// Tears down every shard and returns all pages. Later calls to
    /// [`allocate`](Self::allocate) fail with [`PoolError::NotInitialized`].
    pub fn destroy(&self) {
        let shards = {
            let mut shards = self.shards.lock();
            if self.destroyed.swap(true, Ordering::AcqRel) {
                return;
            }
            std::mem::take(&mut *shards)
        };

        for shard in &shards {
            let mut engine = shard.engine.lock();
            shard.drain_remote(&mut engine);
            engine.destroy();
        }
        self.slot.release(&self.manager);
        tracing::debug!(router = self.id, shards = shards.len(), "thread-local router destroyed");
    }

    fn for_each_engine(&self, mut f: impl FnMut(&mut BucketAllocator) -> usize) -> usize {
        let shards: Vec<_> = self.shards.lock().clone();
        shards
            .iter()
            .map(|shard| {
                let mut engine = shard.engine.lock();
                shard.drain_remote(&mut engine);
                f(&mut engine)
            })
            .sum()
    }

    fn local_shard(&self) -> Result<Arc<ThreadPoolData>, PoolError> {
        if let Some(shard) = self.slot.get().and_then(|weak| weak.upgrade()) {
            if shard.router == self.id {
                return Ok(shard);
            }
        }

        // The slot is empty or holds another router's shard (slot types may be
        // shared between routers). Look for an existing shard before making one.
        let me = thread::current().id();
        let mut shards = self.shards.lock();
        if self.destroyed.load(Ordering::Acquire) {
            return Err(PoolError::NotInitialized);
        }
        let shard = match shards.iter().find(|s| s.thread == me) {
            Some(shard) => Arc::clone(shard),
            None => {
                let shard = self.new_shard(shards.len(), me)?;
                shards.push(Arc::clone(&shard));
                shard
            }
        };
        drop(shards);

        self.slot.set(Arc::downgrade(&shard));
        Ok(shard)
    }

    fn new_shard(&self, index: usize, thread: ThreadId) -> Result<Arc<ThreadPoolData>, PoolError> {
        let shard = Arc::new(ThreadPoolData {
            router: self.id,
            index,
            thread,
            engine: Mutex::new(BucketAllocator::new()),
            remote: CachePadded::new(RemoteFrees::new()),
        });
        let tracked: Arc<dyn PageAlloc> = Arc::new(TrackedPageAlloc::new(
            Arc::clone(&self.provider),
            Arc::clone(&self.owners),
            Arc::downgrade(&shard),
        ));
        shard.engine.lock().create_with(self.geometry, tracked)?;
        tracing::debug!(router = self.id, shard = index, ?thread, "shard created");
        Ok(shard)
    }
}

impl<S: ThreadSlot> Drop for ThreadLocalRouter<S> {
    fn drop(&mut self) {
        self.destroy();
    }
}
