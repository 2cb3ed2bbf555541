//! The bucketed free-list engine.
//!
//! A [`BucketAllocator`] maps every request to a linear size class, serves it
//! from that bucket's free stack in O(1), and grows the bucket one page at a
//! time from its [`PageAlloc`]. Pages whose elements are all free can be handed
//! back with [`BucketAllocator::garbage_collect`].
//!
//! The engine is single-threaded: it takes `&mut self` everywhere and does no
//! locking of its own.

pub mod page;
pub mod size_class;

#[cfg(test)]
mod tests;

use core::ptr::NonNull;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::alloc::debug::UNALLOCATED_MARK;
use crate::alloc::descriptor::{Descriptor, PoolGeometry};
use crate::alloc::page::{checked_align_up, GlobalPageAlloc, PageAlloc};
use crate::error::{FreeError, PoolError};

use self::page::Page;
use self::size_class::SizeClasses;

/// A free element: page id and element index within that page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Slot {
    page: u32,
    index: u32,
}

#[derive(Default)]
struct Bucket {
    free: Vec<Slot>,
    used: usize,
}

struct Engine {
    geometry: PoolGeometry,
    classes: SizeClasses,
    provider: Arc<dyn PageAlloc>,
    buckets: Vec<Bucket>,
    pages: Vec<Option<Page>>,
    vacant: Vec<usize>,
    by_addr: BTreeMap<usize, usize>,
    /// Pages owned by the engine but not assigned to any bucket.
    reserve: Vec<NonNull<u8>>,
    owned_pages: usize,
}

/// Fixed-size-class allocator over pages from a [`PageAlloc`].
#[derive(Default)]
pub struct BucketAllocator {
    engine: Option<Engine>,
}

// SAFETY: the engine exclusively owns every page it points to, and the
// provider is `Send + Sync`.
unsafe impl Send for BucketAllocator {}

impl BucketAllocator {
    /// Creates an uninitialized allocator. Call [`create`](Self::create) before use.
    pub const fn new() -> Self {
        Self { engine: None }
    }

    /// Initializes the allocator from `descriptor`, reserving its static pages.
    ///
    /// Fails with [`PoolError::AlreadyInitialized`] on a live allocator.
    pub fn create(&mut self, descriptor: &Descriptor) -> Result<(), PoolError> {
        let geometry = descriptor.normalize()?;
        let provider = descriptor
            .page_allocator
            .clone()
            .unwrap_or_else(|| Arc::new(GlobalPageAlloc));
        self.create_with(geometry, provider)
    }

    /// Initializes the allocator from already normalized sizes.
    pub fn create_with(
        &mut self,
        geometry: PoolGeometry,
        provider: Arc<dyn PageAlloc>,
    ) -> Result<(), PoolError> {
        if self.engine.is_some() {
            return Err(PoolError::AlreadyInitialized);
        }

        let classes = SizeClasses::new(geometry.min_allocation_size, geometry.bucket_max);
        let mut engine = Engine {
            geometry,
            classes,
            provider,
            buckets: (0..classes.count()).map(|_| Bucket::default()).collect(),
            pages: Vec::new(),
            vacant: Vec::new(),
            by_addr: BTreeMap::new(),
            reserve: Vec::new(),
            owned_pages: 0,
        };
        engine
            .reserve
            .try_reserve_exact(geometry.num_static_pages)
            .map_err(|_| PoolError::PageProviderFailed)?;

        for _ in 0..geometry.num_static_pages {
            match engine.provider.alloc_page(geometry.page_layout) {
                Some(page) => {
                    engine.reserve.push(page);
                    engine.owned_pages += 1;
                }
                None => {
                    engine.release_all();
                    return Err(PoolError::PageProviderFailed);
                }
            }
        }

        tracing::debug!(
            page_size = geometry.page_size(),
            min = geometry.min_allocation_size,
            max = geometry.bucket_max,
            buckets = classes.count(),
            static_pages = geometry.num_static_pages,
            dynamic = geometry.is_dynamic,
            "bucket allocator created"
        );
        self.engine = Some(engine);
        Ok(())
    }

    /// Returns every page to the provider and goes back to the uninitialized state.
    pub fn destroy(&mut self) {
        if let Some(mut engine) = self.engine.take() {
            let leaked = engine.num_allocated_bytes();
            if leaked > 0 {
                tracing::warn!(leaked_bytes = leaked, "bucket allocator destroyed with live allocations");
            }
            engine.release_all();
        }
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.engine.is_some()
    }

    /// The normalized sizes this allocator was created with.
    pub fn geometry(&self) -> Option<&PoolGeometry> {
        self.engine.as_ref().map(|e| &e.geometry)
    }

    /// Allocates one element big enough for `size` bytes aligned to `align`.
    pub fn allocate(&mut self, size: usize, align: usize) -> Result<NonNull<u8>, PoolError> {
        let engine = self.engine.as_mut().ok_or(PoolError::NotInitialized)?;
        engine.allocate(size, align)
    }

    /// Puts the element at `ptr` back on its bucket's free stack.
    ///
    /// The owning bucket is found from the pointer; `size` is only a hint and
    /// may be 0. Pointers that are not live elements of this allocator are
    /// rejected without touching any free stack or any memory. Accepted
    /// elements are stamped first when the pool marks unallocated memory.
    ///
    /// # Safety
    /// The caller must not use the element after this call.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: usize) -> Result<(), FreeError> {
        let engine = self.engine.as_mut().ok_or(FreeError::UnknownPointer)?;
        engine.deallocate(ptr, size)
    }

    /// Pool elements have a fixed size; always returns 0.
    pub fn resize(&mut self, _ptr: NonNull<u8>, _new_size: usize) -> usize {
        0
    }

    /// Pool elements have a fixed size; always fails.
    pub fn reallocate(
        &mut self,
        _ptr: NonNull<u8>,
        _new_size: usize,
        _new_align: usize,
    ) -> Result<NonNull<u8>, PoolError> {
        Err(PoolError::Unsupported("reallocate"))
    }

    /// Whether `ptr` lies inside one of this allocator's pages.
    pub fn owns(&self, ptr: *const u8) -> bool {
        self.engine
            .as_ref()
            .map_or(false, |e| e.page_id_of(ptr as usize).is_some())
    }

    /// Element size backing `ptr`, or 0 if the pointer is not ours.
    pub fn allocation_size(&self, ptr: *const u8) -> usize {
        self.engine.as_ref().map_or(0, |e| {
            e.page_id_of(ptr as usize)
                .and_then(|id| e.pages[id].as_ref())
                .map_or(0, |page| page.element_size())
        })
    }

    /// Detaches every page whose elements are all free. Returns how many pages
    /// were detached.
    ///
    /// Dynamic pools hand pages above the static floor back to the provider;
    /// everything else goes to the reserve.
    pub fn garbage_collect(&mut self) -> usize {
        self.engine.as_mut().map_or(0, Engine::garbage_collect)
    }

    /// Bytes currently handed out, counted in whole elements.
    pub fn num_allocated_bytes(&self) -> usize {
        self.engine.as_ref().map_or(0, Engine::num_allocated_bytes)
    }

    /// Bytes of every page the allocator owns, including unassigned ones.
    pub fn capacity(&self) -> usize {
        self.engine
            .as_ref()
            .map_or(0, |e| e.owned_pages * e.geometry.page_size())
    }

    /// The largest single request this allocator can satisfy.
    pub fn max_contiguous_allocation_size(&self) -> usize {
        self.engine.as_ref().map_or(0, |e| e.geometry.bucket_max)
    }

    /// Pages owned, assigned to a bucket or not.
    pub fn page_count(&self) -> usize {
        self.engine.as_ref().map_or(0, |e| e.owned_pages)
    }
}

impl Drop for BucketAllocator {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl Engine {
    fn allocate(&mut self, size: usize, align: usize) -> Result<NonNull<u8>, PoolError> {
        let geo = self.geometry;
        let align = align.max(1);
        if !align.is_power_of_two() || align > geo.page_align() {
            return Err(PoolError::UnsupportedAlignment { align, max: geo.page_align() });
        }
        let rounded = if align > geo.min_allocation_size {
            checked_align_up(size.max(1), align)
        } else {
            Some(size)
        };
        let bucket = rounded
            .and_then(|rounded| self.classes.index_of(rounded))
            .ok_or(PoolError::TooLarge { size, max: geo.bucket_max })?;

        if self.buckets[bucket].free.is_empty() {
            self.refill(bucket)?;
        }

        let slot = self.buckets[bucket]
            .free
            .pop()
            .ok_or(PoolError::PageProviderFailed)?;
        self.buckets[bucket].used += 1;
        let page = self.pages[slot.page as usize]
            .as_mut()
            .ok_or(PoolError::PageProviderFailed)?;
        page.mark_used(slot.index);
        Ok(page.element(slot.index))
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: usize) -> Result<(), FreeError> {
        let addr = ptr.as_ptr() as usize;
        let id = self.page_id_of(addr).ok_or(FreeError::UnknownPointer)?;
        let page = self.pages[id].as_mut().ok_or(FreeError::UnknownPointer)?;
        let index = page.index_of(addr).ok_or(FreeError::InteriorPointer)?;
        if !page.is_live(index) {
            return Err(FreeError::DoubleFree);
        }
        if size > page.element_size() {
            tracing::trace!(ptr = addr, size, element = page.element_size(), "free size hint larger than element");
        }

        if self.geometry.mark_unallocated {
            ptr.as_ptr().write_bytes(UNALLOCATED_MARK, page.element_size());
        }
        page.mark_free(index);
        let bucket = &mut self.buckets[page.bucket()];
        bucket.used -= 1;
        bucket.free.push(Slot { page: id as u32, index });
        Ok(())
    }

    fn page_id_of(&self, addr: usize) -> Option<usize> {
        let page_size = self.geometry.page_size();
        self.by_addr
            .range(..=addr)
            .next_back()
            .filter(|(base, _)| addr < **base + page_size)
            .map(|(_, id)| *id)
    }

    fn refill(&mut self, bucket: usize) -> Result<(), PoolError> {
        let base = self.take_page()?;
        let page = Page::new(
            base,
            bucket,
            self.classes.element_size(bucket),
            self.geometry.page_size(),
        );
        let capacity = page.capacity();
        let id = match self.vacant.pop() {
            Some(id) => {
                self.pages[id] = Some(page);
                id
            }
            None => {
                self.pages.push(Some(page));
                self.pages.len() - 1
            }
        };
        self.by_addr.insert(base.as_ptr() as usize, id);

        let free = &mut self.buckets[bucket].free;
        free.reserve(capacity as usize);
        // Highest index first so pops hand out ascending addresses.
        free.extend((0..capacity).rev().map(|index| Slot { page: id as u32, index }));

        tracing::trace!(bucket, page = id, elements = capacity, "page assigned to bucket");
        Ok(())
    }

    fn take_page(&mut self) -> Result<NonNull<u8>, PoolError> {
        if let Some(page) = self.reserve.pop() {
            return Ok(page);
        }
        if !self.geometry.is_dynamic {
            return Err(PoolError::Exhausted { pages: self.geometry.num_static_pages });
        }
        let page = self
            .provider
            .alloc_page(self.geometry.page_layout)
            .ok_or(PoolError::PageProviderFailed)?;
        self.owned_pages += 1;
        Ok(page)
    }

    fn release_page(&mut self, base: NonNull<u8>) {
        if self.geometry.is_dynamic && self.owned_pages > self.geometry.num_static_pages {
            // SAFETY: every owned page came from this provider with this layout.
            unsafe { self.provider.dealloc_page(base, self.geometry.page_layout) };
            self.owned_pages -= 1;
        } else {
            self.reserve.push(base);
        }
    }

    fn garbage_collect(&mut self) -> usize {
        let mut dead = vec![false; self.pages.len()];
        let mut touched = vec![false; self.buckets.len()];
        let mut empty = Vec::new();
        for (id, page) in self.pages.iter().enumerate() {
            if let Some(page) = page {
                if page.is_empty() {
                    dead[id] = true;
                    touched[page.bucket()] = true;
                    empty.push(id);
                }
            }
        }
        if empty.is_empty() {
            return 0;
        }

        for (bucket, _) in self.buckets.iter_mut().zip(&touched).filter(|(_, t)| **t) {
            bucket.free.retain(|slot| !dead[slot.page as usize]);
        }

        for &id in &empty {
            if let Some(page) = self.pages[id].take() {
                self.by_addr.remove(&(page.base().as_ptr() as usize));
                self.vacant.push(id);
                self.release_page(page.base());
            }
        }

        tracing::debug!(
            detached = empty.len(),
            owned = self.owned_pages,
            reserve = self.reserve.len(),
            "garbage collected empty pages"
        );
        empty.len()
    }

    fn num_allocated_bytes(&self) -> usize {
        self.buckets
            .iter()
            .enumerate()
            .map(|(i, b)| b.used * self.classes.element_size(i))
            .sum()
    }

    fn release_all(&mut self) {
        let layout = self.geometry.page_layout;
        for page in self.pages.drain(..).flatten() {
            // SAFETY: pages came from this provider with this layout.
            unsafe { self.provider.dealloc_page(page.base(), layout) };
        }
        for base in self.reserve.drain(..) {
            // SAFETY: as above.
            unsafe { self.provider.dealloc_page(base, layout) };
        }
        self.by_addr.clear();
        self.vacant.clear();
        self.buckets.clear();
        self.owned_pages = 0;
    }
}
