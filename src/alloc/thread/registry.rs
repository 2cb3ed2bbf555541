use core::alloc::Layout;
use core::ptr::NonNull;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use super::ThreadPoolData;
use crate::alloc::page::PageAlloc;

/// Which shard owns which page: `base -> (end, owner)`.
///
/// Written whenever any shard takes a page from or returns one to the
/// provider; read by every free that has to find its owner.
#[derive(Default)]
pub(crate) struct PageOwners {
    pages: RwLock<BTreeMap<usize, (usize, Weak<ThreadPoolData>)>>,
}

impl PageOwners {
    pub(crate) fn insert(&self, base: usize, len: usize, owner: Weak<ThreadPoolData>) {
        self.pages.write().insert(base, (base + len, owner));
    }

    pub(crate) fn remove(&self, base: usize) {
        self.pages.write().remove(&base);
    }

    /// The shard whose page contains `addr`.
    pub(crate) fn owner_of(&self, addr: usize) -> Option<Arc<ThreadPoolData>> {
        let pages = self.pages.read();
        let (_, (end, owner)) = pages.range(..=addr).next_back()?;
        if addr < *end {
            owner.upgrade()
        } else {
            None
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.pages.read().len()
    }
}

/// Page provider adapter that records each page's owner in a [`PageOwners`].
///
/// Every shard's engine allocates through its own adapter, so the registry is
/// exact without the engine knowing about threads at all.
pub(crate) struct TrackedPageAlloc {
    inner: Arc<dyn PageAlloc>,
    owners: Arc<PageOwners>,
    shard: Weak<ThreadPoolData>,
}

impl TrackedPageAlloc {
    pub(crate) fn new(
        inner: Arc<dyn PageAlloc>,
        owners: Arc<PageOwners>,
        shard: Weak<ThreadPoolData>,
    ) -> Self {
        Self { inner, owners, shard }
    }
}

impl PageAlloc for TrackedPageAlloc {
    fn alloc_page(&self, layout: Layout) -> Option<NonNull<u8>> {
        let page = self.inner.alloc_page(layout)?;
        self.owners
            .insert(page.as_ptr() as usize, layout.size(), self.shard.clone());
        Some(page)
    }

    unsafe fn dealloc_page(&self, page: NonNull<u8>, layout: Layout) {
        self.owners.remove(page.as_ptr() as usize);
        self.inner.dealloc_page(page, layout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::page::GlobalPageAlloc;

    #[test]
    fn test_tracked_pages_are_registered() {
        let owners = Arc::new(PageOwners::default());
        let tracked = TrackedPageAlloc::new(Arc::new(GlobalPageAlloc), owners.clone(), Weak::new());
        let layout = Layout::from_size_align(4096, 4096).unwrap();

        let page = tracked.alloc_page(layout).unwrap();
        assert_eq!(owners.len(), 1);
        // The owner is gone, so lookups come back empty even inside the page.
        assert!(owners.owner_of(page.as_ptr() as usize + 100).is_none());

        unsafe { tracked.dealloc_page(page, layout) };
        assert_eq!(owners.len(), 0);
    }
}
