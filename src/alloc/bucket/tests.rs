use core::alloc::Layout;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::alloc::bucket::BucketAllocator;
use crate::alloc::descriptor::Descriptor;
use crate::alloc::page::{GlobalPageAlloc, PageAlloc};
use crate::error::{FreeError, PoolError};

/// Counts pages handed out and returned.
#[derive(Default)]
struct CountingPages {
    live: AtomicUsize,
    total: AtomicUsize,
}

impl PageAlloc for CountingPages {
    fn alloc_page(&self, layout: Layout) -> Option<NonNull<u8>> {
        let page = GlobalPageAlloc.alloc_page(layout)?;
        self.live.fetch_add(1, Ordering::Relaxed);
        self.total.fetch_add(1, Ordering::Relaxed);
        Some(page)
    }

    unsafe fn dealloc_page(&self, page: NonNull<u8>, layout: Layout) {
        self.live.fetch_sub(1, Ordering::Relaxed);
        GlobalPageAlloc.dealloc_page(page, layout)
    }
}

fn engine(desc: Descriptor) -> (BucketAllocator, Arc<CountingPages>) {
    let pages = Arc::new(CountingPages::default());
    let mut engine = BucketAllocator::new();
    engine
        .create(&desc.with_page_allocator(pages.clone()))
        .unwrap();
    (engine, pages)
}

#[test]
fn test_create_twice_fails() {
    let (mut engine, _) = engine(Descriptor::default());
    assert_eq!(
        engine.create(&Descriptor::default()),
        Err(PoolError::AlreadyInitialized)
    );
}

#[test]
fn test_uninitialized_engine() {
    let mut engine = BucketAllocator::new();
    assert_eq!(engine.allocate(8, 8), Err(PoolError::NotInitialized));
    assert_eq!(engine.capacity(), 0);
    assert_eq!(engine.garbage_collect(), 0);
}

#[test]
fn test_default_pool_lifecycle() {
    let (mut engine, pages) = engine(Descriptor::default());
    assert_eq!(engine.capacity(), 0);

    let small = engine.allocate(8, 1).unwrap();
    let large = engine.allocate(512, 1).unwrap();
    assert!(matches!(
        engine.allocate(513, 1),
        Err(PoolError::TooLarge { size: 513, max: 512 })
    ));
    assert_eq!(engine.num_allocated_bytes(), 520);
    assert_eq!(engine.capacity(), 2 * 4096);

    unsafe {
        engine.deallocate(small, 8).unwrap();
        engine.deallocate(large, 512).unwrap();
    }
    assert_eq!(engine.num_allocated_bytes(), 0);
    assert_eq!(engine.garbage_collect(), 2);
    assert_eq!(engine.capacity(), 0);
    assert_eq!(pages.live.load(Ordering::Relaxed), 0);
}

#[test]
fn test_bucket_mapping() {
    let (mut engine, _) = engine(Descriptor::default());
    for size in [1usize, 7, 8, 9, 16, 17, 100, 511, 512] {
        let p = engine.allocate(size, 1).unwrap();
        let element = engine.allocation_size(p.as_ptr());
        assert_eq!(element, size.div_ceil(8) * 8, "size {size}");
        unsafe { engine.deallocate(p, size).unwrap() };
    }
}

#[test]
fn test_zero_size_uses_first_bucket() {
    let (mut engine, _) = engine(Descriptor::default());
    let p = engine.allocate(0, 1).unwrap();
    assert_eq!(engine.allocation_size(p.as_ptr()), 8);
    unsafe { engine.deallocate(p, 0).unwrap() };
}

#[test]
fn test_lifo_reuse() {
    let (mut engine, _) = engine(Descriptor::default());
    let p1 = engine.allocate(24, 8).unwrap();
    let p2 = engine.allocate(24, 8).unwrap();
    assert_ne!(p1, p2);
    // Fresh pages hand out ascending addresses.
    assert_eq!(p2.as_ptr() as usize - p1.as_ptr() as usize, 24);

    unsafe { engine.deallocate(p1, 24).unwrap() };
    assert_eq!(engine.allocate(24, 8).unwrap(), p1);
}

#[test]
fn test_size_hint_is_not_trusted() {
    let (mut engine, _) = engine(Descriptor::default());
    let p = engine.allocate(64, 8).unwrap();
    unsafe { engine.deallocate(p, 8).unwrap() };
    assert_eq!(engine.num_allocated_bytes(), 0);
    // The element went back to the 64-byte bucket.
    assert_eq!(engine.allocate(64, 8).unwrap(), p);
}

#[test]
fn test_bad_frees_are_rejected() {
    let (mut engine, _) = engine(Descriptor::default());
    let p = engine.allocate(32, 8).unwrap();

    let mut outside = 0u64;
    let outside = NonNull::from(&mut outside).cast::<u8>();
    unsafe {
        assert_eq!(engine.deallocate(outside, 8), Err(FreeError::UnknownPointer));
        let interior = NonNull::new_unchecked(p.as_ptr().add(4));
        assert_eq!(engine.deallocate(interior, 32), Err(FreeError::InteriorPointer));

        engine.deallocate(p, 32).unwrap();
        assert_eq!(engine.deallocate(p, 32), Err(FreeError::DoubleFree));
    }

    // The double free did not duplicate the free-stack entry.
    let a = engine.allocate(32, 8).unwrap();
    let b = engine.allocate(32, 8).unwrap();
    assert_ne!(a, b);
}

#[test]
fn test_page_fills_then_grows() {
    let (mut engine, pages) = engine(Descriptor::default());
    let per_page = 4096 / 64;
    let ptrs: Vec<_> = (0..per_page + 1)
        .map(|_| engine.allocate(64, 8).unwrap())
        .collect();
    assert_eq!(pages.total.load(Ordering::Relaxed), 2);
    assert_eq!(engine.page_count(), 2);

    // Only the page that is fully free is collected.
    unsafe {
        for p in &ptrs[..per_page] {
            engine.deallocate(*p, 64).unwrap();
        }
    }
    assert_eq!(engine.garbage_collect(), 1);
    assert_eq!(engine.page_count(), 1);
    assert_eq!(engine.num_allocated_bytes(), 64);
    assert!(engine.owns(ptrs[per_page].as_ptr()));
    assert!(!engine.owns(ptrs[0].as_ptr()));

    // A collected page's elements are never handed out again.
    let fresh = engine.allocate(64, 8).unwrap();
    assert!(engine.owns(fresh.as_ptr()));
}

#[test]
fn test_static_budget_is_exhausted() {
    let desc = Descriptor {
        page_size: 4096,
        max_allocation_size: 1024,
        is_dynamic: false,
        num_static_pages: 1,
        ..Default::default()
    };
    let (mut engine, pages) = engine(desc);
    assert_eq!(pages.total.load(Ordering::Relaxed), 1);
    assert_eq!(engine.capacity(), 4096);

    let ptrs: Vec<_> = (0..4).map(|_| engine.allocate(1024, 8).unwrap()).collect();
    assert_eq!(
        engine.allocate(1024, 8),
        Err(PoolError::Exhausted { pages: 1 })
    );
    // A different bucket has no page left either.
    assert!(engine.allocate(8, 8).is_err());

    unsafe {
        for p in ptrs {
            engine.deallocate(p, 1024).unwrap();
        }
    }
    // Static pages stay with the pool after collection, ready for any bucket.
    assert_eq!(engine.garbage_collect(), 1);
    assert_eq!(engine.capacity(), 4096);
    assert_eq!(pages.live.load(Ordering::Relaxed), 1);
    assert!(engine.allocate(8, 8).is_ok());
}

#[test]
fn test_unreachable_static_budget_fails_cleanly() {
    let pages = Arc::new(CountingPages::default());
    let mut engine = BucketAllocator::new();
    let desc = Descriptor {
        is_dynamic: false,
        num_static_pages: usize::MAX,
        ..Default::default()
    };
    assert!(matches!(
        engine.create(&desc.with_page_allocator(pages.clone())),
        Err(PoolError::InvalidDescriptor(_))
    ));

    // Fits the address space but not the page list.
    let desc = Descriptor {
        is_dynamic: false,
        num_static_pages: usize::MAX / 4096,
        ..Default::default()
    };
    assert_eq!(
        engine.create(&desc.with_page_allocator(pages.clone())),
        Err(PoolError::PageProviderFailed)
    );
    assert_eq!(pages.total.load(Ordering::Relaxed), 0);
    assert_eq!(engine.capacity(), 0);
}

#[test]
fn test_dynamic_keeps_static_floor() {
    let desc = Descriptor {
        num_static_pages: 1,
        ..Default::default()
    };
    let (mut engine, pages) = engine(desc);
    let a = engine.allocate(8, 8).unwrap();
    let b = engine.allocate(16, 8).unwrap();
    let c = engine.allocate(32, 8).unwrap();
    assert_eq!(engine.capacity(), 3 * 4096);

    unsafe {
        engine.deallocate(a, 8).unwrap();
        engine.deallocate(b, 16).unwrap();
        engine.deallocate(c, 32).unwrap();
    }
    assert_eq!(engine.garbage_collect(), 3);
    assert_eq!(engine.capacity(), 4096);
    assert_eq!(pages.live.load(Ordering::Relaxed), 1);
}

#[test]
fn test_alignment() {
    let (mut engine, _) = engine(Descriptor::default());
    for align in [1usize, 2, 4, 8, 16, 64, 256] {
        let p = engine.allocate(24, align).unwrap();
        assert_eq!(p.as_ptr() as usize % align, 0, "align {align}");
        assert!(engine.allocation_size(p.as_ptr()) >= 24);
    }
    assert!(matches!(
        engine.allocate(8, 3),
        Err(PoolError::UnsupportedAlignment { align: 3, .. })
    ));
    assert!(matches!(
        engine.allocate(8, 8192),
        Err(PoolError::UnsupportedAlignment { align: 8192, max: 4096 })
    ));
    // 24 rounded up to 1024 is past the largest bucket.
    assert!(engine.allocate(24, 1024).is_err());
    // Rounding a huge request would wrap.
    assert!(matches!(
        engine.allocate(usize::MAX - 8, 64),
        Err(PoolError::TooLarge { max: 512, .. })
    ));
}

#[test]
fn test_unsupported_resize() {
    let (mut engine, _) = engine(Descriptor::default());
    let p = engine.allocate(8, 8).unwrap();
    assert_eq!(engine.resize(p, 16), 0);
    assert_eq!(engine.reallocate(p, 16, 8), Err(PoolError::Unsupported("reallocate")));
    assert_eq!(engine.max_contiguous_allocation_size(), 512);
}

#[test]
fn test_destroy_returns_every_page() {
    let desc = Descriptor {
        num_static_pages: 2,
        ..Default::default()
    };
    let (mut engine, pages) = engine(desc);
    let _leaked = engine.allocate(8, 8).unwrap();
    let _other = engine.allocate(256, 8).unwrap();
    let _third = engine.allocate(512, 8).unwrap();
    assert_eq!(pages.live.load(Ordering::Relaxed), 3);

    engine.destroy();
    assert!(!engine.is_initialized());
    assert_eq!(pages.live.load(Ordering::Relaxed), 0);
    // Destroying twice is harmless and the engine can be recreated.
    engine.destroy();
    engine.create(&Descriptor::default()).unwrap();
}

#[test]
fn test_drop_returns_pages() {
    let (engine, pages) = engine(Descriptor::default());
    let mut engine = engine;
    engine.allocate(100, 8).unwrap();
    drop(engine);
    assert_eq!(pages.live.load(Ordering::Relaxed), 0);
}

#[test]
fn test_freed_elements_are_stamped() {
    let desc = Descriptor {
        mark_unallocated_memory: true,
        ..Default::default()
    };
    let (mut engine, _) = engine(desc);
    let p = engine.allocate(16, 8).unwrap();
    unsafe {
        p.as_ptr().write_bytes(0x11, 16);
        engine.deallocate(p, 16).unwrap();
        let bytes = core::slice::from_raw_parts(p.as_ptr(), 16);
        assert!(bytes.iter().all(|&b| b == crate::alloc::debug::UNALLOCATED_MARK));
    }
}
