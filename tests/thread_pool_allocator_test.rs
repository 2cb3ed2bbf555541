use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use shardpool::{
    thread_slot, AllocRequest, AllocatorManager, Descriptor, Pool, PoolAlloc, ThreadLocalRouter,
    ThreadPoolAllocator,
};

thread_slot!(MySlot);

/// A second thread pool type with its own thread-local slot: 1024-byte
/// elements on 64 KiB pages.
type MyThreadPoolAllocator = Pool<ThreadLocalRouter<MySlot>>;

fn my_descriptor() -> Descriptor {
    Descriptor {
        page_size: 64 * 1024,
        min_allocation_size: 1024,
        max_allocation_size: 1024,
        ..Default::default()
    }
}

fn records_pool() -> ThreadPoolAllocator {
    ThreadPoolAllocator::with_descriptor(&Descriptor {
        allocation_records: true,
        ..Default::default()
    })
    .unwrap()
}

/// Raw pointers handed between threads in these tests.
#[derive(Clone, Copy)]
struct Addr(usize);

impl Addr {
    fn ptr(self) -> core::ptr::NonNull<u8> {
        core::ptr::NonNull::new(self.0 as *mut u8).unwrap()
    }
}

#[test]
fn test_size_sweep_single_thread() {
    let pool = records_pool();
    let mut addresses = Vec::new();
    for size in (8..=256).step_by(8) {
        let p = pool.allocate(AllocRequest::new(size, 8)).unwrap();
        assert!(pool.allocation_size(p) >= size);
        unsafe { p.as_ptr().write_bytes(1, size) };
        addresses.push(p);
    }
    assert!(pool.num_allocated_bytes() >= 4126);
    assert_eq!(pool.records().unwrap().len(), 32);

    for p in addresses {
        unsafe { pool.deallocate(p, 0, 0) };
    }
    assert_eq!(pool.num_allocated_bytes(), 0);
    assert_eq!(pool.records().unwrap().len(), 0);
}

#[test]
fn test_alloc_dealloc_on_many_threads() {
    let pool = records_pool();
    thread::scope(|s| {
        for _ in 0..8 {
            s.spawn(|| {
                let mut addresses = Vec::with_capacity(500);
                for i in 0..500usize {
                    let size = ((i + 1) * 2 % 256).max(1);
                    let p = pool
                        .allocate(AllocRequest::new(size, 8).named("Test Alloc").here())
                        .unwrap();
                    unsafe { p.as_ptr().write_bytes(1, size) };
                    addresses.push(p);
                }
                for p in addresses.into_iter().rev() {
                    unsafe { pool.deallocate(p, 0, 0) };
                }
            });
        }
    });
    assert_eq!(pool.stats().shards, 8);
    assert_eq!(pool.num_allocated_bytes(), 0);
    assert_eq!(pool.corruption_events(), 0);
}

#[test]
fn test_cross_thread_free() {
    let pool = ThreadPoolAllocator::with_descriptor(&Descriptor::default()).unwrap();
    let sizes = [8usize, 24, 64, 200, 512];

    // Allocate on thread A.
    let addrs: Vec<Addr> = thread::scope(|s| {
        s.spawn(|| {
            (0..200)
                .map(|i| {
                    let size = sizes[i % sizes.len()];
                    let p = pool.allocate(AllocRequest::new(size, 8)).unwrap();
                    unsafe { p.as_ptr().write_bytes(0xAA, size) };
                    Addr(p.as_ptr() as usize)
                })
                .collect()
        })
        .join()
        .unwrap()
    });
    let expected: usize = (0..200).map(|i| sizes[i % sizes.len()]).sum();
    assert_eq!(pool.num_allocated_bytes(), expected);

    // Free everything on thread B.
    thread::scope(|s| {
        s.spawn(|| {
            for (i, a) in addrs.iter().enumerate() {
                unsafe { pool.deallocate(a.ptr(), sizes[i % sizes.len()], 8) };
            }
        });
    });
    assert_eq!(pool.num_allocated_bytes(), 0);
    assert_eq!(pool.corruption_events(), 0);
    assert_eq!(pool.stats().shards, 2);
}

#[test]
fn test_owner_keeps_allocating_after_remote_frees() {
    let pool = ThreadPoolAllocator::with_descriptor(&Descriptor::default()).unwrap();
    let queue: Mutex<VecDeque<Addr>> = Mutex::new(VecDeque::new());
    let done = AtomicBool::new(false);

    thread::scope(|s| {
        // Producer allocates and hands pointers over.
        s.spawn(|| {
            for i in 0..5000usize {
                let size = (i * 7 % 256).max(8);
                let p = pool.allocate(AllocRequest::new(size, 8)).unwrap();
                unsafe { p.as_ptr().write_bytes(0x5A, size) };
                queue.lock().unwrap().push_back(Addr(p.as_ptr() as usize));
            }
            done.store(true, Ordering::Release);

            // Fresh allocations still come back distinct and usable.
            let fresh: Vec<_> = (0..256)
                .map(|_| pool.allocate(AllocRequest::new(64, 8)).unwrap())
                .collect();
            let mut sorted: Vec<_> = fresh.iter().map(|p| p.as_ptr() as usize).collect();
            sorted.sort_unstable();
            sorted.dedup();
            assert_eq!(sorted.len(), fresh.len());
            for p in fresh {
                unsafe { pool.deallocate(p, 64, 8) };
            }
        });

        // Consumer frees whatever it finds.
        s.spawn(|| loop {
            let next = queue.lock().unwrap().pop_front();
            match next {
                Some(a) => unsafe { pool.deallocate(a.ptr(), 0, 0) },
                None if done.load(Ordering::Acquire) => {
                    if queue.lock().unwrap().is_empty() {
                        break;
                    }
                }
                None => thread::yield_now(),
            }
        });
    });

    assert_eq!(pool.num_allocated_bytes(), 0);
    assert_eq!(pool.corruption_events(), 0);
}

#[test]
fn test_independent_pools_do_not_share() {
    let ours = MyThreadPoolAllocator::with_descriptor(&my_descriptor()).unwrap();
    let other = MyThreadPoolAllocator::with_descriptor(&my_descriptor()).unwrap();
    let default = ThreadPoolAllocator::with_descriptor(&Descriptor::default()).unwrap();

    let a = ours.allocate(AllocRequest::new(1000, 8)).unwrap();
    assert_eq!(ours.num_allocated_bytes(), 1024);
    assert_eq!(other.num_allocated_bytes(), 0);
    assert_eq!(default.num_allocated_bytes(), 0);

    // Same slot type, same thread: the pools still keep separate shards.
    let b = other.allocate(AllocRequest::new(1024, 8)).unwrap();
    let c = ours.allocate(AllocRequest::new(10, 8)).unwrap();
    assert_eq!(ours.num_allocated_bytes(), 2048);
    assert_eq!(other.num_allocated_bytes(), 1024);
    assert_eq!(ours.stats().shards, 1);
    assert_eq!(other.stats().shards, 1);

    assert!(ours.allocate(AllocRequest::new(1025, 8)).is_err());
    assert_eq!(ours.allocation_size(a), 1024);
    assert_eq!(ours.capacity(), 64 * 1024);

    unsafe {
        ours.deallocate(a, 1000, 8);
        ours.deallocate(c, 10, 8);
        other.deallocate(b, 1024, 8);
    }
    assert_eq!(ours.num_allocated_bytes(), 0);
    assert_eq!(other.num_allocated_bytes(), 0);
}

#[test]
fn test_pools_with_separate_managers_do_not_share() {
    let mut first =
        MyThreadPoolAllocator::with_manager("First", "own manager", Arc::new(AllocatorManager::new()));
    first.create(&my_descriptor()).unwrap();
    let mut second =
        MyThreadPoolAllocator::with_manager("Second", "own manager", Arc::new(AllocatorManager::new()));
    second.create(&my_descriptor()).unwrap();

    let a = first.allocate(AllocRequest::new(64, 8)).unwrap();
    let b = second.allocate(AllocRequest::new(64, 8)).unwrap();
    assert_eq!(first.num_allocated_bytes(), 1024);
    assert_eq!(second.num_allocated_bytes(), 1024);
    assert_eq!(first.stats().shards, 1);
    assert_eq!(second.stats().shards, 1);

    unsafe {
        second.deallocate(b, 64, 8);
        first.deallocate(a, 64, 8);
    }
    assert_eq!(first.corruption_events(), 0);
    assert_eq!(second.corruption_events(), 0);
    assert_eq!(first.num_allocated_bytes(), 0);
    assert_eq!(second.num_allocated_bytes(), 0);
}

#[test]
fn test_free_from_wrong_pool_is_rejected() {
    let ours = MyThreadPoolAllocator::with_descriptor(&my_descriptor()).unwrap();
    let other = MyThreadPoolAllocator::with_descriptor(&my_descriptor()).unwrap();
    let a = ours.allocate(AllocRequest::new(512, 8)).unwrap();
    unsafe { other.deallocate(a, 512, 8) };
    assert_eq!(other.corruption_events(), 1);
    assert_eq!(ours.num_allocated_bytes(), 1024);
    unsafe { ours.deallocate(a, 512, 8) };
}

#[test]
fn test_garbage_collect_covers_idle_threads() {
    let pool = ThreadPoolAllocator::with_descriptor(&Descriptor::default()).unwrap();
    thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                let p = pool.allocate(AllocRequest::new(128, 8)).unwrap();
                unsafe { pool.deallocate(p, 128, 8) };
            });
        }
    });
    // The threads are gone but their pages are still held.
    assert_eq!(pool.capacity(), 4 * 4096);

    let before = pool.capacity();
    pool.garbage_collect();
    assert!(pool.capacity() <= before);
    assert_eq!(pool.capacity(), 0);
}

#[test]
fn test_destroy_and_registration() {
    let manager = Arc::new(AllocatorManager::new());
    let mut pool = ThreadPoolAllocator::with_manager("Jobs", "job graph nodes", manager.clone());
    pool.create(&Descriptor::default()).unwrap();
    assert_eq!(manager.registered()[0].kind, "thread_pool");

    thread::scope(|s| {
        s.spawn(|| {
            let _leak = pool.allocate(AllocRequest::new(16, 8)).unwrap();
        });
    });
    let _local = pool.allocate(AllocRequest::new(16, 8)).unwrap();
    assert_eq!(pool.stats().shards, 2);

    pool.destroy();
    assert!(manager.registered().is_empty());
    assert_eq!(pool.capacity(), 0);
    assert!(pool.allocate(AllocRequest::new(16, 8)).is_err());

    // A fresh create starts over with new shards.
    pool.create(&Descriptor::default()).unwrap();
    let p = pool.allocate(AllocRequest::new(16, 8)).unwrap();
    assert_eq!(pool.stats().shards, 1);
    unsafe { pool.deallocate(p, 16, 8) };
}
