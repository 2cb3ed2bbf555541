use core::ptr::NonNull;
use proptest::prelude::*;
use shardpool::{AllocRequest, Descriptor, PoolAlloc, PoolAllocator, PoolError};
use std::collections::HashMap;

#[derive(Debug, Clone)]
enum Operation {
    Alloc(usize, u8),
    Free(usize),
    Collect,
}

fn operation() -> impl Strategy<Value = Operation> {
    prop_oneof![
        4 => (0usize..=600, 0u8..8).prop_map(|(size, align)| Operation::Alloc(size, align)),
        3 => any::<usize>().prop_map(Operation::Free),
        1 => Just(Operation::Collect),
    ]
}

proptest! {
    #[test]
    fn test_pool_matches_model(
        ops in proptest::collection::vec(operation(), 1..200),
        is_dynamic in any::<bool>(),
    ) {
        let pool = PoolAllocator::with_descriptor(&Descriptor {
            is_dynamic,
            num_static_pages: if is_dynamic { 0 } else { 16 },
            ..Default::default()
        })
        .unwrap();
        let max = pool.max_contiguous_allocation_size();

        // address -> (requested size, fill byte)
        let mut live: HashMap<usize, (usize, u8)> = HashMap::new();
        let mut order: Vec<usize> = Vec::new();

        for (step, op) in ops.into_iter().enumerate() {
            match op {
                Operation::Alloc(size, align_shift) => {
                    let align = 1usize << align_shift;
                    let res = pool.allocate(AllocRequest::new(size, align));
                    if size > max {
                        prop_assert_eq!(res, Err(PoolError::TooLarge { size, max }));
                        continue;
                    }
                    let ptr = match res {
                        Ok(ptr) => ptr,
                        // A static pool may legitimately run dry.
                        Err(PoolError::Exhausted { .. }) if !is_dynamic => continue,
                        Err(err) => return Err(TestCaseError::fail(format!("{err}"))),
                    };
                    let addr = ptr.as_ptr() as usize;
                    prop_assert_eq!(addr % align, 0);
                    prop_assert!(pool.allocation_size(ptr) >= size);
                    prop_assert!(!live.contains_key(&addr));

                    let fill = step as u8;
                    unsafe { ptr.as_ptr().write_bytes(fill, size) };
                    live.insert(addr, (size, fill));
                    order.push(addr);
                }
                Operation::Free(pick) => {
                    if order.is_empty() {
                        continue;
                    }
                    let addr = order.swap_remove(pick % order.len());
                    let (size, fill) = live.remove(&addr).unwrap();
                    let ptr = NonNull::new(addr as *mut u8).unwrap();
                    let bytes = unsafe { core::slice::from_raw_parts(ptr.as_ptr(), size) };
                    prop_assert!(bytes.iter().all(|&b| b == fill));
                    unsafe { pool.deallocate(ptr, size, 0) };
                }
                Operation::Collect => {
                    let before = pool.capacity();
                    pool.garbage_collect();
                    prop_assert!(pool.capacity() <= before);
                }
            }
            prop_assert!(pool.num_allocated_bytes() >= live.values().map(|(s, _)| *s).sum::<usize>());
        }

        for addr in order {
            let (size, _) = live[&addr];
            unsafe { pool.deallocate(NonNull::new(addr as *mut u8).unwrap(), size, 0) };
        }
        prop_assert_eq!(pool.num_allocated_bytes(), 0);
        prop_assert_eq!(pool.corruption_events(), 0);
    }
}
