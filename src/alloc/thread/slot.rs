//! Per-thread slots that remember which shard a thread allocates from.

use std::cell::RefCell;
use std::sync::Weak;

use super::ThreadPoolData;
use crate::alloc::manager::{AllocatorManager, SlotKey};

/// Accessors for "the calling thread's shard" of one router.
///
/// The router never touches thread-local storage itself; it asks its slot.
/// A slot only stores a hint: the router checks that the shard it gets back
/// belongs to it, so several routers may share one slot type and still be
/// correct.
pub trait ThreadSlot: Send + Sync {
    /// Builds the slot for a new router.
    fn for_router(manager: &AllocatorManager) -> Self
    where
        Self: Sized;

    /// The calling thread's shard, if one was stored.
    fn get(&self) -> Option<Weak<ThreadPoolData>>;

    /// Stores the calling thread's shard.
    fn set(&self, shard: Weak<ThreadPoolData>);

    /// Called once when the owning router is destroyed.
    fn release(&self, _manager: &AllocatorManager) {}
}

thread_local! {
    static KEYED: RefCell<Vec<Option<(u64, Weak<ThreadPoolData>)>>> = const { RefCell::new(Vec::new()) };
}

/// The default slot: one entry per router in a thread-local table, addressed
/// by a [`SlotKey`] from the [`AllocatorManager`].
#[derive(Debug)]
pub struct KeyedSlot {
    key: SlotKey,
}

impl KeyedSlot {
    pub fn key(&self) -> SlotKey {
        self.key
    }
}

impl ThreadSlot for KeyedSlot {
    fn for_router(manager: &AllocatorManager) -> Self {
        Self { key: manager.acquire_slot_key() }
    }

    fn get(&self) -> Option<Weak<ThreadPoolData>> {
        KEYED
            .try_with(|table| match table.borrow().get(self.key.index) {
                Some(Some((generation, shard))) if *generation == self.key.generation => {
                    Some(shard.clone())
                }
                _ => None,
            })
            .ok()
            .flatten()
    }

    fn set(&self, shard: Weak<ThreadPoolData>) {
        // During thread teardown the table may be gone; the router then falls
        // back to its shard list.
        let _ = KEYED.try_with(|table| {
            let mut table = table.borrow_mut();
            if table.len() <= self.key.index {
                table.resize_with(self.key.index + 1, || None);
            }
            table[self.key.index] = Some((self.key.generation, shard));
        });
    }

    fn release(&self, manager: &AllocatorManager) {
        manager.release_slot_key(self.key);
    }
}

/// Declares a slot type with its own `thread_local!`.
///
/// Pools parameterized with different slot types never share thread-local
/// storage:
///
/// ```
/// shardpool::thread_slot!(pub MeshSlot);
///
/// let pool = shardpool::Pool::<shardpool::ThreadLocalRouter<MeshSlot>>::with_descriptor(
///     &shardpool::Descriptor::default(),
/// )
/// .unwrap();
/// # drop(pool);
/// ```
#[macro_export]
macro_rules! thread_slot {
    ($(#[$attr:meta])* $vis:vis $name:ident) => {
        $(#[$attr])*
        #[derive(Debug, Default, Clone, Copy)]
        $vis struct $name;

        impl $name {
            fn cell<R>(
                f: impl FnOnce(
                    &::std::cell::RefCell<
                        ::std::option::Option<::std::sync::Weak<$crate::ThreadPoolData>>,
                    >,
                ) -> R,
            ) -> ::std::option::Option<R> {
                ::std::thread_local! {
                    static CELL: ::std::cell::RefCell<
                        ::std::option::Option<::std::sync::Weak<$crate::ThreadPoolData>>,
                    > = const { ::std::cell::RefCell::new(::std::option::Option::None) };
                }
                CELL.try_with(f).ok()
            }
        }

        impl $crate::ThreadSlot for $name {
            fn for_router(_: &$crate::AllocatorManager) -> Self {
                $name
            }

            fn get(&self) -> ::std::option::Option<::std::sync::Weak<$crate::ThreadPoolData>> {
                Self::cell(|c| c.borrow().clone()).flatten()
            }

            fn set(&self, shard: ::std::sync::Weak<$crate::ThreadPoolData>) {
                let _ = Self::cell(|c| *c.borrow_mut() = ::std::option::Option::Some(shard));
            }
        }
    };
}
