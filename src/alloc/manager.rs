//! The process-wide collaborator pools register with.
//!
//! An [`AllocatorManager`] is passed to every pool at construction instead of
//! pools reaching for hidden statics. It keeps the list of live pools and hands
//! out the thread-slot keys used by [`KeyedSlot`](crate::alloc::thread::KeyedSlot).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

static GLOBAL: OnceLock<Arc<AllocatorManager>> = OnceLock::new();

/// Generations are unique across every manager in the process, so a stale
/// thread-local entry can never be mistaken for a live key.
static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// A registered pool, as reported by [`AllocatorManager::registered`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AllocatorInfo {
    pub id: u64,
    pub name: String,
    pub description: String,
    /// `"pool"` or `"thread_pool"`.
    pub kind: &'static str,
}

/// Identifies one router's entry in the per-thread slot table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotKey {
    pub index: usize,
    pub generation: u64,
}

#[derive(Default)]
struct KeyTable {
    free: Vec<usize>,
    next: usize,
}

#[derive(Default)]
pub struct AllocatorManager {
    allocators: RwLock<Vec<AllocatorInfo>>,
    keys: Mutex<KeyTable>,
    next_id: AtomicU64,
}

impl AllocatorManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// The shared manager used by pools that are not given one explicitly.
    pub fn global() -> Arc<AllocatorManager> {
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(AllocatorManager::new())))
    }

    /// Adds a pool to the registry and returns its id.
    pub fn register(&self, name: &str, description: &str, kind: &'static str) -> u64 {
        let id = self.next_id();
        self.allocators.write().push(AllocatorInfo {
            id,
            name: name.to_owned(),
            description: description.to_owned(),
            kind,
        });
        tracing::debug!(allocator = name, id, kind, "allocator registered");
        id
    }

    /// Removes a pool. Returns `false` if `id` was not registered.
    pub fn unregister(&self, id: u64) -> bool {
        let mut allocators = self.allocators.write();
        match allocators.iter().position(|a| a.id == id) {
            Some(pos) => {
                let info = allocators.swap_remove(pos);
                tracing::debug!(allocator = %info.name, id, "allocator unregistered");
                true
            }
            None => false,
        }
    }

    /// Snapshot of every registered pool.
    pub fn registered(&self) -> Vec<AllocatorInfo> {
        self.allocators.read().clone()
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.allocators.read().iter().any(|a| a.name == name)
    }

    /// A fresh id, unique within this manager.
    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Reserves a slot in every thread's slot table.
    pub fn acquire_slot_key(&self) -> SlotKey {
        let mut keys = self.keys.lock();
        let index = keys.free.pop().unwrap_or_else(|| {
            let index = keys.next;
            keys.next += 1;
            index
        });
        SlotKey {
            index,
            generation: NEXT_GENERATION.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Gives a slot index back for reuse. Entries left behind in thread-local
    /// tables are invalidated by the generation change.
    pub fn release_slot_key(&self, key: SlotKey) {
        let mut keys = self.keys.lock();
        if key.index < keys.next && !keys.free.contains(&key.index) {
            keys.free.push(key.index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_unregister() {
        let manager = AllocatorManager::new();
        let a = manager.register("a", "first", "pool");
        let b = manager.register("b", "second", "thread_pool");
        assert_ne!(a, b);
        assert!(manager.is_registered("a"));
        assert_eq!(manager.registered().len(), 2);

        assert!(manager.unregister(a));
        assert!(!manager.unregister(a));
        let left = manager.registered();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].name, "b");
        assert_eq!(left[0].kind, "thread_pool");
    }

    #[test]
    fn test_slot_keys_are_recycled_with_new_generation() {
        let manager = AllocatorManager::new();
        let k0 = manager.acquire_slot_key();
        let k1 = manager.acquire_slot_key();
        assert_eq!((k0.index, k1.index), (0, 1));

        manager.release_slot_key(k0);
        manager.release_slot_key(k0);
        let k2 = manager.acquire_slot_key();
        assert_eq!(k2.index, 0);
        assert_ne!(k2.generation, k0.generation);
        assert_eq!(manager.acquire_slot_key().index, 2);
    }

    #[test]
    fn test_global_is_shared() {
        let a = AllocatorManager::global();
        let b = AllocatorManager::global();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
