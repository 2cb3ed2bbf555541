pub mod allocator;
pub mod bucket;
pub mod debug;
pub mod descriptor;
pub mod manager;
pub mod page;
pub mod pool;
pub mod system;
pub mod thread;

pub use allocator::{AllocRequest, PoolAlloc};
pub use bucket::BucketAllocator;
pub use debug::{AllocationRecord, AllocationRecords, DebugConfig};
pub use descriptor::{Descriptor, PoolGeometry};
pub use manager::{AllocatorInfo, AllocatorManager, SlotKey};
pub use page::{GlobalPageAlloc, PageAlloc, SyscallPageAlloc};
pub use pool::{Pool, PoolAllocator, PoolStats, Sharding, SingleInstance, ThreadPoolAllocator};
pub use thread::{KeyedSlot, ThreadLocalRouter, ThreadPoolData, ThreadSlot};
