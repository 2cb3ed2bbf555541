use std::collections::HashMap;
use std::sync::Arc;

use backtrace::{Backtrace, BacktraceFrame};
use parking_lot::Mutex;

use crate::alloc::allocator::AllocRequest;

/// What a pool remembers about one live allocation.
#[derive(Debug, Clone)]
pub struct AllocationRecord {
    /// Bytes the caller asked for (without guard).
    pub size: usize,
    pub alignment: usize,
    pub flags: u32,
    pub name: Option<&'static str>,
    pub file: Option<&'static str>,
    pub line: u32,
    /// Up to `stack_record_levels` frames of the allocating call stack,
    /// unresolved. Call [`Backtrace::resolve`] on a clone to get symbols.
    pub stack: Option<Arc<Backtrace>>,
}

impl AllocationRecord {
    pub(crate) fn new(request: &AllocRequest, stack_levels: u8) -> Self {
        let stack = (stack_levels > 0 && !request.suppress_stack_record)
            .then(|| Arc::new(capture(stack_levels)));
        Self {
            size: request.size,
            alignment: request.align,
            flags: request.flags,
            name: request.name,
            file: request.file,
            line: request.line,
            stack,
        }
    }
}

fn capture(levels: u8) -> Backtrace {
    let mut frames: Vec<BacktraceFrame> = Backtrace::new_unresolved().into();
    frames.truncate(usize::from(levels));
    frames.into()
}

/// Live allocations keyed by address.
#[derive(Debug, Default)]
pub struct AllocationRecords {
    live: Mutex<HashMap<usize, AllocationRecord>>,
}

impl AllocationRecords {
    pub(crate) fn insert(&self, ptr: *const u8, record: AllocationRecord) {
        self.live.lock().insert(ptr as usize, record);
    }

    pub(crate) fn remove(&self, ptr: *const u8) -> Option<AllocationRecord> {
        self.live.lock().remove(&(ptr as usize))
    }

    /// Takes every remaining record, ordered by address.
    pub(crate) fn drain(&self) -> Vec<(usize, AllocationRecord)> {
        let mut all: Vec<_> = self.live.lock().drain().collect();
        all.sort_unstable_by_key(|(addr, _)| *addr);
        all
    }

    pub fn len(&self) -> usize {
        self.live.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, ptr: *const u8) -> Option<AllocationRecord> {
        self.live.lock().get(&(ptr as usize)).cloned()
    }

    /// Every live record, ordered by address.
    pub fn snapshot(&self) -> Vec<(usize, AllocationRecord)> {
        let mut all: Vec<_> = self
            .live
            .lock()
            .iter()
            .map(|(addr, record)| (*addr, record.clone()))
            .collect();
        all.sort_unstable_by_key(|(addr, _)| *addr);
        all
    }
}
