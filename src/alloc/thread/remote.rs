use core::ptr::{self, NonNull};

use crate::sync::{AtomicPtr, Ordering};

struct Node {
    elem: NonNull<u8>,
    next: *mut Node,
}

/// Elements freed by threads other than the owning shard's thread.
///
/// A multi-producer Treiber stack of heap nodes. The freed elements are never
/// written to, so a bogus or repeated pointer on the stack cannot cut off the
/// entries pushed before it. Only the owner consumes, and it always takes the
/// whole chain with a single `swap`, so a node is never re-linked while
/// another thread still reads it and there is no ABA window.
pub(crate) struct RemoteFrees {
    head: AtomicPtr<Node>,
}

impl RemoteFrees {
    pub(crate) fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.head.load(Ordering::Relaxed).is_null()
    }

    /// Leaves `elem` for the owner to free on its next drain.
    pub(crate) fn push(&self, elem: NonNull<u8>) {
        let node = Box::into_raw(Box::new(Node {
            elem,
            next: ptr::null_mut(),
        }));
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            // SAFETY: the node is not published until the exchange succeeds.
            unsafe { (*node).next = head };
            // Release publishes the node's fields to the draining owner.
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => head = actual,
            }
        }
    }

    /// Takes every pending element, newest first, and hands each to `free`.
    /// Returns the number of elements taken.
    ///
    /// # Safety
    /// Must only be called by the owner of the elements.
    pub(crate) unsafe fn drain(&self, mut free: impl FnMut(NonNull<u8>)) -> usize {
        let mut node = self.head.swap(ptr::null_mut(), Ordering::Acquire);
        let mut taken = 0;
        while !node.is_null() {
            // SAFETY: every node came from `Box::into_raw` in `push` and the
            // swap above made this thread its only holder.
            let Node { elem, next } = *Box::from_raw(node);
            node = next;
            taken += 1;
            free(elem);
        }
        taken
    }
}

impl Drop for RemoteFrees {
    fn drop(&mut self) {
        // Elements still pending belong to pages that are going away with
        // their shard; only the nodes need freeing.
        let dropped = unsafe { self.drain(|_| {}) };
        if dropped > 0 {
            tracing::debug!(dropped, "remote frees discarded with their shard");
        }
    }
}
