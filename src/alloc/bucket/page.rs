use core::ptr::NonNull;

const BIT_SHIFT: usize = 6;
const BIT_MASK: usize = 63;

/// A page sliced into equally sized elements of one bucket.
///
/// The free elements themselves are tracked by the bucket's free stack; the
/// page only keeps counts and an occupancy bitset so that a bad free can be
/// rejected before it reaches the free stack.
pub(crate) struct Page {
    base: NonNull<u8>,
    bucket: usize,
    element_size: usize,
    capacity: u32,
    used: u32,
    live: Vec<u64>,
}

impl Page {
    pub(crate) fn new(base: NonNull<u8>, bucket: usize, element_size: usize, page_size: usize) -> Self {
        // Geometries with more elements are rejected at normalization.
        let capacity = u32::try_from(page_size / element_size).unwrap_or(u32::MAX);
        let words = (capacity as usize + BIT_MASK) >> BIT_SHIFT;
        Self {
            base,
            bucket,
            element_size,
            capacity,
            used: 0,
            live: vec![0; words],
        }
    }

    #[inline]
    pub(crate) fn base(&self) -> NonNull<u8> {
        self.base
    }

    #[inline]
    pub(crate) fn bucket(&self) -> usize {
        self.bucket
    }

    #[inline]
    pub(crate) fn element_size(&self) -> usize {
        self.element_size
    }

    #[inline]
    pub(crate) fn capacity(&self) -> u32 {
        self.capacity
    }

    #[inline]
    pub(crate) fn used(&self) -> u32 {
        self.used
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// Address of element `index`.
    #[inline]
    pub(crate) fn element(&self, index: u32) -> NonNull<u8> {
        debug_assert!(index < self.capacity);
        // SAFETY: index < capacity keeps the offset inside the page.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(index as usize * self.element_size)) }
    }

    /// Element index for `addr`, if it is the start of an element of this page.
    #[inline]
    pub(crate) fn index_of(&self, addr: usize) -> Option<u32> {
        let offset = addr.checked_sub(self.base.as_ptr() as usize)?;
        if offset % self.element_size != 0 {
            return None;
        }
        let index = offset / self.element_size;
        (index < self.capacity as usize).then_some(index as u32)
    }

    #[inline]
    pub(crate) fn is_live(&self, index: u32) -> bool {
        let index = index as usize;
        self.live[index >> BIT_SHIFT] & (1 << (index & BIT_MASK)) != 0
    }

    #[inline]
    pub(crate) fn mark_used(&mut self, index: u32) {
        debug_assert!(!self.is_live(index));
        let i = index as usize;
        self.live[i >> BIT_SHIFT] |= 1 << (i & BIT_MASK);
        self.used += 1;
    }

    #[inline]
    pub(crate) fn mark_free(&mut self, index: u32) {
        debug_assert!(self.is_live(index));
        let i = index as usize;
        self.live[i >> BIT_SHIFT] &= !(1 << (i & BIT_MASK));
        self.used -= 1;
    }
}
