/// Linear size classes: bucket `i` serves requests up to `(i + 1) * min`.
///
/// `min` is a power of two, so the mapping is a shift.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeClasses {
    shift: u32,
    count: usize,
}

impl SizeClasses {
    pub fn new(min_allocation_size: usize, max_allocation_size: usize) -> Self {
        debug_assert!(min_allocation_size.is_power_of_two());
        debug_assert!(max_allocation_size >= min_allocation_size);
        Self {
            shift: min_allocation_size.trailing_zeros(),
            count: (max_allocation_size - min_allocation_size) / min_allocation_size + 1,
        }
    }

    /// Number of buckets.
    #[inline]
    pub fn count(&self) -> usize {
        self.count
    }

    /// Returns the bucket for `size`, i.e. `ceil(size / min) - 1`.
    /// A zero-byte request is served by the first bucket.
    #[inline]
    pub fn index_of(&self, size: usize) -> Option<usize> {
        let index = size.saturating_sub(1) >> self.shift;
        (index < self.count).then_some(index)
    }

    /// Element size of bucket `index`.
    #[inline]
    pub fn element_size(&self, index: usize) -> usize {
        (index + 1) << self.shift
    }
}
