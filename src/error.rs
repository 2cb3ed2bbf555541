//! Error and diagnostic types shared by every pool flavor.
//!
//! Failures are always returned to the caller; nothing in this crate panics on
//! a bad request. Heap corruption found while freeing is not an error the
//! caller can act on, so it is reported as a [`Corruption`] diagnostic instead.

use core::fmt;
use serde::Serialize;

/// Errors returned by pool construction and allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    /// `create` was called on an allocator that is already initialized.
    #[error("allocator is already initialized")]
    AlreadyInitialized,

    /// The allocator has not been created yet, or was destroyed.
    #[error("allocator is not initialized")]
    NotInitialized,

    /// The descriptor cannot be turned into a usable page layout.
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(&'static str),

    /// The request is larger than the largest bucket.
    #[error("request of {size} bytes exceeds the pool maximum of {max} bytes")]
    TooLarge { size: usize, max: usize },

    /// The requested alignment cannot be honored by the page layout.
    #[error("alignment {align} is not supported (largest supported is {max})")]
    UnsupportedAlignment { align: usize, max: usize },

    /// A non-dynamic pool used up its static page budget.
    #[error("static page budget of {pages} pages is exhausted")]
    Exhausted { pages: usize },

    /// The page provider could not supply another page.
    #[error("page provider returned no memory")]
    PageProviderFailed,

    /// Pool elements have a fixed size; resizing operations are never supported.
    #[error("{0} is not supported by pool allocators")]
    Unsupported(&'static str),
}

/// Reasons the engine refuses to take a pointer back.
///
/// The free list is left untouched in every case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FreeError {
    /// The pointer does not lie inside any page owned by this allocator.
    #[error("pointer is not owned by this allocator")]
    UnknownPointer,

    /// The pointer lies inside a page but not at the start of an element.
    #[error("pointer does not address the start of an element")]
    InteriorPointer,

    /// The element is already free.
    #[error("element is already free")]
    DoubleFree,
}

/// What kind of damage a [`Corruption`] diagnostic describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CorruptionKind {
    /// The guard value after the user region was overwritten.
    GuardOverrun,
    /// A pointer that this pool never handed out (or already took back).
    UnknownPointer,
    /// An element was freed twice.
    DoubleFree,
}

/// A non-fatal heap corruption report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Corruption {
    pub kind: CorruptionKind,
    pub ptr: usize,
}

impl Corruption {
    pub(crate) fn new(kind: CorruptionKind, ptr: *const u8) -> Self {
        Self { kind, ptr: ptr as usize }
    }
}

impl From<FreeError> for CorruptionKind {
    fn from(err: FreeError) -> Self {
        match err {
            FreeError::DoubleFree => CorruptionKind::DoubleFree,
            FreeError::UnknownPointer | FreeError::InteriorPointer => CorruptionKind::UnknownPointer,
        }
    }
}

impl fmt::Display for Corruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self.kind {
            CorruptionKind::GuardOverrun => "guard value overwritten",
            CorruptionKind::UnknownPointer => "free of unknown pointer",
            CorruptionKind::DoubleFree => "double free",
        };
        write!(f, "{what} at {:#x}", self.ptr)
    }
}
