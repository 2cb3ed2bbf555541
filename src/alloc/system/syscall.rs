//! Anonymous OS mappings behind [`SyscallPageAlloc`](crate::SyscallPageAlloc).

use core::ptr::NonNull;

use crate::alloc::page::align_up;

/// Granularity of OS mappings. Mappings are always aligned to at least this.
pub const OS_PAGE_SIZE: usize = 4096;

/// Bytes actually mapped for a request of `len`.
#[inline]
pub const fn mapped_len(len: usize) -> usize {
    align_up(len, OS_PAGE_SIZE)
}

#[cfg(unix)]
mod imp {
    use core::ptr::{self, NonNull};

    pub unsafe fn map(len: usize) -> Option<NonNull<u8>> {
        let ptr = libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        );
        if ptr == libc::MAP_FAILED {
            return None;
        }
        NonNull::new(ptr.cast())
    }

    pub unsafe fn unmap(ptr: NonNull<u8>, len: usize) {
        if libc::munmap(ptr.as_ptr().cast(), len) != 0 {
            tracing::error!(ptr = ptr.as_ptr() as usize, len, "munmap failed");
        }
    }
}

#[cfg(windows)]
mod imp {
    use core::ptr::{self, NonNull};
    use windows_sys::Win32::System::Memory::{
        VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE,
    };

    pub unsafe fn map(len: usize) -> Option<NonNull<u8>> {
        NonNull::new(VirtualAlloc(ptr::null(), len, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE).cast())
    }

    pub unsafe fn unmap(ptr: NonNull<u8>, _len: usize) {
        // MEM_RELEASE frees the whole reservation and wants a size of 0.
        if VirtualFree(ptr.as_ptr().cast(), 0, MEM_RELEASE) == 0 {
            tracing::error!(ptr = ptr.as_ptr() as usize, "VirtualFree failed");
        }
    }
}

#[cfg(not(any(unix, windows)))]
mod imp {
    use core::ptr::NonNull;

    pub unsafe fn map(_len: usize) -> Option<NonNull<u8>> {
        None
    }

    pub unsafe fn unmap(_ptr: NonNull<u8>, _len: usize) {}
}

/// Maps `len` bytes (rounded up to whole OS pages) of zeroed read-write memory.
///
/// # Safety
/// The mapping must be released with [`unmap`] and the same `len`.
pub unsafe fn map(len: usize) -> Option<NonNull<u8>> {
    if len == 0 {
        return None;
    }
    imp::map(mapped_len(len))
}

/// Releases a mapping made by [`map`].
///
/// # Safety
/// `ptr` and `len` must match an earlier [`map`] call; the memory must not be
/// used afterwards.
pub unsafe fn unmap(ptr: NonNull<u8>, len: usize) {
    imp::unmap(ptr, mapped_len(len));
}
