//! Regions of memory mapped directly from the OS
//!
//! A region is aligned to its own (power of two) size so that the
//! owner of any interior pointer can be found by masking.

use std::ptr::{null_mut, NonNull};

use super::error::RegionError;

/// An anonymous, zero-initialised mapping aligned to its size
#[derive(Debug, PartialEq)]
pub struct Region {
    /// Pointer to memory
    ptr: NonNull<u8>,
    /// Size of region
    size: usize,
}

impl Region {
    pub fn new(size: usize) -> Result<Self, RegionError> {
        if !size.is_power_of_two() || size < page_size() {
            Err(RegionError::BadSize)
        } else {
            Ok(Region {
                ptr: Self::map_aligned(size)?,
                size,
            })
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Give up ownership without unmapping
    pub fn into_raw(self) -> NonNull<u8> {
        let ptr = self.ptr;
        std::mem::forget(self);
        ptr
    }

    /// Reclaim ownership of a region previously released by `into_raw`
    ///
    /// # Safety
    ///
    /// `ptr` and `size` must come from a `Region` that was turned into
    /// a raw pointer and not reclaimed since.
    pub unsafe fn from_raw(ptr: NonNull<u8>, size: usize) -> Self {
        Region { ptr, size }
    }

    /// Map twice the size then trim so the start is aligned to `size`.
    fn map_aligned(size: usize) -> Result<NonNull<u8>, RegionError> {
        let raw = unsafe {
            libc::mmap(
                null_mut(),
                2 * size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if raw == libc::MAP_FAILED {
            return Err(RegionError::OutOfMemory);
        }

        let (aligned, before, after) = trim_to_alignment(raw as usize, size);
        unsafe {
            if before > 0 {
                Self::unmap(aligned - before, before);
            }
            if after > 0 {
                Self::unmap(aligned + size, after);
            }
            Ok(NonNull::new_unchecked(aligned as *mut u8))
        }
    }

    unsafe fn unmap(addr: usize, len: usize) {
        let result = libc::munmap(addr as *mut libc::c_void, len);
        debug_assert_eq!(result, 0, "munmap failed");
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        unsafe { Self::unmap(self.ptr.as_ptr() as usize, self.size) }
    }
}

/// Split a mapping of `2 * size` bytes at `start` into the aligned
/// region and the slivers before and after it, as (aligned start,
/// leading bytes, trailing bytes)
fn trim_to_alignment(start: usize, size: usize) -> (usize, usize, usize) {
    let aligned = (start + size - 1) & !(size - 1);
    let before = aligned - start;
    (aligned, before, size - before)
}

fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}
