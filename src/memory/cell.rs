//! Cells: the unit of allocation granularity
//!
//! All sizes inside the allocator are whole cells. Byte requests are
//! converted with `bytes_to_cells`, which rounds up.

use std::fmt::Debug;
use std::ptr::NonNull;

/// 16 byte cell
pub const CELL_SIZE_BITS: usize = 4;
/// 16 byte cell
pub const CELL_SIZE_BYTES: usize = 1 << CELL_SIZE_BITS;

/// The contents of a cell are opaque to the allocator
#[repr(C, align(16))]
pub struct Cell([u8; CELL_SIZE_BYTES]);

/// Number of cells required to hold `bytes` bytes
pub fn bytes_to_cells(bytes: usize) -> usize {
    bytes.div_ceil(CELL_SIZE_BYTES)
}

/// Pointer to a cell inside some arena.
///
/// A `CellPtr` is a raw handle: it is only meaningful while the arena
/// it points into is alive. The allocator hands these out; the
/// collector passes them back to flip block state.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CellPtr(NonNull<Cell>);

impl CellPtr {
    /// Wrap a raw cell pointer.
    ///
    /// # Safety
    ///
    /// `ptr` must point at a cell inside a live arena (or one past
    /// its final cell, for boundary arithmetic).
    pub unsafe fn new_unchecked(ptr: NonNull<Cell>) -> Self {
        CellPtr(ptr)
    }

    pub fn as_ptr(self) -> *mut Cell {
        self.0.as_ptr()
    }

    pub fn as_non_null(self) -> NonNull<Cell> {
        self.0
    }

    /// Address as an integer, for masking
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// The cell `cells` cells further on
    pub fn add(self, cells: usize) -> CellPtr {
        unsafe { CellPtr(NonNull::new_unchecked(self.0.as_ptr().add(cells))) }
    }

    /// Untyped byte pointer to the start of the cell
    pub fn as_bytes_ptr(self) -> *mut u8 {
        self.0.as_ptr().cast()
    }
}

impl Debug for CellPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:p}", self.0)
    }
}
