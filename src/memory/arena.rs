//! Arenas and the block state bitmaps
//!
//! An arena is a region of `ARENA_SIZE_BYTES` aligned to its own size,
//! so the arena owning any cell pointer is found by masking off the
//! low bits and the cell index is the masked-off remainder.
//!
//! The start of the arena holds two bitmaps with one bit per cell.
//! Together they encode a `Blocktype` for every cell:
//!
//! | block bit | mark bit | blocktype |
//! |-----------|----------|-----------|
//! | 0         | 0        | Extent    |
//! | 0         | 1        | Free      |
//! | 1         | 0        | White     |
//! | 1         | 1        | Black     |
//!
//! The bitmaps occupy exactly the cells they would describe as
//! header, so usable cells start at `ARENA_FIRST_CELL_INDEX`. The bits
//! for header cells are never consulted, which leaves room at the very
//! start of the block bitmap for the arena's gray stack handle.

use std::fmt::Debug;
use std::mem::{size_of, ManuallyDrop};
use std::ptr::{addr_of_mut, NonNull};

use log::debug;

use super::bag::Bag;
use super::cell::{Cell, CellPtr, CELL_SIZE_BITS, CELL_SIZE_BYTES};
use super::error::AllocError;
use super::region::Region;

/// 1M arena
pub const ARENA_SIZE_BITS: usize = 20;
/// 1M arena
pub const ARENA_SIZE_BYTES: usize = 1 << ARENA_SIZE_BITS;
/// Cells in an arena, including header cells
pub const ARENA_CELLS_COUNT: usize = ARENA_SIZE_BYTES >> CELL_SIZE_BITS;
/// Bytes in each of the two bitmaps
pub const ARENA_BITMAP_BYTES: usize = ARENA_CELLS_COUNT / 8;
/// Index of the first cell available for allocation
pub const ARENA_FIRST_CELL_INDEX: usize = 2 * ARENA_BITMAP_BYTES / CELL_SIZE_BYTES;
/// Cells available for allocation in a fresh arena
pub const ARENA_USABLE_CELLS: usize = ARENA_CELLS_COUNT - ARENA_FIRST_CELL_INDEX;

/// Initial capacity of an arena's gray stack
pub const GRAY_STACK_INIT_SIZE: usize = 128;

/// Objects awaiting scanning by the mark traversal
pub type GrayStack = Bag<CellPtr>;

/// State of a single cell
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Blocktype {
    /// Interior of a block
    Extent,
    /// Start of an unallocated block
    Free,
    /// Start of an allocated block not (yet) known to be live
    White,
    /// Start of an allocated block known to be live
    Black,
}

impl Blocktype {
    fn from_bits(block: bool, mark: bool) -> Self {
        match (block, mark) {
            (false, false) => Blocktype::Extent,
            (false, true) => Blocktype::Free,
            (true, false) => Blocktype::White,
            (true, true) => Blocktype::Black,
        }
    }

    /// (block bit, mark bit)
    fn bits(self) -> (bool, bool) {
        match self {
            Blocktype::Extent => (false, false),
            Blocktype::Free => (false, true),
            Blocktype::White => (true, false),
            Blocktype::Black => (true, true),
        }
    }

    /// Whether a cell of this type begins a block
    pub fn is_block_start(self) -> bool {
        self != Blocktype::Extent
    }

    fn symbol(self) -> char {
        match self {
            Blocktype::Extent => '.',
            Blocktype::Free => 'f',
            Blocktype::White => 'w',
            Blocktype::Black => 'b',
        }
    }
}

#[repr(C)]
union BlockBitmap {
    gray_stack: ManuallyDrop<GrayStack>,
    bits: [u8; ARENA_BITMAP_BYTES],
}

/// Layout of the start of every arena
#[repr(C)]
struct ArenaHeader {
    block_bitmap: BlockBitmap,
    mark_bitmap: [u8; ARENA_BITMAP_BYTES],
}

const _: () = assert!(size_of::<ArenaHeader>() == ARENA_FIRST_CELL_INDEX * CELL_SIZE_BYTES);
const _: () = assert!(size_of::<GrayStack>() * 8 <= ARENA_FIRST_CELL_INDEX);

/// Handle to a live arena.
///
/// Handles are plain pointers: copying one does not copy the arena
/// and a handle must not be used after `destroy`.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Arena(NonNull<ArenaHeader>);

impl Arena {
    /// Map a fresh arena from the OS.
    ///
    /// The whole usable area starts out as a single free block.
    pub fn create() -> Result<Arena, AllocError> {
        let region = Region::new(ARENA_SIZE_BYTES)?;
        let arena = Arena(region.into_raw().cast());

        arena.set_blocktype(ARENA_FIRST_CELL_INDEX, Blocktype::Free);

        unsafe {
            addr_of_mut!((*arena.0.as_ptr()).block_bitmap.gray_stack)
                .write(ManuallyDrop::new(Bag::new(GRAY_STACK_INIT_SIZE)));
        }

        debug!("created arena {:p}", arena.0);
        Ok(arena)
    }

    /// Release the gray stack and return the memory to the OS.
    ///
    /// # Safety
    ///
    /// No handle to this arena or pointer into it may be used
    /// afterwards.
    pub unsafe fn destroy(self) {
        debug!("destroying arena {:p}", self.0);
        ManuallyDrop::drop(&mut (*self.0.as_ptr()).block_bitmap.gray_stack);
        drop(Region::from_raw(self.0.cast(), ARENA_SIZE_BYTES));
    }

    /// The arena containing `cell`
    pub fn addr_of(cell: CellPtr) -> Arena {
        let base = cell.addr() & !(ARENA_SIZE_BYTES - 1);
        unsafe { Arena(NonNull::new_unchecked(base as *mut ArenaHeader)) }
    }

    /// Index of `cell` within its arena
    pub fn cell_index(cell: CellPtr) -> usize {
        (cell.addr() & (ARENA_SIZE_BYTES - 1)) >> CELL_SIZE_BITS
    }

    pub fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr().cast()
    }

    /// Pointer to the cell at `index`
    pub fn cell(self, index: usize) -> CellPtr {
        debug_assert!(index <= ARENA_CELLS_COUNT);
        unsafe {
            CellPtr::new_unchecked(NonNull::new_unchecked(
                self.0.as_ptr().cast::<Cell>().add(index),
            ))
        }
    }

    /// First cell available for allocation
    pub fn first_cell(self) -> CellPtr {
        self.cell(ARENA_FIRST_CELL_INDEX)
    }

    /// Whether `cell` lies in this arena
    pub fn contains(self, cell: CellPtr) -> bool {
        Arena::addr_of(cell) == self
    }

    fn block_bitmap(self) -> *mut u8 {
        unsafe { addr_of_mut!((*self.0.as_ptr()).block_bitmap.bits).cast() }
    }

    fn mark_bitmap(self) -> *mut u8 {
        unsafe { addr_of_mut!((*self.0.as_ptr()).mark_bitmap).cast() }
    }

    fn bitmap_entry(bitmap: *mut u8, index: usize) -> bool {
        unsafe { (*bitmap.add(index / 8) >> (index % 8)) & 0x1 == 0x1 }
    }

    fn set_bitmap_entry(bitmap: *mut u8, index: usize, value: bool) {
        unsafe {
            let byte = bitmap.add(index / 8);
            if value {
                *byte |= 1 << (index % 8);
            } else {
                *byte &= !(1 << (index % 8));
            }
        }
    }

    /// Blocktype of the cell at `index`
    pub fn blocktype(self, index: usize) -> Blocktype {
        debug_assert!(index < ARENA_CELLS_COUNT);
        Blocktype::from_bits(
            Self::bitmap_entry(self.block_bitmap(), index),
            Self::bitmap_entry(self.mark_bitmap(), index),
        )
    }

    /// Set the blocktype of the cell at `index`
    pub fn set_blocktype(self, index: usize, blocktype: Blocktype) {
        debug_assert!((ARENA_FIRST_CELL_INDEX..ARENA_CELLS_COUNT).contains(&index));
        let (block, mark) = blocktype.bits();
        Self::set_bitmap_entry(self.block_bitmap(), index, block);
        Self::set_bitmap_entry(self.mark_bitmap(), index, mark);
    }

    /// Index of the first cell of the block containing the cell at
    /// `index`
    pub fn block_start(self, index: usize) -> usize {
        debug_assert!((ARENA_FIRST_CELL_INDEX..ARENA_CELLS_COUNT).contains(&index));
        let mut start = index;
        while start > ARENA_FIRST_CELL_INDEX && self.blocktype(start) == Blocktype::Extent {
            start -= 1;
        }
        start
    }

    /// Reclaim unmarked blocks and coalesce adjacent free runs.
    ///
    /// White blocks are freed, black blocks become white ready for the
    /// next cycle and any block start following a free block is merged
    /// into it. Returns true if no black block was found, i.e. the
    /// arena is now entirely free.
    pub fn sweep(self) -> bool {
        let mut free = true;
        let mut coalesce = false;

        for index in ARENA_FIRST_CELL_INDEX..ARENA_CELLS_COUNT {
            match self.blocktype(index) {
                Blocktype::Extent => {}
                Blocktype::Free => {
                    if coalesce {
                        self.set_blocktype(index, Blocktype::Extent);
                    }
                    coalesce = true;
                }
                Blocktype::White => {
                    if coalesce {
                        self.set_blocktype(index, Blocktype::Extent);
                    } else {
                        self.set_blocktype(index, Blocktype::Free);
                    }
                    coalesce = true;
                }
                Blocktype::Black => {
                    free = false;
                    coalesce = false;
                    self.set_blocktype(index, Blocktype::White);
                }
            }
        }

        free
    }

    fn usable_blocktypes(self) -> impl Iterator<Item = Blocktype> {
        (ARENA_FIRST_CELL_INDEX..ARENA_CELLS_COUNT).map(move |index| self.blocktype(index))
    }

    /// True if no allocated (white or black) block remains
    pub fn is_empty(self) -> bool {
        !self
            .usable_blocktypes()
            .any(|t| matches!(t, Blocktype::White | Blocktype::Black))
    }

    /// True if no free block directly follows another free block
    pub fn is_coalesced(self) -> bool {
        let mut prev_was_free = false;
        for blocktype in self.usable_blocktypes() {
            match blocktype {
                Blocktype::White | Blocktype::Black => prev_was_free = false,
                Blocktype::Free => {
                    if prev_was_free {
                        return false;
                    }
                    prev_was_free = true;
                }
                Blocktype::Extent => {}
            }
        }
        true
    }

    fn count_blocks(self, blocktype: Blocktype) -> usize {
        self.usable_blocktypes().filter(|t| *t == blocktype).count()
    }

    /// Number of free blocks
    pub fn free_blocks(self) -> usize {
        self.count_blocks(Blocktype::Free)
    }

    /// Number of white blocks
    pub fn white_blocks(self) -> usize {
        self.count_blocks(Blocktype::White)
    }

    /// Number of black blocks
    pub fn black_blocks(self) -> usize {
        self.count_blocks(Blocktype::Black)
    }

    /// Iterate over all blocks as (start, blocktype, size in cells)
    pub fn blocks(self) -> Blocks {
        Blocks {
            arena: self,
            index: ARENA_FIRST_CELL_INDEX,
        }
    }

    /// Iterate over free blocks as (start, size in cells)
    pub fn free_blocks_iter(self) -> impl Iterator<Item = (CellPtr, usize)> {
        self.blocks()
            .filter(|(_, t, _)| *t == Blocktype::Free)
            .map(|(ptr, _, cells)| (ptr, cells))
    }

    /// Render the blocktypes of the first `cells` usable cells, one
    /// character per cell: `.` extent, `f` free, `w` white, `b` black.
    pub fn layout(self, cells: usize) -> String {
        let end = (ARENA_FIRST_CELL_INDEX + cells).min(ARENA_CELLS_COUNT);
        (ARENA_FIRST_CELL_INDEX..end)
            .map(|index| self.blocktype(index).symbol())
            .collect()
    }

    #[allow(clippy::mut_from_ref)]
    fn gray_stack(&self) -> &mut GrayStack {
        unsafe { &mut (*self.0.as_ptr()).block_bitmap.gray_stack }
    }

    /// Queue an object for scanning
    pub fn push_gray(self, cell: CellPtr) {
        self.gray_stack().add(cell);
    }

    /// Take the next object to scan
    pub fn pop_gray(self) -> Option<CellPtr> {
        self.gray_stack().pop()
    }

    pub fn gray_len(self) -> usize {
        self.gray_stack().len()
    }
}

impl Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:p} free:{} white:{} black:{} gray:{}",
            self.0,
            self.free_blocks(),
            self.white_blocks(),
            self.black_blocks(),
            self.gray_len()
        )
    }
}

/// Iterator over the blocks of an arena
pub struct Blocks {
    arena: Arena,
    index: usize,
}

impl Iterator for Blocks {
    type Item = (CellPtr, Blocktype, usize);

    fn next(&mut self) -> Option<Self::Item> {
        while self.index < ARENA_CELLS_COUNT
            && self.arena.blocktype(self.index) == Blocktype::Extent
        {
            self.index += 1;
        }

        if self.index >= ARENA_CELLS_COUNT {
            return None;
        }

        let start = self.index;
        let blocktype = self.arena.blocktype(start);
        self.index += 1;
        while self.index < ARENA_CELLS_COUNT
            && self.arena.blocktype(self.index) == Blocktype::Extent
        {
            self.index += 1;
        }

        Some((self.arena.cell(start), blocktype, self.index - start))
    }
}

/// Blocktype of the cell at `cell`
pub fn get_blocktype(cell: CellPtr) -> Blocktype {
    Arena::addr_of(cell).blocktype(Arena::cell_index(cell))
}

/// Set the blocktype of the cell at `cell`
pub fn set_blocktype(cell: CellPtr, blocktype: Blocktype) {
    Arena::addr_of(cell).set_blocktype(Arena::cell_index(cell), blocktype)
}

/// Record an allocation of `cells` cells starting at `cell`.
///
/// The block starts white. If the cell after the allocation was block
/// interior it becomes free so the remainder of a split block keeps a
/// block start of its own.
pub fn mark_allocated(cell: CellPtr, cells: usize) {
    let arena = Arena::addr_of(cell);
    let index = Arena::cell_index(cell);
    arena.set_blocktype(index, Blocktype::White);

    let next = index + cells;
    if next < ARENA_CELLS_COUNT && arena.blocktype(next) == Blocktype::Extent {
        arena.set_blocktype(next, Blocktype::Free);
    }
}

/// Mark the block at `cell` free. Neighbours are not merged; that is
/// left to sweep.
pub fn mark_free(cell: CellPtr) {
    set_blocktype(cell, Blocktype::Free);
}

#[cfg(test)]
pub mod tests {
    use super::*;

    /// Arena destroyed on drop
    pub struct TestArena(pub Arena);

    impl TestArena {
        pub fn new() -> Self {
            TestArena(Arena::create().unwrap())
        }

        pub fn at(&self, offset: usize) -> CellPtr {
            self.0.cell(ARENA_FIRST_CELL_INDEX + offset)
        }
    }

    impl Drop for TestArena {
        fn drop(&mut self) {
            unsafe { self.0.destroy() }
        }
    }

    #[test]
    fn test_arena_size_calculations() {
        assert_eq!(ARENA_SIZE_BYTES, 1 << 20);
        assert_eq!(ARENA_BITMAP_BYTES, ARENA_SIZE_BYTES / 128);
        assert_eq!(ARENA_CELLS_COUNT, ARENA_SIZE_BYTES / 16);
        assert_eq!(ARENA_FIRST_CELL_INDEX, 2 * ARENA_BITMAP_BYTES / 16);
        assert_eq!(ARENA_FIRST_CELL_INDEX, 1024);
        assert_eq!(ARENA_USABLE_CELLS, 64512);
    }

    #[test]
    fn test_arena_create() {
        let arena = TestArena::new();
        let a = arena.0;

        assert_eq!(a.as_ptr() as usize & (ARENA_SIZE_BYTES - 1), 0);
        assert_eq!(Arena::addr_of(a.cell(0)), a);
        assert_eq!(Arena::addr_of(a.cell(ARENA_CELLS_COUNT - 1)), a);
        assert_eq!(Arena::cell_index(a.cell(0)), 0);
        assert_eq!(get_blocktype(a.first_cell()), Blocktype::Free);
        assert_eq!(a.layout(4), "f...");
        assert_eq!(a.gray_len(), 0);
    }

    #[test]
    fn test_index_calculation() {
        let arena = TestArena::new();
        let a = arena.0;
        assert_eq!(Arena::cell_index(a.first_cell()), ARENA_FIRST_CELL_INDEX);
        assert_eq!(Arena::cell_index(a.cell(12345)), 12345);
    }

    #[test]
    fn test_blocktype_manipulation() {
        let arena = TestArena::new();
        let block = arena.0.first_cell();
        for t in [
            Blocktype::Extent,
            Blocktype::Free,
            Blocktype::White,
            Blocktype::Black,
        ] {
            set_blocktype(block, t);
            assert_eq!(get_blocktype(block), t);
        }
    }

    #[test]
    fn test_bitmap_encoding() {
        let arena = TestArena::new();
        let a = arena.0;
        let index = ARENA_FIRST_CELL_INDEX + 9;

        a.set_blocktype(index, Blocktype::White);
        assert!(Arena::bitmap_entry(a.block_bitmap(), index));
        assert!(!Arena::bitmap_entry(a.mark_bitmap(), index));

        a.set_blocktype(index, Blocktype::Free);
        assert!(!Arena::bitmap_entry(a.block_bitmap(), index));
        assert!(Arena::bitmap_entry(a.mark_bitmap(), index));

        // neighbours untouched
        assert_eq!(a.blocktype(index - 1), Blocktype::Extent);
        assert_eq!(a.blocktype(index + 1), Blocktype::Extent);
    }

    #[test]
    fn test_block_counting() {
        let arena = TestArena::new();

        let layout = [
            (0, Blocktype::White),
            (2, Blocktype::Free),
            (20, Blocktype::Black),
            (32, Blocktype::Black),
            (42, Blocktype::Black),
            (43, Blocktype::White),
            (44, Blocktype::White),
            (45, Blocktype::Free),
        ];

        for (offset, t) in layout {
            set_blocktype(arena.at(offset), t);
        }

        assert_eq!(arena.0.black_blocks(), 3);
        assert_eq!(arena.0.white_blocks(), 3);
        assert_eq!(arena.0.free_blocks(), 2);
    }

    #[test]
    fn test_is_empty() {
        let arena = TestArena::new();
        assert!(arena.0.is_empty());

        let p = arena.at(0);
        mark_allocated(p, 1);
        assert!(!arena.0.is_empty());

        set_blocktype(p, Blocktype::Black);
        assert!(!arena.0.is_empty());
    }

    #[test]
    fn test_is_coalesced() {
        let arena = TestArena::new();
        assert!(arena.0.is_coalesced());

        let p = arena.at(0);
        mark_allocated(p, 1);
        assert!(arena.0.is_coalesced());

        set_blocktype(p, Blocktype::Black);
        assert!(arena.0.is_coalesced());

        mark_free(p);
        assert!(!arena.0.is_coalesced());
    }

    #[test]
    fn test_mark_allocated_splits() {
        let arena = TestArena::new();
        mark_allocated(arena.at(0), 3);
        assert_eq!(arena.0.layout(6), "w..f..");

        // allocating into the head of the remainder splits it again
        mark_allocated(arena.at(3), 2);
        assert_eq!(arena.0.layout(6), "w..w.f");

        // exact fit before an existing block start leaves it alone
        set_blocktype(arena.at(5), Blocktype::Black);
        mark_allocated(arena.at(3), 2);
        assert_eq!(arena.0.layout(6), "w..w.b");
    }

    #[test]
    fn test_mark_allocated_at_arena_end() {
        let arena = TestArena::new();
        let last = arena.0.cell(ARENA_CELLS_COUNT - 1);
        mark_allocated(last, 1);
        assert_eq!(get_blocktype(last), Blocktype::White);
    }

    #[test]
    fn test_sweep() {
        let arena = TestArena::new();
        mark_allocated(arena.at(0), 2);
        mark_allocated(arena.at(2), 3);
        mark_allocated(arena.at(5), 1);
        assert_eq!(arena.0.layout(8), "w.w..wf.");

        set_blocktype(arena.at(2), Blocktype::Black);

        assert!(!arena.0.sweep());
        assert_eq!(arena.0.layout(8), "f.w..f..");
        assert!(arena.0.is_coalesced());

        // nothing marked this time round
        assert!(arena.0.sweep());
        assert_eq!(arena.0.layout(8), "f.......");
        assert!(arena.0.is_empty());
        assert_eq!(arena.0.free_blocks(), 1);
    }

    #[test]
    fn test_sweep_merges_free_into_preceding_run() {
        let arena = TestArena::new();
        mark_allocated(arena.at(0), 1);
        mark_allocated(arena.at(1), 1);
        mark_allocated(arena.at(2), 1);
        set_blocktype(arena.at(0), Blocktype::Black);
        mark_free(arena.at(1));
        assert_eq!(arena.0.layout(4), "bfwf");

        assert!(!arena.0.sweep());
        assert_eq!(arena.0.layout(4), "wf..");
    }

    #[test]
    fn test_sweep_idempotent_without_black() {
        let arena = TestArena::new();
        for offset in (0..200).step_by(4) {
            mark_allocated(arena.at(offset), 4);
        }
        for offset in (0..200).step_by(8) {
            mark_free(arena.at(offset));
        }

        arena.0.sweep();
        let first = arena.0.layout(ARENA_USABLE_CELLS);
        assert!(arena.0.sweep());
        assert_eq!(arena.0.layout(ARENA_USABLE_CELLS), first);
    }

    #[test]
    fn test_block_start() {
        let arena = TestArena::new();
        mark_allocated(arena.at(0), 2);
        mark_allocated(arena.at(2), 3);
        let index = |offset| ARENA_FIRST_CELL_INDEX + offset;

        assert_eq!(arena.0.block_start(index(0)), index(0));
        assert_eq!(arena.0.block_start(index(1)), index(0));
        assert_eq!(arena.0.block_start(index(4)), index(2));
        assert_eq!(arena.0.block_start(index(5)), index(5));
        assert_eq!(arena.0.block_start(ARENA_CELLS_COUNT - 1), index(5));
    }

    #[test]
    fn test_blocks_iteration() {
        let arena = TestArena::new();
        mark_allocated(arena.at(0), 2);
        mark_allocated(arena.at(2), 3);
        set_blocktype(arena.at(2), Blocktype::Black);

        let blocks: Vec<_> = arena
            .0
            .blocks()
            .map(|(ptr, t, cells)| (Arena::cell_index(ptr) - ARENA_FIRST_CELL_INDEX, t, cells))
            .collect();
        assert_eq!(
            blocks,
            vec![
                (0, Blocktype::White, 2),
                (2, Blocktype::Black, 3),
                (5, Blocktype::Free, ARENA_USABLE_CELLS - 5),
            ]
        );

        let free: Vec<_> = arena.0.free_blocks_iter().collect();
        assert_eq!(free, vec![(arena.at(5), ARENA_USABLE_CELLS - 5)]);
    }

    #[test]
    fn test_gray_stack() {
        let arena = TestArena::new();
        for offset in 0..300 {
            arena.0.push_gray(arena.at(offset));
        }
        assert_eq!(arena.0.gray_len(), 300);
        assert_eq!(arena.0.pop_gray(), Some(arena.at(299)));

        // the gray stack shares no bits with usable cells
        assert_eq!(arena.0.layout(1), "f");
        assert!(arena.0.is_empty());

        while arena.0.pop_gray().is_some() {}
        assert_eq!(arena.0.gray_len(), 0);
    }
}
