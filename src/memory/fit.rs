//! Segregated free lists with first-fit search
//!
//! Small blocks (up to `SMALL_FREE_LISTS` cells) live in exact size
//! classes indexed by `cells - 1`. Larger blocks live in exponential
//! classes: the size is shifted right by `LARGE_FREE_LIST_FIRST_EXP`
//! and the class is the floor of its base 2 logarithm.
//!
//! Entries are hints. Sweeps coalesce and reallocate blocks behind
//! the lists' backs so every candidate is checked against the arena
//! bitmaps when it is taken, and stale ones are dropped.

use std::fmt::Debug;

use super::arena::{get_blocktype, Arena, Blocktype, ARENA_CELLS_COUNT, ARENA_SIZE_BITS};
use super::bag::Bag;
use super::cell::{CellPtr, CELL_SIZE_BITS};

/// Exponent of the smallest size (in cells) held in a large list
pub const LARGE_FREE_LIST_FIRST_EXP: usize = 5;
/// Exact size classes 1..=31 cells
pub const SMALL_FREE_LISTS: usize = (1 << LARGE_FREE_LIST_FIRST_EXP) - 1;
/// Exponential size classes covering everything up to an arena
pub const LARGE_FREE_LISTS: usize = ARENA_SIZE_BITS - CELL_SIZE_BITS - LARGE_FREE_LIST_FIRST_EXP;

pub const SMALL_FREE_LIST_INIT_SIZE: usize = 16;
pub const LARGE_FREE_LIST_INIT_SIZE: usize = 4;

/// Free list entry for a large block, which has to carry its size
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LargeFreeBlock {
    pub ptr: CellPtr,
    pub cells: usize,
}

/// Free list a block of a given size belongs in
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SizeClass {
    /// Exact size class, index is cells - 1
    Small(usize),
    /// Exponential size class
    Large(usize),
}

impl SizeClass {
    pub fn for_cells(cells: usize) -> SizeClass {
        debug_assert!(cells > 0);
        if is_small(cells) {
            SizeClass::Small(small_index(cells))
        } else {
            SizeClass::Large(large_index(cells))
        }
    }
}

pub fn is_small(cells: usize) -> bool {
    cells <= SMALL_FREE_LISTS
}

fn small_index(cells: usize) -> usize {
    debug_assert!(is_small(cells));
    cells - 1
}

fn small_index_to_cells(index: usize) -> usize {
    debug_assert!(index < SMALL_FREE_LISTS);
    index + 1
}

fn large_index(cells: usize) -> usize {
    debug_assert!(!is_small(cells));
    // everything belonging in the first large list shifts down to 1
    let shifted = cells >> LARGE_FREE_LIST_FIRST_EXP;
    let index = (usize::BITS - shifted.leading_zeros() - 1) as usize;
    debug_assert!(index < LARGE_FREE_LISTS);
    index
}

/// Whether a free list entry still describes a real free block: the
/// start must be free and the block must end where a new block (or
/// the arena) begins.
pub fn valid_block(ptr: CellPtr, cells: usize) -> bool {
    debug_assert!(cells > 0);
    if get_blocktype(ptr) != Blocktype::Free {
        return false;
    }
    let end = Arena::cell_index(ptr) + cells;
    end >= ARENA_CELLS_COUNT || Arena::addr_of(ptr).blocktype(end) != Blocktype::Extent
}

pub struct FitAllocator {
    small: Vec<Bag<CellPtr>>,
    large: Vec<Bag<LargeFreeBlock>>,
    /// Stale entries dropped during searches
    discarded: u64,
}

impl Default for FitAllocator {
    fn default() -> Self {
        FitAllocator::new()
    }
}

impl FitAllocator {
    pub fn new() -> Self {
        FitAllocator {
            small: (0..SMALL_FREE_LISTS)
                .map(|_| Bag::new(SMALL_FREE_LIST_INIT_SIZE))
                .collect(),
            large: (0..LARGE_FREE_LISTS)
                .map(|_| Bag::new(LARGE_FREE_LIST_INIT_SIZE))
                .collect(),
            discarded: 0,
        }
    }

    /// Make a block of `cells` cells at `ptr` available for reuse
    pub fn add(&mut self, ptr: CellPtr, cells: usize) {
        if cells == 0 {
            return;
        }
        match SizeClass::for_cells(cells) {
            SizeClass::Small(index) => self.small[index].add(ptr),
            SizeClass::Large(index) => self.large[index].add(LargeFreeBlock { ptr, cells }),
        }
    }

    /// Find a free block of at least `cells` cells, returning its
    /// start. Any excess is split off and put back on the lists.
    pub fn allocate(&mut self, cells: usize) -> Option<CellPtr> {
        match SizeClass::for_cells(cells) {
            SizeClass::Small(index) => self.small_first_fit(index, cells),
            SizeClass::Large(index) => self.large_first_fit(index, cells),
        }
    }

    fn small_first_fit(&mut self, first_index: usize, cells: usize) -> Option<CellPtr> {
        for index in first_index..SMALL_FREE_LISTS {
            let list_cells = small_index_to_cells(index);

            while let Some(ptr) = self.small[index].pop() {
                if valid_block(ptr, list_cells) {
                    self.add(ptr.add(cells), list_cells - cells);
                    return Some(ptr);
                }
                self.discarded += 1;
            }
        }

        self.large_first_fit(0, cells)
    }

    fn large_first_fit(&mut self, first_index: usize, cells: usize) -> Option<CellPtr> {
        for index in first_index..LARGE_FREE_LISTS {
            let list = &mut self.large[index];
            let mut found = None;

            // Walk down from the end. Removal swaps in the last item,
            // which has already been looked at.
            let mut i = list.len();
            while i > 0 {
                i -= 1;
                let Some(&item) = list.get(i) else { break };

                if !valid_block(item.ptr, item.cells) {
                    list.remove_index(i);
                    self.discarded += 1;
                } else if item.cells >= cells {
                    list.remove_index(i);
                    found = Some(item);
                    break;
                }
            }

            if let Some(item) = found {
                self.add(item.ptr.add(cells), item.cells - cells);
                return Some(item.ptr);
            }
        }

        None
    }

    /// Drop every entry pointing into `arena`
    pub fn purge(&mut self, arena: Arena) {
        for list in &mut self.small {
            list.retain(|ptr| !arena.contains(*ptr));
        }
        for list in &mut self.large {
            list.retain(|item| !arena.contains(item.ptr));
        }
    }

    /// Drop every entry
    pub fn clear(&mut self) {
        *self = FitAllocator {
            discarded: self.discarded,
            ..FitAllocator::new()
        };
    }

    pub fn small_list_len(&self, index: usize) -> usize {
        self.small[index].len()
    }

    pub fn large_list_len(&self, index: usize) -> usize {
        self.large[index].len()
    }

    /// Total entries across all lists, stale or not
    pub fn entries(&self) -> usize {
        self.small.iter().map(Bag::len).sum::<usize>()
            + self.large.iter().map(Bag::len).sum::<usize>()
    }

    pub fn discarded(&self) -> u64 {
        self.discarded
    }
}

impl Debug for FitAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fit small:")?;
        for (index, list) in self.small.iter().enumerate().filter(|(_, l)| !l.is_empty()) {
            write!(f, " {}x{}", small_index_to_cells(index), list.len())?;
        }
        write!(f, " large:")?;
        for (index, list) in self.large.iter().enumerate().filter(|(_, l)| !l.is_empty()) {
            write!(f, " 2^{}x{}", index + LARGE_FREE_LIST_FIRST_EXP, list.len())?;
        }
        Ok(())
    }
}
