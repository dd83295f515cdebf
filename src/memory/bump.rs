//! Bump allocation over the current arena
//!
//! The cursor is a (pointer, remaining cells) pair. Allocation hands
//! out the cursor and advances it. When a request does not fit, the
//! caller supplies a fresh arena via `assign` and the old arena's tail
//! is left behind as an ordinary free block.

use std::fmt::Debug;

use super::arena::{Arena, ARENA_USABLE_CELLS};
use super::cell::CellPtr;

#[derive(Default)]
pub struct BumpAllocator {
    /// Next cell to hand out
    cursor: Option<CellPtr>,
    /// Cells remaining after the cursor
    remaining: usize,
}

impl BumpAllocator {
    pub fn new() -> Self {
        BumpAllocator::default()
    }

    /// Point the cursor at a run of `cells` free cells
    pub fn assign(&mut self, ptr: CellPtr, cells: usize) {
        self.cursor = Some(ptr);
        self.remaining = cells;
    }

    /// Point the cursor at the whole usable area of a fresh arena
    pub fn assign_arena(&mut self, arena: Arena) {
        self.assign(arena.first_cell(), ARENA_USABLE_CELLS);
    }

    /// Drop the current run, if any
    pub fn reset(&mut self) {
        self.cursor = None;
        self.remaining = 0;
    }

    /// Bump cursor forward by `cells`, or `None` if the current run is
    /// too small
    pub fn bump(&mut self, cells: usize) -> Option<CellPtr> {
        if cells > self.remaining {
            None
        } else {
            let result = self.cursor?;
            self.advance(cells);
            Some(result)
        }
    }

    fn advance(&mut self, cells: usize) {
        self.cursor = self.cursor.map(|ptr| ptr.add(cells));
        self.remaining -= cells;
    }

    pub fn cursor(&self) -> Option<CellPtr> {
        self.cursor
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }

    /// Whether the current run lies in `arena`
    pub fn is_in(&self, arena: Arena) -> bool {
        self.cursor.map_or(false, |ptr| {
            self.remaining > 0 && Arena::addr_of(ptr) == arena
        })
    }
}

impl Debug for BumpAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.cursor {
            Some(ptr) => write!(f, "bump {:?} +{}", ptr, self.remaining),
            None => write!(f, "bump unassigned"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::arena::{tests::TestArena, ARENA_FIRST_CELL_INDEX};
    use super::*;

    #[test]
    fn test_unassigned_bump_fails() {
        let mut bump = BumpAllocator::new();
        assert_eq!(bump.bump(1), None);
        assert_eq!(bump.remaining(), 0);
    }

    #[test]
    fn test_bump_allocator_internals() {
        let arena = TestArena::new();
        let first = arena.0.first_cell();
        let mut bump = BumpAllocator::new();
        bump.assign_arena(arena.0);

        assert_eq!(bump.cursor(), Some(first));
        assert_eq!(bump.remaining(), ARENA_USABLE_CELLS);

        assert_eq!(bump.bump(1), Some(first));
        assert_eq!(bump.remaining(), ARENA_USABLE_CELLS - 1);

        let q = bump.bump(1 << 10).unwrap();
        assert_eq!(Arena::cell_index(q), ARENA_FIRST_CELL_INDEX + 1);
        assert_eq!(bump.remaining(), ARENA_USABLE_CELLS - 1 - (1 << 10));
        assert!(bump.is_in(arena.0));
    }

    #[test]
    fn test_bump_exhaustion() {
        let arena = TestArena::new();
        let mut bump = BumpAllocator::new();
        bump.assign(arena.at(0), 10);

        assert!(bump.bump(6).is_some());
        assert_eq!(bump.bump(5), None);
        // a failed bump leaves the cursor alone
        assert_eq!(bump.cursor(), Some(arena.at(6)));
        assert_eq!(bump.bump(4), Some(arena.at(6)));
        assert_eq!(bump.remaining(), 0);
        assert!(!bump.is_in(arena.0));
    }

    #[test]
    fn test_reset() {
        let arena = TestArena::new();
        let mut bump = BumpAllocator::new();
        bump.assign_arena(arena.0);
        bump.reset();
        assert_eq!(bump.cursor(), None);
        assert_eq!(bump.bump(1), None);
    }
}
