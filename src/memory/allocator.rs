//! The allocator context
//!
//! Owns the arena registry, the bump cursor and the fit free lists.
//! Requests go to the strategy selected in `AllocatorSettings`. The
//! fit strategy falls back to bump allocation (and so to a fresh
//! arena) when no free block is large enough.
//!
//! Not thread safe. A host with several mutator threads needs one
//! allocator per thread or its own locking.

use std::fmt::Debug;
use std::ptr::write_bytes;

use log::{debug, info, trace};

use super::arena::{mark_allocated, Arena, ARENA_USABLE_CELLS};
use super::bag::Bag;
use super::bump::BumpAllocator;
use super::cell::{bytes_to_cells, CellPtr, CELL_SIZE_BYTES};
use super::error::AllocError;
use super::fit::FitAllocator;
use super::settings::{AllocationStrategy, AllocatorSettings};

/// Initial capacity of the arena registry
pub const ARENA_BAG_INIT_SIZE: usize = 16;

/// Largest request that fits in a single arena
pub const MAX_ALLOCATION_BYTES: usize = ARENA_USABLE_CELLS * CELL_SIZE_BYTES;

/// Snapshot of allocator counters.
///
/// Apart from `arenas` these are only maintained in debug builds or
/// with the `gc-telemetry` feature.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    /// Arenas currently registered
    pub arenas: usize,
    pub arenas_created: u64,
    pub arenas_destroyed: u64,
    pub allocations: u64,
    /// Bytes requested
    pub bytes_allocated: u64,
    /// Cells handed out (requests rounded up)
    pub cells_allocated: u64,
    pub bump_allocations: u64,
    pub fit_allocations: u64,
    /// Fit requests that found nothing and went to bump allocation
    pub fit_fallbacks: u64,
    /// Stale free list entries dropped during fit searches
    pub stale_entries_discarded: u64,
    /// Individual arena sweeps
    pub sweeps: u64,
}

/// Result of sweeping every arena
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub arenas_swept: usize,
    /// Arenas with no live block after the sweep
    pub empty_arenas: usize,
    /// Empty arenas returned to the OS
    pub arenas_released: usize,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum AllocationPath {
    Bump,
    Fit,
    FitFallback,
}

pub struct Allocator {
    settings: AllocatorSettings,
    /// Every live arena
    arenas: Bag<Arena>,
    bump: BumpAllocator,
    fit: FitAllocator,
    stats: AllocatorStats,
}

impl Default for Allocator {
    fn default() -> Self {
        Allocator::new()
    }
}

impl Allocator {
    pub fn new() -> Self {
        Allocator::with_settings(AllocatorSettings::default())
    }

    pub fn with_settings(settings: AllocatorSettings) -> Self {
        Allocator {
            settings,
            arenas: Bag::new(ARENA_BAG_INIT_SIZE),
            bump: BumpAllocator::new(),
            fit: FitAllocator::new(),
            stats: AllocatorStats::default(),
        }
    }

    pub fn settings(&self) -> &AllocatorSettings {
        &self.settings
    }

    /// Allocate a block of at least `bytes` bytes.
    ///
    /// The block starts white. Requests must be between one byte and
    /// `MAX_ALLOCATION_BYTES`; anything else is a bug in the caller
    /// and asserts in debug builds.
    pub fn allocate(&mut self, bytes: usize) -> Result<CellPtr, AllocError> {
        let cells = bytes_to_cells(bytes);
        debug_assert!(
            cells > 0 && cells <= ARENA_USABLE_CELLS,
            "invalid allocation size: {} bytes",
            bytes
        );
        if cells == 0 || cells > ARENA_USABLE_CELLS {
            return Err(AllocError::BadRequest {
                bytes,
                max: MAX_ALLOCATION_BYTES,
            });
        }

        let (ptr, path) = match self.settings.strategy {
            AllocationStrategy::Bump => (self.bump_allocate(cells)?, AllocationPath::Bump),
            AllocationStrategy::Fit => match self.fit.allocate(cells) {
                Some(ptr) => (ptr, AllocationPath::Fit),
                None => {
                    trace!("no free block of {} cells, falling back to bump", cells);
                    (self.bump_allocate(cells)?, AllocationPath::FitFallback)
                }
            },
        };

        mark_allocated(ptr, cells);

        if !self.settings.suppress_zero_fill {
            unsafe { write_bytes(ptr.as_bytes_ptr(), 0, bytes) };
        }

        self.record_allocation(bytes, cells, path);
        Ok(ptr)
    }

    /// Bump allocate, moving to a new arena if the current run is too
    /// short
    fn bump_allocate(&mut self, cells: usize) -> Result<CellPtr, AllocError> {
        if let Some(ptr) = self.bump.bump(cells) {
            return Ok(ptr);
        }

        let arena = self.create_arena()?;
        self.bump.assign_arena(arena);
        self.bump.bump(cells).ok_or(AllocError::BadRequest {
            bytes: cells * CELL_SIZE_BYTES,
            max: MAX_ALLOCATION_BYTES,
        })
    }

    fn create_arena(&mut self) -> Result<Arena, AllocError> {
        let arena = Arena::create()?;
        self.arenas.add(arena);

        #[cfg(any(debug_assertions, feature = "gc-telemetry"))]
        {
            self.stats.arenas_created += 1;
        }

        Ok(arena)
    }

    /// Make a block available to the fit strategy. Used for blocks
    /// freed outside a sweep.
    pub fn fit_allocator_add(&mut self, ptr: CellPtr, cells: usize) {
        self.fit.add(ptr, cells);
    }

    /// Sweep a single arena and hand its free blocks to the fit
    /// strategy.
    ///
    /// Returns true if the arena held no live (black) block, in which
    /// case it may be destroyed.
    pub fn sweep(&mut self, arena: Arena) -> bool {
        self.fit.purge(arena);
        let free = sweep_into(arena, &mut self.bump, &mut self.fit);

        debug!("swept arena {:p}, empty: {}", arena.as_ptr(), free);
        self.record_sweeps(1);
        self.dump_heap();
        free
    }

    /// Sweep every registered arena.
    ///
    /// With `release_empty_arenas` set, arenas left with no live block
    /// are destroyed and any handles to them become invalid.
    pub fn sweep_all(&mut self) -> SweepSummary {
        let mut summary = SweepSummary::default();
        let mut empty = vec![];

        self.fit.clear();

        for &arena in self.arenas.iter() {
            let free = sweep_into(arena, &mut self.bump, &mut self.fit);
            summary.arenas_swept += 1;

            if free {
                summary.empty_arenas += 1;
                if self.settings.release_empty_arenas {
                    empty.push(arena);
                }
            }
        }

        for arena in empty {
            // registered arenas are owned by the allocator
            if unsafe { self.destroy_arena(arena) } {
                summary.arenas_released += 1;
            }
        }

        debug!(
            "swept {} arenas: {} empty, {} released",
            summary.arenas_swept, summary.empty_arenas, summary.arenas_released
        );
        self.record_sweeps(summary.arenas_swept);
        self.dump_heap();
        summary
    }

    /// Remove an arena from the registry and return it to the OS.
    ///
    /// Returns false if the arena is not registered with this
    /// allocator, in which case nothing happens.
    ///
    /// # Safety
    ///
    /// No copy of the handle and no pointer into the arena may be used
    /// afterwards.
    pub unsafe fn destroy_arena(&mut self, arena: Arena) -> bool {
        let index = match self.arenas.iter().position(|a| *a == arena) {
            Some(index) => index,
            None => return false,
        };

        self.arenas.remove_index(index);
        self.fit.purge(arena);
        if self.bump.cursor().map_or(false, |ptr| arena.contains(ptr)) {
            self.bump.reset();
        }
        arena.destroy();

        #[cfg(any(debug_assertions, feature = "gc-telemetry"))]
        {
            self.stats.arenas_destroyed += 1;
        }

        true
    }

    /// All live arenas, for collectors that need to visit each one
    pub fn arenas(&self) -> impl Iterator<Item = Arena> + '_ {
        self.arenas.iter().copied()
    }

    pub fn arena_count(&self) -> usize {
        self.arenas.len()
    }

    pub fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            arenas: self.arenas.len(),
            stale_entries_discarded: self.stale_entries_discarded(),
            ..self.stats.clone()
        }
    }

    fn stale_entries_discarded(&self) -> u64 {
        #[cfg(any(debug_assertions, feature = "gc-telemetry"))]
        {
            self.fit.discarded()
        }
        #[cfg(not(any(debug_assertions, feature = "gc-telemetry")))]
        {
            0
        }
    }

    #[cfg_attr(
        not(any(debug_assertions, feature = "gc-telemetry")),
        allow(unused_variables)
    )]
    fn record_allocation(&mut self, bytes: usize, cells: usize, path: AllocationPath) {
        #[cfg(any(debug_assertions, feature = "gc-telemetry"))]
        {
            let stats = &mut self.stats;
            stats.allocations += 1;
            stats.bytes_allocated += bytes as u64;
            stats.cells_allocated += cells as u64;
            match path {
                AllocationPath::Bump => stats.bump_allocations += 1,
                AllocationPath::Fit => stats.fit_allocations += 1,
                AllocationPath::FitFallback => {
                    stats.fit_fallbacks += 1;
                    stats.bump_allocations += 1;
                }
            }
        }
    }

    #[cfg_attr(
        not(any(debug_assertions, feature = "gc-telemetry")),
        allow(unused_variables)
    )]
    fn record_sweeps(&mut self, count: usize) {
        #[cfg(any(debug_assertions, feature = "gc-telemetry"))]
        {
            self.stats.sweeps += count as u64;
        }
    }

    fn dump_heap(&self) {
        if self.settings.dump_heap {
            info!("allocator state:\n{:?}", self);
        }
    }
}

/// Sweep `arena` and hand its free blocks to the fit lists.
///
/// A bump run inside the arena stays with the bump allocator. If the
/// sweep merged the run into a free block before it, the run grows
/// back to the start of that block.
fn sweep_into(arena: Arena, bump: &mut BumpAllocator, fit: &mut FitAllocator) -> bool {
    let cursor = bump.cursor().filter(|_| bump.is_in(arena));

    let free = arena.sweep();

    let run = cursor.map(|cursor| {
        let start = arena.cell(arena.block_start(Arena::cell_index(cursor)));
        let reclaimed = (cursor.addr() - start.addr()) / CELL_SIZE_BYTES;
        let remaining = bump.remaining();
        bump.assign(start, remaining + reclaimed);
        start
    });

    for (ptr, cells) in arena.free_blocks_iter() {
        if Some(ptr) != run {
            fit.add(ptr, cells);
        }
    }

    free
}

impl Drop for Allocator {
    fn drop(&mut self) {
        while let Some(arena) = self.arenas.pop() {
            unsafe { arena.destroy() }
        }
    }
}

impl Debug for Allocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for arena in &self.arenas {
            writeln!(f, "(Ar) {:?}", arena)?;
        }
        writeln!(f, "(Bp) {:?}", self.bump)?;
        writeln!(f, "(Ft) {:?}", self.fit)
    }
}
