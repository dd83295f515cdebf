extern crate libc;
extern crate log;
extern crate structopt;
extern crate thiserror;

pub mod memory;

pub use memory::allocator::{Allocator, AllocatorStats, SweepSummary};
pub use memory::arena::{
    get_blocktype, mark_allocated, mark_free, set_blocktype, Arena, Blocktype,
};
pub use memory::cell::CellPtr;
pub use memory::error::AllocError;
pub use memory::settings::{AllocationStrategy, AllocatorSettings};
