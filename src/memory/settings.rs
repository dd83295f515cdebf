//! Allocator settings
use std::{fmt, str::FromStr};

use structopt::StructOpt;

/// Which allocator to try first for each request
#[derive(Copy, Debug, Clone, PartialEq, Eq)]
pub enum AllocationStrategy {
    /// Bump allocate, opening a new arena when the current run is
    /// exhausted
    Bump,
    /// Search the free lists first, falling back to bump allocation
    Fit,
}

impl Default for AllocationStrategy {
    fn default() -> Self {
        AllocationStrategy::Bump
    }
}

impl FromStr for AllocationStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bump" => Ok(AllocationStrategy::Bump),
            "fit" => Ok(AllocationStrategy::Fit),
            _ => Err(format!("unknown allocation strategy: {s}")),
        }
    }
}

impl fmt::Display for AllocationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bump => write!(f, "bump"),
            Self::Fit => write!(f, "fit"),
        }
    }
}

/// Settings to control allocation and arena lifecycle
#[derive(StructOpt, Debug, Clone, Default)]
pub struct AllocatorSettings {
    /// Allocator to try first (bump or fit)
    #[structopt(long = "alloc-strategy", default_value)]
    pub strategy: AllocationStrategy,
    /// Do not zero memory handed out by the allocator
    #[structopt(long = "alloc-suppress-zero-fill")]
    pub suppress_zero_fill: bool,
    /// Return arenas to the OS when a sweep leaves them empty
    #[structopt(long = "alloc-release-empty-arenas")]
    pub release_empty_arenas: bool,
    /// Log arena and free list state after each sweep
    #[structopt(long = "alloc-dump-heap")]
    pub dump_heap: bool,
}

impl AllocatorSettings {
    pub fn with_strategy(mut self, strategy: AllocationStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_zero_fill(mut self, zero_fill: bool) -> Self {
        self.suppress_zero_fill = !zero_fill;
        self
    }

    pub fn with_release_empty_arenas(mut self, release: bool) -> Self {
        self.release_empty_arenas = release;
        self
    }

    pub fn with_dump_heap(mut self, dump: bool) -> Self {
        self.dump_heap = dump;
        self
    }
}
