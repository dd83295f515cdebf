//! Cell-granular memory for a mark and sweep collector
pub mod allocator;
pub mod arena;
pub mod bag;
pub mod bump;
pub mod cell;
pub mod error;
pub mod fit;
pub mod region;
pub mod settings;
