//! Two interchangeable general-purpose allocators behind one front-end.
//!
//! [`Heap`] wraps either a segregated free-list allocator, which carves
//! blocks out of one pre-reserved arena, or a McKusick-Karels allocator,
//! which hands out slots from bucketed slab pages. Both return raw
//! pointers with at least the requested number of writable bytes,
//! 8-aligned, and keep per-handle [`AllocStats`] counters.
//!
//! Handles are strictly single-threaded; see [`Heap`] for the contract.

pub mod error;
pub mod heap;
pub mod mckusick;
pub mod segregated;
pub mod stats;

pub use error::{Error, Result};
pub use heap::{AllocatorKind, Heap};
pub use stats::AllocStats;
