//! pagetrap: a sampling guarded-page allocator.
//!
//! Serves a small, randomly-sampled subset of heap allocations from
//! individually guarded pages so that out-of-bounds and use-after-free
//! accesses crash deterministically via a hardware fault, at production
//! cost. It runs alongside the process's normal allocator, never instead of
//! it: capacity is small and fixed, and the sampling layer falls back to the
//! general allocator whenever [`GuardedAllocator::allocate`] declines.
//!
//! The fault itself is raised by the OS to an external crash handler, which
//! calls [`GuardedAllocator::diagnose`] (lock-free and signal-safe) to
//! attribute the faulting address to a slot and its recorded history.

pub mod allocator;
pub mod config;
pub mod free_set;
pub mod meta;
pub mod platform;
pub mod quarantine;
pub mod region;
pub mod report;
pub mod sync;
pub mod util;

pub use allocator::{DeallocError, GuardedAllocator, PoolStats};
pub use config::Config;
pub use meta::{FaultKind, SlotSnapshot, SlotState};
pub use platform::{MmapBackend, RegionBackend};
pub use region::RegionUnavailable;
