//! A two-level segregated fit (TLSF) dynamic memory allocator that operates
//! over a caller-supplied contiguous byte region.
//!
//! Two independent engines are provided, sharing the same size-class
//! mapping arithmetic ([`mapping`]) but nothing else, because their header
//! layouts genuinely differ in which fields are *present*, not just in
//! their values:
//!
//! - [`general::GeneralTlsf`] — the classic `FL × SL` segregated-list TLSF,
//!   with a `prev_phys_block` link and immediate boundary-tag coalescing on
//!   every `free`. Good general-purpose behavior: O(1) allocate, O(1) free,
//!   no pool-size-proportional cost ever paid.
//! - [`region::RegionTlsf`] — a flattened, 56-class map with a compact
//!   header (`u32` offset links instead of pointers, no `prev_phys`) and
//!   deferred coalescing: `free`/`free_range` re-index freed blocks into
//!   their free list right away but never inspect physical neighbors, so
//!   [`region::RegionTlsf::aggregate`] is the only thing that merges
//!   adjacent free runs, in one O(n) pass. Suited to the fixed-size
//!   partition case this configuration is named for, where a single
//!   aggregation point (e.g. between frames) is cheaper than coalescing on
//!   every free.
//!
//! Both engines:
//!
//! - place their control structure at the base of the region passed to
//!   `construct`, so there is no separate heap allocation for allocator
//!   metadata;
//! - return 8-byte-aligned payload addresses;
//! - provide no thread safety, no automatic pool growth, and no zeroing of
//!   freed memory — callers needing those layer them on top.
#![cfg_attr(not(test), no_std)]

#[cfg(test)]
extern crate std;

pub mod debug;
pub mod general;
pub mod int;
pub mod mapping;
pub mod region;
#[cfg(test)]
mod test_util;

pub use self::{general::GeneralTlsf, region::RegionTlsf};
