//! An independent model of allocator state, used to cross-check both engines
//! under randomized operation traces. Grounded in `yvt-rlsf`'s
//! `ShadowAllocator` (`crates/rlsf/src/tests.rs`, `crates/rlsf/src/tlsf/tests.rs`).
#![cfg(test)]

use std::{collections::BTreeMap, ops::Range};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SaRegion {
    Free,
    Used,
    /// Padding consumed by a header or alignment gap: neither free nor
    /// allocatable, but not an error for it to exist.
    Invalid,
}

/// A `BTreeMap<start, (end, kind)>` model of which byte ranges of a pool are
/// free, used, or non-allocatable padding. Used by quickcheck-driven tests to
/// confirm the real engines never report success where this model would
/// disagree, and vice versa.
#[derive(Debug, Default)]
pub struct ShadowAllocator {
    regions: BTreeMap<usize, (usize, SaRegion)>,
}

impl ShadowAllocator {
    pub fn new() -> Self {
        Self {
            regions: BTreeMap::new(),
        }
    }

    fn convert_range(&mut self, range: Range<usize>, kind: SaRegion) {
        if range.start == range.end {
            return;
        }
        log::trace!("shadow: marking {:?} as {:?}", range, kind);

        // Split any overlapping region at the boundaries, then overwrite the
        // fully-contained middle with `kind`.
        let overlapping_starts: Vec<usize> = self
            .regions
            .range(..range.end)
            .rev()
            .take_while(|(&start, &(end, _))| end > range.start || start < range.end)
            .map(|(&start, _)| start)
            .collect();

        for start in overlapping_starts {
            let (end, existing_kind) = self.regions.remove(&start).unwrap();
            if start < range.start {
                self.regions.insert(start, (range.start, existing_kind));
            }
            if end > range.end {
                self.regions.insert(range.end, (end, existing_kind));
            }
        }

        self.regions.insert(range.start, (range.end, kind));
    }

    /// Record that `range` is a free block.
    pub fn insert_free_block(&mut self, range: Range<usize>) {
        self.convert_range(range, SaRegion::Free);
    }

    /// Record that `range` is header/alignment padding, never allocatable.
    pub fn mark_invalid(&mut self, range: Range<usize>) {
        self.convert_range(range, SaRegion::Invalid);
    }

    /// Record that `range` is used, at an address chosen by the real
    /// engine rather than guessed by [`Self::allocate`] — for tests that
    /// need the shadow model to agree with real physical addresses exactly.
    pub fn mark_used(&mut self, range: Range<usize>) {
        self.convert_range(range, SaRegion::Used);
    }

    /// Find the lowest-addressed free region at least `size` bytes long and
    /// mark the first `size` bytes of it used, mirroring the engines'
    /// first-fit-within-class behavior closely enough to agree on whether an
    /// allocation should succeed.
    pub fn allocate(&mut self, size: usize) -> Option<usize> {
        let found = self.regions.iter().find_map(|(&start, &(end, kind))| {
            if kind == SaRegion::Free && end - start >= size {
                Some(start)
            } else {
                None
            }
        });

        if let Some(start) = found {
            self.convert_range(start..start + size, SaRegion::Used);
            Some(start)
        } else {
            None
        }
    }

    /// Record that the block starting at `start` with payload `size` has
    /// been freed.
    pub fn deallocate(&mut self, start: usize, size: usize) {
        self.convert_range(start..start + size, SaRegion::Free);
    }

    /// Whether any part of `range` overlaps a region `self` believes is
    /// used. Tolerates `range` spanning several adjacent same-kind entries
    /// (e.g. after the real engine coalesces blocks the model never
    /// merged) — useful for checking a wide, possibly-coalesced span is
    /// free without requiring one entry to cover it exactly.
    pub fn any_used_overlap(&self, range: Range<usize>) -> bool {
        self.regions.iter().any(|(&start, &(end, kind))| {
            kind == SaRegion::Used && start < range.end && range.start < end
        })
    }

    /// Total bytes currently tracked as used.
    pub fn used_bytes(&self) -> usize {
        self.regions
            .iter()
            .filter(|(_, &(_, kind))| kind == SaRegion::Used)
            .map(|(&start, &(end, _))| end - start)
            .sum()
    }
}
