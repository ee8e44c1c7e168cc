//! Debug introspection shared between both engines: a description of a
//! single physical block, used by tests (and available to downstream
//! crates under the `introspection` feature) to walk a pool without
//! needing to understand either engine's header layout.
//!
//! Grounded in `TLSF::print_phys_blocks`/`print_free_lists`
//! (`examples/original_source/src/TLSF.cpp`), reinterpreted as a data type
//! rather than a direct-to-stdout printer — this crate has no log/print
//! target of its own outside tests (spec §2c).
#![cfg(any(test, feature = "introspection"))]

/// A snapshot of one physical block, independent of which engine produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Address of the block's header (not its payload).
    pub address: usize,
    /// `header_len` for the engine this block came from.
    pub header_len: usize,
    /// The block's payload size, in bytes.
    pub payload_size: usize,
    pub is_free: bool,
    pub is_last: bool,
}

impl BlockInfo {
    /// The address one past the end of this block — where the next
    /// physical block's header would start, if any.
    pub fn end(&self) -> usize {
        self.address + self.header_len + self.payload_size
    }
}

/// Iterates the set bit positions of a bitmap word, low to high — the
/// introspection equivalent of `TLSF::print_flatmap`. Allocation-free, so
/// it is usable from a `no_std` build under the `introspection` feature,
/// not just from tests.
pub struct BitmapBits<B> {
    bitmap: B,
    next: u32,
}

impl<B: crate::int::BinInteger> BitmapBits<B> {
    pub fn new(bitmap: B) -> Self {
        Self { bitmap, next: 0 }
    }
}

impl<B: crate::int::BinInteger> Iterator for BitmapBits<B> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        let pos = self.bitmap.bit_scan_forward(self.next);
        if pos >= B::BITS {
            None
        } else {
            self.next = pos + 1;
            Some(pos)
        }
    }
}
