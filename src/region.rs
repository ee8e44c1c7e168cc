//! The region-optimized TLSF engine: a flat 56-class map, a compact header
//! with 32-bit offset free-list links instead of full pointers, and deferred
//! coalescing (`aggregate`, `free_range`) instead of merging on every `free`.
//!
//! There is no Rust teacher equivalent for this configuration; it is
//! grounded entirely in `examples/original_source/src/TLSF.cpp`'s
//! `ZPageOptimizedTLSF`, reshaped into the free-list/bitmap idiom
//! `crate::general` borrows from `yvt-rlsf`.

use core::{marker::PhantomData, mem, ptr::NonNull};

use crate::{
    int::{align_down, align_up, BinInteger},
    mapping::region as mapping,
};

/// Payload alignment, as in [`crate::general`].
pub const ALIGNMENT: usize = 8;

const FREE_BIT: usize = 1;
const LAST_BIT: usize = 1 << 1;
const SIZE_MASK: usize = !(FREE_BIT | LAST_BIT);

/// Sentinel offset meaning "no link", analogous to a null pointer but valid
/// to store in a `u32` (spec §3: "a sentinel — conventionally `u32::MAX`").
const NONE_OFFSET: u32 = u32::MAX;

#[derive(Debug)]
struct BlockHdr {
    /// Payload byte count with `FREE_BIT`/`LAST_BIT` packed into the low two
    /// bits. No `prev_phys` field: the region engine never needs to find
    /// the physically preceding block, only to walk forward.
    size: usize,
}

impl BlockHdr {
    #[inline]
    fn get_size(&self) -> usize {
        self.size & SIZE_MASK
    }

    #[inline]
    fn is_free(&self) -> bool {
        self.size & FREE_BIT != 0
    }

    #[inline]
    fn is_last(&self) -> bool {
        self.size & LAST_BIT != 0
    }

    #[inline]
    fn mark_free(&mut self) {
        self.size |= FREE_BIT;
    }

    #[inline]
    fn mark_used(&mut self) {
        self.size &= !FREE_BIT;
    }
}

#[repr(C)]
#[derive(Debug)]
struct FreeBlockHdr {
    common: BlockHdr,
    /// Offset (from `block_start`) of the next block in this size class's
    /// free list, or [`NONE_OFFSET`].
    next_free: u32,
    /// Offset of the previous block in this size class's free list, or
    /// [`NONE_OFFSET`].
    prev_free: u32,
}

#[repr(C)]
#[derive(Debug)]
struct UsedBlockHdr {
    common: BlockHdr,
}

/// The region-optimized allocator engine: a flat `NUM_CLASSES`-way
/// segregated free list with a compact header and deferred coalescing.
///
/// As with [`crate::general::GeneralTlsf`], the control structure is
/// embedded at the base of the caller-supplied region.
#[derive(Debug)]
pub struct RegionTlsf<'pool> {
    /// One bit per class; `NUM_CLASSES` (56) comfortably fits a `u64`.
    bitmap: u64,
    heads: [u32; mapping::NUM_CLASSES],
    block_start: usize,
    pool_size: usize,
    _phantom: PhantomData<&'pool mut ()>,
}

unsafe impl Send for RegionTlsf<'_> {}
unsafe impl Sync for RegionTlsf<'_> {}

impl<'pool> RegionTlsf<'pool> {
    /// Minimum payload size: fixed at 16 bytes (spec §6, matching
    /// `ZPageOptimizedTLSF`'s `MBS`).
    pub const MBS: usize = 16;

    /// Offset from a block's header to its payload: just the flagged `size`
    /// word, since the region header carries no `prev_phys` (spec §6:
    /// "offsetof(header, next_free)").
    pub const HEADER_LEN: usize = mem::size_of::<UsedBlockHdr>();

    /// Embed the control structure at (an alignment-rounded) `region`'s base
    /// and return a `'pool`-scoped handle into the rest, exactly as
    /// [`crate::general::GeneralTlsf::construct`] does.
    pub fn construct(region: &'pool mut [mem::MaybeUninit<u8>]) -> Option<&'pool mut Self> {
        let base = region.as_mut_ptr() as usize;
        let len = region.len();

        let ctrl_align = mem::align_of::<Self>().max(ALIGNMENT);
        let ctrl_start = align_up(base, ctrl_align);
        let ctrl_end = ctrl_start.checked_add(mem::size_of::<Self>())?;
        let block_start = align_up(ctrl_end, ALIGNMENT);

        let used_prefix = block_start.checked_sub(base)?;
        let avail = len.checked_sub(used_prefix)?;
        let pool_size = align_down(avail, Self::MBS);

        // A region spanning more than u32::MAX bytes from block_start can't
        // be addressed by the compact offset links.
        if pool_size >= NONE_OFFSET as usize {
            return None;
        }
        if pool_size < Self::HEADER_LEN + Self::MBS {
            return None;
        }

        unsafe {
            let self_ptr = ctrl_start as *mut Self;
            self_ptr.write(Self {
                bitmap: 0,
                heads: [NONE_OFFSET; mapping::NUM_CLASSES],
                block_start,
                pool_size,
                _phantom: PhantomData,
            });
            let this = &mut *self_ptr;
            this.clear(false);
            Some(this)
        }
    }

    /// Re-initialize all free-list/bitmap metadata to a single block
    /// spanning the whole pool (see [`crate::general::GeneralTlsf::clear`]
    /// for the `initial_block_allocated` contract, shared verbatim here).
    pub fn clear(&mut self, initial_block_allocated: bool) {
        self.bitmap = 0;
        self.heads = [NONE_OFFSET; mapping::NUM_CLASSES];

        unsafe {
            let mut blk: NonNull<FreeBlockHdr> =
                NonNull::new_unchecked(self.block_start as *mut FreeBlockHdr);
            blk.as_mut().common.size = (self.pool_size - Self::HEADER_LEN) | LAST_BIT;

            if initial_block_allocated {
                blk.as_mut().common.mark_used();
            } else {
                self.insert_block(blk);
            }
        }
    }

    /// Attempt to allocate `size` bytes, same contract as
    /// [`crate::general::GeneralTlsf::allocate`]. Every freed block is
    /// indexed immediately by [`Self::free`]/[`Self::free_range`], so it is
    /// visible to this search right away; what deferred coalescing costs is
    /// fragmentation, not discoverability — a freed block won't merge with
    /// its physical neighbors until [`Self::aggregate`] runs, so a request
    /// bigger than any single still-unmerged block can fail even when the
    /// pool has enough free bytes in aggregate (spec §4.6).
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        let aligned = align_up(align_up(size, ALIGNMENT), Self::MBS).max(Self::MBS);
        let class = self.search_suitable_free_list(aligned)?;

        let block = self.ptr_at_offset(self.heads[class]).unwrap();
        unsafe { self.remove_block(Some(block), class) };

        let block_size = unsafe { block.as_ref().common.get_size() };
        debug_assert!(block_size >= aligned);

        if block_size - aligned >= Self::MBS + Self::HEADER_LEN {
            let remainder = unsafe { self.split_block(block, aligned) };
            unsafe { self.insert_block(remainder) };
        }

        let payload =
            unsafe { NonNull::new_unchecked((block.as_ptr() as *mut u8).add(Self::HEADER_LEN)) };
        debug_assert_eq!(payload.as_ptr() as usize % ALIGNMENT, 0);
        Some(payload)
    }

    /// Re-insert a single allocation into its free list without checking its
    /// physical neighbors for coalescing — the compact header has no
    /// `prev_phys`, so only [`Self::aggregate`] can find and merge adjacent
    /// free runs (spec §4.5, "Region-optimized deallocation").
    ///
    /// # Safety
    ///
    /// `addr`, if present, must denote a live allocation made by `self`.
    pub unsafe fn free(&mut self, addr: Option<NonNull<u8>>) {
        let Some(addr) = addr else { return };
        let block: NonNull<FreeBlockHdr> =
            NonNull::new_unchecked(addr.as_ptr().sub(Self::HEADER_LEN)).cast();
        debug_assert!(!block.as_ref().common.is_free(), "double free");
        self.insert_block(block);
    }

    /// Release `[addr, addr + len)`, a sub-range of a single pre-existing
    /// block `b` (which may itself be free or allocated), splitting off a
    /// used prefix and/or suffix as needed (spec §4.6). If the range is not
    /// entirely contained in the one block reachable from `addr`, this is a
    /// no-op — a caller-contract violation, not an error to report (spec
    /// §4.9, "a `free_range` whose endpoints straddle two distinct blocks").
    ///
    /// # Safety
    ///
    /// `addr` must point at a block header boundary reachable from
    /// `self.block_start` by repeated `header_len + size` strides.
    pub unsafe fn free_range(&mut self, addr: NonNull<u8>, len: usize) {
        if len == 0 {
            return;
        }
        let range_start = addr.as_ptr() as usize - Self::HEADER_LEN;
        let range_end = range_start + Self::HEADER_LEN + len;

        let blk = self.block_containing(range_start);
        let blk_start = blk.as_ptr() as usize;
        let blk_size = blk.as_ref().common.get_size();
        let was_last = blk.as_ref().common.is_last();
        let blk_end = blk_start + Self::HEADER_LEN + blk_size;

        // The range must fall entirely within this one physical block;
        // otherwise the caller has violated the contract and we do nothing.
        if range_end > blk_end {
            return;
        }

        if range_start > blk_start && range_end < blk_end {
            // Interior: split twice, insert only the middle fragment. Both
            // new fragments must meet the minimum block size before either
            // split runs, so a too-small request is a clean no-op rather
            // than a partially-applied split (spec §9, open question (b) —
            // the source never guards this at all).
            let left_size = range_start - blk_start - Self::HEADER_LEN;
            let middle_size = range_end - range_start - Self::HEADER_LEN;
            let right_size = blk_end - range_end - Self::HEADER_LEN;
            if middle_size < Self::MBS || right_size < Self::MBS {
                return;
            }
            let middle = self.split_block_raw(blk, left_size, was_last);
            let _right = self.split_block_raw(middle, middle_size, was_last);
            self.insert_block(middle);
        } else if range_start == blk_start && range_end == blk_end {
            // Entire block.
            self.insert_block(blk);
        } else if range_end == blk_end {
            // Touches the end: left stays as-is, right is freed.
            let left_size = range_start - blk_start - Self::HEADER_LEN;
            let right_size = blk_size - left_size - Self::HEADER_LEN;
            if right_size < Self::MBS {
                return;
            }
            let right = self.split_block_raw(blk, left_size, was_last);
            self.insert_block(right);
        } else if range_start == blk_start {
            // Touches the start: left is freed, right stays as-is.
            let left_size = range_end - blk_start - Self::HEADER_LEN;
            let right_size = blk_size - left_size - Self::HEADER_LEN;
            if right_size < Self::MBS {
                return;
            }
            let _right = self.split_block_raw(blk, left_size, was_last);
            self.insert_block(blk);
        }
        // Otherwise the range doesn't touch either border and isn't interior
        // either — unreachable given the `range_end > blk_end` check above.
    }

    /// Walk the whole pool once, merging every run of adjacent free blocks
    /// and rebuilding the segregated free lists from scratch (spec §4.6:
    /// the other half of deferred coalescing — the half that does the
    /// work `free`/`free_range` postponed). O(n) in the number of
    /// physical blocks.
    pub fn aggregate(&mut self) {
        self.bitmap = 0;
        self.heads = [NONE_OFFSET; mapping::NUM_CLASSES];

        let mut addr = self.block_start;
        let mut pending: Option<NonNull<FreeBlockHdr>> = None;

        loop {
            let mut blk: NonNull<FreeBlockHdr> =
                unsafe { NonNull::new_unchecked(addr as *mut FreeBlockHdr) };
            let is_last = unsafe { blk.as_ref().common.is_last() };
            let size = unsafe { blk.as_ref().common.get_size() };
            let next_addr = addr + Self::HEADER_LEN + size;
            let is_free = unsafe { blk.as_ref().common.is_free() };

            if is_free {
                match pending {
                    Some(mut run) => unsafe {
                        let run_size = run.as_ref().common.get_size();
                        let new_size = run_size + Self::HEADER_LEN + size;
                        run.as_mut().common.size = new_size | FREE_BIT | if is_last { LAST_BIT } else { 0 };
                    },
                    None => pending = Some(blk),
                }
            } else if let Some(run) = pending.take() {
                unsafe { self.insert_block(run) };
            }

            if is_last {
                break;
            }
            addr = next_addr;
        }

        if let Some(run) = pending.take() {
            unsafe { self.insert_block(run) };
        }
    }

    /// The payload size of the block whose header precedes `addr`.
    ///
    /// # Safety
    ///
    /// `addr` must be a payload address previously returned by
    /// [`Self::allocate`] on this allocator.
    pub unsafe fn get_allocated_size(&self, addr: NonNull<u8>) -> usize {
        let block: NonNull<BlockHdr> =
            NonNull::new_unchecked(addr.as_ptr().sub(Self::HEADER_LEN)).cast();
        block.as_ref().get_size()
    }

    /// Locate the block whose `[header, header + header_len + size)` range
    /// contains `addr`, by a linear physical walk from `block_start`. O(n);
    /// the price paid for not keeping a `prev_phys` link (spec §4.8).
    unsafe fn block_containing(&self, addr: usize) -> NonNull<FreeBlockHdr> {
        let mut cur = self.block_start;
        loop {
            let blk: NonNull<FreeBlockHdr> = NonNull::new_unchecked(cur as *mut FreeBlockHdr);
            let size = blk.as_ref().common.get_size();
            let end = cur + Self::HEADER_LEN + size;
            if addr < end || blk.as_ref().common.is_last() {
                return blk;
            }
            cur = end;
        }
    }

    fn search_suitable_free_list(&self, min_size: usize) -> Option<usize> {
        let target = mapping::search_target(min_size);
        let class = mapping::map(target.max(Self::MBS));
        if class >= mapping::NUM_CLASSES {
            return None;
        }
        let found = self.bitmap.bit_scan_forward(class as u32);
        if (found as usize) < mapping::NUM_CLASSES {
            Some(found as usize)
        } else {
            None
        }
    }

    #[inline]
    fn offset_of(&self, ptr: NonNull<FreeBlockHdr>) -> u32 {
        (ptr.as_ptr() as usize - self.block_start) as u32
    }

    #[inline]
    fn ptr_at_offset(&self, off: u32) -> Option<NonNull<FreeBlockHdr>> {
        if off == NONE_OFFSET {
            None
        } else {
            Some(unsafe {
                NonNull::new_unchecked((self.block_start + off as usize) as *mut FreeBlockHdr)
            })
        }
    }

    /// # Safety
    ///
    /// `blk` must be owned by `self` and not already linked into any free list.
    unsafe fn insert_block(&mut self, mut blk: NonNull<FreeBlockHdr>) {
        let size = blk.as_ref().common.get_size();
        let class = mapping::map(size.max(Self::MBS));

        let head = self.heads[class];
        blk.as_mut().next_free = head;
        blk.as_mut().prev_free = NONE_OFFSET;
        if let Some(mut head) = self.ptr_at_offset(head) {
            head.as_mut().prev_free = self.offset_of(blk);
        }
        self.heads[class] = self.offset_of(blk);
        blk.as_mut().common.mark_free();
        self.bitmap.set_bit(class as u32);
    }

    /// # Safety
    ///
    /// If `blk` is `None`, class `class` must be non-empty. If `Some`, `blk`
    /// must currently be a member of class `class`.
    unsafe fn remove_block(
        &mut self,
        blk: Option<NonNull<FreeBlockHdr>>,
        class: usize,
    ) -> NonNull<FreeBlockHdr> {
        let target = blk.unwrap_or_else(|| self.ptr_at_offset(self.heads[class]).unwrap_unchecked());

        let next = target.as_ref().next_free;
        let prev = target.as_ref().prev_free;

        if let Some(mut next) = self.ptr_at_offset(next) {
            next.as_mut().prev_free = prev;
        }
        if let Some(mut prev) = self.ptr_at_offset(prev) {
            prev.as_mut().next_free = next;
        } else {
            self.heads[class] = next;
            if next == NONE_OFFSET {
                self.bitmap.clear_bit(class as u32);
            }
        }

        let mut target = target;
        target.as_mut().common.mark_used();
        target
    }

    /// # Safety
    ///
    /// `blk` must not be free, `new_size` must be a multiple of
    /// [`Self::MBS`], and `blk`'s payload must exceed `new_size` by at
    /// least `Self::MBS + Self::HEADER_LEN` bytes.
    unsafe fn split_block(
        &mut self,
        blk: NonNull<FreeBlockHdr>,
        new_size: usize,
    ) -> NonNull<FreeBlockHdr> {
        let was_last = blk.as_ref().common.is_last();
        self.split_block_raw(blk, new_size, was_last)
    }

    /// Shrink `blk` to `new_size` bytes of payload and return the remainder
    /// block, tagging it LAST if `inherit_last` is set (the caller decides,
    /// since [`Self::free_range`] sometimes wants the *front* half to
    /// remain unsplit-last when it's splitting off a used prefix instead of
    /// a used suffix).
    unsafe fn split_block_raw(
        &mut self,
        mut blk: NonNull<FreeBlockHdr>,
        new_size: usize,
        inherit_last: bool,
    ) -> NonNull<FreeBlockHdr> {
        let old_size = blk.as_ref().common.get_size();
        let remainder_size = old_size - Self::HEADER_LEN - new_size;
        debug_assert!(remainder_size >= Self::MBS);

        let was_free = blk.as_ref().common.is_free();
        blk.as_mut().common.size = new_size | if was_free { FREE_BIT } else { 0 };

        let remainder_ptr = (blk.as_ptr() as *mut u8).add(Self::HEADER_LEN + new_size);
        let mut remainder: NonNull<FreeBlockHdr> =
            NonNull::new_unchecked(remainder_ptr as *mut FreeBlockHdr);
        remainder.as_mut().common.size =
            remainder_size | if was_free { FREE_BIT } else { 0 } | if inherit_last { LAST_BIT } else { 0 };

        remainder
    }

    #[cfg(any(test, feature = "introspection"))]
    pub(crate) fn block_start(&self) -> usize {
        self.block_start
    }

    #[cfg(any(test, feature = "introspection"))]
    pub(crate) fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Walk free-list `class` head-to-tail, yielding each member's header
    /// address — the equivalent of `TLSF::print_free_lists` for one class
    /// (spec §4.10).
    #[cfg(any(test, feature = "introspection"))]
    pub fn free_list(&self, class: usize) -> impl Iterator<Item = usize> + '_ {
        let mut cur = self.heads[class];
        core::iter::from_fn(move || {
            let blk = self.ptr_at_offset(cur)?;
            cur = unsafe { blk.as_ref().next_free };
            Some(blk.as_ptr() as usize)
        })
    }

    /// The set flat-class bitmap positions, low to high.
    #[cfg(any(test, feature = "introspection"))]
    pub fn bitmap_bits(&self) -> crate::debug::BitmapBits<u64> {
        crate::debug::BitmapBits::new(self.bitmap)
    }

    #[cfg(any(test, feature = "introspection"))]
    unsafe fn block_at(addr: usize) -> crate::debug::BlockInfo {
        let blk: NonNull<BlockHdr> = NonNull::new_unchecked(addr as *mut BlockHdr);
        crate::debug::BlockInfo {
            address: addr,
            header_len: Self::HEADER_LEN,
            payload_size: blk.as_ref().get_size(),
            is_free: blk.as_ref().is_free(),
            is_last: blk.as_ref().is_last(),
        }
    }

    /// Walk every physical block in address order (spec §4.10). Test-only,
    /// same rationale as `GeneralTlsf::physical_blocks`.
    #[cfg(test)]
    pub fn physical_blocks(&self) -> std::vec::Vec<crate::debug::BlockInfo> {
        let mut out = std::vec::Vec::new();
        let mut addr = self.block_start;
        loop {
            let info = unsafe { Self::block_at(addr) };
            let is_last = info.is_last;
            let end = info.end();
            out.push(info);
            if is_last {
                break;
            }
            addr = end;
        }
        out
    }
}
