//! The general-configuration TLSF engine: classic `FL × SL` segregated free
//! lists with immediate boundary-tag coalescing on every `free`. Grounded in
//! `yvt-rlsf/src/tlsf.rs` for the free-list/bitmap bookkeeping and in
//! `examples/original_source/src/TLSF.cpp`'s `TLSF` class for the public
//! operation names (`clear`, `find_block`, `coalesce_blocks`).
#![allow(clippy::needless_lifetimes)]

use core::{marker::PhantomData, mem, ptr::NonNull};

use crate::{
    int::{align_down, align_up, BinInteger},
    mapping::general as mapping,
};

/// Payload alignment. Every address `allocate` returns is a multiple of this.
pub const ALIGNMENT: usize = 8;

const FREE_BIT: usize = 1;
const LAST_BIT: usize = 1 << 1;
const SIZE_MASK: usize = !(FREE_BIT | LAST_BIT);

/// The part of a block header present regardless of free/used state:
/// the flagged size, and (general configuration only) a link to the
/// physically preceding block.
#[derive(Debug)]
struct BlockHdr {
    /// Payload byte count, with `FREE_BIT`/`LAST_BIT` packed into the low
    /// two bits (spec §3).
    size: usize,
    /// The physically preceding block, or `None` if this block starts at
    /// `block_start`. Absent entirely in the region-optimized configuration
    /// (see `crate::region`), which is why this field lives on the general
    /// engine's header and not in a type shared between the two.
    prev_phys: Option<NonNull<BlockHdr>>,
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

/// Header of a free block: the common header plus the intrusive free-list
/// links. These two fields occupy what is payload space once the block is
/// handed out (spec §3, "Header length is the offset to `next_free`").
#[repr(C)]
#[derive(Debug)]
struct FreeBlockHdr {
    common: BlockHdr,
    next_free: Option<NonNull<FreeBlockHdr>>,
    prev_free: Option<NonNull<FreeBlockHdr>>,
}

/// Header of a used block: exactly the common header, nothing more. Its
/// size is `HEADER_LEN`.
#[repr(C)]
#[derive(Debug)]
struct UsedBlockHdr {
    common: BlockHdr,
}

#[cfg_attr(doc, svgbobdoc::transform)]
/// The general (classic TLSF) allocator engine.
///
/// # Data Structure Overview
///
/// <center>
/// ```svgbob
///   First level
///                                                                       FLLEN = 8
///                               ,-----+-----+-----+-----+-----+-----+-----+-----,
///         fl_bitmap: FLBitmap = |  0  |  0  |  0  |  1  |  0  |  0  |  0  |  0  |
///                               +-----+-----+-----+-----+-----+-----+-----+-----+
///                      min size | 2¹¹ | 2¹⁰ |  2⁹ |  2⁸ |  2⁷ |  2⁶ |  2⁵ |  2⁴ |
///                               '-----+-----+-----+--+--+-----+-----+-----+-----'
///                                                    |
/// ╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶|╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶
///   Second level                                     |
///                                                    v                      SLLEN = 8
///                                  ,-----+-----+-----+-----+-----+-----+-----+-----,
///        "sl_bitmap[4]: SLBitmap"= |  0  |  0  |  1  |  0  |  0  |  0  |  0  |  0  |
///                                  +-----+-----+-----+-----+-----+-----+-----+-----+
///                          heads[4]| ... |  O  | ... |
///                                  '-----+--|--+-----'
///                                          |
///             ,----------------------------'
///             | ,---+---+-------,    ,---+---+-------,
///             '-+>O | O-+-------+----+>O |   |       |
///               +---+---'       |    +---+---'       |
///               '---------------'    '---------------'
/// ```
/// </center>
///
/// Segregated free lists are indexed by a first-level class `fl` (a power-of-two
/// size range) and a second-level class `sl` (a linear subdivision of that
/// range into `SLLEN` parts). `FLBitmap`/`SLBitmap` are the unsigned integer
/// types backing the presence bitmaps — pick a type wide enough to hold
/// `FLLEN`/`SLLEN` bits respectively (spec §2a: this is the crate's only
/// "configuration", expressed at the type level).
///
/// The control structure (this struct) is embedded at the base of the
/// caller-supplied region (spec §4.7, §9 "Control block embedded at region
/// base"); [`GeneralTlsf::construct`] places it there and returns a
/// `'pool`-scoped reference into the caller's own memory.
#[derive(Debug)]
pub struct GeneralTlsf<'pool, FLBitmap, SLBitmap, const FLLEN: usize, const SLLEN: usize> {
    fl_bitmap: FLBitmap,
    sl_bitmap: [SLBitmap; FLLEN],
    heads: [[Option<NonNull<FreeBlockHdr>>; SLLEN]; FLLEN],
    block_start: usize,
    pool_size: usize,
    _phantom: PhantomData<&'pool mut ()>,
}

// Safety: every pointer reachable from a `GeneralTlsf` points into memory
// logically owned by that instance, and the header types carry no interior
// mutability, so moving/sharing the control structure across threads is as
// safe as moving/sharing the region itself (which is the caller's call).
unsafe impl<FLBitmap, SLBitmap, const FLLEN: usize, const SLLEN: usize> Send
    for GeneralTlsf<'_, FLBitmap, SLBitmap, FLLEN, SLLEN>
{
}
unsafe impl<FLBitmap, SLBitmap, const FLLEN: usize, const SLLEN: usize> Sync
    for GeneralTlsf<'_, FLBitmap, SLBitmap, FLLEN, SLLEN>
{
}

/// A general allocator with `FL=32, SL=32` (spec §6), the concrete
/// "General" configuration.
pub type GeneralTlsf32<'pool> = GeneralTlsf<'pool, u32, u32, 32, 32>;

// FIXME: `panic!` in a const context needs a newer MSRV than this crate
// targets; this diverges (infinite loop after a division by zero) the same
// way `yvt-rlsf` works around the same limitation.
macro_rules! const_panic {
    ($($tt:tt)*) => {{
        #[allow(unconditional_panic)]
        let _ = 1 / 0;
        loop {}
    }};
}

impl<'pool, FLBitmap: BinInteger, SLBitmap: BinInteger, const FLLEN: usize, const SLLEN: usize>
    GeneralTlsf<'pool, FLBitmap, SLBitmap, FLLEN, SLLEN>
{
    /// The minimum block size (MBS): every block's payload is at least this
    /// many bytes and a multiple of it (spec §6, fixed at 32 for the general
    /// configuration regardless of target pointer width).
    pub const MBS: usize = 32;

    /// `log2(SLLEN)`.
    const SL_BITS: u32 = if SLLEN.is_power_of_two() {
        SLLEN.trailing_zeros()
    } else {
        const_panic!("SLLEN must be a power of two")
    };

    const VALID: () = {
        if FLLEN == 0 {
            const_panic!("FLLEN must not be zero");
        }
        if SLLEN == 0 {
            const_panic!("SLLEN must not be zero");
        }
        if (FLBitmap::BITS as u128) < FLLEN as u128 {
            const_panic!("FLBitmap must contain at least FLLEN bits");
        }
        if (SLBitmap::BITS as u128) < SLLEN as u128 {
            const_panic!("SLBitmap must contain at least SLLEN bits");
        }
    };

    /// The byte offset from a block's header to its payload: `size_of::<usize>()
    /// + size_of::<Option<NonNull<BlockHdr>>>()` (spec §6: "sizeof(full header
    /// including prev_phys)").
    pub const HEADER_LEN: usize = mem::size_of::<UsedBlockHdr>();

    /// Construct a new allocator over `region`, embedding the control
    /// structure at (an alignment-rounded) `region`'s base and returning a
    /// `'pool`-scoped handle into the rest.
    ///
    /// Returns `None` if `region` is too small to hold both the control
    /// structure and at least one minimum-size block (spec §2b/§7: this is
    /// the one fallible constructor path in the crate).
    pub fn construct(region: &'pool mut [mem::MaybeUninit<u8>]) -> Option<&'pool mut Self> {
        let () = Self::VALID;

        let base = region.as_mut_ptr() as usize;
        let len = region.len();

        let ctrl_align = mem::align_of::<Self>().max(ALIGNMENT);
        let ctrl_start = align_up(base, ctrl_align);
        let ctrl_end = ctrl_start.checked_add(mem::size_of::<Self>())?;
        let block_start = align_up(ctrl_end, ALIGNMENT);

        let used_prefix = block_start.checked_sub(base)?;
        let avail = len.checked_sub(used_prefix)?;
        let pool_size = align_down(avail, Self::MBS);

        if pool_size < Self::HEADER_LEN + Self::MBS {
            return None;
        }

        unsafe {
            let self_ptr = ctrl_start as *mut Self;
            self_ptr.write(Self {
                fl_bitmap: FLBitmap::ZERO,
                sl_bitmap: [SLBitmap::ZERO; FLLEN],
                heads: [[None; SLLEN]; FLLEN],
                block_start,
                pool_size,
                _phantom: PhantomData,
            });
            let this = &mut *self_ptr;
            this.clear(false);
            Some(this)
        }
    }

    /// Re-initialize all free-list/bitmap metadata, discarding every
    /// outstanding allocation's bookkeeping (but not the pool memory itself).
    ///
    /// If `initial_block_allocated` is `true`, the single block covering the
    /// whole pool is left marked used but outside every free list — reachable
    /// only by a physical walk (spec §9, open question (a): this literal,
    /// otherwise-inconvenient behavior is preserved on purpose, for a caller
    /// that wants to reinitialize metadata without disturbing pointers it
    /// already handed out against the old layout).
    pub fn clear(&mut self, initial_block_allocated: bool) {
        self.fl_bitmap = FLBitmap::ZERO;
        self.sl_bitmap = [SLBitmap::ZERO; FLLEN];
        self.heads = [[None; SLLEN]; FLLEN];

        unsafe {
            let mut blk: NonNull<FreeBlockHdr> =
                NonNull::new_unchecked(self.block_start as *mut FreeBlockHdr);
            blk.as_mut().common.size = (self.pool_size - Self::HEADER_LEN) | LAST_BIT;
            blk.as_mut().common.prev_phys = None;

            if initial_block_allocated {
                blk.as_mut().common.mark_used();
            } else {
                self.insert_block(blk);
            }
        }
    }

    /// Attempt to allocate `size` bytes. Returns the 8-byte-aligned payload
    /// address on success, `None` on exhaustion (spec §4.4, §4.9).
    ///
    /// Completes in O(1): a constant number of bitmap probes plus at most one
    /// split.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        let aligned = align_up(align_up(size, ALIGNMENT), Self::MBS).max(Self::MBS);
        let (fl, sl) = self.search_suitable_free_list(aligned)?;

        // Safety: `search_suitable_free_list` only returns a class with a
        // non-null head.
        let block = unsafe { self.heads[fl][sl].unwrap_unchecked() };
        unsafe { self.remove_block(Some(block), fl, sl) };

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

    /// Release a previously allocated block back to the pool, immediately
    /// coalescing with free physical neighbors (spec §4.5).
    ///
    /// `addr` must either be `None` (a no-op, spec §7) or a payload address
    /// previously returned by [`Self::allocate`] on this allocator and not
    /// already freed.
    ///
    /// # Safety
    ///
    /// `addr`, if present, must denote a live allocation made by `self`.
    pub unsafe fn free(&mut self, addr: Option<NonNull<u8>>) {
        let Some(addr) = addr else { return };

        let block: NonNull<BlockHdr> =
            NonNull::new_unchecked((addr.as_ptr()).sub(Self::HEADER_LEN)).cast();
        debug_assert!(!block.as_ref().is_free(), "double free");

        let mut merged: NonNull<FreeBlockHdr> = block.cast();

        if let Some(prev) = block.as_ref().prev_phys {
            if prev.as_ref().is_free() {
                // `prev` is the linked side; `merged` (the block being freed)
                // is not on any free list yet.
                merged = self.coalesce_blocks(prev.cast(), merged, false);
            }
        }
        if let Some(next) = self.next_phys_block(merged.cast()) {
            if next.as_ref().is_free() {
                // `next` is the linked side here.
                merged = self.coalesce_blocks(merged, next.cast(), true);
            }
        }

        self.insert_block(merged);
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

    /// Search the bitmaps for the smallest non-empty class guaranteed to
    /// hold a block of at least `min_size` bytes (spec §4.4 step 2–4).
    fn search_suitable_free_list(&self, min_size: usize) -> Option<(usize, usize)> {
        let target = mapping::search_target(min_size, Self::SL_BITS);
        let (fl, sl) = mapping::map_floor(target, Self::SL_BITS);
        if fl as usize >= FLLEN {
            return None;
        }
        let mut fl = fl as usize;

        let sl = self.sl_bitmap[fl].bit_scan_forward(sl);
        if (sl as usize) < SLLEN {
            debug_assert!(self.sl_bitmap[fl].get_bit(sl));
            return Some((fl, sl as usize));
        }

        let next_fl = self.fl_bitmap.bit_scan_forward(fl as u32 + 1);
        if (next_fl as usize) >= FLLEN {
            return None;
        }
        fl = next_fl as usize;
        debug_assert!(self.fl_bitmap.get_bit(fl as u32));

        let sl = self.sl_bitmap[fl].trailing_zeros();
        debug_assert!((sl as usize) < SLLEN);
        debug_assert!(self.sl_bitmap[fl].get_bit(sl));
        Some((fl, sl as usize))
    }

    /// Link `blk` at the head of its size class, updating both bitmap levels.
    ///
    /// # Safety
    ///
    /// `blk` must be owned by `self` and not already present in any free list.
    unsafe fn insert_block(&mut self, mut blk: NonNull<FreeBlockHdr>) {
        let size = blk.as_ref().common.get_size();
        let (fl, sl) = mapping::map_floor(size, Self::SL_BITS);
        let (fl, sl) = (fl as usize, sl as usize);

        let head = self.heads[fl][sl];
        blk.as_mut().next_free = head;
        blk.as_mut().prev_free = None;
        if let Some(mut head) = head {
            head.as_mut().prev_free = Some(blk);
        }
        self.heads[fl][sl] = Some(blk);
        blk.as_mut().common.mark_free();

        self.fl_bitmap.set_bit(fl as u32);
        self.sl_bitmap[fl].set_bit(sl as u32);
    }

    /// Unlink a free block — `blk` if given, otherwise the head of class
    /// `(fl, sl)` — from its free list and mark it used.
    ///
    /// # Safety
    ///
    /// If `blk` is `None`, class `(fl, sl)` must be non-empty. If `blk` is
    /// `Some`, it must currently be a member of class `(fl, sl)`.
    unsafe fn remove_block(
        &mut self,
        blk: Option<NonNull<FreeBlockHdr>>,
        fl: usize,
        sl: usize,
    ) -> NonNull<FreeBlockHdr> {
        let mut target = blk.unwrap_or_else(|| self.heads[fl][sl].unwrap_unchecked());

        let next = target.as_ref().next_free;
        let prev = target.as_ref().prev_free;

        if let Some(mut next) = next {
            next.as_mut().prev_free = prev;
        }
        if let Some(mut prev) = prev {
            prev.as_mut().next_free = next;
        } else {
            debug_assert_eq!(self.heads[fl][sl], Some(target));
            self.heads[fl][sl] = next;
            if next.is_none() {
                self.sl_bitmap[fl].clear_bit(sl as u32);
                if self.sl_bitmap[fl] == SLBitmap::ZERO {
                    self.fl_bitmap.clear_bit(fl as u32);
                }
            }
        }

        target.as_mut().common.mark_used();
        target
    }

    /// Merge two physically adjacent free blocks (`a` immediately precedes
    /// `b`) into one, returning the combined block. Only one side is ever
    /// actually a member of a free list at the call sites in `free` — the
    /// block being freed is never linked anywhere yet — so `b_linked` says
    /// which side to unlink; the other is merely extended over in place.
    ///
    /// # Safety
    ///
    /// `a` and `b` must be free and physically adjacent, with `a` preceding
    /// `b`. Exactly one of them — `b` if `b_linked`, else `a` — must
    /// currently be a member of its free list; the other must not be linked
    /// anywhere (its `next_free`/`prev_free` are not read).
    unsafe fn coalesce_blocks(
        &mut self,
        a: NonNull<FreeBlockHdr>,
        b: NonNull<FreeBlockHdr>,
        b_linked: bool,
    ) -> NonNull<FreeBlockHdr> {
        if b_linked {
            let (fl, sl) = mapping::map_floor(b.as_ref().common.get_size(), Self::SL_BITS);
            self.remove_block(Some(b), fl as usize, sl as usize);
        } else {
            let (fl, sl) = mapping::map_floor(a.as_ref().common.get_size(), Self::SL_BITS);
            self.remove_block(Some(a), fl as usize, sl as usize);
        }

        let mut a = a;
        let b_size = b.as_ref().common.get_size();
        let last_flag = b.as_ref().common.size & LAST_BIT;
        let new_size = a.as_ref().common.get_size() + Self::HEADER_LEN + b_size;
        a.as_mut().common.size = new_size | last_flag;

        if let Some(mut next) = self.next_phys_block(a.cast()) {
            next.as_mut().prev_phys = Some(a.cast());
        }

        a
    }

    /// Shrink `blk` to exactly `new_size` bytes of payload and carve the
    /// remainder into a new block, inheriting `blk`'s LAST flag if it had
    /// one. The caller is responsible for inserting the remainder into a
    /// free list (spec §4.4 step 5).
    ///
    /// # Safety
    ///
    /// `blk` must not be free, `new_size` must be a multiple of
    /// [`Self::MBS`], and `blk`'s payload must exceed `new_size` by at least
    /// `Self::MBS + Self::HEADER_LEN` bytes.
    unsafe fn split_block(
        &mut self,
        mut blk: NonNull<FreeBlockHdr>,
        new_size: usize,
    ) -> NonNull<FreeBlockHdr> {
        let old_size = blk.as_ref().common.get_size();
        let was_last = blk.as_ref().common.is_last();
        let remainder_size = old_size - Self::HEADER_LEN - new_size;
        debug_assert!(remainder_size >= Self::MBS);

        blk.as_mut().common.size = new_size;

        let remainder_ptr = (blk.as_ptr() as *mut u8).add(Self::HEADER_LEN + new_size);
        let mut remainder: NonNull<FreeBlockHdr> =
            NonNull::new_unchecked(remainder_ptr as *mut FreeBlockHdr);
        remainder.as_mut().common.size = remainder_size | if was_last { LAST_BIT } else { 0 };
        remainder.as_mut().common.prev_phys = Some(blk.cast());

        if let Some(mut next) = self.next_phys_block(remainder.cast()) {
            next.as_mut().prev_phys = Some(remainder.cast());
        }

        remainder
    }

    /// The physically next block, or `None` if `blk` is last (spec §4.8:
    /// LAST is the one source of truth for where the pool ends).
    ///
    /// # Safety
    ///
    /// `blk` must be owned by `self` and its LAST flag must be accurate.
    unsafe fn next_phys_block(&self, blk: NonNull<BlockHdr>) -> Option<NonNull<BlockHdr>> {
        if blk.as_ref().is_last() {
            None
        } else {
            let addr = (blk.as_ptr() as *mut u8).add(Self::HEADER_LEN + blk.as_ref().get_size());
            Some(NonNull::new_unchecked(addr as *mut BlockHdr))
        }
    }

    /// The first block's address (`block_start`) — used by debug
    /// introspection and tests to start a physical walk.
    #[cfg(any(test, feature = "introspection"))]
    pub(crate) fn block_start(&self) -> usize {
        self.block_start
    }

    #[cfg(any(test, feature = "introspection"))]
    pub(crate) fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Walk free-list class `(fl, sl)` head-to-tail, yielding each member's
    /// header address — the equivalent of `TLSF::print_free_lists` for one
    /// class (spec §4.10).
    #[cfg(any(test, feature = "introspection"))]
    pub fn free_list(&self, fl: usize, sl: usize) -> impl Iterator<Item = usize> + '_ {
        let mut cur = self.heads[fl][sl];
        core::iter::from_fn(move || {
            let blk = cur?;
            cur = unsafe { blk.as_ref().next_free };
            Some(blk.as_ptr() as usize)
        })
    }

    /// The set first-level bitmap positions, low to high.
    #[cfg(any(test, feature = "introspection"))]
    pub fn fl_bitmap_bits(&self) -> crate::debug::BitmapBits<FLBitmap> {
        crate::debug::BitmapBits::new(self.fl_bitmap)
    }

    /// The set second-level bitmap positions for first-level class `fl`.
    #[cfg(any(test, feature = "introspection"))]
    pub fn sl_bitmap_bits(&self, fl: usize) -> crate::debug::BitmapBits<SLBitmap> {
        crate::debug::BitmapBits::new(self.sl_bitmap[fl])
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

    /// Walk every physical block in address order, from `block_start` to the
    /// block marked LAST (spec §4.10). Only available in test builds, which
    /// compile with `std` linked in (see the crate root's `cfg_attr`).
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

#[cfg(test)]
mod tests;
