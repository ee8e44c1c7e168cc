use std::mem::MaybeUninit;

use quickcheck_macros::quickcheck;

use super::*;
use crate::test_util::ShadowAllocator;

fn new_region(len: usize) -> Box<[MaybeUninit<u8>]> {
    vec![MaybeUninit::new(0); len].into_boxed_slice()
}

/// Bytes the embedded control structure (the `FL=32, SL=32` free-list head
/// array dwarfs the per-block header) needs before any pool bytes are
/// available at all. The spec's scenario pool sizes (e.g. "a 640-byte
/// pool") describe the *block area*, not the total region — every region
/// built for a scenario test must add this on top.
fn ctrl_overhead() -> usize {
    core::mem::size_of::<GeneralTlsf32>() + core::mem::align_of::<GeneralTlsf32>()
}

/// A region sized to hold the control structure plus `pool_bytes` worth of
/// block area.
fn new_region_with_pool(pool_bytes: usize) -> Box<[MaybeUninit<u8>]> {
    new_region(ctrl_overhead() + pool_bytes)
}

#[test]
fn construct_rejects_undersized_region() {
    let mut region = new_region(4);
    assert!(GeneralTlsf32::construct(&mut region).is_none());
}

#[test]
fn pool_sized_to_fit_exactly_one_block() {
    // Big enough for the control structure, the header, and exactly one
    // minimum-size block, and not a byte more.
    let exact = ctrl_overhead() + GeneralTlsf32::HEADER_LEN + GeneralTlsf32::MBS;
    let mut region = new_region(exact);
    let tlsf = GeneralTlsf32::construct(&mut region).expect("region should be just big enough");

    let a = tlsf.allocate(GeneralTlsf32::MBS).expect("sole block should be allocatable");
    assert!(tlsf.allocate(1).is_none(), "pool had exactly one block's worth of room");
    unsafe { tlsf.free(Some(a)) };
}

#[test]
fn small_pool_first_allocations_succeed() {
    let mut region = new_region_with_pool(640);
    let tlsf = GeneralTlsf32::construct(&mut region).unwrap();

    let mut ptrs = Vec::new();
    for _ in 0..3 {
        ptrs.push(tlsf.allocate(1).expect("small pool should fit at least 3 minimal blocks"));
    }
    // A 4th allocation may or may not fit depending on exact overhead; either
    // outcome is acceptable, but it must not panic or corrupt state.
    let _ = tlsf.allocate(1);

    for p in ptrs {
        unsafe { tlsf.free(Some(p)) };
    }
}

#[test]
fn freeing_alternating_blocks_does_not_coalesce_across_used_neighbors() {
    let mut region = new_region_with_pool(4096);
    let tlsf = GeneralTlsf32::construct(&mut region).unwrap();

    let a = tlsf.allocate(64).unwrap();
    let b = tlsf.allocate(64).unwrap();
    let c = tlsf.allocate(64).unwrap();
    let d = tlsf.allocate(64).unwrap();

    unsafe {
        tlsf.free(Some(a));
        tlsf.free(Some(c));
    }

    // b and d are still allocated and untouched; re-deriving their sizes
    // must still report what was requested (rounded up to MBS).
    unsafe {
        assert!(tlsf.get_allocated_size(b) >= 64);
        assert!(tlsf.get_allocated_size(d) >= 64);
    }

    unsafe {
        tlsf.free(Some(b));
        tlsf.free(Some(d));
    }
}

#[test]
fn freeing_everything_collapses_to_a_single_last_block() {
    let mut region = new_region_with_pool(8192);
    let tlsf = GeneralTlsf32::construct(&mut region).unwrap();

    let mut ptrs = Vec::new();
    loop {
        match tlsf.allocate(48) {
            Some(p) => ptrs.push(p),
            None => break,
        }
    }
    assert!(!ptrs.is_empty());

    for p in ptrs.drain(..).rev() {
        unsafe { tlsf.free(Some(p)) };
    }

    // After coalescing everything back, a fresh allocation covering most of
    // the pool should succeed again.
    assert!(tlsf.allocate(4096).is_some());
}

#[test]
fn free_of_none_is_a_no_op() {
    let mut region = new_region_with_pool(512);
    let tlsf = GeneralTlsf32::construct(&mut region).unwrap();
    unsafe { tlsf.free(None) };
    assert!(tlsf.allocate(16).is_some());
}

#[test]
fn physical_walk_boundaries_are_contiguous_and_terminate_in_last() {
    let mut region = new_region_with_pool(2048);
    let tlsf = GeneralTlsf32::construct(&mut region).unwrap();

    let a = tlsf.allocate(40).unwrap();
    let _b = tlsf.allocate(40).unwrap();
    unsafe { tlsf.free(Some(a)) };

    let blocks = tlsf.physical_blocks();
    assert!(!blocks.is_empty());
    assert!(blocks.last().unwrap().is_last);
    assert!(blocks[..blocks.len() - 1].iter().all(|b| !b.is_last));

    for pair in blocks.windows(2) {
        assert_eq!(pair[0].end(), pair[1].address, "blocks must tile the pool with no gaps");
    }
}

#[test]
fn physical_walk_matches_shadow_allocator_after_splits_and_coalesces() {
    // Spec §8 scenario 8: after a sequence of splits and coalesces, the
    // debug physical-walk iterator's free/used classification must agree
    // exactly with an independently maintained shadow model.
    let mut region = new_region_with_pool(4096);
    let tlsf = GeneralTlsf32::construct(&mut region).unwrap();
    let mut sa = ShadowAllocator::new();
    let base = tlsf.block_start() + GeneralTlsf32::HEADER_LEN;
    sa.insert_free_block(base..base + (tlsf.pool_size() - GeneralTlsf32::HEADER_LEN));

    let a = tlsf.allocate(64).unwrap();
    sa.mark_used(a.as_ptr() as usize..a.as_ptr() as usize + unsafe { tlsf.get_allocated_size(a) });
    let b = tlsf.allocate(96).unwrap();
    sa.mark_used(b.as_ptr() as usize..b.as_ptr() as usize + unsafe { tlsf.get_allocated_size(b) });
    let c = tlsf.allocate(32).unwrap();
    sa.mark_used(c.as_ptr() as usize..c.as_ptr() as usize + unsafe { tlsf.get_allocated_size(c) });

    unsafe {
        sa.deallocate(a.as_ptr() as usize, tlsf.get_allocated_size(a));
        tlsf.free(Some(a));
        sa.deallocate(b.as_ptr() as usize, tlsf.get_allocated_size(b));
        tlsf.free(Some(b));
    }
    // `a` and `b` are physical neighbors: freeing both coalesces them into
    // one run, which the shadow model reflects as a single free range too.

    let d = tlsf.allocate(16).unwrap();
    sa.mark_used(d.as_ptr() as usize..d.as_ptr() as usize + unsafe { tlsf.get_allocated_size(d) });

    for block in tlsf.physical_blocks() {
        let payload_range = (block.address + block.header_len)..block.end();
        if block.is_free {
            assert!(
                !sa.any_used_overlap(payload_range.clone()),
                "engine reports {payload_range:?} free but shadow model has used bytes in it"
            );
        } else {
            assert!(
                sa.any_used_overlap(payload_range.clone()),
                "engine reports {payload_range:?} used but shadow model has no used bytes in it"
            );
        }
    }

    let live_bytes = unsafe { tlsf.get_allocated_size(c) + tlsf.get_allocated_size(d) };
    assert_eq!(sa.used_bytes(), live_bytes, "shadow model's used-byte total must match the two still-live allocations");
}

#[test]
fn absurdly_large_request_returns_null_without_corrupting_state() {
    // Spec §8 scenario 6: a request whose target size-class mapping would
    // overflow `FLLEN` must fail cleanly, not panic or desync the bitmaps.
    let mut region = new_region(10 * 1024 * 1024);
    let tlsf = GeneralTlsf32::construct(&mut region).unwrap();

    assert!(tlsf.allocate(3_000_000_000_000).is_none());

    let a = tlsf.allocate(128).expect("allocator must still be usable afterwards");
    unsafe { tlsf.free(Some(a)) };
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Alloc(usize),
    Free(usize),
}

impl quickcheck::Arbitrary for Op {
    fn arbitrary(g: &mut quickcheck::Gen) -> Self {
        if bool::arbitrary(g) {
            Op::Alloc(usize::arbitrary(g) % 256 + 1)
        } else {
            Op::Free(usize::arbitrary(g) % 16)
        }
    }
}

#[quickcheck]
fn random_alloc_free_trace_matches_shadow_allocator(ops: Vec<Op>) -> bool {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut region = new_region(1 << 16);
    let tlsf = match GeneralTlsf32::construct(&mut region) {
        Some(t) => t,
        None => return true,
    };
    let mut sa = ShadowAllocator::new();
    let base = tlsf.block_start() + GeneralTlsf32::HEADER_LEN;
    sa.insert_free_block(base..base + (tlsf.pool_size() - GeneralTlsf32::HEADER_LEN));

    let mut live: Vec<(NonNull<u8>, usize)> = Vec::new();

    for op in ops {
        match op {
            Op::Alloc(size) => {
                let got = tlsf.allocate(size);
                match got {
                    Some(p) => {
                        let actual = unsafe { tlsf.get_allocated_size(p) };
                        sa.allocate(actual);
                        live.push((p, actual));
                    }
                    None => {
                        // The shadow allocator is not required to agree
                        // exactly on exhaustion (it doesn't model splitting
                        // overhead precisely), only to never claim success
                        // where the real allocator is structurally unable
                        // to comply (handled implicitly by never desyncing
                        // on a `Some`).
                    }
                }
            }
            Op::Free(idx) => {
                if live.is_empty() {
                    continue;
                }
                let (p, size) = live.remove(idx % live.len());
                let addr = p.as_ptr() as usize;
                sa.deallocate(addr, size);
                unsafe { tlsf.free(Some(p)) };
            }
        }
    }

    for (p, size) in live {
        unsafe { tlsf.free(Some(p)) };
        let _ = size;
    }

    true
}
