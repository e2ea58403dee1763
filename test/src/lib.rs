//! Behavior tests for `fit_alloc`: literal end-to-end scenarios, boundary
//! behaviors, round-trip laws, and randomized workloads, instantiated for
//! every free-index variant.

extern crate fit_alloc;
extern crate memory_units;
extern crate quickcheck;
extern crate rand;
extern crate request_script;

use fit_alloc::{
    DiffVerdict, ExpectedBlock, FitAlloc, FreeIndex, InitError, RbDupTree, RbParentTree,
    RbStackTree, RbTopDownTree, SegregatedList, WORD_SIZE,
};
use memory_units::Bytes;
use quickcheck::{Arbitrary, Gen, QuickCheck};
use request_script::Region;
use std::cmp;
use std::ptr;
use std::slice;

const W: usize = WORD_SIZE;

fn with_heap<I, F>(bytes: usize, f: F)
where
    I: FreeIndex,
    F: FnOnce(&mut FitAlloc<I>),
{
    let mut region = Region::new(bytes);
    let size = Bytes(region.bytes());
    let mut heap = unsafe { FitAlloc::init(region.as_mut_ptr(), size).unwrap() };
    f(&mut heap);
}

fn intact(p: usize, n: usize, stamp: u8) -> bool {
    unsafe { slice::from_raw_parts(p as *const u8, n).iter().all(|b| *b == stamp) }
}

fn indexed_blocks<I: FreeIndex>(heap: &FitAlloc<I>) -> usize {
    let mut entries = 0;
    heap.index().walk(&mut |_| {
        entries += 1;
        true
    });
    entries
}

// ---------------------------------------------------------------------------
// Literal scenarios, boundaries, and laws, generic over the index variant.

fn fresh_init<I: FreeIndex>() {
    with_heap::<I, _>(8192, |heap| {
        assert_eq!(heap.capacity(), Bytes(8192 - 2 * W));
        assert_eq!(indexed_blocks(heap), 1);
        assert!(heap.validate());
    });
}

fn split_without_residual<I: FreeIndex>() {
    with_heap::<I, _>(8192, |heap| {
        let everything = heap.capacity().0;
        let p = heap.allocate(Bytes(everything));
        assert!(!p.is_null());
        assert_eq!(heap.capacity(), Bytes(0));
        assert_eq!(indexed_blocks(heap), 0);
        assert!(heap.validate());
    });
}

fn split_with_residual<I: FreeIndex>() {
    with_heap::<I, _>(8192, |heap| {
        let initial = heap.capacity().0;
        let p = heap.allocate(Bytes(64));
        assert!(!p.is_null());
        let rounded = FitAlloc::<I>::align(Bytes(64)).0;
        assert_eq!(heap.capacity().0, initial - rounded - W);
        assert_eq!(indexed_blocks(heap), 1);
        assert!(heap.validate());
    });
}

fn coalesce_both_sides<I: FreeIndex>() {
    with_heap::<I, _>(8192, |heap| {
        let p1 = heap.allocate(Bytes(64));
        let p2 = heap.allocate(Bytes(64));
        let p3 = heap.allocate(Bytes(64));
        assert!(!p1.is_null() && !p2.is_null() && !p3.is_null());
        // Pin the remainder behind an allocation so the merge under test is
        // exactly the three neighbors.
        let rest = heap.capacity().0;
        let p4 = heap.allocate(Bytes(rest));
        assert!(!p4.is_null());
        assert_eq!(heap.capacity(), Bytes(0));

        unsafe {
            heap.release(p1);
            heap.release(p3);
            heap.release(p2);
        }
        // Three payloads plus the two joined seams.
        assert_eq!(heap.capacity().0, 3 * 64 + 2 * W);
        assert_eq!(indexed_blocks(heap), 1);

        let expected = [
            ExpectedBlock {
                payload: Bytes(3 * 64 + 2 * W),
                allocated: false,
            },
            ExpectedBlock {
                payload: Bytes(rest),
                allocated: true,
            },
        ];
        let mut verdicts = [DiffVerdict::Ok; 2];
        assert!(heap.heap_diff(&expected, &mut verdicts));
        assert!(heap.validate());
    });
}

fn best_fit_prefers_the_snug_block<I: FreeIndex>() {
    with_heap::<I, _>(8192, |heap| {
        let _a = heap.allocate(Bytes(40));
        let b = heap.allocate(Bytes(200));
        let _c = heap.allocate(Bytes(40));
        let d = heap.allocate(Bytes(80));
        let _e = heap.allocate(Bytes(40));
        unsafe {
            heap.release(b);
            heap.release(d);
        }
        // 72 fits both holes; the 80-byte one is the better fit.
        let p = heap.allocate(Bytes(72));
        assert_eq!(p, d);
        assert!(heap.validate());
    });
}

fn allocate_zero_returns_null<I: FreeIndex>() {
    with_heap::<I, _>(8192, |heap| {
        let before = heap.capacity();
        assert!(heap.allocate(Bytes(0)).is_null());
        assert_eq!(heap.capacity(), before);
        assert!(heap.validate());
    });
}

fn exhaust_then_fail<I: FreeIndex>() {
    with_heap::<I, _>(8192, |heap| {
        let initial = heap.capacity().0;
        let p = heap.allocate(Bytes(initial));
        assert!(!p.is_null());
        assert_eq!(heap.capacity(), Bytes(0));
        assert!(heap.allocate(Bytes(8)).is_null());

        unsafe { heap.release(p) };
        assert_eq!(heap.capacity().0, initial);
        assert_eq!(indexed_blocks(heap), 1);
        assert!(heap.validate());
    });
}

fn allocate_release_round_trip<I: FreeIndex>() {
    with_heap::<I, _>(8192, |heap| {
        let before = heap.capacity();
        let p = heap.allocate(Bytes(200));
        assert!(!p.is_null());
        unsafe { heap.release(p) };
        assert_eq!(heap.capacity(), before);
        assert!(heap.validate());
    });
}

fn reallocate_same_size_is_identity<I: FreeIndex>() {
    with_heap::<I, _>(8192, |heap| {
        let p = heap.allocate(Bytes(96));
        assert!(!p.is_null());
        unsafe { ptr::write_bytes(p, 0x5a, 96) };

        let q = unsafe { heap.reallocate(p, Bytes(96)) };
        assert_eq!(q, p);
        assert!(intact(q as usize, 96, 0x5a));

        // Shrinking never moves either.
        let r = unsafe { heap.reallocate(p, Bytes(40)) };
        assert_eq!(r, p);
        assert!(intact(r as usize, 40, 0x5a));
        assert!(heap.validate());
    });
}

fn reallocate_shrinks_in_place<I: FreeIndex>() {
    with_heap::<I, _>(8192, |heap| {
        let p = heap.allocate(Bytes(512));
        let _guard = heap.allocate(Bytes(64));
        assert!(!p.is_null());

        let q = unsafe { heap.reallocate(p, Bytes(64)) };
        assert_eq!(q, p);

        // The shed tail stands alone between p and the guard.
        let mut sizes = vec![];
        heap.index().walk(&mut |block| {
            sizes.push(block.size().0);
            true
        });
        assert!(sizes.contains(&(512 - 64 - W)));
        assert!(heap.validate());
    });
}

fn reallocate_grows_over_the_right_neighbor<I: FreeIndex>() {
    with_heap::<I, _>(8192, |heap| {
        let p1 = heap.allocate(Bytes(128));
        let p2 = heap.allocate(Bytes(256));
        let _guard = heap.allocate(Bytes(64));
        assert!(!p1.is_null() && !p2.is_null());

        unsafe { heap.release(p2) };
        let q = unsafe { heap.reallocate(p1, Bytes(128 + 256)) };
        assert_eq!(q, p1);

        // Absorbed the seam too; the surplus word is too small to shed.
        let rest = heap.capacity().0;
        let expected = [
            ExpectedBlock {
                payload: Bytes(128 + W + 256),
                allocated: true,
            },
            ExpectedBlock {
                payload: Bytes(64),
                allocated: true,
            },
            ExpectedBlock {
                payload: Bytes(rest),
                allocated: false,
            },
        ];
        let mut verdicts = [DiffVerdict::Ok; 3];
        assert!(heap.heap_diff(&expected, &mut verdicts));
        assert!(heap.validate());
    });
}

fn reallocate_moves_and_preserves_bytes<I: FreeIndex>() {
    with_heap::<I, _>(8192, |heap| {
        let a = heap.allocate(Bytes(64));
        let _guard = heap.allocate(Bytes(64));
        assert!(!a.is_null());
        unsafe { ptr::write_bytes(a, 0x7c, 64) };

        let q = unsafe { heap.reallocate(a, Bytes(512)) };
        assert!(!q.is_null());
        assert!(q != a);
        assert!(intact(q as usize, 64, 0x7c));
        assert!(heap.validate());
    });
}

fn heap_diff_reports_verdicts<I: FreeIndex>() {
    with_heap::<I, _>(8192, |heap| {
        let p = heap.allocate(Bytes(64));
        assert!(!p.is_null());
        let rest = heap.capacity().0;

        let right = [
            ExpectedBlock {
                payload: Bytes(64),
                allocated: true,
            },
            ExpectedBlock {
                payload: Bytes(rest),
                allocated: false,
            },
        ];
        let mut verdicts = [DiffVerdict::Ok; 2];
        assert!(heap.heap_diff(&right, &mut verdicts));
        assert_eq!(verdicts, [DiffVerdict::Ok, DiffVerdict::Ok]);

        let wrong_size = [
            ExpectedBlock {
                payload: Bytes(72),
                allocated: true,
            },
            ExpectedBlock {
                payload: Bytes(rest),
                allocated: false,
            },
        ];
        assert!(!heap.heap_diff(&wrong_size, &mut verdicts));
        assert_eq!(verdicts, [DiffVerdict::Mismatch, DiffVerdict::Ok]);

        let too_many = [
            ExpectedBlock {
                payload: Bytes(64),
                allocated: true,
            },
            ExpectedBlock {
                payload: Bytes(rest),
                allocated: false,
            },
            ExpectedBlock {
                payload: Bytes(8),
                allocated: true,
            },
        ];
        let mut verdicts3 = [DiffVerdict::Ok; 3];
        assert!(!heap.heap_diff(&too_many, &mut verdicts3));
        assert_eq!(
            verdicts3,
            [DiffVerdict::Ok, DiffVerdict::Ok, DiffVerdict::OutOfBounds]
        );

        let too_few = [ExpectedBlock {
            payload: Bytes(64),
            allocated: true,
        }];
        let mut verdicts2 = [DiffVerdict::Ok; 2];
        assert!(!heap.heap_diff(&too_few, &mut verdicts2));
        assert_eq!(verdicts2, [DiffVerdict::Ok, DiffVerdict::HeapContinues]);
    });
}

fn align_is_predictable<I: FreeIndex>() {
    let mut last = 0;
    for request in 1..513 {
        let rounded = FitAlloc::<I>::align(Bytes(request)).0;
        assert_eq!(rounded % W, 0);
        assert!(rounded >= request);
        assert!(rounded >= I::NODE_BYTES + W);
        assert!(rounded >= last);
        last = rounded;
    }
}

fn init_rejects_bad_regions<I: FreeIndex>() {
    let mut region = Region::new(4096);
    unsafe {
        let misaligned = region.as_mut_ptr().offset(1);
        assert_eq!(
            FitAlloc::<I>::init(misaligned, Bytes(2048)).err(),
            Some(InitError::Misaligned)
        );
        assert_eq!(
            FitAlloc::<I>::init(region.as_mut_ptr(), Bytes(2 * W)).err(),
            Some(InitError::RegionTooSmall)
        );
        assert_eq!(
            FitAlloc::<I>::init(ptr::null_mut(), Bytes(2048)).err(),
            Some(InitError::Misaligned)
        );
    }
}

// The duplicate fast path of the off-tree-list variants: after the first
// free block of a size goes into the tree, further equal-sized inserts land
// on the duplicate list without a single rotation.
fn duplicate_churn_skips_rotations<I: FreeIndex>() {
    with_heap::<I, _>(64 * 1024, |heap| {
        let mut ptrs = vec![];
        for _ in 0..33 {
            let p = heap.allocate(Bytes(64));
            assert!(!p.is_null());
            ptrs.push(p);
        }
        // Free every other block: sixteen identical free blocks, none of
        // them address-adjacent.
        let mut before_last = 0;
        for i in 0..16 {
            if i == 15 {
                before_last = heap.index().rotation_count();
            }
            unsafe { heap.release(ptrs[2 * i + 1]) };
        }
        assert_eq!(heap.index().rotation_count(), before_last);
        assert!(heap.validate());
    });
}

macro_rules! variant_tests {
    ( $mod_name:ident, $index:ty ) => {
        mod $mod_name {
            use super::*;

            #[test]
            fn fresh_init() {
                super::fresh_init::<$index>();
            }
            #[test]
            fn split_without_residual() {
                super::split_without_residual::<$index>();
            }
            #[test]
            fn split_with_residual() {
                super::split_with_residual::<$index>();
            }
            #[test]
            fn coalesce_both_sides() {
                super::coalesce_both_sides::<$index>();
            }
            #[test]
            fn best_fit_prefers_the_snug_block() {
                super::best_fit_prefers_the_snug_block::<$index>();
            }
            #[test]
            fn allocate_zero_returns_null() {
                super::allocate_zero_returns_null::<$index>();
            }
            #[test]
            fn exhaust_then_fail() {
                super::exhaust_then_fail::<$index>();
            }
            #[test]
            fn allocate_release_round_trip() {
                super::allocate_release_round_trip::<$index>();
            }
            #[test]
            fn reallocate_same_size_is_identity() {
                super::reallocate_same_size_is_identity::<$index>();
            }
            #[test]
            fn reallocate_shrinks_in_place() {
                super::reallocate_shrinks_in_place::<$index>();
            }
            #[test]
            fn reallocate_grows_over_the_right_neighbor() {
                super::reallocate_grows_over_the_right_neighbor::<$index>();
            }
            #[test]
            fn reallocate_moves_and_preserves_bytes() {
                super::reallocate_moves_and_preserves_bytes::<$index>();
            }
            #[test]
            fn heap_diff_reports_verdicts() {
                super::heap_diff_reports_verdicts::<$index>();
            }
            #[test]
            fn align_is_predictable() {
                super::align_is_predictable::<$index>();
            }
            #[test]
            fn init_rejects_bad_regions() {
                super::init_rejects_bad_regions::<$index>();
            }
        }
    };
}

variant_tests!(sl, SegregatedList);
variant_tests!(rb_p, RbParentTree);
variant_tests!(rb_d, RbDupTree);
variant_tests!(rb_s, RbStackTree);
variant_tests!(rb_t, RbTopDownTree);

macro_rules! dup_variant_tests {
    ( $mod_name:ident, $index:ty ) => {
        mod $mod_name {
            use super::*;

            #[test]
            fn duplicate_churn_skips_rotations() {
                super::duplicate_churn_skips_rotations::<$index>();
            }
        }
    };
}

dup_variant_tests!(rb_d_dups, RbDupTree);
dup_variant_tests!(rb_s_dups, RbStackTree);
dup_variant_tests!(rb_t_dups, RbTopDownTree);

// ---------------------------------------------------------------------------
// Randomized workloads.

#[derive(Debug, Clone, Copy)]
enum Operation {
    // Allocate this many bytes.
    Alloc(usize),

    // Reallocate the n^th allocation to this many bytes, or no-op if it has
    // already been freed.
    Realloc(usize, usize),

    // Free the n^th allocation, or no-op if it has already been freed.
    Free(usize),
}

use Operation::*;

#[derive(Debug, Clone)]
struct Operations(Vec<Operation>);

#[cfg(feature = "extra_assertions")]
const NUM_OPERATIONS: usize = 300;

#[cfg(not(feature = "extra_assertions"))]
const NUM_OPERATIONS: usize = 4_000;

fn arbitrary_size<G: Gen>(g: &mut G) -> usize {
    // Zero-sized allocation 1/1000 times.
    if g.gen_weighted_bool(1000) {
        return 0;
    }
    // Large allocation with P = 1/20.
    if g.gen_weighted_bool(20) {
        return g.gen_range(1, 8 * 1024);
    }
    if g.gen() {
        g.gen_range(1, 64)
    } else {
        g.gen_range(64, 512)
    }
}

impl Arbitrary for Operations {
    fn arbitrary<G: Gen>(g: &mut G) -> Self {
        let mut num_allocs = 0;
        let mut active = vec![];
        let mut ops = Vec::with_capacity(NUM_OPERATIONS);
        for _ in 0..NUM_OPERATIONS {
            // Free with P = 1/4 so allocation stays ahead and the index
            // keeps real depth; resize with P = 1/8.
            if !active.is_empty() && g.gen_weighted_bool(4) {
                let i = g.gen_range(0, active.len());
                ops.push(Free(active.swap_remove(i)));
            } else if !active.is_empty() && g.gen_weighted_bool(8) {
                let i = g.gen_range(0, active.len());
                ops.push(Realloc(active[i], arbitrary_size(g)));
            } else {
                active.push(num_allocs);
                num_allocs += 1;
                ops.push(Alloc(arbitrary_size(g)));
            }
        }
        ops.reserve_exact(active.len());
        while !active.is_empty() {
            let i = g.gen_range(0, active.len());
            ops.push(Free(active.swap_remove(i)));
        }
        Operations(ops)
    }

    fn shrink(&self) -> Box<Iterator<Item = Self>> {
        let ops = self.0.clone();
        Box::new((0..self.0.len()).map(move |i| Operations(ops.iter().cloned().take(i).collect())))
    }
}

fn run_ops<I: FreeIndex>(ops: &Operations) -> bool {
    let mut region = Region::new(256 * 1024);
    let size = Bytes(region.bytes());
    let mut heap: FitAlloc<I> = unsafe { FitAlloc::init(region.as_mut_ptr(), size).unwrap() };
    let initial = heap.capacity();

    let mut slots: Vec<Option<(usize, usize, u8)>> = vec![];
    let mut stamp: u8 = 0;
    for (step, op) in ops.0.iter().enumerate() {
        match *op {
            Alloc(n) => {
                let p = heap.allocate(Bytes(n));
                if p.is_null() {
                    slots.push(None);
                } else {
                    stamp = stamp.wrapping_add(1);
                    unsafe { ptr::write_bytes(p, stamp, n) };
                    slots.push(Some((p as usize, n, stamp)));
                }
            }
            Realloc(idx, n) => {
                if let Some((p, old_n, s)) = slots.get(idx).and_then(|slot| *slot) {
                    assert!(intact(p, old_n, s));
                    let q = unsafe { heap.reallocate(p as *mut u8, Bytes(n)) };
                    if n == 0 {
                        slots[idx] = None;
                    } else if q.is_null() {
                        // Growth failed; the original must still be intact.
                        assert!(intact(p, old_n, s));
                    } else {
                        assert!(intact(q as usize, cmp::min(old_n, n), s));
                        unsafe { ptr::write_bytes(q, s, n) };
                        slots[idx] = Some((q as usize, n, s));
                    }
                }
            }
            Free(idx) => {
                if idx < slots.len() {
                    if let Some((p, n, s)) = slots[idx].take() {
                        assert!(intact(p, n, s));
                        unsafe { heap.release(p as *mut u8) };
                    }
                }
            }
        }
        if step % 64 == 0 && !heap.validate() {
            return false;
        }
    }

    for i in 0..slots.len() {
        if let Some((p, _, _)) = slots[i].take() {
            unsafe { heap.release(p as *mut u8) };
        }
    }
    heap.validate() && heap.capacity() == initial
}

macro_rules! variant_quickchecks {
    ( $name:ident, $index:ty ) => {
        #[test]
        fn $name() {
            fn prop(ops: Operations) -> bool {
                run_ops::<$index>(&ops)
            }
            QuickCheck::new()
                .tests(3)
                .quickcheck(prop as fn(Operations) -> bool);
        }
    };
}

variant_quickchecks!(quickchecks_sl, SegregatedList);
variant_quickchecks!(quickchecks_rb_p, RbParentTree);
variant_quickchecks!(quickchecks_rb_d, RbDupTree);
variant_quickchecks!(quickchecks_rb_s, RbStackTree);
variant_quickchecks!(quickchecks_rb_t, RbTopDownTree);

// ---------------------------------------------------------------------------
// A long mixed workload against one variant, adapted from the dlmalloc-rs
// smoke tests. Too slow with the extra assertion checks enabled.

#[test]
#[cfg(not(feature = "extra_assertions"))]
fn stress() {
    use rand::Rng;

    let mut rng = rand::weak_rng();
    with_heap::<RbTopDownTree, _>(1 << 20, |heap| {
        let mut ptrs: Vec<(usize, usize, u8)> = Vec::new();
        let mut stamp: u8 = 0;
        for _ in 0..50_000 {
            let free = ptrs.len() > 0
                && ((ptrs.len() < 1_000 && rng.gen_weighted_bool(3)) || rng.gen());
            if free {
                let idx = rng.gen_range(0, ptrs.len());
                let (p, n, s) = ptrs.swap_remove(idx);
                assert!(intact(p, n, s));
                unsafe { heap.release(p as *mut u8) };
                continue;
            }

            if ptrs.len() > 0 && rng.gen_weighted_bool(100) {
                let idx = rng.gen_range(0, ptrs.len());
                let (p, n, s) = ptrs.swap_remove(idx);
                if n <= 10 {
                    ptrs.push((p, n, s));
                } else {
                    let new_n = if rng.gen() {
                        rng.gen_range(n, n * 2)
                    } else {
                        rng.gen_range(n / 2, n)
                    };
                    assert!(intact(p, n, s));
                    let q = unsafe { heap.reallocate(p as *mut u8, Bytes(new_n)) };
                    if q.is_null() {
                        ptrs.push((p, n, s));
                    } else {
                        assert!(intact(q as usize, cmp::min(n, new_n), s));
                        unsafe { ptr::write_bytes(q, s, new_n) };
                        ptrs.push((q as usize, new_n, s));
                    }
                }
                continue;
            }

            let n = if rng.gen() {
                rng.gen_range(1, 128)
            } else {
                rng.gen_range(1, 8 * 1024)
            };
            let p = heap.allocate(Bytes(n));
            if p.is_null() {
                continue;
            }
            stamp = stamp.wrapping_add(1);
            unsafe { ptr::write_bytes(p, stamp, n) };
            ptrs.push((p as usize, n, stamp));
        }

        assert!(heap.validate());
        while let Some((p, n, s)) = ptrs.pop() {
            assert!(intact(p, n, s));
            unsafe { heap.release(p as *mut u8) };
        }
        assert!(heap.validate());
        assert_eq!(indexed_blocks(heap), 1);
    });
}

#[test]
fn script_player_runs_on_every_variant() {
    let requests = request_script::parse(
        "a 1 100\n\
         a 2 200\n\
         f 1\n\
         r 2 50\n\
         a 3 4000\n\
         f 3\n\
         f 2\n",
    )
    .unwrap();
    let expect = 64 * 1024 - 2 * W;

    let sl = request_script::run_script::<SegregatedList, _>(&requests, 64 * 1024, true, |_, _| {})
        .unwrap();
    assert_eq!(sl.final_capacity, expect);
    let rb_p =
        request_script::run_script::<RbParentTree, _>(&requests, 64 * 1024, true, |_, _| {})
            .unwrap();
    assert_eq!(rb_p.final_capacity, expect);
    let rb_d = request_script::run_script::<RbDupTree, _>(&requests, 64 * 1024, true, |_, _| {})
        .unwrap();
    assert_eq!(rb_d.final_capacity, expect);
    let rb_s = request_script::run_script::<RbStackTree, _>(&requests, 64 * 1024, true, |_, _| {})
        .unwrap();
    assert_eq!(rb_s.final_capacity, expect);
    let rb_t =
        request_script::run_script::<RbTopDownTree, _>(&requests, 64 * 1024, true, |_, _| {})
            .unwrap();
    assert_eq!(rb_t.final_capacity, expect);
}
