/*!

`fit_alloc`: best-fit allocation over a caller-provided contiguous byte
region.

The allocator owns exactly one resource: the `(address, length)` region it is
handed at `init`. It performs no I/O, never calls another allocator, and
keeps every piece of bookkeeping in-band -- a one-word tagged header on every
block, a mirrored footer on free blocks, and the free-index node links inside
the payloads of the free blocks themselves.

What varies is the **free-block index**: the structure consulted to find a
best-fit block, updated on every split and coalesce. Five implementations of
the [`FreeIndex`] seam are provided, and the allocator is generic over them:

- [`SegregatedList`] -- segregated free lists keyed by size class;
- [`RbParentTree`] -- a red-black tree with explicit parent pointers;
- [`RbDupTree`] -- a red-black tree with duplicate sizes on off-tree lists;
- [`RbStackTree`] -- a parentless red-black tree driven by a descent stack;
- [`RbTopDownTree`] -- a parentless red-black tree fixed up top-down.

Heaps produced by different index variants are not layout-compatible; pick
one per region and stay with it.

## Using it

```
extern crate fit_alloc;
extern crate memory_units;

use fit_alloc::{FitAlloc, RbDupTree};
use memory_units::Bytes;

# fn main() {
let mut region = [0usize; 1024];
let size = Bytes(region.len() * fit_alloc::WORD_SIZE);
let mut heap: FitAlloc<RbDupTree> =
    unsafe { FitAlloc::init(region.as_mut_ptr() as *mut u8, size).unwrap() };

let p = heap.allocate(Bytes(256));
assert!(!p.is_null());
unsafe { heap.release(p) };
assert!(heap.validate());
# }
```

## Contract notes

- Single-threaded and non-reentrant. Every call completes synchronously;
  there is no locking anywhere.
- Caller errors are the null sentinel: `allocate(0)`, oversize requests, and
  exhaustion return null with the heap unchanged, and a failed `reallocate`
  growth leaves the original pointer valid.
- Releasing a pointer this allocator never returned, releasing the same
  pointer twice, or writing past the end of an allocation is undefined
  behavior; no attempt is made to detect any of it.
- Addresses returned are word-aligned. Alignment beyond the word is not
  supported, and memory is never returned to any underlying system.

[`FreeIndex`]: index/trait.FreeIndex.html
[`SegregatedList`]: index/segregated/struct.SegregatedList.html
[`RbParentTree`]: index/rb_parent/struct.RbParentTree.html
[`RbDupTree`]: index/rb_dup/struct.RbDupTree.html
[`RbStackTree`]: index/rb_stack/struct.RbStackTree.html
[`RbTopDownTree`]: index/rb_topdown/struct.RbTopDownTree.html

*/

#![deny(missing_docs)]
#![cfg_attr(not(feature = "use_std_for_test_debugging"), no_std)]

#[macro_use]
extern crate cfg_if;

#[cfg(feature = "use_std_for_test_debugging")]
extern crate core;

extern crate memory_units;
extern crate unreachable;

#[macro_use]
mod extra_assert;

mod header;
pub mod index;
mod validate;

pub use header::{Block, Color, WORD_SIZE};
pub use index::{FreeIndex, RbDupTree, RbParentTree, RbStackTree, RbTopDownTree, SegregatedList};
pub use validate::{HeapDump, Verbosity};

use core::cmp;
use core::fmt;
use core::marker::PhantomData;
use core::ptr;
use memory_units::Bytes;

/// Why `init` refused a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitError {
    /// The region pointer was null or not word-aligned.
    Misaligned,
    /// The region cannot hold even one minimum-size block plus the end
    /// sentinel.
    RegionTooSmall,
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            InitError::Misaligned => write!(f, "region is null or not word-aligned"),
            InitError::RegionTooSmall => write!(f, "region is smaller than the minimum heap"),
        }
    }
}

/// One slot of an expected heap layout, for [`FitAlloc::heap_diff`].
///
/// [`FitAlloc::heap_diff`]: struct.FitAlloc.html#method.heap_diff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpectedBlock {
    /// Expected payload size, after rounding.
    pub payload: Bytes,
    /// Expected allocation state.
    pub allocated: bool,
}

/// Per-slot verdict of [`FitAlloc::heap_diff`].
///
/// [`FitAlloc::heap_diff`]: struct.FitAlloc.html#method.heap_diff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffVerdict {
    /// The block matches the expectation (or both lists ended here).
    Ok,
    /// A block exists here but differs in size or state.
    Mismatch,
    /// The expected layout has more entries than the heap has blocks.
    OutOfBounds,
    /// The heap has more blocks than the expected layout has entries.
    HeapContinues,
}

/// A best-fit allocator over a caller-provided contiguous region.
///
/// `I` selects the free-block index variant. The lifetime ties the allocator
/// to the region it was initialized over.
pub struct FitAlloc<'a, I: FreeIndex> {
    start: usize,
    // Address of the end sentinel word; the region ends one word later.
    end: usize,
    free_bytes: usize,
    max_request: usize,
    index: I,
    _region: PhantomData<&'a mut [u8]>,
}

impl<'a, I: FreeIndex> FitAlloc<'a, I> {
    fn min_block_size() -> usize {
        2 * WORD_SIZE + I::NODE_BYTES
    }

    /// The smallest region `init` accepts for this index variant.
    pub fn min_heap_bytes() -> Bytes {
        Bytes(Self::min_block_size() + WORD_SIZE)
    }

    /// Round a request the way `allocate` will, so occupancy is predictable:
    /// up to a word multiple, and up to the smallest payload that can host
    /// this variant's free-node metadata plus a footer once released.
    pub fn align(request: Bytes) -> Bytes {
        let min_payload = I::NODE_BYTES + WORD_SIZE;
        let rounded = request.0.saturating_add(WORD_SIZE - 1) & !(WORD_SIZE - 1);
        Bytes(cmp::max(rounded, min_payload))
    }

    /// Take ownership of `region` and lay out a fresh heap in it: one free
    /// block spanning everything before the end sentinel word.
    ///
    /// `size` is rounded down to a word multiple. The region must be
    /// word-aligned and large enough for [`min_heap_bytes`].
    ///
    /// ### Safety
    ///
    /// `region` must point to `size` bytes that are unused and stay valid --
    /// and unobserved except through this allocator -- for the allocator's
    /// lifetime.
    ///
    /// [`min_heap_bytes`]: #method.min_heap_bytes
    pub unsafe fn init(region: *mut u8, size: Bytes) -> Result<FitAlloc<'a, I>, InitError> {
        if region.is_null() || region as usize % WORD_SIZE != 0 {
            return Err(InitError::Misaligned);
        }
        let bytes = size.0 & !(WORD_SIZE - 1);
        if bytes < Self::min_heap_bytes().0 {
            return Err(InitError::RegionTooSmall);
        }
        let start = region as usize;
        let end = start + bytes - WORD_SIZE;

        // The end sentinel reads as a permanently allocated, zero-sized
        // block: the right edge never coalesces and the index variants use
        // its address as their nil.
        let sentinel = Block::install(end as *mut u8, Bytes(0), true, false);

        let payload = bytes - 2 * WORD_SIZE;
        let first = Block::install(region, Bytes(payload), false, true);
        first.write_footer();

        let mut index = I::init(sentinel);
        index.insert(first);

        Ok(FitAlloc {
            start: start,
            end: end,
            free_bytes: payload,
            max_request: payload,
            index: index,
            _region: PhantomData,
        })
    }

    /// Allocate `size` bytes and return a word-aligned pointer into the
    /// region, or null when `size` is zero, exceeds the largest request this
    /// heap could ever satisfy, or no free block fits. On null the heap is
    /// unchanged.
    pub fn allocate(&mut self, size: Bytes) -> *mut u8 {
        if size.0 == 0 || size.0 > self.max_request {
            return ptr::null_mut();
        }
        let request = Self::align(size);
        let block = match unsafe { self.index.best_fit_pop(request) } {
            Some(block) => block,
            None => return ptr::null_mut(),
        };
        self.free_bytes -= block.size().0;
        let client = unsafe { self.place(block, request) };
        extra_assert!(self.validate());
        client
    }

    /// Resize the allocation at `ptr` to `size` bytes.
    ///
    /// `reallocate(null, n)` is `allocate(n)`; `reallocate(p, 0)` releases
    /// `p` and returns null. A shrink always succeeds in place. A growth
    /// first tries to absorb the right neighbor in place; only then does it
    /// degrade to allocate-copy-release, preserving the caller's bytes up to
    /// the smaller of the old and new sizes. When growth fails, null is
    /// returned and the original pointer stays valid.
    ///
    /// ### Safety
    ///
    /// `ptr` must be null or an address this allocator returned and the
    /// caller has not yet released.
    pub unsafe fn reallocate(&mut self, ptr: *mut u8, size: Bytes) -> *mut u8 {
        if ptr.is_null() {
            return self.allocate(size);
        }
        if size.0 == 0 {
            self.release(ptr);
            return ptr::null_mut();
        }
        if size.0 > self.max_request {
            return ptr::null_mut();
        }
        let request = Self::align(size);
        let block = Block::from_client(ptr);
        extra_assert!(block.is_allocated());
        let old = block.size();

        if request.0 <= old.0 {
            // Shrink in place, returning the tail when it can stand alone.
            self.shed_tail(block, request);
            extra_assert!(self.validate());
            return ptr;
        }

        let right = block.right();
        if !right.is_allocated() && old.0 + WORD_SIZE + right.size().0 >= request.0 {
            // Grow in place over the free right neighbor.
            self.index_remove(right);
            block.set_size(Bytes(old.0 + WORD_SIZE + right.size().0));
            self.shed_tail(block, request);
            extra_assert!(self.validate());
            return ptr;
        }

        let moved = self.allocate(size);
        if moved.is_null() {
            return ptr::null_mut();
        }
        ptr::copy_nonoverlapping(ptr as *const u8, moved, cmp::min(old.0, request.0));
        self.release(ptr);
        moved
    }

    /// Return the allocation at `ptr` to the free index, coalescing with any
    /// free address-neighbor. `release(null)` is a no-op.
    ///
    /// ### Safety
    ///
    /// `ptr` must be null or an address this allocator returned and the
    /// caller has not yet released.
    pub unsafe fn release(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        let block = Block::from_client(ptr);
        extra_assert!(block.is_allocated());
        self.free_block(block);
        extra_assert!(self.validate());
    }

    /// Total free payload bytes currently indexed.
    pub fn capacity(&self) -> Bytes {
        Bytes(self.free_bytes)
    }

    /// The free-block index, for introspection: rotation counters and the
    /// structure half of the dump.
    pub fn index(&self) -> &I {
        &self.index
    }

    /// Walk the heap and the index and check every invariant: the linear
    /// walk lands exactly on the end sentinel, coalescing is total, footers
    /// mirror headers, left-allocated tags match reality, the index holds
    /// exactly the free blocks, and the variant's own structure is sound.
    ///
    /// Violations panic in debug builds and report false in release builds.
    pub fn validate(&self) -> bool {
        validate::validate(self)
    }

    /// A displayable snapshot of the heap and the index.
    pub fn dump<'h>(&'h self, verbosity: Verbosity) -> HeapDump<'h, 'a, I> {
        HeapDump::new(self, verbosity)
    }

    /// Compare the heap's linear layout against an expected one, writing one
    /// verdict per slot. `verdicts` is the slot count; pass at least
    /// `expected.len()` slots, with extras covering blocks the expectation
    /// may have missed. Returns true iff every slot is `Ok`.
    pub fn heap_diff(&self, expected: &[ExpectedBlock], verdicts: &mut [DiffVerdict]) -> bool {
        extra_assert!(verdicts.len() >= expected.len());
        let mut cursor = self.start;
        let mut all_ok = true;
        for (i, slot) in verdicts.iter_mut().enumerate() {
            let at_end = cursor == self.end;
            *slot = if i < expected.len() {
                if at_end {
                    DiffVerdict::OutOfBounds
                } else {
                    let block = unsafe { Block::from_raw(cursor as *mut u8) };
                    cursor += WORD_SIZE + block.size().0;
                    let want = expected[i];
                    if block.size() == want.payload && block.is_allocated() == want.allocated {
                        DiffVerdict::Ok
                    } else {
                        DiffVerdict::Mismatch
                    }
                }
            } else if at_end {
                DiffVerdict::Ok
            } else {
                let block = unsafe { Block::from_raw(cursor as *mut u8) };
                cursor += WORD_SIZE + block.size().0;
                DiffVerdict::HeapContinues
            };
            if *slot != DiffVerdict::Ok {
                all_ok = false;
            }
        }
        all_ok
    }

    // Mark `block` allocated and trim it to `request`, handing any viable
    // tail back to the index. The whole of C3.
    unsafe fn place(&mut self, block: Block, request: Bytes) -> *mut u8 {
        block.mark_allocated();
        self.shed_tail(block, request);
        block.client()
    }

    // Carve the surplus past `request` off the tail of the allocated `block`
    // and free it. A surplus too small to stand alone stays with the block,
    // and the right neighbor learns its left is allocated.
    unsafe fn shed_tail(&mut self, block: Block, request: Bytes) {
        let total = block.size();
        if total.0 - request.0 >= Self::min_block_size() {
            block.set_size(request);
            let tail_ptr = (block.addr() + WORD_SIZE + request.0) as *mut u8;
            let tail = Block::install(tail_ptr, Bytes(total.0 - request.0 - WORD_SIZE), true, true);
            self.free_block(tail);
        } else {
            block.right().set_left_allocated(true);
        }
    }

    // Free an allocated block: coalesce, retag, mirror the footer, insert.
    unsafe fn free_block(&mut self, block: Block) {
        let merged = self.coalesce(block);
        merged.mark_free();
        merged.write_footer();
        merged.right().set_left_allocated(false);
        self.index_insert(merged);
    }

    // Fold any free address-neighbors of `block` into it, pulling them out
    // of the index. The merged block is *not* re-inserted: the caller
    // decides whether it is about to be allocated or freed.
    unsafe fn coalesce(&mut self, block: Block) -> Block {
        let mut head = block;
        let mut payload = block.size().0;
        let right = block.right();
        if !right.is_allocated() {
            self.index_remove(right);
            payload += WORD_SIZE + right.size().0;
        }
        if !block.is_left_allocated() {
            let left = block.left();
            self.index_remove(left);
            payload += WORD_SIZE + left.size().0;
            head = left;
        }
        head.set_size(Bytes(payload));
        head
    }

    unsafe fn index_insert(&mut self, block: Block) {
        self.free_bytes += block.size().0;
        self.index.insert(block);
    }

    unsafe fn index_remove(&mut self, block: Block) {
        self.free_bytes -= block.size().0;
        self.index.remove(block);
    }

    pub(crate) fn blocks(&self) -> Blocks {
        Blocks {
            cursor: self.start,
            end: self.end,
        }
    }
}

// Linear iterator over the heap's blocks, sentinel excluded. Assumes the
// heap is well-formed; the validator does its own bounded walk.
pub(crate) struct Blocks {
    cursor: usize,
    end: usize,
}

impl Iterator for Blocks {
    type Item = Block;

    fn next(&mut self) -> Option<Block> {
        if self.cursor >= self.end {
            return None;
        }
        let block = unsafe { Block::from_raw(self.cursor as *mut u8) };
        self.cursor += WORD_SIZE + block.size().0;
        Some(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smoke() {
        let mut region = [0usize; 1024];
        unsafe {
            let mut heap: FitAlloc<RbDupTree> =
                FitAlloc::init(region.as_mut_ptr() as *mut u8, Bytes(1024 * WORD_SIZE)).unwrap();
            let initial = heap.capacity();
            assert_eq!(initial, Bytes(1024 * WORD_SIZE - 2 * WORD_SIZE));

            let p = heap.allocate(Bytes(100));
            assert!(!p.is_null());
            assert!(heap.validate());

            heap.release(p);
            assert_eq!(heap.capacity(), initial);
            assert!(heap.validate());
        }
    }

    #[test]
    fn min_block_covers_node_and_footer() {
        assert_eq!(
            FitAlloc::<SegregatedList>::align(Bytes(1)),
            Bytes(SegregatedList::NODE_BYTES + WORD_SIZE)
        );
        assert_eq!(
            FitAlloc::<RbDupTree>::align(Bytes(1)),
            Bytes(RbDupTree::NODE_BYTES + WORD_SIZE)
        );
    }
}
