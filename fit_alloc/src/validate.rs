//! The heap validator and the structure dump used by the `peaks` diagnostic.
//!
//! Validation performs the linear walk and the index walk and cross-checks
//! them against each other and against the heap's own accounting. A detected
//! violation panics in debug builds, where it will stop a debugger at the
//! failing invariant; in release builds `validate` just reports false. The
//! allocator itself never aborts a caller.

use core::fmt;

use header::{Block, WORD_SIZE};
use index::FreeIndex;
use FitAlloc;

cfg_if! {
    if #[cfg(debug_assertions)] {
        fn trap(what: &str) {
            panic!("heap invariant violated: {}", what);
        }
    } else {
        fn trap(_what: &str) {}
    }
}

macro_rules! heap_check {
    ( $cond:expr ) => {
        if !$cond {
            trap(stringify!($cond));
            return false;
        }
    };
}

pub(crate) fn validate<I: FreeIndex>(heap: &FitAlloc<I>) -> bool {
    let min_payload = I::NODE_BYTES + WORD_SIZE;

    // Linear walk: every block in address order, ending exactly on the end
    // sentinel.
    let mut addr = heap.start;
    let mut prev_allocated = true;
    let mut free_blocks = 0usize;
    let mut free_bytes = 0usize;
    while addr != heap.end {
        heap_check!(addr >= heap.start && addr < heap.end);
        let block = unsafe { Block::from_raw(addr as *mut u8) };
        let size = block.size().0;
        heap_check!(size % WORD_SIZE == 0);
        heap_check!(size >= min_payload);
        heap_check!(block.is_left_allocated() == prev_allocated);
        if !block.is_allocated() {
            // Coalescing is total: no two free neighbors.
            heap_check!(prev_allocated);
            heap_check!(block.footer_word() == block.header_word());
            free_blocks += 1;
            free_bytes += size;
        }
        prev_allocated = block.is_allocated();
        addr = addr.wrapping_add(WORD_SIZE + size);
    }
    let sentinel = unsafe { Block::from_raw(heap.end as *mut u8) };
    heap_check!(sentinel.is_end_sentinel());
    heap_check!(sentinel.is_allocated());
    heap_check!(sentinel.is_left_allocated() == prev_allocated);
    heap_check!(free_bytes == heap.free_bytes);

    // Index walk: structure first (it is cycle-safe), then totals. Matching
    // counts and bytes against the linear walk pins every free block to
    // exactly one index entry.
    heap_check!(heap.index.check());
    let mut indexed_blocks = 0usize;
    let mut indexed_bytes = 0usize;
    let start = heap.start;
    let end = heap.end;
    let complete = heap.index.walk(&mut |block: Block| {
        if block.addr() < start || block.addr() >= end || block.is_allocated() {
            return false;
        }
        indexed_blocks += 1;
        indexed_bytes += block.size().0;
        true
    });
    heap_check!(complete);
    heap_check!(indexed_blocks == free_blocks);
    heap_check!(indexed_bytes == free_bytes);

    true
}

/// How much detail the heap dump prints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    /// Block offsets, states, and sizes.
    Sizes,
    /// Raw addresses alongside everything.
    Addresses,
}

/// A displayable snapshot of the linear heap and the free index.
///
/// Borrow one from [`FitAlloc::dump`](../struct.FitAlloc.html#method.dump)
/// and format it with `{}`.
pub struct HeapDump<'h, 'a: 'h, I: FreeIndex + 'h> {
    heap: &'h FitAlloc<'a, I>,
    verbosity: Verbosity,
}

impl<'h, 'a: 'h, I: FreeIndex + 'h> HeapDump<'h, 'a, I> {
    pub(crate) fn new(heap: &'h FitAlloc<'a, I>, verbosity: Verbosity) -> HeapDump<'h, 'a, I> {
        HeapDump {
            heap: heap,
            verbosity: verbosity,
        }
    }
}

impl<'h, 'a: 'h, I: FreeIndex + 'h> fmt::Display for HeapDump<'h, 'a, I> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let heap = self.heap;
        let total = heap.end + WORD_SIZE - heap.start;
        writeln!(
            f,
            "heap [{:#x}, {:#x}): {} bytes, {} free",
            heap.start,
            heap.end + WORD_SIZE,
            total,
            heap.free_bytes
        )?;
        for block in heap.blocks() {
            let state = if block.is_allocated() { "alloc" } else { "free " };
            match self.verbosity {
                Verbosity::Sizes => writeln!(
                    f,
                    "  +{:<8} {} {}",
                    block.addr() - heap.start,
                    state,
                    block.size().0
                )?,
                Verbosity::Addresses => writeln!(
                    f,
                    "  {:#x} +{:<8} {} {}",
                    block.addr(),
                    block.addr() - heap.start,
                    state,
                    block.size().0
                )?,
            }
        }
        heap.index.write_structure(f, self.verbosity)
    }
}
