//! A red-black tree of free blocks with explicit parent pointers.
//!
//! The classical bottom-up tree. Insertion appends a red leaf and fixes up
//! through parent and grandparent pointers; deletion is by identity, with the
//! textbook transplant and fix-up.
//!
//! The search key is the pair `(payload size, block address)`. Ordering by
//! size first keeps best-fit a plain leftward descent; the address tiebreak
//! makes every key unique, so equal-sized blocks land on a deterministic side
//! and removal by address never has to guess which equal node it is looking
//! at.

use core::fmt;

use header::{Block, Color, WORD_SIZE};
use index::Dir::{Left, Right};
use index::{Dir, FreeIndex};
use memory_units::Bytes;
use validate::Verbosity;

// Any tree deeper than this holds more nodes than any real heap can.
const MAX_PLAUSIBLE_DEPTH: usize = 64;

#[repr(C)]
struct TreeNode {
    link: [*mut TreeNode; 2],
    parent: *mut TreeNode,
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct NodePtr(*mut TreeNode);

/// Red-black tree with parent pointers, keyed by `(size, address)`.
pub struct RbParentTree {
    nil: NodePtr,
    root: NodePtr,
    rotations: u64,
}

impl RbParentTree {
    fn node_of(block: Block) -> NodePtr {
        NodePtr(block.node::<TreeNode>())
    }

    unsafe fn block_of(n: NodePtr) -> Block {
        Block::from_node(n.0)
    }

    fn key_of(&self, n: NodePtr) -> (usize, usize) {
        extra_assert!(n != self.nil);
        let block = unsafe { Self::block_of(n) };
        (block.size().0, block.addr())
    }

    fn link(&self, n: NodePtr, d: Dir) -> NodePtr {
        if n == self.nil {
            self.nil
        } else {
            NodePtr(unsafe { (*n.0).link[d as usize] })
        }
    }

    fn set_link(&self, n: NodePtr, d: Dir, m: NodePtr) {
        if n != self.nil {
            unsafe { (*n.0).link[d as usize] = m.0 }
        }
    }

    fn parent(&self, n: NodePtr) -> NodePtr {
        if n == self.nil {
            self.nil
        } else {
            NodePtr(unsafe { (*n.0).parent })
        }
    }

    fn set_parent(&self, n: NodePtr, p: NodePtr) {
        if n != self.nil {
            unsafe { (*n.0).parent = p.0 }
        }
    }

    fn is_red(&self, n: NodePtr) -> bool {
        n != self.nil && unsafe { Self::block_of(n) }.color() == Color::Red
    }

    fn is_black(&self, n: NodePtr) -> bool {
        !self.is_red(n)
    }

    fn paint(&self, n: NodePtr, color: Color) {
        if n != self.nil {
            unsafe { Self::block_of(n) }.paint(color);
        }
    }

    fn paint_like(&self, n: NodePtr, m: NodePtr) {
        let color = if self.is_red(m) { Color::Red } else { Color::Black };
        self.paint(n, color);
    }

    fn dir_of(&self, parent: NodePtr, child: NodePtr) -> Dir {
        if self.link(parent, Right) == child {
            Right
        } else {
            Left
        }
    }

    fn min_node(&self, mut n: NodePtr) -> NodePtr {
        loop {
            let l = self.link(n, Left);
            if l == self.nil {
                return n;
            }
            n = l;
        }
    }

    // Rotate `x` downward in direction `d`; its child on the other side
    // rises into x's place, parent pointers and the root included.
    unsafe fn rotate(&mut self, x: NodePtr, d: Dir) {
        let y = self.link(x, d.flip());
        extra_assert!(y != self.nil);
        let middle = self.link(y, d);
        self.set_link(x, d.flip(), middle);
        self.set_parent(middle, x);
        let xp = self.parent(x);
        self.set_parent(y, xp);
        if xp == self.nil {
            self.root = y;
        } else {
            let xd = self.dir_of(xp, x);
            self.set_link(xp, xd, y);
        }
        self.set_link(y, d, x);
        self.set_parent(x, y);
        self.rotations += 1;
    }

    unsafe fn insert_fixup(&mut self, mut n: NodePtr) {
        while self.is_red(self.parent(n)) {
            let p = self.parent(n);
            let g = self.parent(p);
            extra_assert!(g != self.nil);
            let pdir = self.dir_of(g, p);
            let uncle = self.link(g, pdir.flip());
            if self.is_red(uncle) {
                self.paint(p, Color::Black);
                self.paint(uncle, Color::Black);
                self.paint(g, Color::Red);
                n = g;
            } else {
                if n == self.link(p, pdir.flip()) {
                    n = p;
                    self.rotate(n, pdir);
                }
                let p = self.parent(n);
                let g = self.parent(p);
                self.paint(p, Color::Black);
                self.paint(g, Color::Red);
                self.rotate(g, pdir.flip());
            }
        }
        self.paint(self.root, Color::Black);
    }

    // Hang `v` where `u` hangs. Does not touch v's children; when v is nil
    // the caller carries the parent itself.
    unsafe fn transplant(&mut self, u: NodePtr, v: NodePtr) {
        let p = self.parent(u);
        if p == self.nil {
            self.root = v;
        } else {
            let d = self.dir_of(p, u);
            self.set_link(p, d, v);
        }
        self.set_parent(v, p);
    }

    unsafe fn delete(&mut self, z: NodePtr) {
        let mut removed_black = self.is_black(z);
        let x;
        let x_parent;
        if self.link(z, Left) == self.nil {
            x = self.link(z, Right);
            x_parent = self.parent(z);
            self.transplant(z, x);
        } else if self.link(z, Right) == self.nil {
            x = self.link(z, Left);
            x_parent = self.parent(z);
            self.transplant(z, x);
        } else {
            let y = self.min_node(self.link(z, Right));
            removed_black = self.is_black(y);
            x = self.link(y, Right);
            if self.parent(y) == z {
                x_parent = y;
            } else {
                x_parent = self.parent(y);
                self.transplant(y, x);
                self.set_link(y, Right, self.link(z, Right));
                self.set_parent(self.link(y, Right), y);
            }
            self.transplant(z, y);
            self.set_link(y, Left, self.link(z, Left));
            self.set_parent(self.link(y, Left), y);
            self.paint_like(y, z);
        }
        if removed_black {
            self.delete_fixup(x, x_parent);
        }
    }

    // `x` may be nil, so the current parent rides along explicitly instead
    // of being read back out of the sentinel.
    unsafe fn delete_fixup(&mut self, mut x: NodePtr, mut p: NodePtr) {
        while x != self.root && self.is_black(x) {
            extra_assert!(p != self.nil);
            let dir = self.dir_of(p, x);
            let mut sib = self.link(p, dir.flip());
            if self.is_red(sib) {
                self.paint(sib, Color::Black);
                self.paint(p, Color::Red);
                self.rotate(p, dir);
                sib = self.link(p, dir.flip());
            }
            if self.is_black(self.link(sib, Left)) && self.is_black(self.link(sib, Right)) {
                self.paint(sib, Color::Red);
                x = p;
                p = self.parent(x);
            } else {
                if self.is_black(self.link(sib, dir.flip())) {
                    self.paint(self.link(sib, dir), Color::Black);
                    self.paint(sib, Color::Red);
                    self.rotate(sib, dir.flip());
                    sib = self.link(p, dir.flip());
                }
                self.paint_like(sib, p);
                self.paint(p, Color::Black);
                self.paint(self.link(sib, dir.flip()), Color::Black);
                self.rotate(p, dir);
                x = self.root;
            }
        }
        self.paint(x, Color::Black);
    }

    fn walk_node(&self, n: NodePtr, visit: &mut dyn FnMut(Block) -> bool) -> bool {
        if n == self.nil {
            return true;
        }
        if !self.walk_node(self.link(n, Left), visit) {
            return false;
        }
        if !visit(unsafe { Self::block_of(n) }) {
            return false;
        }
        self.walk_node(self.link(n, Right), visit)
    }

    // Black height of the subtree, or None on any violated property.
    fn check_node(
        &self,
        n: NodePtr,
        lo: Option<(usize, usize)>,
        hi: Option<(usize, usize)>,
        depth: usize,
    ) -> Option<usize> {
        if n == self.nil {
            return Some(1);
        }
        if depth > MAX_PLAUSIBLE_DEPTH {
            return None;
        }
        let block = unsafe { Self::block_of(n) };
        if block.is_allocated() {
            return None;
        }
        let key = (block.size().0, block.addr());
        if let Some(lo) = lo {
            if key <= lo {
                return None;
            }
        }
        if let Some(hi) = hi {
            if key >= hi {
                return None;
            }
        }
        let l = self.link(n, Left);
        let r = self.link(n, Right);
        if l != self.nil && self.parent(l) != n {
            return None;
        }
        if r != self.nil && self.parent(r) != n {
            return None;
        }
        if self.is_red(n) && (self.is_red(l) || self.is_red(r)) {
            return None;
        }
        let lh = self.check_node(l, lo, Some(key), depth + 1)?;
        let rh = self.check_node(r, Some(key), hi, depth + 1)?;
        if lh != rh {
            return None;
        }
        Some(lh + if self.is_black(n) { 1 } else { 0 })
    }

    fn write_node(
        &self,
        f: &mut fmt::Formatter,
        n: NodePtr,
        depth: usize,
        verbosity: Verbosity,
    ) -> fmt::Result {
        if n == self.nil {
            return Ok(());
        }
        self.write_node(f, self.link(n, Right), depth + 1, verbosity)?;
        let block = unsafe { Self::block_of(n) };
        let tag = if self.is_red(n) { 'r' } else { 'b' };
        write!(f, "  ")?;
        for _ in 0..depth {
            write!(f, "    ")?;
        }
        match verbosity {
            Verbosity::Sizes => writeln!(f, "{}{}", block.size().0, tag)?,
            Verbosity::Addresses => {
                writeln!(f, "{}{} @ {:#x}", block.size().0, tag, block.addr())?
            }
        }
        self.write_node(f, self.link(n, Left), depth + 1, verbosity)
    }
}

unsafe impl FreeIndex for RbParentTree {
    const NODE_BYTES: usize = 3 * WORD_SIZE;

    unsafe fn init(nil: Block) -> Self {
        let nil = NodePtr(nil.node::<TreeNode>());
        RbParentTree {
            nil: nil,
            root: nil,
            rotations: 0,
        }
    }

    unsafe fn insert(&mut self, block: Block) {
        let n = Self::node_of(block);
        (*n.0).link = [self.nil.0; 2];
        (*n.0).parent = self.nil.0;
        let key = (block.size().0, block.addr());
        let mut parent = self.nil;
        let mut cur = self.root;
        let mut dir = Left;
        while cur != self.nil {
            parent = cur;
            dir = if key < self.key_of(cur) { Left } else { Right };
            cur = self.link(cur, dir);
        }
        if parent == self.nil {
            self.root = n;
        } else {
            self.set_link(parent, dir, n);
        }
        self.set_parent(n, parent);
        block.paint(Color::Red);
        self.insert_fixup(n);
    }

    unsafe fn best_fit_pop(&mut self, request: Bytes) -> Option<Block> {
        let mut best = self.nil;
        let mut cur = self.root;
        while cur != self.nil {
            if Self::block_of(cur).size() >= request {
                best = cur;
                cur = self.link(cur, Left);
            } else {
                cur = self.link(cur, Right);
            }
        }
        if best == self.nil {
            return None;
        }
        let block = Self::block_of(best);
        self.delete(best);
        Some(block)
    }

    unsafe fn remove(&mut self, block: Block) {
        // Identity is the node itself; parent pointers make a search
        // unnecessary.
        self.delete(Self::node_of(block));
    }

    fn walk(&self, visit: &mut dyn FnMut(Block) -> bool) -> bool {
        self.walk_node(self.root, visit)
    }

    fn check(&self) -> bool {
        if self.root == self.nil {
            return true;
        }
        if self.is_red(self.root) {
            return false;
        }
        if self.parent(self.root) != self.nil {
            return false;
        }
        self.check_node(self.root, None, None, 0).is_some()
    }

    fn rotation_count(&self) -> u64 {
        self.rotations
    }

    fn write_structure(&self, f: &mut fmt::Formatter, verbosity: Verbosity) -> fmt::Result {
        writeln!(f, "size tree (parent-linked):")?;
        if self.root == self.nil {
            return writeln!(f, "  (empty)");
        }
        self.write_node(f, self.root, 0, verbosity)
    }
}

#[test]
fn tree_node_layout() {
    assert_eq!(
        ::core::mem::size_of::<TreeNode>(),
        RbParentTree::NODE_BYTES,
        "free blocks reserve exactly NODE_BYTES for tree links"
    );
}
