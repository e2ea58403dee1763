//! A red-black tree with duplicate sizes pulled out into per-size lists.
//!
//! The tree proper holds exactly one node per distinct payload size. Further
//! blocks of the same size hang off that node's `dup` pointer as a
//! doubly-linked list, so the common churn of equal-sized blocks -- and the
//! coalescing removals that hit them -- never rotates or recolors anything.
//!
//! A duplicate reuses its `link` words as list prev/next; the head's prev is
//! the owning tree node itself, which makes splicing the head out the same
//! one-branch operation as any other member.

use core::fmt;

use header::{Block, Color, WORD_SIZE};
use index::Dir::{Left, Right};
use index::{unchecked_unwrap, Dir, FreeIndex};
use memory_units::Bytes;
use validate::Verbosity;

const MAX_PLAUSIBLE_DEPTH: usize = 64;

// List roles of the `link` array when a node lives on a duplicate list.
const PREV: Dir = Dir::Left;
const NEXT: Dir = Dir::Right;

#[repr(C)]
struct TreeNode {
    link: [*mut TreeNode; 2],
    parent: *mut TreeNode,
    dup: *mut TreeNode,
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct NodePtr(*mut TreeNode);

/// Red-black tree keyed by size, with off-tree duplicate lists.
pub struct RbDupTree {
    nil: NodePtr,
    root: NodePtr,
    rotations: u64,
}

impl RbDupTree {
    fn node_of(block: Block) -> NodePtr {
        NodePtr(block.node::<TreeNode>())
    }

    unsafe fn block_of(n: NodePtr) -> Block {
        Block::from_node(n.0)
    }

    fn size_of(&self, n: NodePtr) -> usize {
        extra_assert!(n != self.nil);
        unsafe { Self::block_of(n) }.size().0
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

    fn dup_head(&self, n: NodePtr) -> NodePtr {
        if n == self.nil {
            self.nil
        } else {
            NodePtr(unsafe { (*n.0).dup })
        }
    }

    fn set_dup(&self, n: NodePtr, m: NodePtr) {
        if n != self.nil {
            unsafe { (*n.0).dup = m.0 }
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

    // The tree node owning `size`, if any.
    fn find(&self, size: usize) -> Option<NodePtr> {
        let mut cur = self.root;
        while cur != self.nil {
            let csize = self.size_of(cur);
            if size == csize {
                return Some(cur);
            }
            cur = self.link(cur, if size < csize { Left } else { Right });
        }
        None
    }

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

    // Promote the first duplicate into the tree slot of `owner`. Pure field
    // adoption; no rotation, no recolor beyond inheriting owner's color.
    unsafe fn promote(&mut self, owner: NodePtr, head: NodePtr) {
        let rest = self.link(head, NEXT);
        let l = self.link(owner, Left);
        let r = self.link(owner, Right);
        let p = self.parent(owner);
        (*head.0).link = [l.0, r.0];
        self.set_parent(l, head);
        self.set_parent(r, head);
        (*head.0).parent = p.0;
        if p == self.nil {
            self.root = head;
        } else {
            let d = self.dir_of(p, owner);
            self.set_link(p, d, head);
        }
        self.set_dup(head, rest);
        self.set_link(rest, PREV, head);
        self.paint_like(head, owner);
    }

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

    // Classical deletion; only reached when `z` has no duplicates left. A
    // successor that owns duplicates keeps them, since it keeps its size.
    unsafe fn delete(&mut self, z: NodePtr) {
        extra_assert!(self.dup_head(z) == self.nil);
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

    fn dup_list_ok(&self, owner: NodePtr) -> bool {
        // Cycle check first, then membership.
        let mut slow = self.dup_head(owner);
        let mut fast = slow;
        loop {
            fast = self.link(fast, NEXT);
            if fast == self.nil {
                break;
            }
            fast = self.link(fast, NEXT);
            slow = self.link(slow, NEXT);
            if fast == self.nil {
                break;
            }
            if slow == fast {
                return false;
            }
        }
        let size = self.size_of(owner);
        let mut prev = owner;
        let mut n = self.dup_head(owner);
        while n != self.nil {
            let block = unsafe { Self::block_of(n) };
            if block.is_allocated() || block.size().0 != size {
                return false;
            }
            if self.link(n, PREV) != prev {
                return false;
            }
            prev = n;
            n = self.link(n, NEXT);
        }
        true
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
        let mut d = self.dup_head(n);
        while d != self.nil {
            if !visit(unsafe { Self::block_of(d) }) {
                return false;
            }
            d = self.link(d, NEXT);
        }
        self.walk_node(self.link(n, Right), visit)
    }

    fn check_node(
        &self,
        n: NodePtr,
        lo: Option<usize>,
        hi: Option<usize>,
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
        let size = block.size().0;
        if let Some(lo) = lo {
            if size <= lo {
                return None;
            }
        }
        if let Some(hi) = hi {
            if size >= hi {
                return None;
            }
        }
        if !self.dup_list_ok(n) {
            return None;
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
        let lh = self.check_node(l, lo, Some(size), depth + 1)?;
        let rh = self.check_node(r, Some(size), hi, depth + 1)?;
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
        let mut dups = 0;
        let mut d = self.dup_head(n);
        while d != self.nil {
            dups += 1;
            d = self.link(d, NEXT);
        }
        write!(f, "  ")?;
        for _ in 0..depth {
            write!(f, "    ")?;
        }
        match verbosity {
            Verbosity::Sizes => write!(f, "{}{}", block.size().0, tag)?,
            Verbosity::Addresses => write!(f, "{}{} @ {:#x}", block.size().0, tag, block.addr())?,
        }
        if dups > 0 {
            write!(f, " +{}", dups)?;
        }
        writeln!(f, "")?;
        self.write_node(f, self.link(n, Left), depth + 1, verbosity)
    }
}

unsafe impl FreeIndex for RbDupTree {
    const NODE_BYTES: usize = 4 * WORD_SIZE;

    unsafe fn init(nil: Block) -> Self {
        let nil = NodePtr(nil.node::<TreeNode>());
        RbDupTree {
            nil: nil,
            root: nil,
            rotations: 0,
        }
    }

    unsafe fn insert(&mut self, block: Block) {
        let n = Self::node_of(block);
        (*n.0).link = [self.nil.0; 2];
        (*n.0).parent = self.nil.0;
        (*n.0).dup = self.nil.0;
        let size = block.size().0;
        let mut parent = self.nil;
        let mut cur = self.root;
        let mut dir = Left;
        while cur != self.nil {
            let csize = self.size_of(cur);
            if csize == size {
                // Equal size: become the head of cur's duplicate list. The
                // tree itself is untouched.
                let head = self.dup_head(cur);
                (*n.0).link = [cur.0, head.0];
                self.set_link(head, PREV, n);
                self.set_dup(cur, n);
                return;
            }
            parent = cur;
            dir = if size < csize { Left } else { Right };
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
            if self.size_of(cur) >= request.0 {
                best = cur;
                cur = self.link(cur, Left);
            } else {
                cur = self.link(cur, Right);
            }
        }
        if best == self.nil {
            return None;
        }
        let head = self.dup_head(best);
        if head != self.nil {
            // Constant time: detach a duplicate, leave the tree alone.
            let next = self.link(head, NEXT);
            self.set_dup(best, next);
            self.set_link(next, PREV, best);
            return Some(Self::block_of(head));
        }
        let block = Self::block_of(best);
        self.delete(best);
        Some(block)
    }

    unsafe fn remove(&mut self, block: Block) {
        let size = block.size().0;
        let owner = unchecked_unwrap(self.find(size));
        let n = Self::node_of(block);
        if owner != n {
            // Off-tree duplicate: splice it out of the list.
            let prev = self.link(n, PREV);
            let next = self.link(n, NEXT);
            if prev == owner {
                self.set_dup(owner, next);
            } else {
                self.set_link(prev, NEXT, next);
            }
            self.set_link(next, PREV, prev);
            return;
        }
        let head = self.dup_head(owner);
        if head != self.nil {
            self.promote(owner, head);
            return;
        }
        self.delete(owner);
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
        writeln!(f, "size tree (duplicates off-tree):")?;
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
        RbDupTree::NODE_BYTES,
        "free blocks reserve exactly NODE_BYTES for tree links"
    );
}
