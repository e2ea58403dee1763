//! A parentless red-black tree driven by an explicit descent stack.
//!
//! Nodes carry only two child links and the duplicate-list pointer; every
//! mutating operation records its root-to-node descent in a fixed-capacity
//! stack in its own frame and consults that instead of parent pointers.
//! Because rotations reshuffle which nodes occupy which positions near the
//! path's tail, the mutations repair the stack as they rotate: the rotated-up
//! node replaces the rotated-down one at its slot.
//!
//! Duplicates live off-tree exactly as in the parent-linked duplicate tree.
//! That is load-bearing here, not an optimization: removal by address (which
//! coalescing needs) would otherwise have no unambiguous descent to reach an
//! equal-sized subordinate.

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

// Deep enough for 2*log2(node count) on any heap this allocator can index.
const MAX_DEPTH: usize = 50;

#[repr(C)]
struct TreeNode {
    link: [*mut TreeNode; 2],
    dup: *mut TreeNode,
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct NodePtr(*mut TreeNode);

// The descent stack: ancestors of the node in hand, root first, the node
// itself excluded.
struct Path {
    nodes: [NodePtr; MAX_DEPTH],
    len: usize,
}

impl Path {
    fn new(nil: NodePtr) -> Path {
        Path {
            nodes: [nil; MAX_DEPTH],
            len: 0,
        }
    }

    fn push(&mut self, n: NodePtr) {
        debug_assert!(self.len < MAX_DEPTH);
        self.nodes[self.len] = n;
        self.len += 1;
    }

    fn top_or(&self, nil: NodePtr) -> NodePtr {
        if self.len == 0 {
            nil
        } else {
            self.nodes[self.len - 1]
        }
    }
}

/// Parentless red-black tree keyed by size, fixed up through a caller-frame
/// descent stack, with off-tree duplicate lists.
pub struct RbStackTree {
    nil: NodePtr,
    root: NodePtr,
    rotations: u64,
}

impl RbStackTree {
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

    fn replace_child(&mut self, parent: NodePtr, old: NodePtr, new: NodePtr) {
        if parent == self.nil {
            extra_assert!(self.root == old);
            self.root = new;
        } else {
            let d = self.dir_of(parent, old);
            self.set_link(parent, d, new);
        }
    }

    // Rotate `n` downward in direction `d` and return the risen child. The
    // caller links the result into n's old parent slot (and the stack).
    unsafe fn rotate(&mut self, n: NodePtr, d: Dir) -> NodePtr {
        let m = self.link(n, d.flip());
        extra_assert!(m != self.nil);
        self.set_link(n, d.flip(), self.link(m, d));
        self.set_link(m, d, n);
        self.rotations += 1;
        m
    }

    fn find_with_path(&self, size: usize, path: &mut Path) -> Option<NodePtr> {
        let mut cur = self.root;
        while cur != self.nil {
            let csize = self.size_of(cur);
            if csize == size {
                return Some(cur);
            }
            path.push(cur);
            cur = self.link(cur, if size < csize { Left } else { Right });
        }
        None
    }

    unsafe fn insert_fixup(&mut self, mut n: NodePtr, path: &mut Path) {
        loop {
            if path.len == 0 {
                self.root = n;
                break;
            }
            let p = path.nodes[path.len - 1];
            if self.is_black(p) {
                break;
            }
            // A red parent is never the root, so a grandparent exists.
            extra_assert!(path.len >= 2);
            let g = path.nodes[path.len - 2];
            let pdir = self.dir_of(g, p);
            let uncle = self.link(g, pdir.flip());
            if self.is_red(uncle) {
                self.paint(p, Color::Black);
                self.paint(uncle, Color::Black);
                self.paint(g, Color::Red);
                n = g;
                path.len -= 2;
                continue;
            }
            let above = if path.len >= 3 {
                path.nodes[path.len - 3]
            } else {
                self.nil
            };
            let ndir = self.dir_of(p, n);
            let top = if ndir != pdir {
                let mid = self.rotate(p, pdir);
                extra_assert!(mid == n);
                self.set_link(g, pdir, mid);
                self.rotate(g, pdir.flip())
            } else {
                self.rotate(g, pdir.flip())
            };
            self.paint(top, Color::Black);
            self.paint(g, Color::Red);
            self.replace_child(above, g, top);
            break;
        }
        self.paint(self.root, Color::Black);
    }

    // `path` holds the ancestors of `z`. On return the tree is rebalanced.
    unsafe fn delete(&mut self, z: NodePtr, path: &mut Path) {
        extra_assert!(self.dup_head(z) == self.nil);
        let removed_black;
        let x;
        if self.link(z, Left) == self.nil || self.link(z, Right) == self.nil {
            let d = if self.link(z, Left) == self.nil {
                Right
            } else {
                Left
            };
            x = self.link(z, d);
            removed_black = self.is_black(z);
            let above = path.top_or(self.nil);
            self.replace_child(above, z, x);
        } else {
            // Two children: splice in the in-order successor by re-linking
            // (addresses are block identities, so no field copying), and fix
            // the stack slot where z sat.
            let zi = path.len;
            path.push(z);
            let mut y = self.link(z, Right);
            while self.link(y, Left) != self.nil {
                path.push(y);
                y = self.link(y, Left);
            }
            removed_black = self.is_black(y);
            x = self.link(y, Right);
            let zparent = if zi == 0 { self.nil } else { path.nodes[zi - 1] };
            if y == self.link(z, Right) {
                self.set_link(y, Left, self.link(z, Left));
                self.replace_child(zparent, z, y);
            } else {
                let yp = path.nodes[path.len - 1];
                self.set_link(yp, Left, x);
                self.set_link(y, Left, self.link(z, Left));
                self.set_link(y, Right, self.link(z, Right));
                self.replace_child(zparent, z, y);
            }
            self.paint_like(y, z);
            path.nodes[zi] = y;
        }
        if removed_black {
            self.delete_fixup(x, path);
        }
    }

    unsafe fn delete_fixup(&mut self, mut x: NodePtr, path: &mut Path) {
        while x != self.root && self.is_black(x) {
            extra_assert!(path.len > 0);
            let p = path.nodes[path.len - 1];
            let dir = if self.link(p, Left) == x { Left } else { Right };
            let mut sib = self.link(p, dir.flip());
            if self.is_red(sib) {
                self.paint(sib, Color::Black);
                self.paint(p, Color::Red);
                let above = if path.len >= 2 {
                    path.nodes[path.len - 2]
                } else {
                    self.nil
                };
                let top = self.rotate(p, dir);
                self.replace_child(above, p, top);
                // The risen sibling takes p's stack slot; p stays x's parent.
                path.nodes[path.len - 1] = top;
                path.push(p);
                sib = self.link(p, dir.flip());
            }
            if self.is_black(self.link(sib, Left)) && self.is_black(self.link(sib, Right)) {
                self.paint(sib, Color::Red);
                x = p;
                path.len -= 1;
            } else {
                if self.is_black(self.link(sib, dir.flip())) {
                    self.paint(self.link(sib, dir), Color::Black);
                    self.paint(sib, Color::Red);
                    let top = self.rotate(sib, dir.flip());
                    self.set_link(p, dir.flip(), top);
                    sib = top;
                }
                self.paint_like(sib, p);
                self.paint(p, Color::Black);
                self.paint(self.link(sib, dir.flip()), Color::Black);
                let above = if path.len >= 2 {
                    path.nodes[path.len - 2]
                } else {
                    self.nil
                };
                let top = self.rotate(p, dir);
                self.replace_child(above, p, top);
                x = self.root;
            }
        }
        self.paint(x, Color::Black);
    }

    fn dup_list_ok(&self, owner: NodePtr) -> bool {
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

unsafe impl FreeIndex for RbStackTree {
    const NODE_BYTES: usize = 3 * WORD_SIZE;

    unsafe fn init(nil: Block) -> Self {
        let nil = NodePtr(nil.node::<TreeNode>());
        RbStackTree {
            nil: nil,
            root: nil,
            rotations: 0,
        }
    }

    unsafe fn insert(&mut self, block: Block) {
        let n = Self::node_of(block);
        (*n.0).link = [self.nil.0; 2];
        (*n.0).dup = self.nil.0;
        let size = block.size().0;
        let mut path = Path::new(self.nil);
        let mut cur = self.root;
        let mut dir = Left;
        while cur != self.nil {
            let csize = self.size_of(cur);
            if csize == size {
                let head = self.dup_head(cur);
                (*n.0).link = [cur.0, head.0];
                self.set_link(head, PREV, n);
                self.set_dup(cur, n);
                return;
            }
            dir = if size < csize { Left } else { Right };
            path.push(cur);
            cur = self.link(cur, dir);
        }
        if path.len == 0 {
            self.root = n;
            block.paint(Color::Black);
            return;
        }
        self.set_link(path.nodes[path.len - 1], dir, n);
        block.paint(Color::Red);
        self.insert_fixup(n, &mut path);
    }

    unsafe fn best_fit_pop(&mut self, request: Bytes) -> Option<Block> {
        let mut path = Path::new(self.nil);
        let mut best = self.nil;
        let mut best_len = 0;
        let mut cur = self.root;
        while cur != self.nil {
            if self.size_of(cur) >= request.0 {
                best = cur;
                best_len = path.len;
                path.push(cur);
                cur = self.link(cur, Left);
            } else {
                path.push(cur);
                cur = self.link(cur, Right);
            }
        }
        if best == self.nil {
            return None;
        }
        let head = self.dup_head(best);
        if head != self.nil {
            let next = self.link(head, NEXT);
            self.set_dup(best, next);
            self.set_link(next, PREV, best);
            return Some(Self::block_of(head));
        }
        let block = Self::block_of(best);
        path.len = best_len;
        self.delete(best, &mut path);
        Some(block)
    }

    unsafe fn remove(&mut self, block: Block) {
        let size = block.size().0;
        let mut path = Path::new(self.nil);
        let owner = unchecked_unwrap(self.find_with_path(size, &mut path));
        let n = Self::node_of(block);
        if owner != n {
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
            // Promote the first duplicate into owner's slot by adoption.
            let rest = self.link(head, NEXT);
            (*head.0).link = [(*owner.0).link[0], (*owner.0).link[1]];
            self.set_dup(head, rest);
            self.set_link(rest, PREV, head);
            self.paint_like(head, owner);
            let above = path.top_or(self.nil);
            self.replace_child(above, owner, head);
            return;
        }
        self.delete(owner, &mut path);
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
        self.check_node(self.root, None, None, 0).is_some()
    }

    fn rotation_count(&self) -> u64 {
        self.rotations
    }

    fn write_structure(&self, f: &mut fmt::Formatter, verbosity: Verbosity) -> fmt::Result {
        writeln!(f, "size tree (stack-tracked):")?;
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
        RbStackTree::NODE_BYTES,
        "free blocks reserve exactly NODE_BYTES for tree links"
    );
}
