//! A parentless red-black tree fixed up top-down, on the way to the point of
//! mutation.
//!
//! No parent pointers and no descent stack: insertion and deletion each walk
//! down once, holding only a sliding `{ancestor, grandparent, parent,
//! current}` window rooted at a stack-local false root. The insertion descent
//! color-flips and rotates preemptively so the attach point never creates a
//! red-red pair above it; the deletion descent pushes a red down the tree so
//! the node finally spliced out is red and no bottom-up fix-up is owed.
//!
//! Two allocator-specific departures from the published algorithm: the
//! deletion target is re-located by its (unique) size after the duplicate
//! cases are peeled off, and the final transplant re-links the in-order
//! predecessor into the target's position instead of copying payload fields,
//! because a block's address is its identity.
//!
//! Duplicates live off-tree as in the other parentless trees, and for the
//! same reason: removal by address needs an unambiguous path.

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
    dup: *mut TreeNode,
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct NodePtr(*mut TreeNode);

/// Parentless red-black tree keyed by size, fixed top-down, with off-tree
/// duplicate lists.
pub struct RbTopDownTree {
    nil: NodePtr,
    root: NodePtr,
    rotations: u64,
}

impl RbTopDownTree {
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

    fn paint(&self, n: NodePtr, color: Color) {
        if n != self.nil {
            unsafe { Self::block_of(n) }.paint(color);
        }
    }

    fn paint_like(&self, n: NodePtr, m: NodePtr) {
        let color = if self.is_red(m) { Color::Red } else { Color::Black };
        self.paint(n, color);
    }

    fn is_black(&self, n: NodePtr) -> bool {
        !self.is_red(n)
    }

    fn find(&self, size: usize) -> Option<NodePtr> {
        let mut cur = self.root;
        while cur != self.nil {
            let csize = self.size_of(cur);
            if csize == size {
                return Some(cur);
            }
            cur = self.link(cur, if size < csize { Left } else { Right });
        }
        None
    }

    // Rotate with the top-down recoloring baked in: the descending node
    // turns red, the risen child black.
    unsafe fn single(&mut self, n: NodePtr, d: Dir) -> NodePtr {
        let m = self.link(n, d.flip());
        extra_assert!(m != self.nil);
        self.set_link(n, d.flip(), self.link(m, d));
        self.set_link(m, d, n);
        self.paint(n, Color::Red);
        self.paint(m, Color::Black);
        self.rotations += 1;
        m
    }

    unsafe fn double(&mut self, n: NodePtr, d: Dir) -> NodePtr {
        let sub = self.single(self.link(n, d.flip()), d.flip());
        self.set_link(n, d.flip(), sub);
        self.single(n, d)
    }

    // The parent of `f`, descending from the false root so the caller can
    // re-link even when f is the tree root.
    unsafe fn parent_of_from(&self, head: NodePtr, f: NodePtr) -> NodePtr {
        let fsize = self.size_of(f);
        let mut cur = head;
        let mut dir = Right;
        loop {
            let next = self.link(cur, dir);
            extra_assert!(next != self.nil);
            if next == f {
                return cur;
            }
            cur = next;
            dir = if fsize < self.size_of(cur) { Left } else { Right };
        }
    }

    // Remove the tree node owning `size` (unique, and known to exist with an
    // empty duplicate list).
    unsafe fn delete_tree_node(&mut self, size: usize) {
        extra_assert!(self.root != self.nil);
        let mut head = TreeNode {
            link: [self.nil.0, self.root.0],
            dup: self.nil.0,
        };
        let head_ptr = NodePtr(&mut head as *mut TreeNode);
        let mut q = head_ptr;
        let mut p = self.nil;
        let mut g = self.nil;
        let mut f = self.nil;
        let mut dir = Right;
        while self.link(q, dir) != self.nil {
            let last = dir;
            g = p;
            p = q;
            q = self.link(q, dir);
            let qsize = self.size_of(q);
            dir = if qsize < size { Right } else { Left };
            if qsize == size {
                f = q;
            }
            // Push a red down alongside the descent so the node we finally
            // splice out is red.
            if !self.is_red(q) && !self.is_red(self.link(q, dir)) {
                if self.is_red(self.link(q, dir.flip())) {
                    let sub = self.single(q, dir);
                    self.set_link(p, last, sub);
                    p = sub;
                } else {
                    let s = self.link(p, last.flip());
                    if s != self.nil {
                        if !self.is_red(self.link(s, last.flip()))
                            && !self.is_red(self.link(s, last))
                        {
                            // Color flip.
                            self.paint(p, Color::Black);
                            self.paint(s, Color::Red);
                            self.paint(q, Color::Red);
                        } else {
                            let dir2 = if self.link(g, Right) == p { Right } else { Left };
                            let sub = if self.is_red(self.link(s, last)) {
                                self.double(p, last)
                            } else {
                                self.single(p, last)
                            };
                            self.set_link(g, dir2, sub);
                            self.paint(q, Color::Red);
                            self.paint(sub, Color::Red);
                            self.paint(self.link(sub, Left), Color::Black);
                            self.paint(self.link(sub, Right), Color::Black);
                        }
                    }
                }
            }
        }
        extra_assert!(f != self.nil);
        // Splice out q, the last node on the search path (f's in-order
        // predecessor when f sits higher up), then re-link it into f's
        // position. Addresses are identities; no field copying.
        let qd = if self.link(q, Left) == self.nil {
            Right
        } else {
            Left
        };
        let pd = if self.link(p, Right) == q { Right } else { Left };
        self.set_link(p, pd, self.link(q, qd));
        if f != q {
            let fp = self.parent_of_from(head_ptr, f);
            self.set_link(q, Left, self.link(f, Left));
            self.set_link(q, Right, self.link(f, Right));
            self.paint_like(q, f);
            let fd = if self.link(fp, Right) == f { Right } else { Left };
            self.set_link(fp, fd, q);
        }
        self.root = self.link(head_ptr, Right);
        self.paint(self.root, Color::Black);
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

unsafe impl FreeIndex for RbTopDownTree {
    const NODE_BYTES: usize = 3 * WORD_SIZE;

    unsafe fn init(nil: Block) -> Self {
        let nil = NodePtr(nil.node::<TreeNode>());
        RbTopDownTree {
            nil: nil,
            root: nil,
            rotations: 0,
        }
    }

    unsafe fn insert(&mut self, block: Block) {
        let n = Self::node_of(block);
        (*n.0).link = [self.nil.0; 2];
        (*n.0).dup = self.nil.0;
        if self.root == self.nil {
            self.root = n;
            block.paint(Color::Black);
            return;
        }
        let size = block.size().0;
        // False tree root on the stack; only its links are ever touched.
        let mut head = TreeNode {
            link: [self.nil.0, self.root.0],
            dup: self.nil.0,
        };
        let head_ptr = NodePtr(&mut head as *mut TreeNode);
        let mut t = head_ptr;
        let mut g = self.nil;
        let mut p = self.nil;
        let mut q = self.root;
        let mut dir = Right;
        let mut last = Right;
        loop {
            if q == self.nil {
                // The attach point.
                q = n;
                block.paint(Color::Red);
                self.set_link(p, dir, q);
            } else if self.is_red(self.link(q, Left)) && self.is_red(self.link(q, Right)) {
                // Color flip on the way down.
                self.paint(q, Color::Red);
                self.paint(self.link(q, Left), Color::Black);
                self.paint(self.link(q, Right), Color::Black);
            }
            if self.is_red(q) && self.is_red(p) {
                let dir2 = if self.link(t, Right) == g { Right } else { Left };
                let sub = if q == self.link(p, last) {
                    self.single(g, last.flip())
                } else {
                    self.double(g, last.flip())
                };
                self.set_link(t, dir2, sub);
            }
            if q == n {
                break;
            }
            let qsize = self.size_of(q);
            if qsize == size {
                // Existing size: head the duplicate list. The fixes already
                // made on the way down stand on their own.
                let dup = self.dup_head(q);
                (*n.0).link = [q.0, dup.0];
                self.set_link(dup, PREV, n);
                self.set_dup(q, n);
                break;
            }
            last = dir;
            dir = if size < qsize { Left } else { Right };
            if g != self.nil {
                t = g;
            }
            g = p;
            p = q;
            q = self.link(q, dir);
        }
        self.root = self.link(head_ptr, Right);
        self.paint(self.root, Color::Black);
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
            let next = self.link(head, NEXT);
            self.set_dup(best, next);
            self.set_link(next, PREV, best);
            return Some(Self::block_of(head));
        }
        let block = Self::block_of(best);
        self.delete_tree_node(block.size().0);
        Some(block)
    }

    unsafe fn remove(&mut self, block: Block) {
        let size = block.size().0;
        let owner = unchecked_unwrap(self.find(size));
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
            if owner == self.root {
                self.root = head;
            } else {
                let mut fp = self.root;
                loop {
                    let d = if size < self.size_of(fp) { Left } else { Right };
                    let next = self.link(fp, d);
                    extra_assert!(next != self.nil);
                    if next == owner {
                        self.set_link(fp, d, head);
                        break;
                    }
                    fp = next;
                }
            }
            return;
        }
        self.delete_tree_node(size);
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
        writeln!(f, "size tree (top-down):")?;
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
        RbTopDownTree::NODE_BYTES,
        "free blocks reserve exactly NODE_BYTES for tree links"
    );
}
