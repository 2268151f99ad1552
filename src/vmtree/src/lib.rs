//! Arena-backed red-black tree of non-overlapping address ranges, ordered by
//! range start, with an optional "largest range in subtree" augmentation and
//! a parallel doubly-linked list in address order.
//!
//! The augmentation turns "find the lowest-addressed free range that can hold
//! `size` bytes at `align`" into a guided O(log n) descent: a subtree whose
//! cached maximum is too small is never visited. The list exists purely to
//! give O(1) previous/next-by-address lookups for coalescing.
//!
//! Nodes live in an arena and refer to each other by index, so the intrusive
//! pointer surgery stays free of raw pointers and the borrow checker.

use std::marker::PhantomData;

use utils::{bit::align_up, Range};

pub type NodeId = u32;
pub const NIL: NodeId = u32::MAX;

/// Strategy for the per-node cached aggregate. The free-space tree uses
/// [`MaxGap`]; the allocated-range tree carries no aggregate at all.
pub trait Augment {
    const ENABLED: bool;
}

pub struct MaxGap;
impl Augment for MaxGap {
    const ENABLED: bool = true;
}

pub struct NoAugment;
impl Augment for NoAugment {
    const ENABLED: bool = false;
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Color {
    Red,
    Black,
}

struct Node<V> {
    range: Range<u64>,
    // max(own size, left.subtree_max, right.subtree_max); 0 when unused
    subtree_max: u64,
    parent: NodeId,
    left: NodeId,
    right: NodeId,
    prev: NodeId,
    next: NodeId,
    color: Color,
    value: Option<V>,
}

pub struct RangeTree<A: Augment, V> {
    nodes: Vec<Node<V>>,
    free_slots: Vec<NodeId>,
    root: NodeId,
    head: NodeId,
    tail: NodeId,
    len: usize,
    _augment: PhantomData<A>,
}

impl<A: Augment, V: std::fmt::Debug> std::fmt::Debug for RangeTree<A, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut list = f.debug_list();
        let mut id = self.head;
        while id != NIL {
            let n = &self.nodes[id as usize];
            list.entry(&(n.range, n.value.as_ref()));
            id = n.next;
        }
        list.finish()
    }
}

impl<A: Augment, V> Default for RangeTree<A, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Augment, V> RangeTree<A, V> {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free_slots: Vec::new(),
            root: NIL,
            head: NIL,
            tail: NIL,
            len: 0,
            _augment: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn range(&self, id: NodeId) -> Range<u64> {
        self.nodes[id as usize].range
    }

    #[inline]
    pub fn value(&self, id: NodeId) -> &V {
        self.nodes[id as usize].value.as_ref().unwrap()
    }

    #[inline]
    pub fn value_mut(&mut self, id: NodeId) -> &mut V {
        self.nodes[id as usize].value.as_mut().unwrap()
    }

    pub fn first(&self) -> Option<NodeId> {
        if self.head == NIL {
            None
        } else {
            Some(self.head)
        }
    }

    pub fn last(&self) -> Option<NodeId> {
        if self.tail == NIL {
            None
        } else {
            Some(self.tail)
        }
    }

    pub fn next_of(&self, id: NodeId) -> Option<NodeId> {
        match self.nodes[id as usize].next {
            NIL => None,
            n => Some(n),
        }
    }

    pub fn prev_of(&self, id: NodeId) -> Option<NodeId> {
        match self.nodes[id as usize].prev {
            NIL => None,
            n => Some(n),
        }
    }

    /// All ranges in address order. Test and logging helper.
    pub fn ranges(&self) -> Vec<Range<u64>> {
        let mut out = Vec::with_capacity(self.len);
        let mut id = self.head;
        while id != NIL {
            out.push(self.nodes[id as usize].range);
            id = self.nodes[id as usize].next;
        }
        out
    }

    /// The node whose range contains `addr`, if any.
    pub fn find(&self, addr: u64) -> Option<NodeId> {
        let mut id = self.root;
        while id != NIL {
            let n = &self.nodes[id as usize];
            if addr < n.range.start {
                id = n.left;
            } else if addr >= n.range.end {
                id = n.right;
            } else {
                return Some(id);
            }
        }
        None
    }

    /// The lowest-addressed node whose start is >= `addr`.
    pub fn first_at_or_after(&self, addr: u64) -> Option<NodeId> {
        let mut id = self.root;
        let mut best = NIL;
        while id != NIL {
            let n = &self.nodes[id as usize];
            if n.range.start >= addr {
                best = id;
                id = n.left;
            } else {
                id = n.right;
            }
        }
        if best == NIL {
            None
        } else {
            Some(best)
        }
    }

    fn alloc_node(&mut self, range: Range<u64>, value: V) -> NodeId {
        let node = Node {
            range,
            subtree_max: if A::ENABLED { range.len() } else { 0 },
            parent: NIL,
            left: NIL,
            right: NIL,
            prev: NIL,
            next: NIL,
            color: Color::Red,
            value: Some(value),
        };
        match self.free_slots.pop() {
            Some(id) => {
                self.nodes[id as usize] = node;
                id
            }
            None => {
                self.nodes.push(node);
                (self.nodes.len() - 1) as NodeId
            }
        }
    }

    #[inline]
    fn max_of(&self, id: NodeId) -> u64 {
        if id == NIL {
            0
        } else {
            self.nodes[id as usize].subtree_max
        }
    }

    #[inline]
    fn color_of(&self, id: NodeId) -> Color {
        if id == NIL {
            Color::Black
        } else {
            self.nodes[id as usize].color
        }
    }

    // Recomputes one node's aggregate from its own size and its children.
    // Returns false when the stored value was already correct.
    fn recompute(&mut self, id: NodeId) -> bool {
        let n = &self.nodes[id as usize];
        let m = n
            .range
            .len()
            .max(self.max_of(n.left))
            .max(self.max_of(n.right));
        if self.nodes[id as usize].subtree_max == m {
            false
        } else {
            self.nodes[id as usize].subtree_max = m;
            true
        }
    }

    /// Walks from `id` to the root recomputing aggregates, stopping at the
    /// first level whose stored value is already correct: a change that did
    /// not alter this node's aggregate cannot alter any ancestor's.
    fn propagate(&mut self, mut id: NodeId) {
        if !A::ENABLED {
            return;
        }
        while id != NIL {
            if !self.recompute(id) {
                return;
            }
            id = self.nodes[id as usize].parent;
        }
    }

    // Unconditional recompute walk, used after deletions where ancestors'
    // stored values may be stale in either direction.
    fn propagate_all(&mut self, mut id: NodeId) {
        if !A::ENABLED {
            return;
        }
        while id != NIL {
            self.recompute(id);
            id = self.nodes[id as usize].parent;
        }
    }

    fn rotate_left(&mut self, x: NodeId) {
        let y = self.nodes[x as usize].right;
        let y_left = self.nodes[y as usize].left;
        self.nodes[x as usize].right = y_left;
        if y_left != NIL {
            self.nodes[y_left as usize].parent = x;
        }
        let x_parent = self.nodes[x as usize].parent;
        self.nodes[y as usize].parent = x_parent;
        if x_parent == NIL {
            self.root = y;
        } else if self.nodes[x_parent as usize].left == x {
            self.nodes[x_parent as usize].left = y;
        } else {
            self.nodes[x_parent as usize].right = y;
        }
        self.nodes[y as usize].left = x;
        self.nodes[x as usize].parent = y;
        if A::ENABLED {
            self.recompute(x);
            self.recompute(y);
        }
    }

    fn rotate_right(&mut self, x: NodeId) {
        let y = self.nodes[x as usize].left;
        let y_right = self.nodes[y as usize].right;
        self.nodes[x as usize].left = y_right;
        if y_right != NIL {
            self.nodes[y_right as usize].parent = x;
        }
        let x_parent = self.nodes[x as usize].parent;
        self.nodes[y as usize].parent = x_parent;
        if x_parent == NIL {
            self.root = y;
        } else if self.nodes[x_parent as usize].right == x {
            self.nodes[x_parent as usize].right = y;
        } else {
            self.nodes[x_parent as usize].left = y;
        }
        self.nodes[y as usize].right = x;
        self.nodes[x as usize].parent = y;
        if A::ENABLED {
            self.recompute(x);
            self.recompute(y);
        }
    }

    /// Inserts a range, keeping start-address order.
    ///
    /// Panics if the range is empty or overlaps an existing one: callers own
    /// the non-overlap invariant, and a violation means corrupted bookkeeping
    /// upstream, not a recoverable condition.
    pub fn insert(&mut self, range: Range<u64>, value: V) -> NodeId {
        if range.is_empty() || !range.is_well_formed() {
            panic!("invalid range: {:?}", range);
        }

        // Descend to the attachment point, remembering the address-order
        // neighbors so overlap can be rejected before any mutation.
        let mut parent = NIL;
        let mut cur = self.root;
        let mut went_left = false;
        let mut prev = NIL;
        let mut next = NIL;
        while cur != NIL {
            parent = cur;
            let n = &self.nodes[cur as usize];
            if range.start < n.range.start {
                next = cur;
                went_left = true;
                cur = n.left;
            } else {
                prev = cur;
                went_left = false;
                cur = n.right;
            }
        }
        if prev != NIL && self.nodes[prev as usize].range.end > range.start {
            panic!(
                "range {:?} overlaps predecessor {:?}",
                range, self.nodes[prev as usize].range
            );
        }
        if next != NIL && range.end > self.nodes[next as usize].range.start {
            panic!(
                "range {:?} overlaps successor {:?}",
                range, self.nodes[next as usize].range
            );
        }

        let id = self.alloc_node(range, value);
        self.nodes[id as usize].parent = parent;
        if parent == NIL {
            self.root = id;
        } else if went_left {
            self.nodes[parent as usize].left = id;
        } else {
            self.nodes[parent as usize].right = id;
        }

        // List link between prev and next.
        self.nodes[id as usize].prev = prev;
        self.nodes[id as usize].next = next;
        if prev != NIL {
            self.nodes[prev as usize].next = id;
        } else {
            self.head = id;
        }
        if next != NIL {
            self.nodes[next as usize].prev = id;
        } else {
            self.tail = id;
        }

        self.propagate(parent);
        self.insert_fixup(id);
        self.len += 1;
        id
    }

    fn insert_fixup(&mut self, mut z: NodeId) {
        while self.color_of(self.nodes[z as usize].parent) == Color::Red {
            let parent = self.nodes[z as usize].parent;
            let grandparent = self.nodes[parent as usize].parent;
            if parent == self.nodes[grandparent as usize].left {
                let uncle = self.nodes[grandparent as usize].right;
                if self.color_of(uncle) == Color::Red {
                    self.nodes[parent as usize].color = Color::Black;
                    self.nodes[uncle as usize].color = Color::Black;
                    self.nodes[grandparent as usize].color = Color::Red;
                    z = grandparent;
                } else {
                    if z == self.nodes[parent as usize].right {
                        z = parent;
                        self.rotate_left(z);
                    }
                    let parent = self.nodes[z as usize].parent;
                    let grandparent = self.nodes[parent as usize].parent;
                    self.nodes[parent as usize].color = Color::Black;
                    self.nodes[grandparent as usize].color = Color::Red;
                    self.rotate_right(grandparent);
                }
            } else {
                let uncle = self.nodes[grandparent as usize].left;
                if self.color_of(uncle) == Color::Red {
                    self.nodes[parent as usize].color = Color::Black;
                    self.nodes[uncle as usize].color = Color::Black;
                    self.nodes[grandparent as usize].color = Color::Red;
                    z = grandparent;
                } else {
                    if z == self.nodes[parent as usize].left {
                        z = parent;
                        self.rotate_right(z);
                    }
                    let parent = self.nodes[z as usize].parent;
                    let grandparent = self.nodes[parent as usize].parent;
                    self.nodes[parent as usize].color = Color::Black;
                    self.nodes[grandparent as usize].color = Color::Red;
                    self.rotate_left(grandparent);
                }
            }
        }
        let root = self.root;
        self.nodes[root as usize].color = Color::Black;
    }

    fn transplant(&mut self, u: NodeId, v: NodeId) {
        let u_parent = self.nodes[u as usize].parent;
        if u_parent == NIL {
            self.root = v;
        } else if self.nodes[u_parent as usize].left == u {
            self.nodes[u_parent as usize].left = v;
        } else {
            self.nodes[u_parent as usize].right = v;
        }
        if v != NIL {
            self.nodes[v as usize].parent = u_parent;
        }
    }

    fn minimum(&self, mut id: NodeId) -> NodeId {
        while self.nodes[id as usize].left != NIL {
            id = self.nodes[id as usize].left;
        }
        id
    }

    /// Unlinks a node from both the tree and the address list, returning its
    /// range and value. The arena slot is recycled.
    pub fn remove(&mut self, z: NodeId) -> (Range<u64>, V) {
        // List unlink first; the tree surgery below does not consult it.
        let (z_prev, z_next) = {
            let n = &self.nodes[z as usize];
            (n.prev, n.next)
        };
        if z_prev != NIL {
            self.nodes[z_prev as usize].next = z_next;
        } else {
            self.head = z_next;
        }
        if z_next != NIL {
            self.nodes[z_next as usize].prev = z_prev;
        } else {
            self.tail = z_prev;
        }

        let mut y = z;
        let mut y_color = self.nodes[y as usize].color;
        let x;
        let x_parent;
        if self.nodes[z as usize].left == NIL {
            x = self.nodes[z as usize].right;
            x_parent = self.nodes[z as usize].parent;
            self.transplant(z, x);
        } else if self.nodes[z as usize].right == NIL {
            x = self.nodes[z as usize].left;
            x_parent = self.nodes[z as usize].parent;
            self.transplant(z, x);
        } else {
            y = self.minimum(self.nodes[z as usize].right);
            y_color = self.nodes[y as usize].color;
            x = self.nodes[y as usize].right;
            if self.nodes[y as usize].parent == z {
                x_parent = y;
            } else {
                x_parent = self.nodes[y as usize].parent;
                self.transplant(y, x);
                let z_right = self.nodes[z as usize].right;
                self.nodes[y as usize].right = z_right;
                self.nodes[z_right as usize].parent = y;
            }
            self.transplant(z, y);
            let z_left = self.nodes[z as usize].left;
            self.nodes[y as usize].left = z_left;
            self.nodes[z_left as usize].parent = y;
            self.nodes[y as usize].color = self.nodes[z as usize].color;
        }

        if y_color == Color::Black {
            self.remove_fixup(x, x_parent);
        }
        // Ancestors of the removed position may cache a stale maximum in
        // either direction; recompute the whole path. Rotations during the
        // fixup recomputed their own nodes already.
        self.propagate_all(x_parent);

        self.len -= 1;
        let node = &mut self.nodes[z as usize];
        let range = node.range;
        let value = node.value.take().unwrap();
        node.parent = NIL;
        node.left = NIL;
        node.right = NIL;
        node.prev = NIL;
        node.next = NIL;
        self.free_slots.push(z);
        (range, value)
    }

    fn remove_fixup(&mut self, mut x: NodeId, mut x_parent: NodeId) {
        while x != self.root && self.color_of(x) == Color::Black {
            if x_parent == NIL {
                break;
            }
            if x == self.nodes[x_parent as usize].left {
                let mut w = self.nodes[x_parent as usize].right;
                if self.color_of(w) == Color::Red {
                    self.nodes[w as usize].color = Color::Black;
                    self.nodes[x_parent as usize].color = Color::Red;
                    self.rotate_left(x_parent);
                    w = self.nodes[x_parent as usize].right;
                }
                if self.color_of(self.nodes[w as usize].left) == Color::Black
                    && self.color_of(self.nodes[w as usize].right) == Color::Black
                {
                    self.nodes[w as usize].color = Color::Red;
                    x = x_parent;
                    x_parent = self.nodes[x as usize].parent;
                } else {
                    if self.color_of(self.nodes[w as usize].right) == Color::Black {
                        let w_left = self.nodes[w as usize].left;
                        if w_left != NIL {
                            self.nodes[w_left as usize].color = Color::Black;
                        }
                        self.nodes[w as usize].color = Color::Red;
                        self.rotate_right(w);
                        w = self.nodes[x_parent as usize].right;
                    }
                    self.nodes[w as usize].color = self.nodes[x_parent as usize].color;
                    self.nodes[x_parent as usize].color = Color::Black;
                    let w_right = self.nodes[w as usize].right;
                    if w_right != NIL {
                        self.nodes[w_right as usize].color = Color::Black;
                    }
                    self.rotate_left(x_parent);
                    x = self.root;
                    break;
                }
            } else {
                let mut w = self.nodes[x_parent as usize].left;
                if self.color_of(w) == Color::Red {
                    self.nodes[w as usize].color = Color::Black;
                    self.nodes[x_parent as usize].color = Color::Red;
                    self.rotate_right(x_parent);
                    w = self.nodes[x_parent as usize].left;
                }
                if self.color_of(self.nodes[w as usize].left) == Color::Black
                    && self.color_of(self.nodes[w as usize].right) == Color::Black
                {
                    self.nodes[w as usize].color = Color::Red;
                    x = x_parent;
                    x_parent = self.nodes[x as usize].parent;
                } else {
                    if self.color_of(self.nodes[w as usize].left) == Color::Black {
                        let w_right = self.nodes[w as usize].right;
                        if w_right != NIL {
                            self.nodes[w_right as usize].color = Color::Black;
                        }
                        self.nodes[w as usize].color = Color::Red;
                        self.rotate_left(w);
                        w = self.nodes[x_parent as usize].left;
                    }
                    self.nodes[w as usize].color = self.nodes[x_parent as usize].color;
                    self.nodes[x_parent as usize].color = Color::Black;
                    let w_left = self.nodes[w as usize].left;
                    if w_left != NIL {
                        self.nodes[w_left as usize].color = Color::Black;
                    }
                    self.rotate_right(x_parent);
                    x = self.root;
                    break;
                }
            }
        }
        if x != NIL {
            self.nodes[x as usize].color = Color::Black;
        }
    }

    /// Shrinks a range from the left without relinking: start order relative
    /// to the neighbors is unchanged, only the aggregate needs refreshing.
    pub fn adjust_start(&mut self, id: NodeId, new_start: u64) {
        let n = &self.nodes[id as usize];
        debug_assert!(n.range.start < new_start && new_start < n.range.end);
        self.nodes[id as usize].range.start = new_start;
        self.propagate(id);
    }

    /// Shrinks (or, for coalescing, extends) a range from the right.
    pub fn adjust_end(&mut self, id: NodeId, new_end: u64) {
        let n = &self.nodes[id as usize];
        debug_assert!(new_end > n.range.start);
        debug_assert!(n.next == NIL || new_end <= self.nodes[n.next as usize].range.start);
        self.nodes[id as usize].range.end = new_end;
        self.propagate(id);
    }

    /// Finds the lowest-addressed range that can hold `size` bytes aligned to
    /// `align` (a power of two), entirely at or above `low`.
    ///
    /// The descent prefers the left subtree whenever its cached maximum says a
    /// fit may exist there, otherwise tries the current node, then the right
    /// subtree, and finally backtracks through parents to the first ancestor
    /// whose right subtree still qualifies. The `low` restriction means the
    /// backtrack can happen at most once per level.
    pub fn find_lowest_match(&self, size: u64, align: u64, low: u64) -> Option<NodeId> {
        let length = size.checked_add(align - 1)?;
        let mut low = low;
        let mut id = self.root;
        while id != NIL {
            let n = &self.nodes[id as usize];
            if self.max_of(n.left) >= length && low < n.range.start {
                id = n.left;
            } else {
                if self.fits_in(id, size, align, low) {
                    return Some(id);
                }
                if self.max_of(n.right) >= length {
                    id = n.right;
                    continue;
                }
                loop {
                    id = self.nodes[id as usize].parent;
                    if id == NIL {
                        return None;
                    }
                    let n = &self.nodes[id as usize];
                    if self.fits_in(id, size, align, low) {
                        return Some(id);
                    }
                    if self.max_of(n.right) >= length && low <= n.range.start {
                        // Move the bound past this start so an exhausted
                        // right subtree is never re-entered on a later
                        // backtrack through the same ancestor.
                        low = n.range.start + 1;
                        id = n.right;
                        break;
                    }
                }
            }
        }
        None
    }

    /// Whether an aligned block of `size` bytes at or above `low` fits inside
    /// this node's range. Overflow of the aligned start or of start+size is
    /// "does not fit", never a wrap.
    pub fn fits_in(&self, id: NodeId, size: u64, align: u64, low: u64) -> bool {
        let r = self.nodes[id as usize].range;
        let base = r.start.max(low);
        let aligned = match align_up(base, align) {
            Some(a) => a,
            None => return false,
        };
        match aligned.checked_add(size) {
            Some(end) => end <= r.end,
            None => false,
        }
    }

    /// The aligned start address `find_lowest_match` settled on for this node.
    pub fn aligned_start(&self, id: NodeId, align: u64, low: u64) -> Option<u64> {
        let r = self.nodes[id as usize].range;
        align_up(r.start.max(low), align)
    }

    /// Structural self-check: BST order, red-black shape, non-overlap, list
    /// agreement, and the augmentation invariant. Test helper.
    pub fn check(&self) -> anyhow::Result<()> {
        if self.root == NIL {
            if self.len != 0 || self.head != NIL || self.tail != NIL {
                anyhow::bail!("empty tree with non-empty bookkeeping");
            }
            return Ok(());
        }
        if self.color_of(self.root) != Color::Black {
            anyhow::bail!("root is red");
        }
        let mut visited = 0usize;
        self.check_node(self.root, &mut visited)?;
        if visited != self.len {
            anyhow::bail!("tree holds {} nodes, len says {}", visited, self.len);
        }
        // List must enumerate the same ranges in strictly increasing order.
        let mut id = self.head;
        let mut prev_end = 0u64;
        let mut listed = 0usize;
        while id != NIL {
            let n = &self.nodes[id as usize];
            if listed > 0 && n.range.start < prev_end {
                anyhow::bail!("list order violated at {:?}", n.range);
            }
            prev_end = n.range.end;
            listed += 1;
            id = n.next;
        }
        if listed != self.len {
            anyhow::bail!("list holds {} nodes, len says {}", listed, self.len);
        }
        Ok(())
    }

    // Returns the black height of the subtree.
    fn check_node(&self, id: NodeId, visited: &mut usize) -> anyhow::Result<u32> {
        if id == NIL {
            return Ok(1);
        }
        *visited += 1;
        let n = &self.nodes[id as usize];
        if n.value.is_none() {
            anyhow::bail!("freed node {} still linked", id);
        }
        if n.range.end <= n.range.start {
            anyhow::bail!("degenerate range {:?}", n.range);
        }
        if n.color == Color::Red
            && (self.color_of(n.left) == Color::Red || self.color_of(n.right) == Color::Red)
        {
            anyhow::bail!("red node {} has a red child", id);
        }
        if n.left != NIL {
            let l = &self.nodes[n.left as usize];
            if l.parent != id {
                anyhow::bail!("bad parent link under {}", id);
            }
            if l.range.end > n.range.start {
                anyhow::bail!("left child {:?} overlaps {:?}", l.range, n.range);
            }
        }
        if n.right != NIL {
            let r = &self.nodes[n.right as usize];
            if r.parent != id {
                anyhow::bail!("bad parent link under {}", id);
            }
            if n.range.end > r.range.start {
                anyhow::bail!("{:?} overlaps right child {:?}", n.range, r.range);
            }
        }
        if A::ENABLED {
            let want = n
                .range
                .len()
                .max(self.max_of(n.left))
                .max(self.max_of(n.right));
            if n.subtree_max != want {
                anyhow::bail!(
                    "augmentation broken at {:?}: cached {:#x}, computed {:#x}",
                    n.range,
                    n.subtree_max,
                    want
                );
            }
        }
        let lh = self.check_node(n.left, visited)?;
        let rh = self.check_node(n.right, visited)?;
        if lh != rh {
            anyhow::bail!("black height mismatch under {}: {} vs {}", id, lh, rh);
        }
        Ok(lh + if n.color == Color::Black { 1 } else { 0 })
    }
}
