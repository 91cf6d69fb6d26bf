//! An intrusive red-black tree over disjoint address ranges.

use core::cmp::Ordering;
use core::fmt;
use core::ptr::NonNull;

use crate::key::RangeKey;

/// A child slot of a tree node.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Direction {
    Left,
    Right,
}

impl Direction {
    /// The other slot.
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::Left => Self::Right,
            Self::Right => Self::Left,
        }
    }

    const fn index(self) -> usize {
        match self {
            Self::Left => 0,
            Self::Right => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Color {
    Red,
    Black,
}

/// A tree node carrying a region key and its payload.
///
/// Nodes are intrusive: the tree links storage owned by the caller and never
/// allocates or frees anything itself. A node's storage must stay put from
/// [`RegionTree::insert`] until [`RegionTree::remove`].
pub struct RegionNode<T> {
    parent: Option<NonNull<RegionNode<T>>>,
    children: [Option<NonNull<RegionNode<T>>>; 2],
    color: Color,
    key: RangeKey,
    payload: T,
}

impl<T> RegionNode<T> {
    /// Creates an unlinked node covering `key`.
    #[must_use]
    pub const fn new(key: RangeKey, payload: T) -> Self {
        Self {
            parent: None,
            children: [None, None],
            color: Color::Red,
            key,
            payload,
        }
    }

    /// The span this node covers.
    #[must_use]
    pub const fn key(&self) -> RangeKey {
        self.key
    }

    /// The caller's data.
    #[must_use]
    pub const fn payload(&self) -> &T {
        &self.payload
    }

    /// Mutable access to the caller's data.
    pub const fn payload_mut(&mut self) -> &mut T {
        &mut self.payload
    }
}

// Safety: a node's links are tree-internal state; ownership of the node
// moves with the structure that references it.
unsafe impl<T: Send> Send for RegionNode<T> {}

/// Where a missing key would attach to the tree.
///
/// Produced by [`RegionTree::locate`] and consumed by [`RegionTree::insert`].
/// The point is only meaningful as long as the tree is not modified in
/// between.
pub struct InsertionPoint<T> {
    parent: Option<NonNull<RegionNode<T>>>,
    direction: Direction,
}

impl<T> fmt::Debug for InsertionPoint<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InsertionPoint")
            .field("parent", &self.parent)
            .field("direction", &self.direction)
            .finish()
    }
}

/// A red-black tree of disjoint address ranges.
///
/// Keys compare by overlap, so searching with a probe key finds the region
/// containing an address and searching with a full span detects collisions,
/// both in `O(log n)`. The overlap comparison is only a total order while
/// all stored ranges are disjoint; [`Self::insert`] panics rather than let a
/// second region break that premise.
pub struct RegionTree<T> {
    root: Option<NonNull<RegionNode<T>>>,
}

// Nodes are reached only through &mut self or the unsafe entry points,
// whose callers serialize access.
unsafe impl<T: Send> Send for RegionTree<T> {}

impl<T> Default for RegionTree<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RegionTree<T> {
    /// Creates an empty tree.
    #[must_use]
    pub const fn new() -> Self {
        Self { root: None }
    }

    /// Whether the tree holds no regions.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Finds the region overlapping `key`, if any.
    #[must_use]
    pub fn search(&self, key: &RangeKey) -> Option<NonNull<RegionNode<T>>> {
        let mut current = self.root;
        while let Some(node) = current {
            current = match key_of(node).overlap_cmp(key) {
                Ordering::Equal => return Some(node),
                Ordering::Greater => child_of(node, Direction::Left),
                Ordering::Less => child_of(node, Direction::Right),
            };
        }
        None
    }

    /// Finds the region overlapping `key`, or where such a region would go.
    ///
    /// # Errors
    ///
    /// Returns the [`InsertionPoint`] naming the empty slot for `key` when
    /// no stored region overlaps it.
    pub fn locate(&self, key: &RangeKey) -> Result<NonNull<RegionNode<T>>, InsertionPoint<T>> {
        let mut parent = None;
        let mut direction = Direction::Left;
        let mut current = self.root;
        while let Some(node) = current {
            direction = match key_of(node).overlap_cmp(key) {
                Ordering::Equal => return Ok(node),
                Ordering::Greater => Direction::Left,
                Ordering::Less => Direction::Right,
            };
            parent = Some(node);
            current = child_of(node, direction);
        }
        Err(InsertionPoint { parent, direction })
    }

    /// The region farthest right that lies entirely below `key`.
    #[must_use]
    pub fn predecessor(&self, key: &RangeKey) -> Option<NonNull<RegionNode<T>>> {
        let mut best = None;
        let mut current = self.root;
        while let Some(node) = current {
            current = match key_of(node).overlap_cmp(key) {
                Ordering::Equal => break,
                Ordering::Greater => child_of(node, Direction::Left),
                Ordering::Less => {
                    best = Some(node);
                    child_of(node, Direction::Right)
                }
            };
        }
        best
    }

    /// The lowest region in the tree.
    #[must_use]
    pub fn min(&self) -> Option<NonNull<RegionNode<T>>> {
        self.root.map(subtree_min)
    }

    /// The highest region in the tree.
    #[must_use]
    pub fn max(&self) -> Option<NonNull<RegionNode<T>>> {
        self.root.map(subtree_max)
    }

    /// Links `node` into the tree at `at`.
    ///
    /// The insertion point must come from a [`Self::locate`] call on this
    /// tree that found no overlapping region, with no modification in
    /// between.
    ///
    /// # Panics
    ///
    /// Panics if the node overlaps the region at the attachment point or
    /// the point no longer names an empty slot. Either means the caller
    /// skipped the lookup, and linking the node would corrupt the map.
    ///
    /// # Safety
    ///
    /// `node` must point to storage that stays valid and pinned until the
    /// node is removed, and it must not currently be linked into any tree.
    pub unsafe fn insert(&mut self, mut node: NonNull<RegionNode<T>>, at: InsertionPoint<T>) {
        set_color(node, Color::Red);
        set_child(node, Direction::Left, None);
        set_child(node, Direction::Right, None);
        set_parent(node, at.parent);

        let Some(mut parent) = at.parent else {
            assert!(self.root.is_none(), "insertion point is stale");
            self.root = Some(node);
            return;
        };
        assert!(
            !key_of(node).overlaps(&key_of(parent)),
            "inserting a region over a live range"
        );
        assert!(
            child_of(parent, at.direction).is_none(),
            "insertion point is stale"
        );
        set_child(parent, at.direction, Some(node));

        // A fresh red node under a red parent breaks the red rule; recolor
        // and rotate upward until it holds again.
        loop {
            if color_of(parent) == Color::Black {
                return;
            }
            let Some(grand) = parent_of(parent) else {
                // The parent is a red root. Recoloring it costs nothing.
                set_color(parent, Color::Black);
                return;
            };
            let dir = direction_of_child(grand, parent);
            if let Some(uncle) = red_child(grand, dir.opposite()) {
                // Red parent and red uncle: push the grandparent's black
                // down one level and retry from there.
                set_color(parent, Color::Black);
                set_color(uncle, Color::Black);
                set_color(grand, Color::Red);
                node = grand;
                match parent_of(node) {
                    Some(next) => parent = next,
                    None => return,
                }
                continue;
            }
            // Black uncle: one or two rotations settle the subtree.
            if child_of(parent, dir.opposite()) == Some(node) {
                // The node sits on the inner side; rotate it outward so the
                // final rotation sees a straight line.
                self.rotate(parent, node);
                parent = node;
            }
            self.rotate(grand, parent);
            set_color(parent, Color::Black);
            set_color(grand, Color::Red);
            return;
        }
    }

    /// Unlinks `node` from the tree and rebalances.
    ///
    /// The node is not freed; its storage returns to the caller's control
    /// with all links cleared.
    ///
    /// # Safety
    ///
    /// `node` must currently be linked into this tree.
    pub unsafe fn remove(&mut self, node: NonNull<RegionNode<T>>) {
        if let (Some(_), Some(right)) =
            (child_of(node, Direction::Left), child_of(node, Direction::Right))
        {
            // Two children: trade places with the in-order successor, which
            // has no left child, and unlink from the easier position. The
            // nodes swap positions rather than contents, so every live
            // pointer keeps naming the region it named before.
            self.exchange_with_successor(node, subtree_min(right));
        }
        self.unlink_with_at_most_one_child(node);
        set_parent(node, None);
        set_child(node, Direction::Left, None);
        set_child(node, Direction::Right, None);
    }

    /// Rewires `node` and the minimum of its right subtree to swap places.
    fn exchange_with_successor(&mut self, node: NonNull<RegionNode<T>>, succ: NonNull<RegionNode<T>>) {
        let node_parent = parent_of(node);
        let node_left = child_of(node, Direction::Left);
        let node_right = child_of(node, Direction::Right);
        let succ_parent = parent_of(succ);
        let succ_right = child_of(succ, Direction::Right);
        let node_color = color_of(node);
        set_color(node, color_of(succ));
        set_color(succ, node_color);

        set_child(succ, Direction::Left, node_left);
        if let Some(left) = node_left {
            set_parent(left, Some(succ));
        }

        if succ_parent == Some(node) {
            // The successor is the node's right child; they swap directly.
            set_child(succ, Direction::Right, Some(node));
            set_parent(node, Some(succ));
        } else {
            set_child(succ, Direction::Right, node_right);
            if let Some(right) = node_right {
                set_parent(right, Some(succ));
            }
            // The successor was the minimum of the right subtree, so it
            // hung in its parent's left slot.
            if let Some(parent) = succ_parent {
                set_child(parent, Direction::Left, Some(node));
            }
            set_parent(node, succ_parent);
        }
        set_child(node, Direction::Right, succ_right);
        if let Some(right) = succ_right {
            set_parent(right, Some(node));
        }
        set_child(node, Direction::Left, None);

        set_parent(succ, node_parent);
        match node_parent {
            Some(parent) => set_child(parent, direction_of_child(parent, node), Some(succ)),
            None => self.root = Some(succ),
        }
    }

    fn unlink_with_at_most_one_child(&mut self, node: NonNull<RegionNode<T>>) {
        let child = child_of(node, Direction::Left).or_else(|| child_of(node, Direction::Right));
        if let Some(child) = child {
            // Only a black node can carry exactly one child, and that child
            // is a red leaf. It moves up and takes over the black slot.
            debug_assert!(color_of(node) == Color::Black);
            debug_assert!(color_of(child) == Color::Red);
            self.replace_in_parent(node, Some(child));
            set_parent(child, parent_of(node));
            set_color(child, Color::Black);
            return;
        }
        let Some(parent) = parent_of(node) else {
            self.root = None;
            return;
        };
        if color_of(node) == Color::Red {
            set_child(parent, direction_of_child(parent, node), None);
            return;
        }
        self.rebalance_black_leaf(node, parent);
    }

    /// Detaches a black leaf and repairs the black-height deficit.
    fn rebalance_black_leaf(&mut self, node: NonNull<RegionNode<T>>, parent: NonNull<RegionNode<T>>) {
        // Every path through the emptied slot is now one black node short.
        // Work back up until the deficit is paid.
        let mut dir = direction_of_child(parent, node);
        set_child(parent, dir, None);
        let mut parent = parent;
        loop {
            let Some(mut sibling) = child_of(parent, dir.opposite()) else {
                unreachable!("a black-height deficit implies a sibling");
            };
            if color_of(sibling) == Color::Red {
                // Red sibling: rotate it above the parent. The close nephew
                // takes over as sibling, and it is black, so one of the
                // cases below settles the matter.
                self.rotate(parent, sibling);
                set_color(parent, Color::Red);
                set_color(sibling, Color::Black);
                match child_of(parent, dir.opposite()) {
                    Some(next) => sibling = next,
                    None => unreachable!("a red sibling carries black children"),
                }
            }
            if let Some(distant) = red_child(sibling, dir.opposite()) {
                // Red distant nephew: one rotation moves a black node onto
                // the short side and the deficit is paid.
                self.rotate(parent, sibling);
                set_color(sibling, color_of(parent));
                set_color(parent, Color::Black);
                set_color(distant, Color::Black);
                return;
            }
            if let Some(close) = red_child(sibling, dir) {
                // Red close nephew: rotate it over the sibling. That leaves
                // a black sibling whose distant nephew is red, which the
                // previous case resolves on the next pass.
                self.rotate(sibling, close);
                set_color(sibling, Color::Red);
                set_color(close, Color::Black);
                continue;
            }
            if color_of(parent) == Color::Red {
                // Red parent, black sibling and nephews: swapping the
                // parent's and sibling's colors adds the missing black to
                // the short side without disturbing the other.
                set_color(sibling, Color::Red);
                set_color(parent, Color::Black);
                return;
            }
            // Parent, sibling and nephews all black: paint the sibling red,
            // leveling the subtree one black short, and push the deficit up.
            set_color(sibling, Color::Red);
            match parent_of(parent) {
                Some(grand) => {
                    dir = direction_of_child(grand, parent);
                    parent = grand;
                }
                None => return,
            }
        }
    }

    /// Rotates `child` into its parent's position. The parent picks up the
    /// subtree `child` gives up and becomes `child`'s other child.
    fn rotate(&mut self, parent: NonNull<RegionNode<T>>, child: NonNull<RegionNode<T>>) {
        let hoist_dir = direction_of_child(parent, child);
        let inner = child_of(child, hoist_dir.opposite());
        let grand = parent_of(parent);
        set_child(parent, hoist_dir, inner);
        if let Some(inner) = inner {
            set_parent(inner, Some(parent));
        }
        set_child(child, hoist_dir.opposite(), Some(parent));
        set_parent(parent, Some(child));
        set_parent(child, grand);
        match grand {
            Some(grand) => set_child(grand, direction_of_child(grand, parent), Some(child)),
            None => self.root = Some(child),
        }
    }

    fn replace_in_parent(&mut self, node: NonNull<RegionNode<T>>, new: Option<NonNull<RegionNode<T>>>) {
        match parent_of(node) {
            Some(parent) => set_child(parent, direction_of_child(parent, node), new),
            None => self.root = new,
        }
    }
}

#[cfg(debug_assertions)]
impl<T> RegionTree<T> {
    /// Walks the whole tree checking parent links, key order, strict
    /// disjointness, the red rule, and uniform black height. Returns the
    /// number of nodes. Debug builds only.
    ///
    /// # Panics
    ///
    /// Panics if any structural invariant is violated.
    pub fn check_invariants(&self) -> usize {
        let Some(root) = self.root else { return 0 };
        assert!(parent_of(root).is_none(), "the root has a parent");
        let mut count = 0;
        let mut previous = None;
        check_subtree(root, None, &mut previous, &mut count);
        count
    }
}

#[cfg(debug_assertions)]
fn check_subtree<T>(
    node: NonNull<RegionNode<T>>,
    expected_parent: Option<NonNull<RegionNode<T>>>,
    previous: &mut Option<RangeKey>,
    count: &mut usize,
) -> usize {
    assert!(parent_of(node) == expected_parent, "a parent link is broken");
    if color_of(node) == Color::Red {
        assert!(
            red_child(node, Direction::Left).is_none() && red_child(node, Direction::Right).is_none(),
            "a red node has a red child"
        );
    }
    let left = child_of(node, Direction::Left)
        .map_or(1, |left| check_subtree(left, Some(node), previous, count));
    if let Some(previous) = previous {
        assert!(
            previous.overlap_cmp(&key_of(node)) == Ordering::Less,
            "regions overlap or are out of order"
        );
    }
    *previous = Some(key_of(node));
    *count += 1;
    let right = child_of(node, Direction::Right)
        .map_or(1, |right| check_subtree(right, Some(node), previous, count));
    assert!(left == right, "black height differs between subtrees");
    left + usize::from(color_of(node) == Color::Black)
}

// Link accessors. Every pointer stored in the tree refers to a live node by
// the contract on insert, so the accessors may dereference freely.

fn parent_of<T>(node: NonNull<RegionNode<T>>) -> Option<NonNull<RegionNode<T>>> {
    unsafe { (*node.as_ptr()).parent }
}

fn child_of<T>(node: NonNull<RegionNode<T>>, dir: Direction) -> Option<NonNull<RegionNode<T>>> {
    unsafe { (*node.as_ptr()).children[dir.index()] }
}

fn color_of<T>(node: NonNull<RegionNode<T>>) -> Color {
    unsafe { (*node.as_ptr()).color }
}

fn key_of<T>(node: NonNull<RegionNode<T>>) -> RangeKey {
    unsafe { (*node.as_ptr()).key }
}

fn set_parent<T>(node: NonNull<RegionNode<T>>, parent: Option<NonNull<RegionNode<T>>>) {
    unsafe { (*node.as_ptr()).parent = parent }
}

fn set_child<T>(node: NonNull<RegionNode<T>>, dir: Direction, child: Option<NonNull<RegionNode<T>>>) {
    unsafe { (*node.as_ptr()).children[dir.index()] = child }
}

fn set_color<T>(node: NonNull<RegionNode<T>>, color: Color) {
    unsafe { (*node.as_ptr()).color = color }
}

/// The child of `node` in `dir`, if it exists and is red.
fn red_child<T>(node: NonNull<RegionNode<T>>, dir: Direction) -> Option<NonNull<RegionNode<T>>> {
    child_of(node, dir).filter(|&child| color_of(child) == Color::Red)
}

/// Which of `parent`'s slots holds `child`.
fn direction_of_child<T>(parent: NonNull<RegionNode<T>>, child: NonNull<RegionNode<T>>) -> Direction {
    if child_of(parent, Direction::Right) == Some(child) {
        Direction::Right
    } else {
        Direction::Left
    }
}

fn subtree_min<T>(mut node: NonNull<RegionNode<T>>) -> NonNull<RegionNode<T>> {
    while let Some(left) = child_of(node, Direction::Left) {
        node = left;
    }
    node
}

fn subtree_max<T>(mut node: NonNull<RegionNode<T>>) -> NonNull<RegionNode<T>> {
    while let Some(right) = child_of(node, Direction::Right) {
        node = right;
    }
    node
}

#[cfg(test)]
mod tests {
    use super::*;
    use osmium_addresses::VirtualAddress;

    /// Owns the node storage for a test; the tree only links it.
    #[derive(Default)]
    struct Arena {
        nodes: Vec<*mut RegionNode<u32>>,
    }

    impl Arena {
        fn node(&mut self, base: u64, size: u64, tag: u32) -> NonNull<RegionNode<u32>> {
            let raw = Box::into_raw(Box::new(RegionNode::new(
                RangeKey::new(VirtualAddress::new(base), size),
                tag,
            )));
            self.nodes.push(raw);
            NonNull::new(raw).expect("boxes are never null")
        }
    }

    impl Drop for Arena {
        fn drop(&mut self) {
            for &node in &self.nodes {
                drop(unsafe { Box::from_raw(node) });
            }
        }
    }

    struct XorShift(u64);

    impl XorShift {
        fn next(&mut self) -> u64 {
            let mut x = self.0;
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            self.0 = x;
            x
        }
    }

    fn probe(address: u64) -> RangeKey {
        RangeKey::probe(VirtualAddress::new(address))
    }

    fn insert(tree: &mut RegionTree<u32>, arena: &mut Arena, base: u64, size: u64, tag: u32) {
        let node = arena.node(base, size, tag);
        let key = unsafe { node.as_ref() }.key();
        let at = tree.locate(&key).expect_err("region must not overlap");
        unsafe { tree.insert(node, at) };
    }

    fn tag_at(tree: &RegionTree<u32>, address: u64) -> Option<u32> {
        tree.search(&probe(address))
            .map(|node| *unsafe { node.as_ref() }.payload())
    }

    #[test]
    fn an_empty_tree_finds_nothing() {
        let tree = RegionTree::<u32>::new();
        assert!(tree.is_empty());
        assert!(tree.search(&probe(0x1000)).is_none());
        assert!(tree.min().is_none());
        assert!(tree.max().is_none());
        assert_eq!(tree.check_invariants(), 0);
    }

    #[test]
    fn search_resolves_any_contained_address() {
        let mut arena = Arena::default();
        let mut tree = RegionTree::new();
        insert(&mut tree, &mut arena, 0x1000, 0x1000, 1);
        insert(&mut tree, &mut arena, 0x3000, 0x2000, 2);

        assert_eq!(tag_at(&tree, 0x1000), Some(1));
        assert_eq!(tag_at(&tree, 0x1FFF), Some(1));
        assert_eq!(tag_at(&tree, 0x3800), Some(2));
        assert_eq!(tag_at(&tree, 0x0FFF), None);
        assert_eq!(tag_at(&tree, 0x2000), None);
        assert_eq!(tag_at(&tree, 0x5000), None);
    }

    #[test]
    fn a_colliding_span_is_found_before_insertion() {
        let mut arena = Arena::default();
        let mut tree = RegionTree::new();
        insert(&mut tree, &mut arena, 0x1000, 0x1000, 1);

        // A request for [0x1800, 0x2800) lands on the live region, so the
        // caller sees the collision instead of an attachment point.
        let request = RangeKey::new(VirtualAddress::new(0x1800), 0x1000);
        let found = tree.locate(&request).expect("overlap must be reported");
        assert_eq!(*unsafe { found.as_ref() }.payload(), 1);
    }

    #[test]
    #[should_panic(expected = "over a live range")]
    fn inserting_over_a_live_range_panics() {
        let mut arena = Arena::default();
        let mut tree = RegionTree::new();
        insert(&mut tree, &mut arena, 0x1000, 0x1000, 1);

        // A stale lookup for a disjoint key must not legitimize linking an
        // overlapping node through it.
        let at = tree
            .locate(&RangeKey::new(VirtualAddress::new(0x3000), 0x1000))
            .expect_err("key is disjoint");
        let overlapping = arena.node(0x1800, 0x1000, 2);
        unsafe { tree.insert(overlapping, at) };
    }

    #[test]
    #[should_panic(expected = "stale")]
    fn reusing_an_insertion_point_panics() {
        let mut arena = Arena::default();
        let mut tree = RegionTree::new();
        let first = arena.node(0x1000, 0x1000, 1);
        let second = arena.node(0x5000, 0x1000, 2);

        let at = tree
            .locate(&unsafe { first.as_ref() }.key())
            .expect_err("tree is empty");
        unsafe { tree.insert(first, at) };

        let stale = InsertionPoint {
            parent: None,
            direction: Direction::Left,
        };
        unsafe { tree.insert(second, stale) };
    }

    #[test]
    fn predecessor_is_the_rightmost_region_below() {
        let mut arena = Arena::default();
        let mut tree = RegionTree::new();
        insert(&mut tree, &mut arena, 0x1000, 0x1000, 1);
        insert(&mut tree, &mut arena, 0x3000, 0x1000, 2);
        insert(&mut tree, &mut arena, 0x5000, 0x1000, 3);

        let below = |address: u64| {
            tree.predecessor(&probe(address))
                .map(|node| *unsafe { node.as_ref() }.payload())
        };
        assert_eq!(below(0x4800), Some(2));
        assert_eq!(below(0x8000), Some(3));
        assert_eq!(below(0x0800), None);
        // A probe inside a region reports the region before it.
        assert_eq!(below(0x3800), Some(1));
    }

    #[test]
    fn min_and_max_track_the_extremes() {
        let mut arena = Arena::default();
        let mut tree = RegionTree::new();
        for (index, base) in [0x7000u64, 0x1000, 0x5000, 0x3000, 0x9000].iter().enumerate() {
            insert(&mut tree, &mut arena, *base, 0x1000, u32::try_from(index).unwrap());
        }
        let min = tree.min().expect("tree is not empty");
        let max = tree.max().expect("tree is not empty");
        assert_eq!(unsafe { min.as_ref() }.key().address().as_u64(), 0x1000);
        assert_eq!(unsafe { max.as_ref() }.key().address().as_u64(), 0x9000);
    }

    #[test]
    fn payloads_are_writable_through_the_node() {
        let mut arena = Arena::default();
        let mut tree = RegionTree::new();
        insert(&mut tree, &mut arena, 0x1000, 0x1000, 7);

        let mut node = tree.search(&probe(0x1000)).expect("region exists");
        *unsafe { node.as_mut() }.payload_mut() = 11;
        assert_eq!(tag_at(&tree, 0x1000), Some(11));
    }

    #[test]
    fn removing_the_root_relinks_the_tree() {
        let mut arena = Arena::default();
        let mut tree = RegionTree::new();
        insert(&mut tree, &mut arena, 0x1000, 0x1000, 1);

        let root = tree.search(&probe(0x1000)).expect("region exists");
        unsafe { tree.remove(root) };
        assert!(tree.is_empty());
        assert_eq!(tree.check_invariants(), 0);

        insert(&mut tree, &mut arena, 0x1000, 0x1000, 1);
        insert(&mut tree, &mut arena, 0x3000, 0x1000, 2);
        insert(&mut tree, &mut arena, 0x5000, 0x1000, 3);
        let root = tree.root.expect("tree is not empty");
        unsafe { tree.remove(root) };
        assert_eq!(tree.check_invariants(), 2);
    }

    #[test]
    fn sequential_fill_and_drain_stay_balanced() {
        let mut arena = Arena::default();
        let mut tree = RegionTree::new();
        for index in 0..16u64 {
            insert(
                &mut tree,
                &mut arena,
                0x1000 + index * 0x1000,
                0x1000,
                u32::try_from(index).unwrap(),
            );
            assert_eq!(tree.check_invariants(), usize::try_from(index).unwrap() + 1);
        }
        let mut expected = 16;
        for index in (0..16u64).step_by(2).chain((1..16u64).step_by(2)) {
            let node = tree
                .search(&probe(0x1000 + index * 0x1000))
                .expect("region still linked");
            unsafe { tree.remove(node) };
            expected -= 1;
            assert_eq!(tree.check_invariants(), expected);
        }
        assert!(tree.is_empty());
    }

    #[test]
    fn randomized_churn_keeps_every_invariant() {
        let mut arena = Arena::default();
        let mut tree = RegionTree::new();
        let mut rng = XorShift(0x9E37_79B9_7F4A_7C15);
        let mut live: Vec<(u64, NonNull<RegionNode<u32>>)> = Vec::new();

        for round in 0..512u32 {
            let base = (rng.next() % 1024) * 0x1000;
            let size = ((rng.next() % 4) + 1) * 0x1000;
            let key = RangeKey::new(VirtualAddress::new(base), size);
            match tree.locate(&key) {
                Ok(found) => {
                    // The slot is taken; drop the blocking region instead
                    // half of the time.
                    if rng.next() % 2 == 0 {
                        unsafe { tree.remove(found) };
                        live.retain(|&(_, node)| node != found);
                    }
                }
                Err(at) => {
                    let node = arena.node(base, size, round);
                    unsafe { tree.insert(node, at) };
                    live.push((base, node));
                }
            }
            assert_eq!(tree.check_invariants(), live.len());
        }

        assert!(!live.is_empty(), "the churn must exercise a populated tree");
        for &(base, node) in &live {
            assert_eq!(tree.search(&probe(base)), Some(node));
        }
        for &(_, node) in &live {
            unsafe { tree.remove(node) };
        }
        assert_eq!(tree.check_invariants(), 0);
        assert!(tree.is_empty());
    }
}
