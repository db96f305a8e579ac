// Copyright 2016 spatial-rs Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The R*-tree container: insertion, deletion, queries and maintenance.

pub mod iter;
pub mod node;
pub mod query;

use ordered_float::NotNan;
use tracing::{debug, trace};

use crate::arena::Arena;
use crate::error::RTreeError;
use crate::mbr::Mbr;
use crate::spatial::Spatial;
use crate::FP;

use self::iter::{IterMut, ListIter, TreeIter};
use self::node::{Children, Leaf, LeafId, LeafTag, Node, NodeId, NodeTag};
use self::query::{Everything, TreeQuery};

/// Fraction of a node's max fanout reinserted during forced reinsertion.
const REINSERT_P: f64 = 0.33;
/// Above this many children, `choose_subtree` skips the overlap-minimizing
/// comparison at the leaf-parent level and falls back to area enlargement,
/// since the pairwise overlap computation is quadratic in fanout.
const DEFAULT_CHOOSE_SUBTREE_P: usize = 32;

enum Entry {
    Leaf(LeafId),
    Node(NodeId),
}

/// An in-memory R*-tree mapping `D`-dimensional bounding rectangles to items
/// of type `T`.
///
/// Construct with [`RTree::new`]; `m` and `M` (the minimum and maximum
/// fanout) are runtime parameters rather than const generics, so a single
/// monomorphization of `RTree<P, D, T>` can serve trees of differing fanout.
pub struct RTree<P, const D: usize, T> {
    nodes: Arena<Node<P, D>, NodeTag>,
    leaves: Arena<Leaf<P, D, T>, LeafTag>,
    root: Option<NodeId>,
    levels: usize,
    len: usize,
    head: Option<LeafId>,
    tail: Option<LeafId>,
    m: usize,
    max: usize,
    reinsert_count: usize,
    reinsert_enabled: bool,
    choose_subtree_p: usize,
}

impl<P: FP, const D: usize, T> RTree<P, D, T> {
    /// Creates a tree with forced reinsertion enabled, the standard R*-tree
    /// configuration.
    pub fn new(m: usize, max: usize) -> Result<Self, RTreeError> {
        Self::new_with_reinsertion(m, max, true)
    }

    /// Creates a tree with `m` minimum and `max` maximum children per node,
    /// optionally disabling forced reinsertion (falling back to R-tree-style
    /// split-only overflow handling).
    pub fn new_with_reinsertion(m: usize, max: usize, reinsert_enabled: bool) -> Result<Self, RTreeError> {
        let max_m = (max + 1) / 2;
        if max < 2 || m < 2 || m > max_m {
            return Err(RTreeError::InvalidCapacity { min: m, max });
        }
        let reinsert_count = (((max as f64) * REINSERT_P).round() as usize).clamp(1, max + 1 - m);
        Ok(RTree {
            nodes: Arena::new(),
            leaves: Arena::new(),
            root: None,
            levels: 0,
            len: 0,
            head: None,
            tail: None,
            m,
            max,
            reinsert_count,
            reinsert_enabled,
            choose_subtree_p: DEFAULT_CHOOSE_SUBTREE_P,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The number of levels from root to leaf, inclusive. `0` for an empty
    /// tree, `1` for a tree whose root holds only leaves.
    pub fn levels(&self) -> usize {
        self.levels
    }

    /// The root's bounding rectangle, or an empty MBR for an empty tree.
    pub fn bounds(&self) -> Mbr<P, D> {
        match self.root {
            Some(root) => self.nodes.get(root).mbr.clone(),
            None => Mbr::empty(),
        }
    }

    /// Handle to the root node, for introspection (e.g. visualization) via
    /// [`RTree::node`]. `None` for an empty tree.
    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    /// Looks up an internal node by handle. Panics if `id` does not name a
    /// live node in this tree.
    pub fn node(&self, id: NodeId) -> &Node<P, D> {
        self.nodes.get(id)
    }

    /// Looks up a leaf by handle. Panics if `id` does not name a live leaf
    /// in this tree.
    pub fn leaf(&self, id: LeafId) -> &Leaf<P, D, T> {
        self.leaves.get(id)
    }

    /// The most recently inserted item still present in the tree.
    pub fn last(&self) -> Option<(&Mbr<P, D>, &T)> {
        self.head.map(|id| {
            let leaf = self.leaves.get(id);
            (&leaf.mbr, &leaf.item)
        })
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.leaves.clear();
        self.root = None;
        self.levels = 0;
        self.len = 0;
        self.head = None;
        self.tail = None;
    }

    /// Inserts `item` bound by an explicitly supplied `mbr`, returning a
    /// stable handle to it. Used internally wherever a leaf's bounding
    /// rectangle is already known (copy, splice, rebuild) rather than derived
    /// fresh from the item via [`Spatial::mbr`].
    fn insert_with_mbr(&mut self, mbr: Mbr<P, D>, item: T) -> LeafId {
        let leaf_id = self.leaves.insert(Leaf {
            mbr: mbr.clone(),
            item,
            parent: None,
            prev: None,
            next: self.head,
        });
        if let Some(head) = self.head {
            self.leaves.get_mut(head).prev = Some(leaf_id);
        }
        self.head = Some(leaf_id);
        if self.tail.is_none() {
            self.tail = Some(leaf_id);
        }
        self.len += 1;
        self.insert_leaf_into_tree(leaf_id);
        leaf_id
    }

    fn insert_leaf_into_tree(&mut self, leaf_id: LeafId) {
        let mbr = self.leaves.get(leaf_id).mbr.clone();
        if self.root.is_none() {
            let root_id = self.nodes.insert(Node {
                mbr: mbr.clone(),
                children: Children::Leaves(vec![leaf_id]),
                parent: None,
            });
            self.leaves.get_mut(leaf_id).parent = Some(root_id);
            self.root = Some(root_id);
            self.levels = 1;
            return;
        }
        let root = self.root.unwrap();
        let top_depth = self.levels - 1;
        let mut reinsert_done = vec![false; self.levels];
        if let Some(sibling) = self.insert_entry(root, Entry::Leaf(leaf_id), mbr, top_depth, None, &mut reinsert_done) {
            self.grow_root(root, sibling);
        }
    }

    fn grow_root(&mut self, old_root: NodeId, sibling: NodeId) {
        let mbr = self.nodes.get(old_root).mbr.union_of(&self.nodes.get(sibling).mbr);
        let new_root = self.nodes.insert(Node {
            mbr,
            children: Children::Internal(vec![old_root, sibling]),
            parent: None,
        });
        self.nodes.get_mut(old_root).parent = Some(new_root);
        self.nodes.get_mut(sibling).parent = Some(new_root);
        self.root = Some(new_root);
        self.levels += 1;
        trace!(levels = self.levels, "root split, tree grew a level");
    }

    fn attach_entry(&mut self, node_id: NodeId, entry: Entry, entry_mbr: &Mbr<P, D>) {
        match entry {
            Entry::Leaf(id) => {
                self.leaves.get_mut(id).parent = Some(node_id);
                self.nodes.get_mut(node_id).children.as_leaves_mut().push(id);
            }
            Entry::Node(id) => {
                self.nodes.get_mut(id).parent = Some(node_id);
                self.nodes.get_mut(node_id).children.as_internal_mut().push(id);
            }
        }
        self.nodes.get_mut(node_id).mbr.union(entry_mbr);
    }

    /// Inserts `entry` (at dimensionless depth `None` for a leaf, or
    /// `Some(depth)` for a subtree being forced-reinserted) below `node_id`,
    /// which sits at `node_depth` above the leaves. Returns a new sibling if
    /// the recursion caused `node_id` itself to split.
    fn insert_entry(
        &mut self,
        node_id: NodeId,
        entry: Entry,
        entry_mbr: Mbr<P, D>,
        node_depth: usize,
        target: Option<usize>,
        reinsert_done: &mut Vec<bool>,
    ) -> Option<NodeId> {
        let attach_here = match target {
            None => node_depth == 0,
            Some(t) => node_depth == t + 1,
        };
        if attach_here {
            self.attach_entry(node_id, entry, &entry_mbr);
            if self.nodes.get(node_id).children.len() > self.max {
                return self.handle_overflow(node_id, node_depth, reinsert_done);
            }
            return None;
        }
        let child_id = self.choose_subtree(node_id, &entry_mbr, node_depth);
        let split = self.insert_entry(child_id, entry, entry_mbr, node_depth - 1, target, reinsert_done);
        let child_mbr = self.nodes.get(child_id).mbr.clone();
        self.nodes.get_mut(node_id).mbr.union(&child_mbr);
        if let Some(sibling) = split {
            self.nodes.get_mut(sibling).parent = Some(node_id);
            let sib_mbr = self.nodes.get(sibling).mbr.clone();
            self.nodes.get_mut(node_id).children.as_internal_mut().push(sibling);
            self.nodes.get_mut(node_id).mbr.union(&sib_mbr);
            if self.nodes.get(node_id).children.len() > self.max {
                return self.handle_overflow(node_id, node_depth, reinsert_done);
            }
        }
        None
    }

    /// CS2 (and its R*-tree refinement): pick the child whose enlargement to
    /// fit `mbr` is smallest. At the level directly above the leaves - where
    /// overlap between siblings matters most and is still cheap to compute -
    /// overlap enlargement is minimized first, with area enlargement and then
    /// raw area as tie-breakers.
    fn choose_subtree(&self, node_id: NodeId, mbr: &Mbr<P, D>, node_depth: usize) -> NodeId {
        let children = self.nodes.get(node_id).children.as_internal();
        debug_assert!(!children.is_empty());
        let use_overlap = node_depth == 1 && children.len() <= self.choose_subtree_p;
        let mut best = children[0];
        let mut best_overlap = if use_overlap { Some(self.overlap_enlargement(node_id, best, mbr)) } else { None };
        let mut best_area = self.area_enlargement(best, mbr);
        let mut best_volume = self.nodes.get(best).mbr.volume();
        for &child in &children[1..] {
            let area = self.area_enlargement(child, mbr);
            let volume = self.nodes.get(child).mbr.volume();
            let better = if use_overlap {
                let overlap = self.overlap_enlargement(node_id, child, mbr);
                let ordering = overlap
                    .partial_cmp(&best_overlap.unwrap())
                    .unwrap()
                    .then_with(|| area.partial_cmp(&best_area).unwrap())
                    .then_with(|| volume.partial_cmp(&best_volume).unwrap());
                if ordering == std::cmp::Ordering::Less {
                    best_overlap = Some(overlap);
                    true
                } else {
                    false
                }
            } else {
                area.partial_cmp(&best_area)
                    .unwrap()
                    .then_with(|| volume.partial_cmp(&best_volume).unwrap())
                    == std::cmp::Ordering::Less
            };
            if better {
                best = child;
                best_area = area;
                best_volume = volume;
            }
        }
        best
    }

    fn area_enlargement(&self, child_id: NodeId, mbr: &Mbr<P, D>) -> P {
        let child_mbr = &self.nodes.get(child_id).mbr;
        child_mbr.union_volume(mbr) - child_mbr.volume()
    }

    fn overlap_enlargement(&self, parent_id: NodeId, child_id: NodeId, mbr: &Mbr<P, D>) -> P {
        let child_mbr = self.nodes.get(child_id).mbr.clone();
        let expanded = child_mbr.union_of(mbr);
        let siblings = self.nodes.get(parent_id).children.as_internal();
        let mut delta = P::zero();
        for &sibling in siblings {
            if sibling == child_id {
                continue;
            }
            let sibling_mbr = &self.nodes.get(sibling).mbr;
            delta = delta + (expanded.overlap_volume(sibling_mbr) - child_mbr.overlap_volume(sibling_mbr));
        }
        delta
    }

    fn handle_overflow(&mut self, node_id: NodeId, node_depth: usize, reinsert_done: &mut Vec<bool>) -> Option<NodeId> {
        let is_root = Some(node_id) == self.root;
        if self.reinsert_enabled && !is_root && !reinsert_done[node_depth] {
            reinsert_done[node_depth] = true;
            debug!(node_depth, "forced reinsertion");
            self.forced_reinsert(node_id, node_depth, reinsert_done);
            None
        } else {
            debug!(node_depth, "splitting overflowing node");
            Some(self.split(node_id, node_depth))
        }
    }

    /// OT1/RI1-RI4: removes the `reinsert_count` children farthest from
    /// `node_id`'s center, then reinserts them from the root down, closest
    /// (of the removed) first, without triggering a second reinsertion at
    /// this level.
    fn forced_reinsert(&mut self, node_id: NodeId, node_depth: usize, reinsert_done: &mut Vec<bool>) {
        let center = self.nodes.get(node_id).mbr.clone();
        let p = self.reinsert_count;
        if node_depth == 0 {
            let ids = std::mem::take(self.nodes.get_mut(node_id).children.as_leaves_mut());
            let mut entries: Vec<(LeafId, Mbr<P, D>)> =
                ids.into_iter().map(|id| (id, self.leaves.get(id).mbr.clone())).collect();
            // Sorted farthest-from-center first. The farthest `p` are
            // detached and reinserted; the closest `len - p` stay attached.
            entries.sort_by_key(|(_, mbr)| std::cmp::Reverse(NotNan::new(center.squared_center_distance(mbr)).unwrap()));
            let mut to_reinsert = entries;
            let kept = to_reinsert.split_off(p.min(to_reinsert.len()));
            to_reinsert.reverse();
            let mut kept_mbr = Mbr::empty();
            for (_, mbr) in &kept {
                kept_mbr.union(mbr);
            }
            self.nodes.get_mut(node_id).mbr = kept_mbr;
            *self.nodes.get_mut(node_id).children.as_leaves_mut() = kept.into_iter().map(|(id, _)| id).collect();
            for (leaf_id, mbr) in to_reinsert {
                let root = self.root.unwrap();
                let top_depth = self.levels - 1;
                if let Some(sibling) = self.insert_entry(root, Entry::Leaf(leaf_id), mbr, top_depth, None, reinsert_done) {
                    self.grow_root(root, sibling);
                }
            }
        } else {
            let ids = std::mem::take(self.nodes.get_mut(node_id).children.as_internal_mut());
            let mut entries: Vec<(NodeId, Mbr<P, D>)> =
                ids.into_iter().map(|id| (id, self.nodes.get(id).mbr.clone())).collect();
            entries.sort_by_key(|(_, mbr)| std::cmp::Reverse(NotNan::new(center.squared_center_distance(mbr)).unwrap()));
            let mut to_reinsert = entries;
            let kept = to_reinsert.split_off(p.min(to_reinsert.len()));
            to_reinsert.reverse();
            let mut kept_mbr = Mbr::empty();
            for (_, mbr) in &kept {
                kept_mbr.union(mbr);
            }
            self.nodes.get_mut(node_id).mbr = kept_mbr;
            *self.nodes.get_mut(node_id).children.as_internal_mut() = kept.into_iter().map(|(id, _)| id).collect();
            let target_depth = node_depth - 1;
            for (sub_id, mbr) in to_reinsert {
                let root = self.root.unwrap();
                let top_depth = self.levels - 1;
                if let Some(sibling) =
                    self.insert_entry(root, Entry::Node(sub_id), mbr, top_depth, Some(target_depth), reinsert_done)
                {
                    self.grow_root(root, sibling);
                }
            }
        }
    }

    /// S1-S3: picks the axis minimizing summed margin (CSA1) then the split
    /// index minimizing overlap, then area (CSI1), and physically divides
    /// the overflowing node's `max + 1` children into two.
    fn split(&mut self, node_id: NodeId, node_depth: usize) -> NodeId {
        let parent = self.nodes.get(node_id).parent;
        if node_depth == 0 {
            let ids = std::mem::take(self.nodes.get_mut(node_id).children.as_leaves_mut());
            let entries: Vec<(LeafId, Mbr<P, D>)> =
                ids.into_iter().map(|id| (id, self.leaves.get(id).mbr.clone())).collect();
            let (group_a, group_b) = choose_split(entries, self.m, self.max);
            let mbr_a = union_all(&group_a);
            let mbr_b = union_all(&group_b);
            self.nodes.get_mut(node_id).mbr = mbr_a;
            *self.nodes.get_mut(node_id).children.as_leaves_mut() = group_a.into_iter().map(|(id, _)| id).collect();
            let sibling_ids: Vec<LeafId> = group_b.into_iter().map(|(id, _)| id).collect();
            let sibling = self.nodes.insert(Node {
                mbr: mbr_b,
                children: Children::Leaves(sibling_ids.clone()),
                parent,
            });
            for id in sibling_ids {
                self.leaves.get_mut(id).parent = Some(sibling);
            }
            sibling
        } else {
            let ids = std::mem::take(self.nodes.get_mut(node_id).children.as_internal_mut());
            let entries: Vec<(NodeId, Mbr<P, D>)> =
                ids.into_iter().map(|id| (id, self.nodes.get(id).mbr.clone())).collect();
            let (group_a, group_b) = choose_split(entries, self.m, self.max);
            let mbr_a = union_all(&group_a);
            let mbr_b = union_all(&group_b);
            self.nodes.get_mut(node_id).mbr = mbr_a;
            *self.nodes.get_mut(node_id).children.as_internal_mut() = group_a.into_iter().map(|(id, _)| id).collect();
            let sibling_ids: Vec<NodeId> = group_b.into_iter().map(|(id, _)| id).collect();
            let sibling = self.nodes.insert(Node {
                mbr: mbr_b,
                children: Children::Internal(sibling_ids.clone()),
                parent,
            });
            for id in sibling_ids {
                self.nodes.get_mut(id).parent = Some(sibling);
            }
            sibling
        }
    }

    /// Removes and returns the item behind `id`.
    pub fn erase(&mut self, id: LeafId) -> (Mbr<P, D>, T) {
        self.unlink_from_list(id);
        let parent = self.leaves.get(id).parent.unwrap();
        self.detach_leaf_from_parent(parent, id);
        self.len -= 1;
        let leaf = self.leaves.remove(id);

        let mut orphans = Vec::new();
        self.fix_up_after_removal(parent, 0, &mut orphans);
        self.reinsert_orphans(orphans);
        (leaf.mbr, leaf.item)
    }

    fn unlink_from_list(&mut self, id: LeafId) {
        let (prev, next) = {
            let leaf = self.leaves.get(id);
            (leaf.prev, leaf.next)
        };
        match prev {
            Some(p) => self.leaves.get_mut(p).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.leaves.get_mut(n).prev = prev,
            None => self.tail = prev,
        }
    }

    fn detach_leaf_from_parent(&mut self, parent: NodeId, id: LeafId) {
        let children = self.nodes.get_mut(parent).children.as_leaves_mut();
        let pos = children.iter().position(|&c| c == id).expect("leaf missing from its own parent");
        children.remove(pos);
    }

    fn detach_node_from_parent(&mut self, parent: NodeId, id: NodeId) {
        let children = self.nodes.get_mut(parent).children.as_internal_mut();
        let pos = children.iter().position(|&c| c == id).expect("node missing from its own parent");
        children.remove(pos);
    }

    fn recompute_mbr(&mut self, node_id: NodeId) {
        let mbr = match &self.nodes.get(node_id).children {
            Children::Leaves(ids) => {
                let mut mbr = Mbr::empty();
                for &id in ids {
                    mbr.union(&self.leaves.get(id).mbr);
                }
                mbr
            }
            Children::Internal(ids) => {
                let mut mbr = Mbr::empty();
                for &id in ids {
                    mbr.union(&self.nodes.get(id).mbr);
                }
                mbr
            }
        };
        self.nodes.get_mut(node_id).mbr = mbr;
    }

    fn propagate_mbr_shrink_upward(&mut self, node_id: NodeId) {
        let mut current = self.nodes.get(node_id).parent;
        while let Some(id) = current {
            self.recompute_mbr(id);
            current = self.nodes.get(id).parent;
        }
    }

    /// Walks up from a node that just lost a child. If it still meets the
    /// minimum fanout, just recomputes MBRs up to the root. Otherwise it is
    /// itself detached from its parent and dissolved - every leaf beneath it
    /// is collected into `orphans` for a plain top-level reinsertion, and the
    /// walk continues from the (now one child shorter) parent, which may
    /// cascade further up the tree.
    fn fix_up_after_removal(&mut self, node_id: NodeId, node_depth: usize, orphans: &mut Vec<LeafId>) {
        let count = self.nodes.get(node_id).children.len();
        if Some(node_id) == self.root {
            if count == 0 {
                self.nodes.remove(node_id);
                self.root = None;
                self.levels = 0;
            } else {
                self.recompute_mbr(node_id);
            }
            return;
        }
        if count >= self.m {
            self.recompute_mbr(node_id);
            self.propagate_mbr_shrink_upward(node_id);
            return;
        }
        let parent = self.nodes.get(node_id).parent.unwrap();
        self.detach_node_from_parent(parent, node_id);
        self.collect_leaves(node_id, node_depth, orphans);
        self.destroy_subtree(node_id, node_depth);
        self.fix_up_after_removal(parent, node_depth + 1, orphans);
    }

    fn collect_leaves(&self, node_id: NodeId, node_depth: usize, out: &mut Vec<LeafId>) {
        match &self.nodes.get(node_id).children {
            Children::Leaves(ids) => out.extend_from_slice(ids),
            Children::Internal(ids) => {
                let ids = ids.clone();
                for id in ids {
                    self.collect_leaves(id, node_depth - 1, out);
                }
            }
        }
    }

    fn destroy_subtree(&mut self, node_id: NodeId, node_depth: usize) {
        if node_depth > 0 {
            let ids = match &self.nodes.get(node_id).children {
                Children::Internal(ids) => ids.clone(),
                Children::Leaves(_) => unreachable!(),
            };
            for id in ids {
                self.destroy_subtree(id, node_depth - 1);
            }
        }
        self.nodes.remove(node_id);
    }

    fn reinsert_orphans(&mut self, orphans: Vec<LeafId>) {
        if orphans.is_empty() {
            return;
        }
        self.levels = self.compute_levels();
        for id in orphans {
            self.insert_leaf_into_tree(id);
        }
    }

    fn compute_levels(&self) -> usize {
        let mut depth = 0;
        let mut current = self.root;
        while let Some(id) = current {
            depth += 1;
            current = match &self.nodes.get(id).children {
                Children::Internal(ids) => ids.first().copied(),
                Children::Leaves(_) => None,
            };
        }
        depth
    }

    /// Removes every item matching `query` for which `keep` returns `false`,
    /// returning the removed `(mbr, item)` pairs.
    pub fn retain<Q, F>(&mut self, query: Q, mut keep: F) -> Vec<(Mbr<P, D>, T)>
    where
        Q: TreeQuery<P, D, T>,
        F: FnMut(&T) -> bool,
    {
        let matches: Vec<LeafId> = TreeIter::new(&self.nodes, &self.leaves, self.root, query)
            .map(|(id, _, _)| id)
            .collect();
        let mut removed = Vec::new();
        for id in matches {
            let keep_it = keep(&self.leaves.get(id).item);
            if !keep_it {
                removed.push(self.erase(id));
            }
        }
        removed
    }

    /// Removes every item matching `query`.
    pub fn remove<Q: TreeQuery<P, D, T>>(&mut self, query: Q) -> Vec<(Mbr<P, D>, T)> {
        self.retain(query, |_| false)
    }

    /// Removes every item (regardless of position) for which `predicate`
    /// returns `true`, walking the insertion-ordered list rather than the
    /// tree shape.
    pub fn remove_if<F: FnMut(&T) -> bool>(&mut self, mut predicate: F) -> Vec<(Mbr<P, D>, T)> {
        let matches: Vec<LeafId> = ListIter::new(&self.leaves, self.head)
            .filter(|(_, _, item)| predicate(item))
            .map(|(id, _, _)| id)
            .collect();
        matches.into_iter().map(|id| self.erase(id)).collect()
    }

    pub fn iter(&self) -> TreeIter<'_, P, D, T, Everything> {
        TreeIter::new(&self.nodes, &self.leaves, self.root, Everything)
    }

    pub fn iter_query<Q: TreeQuery<P, D, T>>(&self, query: Q) -> TreeIter<'_, P, D, T, Q> {
        TreeIter::new(&self.nodes, &self.leaves, self.root, query)
    }

    /// Iterates every item in insertion order (newest first), independent of
    /// tree shape.
    pub fn iter_inserted(&self) -> ListIter<'_, P, D, T> {
        ListIter::new(&self.leaves, self.head)
    }

    pub fn iter_mut(&mut self) -> IterMut<'_, P, D, T> {
        let ids: Vec<LeafId> = TreeIter::new(&self.nodes, &self.leaves, self.root, Everything)
            .map(|(id, _, _)| id)
            .collect();
        IterMut::new(&mut self.leaves, ids)
    }

    pub fn iter_query_mut<Q: TreeQuery<P, D, T>>(&mut self, query: Q) -> IterMut<'_, P, D, T> {
        let ids: Vec<LeafId> = TreeIter::new(&self.nodes, &self.leaves, self.root, query)
            .map(|(id, _, _)| id)
            .collect();
        IterMut::new(&mut self.leaves, ids)
    }

    /// Rebuilds the tree structure from scratch, in current insertion-list
    /// order, without refreshing any leaf's cached `mbr`. Internal helper for
    /// [`RTree::rebuild`]; kept separate so `splice`'s tree-merge (which has
    /// no reason to re-derive mbrs from items it already holds) doesn't need
    /// a `T: Spatial` bound.
    fn rebuild_structure(&mut self) {
        self.nodes.clear();
        self.root = None;
        self.levels = 0;
        let ids: Vec<LeafId> = ListIter::new(&self.leaves, self.head).map(|(id, _, _)| id).collect();
        for id in ids {
            self.leaves.get_mut(id).parent = None;
            self.insert_leaf_into_tree(id);
        }
    }

    /// Moves every item out of `other` and into `self`, preserving relative
    /// insertion order (everything in `other` is treated as older than
    /// everything currently in `self`). `other` is left empty.
    pub fn splice(&mut self, other: &mut RTree<P, D, T>)
    where
        T: Clone,
    {
        if other.is_empty() {
            return;
        }
        if self.is_empty() {
            std::mem::swap(self, other);
            other.clear();
            return;
        }
        let self_ids: Vec<LeafId> = ListIter::new(&self.leaves, self.head).map(|(id, _, _)| id).collect();
        let other_ids: Vec<LeafId> = ListIter::new(&other.leaves, other.head).map(|(id, _, _)| id).collect();

        let mut merged = RTree::new_with_reinsertion(self.m, self.max, self.reinsert_enabled)
            .expect("capacity already validated by self");
        // other's items are older: reinsert them first so merged's insertion
        // list has self's items closer to the head, matching "self is newer".
        for id in other_ids.into_iter().rev() {
            let leaf = other.leaves.get(id);
            merged.insert_with_mbr(leaf.mbr.clone(), leaf.item.clone());
        }
        for id in self_ids.into_iter().rev() {
            let leaf = self.leaves.get(id);
            merged.insert_with_mbr(leaf.mbr.clone(), leaf.item.clone());
        }
        *self = merged;
        other.clear();
    }

    /// Debug-only structural invariant check: every node's cached MBR
    /// matches the union of its children, every non-root node has between
    /// `m` and `max` children, parent pointers agree with child membership,
    /// and the insertion-ordered list has exactly `len` entries.
    pub fn verify(&self) -> Result<(), RTreeError> {
        let Some(root) = self.root else {
            if self.len != 0 {
                return Err(RTreeError::InvariantViolation("empty root but nonzero len".into()));
            }
            return Ok(());
        };
        let mut leaf_count = 0;
        self.verify_node(root, self.levels - 1, true, &mut leaf_count)?;
        if leaf_count != self.len {
            return Err(RTreeError::InvariantViolation(format!(
                "tree holds {} leaves but len() reports {}",
                leaf_count, self.len
            )));
        }
        let list_count = ListIter::new(&self.leaves, self.head).count();
        if list_count != self.len {
            return Err(RTreeError::InvariantViolation(format!(
                "insertion list holds {} entries but len() reports {}",
                list_count, self.len
            )));
        }
        Ok(())
    }

    fn verify_node(&self, node_id: NodeId, node_depth: usize, is_root: bool, leaf_count: &mut usize) -> Result<(), RTreeError> {
        let node = self.nodes.get(node_id);
        let count = node.children.len();
        if !is_root && !(self.m..=self.max).contains(&count) {
            return Err(RTreeError::InvariantViolation(format!(
                "node at depth {} has {} children, outside [{}, {}]",
                node_depth, count, self.m, self.max
            )));
        }
        if is_root && count == 0 {
            return Err(RTreeError::InvariantViolation("root has zero children".into()));
        }
        let mut expected = Mbr::empty();
        match &node.children {
            Children::Leaves(ids) => {
                if node_depth != 0 {
                    return Err(RTreeError::InvariantViolation("leaf children at nonzero depth".into()));
                }
                for &id in ids {
                    let leaf = self.leaves.get(id);
                    if leaf.parent != Some(node_id) {
                        return Err(RTreeError::InvariantViolation("leaf parent pointer mismatch".into()));
                    }
                    expected.union(&leaf.mbr);
                    *leaf_count += 1;
                }
            }
            Children::Internal(ids) => {
                if node_depth == 0 {
                    return Err(RTreeError::InvariantViolation("internal children at depth zero".into()));
                }
                for &id in ids {
                    if self.nodes.get(id).parent != Some(node_id) {
                        return Err(RTreeError::InvariantViolation("node parent pointer mismatch".into()));
                    }
                    self.verify_node(id, node_depth - 1, false, leaf_count)?;
                    expected.union(&self.nodes.get(id).mbr);
                }
            }
        }
        if expected != node.mbr {
            return Err(RTreeError::InvariantViolation(format!(
                "node at depth {} has a stale cached mbr",
                node_depth
            )));
        }
        Ok(())
    }
}

impl<P: FP, const D: usize, T: Clone> Clone for RTree<P, D, T> {
    /// Rebuilds a fresh, equivalent tree by reinserting every item in
    /// insertion order; the result is semantically identical but not
    /// guaranteed to have the same internal node shape as `self`.
    fn clone(&self) -> Self {
        let mut new_tree = RTree::new_with_reinsertion(self.m, self.max, self.reinsert_enabled)
            .expect("source tree already validated its own capacity");
        let ordered: Vec<(Mbr<P, D>, T)> = ListIter::new(&self.leaves, self.head)
            .map(|(_, mbr, item)| (mbr.clone(), item.clone()))
            .collect();
        for (mbr, item) in ordered.into_iter().rev() {
            new_tree.insert_with_mbr(mbr, item);
        }
        new_tree
    }
}

impl<P: FP, const D: usize, T: Spatial<P, D>> RTree<P, D, T> {
    /// Inserts `item`, deriving its bounding rectangle from
    /// [`Spatial::mbr`]. Returns a stable handle to the new leaf.
    pub fn insert(&mut self, item: T) -> LeafId {
        let mbr = item.mbr();
        self.insert_with_mbr(mbr, item)
    }

    /// Re-homes the leaf at `id` after its item's bounding rectangle has
    /// changed - refreshes the cached `mbr` from [`Spatial::mbr`], detaches
    /// the leaf from its current parent (dissolving and reinserting any
    /// ancestor that would underflow, exactly as [`RTree::erase`] does), and
    /// descends from the root to re-home it under its new bounds.
    pub fn reinsert(&mut self, id: LeafId) {
        let parent = self.leaves.get(id).parent.expect("leaf not attached to a parent");
        self.detach_leaf_from_parent(parent, id);
        let new_mbr = self.leaves.get(id).item.mbr();
        self.leaves.get_mut(id).mbr = new_mbr;

        let mut orphans = Vec::new();
        self.fix_up_after_removal(parent, 0, &mut orphans);
        self.reinsert_orphans(orphans);
        self.insert_leaf_into_tree(id);
        trace!("reinserted leaf after mbr change");
    }

    /// Recomputes every leaf's cached `mbr` from its item via [`Spatial::mbr`],
    /// then recomputes every node's `mbr` bottom-up from its (unchanged) set
    /// of children. Does not reshape the tree - nodes that would now be
    /// structurally poorly organized stay where they are until [`RTree::rebuild`].
    pub fn update_mbrs(&mut self) {
        let ids: Vec<LeafId> = ListIter::new(&self.leaves, self.head).map(|(id, _, _)| id).collect();
        for id in ids {
            let mbr = self.leaves.get(id).item.mbr();
            self.leaves.get_mut(id).mbr = mbr;
        }
        if let Some(root) = self.root {
            self.recompute_mbr_subtree(root, self.levels - 1);
        }
    }

    fn recompute_mbr_subtree(&mut self, node_id: NodeId, node_depth: usize) {
        if node_depth > 0 {
            let ids = match &self.nodes.get(node_id).children {
                Children::Internal(ids) => ids.clone(),
                Children::Leaves(_) => unreachable!("leaf children at nonzero depth"),
            };
            for id in ids {
                self.recompute_mbr_subtree(id, node_depth - 1);
            }
        }
        self.recompute_mbr(node_id);
    }

    /// [`RTree::update_mbrs`] followed by a full structural rebuild: brings
    /// every cached `mbr` up to date with its item, then reinserts every leaf
    /// from scratch in current insertion-list order. Useful after mutating
    /// items in place (via [`RTree::iter_mut`]) without calling
    /// [`RTree::reinsert`] per item, or after a long run of erasures has left
    /// the tree poorly balanced.
    pub fn rebuild(&mut self) {
        self.update_mbrs();
        self.rebuild_structure();
    }
}

fn union_all<Id: Copy, P: FP, const D: usize>(entries: &[(Id, Mbr<P, D>)]) -> Mbr<P, D> {
    let mut mbr = Mbr::empty();
    for (_, m) in entries {
        mbr.union(m);
    }
    mbr
}

/// CSA1 + CSI1 + S1-S3: choose the axis and index minimizing summed margin,
/// then overlap, then area, and partition `entries` (exactly `max + 1` of
/// them) into two groups of at least `m` each.
fn choose_split<Id: Copy, P: FP, const D: usize>(
    entries: Vec<(Id, Mbr<P, D>)>,
    m: usize,
    max: usize,
) -> (Vec<(Id, Mbr<P, D>)>, Vec<(Id, Mbr<P, D>)>) {
    debug_assert_eq!(entries.len(), max + 1);
    let dim = entries[0].1.dim();
    let mut best_axis = 0;
    let mut best_margin_sum: Option<P> = None;
    for axis in 0..dim {
        let mut by_min = entries.clone();
        by_min.sort_by(|a, b| a.1.min_unchecked(axis).partial_cmp(&b.1.min_unchecked(axis)).unwrap());
        let mut by_max = entries.clone();
        by_max.sort_by(|a, b| a.1.max_unchecked(axis).partial_cmp(&b.1.max_unchecked(axis)).unwrap());
        let margin_sum = margin_sum_over_splits(&by_min, m, max) + margin_sum_over_splits(&by_max, m, max);
        if best_margin_sum.is_none() || margin_sum < best_margin_sum.unwrap() {
            best_margin_sum = Some(margin_sum);
            best_axis = axis;
        }
    }

    let mut by_min = entries.clone();
    by_min.sort_by(|a, b| a.1.min_unchecked(best_axis).partial_cmp(&b.1.min_unchecked(best_axis)).unwrap());
    let mut by_max = entries;
    by_max.sort_by(|a, b| a.1.max_unchecked(best_axis).partial_cmp(&b.1.max_unchecked(best_axis)).unwrap());

    let mut best_sorted = by_min.clone();
    let mut best_index = m;
    let mut best_overlap: Option<P> = None;
    let mut best_area = P::zero();
    for sorted in [&by_min, &by_max] {
        let (prefix, suffix) = prefix_suffix_mbrs(sorted);
        for k in m..=(max + 1 - m) {
            let overlap = prefix[k].overlap_volume(&suffix[k]);
            let area = prefix[k].volume() + suffix[k].volume();
            let better = match best_overlap {
                None => true,
                Some(bo) => overlap < bo || (overlap == bo && area < best_area),
            };
            if better {
                best_overlap = Some(overlap);
                best_area = area;
                best_index = k;
                best_sorted = sorted.clone();
            }
        }
    }
    let mut group_a = best_sorted;
    let group_b = group_a.split_off(best_index);
    (group_a, group_b)
}

fn margin_sum_over_splits<Id: Copy, P: FP, const D: usize>(sorted: &[(Id, Mbr<P, D>)], m: usize, max: usize) -> P {
    let (prefix, suffix) = prefix_suffix_mbrs(sorted);
    let mut sum = P::zero();
    for k in m..=(max + 1 - m) {
        sum = sum + prefix[k].perimeter() + suffix[k].perimeter();
    }
    sum
}

/// `prefix[i]` is the union of `sorted[0..i]`, `suffix[i]` the union of
/// `sorted[i..]`. Both are length `n + 1` so index `n` (all, or none) is
/// always available.
fn prefix_suffix_mbrs<Id: Copy, P: FP, const D: usize>(sorted: &[(Id, Mbr<P, D>)]) -> (Vec<Mbr<P, D>>, Vec<Mbr<P, D>>) {
    let n = sorted.len();
    let mut prefix = Vec::with_capacity(n + 1);
    prefix.push(Mbr::empty());
    for i in 0..n {
        let mut next = prefix[i].clone();
        next.union(&sorted[i].1);
        prefix.push(next);
    }
    let mut suffix = vec![Mbr::empty(); n + 1];
    for i in (0..n).rev() {
        let mut next = suffix[i + 1].clone();
        next.union(&sorted[i].1);
        suffix[i] = next;
    }
    (prefix, suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spatial::WithMbr;

    type Item<T> = WithMbr<f64, 2, T>;

    fn rect(lo: [f64; 2], hi: [f64; 2]) -> Mbr<f64, 2> {
        Mbr::from_corners(lo, hi)
    }

    fn item<T>(lo: [f64; 2], hi: [f64; 2], payload: T) -> Item<T> {
        WithMbr::new(rect(lo, hi), payload)
    }

    #[test]
    fn insert_and_query_overlap() {
        let mut tree: RTree<f64, 2, Item<&'static str>> = RTree::new(2, 4).unwrap();
        tree.insert(item([0.0, 0.0], [1.0, 1.0], "a"));
        tree.insert(item([5.0, 5.0], [6.0, 6.0], "b"));
        tree.insert(item([0.5, 0.5], [2.0, 2.0], "c"));
        assert_eq!(tree.len(), 3);
        tree.verify().unwrap();

        let found: Vec<&str> = tree
            .iter_query(crate::tree::query::RectQuery::Overlaps(rect([0.0, 0.0], [1.5, 1.5])))
            .map(|(_, _, entry)| entry.item)
            .collect();
        assert_eq!(found.len(), 2);
        assert!(found.contains(&"a"));
        assert!(found.contains(&"c"));
    }

    #[test]
    fn grows_levels_and_splits_under_volume() {
        let mut tree: RTree<f64, 2, Item<usize>> = RTree::new(2, 4).unwrap();
        for i in 0..200 {
            let x = i as f64;
            tree.insert(item([x, 0.0], [x + 0.5, 0.5], i));
        }
        assert_eq!(tree.len(), 200);
        tree.verify().unwrap();
    }

    #[test]
    fn erase_maintains_invariants() {
        let mut tree: RTree<f64, 2, Item<usize>> = RTree::new(2, 4).unwrap();
        let ids: Vec<_> = (0..100)
            .map(|i| {
                let x = i as f64;
                tree.insert(item([x, x], [x + 1.0, x + 1.0], i))
            })
            .collect();
        for (i, id) in ids.into_iter().enumerate() {
            if i % 3 == 0 {
                let (_, entry) = tree.erase(id);
                assert_eq!(entry.item, i);
                tree.verify().unwrap();
            }
        }
        assert_eq!(tree.len(), 100 - (0..100).filter(|i| i % 3 == 0).count());
    }

    #[test]
    fn remove_if_matches_predicate() {
        let mut tree: RTree<f64, 2, Item<usize>> = RTree::new(2, 4).unwrap();
        for i in 0..30 {
            let x = i as f64;
            tree.insert(item([x, x], [x + 1.0, x + 1.0], i));
        }
        let removed = tree.remove_if(|entry| entry.item % 2 == 0);
        assert_eq!(removed.len(), 15);
        tree.verify().unwrap();
        assert_eq!(tree.len(), 15);
    }

    #[test]
    fn last_reports_most_recent_insert() {
        let mut tree: RTree<f64, 2, Item<&'static str>> = RTree::new(2, 4).unwrap();
        tree.insert(item([0.0, 0.0], [1.0, 1.0], "first"));
        tree.insert(item([1.0, 1.0], [2.0, 2.0], "second"));
        assert_eq!(tree.last().map(|(_, entry)| entry.item), Some("second"));
    }

    #[test]
    fn clone_preserves_contents() {
        let mut tree: RTree<f64, 2, Item<usize>> = RTree::new(2, 4).unwrap();
        for i in 0..20 {
            let x = i as f64;
            tree.insert(item([x, x], [x + 1.0, x + 1.0], i));
        }
        let cloned = tree.clone();
        assert_eq!(cloned.len(), tree.len());
        cloned.verify().unwrap();
    }

    #[test]
    fn rebuild_preserves_contents_and_invariants() {
        let mut tree: RTree<f64, 2, Item<usize>> = RTree::new(2, 4).unwrap();
        for i in 0..50 {
            let x = i as f64;
            tree.insert(item([x, x], [x + 1.0, x + 1.0], i));
        }
        let to_remove: Vec<LeafId> = ListIter::new(&tree.leaves, tree.head)
            .filter(|(_, _, entry)| entry.item % 4 == 0)
            .map(|(id, _, _)| id)
            .collect();
        for id in to_remove {
            tree.erase(id);
        }
        tree.rebuild();
        tree.verify().unwrap();
    }

    #[test]
    fn splice_merges_two_trees() {
        let mut a: RTree<f64, 2, Item<usize>> = RTree::new(2, 4).unwrap();
        let mut b: RTree<f64, 2, Item<usize>> = RTree::new(2, 4).unwrap();
        for i in 0..10 {
            let x = i as f64;
            a.insert(item([x, x], [x + 1.0, x + 1.0], i));
        }
        for i in 10..20 {
            let x = i as f64;
            b.insert(item([x, x], [x + 1.0, x + 1.0], i));
        }
        a.splice(&mut b);
        assert_eq!(a.len(), 20);
        assert!(b.is_empty());
        a.verify().unwrap();
    }

    #[test]
    fn invalid_capacity_is_rejected() {
        assert!(RTree::<f64, 2, ()>::new(0, 4).is_err());
        assert!(RTree::<f64, 2, ()>::new(4, 5).is_err());
        assert!(RTree::<f64, 2, ()>::new(3, 5).is_ok());
    }

    #[test]
    fn reinsert_relocates_after_mbr_change() {
        let mut tree: RTree<f64, 2, MovablePoint> = RTree::new(2, 4).unwrap();
        for i in 0..20 {
            let x = i as f64;
            tree.insert(MovablePoint { pos: std::cell::Cell::new([x, x]) });
        }
        let moving = tree.insert(MovablePoint { pos: std::cell::Cell::new([0.0, 0.0]) });
        tree.verify().unwrap();

        tree.iter().find(|(id, _, _)| *id == moving).unwrap().2.pos.set([100.0, 100.0]);
        tree.reinsert(moving);
        tree.verify().unwrap();

        let found_old = tree
            .iter_query(crate::tree::query::RectQuery::Overlaps(rect([-0.5, -0.5], [0.5, 0.5])))
            .any(|(id, _, _)| id == moving);
        assert!(!found_old);

        let found_new = tree
            .iter_query(crate::tree::query::RectQuery::Overlaps(rect([99.5, 99.5], [100.5, 100.5])))
            .any(|(id, _, _)| id == moving);
        assert!(found_new);
    }

    #[test]
    fn update_mbrs_refreshes_cached_bounds_without_reshaping() {
        let mut tree: RTree<f64, 2, MovablePoint> = RTree::new(2, 4).unwrap();
        let mut ids = Vec::new();
        for i in 0..30 {
            ids.push(tree.insert(MovablePoint {
                pos: std::cell::Cell::new([i as f64, i as f64]),
            }));
        }
        for (_, _, p) in tree.iter() {
            p.pos.set([p.pos.get()[0] + 1000.0, p.pos.get()[1] + 1000.0]);
        }
        tree.update_mbrs();
        tree.verify().unwrap();
        for (_, mbr, p) in tree.iter() {
            let [x, y] = p.pos.get();
            assert_eq!(mbr.min_dim(0).unwrap(), x);
            assert_eq!(mbr.min_dim(1).unwrap(), y);
        }
    }

    struct MovablePoint {
        pos: std::cell::Cell<[f64; 2]>,
    }

    impl Spatial<f64, 2> for MovablePoint {
        fn mbr(&self) -> Mbr<f64, 2> {
            let [x, y] = self.pos.get();
            Mbr::from_point([x, y])
        }
    }
}
