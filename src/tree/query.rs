// Copyright 2016 spatial-rs Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Predicates that drive [`super::iter::TreeIter`].
//!
//! A query is split into two predicates: one decides whether to descend into
//! a node (by its MBR), the other whether to accept a leaf. Splitting them
//! lets `iter_query` prune whole subtrees instead of visiting every leaf.

use crate::mbr::Mbr;
use crate::FP;

/// Accept/reject predicates for a tree walk.
pub trait TreeQuery<P, const D: usize, T> {
    /// Whether to descend into a node with this bounding rectangle.
    fn accept_node(&self, mbr: &Mbr<P, D>) -> bool;

    /// Whether to yield a leaf with this bounding rectangle and item.
    fn accept_leaf(&self, mbr: &Mbr<P, D>, item: &T) -> bool;
}

/// The two common region queries: overlap and full containment.
pub enum RectQuery<P, const D: usize> {
    Overlaps(Mbr<P, D>),
    ContainedBy(Mbr<P, D>),
}

impl<P: FP, const D: usize> RectQuery<P, D> {
    fn region(&self) -> &Mbr<P, D> {
        match self {
            RectQuery::Overlaps(r) => r,
            RectQuery::ContainedBy(r) => r,
        }
    }
}

impl<P: FP, const D: usize, T> TreeQuery<P, D, T> for RectQuery<P, D> {
    fn accept_node(&self, mbr: &Mbr<P, D>) -> bool {
        // A node only needs to be *touched* by the query region to be worth
        // descending into, even for a ContainedBy query: some of its leaves
        // may still be fully contained.
        self.region().intersects(mbr)
    }

    fn accept_leaf(&self, mbr: &Mbr<P, D>, _item: &T) -> bool {
        match self {
            RectQuery::Overlaps(r) => r.intersects(mbr),
            RectQuery::ContainedBy(r) => r.contains(mbr),
        }
    }
}

/// Accepts every node and leaf - used for unconstrained traversal.
pub struct Everything;

impl<P, const D: usize, T> TreeQuery<P, D, T> for Everything {
    fn accept_node(&self, _mbr: &Mbr<P, D>) -> bool {
        true
    }
    fn accept_leaf(&self, _mbr: &Mbr<P, D>, _item: &T) -> bool {
        true
    }
}
