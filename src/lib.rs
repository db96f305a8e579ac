// Copyright 2016 spatial-rs Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! An N-dimensional, in-memory R*-tree spatial index.
//!
//! [`RTree`] stores axis-aligned bounding rectangles ([`Mbr`]) alongside
//! arbitrary items, keeping them organized for efficient overlap and
//! containment queries ([`RectQuery`]). Insertion follows Beckmann et al.'s
//! R*-tree: choose-subtree with overlap minimization near the leaves, split
//! by minimal margin/overlap/area, and forced reinsertion in place of an
//! immediate split where possible.

mod arena;
pub mod error;
pub mod mbr;
pub mod spatial;
pub mod tree;

use num_traits::{Bounded, Float, FromPrimitive, Signed, ToPrimitive};
use std::fmt::Debug;
use std::ops::{AddAssign, MulAssign};

pub use error::RTreeError;
pub use mbr::Mbr;
pub use spatial::{Spatial, WithMbr};
pub use tree::node::{Children, Leaf, LeafId, Node, NodeId};
pub use tree::query::{Everything, RectQuery, TreeQuery};
pub use tree::RTree;

/// The numeric coordinate type an [`RTree`] can be built over.
///
/// Bundles the handful of bounds the MBR algebra and R*-tree algorithm
/// actually need - floating point arithmetic and ordering, additive/
/// multiplicative assignment for the split margin accumulators, and
/// conversions used by the forced-reinsertion distance ranking.
pub trait FP: Float + Signed + Bounded + MulAssign + AddAssign + ToPrimitive + FromPrimitive + Copy + Debug + Default {}

impl<P> FP for P where P: Float + Signed + Bounded + MulAssign + AddAssign + ToPrimitive + FromPrimitive + Copy + Debug + Default {}
