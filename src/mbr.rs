// Copyright 2016 spatial-rs Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The minimum bounding rectangle (MBR) and its algebra.
//!
//! `Mbr` is either empty, or carries a `min`/`max` coordinate pair per axis.
//! The empty MBR is the identity element for [`Mbr::union`] and is absorbing
//! for [`Mbr::intersection`].

use crate::error::RTreeError;
use crate::FP;
use num_traits::Bounded;

/// An axis-aligned minimum bounding rectangle in `D` dimensions.
#[derive(Debug, Clone, PartialEq)]
pub struct Mbr<P, const D: usize> {
    min: [P; D],
    max: [P; D],
    empty: bool,
}

impl<P: FP, const D: usize> Mbr<P, D> {
    /// The empty MBR. Absorbed by unions, absorbing for intersections.
    pub fn empty() -> Mbr<P, D> {
        Mbr {
            min: [P::default(); D],
            max: [P::default(); D],
            empty: true,
        }
    }

    /// Builds an MBR from per-axis `(min, max)` pairs. Panics if any pair is
    /// out of order or non-finite; callers that expand from raw points should
    /// prefer [`Mbr::from_point`] and [`Mbr::union`].
    pub fn new(mut min: [P; D], mut max: [P; D]) -> Mbr<P, D> {
        for i in 0..D {
            assert!(min[i].is_finite(), "{:?} should be finite", min[i]);
            assert!(max[i].is_finite(), "{:?} should be finite", max[i]);
            if min[i] > max[i] {
                std::mem::swap(&mut min[i], &mut max[i]);
            }
        }
        Mbr { min, max, empty: false }
    }

    /// A degenerate MBR whose min and max are both `coords` - a single point.
    pub fn from_point(coords: [P; D]) -> Mbr<P, D> {
        Mbr::new(coords, coords)
    }

    /// An MBR bounding two opposite corners, in any order.
    pub fn from_corners(a: [P; D], b: [P; D]) -> Mbr<P, D> {
        let mut min = a;
        let mut max = a;
        for i in 0..D {
            min[i] = a[i].min(b[i]);
            max[i] = a[i].max(b[i]);
        }
        Mbr { min, max, empty: false }
    }

    /// An inverted MBR, `(MAX, MIN)` per axis. Union-expanding against it
    /// produces the bounds of whatever was unioned in; used by node rebuilds
    /// that fold over children starting from "nothing seen yet".
    pub fn max_inverted() -> Mbr<P, D> {
        Mbr {
            min: [Bounded::max_value(); D],
            max: [Bounded::min_value(); D],
            empty: false,
        }
    }

    /// The largest representable MBR, `(MIN, MAX)` per axis.
    pub fn largest() -> Mbr<P, D> {
        Mbr {
            min: [Bounded::min_value(); D],
            max: [Bounded::max_value(); D],
            empty: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.empty
    }

    pub fn dim(&self) -> usize {
        D
    }

    fn check_axis(&self, axis: usize) -> Result<(), RTreeError> {
        if axis >= D {
            return Err(RTreeError::DimensionOutOfRange { axis, dim: D });
        }
        if self.empty {
            return Err(RTreeError::EmptyMbrAccess);
        }
        Ok(())
    }

    /// The minimum coordinate on `axis`.
    pub fn min_dim(&self, axis: usize) -> Result<P, RTreeError> {
        self.check_axis(axis)?;
        Ok(self.min[axis])
    }

    /// The maximum coordinate on `axis`.
    pub fn max_dim(&self, axis: usize) -> Result<P, RTreeError> {
        self.check_axis(axis)?;
        Ok(self.max[axis])
    }

    /// Minimum coordinate on `axis`, without emptiness/range checks. Only
    /// used internally where the axis and non-emptiness are already known.
    pub(crate) fn min_unchecked(&self, axis: usize) -> P {
        self.min[axis]
    }

    pub(crate) fn max_unchecked(&self, axis: usize) -> P {
        self.max[axis]
    }

    /// Expands `self` in place to include `other`. `self += other` in the
    /// original C++. An empty `other` leaves `self` unchanged; an empty
    /// `self` is replaced by `other`.
    pub fn union(&mut self, other: &Mbr<P, D>) {
        if other.empty {
            return;
        }
        if self.empty {
            *self = other.clone();
            return;
        }
        for i in 0..D {
            if other.min[i] < self.min[i] {
                self.min[i] = other.min[i];
            }
            if other.max[i] > self.max[i] {
                self.max[i] = other.max[i];
            }
        }
    }

    /// Expands `self` in place to include a raw point.
    pub fn union_point(&mut self, coords: &[P; D]) {
        if self.empty {
            self.min = *coords;
            self.max = *coords;
            self.empty = false;
            return;
        }
        for i in 0..D {
            self.min[i] = self.min[i].min(coords[i]);
            self.max[i] = self.max[i].max(coords[i]);
        }
    }

    /// The union of two MBRs as a new value.
    pub fn union_of(&self, other: &Mbr<P, D>) -> Mbr<P, D> {
        let mut ret = self.clone();
        ret.union(other);
        ret
    }

    /// The intersection of two MBRs, empty if they are disjoint or either
    /// input is empty.
    pub fn intersection(&self, other: &Mbr<P, D>) -> Mbr<P, D> {
        if self.empty || other.empty {
            return Mbr::empty();
        }
        let mut min = [P::default(); D];
        let mut max = [P::default(); D];
        for i in 0..D {
            if other.min[i] > self.max[i] || other.max[i] < self.min[i] {
                return Mbr::empty();
            }
            min[i] = if other.min[i] > self.min[i] { other.min[i] } else { self.min[i] };
            max[i] = if other.max[i] < self.max[i] { other.max[i] } else { self.max[i] };
        }
        Mbr { min, max, empty: false }
    }

    /// Whether `self` and `other` share any point. Two empty MBRs never
    /// intersect.
    pub fn intersects(&self, other: &Mbr<P, D>) -> bool {
        if self.empty || other.empty {
            return false;
        }
        for i in 0..D {
            if other.min[i] > self.max[i] || other.max[i] < self.min[i] {
                return false;
            }
        }
        true
    }

    /// Whether `other` lies entirely within `self`.
    pub fn contains(&self, other: &Mbr<P, D>) -> bool {
        if self.empty || other.empty {
            return false;
        }
        for i in 0..D {
            if other.min[i] < self.min[i] || other.max[i] > self.max[i] {
                return false;
            }
        }
        true
    }

    /// Whether `point` lies within `self`, inclusive of the boundary.
    pub fn contains_point(&self, point: &[P; D]) -> bool {
        if self.empty {
            return false;
        }
        for i in 0..D {
            if point[i] < self.min[i] || point[i] > self.max[i] {
                return false;
            }
        }
        true
    }

    /// The D-dimensional volume. Zero for an empty MBR, and zero for any
    /// degenerate (zero-extent) MBR.
    pub fn volume(&self) -> P {
        if self.empty {
            return P::zero();
        }
        let mut ret = self.max[0] - self.min[0];
        for i in 1..D {
            ret = ret * (self.max[i] - self.min[i]);
        }
        ret
    }

    /// The sum of edge lengths across all axes, doubled - used as the
    /// "margin" the R* split minimizes.
    pub fn perimeter(&self) -> P {
        if self.empty {
            return P::zero();
        }
        let mut ret = self.max[0] - self.min[0];
        for i in 1..D {
            ret = ret + (self.max[i] - self.min[i]);
        }
        ret * (P::one() + P::one())
    }

    /// The squared distance between the centers of `self` and `other`. Used
    /// by forced reinsertion to rank children by how far their center lies
    /// from the node's center.
    pub fn squared_center_distance(&self, other: &Mbr<P, D>) -> P {
        let two = P::one() + P::one();
        let four = two * two;
        let mut ret = P::zero();
        for i in 0..D {
            let delta = other.min[i] + other.max[i] - self.min[i] - self.max[i];
            ret = ret + delta * delta;
        }
        ret / four
    }

    /// The volume shared between `self` and `other`, zero if they don't
    /// overlap or either is empty.
    pub fn overlap_volume(&self, other: &Mbr<P, D>) -> P {
        if self.empty || other.empty {
            return P::zero();
        }
        let mut ret = P::default();
        for i in 0..D {
            let lo = if other.min[i] > self.min[i] { other.min[i] } else { self.min[i] };
            let hi = if other.max[i] < self.max[i] { other.max[i] } else { self.max[i] };
            if lo >= hi {
                return P::zero();
            }
            ret = if i == 0 { hi - lo } else { ret * (hi - lo) };
        }
        ret
    }

    /// The volume of the union of `self` and `other`, without materializing
    /// the union MBR.
    pub fn union_volume(&self, other: &Mbr<P, D>) -> P {
        if self.empty && other.empty {
            return P::zero();
        }
        if self.empty {
            return other.volume();
        }
        if other.empty {
            return self.volume();
        }
        let mut ret = P::default();
        for i in 0..D {
            let lo = if other.min[i] < self.min[i] { other.min[i] } else { self.min[i] };
            let hi = if other.max[i] > self.max[i] { other.max[i] } else { self.max[i] };
            ret = if i == 0 { hi - lo } else { ret * (hi - lo) };
        }
        ret
    }
}
