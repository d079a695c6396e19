//! Axis-aligned ranges and the grow-only project extents tracker.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::transform::Point3d;

/// An axis-aligned box. Always non-empty; "no range" is `Option::None`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Range3d {
    pub low: Point3d,
    pub high: Point3d,
}

impl Range3d {
    pub fn from_point(p: Point3d) -> Self {
        Self { low: p, high: p }
    }

    /// Smallest range containing every point, or `None` for no points.
    pub fn from_points<'a, I>(points: I) -> Option<Self>
    where
        I: IntoIterator<Item = &'a Point3d>,
    {
        let mut iter = points.into_iter();
        let first = iter.next()?;
        let mut range = Self::from_point(*first);
        for p in iter {
            range.extend_point(p);
        }
        Some(range)
    }

    pub fn extend_point(&mut self, p: &Point3d) {
        self.low = Point3d::new(self.low.x.min(p.x), self.low.y.min(p.y), self.low.z.min(p.z));
        self.high = Point3d::new(
            self.high.x.max(p.x),
            self.high.y.max(p.y),
            self.high.z.max(p.z),
        );
    }

    pub fn union(&self, other: &Range3d) -> Range3d {
        let mut out = *self;
        out.extend_point(&other.low);
        out.extend_point(&other.high);
        out
    }

    pub fn contains(&self, other: &Range3d) -> bool {
        self.low.x <= other.low.x
            && self.low.y <= other.low.y
            && self.low.z <= other.low.z
            && self.high.x >= other.high.x
            && self.high.y >= other.high.y
            && self.high.z >= other.high.z
    }

    pub fn size(&self) -> Point3d {
        self.high.sub(&self.low)
    }

    pub fn offset(&self, by: &Point3d) -> Range3d {
        Range3d {
            low: self.low.add(by),
            high: self.high.add(by),
        }
    }
}

/// Accumulates project extents across a run. Extents only ever grow:
/// deleting geometry never shrinks what was previously recorded.
#[derive(Debug, Clone, Default)]
pub struct ExtentsTracker {
    initial: Option<Range3d>,
    current: Option<Range3d>,
}

impl ExtentsTracker {
    /// Start from the extents already recorded in the target.
    pub fn new(initial: Option<Range3d>) -> Self {
        Self {
            initial,
            current: initial,
        }
    }

    pub fn extend(&mut self, range: &Range3d) {
        self.current = Some(match self.current {
            Some(current) => current.union(range),
            None => *range,
        });
    }

    pub fn current(&self) -> Option<Range3d> {
        self.current
    }

    /// `true` if the extents grew since the tracker was created.
    pub fn has_grown(&self) -> bool {
        let grown = match (self.initial, self.current) {
            (None, Some(_)) => true,
            (Some(initial), Some(current)) => initial != current,
            _ => false,
        };
        debug!(grown, "checked project extents");
        grown
    }
}
