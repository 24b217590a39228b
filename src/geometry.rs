//! Integer rectangles in global grid coordinates
//!
//! All boxes are inclusive on both ends, matching how tile and sector
//! bounds are expressed (`hi = lo + extent - 1`). An empty box has
//! `hi < lo` on at least one axis.

use std::fmt;

#[cfg(feature = "serialization")]
use serde::{Deserialize, Serialize};

/// Grid coordinate type
pub type Coord = i64;

/// A point on the global grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
pub struct Point {
    /// Column
    pub x: Coord,
    /// Row
    pub y: Coord,
}

impl Point {
    /// Create a point
    pub const fn new(x: Coord, y: Coord) -> Self {
        Self { x, y }
    }
}

/// Inclusive axis-aligned rectangle `[lo, hi]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
pub struct Rect {
    /// Lower-left (smallest) corner
    pub lo: Point,
    /// Upper-right (largest) corner, inclusive
    pub hi: Point,
}

impl Rect {
    /// Create a rectangle from its inclusive corners
    pub const fn new(lo: Point, hi: Point) -> Self {
        Self { lo, hi }
    }

    /// Create a rectangle from raw coordinates
    pub const fn from_coords(lo_x: Coord, lo_y: Coord, hi_x: Coord, hi_y: Coord) -> Self {
        Self {
            lo: Point::new(lo_x, lo_y),
            hi: Point::new(hi_x, hi_y),
        }
    }

    /// Number of columns (0 when empty)
    pub fn width(&self) -> Coord {
        (self.hi.x - self.lo.x + 1).max(0)
    }

    /// Number of rows (0 when empty)
    pub fn height(&self) -> Coord {
        (self.hi.y - self.lo.y + 1).max(0)
    }

    /// Number of cells
    pub fn volume(&self) -> u64 {
        (self.width() * self.height()) as u64
    }

    /// Whether the rectangle contains no cells
    pub fn is_empty(&self) -> bool {
        self.hi.x < self.lo.x || self.hi.y < self.lo.y
    }

    /// Whether `p` lies inside the rectangle
    pub fn contains_point(&self, p: Point) -> bool {
        p.x >= self.lo.x && p.x <= self.hi.x && p.y >= self.lo.y && p.y <= self.hi.y
    }

    /// Whether `other` lies entirely inside this rectangle
    ///
    /// An empty rectangle is contained in everything.
    pub fn contains(&self, other: &Rect) -> bool {
        other.is_empty()
            || (other.lo.x >= self.lo.x
                && other.hi.x <= self.hi.x
                && other.lo.y >= self.lo.y
                && other.hi.y <= self.hi.y)
    }

    /// Intersection of two rectangles (possibly empty)
    pub fn intersection(&self, other: &Rect) -> Rect {
        Rect::from_coords(
            self.lo.x.max(other.lo.x),
            self.lo.y.max(other.lo.y),
            self.hi.x.min(other.hi.x),
            self.hi.y.min(other.hi.y),
        )
    }

    /// Whether the two rectangles share at least one cell
    pub fn overlaps(&self, other: &Rect) -> bool {
        !self.intersection(other).is_empty()
    }

    /// Iterate over every point in row-major order
    pub fn points(&self) -> impl Iterator<Item = Point> + '_ {
        let (lo, hi) = (self.lo, self.hi);
        (lo.y..=hi.y).flat_map(move |y| (lo.x..=hi.x).map(move |x| Point::new(x, y)))
    }
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}) -- ({}, {})",
            self.lo.x, self.lo.y, self.hi.x, self.hi.y
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extent_and_volume() {
        let r = Rect::from_coords(2, 3, 5, 4);
        assert_eq!(r.width(), 4);
        assert_eq!(r.height(), 2);
        assert_eq!(r.volume(), 8);
        assert!(!r.is_empty());

        let empty = Rect::from_coords(3, 0, 2, 9);
        assert!(empty.is_empty());
        assert_eq!(empty.volume(), 0);
    }

    #[test]
    fn test_intersection() {
        let a = Rect::from_coords(0, 0, 5, 5);
        let b = Rect::from_coords(4, 3, 9, 9);
        assert_eq!(a.intersection(&b), Rect::from_coords(4, 3, 5, 5));
        assert!(a.overlaps(&b));

        let c = Rect::from_coords(6, 0, 9, 2);
        assert!(!a.overlaps(&c));
    }

    #[test]
    fn test_contains() {
        let outer = Rect::from_coords(0, 0, 7, 7);
        assert!(outer.contains(&Rect::from_coords(1, 1, 7, 3)));
        assert!(!outer.contains(&Rect::from_coords(1, 1, 8, 3)));
        assert!(outer.contains(&Rect::from_coords(5, 5, 4, 4)));
        assert!(outer.contains_point(Point::new(7, 0)));
    }

    #[test]
    fn test_points_row_major() {
        let pts: Vec<_> = Rect::from_coords(0, 0, 1, 1).points().collect();
        assert_eq!(
            pts,
            vec![
                Point::new(0, 0),
                Point::new(1, 0),
                Point::new(0, 1),
                Point::new(1, 1)
            ]
        );
    }
}
