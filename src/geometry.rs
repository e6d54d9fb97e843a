//! Flat display-pixel-space geometry.
//!
//! Grounded on `utils::rectangle::Rectangle` (simple `{x, y, width, height}`
//! struct), generalized with the set of operations the region engine and
//! plane manager need (`overlaps`, `intersection`, `subtract`, `merge`) that
//! the teacher's generic, phantom-tagged `utils::geometry::Rectangle<N, Kind>`
//! provides for its Logical/Physical/Buffer coordinate spaces. This crate has
//! only one coordinate space (display pixels), so the `Kind` type parameter
//! is dropped rather than carried around unused.

use std::cmp::{max, min};

/// An axis-aligned rectangle in display-pixel space, top-left + dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Rect {
    /// x coordinate of the top-left corner
    pub x: i32,
    /// y coordinate of the top-left corner
    pub y: i32,
    /// width in pixels
    pub width: i32,
    /// height in pixels
    pub height: i32,
}

impl Rect {
    /// Builds a rectangle from its top-left corner and size.
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self { x, y, width, height }
    }

    /// Right edge, exclusive.
    pub fn right(&self) -> i32 {
        self.x + self.width
    }

    /// Bottom edge, exclusive.
    pub fn bottom(&self) -> i32 {
        self.y + self.height
    }

    /// True if the rectangle covers no area.
    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    /// Checks whether a point lies inside the rectangle.
    pub fn contains(&self, point: (i32, i32)) -> bool {
        let (x, y) = point;
        (x >= self.x) && (x < self.right()) && (y >= self.y) && (y < self.bottom())
    }

    /// True if two rectangles share any interior area.
    pub fn overlaps(&self, other: &Rect) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }
        self.x < other.right() && other.x < self.right() && self.y < other.bottom() && other.y < self.bottom()
    }

    /// Largest rectangle contained in both, or `None` if they don't overlap.
    pub fn intersection(&self, other: &Rect) -> Option<Rect> {
        if !self.overlaps(other) {
            return None;
        }
        let x = max(self.x, other.x);
        let y = max(self.y, other.y);
        let right = min(self.right(), other.right());
        let bottom = min(self.bottom(), other.bottom());
        Some(Rect::new(x, y, right - x, bottom - y))
    }

    /// Smallest rectangle containing both.
    pub fn merge(&self, other: &Rect) -> Rect {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        let x = min(self.x, other.x);
        let y = min(self.y, other.y);
        let right = max(self.right(), other.right());
        let bottom = max(self.bottom(), other.bottom());
        Rect::new(x, y, right - x, bottom - y)
    }

    /// Smallest rectangle containing an entire slice of rectangles.
    pub fn bounding_box(rects: &[Rect]) -> Option<Rect> {
        rects.iter().filter(|r| !r.is_empty()).copied().reduce(|a, b| a.merge(&b))
    }

    /// Splits `self` into the up-to-four rectangles left over after removing `other`.
    ///
    /// Used by the region engine to punch a dedicated layer's rectangle out of
    /// the surrounding composition region (`original_source` `SeparateLayers`'s
    /// exclude-mask truncation).
    pub fn subtract(&self, other: &Rect) -> Vec<Rect> {
        let Some(overlap) = self.intersection(other) else {
            return vec![*self];
        };
        let mut out = Vec::with_capacity(4);
        if overlap.y > self.y {
            out.push(Rect::new(self.x, self.y, self.width, overlap.y - self.y));
        }
        if overlap.bottom() < self.bottom() {
            out.push(Rect::new(self.x, overlap.bottom(), self.width, self.bottom() - overlap.bottom()));
        }
        if overlap.x > self.x {
            out.push(Rect::new(self.x, overlap.y, overlap.x - self.x, overlap.height));
        }
        if overlap.right() < self.right() {
            out.push(Rect::new(overlap.right(), overlap.y, self.right() - overlap.right(), overlap.height));
        }
        out
    }
}

/// A point in display-pixel space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Point {
    /// horizontal coordinate
    pub x: i32,
    /// vertical coordinate
    pub y: i32,
}

impl Point {
    /// Builds a new point.
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// The 8 canonical scanout transforms a plane or connector can apply:
/// the 4 rotations, each optionally flipped, as exposed by the KMS `rotation`
/// plane property plus the `reflect-x` bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transform {
    /// No transform.
    #[default]
    Normal,
    /// Rotated 90 degrees clockwise.
    _90,
    /// Rotated 180 degrees.
    _180,
    /// Rotated 270 degrees clockwise.
    _270,
    /// Flipped horizontally, no rotation.
    Flipped,
    /// Flipped horizontally, then rotated 90 degrees clockwise.
    Flipped90,
    /// Flipped horizontally, then rotated 180 degrees.
    Flipped180,
    /// Flipped horizontally, then rotated 270 degrees clockwise.
    Flipped270,
}

impl Transform {
    /// The transform that undoes this one.
    pub fn invert(&self) -> Transform {
        match self {
            Transform::Normal => Transform::Normal,
            Transform::_90 => Transform::_270,
            Transform::_180 => Transform::_180,
            Transform::_270 => Transform::_90,
            Transform::Flipped => Transform::Flipped,
            Transform::Flipped90 => Transform::Flipped90,
            Transform::Flipped180 => Transform::Flipped180,
            Transform::Flipped270 => Transform::Flipped270,
        }
    }

    /// True for the four variants that swap width and height.
    pub fn swaps_dimensions(&self) -> bool {
        matches!(self, Transform::_90 | Transform::_270 | Transform::Flipped90 | Transform::Flipped270)
    }

    /// Applies the transform to a size, swapping dimensions where the rotation calls for it.
    pub fn transform_size(&self, width: i32, height: i32) -> (i32, i32) {
        if self.swaps_dimensions() {
            (height, width)
        } else {
            (width, height)
        }
    }
}
