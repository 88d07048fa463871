//! Planar vectors and pixel-aligned bounding regions.

use serde::{Deserialize, Serialize};
use std::ops::{Add, Div, Mul, Neg, Sub};

const FULL_TURN: f64 = std::f64::consts::TAU;
const HALF_TURN: f64 = std::f64::consts::PI;

/// Wraps an angle into `(-π, π]`.
#[must_use]
pub fn wrap_signed_angle(mut angle: f64) -> f64 {
    if !angle.is_finite() {
        return angle;
    }
    angle %= FULL_TURN;
    if angle <= -HALF_TURN {
        angle += FULL_TURN;
    } else if angle > HALF_TURN {
        angle -= FULL_TURN;
    }
    angle
}

/// Point or displacement in image coordinates (x to the right, y down).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    #[must_use]
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Unit vector pointing along `angle` radians.
    #[must_use]
    pub fn from_angle(angle: f64) -> Self {
        Self::new(angle.cos(), angle.sin())
    }

    #[must_use]
    pub fn dot(self, other: Self) -> f64 {
        self.x * other.x + self.y * other.y
    }

    #[must_use]
    pub fn norm(self) -> f64 {
        self.dot(self).sqrt()
    }

    #[must_use]
    pub fn distance(self, other: Self) -> f64 {
        (self - other).norm()
    }

    /// Returns the unit vector in the same direction, or `None` for a zero-length input.
    #[must_use]
    pub fn normalized(self) -> Option<Self> {
        let norm = self.norm();
        (norm > f64::EPSILON && norm.is_finite()).then(|| self / norm)
    }

    #[must_use]
    pub fn angle(self) -> f64 {
        self.y.atan2(self.x)
    }
}

impl Add for Point {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl Sub for Point {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl Mul<f64> for Point {
    type Output = Self;

    fn mul(self, rhs: f64) -> Self {
        Self::new(self.x * rhs, self.y * rhs)
    }
}

impl Div<f64> for Point {
    type Output = Self;

    fn div(self, rhs: f64) -> Self {
        Self::new(self.x / rhs, self.y / rhs)
    }
}

impl Neg for Point {
    type Output = Self;

    fn neg(self) -> Self {
        Self::new(-self.x, -self.y)
    }
}

/// Half-open pixel rectangle `[left, right) x [top, bottom)`.
///
/// Coordinates are signed so that regions of cells hanging over the image
/// border can be represented before clipping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Region {
    pub left: i64,
    pub top: i64,
    pub right: i64,
    pub bottom: i64,
}

impl Default for Region {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl Region {
    pub const EMPTY: Self = Self {
        left: 0,
        top: 0,
        right: 0,
        bottom: 0,
    };

    #[must_use]
    pub const fn new(left: i64, top: i64, right: i64, bottom: i64) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    /// Region covering a whole `width x height` image.
    #[must_use]
    pub fn full(width: usize, height: usize) -> Self {
        Self::new(0, 0, width as i64, height as i64)
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.right <= self.left || self.bottom <= self.top
    }

    #[must_use]
    pub const fn width(&self) -> i64 {
        if self.is_empty() {
            0
        } else {
            self.right.saturating_sub(self.left)
        }
    }

    #[must_use]
    pub const fn height(&self) -> i64 {
        if self.is_empty() {
            0
        } else {
            self.bottom.saturating_sub(self.top)
        }
    }

    #[must_use]
    pub const fn area(&self) -> i64 {
        self.width().saturating_mul(self.height())
    }

    #[must_use]
    pub const fn contains(&self, x: i64, y: i64) -> bool {
        x >= self.left && x < self.right && y >= self.top && y < self.bottom
    }

    /// Smallest region containing both inputs; empty inputs are ignored.
    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        Self::new(
            self.left.min(other.left),
            self.top.min(other.top),
            self.right.max(other.right),
            self.bottom.max(other.bottom),
        )
    }

    #[must_use]
    pub fn intersect(&self, other: &Self) -> Self {
        let region = Self::new(
            self.left.max(other.left),
            self.top.max(other.top),
            self.right.min(other.right),
            self.bottom.min(other.bottom),
        );
        if region.is_empty() {
            Self::EMPTY
        } else {
            region
        }
    }

    /// Grows the region by `margin` pixels on every side.
    #[must_use]
    pub fn expand(&self, margin: i64) -> Self {
        if self.is_empty() || margin == 0 {
            return *self;
        }
        Self::new(
            self.left.saturating_sub(margin),
            self.top.saturating_sub(margin),
            self.right.saturating_add(margin),
            self.bottom.saturating_add(margin),
        )
    }

    /// Restricts the region to a `width x height` image.
    #[must_use]
    pub fn clip(&self, width: usize, height: usize) -> Self {
        self.intersect(&Self::full(width, height))
    }

    /// Iterates pixel coordinates in row-major order.
    pub fn pixels(&self) -> impl Iterator<Item = (i64, i64)> + use<> {
        let (left, right) = (self.left, self.right);
        let rows = if self.is_empty() {
            0..0
        } else {
            self.top..self.bottom
        };
        rows.flat_map(move |y| (left..right).map(move |x| (x, y)))
    }
}
