//! Cell primitives: capsule-shaped bacilli and spheres.
//!
//! Names encode ancestry: a root carries an arbitrary label and every split
//! appends `"0"` or `"1"` for the two daughters.

use crate::geometry::{Point, Region};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Largest pixel area a single cell may cover before it is considered degenerate.
const MAX_RENDER_AREA: i64 = 1 << 24;

/// Largest coordinate magnitude a renderable cell may use; beyond it pixel
/// bounds no longer fit the raster integer type.
const MAX_COORDINATE: f64 = 1e9;

/// Errors raised by split and combine.
#[derive(Debug, Error, PartialEq)]
pub enum CellError {
    #[error("split ratio {0} must lie strictly between 0 and 1")]
    InvalidAlpha(f64),
    #[error("cannot combine a {0} with a {1}")]
    IncompatibleVariants(CellType, CellType),
    #[error("cells {0:?} and {1:?} are not sibling split products")]
    NotSiblings(String, String),
    #[error("cells {0:?} and {1:?} share a center")]
    Degenerate(String, String),
}

/// Supported cell shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum CellType {
    #[default]
    Bacilli,
    Sphere,
}

impl fmt::Display for CellType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bacilli => f.write_str("bacilli"),
            Self::Sphere => f.write_str("sphere"),
        }
    }
}

/// Scalar cell attributes that perturbations may offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Field {
    X,
    Y,
    Z,
    Width,
    Length,
    Rotation,
    Radius,
}

impl CellType {
    /// Fields a perturbation may touch for this shape.
    #[must_use]
    pub const fn fields(self) -> &'static [Field] {
        match self {
            Self::Bacilli => &[
                Field::X,
                Field::Y,
                Field::Width,
                Field::Length,
                Field::Rotation,
            ],
            Self::Sphere => &[Field::X, Field::Y, Field::Z, Field::Radius],
        }
    }
}

/// Rod-shaped cell: a rectangle capped by two half discs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bacilli {
    pub name: String,
    pub position: Point,
    pub width: f64,
    pub length: f64,
    pub rotation: f64,
    pub split_alpha: Option<f64>,
    pub opacity: Option<f64>,
}

impl Bacilli {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        x: f64,
        y: f64,
        width: f64,
        length: f64,
        rotation: f64,
    ) -> Self {
        Self {
            name: name.into(),
            position: Point::new(x, y),
            width,
            length,
            rotation,
            split_alpha: None,
            opacity: None,
        }
    }

    #[must_use]
    pub fn direction(&self) -> Point {
        Point::from_angle(self.rotation)
    }

    /// Center of the front cap.
    #[must_use]
    pub fn head(&self) -> Point {
        self.position + self.direction() * ((self.length - self.width) / 2.0)
    }

    /// Center of the back cap.
    #[must_use]
    pub fn tail(&self) -> Point {
        self.position - self.direction() * ((self.length - self.width) / 2.0)
    }

    fn region(&self) -> Region {
        let (head, tail) = (self.head(), self.tail());
        let radius = self.width / 2.0;
        Region::new(
            (head.x.min(tail.x) - radius).floor() as i64,
            (head.y.min(tail.y) - radius).floor() as i64,
            ((head.x.max(tail.x) + radius).ceil() as i64).saturating_add(1),
            ((head.y.max(tail.y) + radius).ceil() as i64).saturating_add(1),
        )
    }

    fn covers(&self, point: Point) -> bool {
        let (head, tail) = (self.head(), self.tail());
        let axis = head - tail;
        let span = axis.dot(axis);
        let t = if span > f64::EPSILON {
            ((point - tail).dot(axis) / span).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let nearest = tail + axis * t;
        point.distance(nearest) < self.width / 2.0
    }

    fn split(&self, alpha: f64) -> (Self, Self) {
        let unit = self.direction() * self.length;
        let front = self.position + unit / 2.0;
        let back = self.position - unit / 2.0;
        let center = self.position + unit * (0.5 - alpha);

        let first = Self {
            name: format!("{}0", self.name),
            position: (front + center) / 2.0,
            width: self.width,
            length: self.length * alpha,
            rotation: self.rotation,
            split_alpha: Some(alpha),
            opacity: self.opacity,
        };
        let second = Self {
            name: format!("{}1", self.name),
            position: (center + back) / 2.0,
            width: self.width,
            length: self.length * (1.0 - alpha),
            rotation: self.rotation,
            split_alpha: Some(alpha),
            opacity: self.opacity,
        };
        (first, second)
    }

    fn combine(&self, other: &Self, name: String) -> Result<Self, CellError> {
        let direction = (self.position - other.position)
            .normalized()
            .ok_or_else(|| CellError::Degenerate(self.name.clone(), other.name.clone()))?;

        let own_axis = self.direction();
        let own_reach = (self.length - self.width) / 2.0;
        let head = if own_axis.dot(direction) >= 0.0 {
            self.position + own_axis * own_reach
        } else {
            self.position - own_axis * own_reach
        };
        let extent = head + direction * (self.width / 2.0);
        let front = self.position + direction * (extent - self.position).dot(direction);

        let other_axis = other.direction();
        let other_reach = (other.length - other.width) / 2.0;
        let tail = if other_axis.dot(direction) >= 0.0 {
            other.position - other_axis * other_reach
        } else {
            other.position + other_axis * other_reach
        };
        let extent = tail - direction * (other.width / 2.0);
        let back = other.position + direction * (extent - other.position).dot(direction);

        Ok(Self {
            name,
            position: (front + back) / 2.0,
            width: (self.width + other.width) / 2.0,
            length: front.distance(back),
            rotation: direction.angle(),
            split_alpha: None,
            opacity: average_opacity(self.opacity, other.opacity),
        })
    }
}

/// Spherical cell imaged at the focal plane `z = 0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sphere {
    pub name: String,
    pub position: Point,
    pub z: f64,
    pub radius: f64,
    pub split_alpha: Option<f64>,
    pub opacity: Option<f64>,
}

impl Sphere {
    #[must_use]
    pub fn new(name: impl Into<String>, x: f64, y: f64, z: f64, radius: f64) -> Self {
        Self {
            name: name.into(),
            position: Point::new(x, y),
            z,
            radius,
            split_alpha: None,
            opacity: None,
        }
    }

    /// Radius of the disc where the sphere intersects the focal plane.
    #[must_use]
    pub fn focal_radius(&self) -> f64 {
        if self.z.abs() >= self.radius {
            0.0
        } else {
            (self.radius * self.radius - self.z * self.z).sqrt()
        }
    }

    fn region(&self) -> Region {
        let radius = self.focal_radius();
        if radius <= 0.0 {
            return Region::EMPTY;
        }
        Region::new(
            (self.position.x - radius).floor() as i64,
            (self.position.y - radius).floor() as i64,
            ((self.position.x + radius).ceil() as i64).saturating_add(1),
            ((self.position.y + radius).ceil() as i64).saturating_add(1),
        )
    }

    fn covers(&self, point: Point) -> bool {
        point.distance(self.position) < self.focal_radius()
    }

    // Daughters share the parent volume and touch along the x axis, with
    // their volume-weighted centroid at the parent center.
    fn split(&self, alpha: f64) -> (Self, Self) {
        let first_radius = self.radius * alpha.cbrt();
        let second_radius = self.radius * (1.0 - alpha).cbrt();
        let (v1, v2) = (first_radius.powi(3), second_radius.powi(3));
        let gap = first_radius + second_radius;
        let first_offset = gap * v2 / (v1 + v2);
        let second_offset = gap * v1 / (v1 + v2);

        let first = Self {
            name: format!("{}0", self.name),
            position: self.position + Point::new(first_offset, 0.0),
            z: self.z,
            radius: first_radius,
            split_alpha: Some(alpha),
            opacity: self.opacity,
        };
        let second = Self {
            name: format!("{}1", self.name),
            position: self.position - Point::new(second_offset, 0.0),
            z: self.z,
            radius: second_radius,
            split_alpha: Some(alpha),
            opacity: self.opacity,
        };
        (first, second)
    }

    fn combine(&self, other: &Self, name: String) -> Result<Self, CellError> {
        let (v1, v2) = (self.radius.powi(3), other.radius.powi(3));
        let total = v1 + v2;
        if total <= 0.0 || !total.is_finite() {
            return Err(CellError::Degenerate(self.name.clone(), other.name.clone()));
        }
        Ok(Self {
            name,
            position: (self.position * v1 + other.position * v2) / total,
            z: (self.z * v1 + other.z * v2) / total,
            radius: total.cbrt(),
            split_alpha: None,
            opacity: average_opacity(self.opacity, other.opacity),
        })
    }
}

fn average_opacity(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(a), Some(b)) => Some((a + b) / 2.0),
        (a, b) => a.or(b),
    }
}

/// A cell of either supported shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Cell {
    Bacilli(Bacilli),
    Sphere(Sphere),
}

impl From<Bacilli> for Cell {
    fn from(cell: Bacilli) -> Self {
        Self::Bacilli(cell)
    }
}

impl From<Sphere> for Cell {
    fn from(cell: Sphere) -> Self {
        Self::Sphere(cell)
    }
}

impl Cell {
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Bacilli(cell) => &cell.name,
            Self::Sphere(cell) => &cell.name,
        }
    }

    #[must_use]
    pub const fn cell_type(&self) -> CellType {
        match self {
            Self::Bacilli(_) => CellType::Bacilli,
            Self::Sphere(_) => CellType::Sphere,
        }
    }

    #[must_use]
    pub const fn position(&self) -> Point {
        match self {
            Self::Bacilli(cell) => cell.position,
            Self::Sphere(cell) => cell.position,
        }
    }

    /// Orientation in radians; spheres have none.
    #[must_use]
    pub const fn rotation(&self) -> Option<f64> {
        match self {
            Self::Bacilli(cell) => Some(cell.rotation),
            Self::Sphere(_) => None,
        }
    }

    /// Size measure used for growth constraints: length for bacilli, radius for spheres.
    #[must_use]
    pub const fn size(&self) -> f64 {
        match self {
            Self::Bacilli(cell) => cell.length,
            Self::Sphere(cell) => cell.radius,
        }
    }

    #[must_use]
    pub const fn split_alpha(&self) -> Option<f64> {
        match self {
            Self::Bacilli(cell) => cell.split_alpha,
            Self::Sphere(cell) => cell.split_alpha,
        }
    }

    #[must_use]
    pub const fn opacity(&self) -> Option<f64> {
        match self {
            Self::Bacilli(cell) => cell.opacity,
            Self::Sphere(cell) => cell.opacity,
        }
    }

    /// Name of the cell this one split from, if it is a split product.
    #[must_use]
    pub fn ancestor_name(&self) -> Option<&str> {
        let name = self.name();
        let mut chars = name.chars();
        match chars.next_back() {
            Some('0' | '1') if !chars.as_str().is_empty() => Some(chars.as_str()),
            _ => None,
        }
    }

    /// Unclipped pixel rectangle covered by the silhouette.
    #[must_use]
    pub fn region(&self) -> Region {
        match self {
            Self::Bacilli(cell) => cell.region(),
            Self::Sphere(cell) => cell.region(),
        }
    }

    /// Whether the pixel centered at `(x, y)` lies inside the silhouette.
    #[must_use]
    pub fn covers(&self, x: i64, y: i64) -> bool {
        let point = Point::new(x as f64, y as f64);
        match self {
            Self::Bacilli(cell) => cell.covers(point),
            Self::Sphere(cell) => cell.covers(point),
        }
    }

    /// Whether the geometry is finite, non-degenerate, and small enough to rasterize.
    #[must_use]
    pub fn is_renderable(&self) -> bool {
        let bounded = |value: f64| value.is_finite() && value.abs() <= MAX_COORDINATE;
        let geometry_ok = match self {
            Self::Bacilli(cell) => {
                bounded(cell.position.x)
                    && bounded(cell.position.y)
                    && cell.rotation.is_finite()
                    && bounded(cell.width)
                    && bounded(cell.length)
                    && cell.width > 0.0
                    && cell.length > 0.0
            }
            Self::Sphere(cell) => {
                bounded(cell.position.x)
                    && bounded(cell.position.y)
                    && bounded(cell.z)
                    && bounded(cell.radius)
                    && cell.radius > 0.0
            }
        };
        geometry_ok && self.region().area() <= MAX_RENDER_AREA
    }

    /// Copy of the cell with `delta` added to `field`; fields the shape lacks are ignored.
    #[must_use]
    pub fn with_offset(&self, field: Field, delta: f64) -> Self {
        let mut cell = self.clone();
        match (&mut cell, field) {
            (Self::Bacilli(c), Field::X) => c.position.x += delta,
            (Self::Bacilli(c), Field::Y) => c.position.y += delta,
            (Self::Bacilli(c), Field::Width) => c.width += delta,
            (Self::Bacilli(c), Field::Length) => c.length += delta,
            (Self::Bacilli(c), Field::Rotation) => c.rotation += delta,
            (Self::Sphere(c), Field::X) => c.position.x += delta,
            (Self::Sphere(c), Field::Y) => c.position.y += delta,
            (Self::Sphere(c), Field::Z) => c.z += delta,
            (Self::Sphere(c), Field::Radius) => c.radius += delta,
            _ => {}
        }
        cell
    }

    /// Copy of the cell moved by `offset`.
    #[must_use]
    pub fn translated(&self, offset: Point) -> Self {
        let mut cell = self.clone();
        match &mut cell {
            Self::Bacilli(c) => c.position = c.position + offset,
            Self::Sphere(c) => c.position = c.position + offset,
        }
        cell
    }

    /// Splits the cell into two daughters named `name + "0"` and `name + "1"`.
    pub fn split(&self, alpha: f64) -> Result<(Self, Self), CellError> {
        if !(alpha > 0.0 && alpha < 1.0) {
            return Err(CellError::InvalidAlpha(alpha));
        }
        Ok(match self {
            Self::Bacilli(cell) => {
                let (a, b) = cell.split(alpha);
                (a.into(), b.into())
            }
            Self::Sphere(cell) => {
                let (a, b) = cell.split(alpha);
                (a.into(), b.into())
            }
        })
    }

    /// Merges two sibling split products back into their common ancestor.
    pub fn combine(&self, other: &Self) -> Result<Self, CellError> {
        let not_siblings = || CellError::NotSiblings(self.name().into(), other.name().into());
        let name = match (self.ancestor_name(), other.ancestor_name()) {
            (Some(a), Some(b)) if a == b && self.name() != other.name() => a.to_string(),
            _ => return Err(not_siblings()),
        };
        match (self, other) {
            (Self::Bacilli(a), Self::Bacilli(b)) => a.combine(b, name).map(Self::Bacilli),
            (Self::Sphere(a), Self::Sphere(b)) => a.combine(b, name).map(Self::Sphere),
            (a, b) => Err(CellError::IncompatibleVariants(
                a.cell_type(),
                b.cell_type(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::wrap_signed_angle;

    fn rod() -> Cell {
        Bacilli::new("a", 10.0, 10.0, 4.0, 12.0, 0.0).into()
    }

    fn assert_close(a: f64, b: f64) {
        assert!((a - b).abs() < 1e-9, "{a} != {b}");
    }

    #[test]
    fn bacilli_region_bounds_silhouette() {
        let cell = rod();
        let region = cell.region();
        assert_eq!(region, Region::new(4, 8, 17, 13));
        for (x, y) in Region::new(0, 0, 20, 20).pixels() {
            if cell.covers(x, y) {
                assert!(region.contains(x, y), "({x}, {y}) escaped region");
            }
        }
        assert!(cell.covers(10, 10));
        assert!(cell.covers(15, 10));
        assert!(!cell.covers(16, 10));
        assert!(!cell.covers(10, 12));
    }

    #[test]
    fn split_names_and_sizes() {
        let (first, second) = rod().split(0.25).expect("split");
        assert_eq!(first.name(), "a0");
        assert_eq!(second.name(), "a1");
        assert_close(first.size(), 3.0);
        assert_close(second.size(), 9.0);
        assert_eq!(first.split_alpha(), Some(0.25));
        assert_eq!(first.ancestor_name(), Some("a"));
        assert!(rod().split(1.0).is_err());
    }

    #[test]
    fn combine_inverts_split_for_bacilli() {
        for &rotation in &[0.0, 0.7, -2.5, 3.0] {
            for &alpha in &[0.1, 0.35, 0.5, 0.8] {
                let Cell::Bacilli(mut original) = rod() else {
                    unreachable!()
                };
                original.rotation = rotation;
                original.width = 3.5;
                let parent: Cell = original.clone().into();
                let (first, second) = parent.split(alpha).expect("split");
                let Cell::Bacilli(merged) = first.combine(&second).expect("combine") else {
                    panic!("combined into another shape");
                };
                assert_eq!(merged.name, "a");
                assert_close(merged.position.x, original.position.x);
                assert_close(merged.position.y, original.position.y);
                assert_close(merged.width, original.width);
                assert_close(merged.length, original.length);
                assert_close(wrap_signed_angle(merged.rotation - original.rotation), 0.0);
            }
        }
    }

    #[test]
    fn combine_inverts_split_for_spheres() {
        let parent: Cell = Sphere::new("s", 20.0, 15.0, 0.5, 6.0).into();
        let (first, second) = parent.split(0.3).expect("split");
        let Cell::Sphere(merged) = first.combine(&second).expect("combine") else {
            panic!("combined into another shape");
        };
        assert_close(merged.position.x, 20.0);
        assert_close(merged.position.y, 15.0);
        assert_close(merged.z, 0.5);
        assert_close(merged.radius, 6.0);
    }

    #[test]
    fn combine_requires_siblings() {
        let a: Cell = Bacilli::new("x0", 5.0, 5.0, 2.0, 6.0, 0.0).into();
        let b: Cell = Bacilli::new("y1", 9.0, 5.0, 2.0, 6.0, 0.0).into();
        assert!(matches!(a.combine(&b), Err(CellError::NotSiblings(..))));
        let c: Cell = Sphere::new("x1", 9.0, 5.0, 0.0, 3.0).into();
        assert!(matches!(
            a.combine(&c),
            Err(CellError::IncompatibleVariants(..))
        ));
    }

    #[test]
    fn out_of_focus_sphere_draws_nothing() {
        let cell: Cell = Sphere::new("s", 5.0, 5.0, 4.0, 3.0).into();
        assert!(cell.region().is_empty());
        assert!(!cell.covers(5, 5));
    }

    #[test]
    fn degenerate_geometry_is_not_renderable() {
        assert!(rod().is_renderable());
        assert!(!rod().with_offset(Field::Width, -4.0).is_renderable());
        assert!(!rod().with_offset(Field::X, f64::NAN).is_renderable());
        assert!(!rod().with_offset(Field::Length, 1e9).is_renderable());
    }

    #[test]
    fn far_away_cells_are_not_renderable() {
        let rod: Cell = Bacilli::new("a", 1e19, 10.0, 4.0, 10.0, 0.0).into();
        assert!(!rod.is_renderable());
        let region = rod.region();
        assert!(region.area() >= 0);

        let sphere: Cell = Sphere::new("s", 10.0, -1e19, 0.0, 3.0).into();
        assert!(!sphere.is_renderable());
        assert!(sphere.region().area() >= 0);

        let edge: Cell = Bacilli::new("b", f64::MAX, f64::MAX, 4.0, 10.0, 0.0).into();
        assert!(!edge.is_renderable());
        assert_eq!(edge.region().pixels().next(), None);
    }
}
