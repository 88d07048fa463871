//! Dense row-major pixel buffers.

use crate::geometry::Region;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised when constructing image buffers.
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("invalid image shape: {0}")]
    InvalidShape(&'static str),
    #[error("image has {actual} pixels, expected {expected}")]
    LengthMismatch { expected: usize, actual: usize },
}

/// 2D grid of pixels stored row by row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image<T> {
    width: usize,
    height: usize,
    pixels: Vec<T>,
}

impl<T: Copy> Image<T> {
    /// Construct a `width x height` image with every pixel set to `fill`.
    pub fn new(width: usize, height: usize, fill: T) -> Result<Self, ImageError> {
        if width == 0 || height == 0 {
            return Err(ImageError::InvalidShape("image dimensions must be non-zero"));
        }
        Ok(Self {
            width,
            height,
            pixels: vec![fill; width * height],
        })
    }

    /// Wraps an existing row-major buffer.
    pub fn from_vec(width: usize, height: usize, pixels: Vec<T>) -> Result<Self, ImageError> {
        if width == 0 || height == 0 {
            return Err(ImageError::InvalidShape("image dimensions must be non-zero"));
        }
        let expected = width * height;
        if pixels.len() != expected {
            return Err(ImageError::LengthMismatch {
                expected,
                actual: pixels.len(),
            });
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    #[must_use]
    pub const fn width(&self) -> usize {
        self.width
    }

    #[must_use]
    pub const fn height(&self) -> usize {
        self.height
    }

    #[must_use]
    pub fn bounds(&self) -> Region {
        Region::full(self.width, self.height)
    }

    #[must_use]
    pub fn pixels(&self) -> &[T] {
        &self.pixels
    }

    #[must_use]
    pub fn pixels_mut(&mut self) -> &mut [T] {
        &mut self.pixels
    }

    #[inline]
    fn offset(&self, x: usize, y: usize) -> usize {
        y * self.width + x
    }

    /// Pixel at `(x, y)`, or `None` outside the image.
    #[inline]
    pub fn get(&self, x: i64, y: i64) -> Option<T> {
        if x < 0 || y < 0 {
            return None;
        }
        let (x, y) = (x as usize, y as usize);
        (x < self.width && y < self.height).then(|| self.pixels[self.offset(x, y)])
    }

    #[inline]
    pub fn get_mut(&mut self, x: i64, y: i64) -> Option<&mut T> {
        if x < 0 || y < 0 {
            return None;
        }
        let (x, y) = (x as usize, y as usize);
        if x < self.width && y < self.height {
            let idx = self.offset(x, y);
            Some(&mut self.pixels[idx])
        } else {
            None
        }
    }

    pub fn fill(&mut self, value: T) {
        self.pixels.fill(value);
    }

    /// Iterates the pixels of `region` (clipped to the image) with their coordinates.
    pub fn region_pixels(&self, region: Region) -> impl Iterator<Item = (i64, i64, T)> + use<'_, T> {
        let clipped = region.clip(self.width, self.height);
        clipped.pixels().map(move |(x, y)| {
            let idx = self.offset(x as usize, y as usize);
            (x, y, self.pixels[idx])
        })
    }
}

/// Cells covering one pixel.
///
/// `tinted` counts the covering cells that carry their own opacity and
/// `opacity` is the sum of those values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Coverage {
    pub count: i32,
    pub tinted: i32,
    pub opacity: f64,
}

impl Coverage {
    pub const EMPTY: Self = Self::cells(0);

    /// Coverage by `count` cells without opacity overrides.
    #[must_use]
    pub const fn cells(count: i32) -> Self {
        Self {
            count,
            tinted: 0,
            opacity: 0.0,
        }
    }

    /// Adds (`delta = 1`) or removes (`delta = -1`) one covering cell.
    #[inline]
    pub fn apply(&mut self, delta: i32, opacity: Option<f64>) {
        self.count += delta;
        if let Some(value) = opacity {
            self.tinted += delta;
            self.opacity += f64::from(delta) * value;
            if self.tinted == 0 {
                self.opacity = 0.0;
            }
        }
    }

    /// Mean opacity over the covering cells; cells without an override count as `fallback`.
    #[inline]
    #[must_use]
    pub fn opacity_or(&self, fallback: f64) -> f64 {
        if self.count <= 0 || self.tinted == 0 {
            return fallback;
        }
        let plain = f64::from(self.count - self.tinted);
        (self.opacity + plain * fallback) / f64::from(self.count)
    }
}

/// Coverage window cut out of a frame's coverage map.
///
/// Proposals edit a patch instead of the frame so cost deltas can be computed
/// without touching shared buffers. Coordinates are frame coordinates.
#[derive(Debug, Clone)]
pub struct Patch {
    region: Region,
    coverage: Vec<Coverage>,
}

impl Patch {
    /// Copies `region` (clipped to the image) out of `coverage`.
    #[must_use]
    pub fn crop(coverage: &Image<Coverage>, region: Region) -> Self {
        let region = region.clip(coverage.width(), coverage.height());
        let coverage = region
            .pixels()
            .map(|(x, y)| coverage.get(x, y).unwrap_or_default())
            .collect();
        Self { region, coverage }
    }

    /// Empty patch spanning a whole `width x height` frame.
    #[must_use]
    pub fn blank(width: usize, height: usize) -> Self {
        let region = Region::full(width, height);
        Self {
            region,
            coverage: vec![Coverage::EMPTY; width * height],
        }
    }

    #[must_use]
    pub const fn region(&self) -> Region {
        self.region
    }

    #[inline]
    fn index(&self, x: i64, y: i64) -> Option<usize> {
        self.region.contains(x, y).then(|| {
            ((y - self.region.top) * self.region.width() + (x - self.region.left)) as usize
        })
    }

    /// Coverage at `(x, y)`; pixels outside the patch read as empty.
    #[inline]
    #[must_use]
    pub fn coverage(&self, x: i64, y: i64) -> Coverage {
        self.index(x, y).map_or(Coverage::EMPTY, |idx| self.coverage[idx])
    }

    /// Number of cells covering `(x, y)`.
    #[inline]
    #[must_use]
    pub fn occupancy(&self, x: i64, y: i64) -> i32 {
        self.coverage(x, y).count
    }

    /// Adds or removes one covering cell at `(x, y)` when it lies inside the patch.
    #[inline]
    pub fn bump(&mut self, x: i64, y: i64, delta: i32, opacity: Option<f64>) {
        if let Some(idx) = self.index(x, y) {
            self.coverage[idx].apply(delta, opacity);
        }
    }

    /// Writes the patch back into a full coverage map.
    pub fn write_into(&self, coverage: &mut Image<Coverage>) {
        for (idx, (x, y)) in self.region.pixels().enumerate() {
            if let Some(pixel) = coverage.get_mut(x, y) {
                *pixel = self.coverage[idx];
            }
        }
    }

    /// Converts a full-frame patch into an image.
    pub fn into_image(self) -> Result<Image<Coverage>, ImageError> {
        Image::from_vec(
            self.region.width() as usize,
            self.region.height() as usize,
            self.coverage,
        )
    }
}
