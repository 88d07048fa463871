//! Rasterization of cells into occupancy maps and synthetic images.
//!
//! Every synthetic pixel is a pure function of the occupancy map around it,
//! so re-shading a window after an edit produces exactly the values a full
//! render would.

use crate::cell::Cell;
use crate::geometry::Region;
use crate::image::{Coverage, Image, ImageError, Patch};
use serde::{Deserialize, Serialize};

/// Imaging model used to turn occupancy into intensities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum ImageType {
    /// Each pixel holds the number of cells covering it.
    #[default]
    Binary,
    /// Flat background and cell body plus a Gaussian diffraction halo.
    GraySynthetic,
    /// Flat cell body over a background brightened by the halo.
    PhaseContrast,
}

/// Per-frame rendering configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderParams {
    pub image_type: ImageType,
    pub background_color: f64,
    pub cell_color: f64,
    pub cell_opacity: f64,
    pub diffraction_sigma: f64,
    pub diffraction_strength: f64,
    pub diffraction_truncate: f64,
}

impl Default for RenderParams {
    fn default() -> Self {
        Self {
            image_type: ImageType::Binary,
            background_color: 0.2,
            cell_color: 0.5,
            cell_opacity: 0.3,
            diffraction_sigma: 2.0,
            diffraction_strength: 0.5,
            diffraction_truncate: 4.0,
        }
    }
}

impl RenderParams {
    /// Whether rendering depends on the diffraction kernel.
    #[must_use]
    pub fn is_diffractive(&self) -> bool {
        !matches!(self.image_type, ImageType::Binary)
    }

    /// Number of pixels the diffraction halo reaches beyond a silhouette.
    #[must_use]
    pub fn kernel_radius(&self) -> i64 {
        if !self.is_diffractive() || !(self.diffraction_sigma > 0.0) {
            return 0;
        }
        let reach = self.diffraction_truncate * self.diffraction_sigma + 0.5;
        if reach.is_finite() {
            reach.floor().max(0.0) as i64
        } else {
            0
        }
    }

    /// Normalized 1D Gaussian taps of length `2 * kernel_radius() + 1`.
    #[must_use]
    pub fn kernel(&self) -> Vec<f64> {
        let radius = self.kernel_radius();
        if radius == 0 {
            return vec![1.0];
        }
        let denom = 2.0 * self.diffraction_sigma * self.diffraction_sigma;
        let mut taps: Vec<f64> = (-radius..=radius)
            .map(|offset| (-((offset * offset) as f64) / denom).exp())
            .collect();
        let sum: f64 = taps.iter().sum();
        for tap in &mut taps {
            *tap /= sum;
        }
        taps
    }

    /// Checks the values that make the imaging model meaningful.
    #[must_use]
    pub fn is_physical(&self) -> bool {
        let values = [
            self.background_color,
            self.cell_color,
            self.cell_opacity,
            self.diffraction_sigma,
            self.diffraction_strength,
            self.diffraction_truncate,
        ];
        values.iter().all(|v| v.is_finite() && *v >= 0.0)
    }
}

/// Whether a draw call adds a cell or removes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawMode {
    Add,
    Subtract,
}

impl DrawMode {
    const fn delta(self) -> i32 {
        match self {
            Self::Add => 1,
            Self::Subtract => -1,
        }
    }
}

impl Cell {
    /// Pixel rectangle whose synthetic values depend on this cell.
    #[must_use]
    pub fn simulated_region(&self, params: &RenderParams) -> Region {
        self.region().expand(params.kernel_radius())
    }

    /// Adds or removes the silhouette, with its opacity override, from the
    /// coverage held by `patch`.
    pub fn draw(&self, patch: &mut Patch, mode: DrawMode) {
        let delta = mode.delta();
        let opacity = self.opacity();
        let region = self.region().intersect(&patch.region());
        for (x, y) in region.pixels() {
            if self.covers(x, y) {
                patch.bump(x, y, delta, opacity);
            }
        }
    }
}

/// Computes synthetic intensities for `target` from the coverage in `patch`.
///
/// Occupied gray pixels scale the halo by the mean opacity of the cells
/// covering them; cells without an override use `cell_opacity`.
///
/// `patch` must hold every in-frame pixel within `kernel_radius()` of
/// `target`; pixels outside it are treated as empty. Values are returned in
/// row-major order over `target`.
#[must_use]
pub fn shade(patch: &Patch, params: &RenderParams, target: Region) -> Vec<f64> {
    if target.is_empty() {
        return Vec::new();
    }
    if !params.is_diffractive() {
        return target
            .pixels()
            .map(|(x, y)| f64::from(patch.occupancy(x, y)))
            .collect();
    }

    let radius = params.kernel_radius();
    let kernel = params.kernel();
    let strength = params.diffraction_strength;
    let lit = |x: i64, y: i64| {
        if patch.occupancy(x, y) > 0 {
            strength
        } else {
            0.0
        }
    };

    let band = Region::new(
        target.left,
        target.top - radius,
        target.right,
        target.bottom + radius,
    );
    let band_width = band.width();
    let horizontal: Vec<f64> = band
        .pixels()
        .map(|(x, y)| {
            kernel
                .iter()
                .zip(-radius..=radius)
                .map(|(tap, offset)| tap * lit(x + offset, y))
                .sum()
        })
        .collect();
    let row_pass = |x: i64, y: i64| -> f64 {
        let idx = (y - band.top) * band_width + (x - band.left);
        horizontal[idx as usize]
    };

    target
        .pixels()
        .map(|(x, y)| {
            let blur: f64 = kernel
                .iter()
                .zip(-radius..=radius)
                .map(|(tap, offset)| tap * row_pass(x, y + offset))
                .sum();
            let coverage = patch.coverage(x, y);
            match (params.image_type, coverage.count > 0) {
                (ImageType::GraySynthetic, true) => {
                    params.cell_color + coverage.opacity_or(params.cell_opacity) * blur
                }
                (ImageType::PhaseContrast, true) => params.cell_color,
                _ => params.background_color + blur,
            }
        })
        .collect()
}

/// Renders `cells` from scratch into a synthetic image and coverage map.
pub fn render_cells<'a>(
    cells: impl IntoIterator<Item = &'a Cell>,
    width: usize,
    height: usize,
    params: &RenderParams,
) -> Result<(Image<f64>, Image<Coverage>), ImageError> {
    let mut patch = Patch::blank(width, height);
    for cell in cells {
        cell.draw(&mut patch, DrawMode::Add);
    }
    let synth = Image::from_vec(width, height, shade(&patch, params, patch.region()))?;
    let coverage = patch.into_image()?;
    Ok((synth, coverage))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::Bacilli;

    fn gray() -> RenderParams {
        RenderParams {
            image_type: ImageType::GraySynthetic,
            diffraction_sigma: 1.0,
            diffraction_truncate: 2.0,
            ..RenderParams::default()
        }
    }

    #[test]
    fn kernel_is_normalized() {
        let params = gray();
        assert_eq!(params.kernel_radius(), 2);
        let kernel = params.kernel();
        assert_eq!(kernel.len(), 5);
        assert!((kernel.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!(kernel[2] > kernel[1] && kernel[1] > kernel[0]);
        assert_eq!(RenderParams::default().kernel_radius(), 0);
    }

    #[test]
    fn binary_render_counts_overlaps() {
        let a: Cell = Bacilli::new("a", 10.0, 10.0, 4.0, 12.0, 0.0).into();
        let b: Cell = Bacilli::new("b", 10.0, 10.0, 4.0, 12.0, 1.2).into();
        let (synth, occupancy) =
            render_cells([&a, &b], 20, 20, &RenderParams::default()).expect("render");
        assert_eq!(occupancy.get(10, 10).map(|c| c.count), Some(2));
        assert_eq!(synth.get(10, 10), Some(2.0));
        assert_eq!(occupancy.get(0, 0), Some(Coverage::EMPTY));
    }

    #[test]
    fn subtract_undoes_add() {
        let cell: Cell = Bacilli::new("a", 6.0, 6.0, 3.0, 8.0, 0.4).into();
        let mut patch = Patch::blank(12, 12);
        cell.draw(&mut patch, DrawMode::Add);
        cell.draw(&mut patch, DrawMode::Subtract);
        assert!(patch.region().pixels().all(|(x, y)| patch.occupancy(x, y) == 0));
    }

    #[test]
    fn partial_shading_matches_full_render() {
        let params = gray();
        let a: Cell = Bacilli::new("a", 8.0, 9.0, 4.0, 10.0, 0.3).into();
        let (synth, occupancy) = render_cells([&a], 24, 18, &params).expect("render");
        let target = a.simulated_region(&params).clip(24, 18);
        let window = target.expand(params.kernel_radius());
        let patch = Patch::crop(&occupancy, window);
        let values = shade(&patch, &params, target);
        for ((x, y), value) in target.pixels().zip(values) {
            assert_eq!(synth.get(x, y), Some(value));
        }
    }

    #[test]
    fn gray_pixels_follow_the_imaging_model() {
        let params = gray();
        let a: Cell = Bacilli::new("a", 10.0, 10.0, 4.0, 12.0, 0.0).into();
        let (synth, _) = render_cells([&a], 30, 30, &params).expect("render");
        let far = synth.get(0, 0).expect("pixel");
        assert!((far - params.background_color).abs() < 1e-12);
        let inside = synth.get(10, 10).expect("pixel");
        assert!(inside > params.cell_color);
        assert!(inside <= params.cell_color + params.cell_opacity * params.diffraction_strength + 1e-12);
    }

    #[test]
    fn per_cell_opacity_changes_the_cell_body() {
        let params = gray();
        let shaded = |opacity: Option<f64>| {
            let mut rod = Bacilli::new("a", 10.0, 10.0, 4.0, 12.0, 0.0);
            rod.opacity = opacity;
            let cell: Cell = rod.into();
            render_cells([&cell], 30, 30, &params).expect("render").0
        };
        let clear = shaded(Some(0.0));
        let dense = shaded(Some(5.0));
        let inherited = shaded(None);

        let inside = |image: &Image<f64>| image.get(10, 10).expect("pixel");
        assert!((inside(&clear) - params.cell_color).abs() < 1e-12);
        assert!(inside(&dense) > inside(&inherited));
        assert!(inside(&inherited) > inside(&clear));
        assert_eq!(clear.get(0, 0), dense.get(0, 0));
    }

    #[test]
    fn opacity_survives_incremental_redraws() {
        let params = gray();
        let mut rod = Bacilli::new("a", 8.0, 9.0, 4.0, 10.0, 0.3);
        rod.opacity = Some(2.0);
        let cell: Cell = rod.into();
        let other: Cell = Bacilli::new("b", 12.0, 9.0, 4.0, 10.0, 1.1).into();
        let (synth, coverage) = render_cells([&cell, &other], 24, 18, &params).expect("render");

        let target = cell.simulated_region(&params).clip(24, 18);
        let mut patch = Patch::crop(&coverage, target.expand(params.kernel_radius()));
        cell.draw(&mut patch, DrawMode::Subtract);
        cell.draw(&mut patch, DrawMode::Add);
        for ((x, y), value) in target.pixels().zip(shade(&patch, &params, target)) {
            let expected = synth.get(x, y).expect("pixel");
            assert!((expected - value).abs() < 1e-12);
        }
    }
}
