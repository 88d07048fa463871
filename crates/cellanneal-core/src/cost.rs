//! Objective function comparing synthetic frames with real images.

use crate::geometry::Region;
use crate::image::{Coverage, Image, Patch};
use serde::{Deserialize, Serialize};

/// Which residual weighting the objective applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum ObjectiveKind {
    /// Plain squared residual.
    #[default]
    Plain,
    /// Squared residual scaled by a static distance-to-cell weight map.
    Distance,
}

/// Weights of the objective terms.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Objective {
    pub kind: ObjectiveKind,
    /// Penalty per squared excess cell count on overlapping pixels.
    pub overlap_cost: f64,
}

impl Default for Objective {
    fn default() -> Self {
        Self {
            kind: ObjectiveKind::Plain,
            overlap_cost: 0.0,
        }
    }
}

/// Read-only view of the buffers a frame's cost is measured against.
#[derive(Debug, Clone, Copy)]
pub struct CostInputs<'a> {
    pub real: &'a Image<f64>,
    pub weights: Option<&'a Image<f64>>,
}

impl Objective {
    /// Cost contribution of a single pixel.
    #[inline]
    #[must_use]
    pub fn pixel(&self, real: f64, synth: f64, occupancy: i32, weight: f64) -> f64 {
        let residual = (real - synth) * weight;
        let mut cost = residual * residual;
        if occupancy > 1 {
            let excess = f64::from(occupancy - 1);
            cost += self.overlap_cost * excess * excess;
        }
        cost
    }

    #[inline]
    fn weight_at(&self, inputs: &CostInputs<'_>, x: i64, y: i64) -> f64 {
        match (self.kind, inputs.weights) {
            (ObjectiveKind::Distance, Some(weights)) => weights.get(x, y).unwrap_or(1.0),
            _ => 1.0,
        }
    }

    /// Cost of `region` as currently stored in a frame's buffers.
    #[must_use]
    pub fn region_cost(
        &self,
        inputs: &CostInputs<'_>,
        synth: &Image<f64>,
        coverage: &Image<Coverage>,
        region: Region,
    ) -> f64 {
        synth
            .region_pixels(region)
            .map(|(x, y, value)| {
                let real = inputs.real.get(x, y).unwrap_or(0.0);
                let count = coverage.get(x, y).map_or(0, |c| c.count);
                self.pixel(real, value, count, self.weight_at(inputs, x, y))
            })
            .sum()
    }

    /// Cost of `region` for hypothetical values: `shaded` in row-major order
    /// over `region` plus the occupancy held by `patch`.
    #[must_use]
    pub fn patch_cost(
        &self,
        inputs: &CostInputs<'_>,
        patch: &Patch,
        shaded: &[f64],
        region: Region,
    ) -> f64 {
        region
            .pixels()
            .zip(shaded)
            .map(|((x, y), &value)| {
                let real = inputs.real.get(x, y).unwrap_or(0.0);
                self.pixel(real, value, patch.occupancy(x, y), self.weight_at(inputs, x, y))
            })
            .sum()
    }

    /// Cost of a whole frame.
    #[must_use]
    pub fn frame_cost(
        &self,
        inputs: &CostInputs<'_>,
        synth: &Image<f64>,
        coverage: &Image<Coverage>,
    ) -> f64 {
        self.region_cost(inputs, synth, coverage, synth.bounds())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlap_only_counts_excess_cells() {
        let objective = Objective {
            overlap_cost: 2.0,
            ..Objective::default()
        };
        assert_eq!(objective.pixel(1.0, 1.0, 1, 1.0), 0.0);
        assert_eq!(objective.pixel(1.0, 1.0, 3, 1.0), 8.0);
        assert_eq!(objective.pixel(0.0, 0.5, 0, 2.0), 1.0);
    }

    #[test]
    fn covered_and_background_residuals_weigh_the_same() {
        let objective = Objective::default();
        assert_eq!(objective.pixel(1.0, 0.0, 1, 1.0), 1.0);
        assert_eq!(objective.pixel(1.0, 0.0, 0, 1.0), 1.0);
        assert_eq!(objective.pixel(0.0, 0.5, 1, 3.0), 2.25);
    }

    #[test]
    fn region_and_patch_costs_agree() {
        let real = Image::from_vec(3, 2, vec![0.0, 1.0, 0.5, 0.25, 0.0, 1.0]).expect("real");
        let synth = Image::from_vec(3, 2, vec![1.0, 1.0, 0.0, 0.0, 0.5, 2.0]).expect("synth");
        let counts = [1, 1, 0, 0, 2, 2].map(Coverage::cells).to_vec();
        let occupancy = Image::from_vec(3, 2, counts).expect("occupancy");
        let weights = Image::new(3, 2, 2.0).expect("weights");
        let inputs = CostInputs {
            real: &real,
            weights: Some(&weights),
        };
        let objective = Objective {
            kind: ObjectiveKind::Distance,
            overlap_cost: 0.5,
        };
        let region = Region::new(1, 0, 3, 2);
        let patch = Patch::crop(&occupancy, region);
        let shaded: Vec<f64> = synth.region_pixels(region).map(|(_, _, v)| v).collect();
        let a = objective.region_cost(&inputs, &synth, &occupancy, region);
        let b = objective.patch_cost(&inputs, &patch, &shaded, region);
        assert!((a - b).abs() < 1e-12);
        assert!(objective.frame_cost(&inputs, &synth, &occupancy) > a);
    }
}
