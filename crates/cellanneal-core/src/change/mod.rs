//! Local edits proposed by the annealer.
//!
//! Every proposal is built against the current lineage, then checked with
//! [`Proposal::is_valid`] and priced with [`Proposal::cost_diff`]; neither
//! touches the lineage. Only [`Proposal::apply`] commits.

mod camera;
mod offsets;
mod perturbation;
mod split;

pub use camera::CameraShift;
pub use offsets::{BackgroundOffset, OpacityOffset};
pub use perturbation::Perturbation;
pub use split::{Combination, Split, split_probability};

use crate::cell::Cell;
use crate::config::AnnealConfig;
use crate::geometry::wrap_signed_angle;
use crate::lineage::{Lineage, LineageError, NodeId};
use rand::Rng;
use rand::distr::{Distribution, weighted::WeightedIndex};
use rand_distr::Normal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Proposal contract shared by every change kind.
pub trait Proposal {
    /// Checks physical and structural constraints.
    fn is_valid(&self, lineage: &Lineage, config: &AnnealConfig) -> bool;

    /// Signed change of the search cost if applied; positive is worse.
    ///
    /// Includes any fixed penalty reported by [`Proposal::penalty`].
    fn cost_diff(&self, lineage: &Lineage, config: &AnnealConfig) -> f64;

    /// Fixed penalty included in `cost_diff` that is not part of the image objective.
    fn penalty(&self, _config: &AnnealConfig) -> f64 {
        0.0
    }

    /// Commits the edit to the tree and image buffers.
    fn apply(self, lineage: &mut Lineage) -> Result<(), LineageError>;
}

/// Discriminant of [`Change`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeKind {
    Perturbation,
    Split,
    Combination,
    BackgroundOffset,
    OpacityOffset,
    CameraShift,
}

impl ChangeKind {
    /// All kinds in the order of [`crate::config::ChangeProbabilities::as_array`].
    pub const ALL: [Self; 6] = [
        Self::Perturbation,
        Self::Split,
        Self::Combination,
        Self::BackgroundOffset,
        Self::OpacityOffset,
        Self::CameraShift,
    ];

    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Perturbation => 0,
            Self::Split => 1,
            Self::Combination => 2,
            Self::BackgroundOffset => 3,
            Self::OpacityOffset => 4,
            Self::CameraShift => 5,
        }
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Perturbation => "perturbation",
            Self::Split => "split",
            Self::Combination => "combination",
            Self::BackgroundOffset => "background_offset",
            Self::OpacityOffset => "opacity_offset",
            Self::CameraShift => "camera_shift",
        }
    }

    /// Whether this kind may target `frame` at all.
    ///
    /// Lineage edits and render offsets need a previous frame; offsets also
    /// need a diffractive imaging model.
    #[must_use]
    pub fn is_eligible(self, lineage: &Lineage, frame: usize) -> bool {
        match self {
            Self::Perturbation | Self::CameraShift => true,
            Self::Split | Self::Combination => frame > 0,
            Self::BackgroundOffset | Self::OpacityOffset => {
                frame > 0
                    && lineage
                        .frame(frame)
                        .is_some_and(|f| f.render().is_diffractive())
            }
        }
    }

    /// Draws a kind by configured probability among those eligible for `frame`.
    pub fn choose<R: Rng + ?Sized>(
        rng: &mut R,
        lineage: &Lineage,
        frame: usize,
        config: &AnnealConfig,
    ) -> Option<Self> {
        let weights = config.prob.as_array();
        let masked = Self::ALL.map(|kind| {
            if kind.is_eligible(lineage, frame) {
                weights[kind.index()]
            } else {
                0.0
            }
        });
        let index = WeightedIndex::new(masked).ok()?;
        Some(Self::ALL[index.sample(rng)])
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Closed set of proposals.
#[derive(Debug, Clone)]
pub enum Change {
    Perturbation(Perturbation),
    Split(Split),
    Combination(Combination),
    BackgroundOffset(BackgroundOffset),
    OpacityOffset(OpacityOffset),
    CameraShift(CameraShift),
}

impl Change {
    /// Builds a proposal of `kind` around `node` in `frame`.
    ///
    /// Returns `None` when the structure does not admit that kind here or
    /// when no candidate could be drawn within the retry budget.
    pub fn propose<R: Rng + ?Sized>(
        kind: ChangeKind,
        lineage: &Lineage,
        frame: usize,
        node: NodeId,
        config: &AnnealConfig,
        rng: &mut R,
    ) -> Option<Self> {
        match kind {
            ChangeKind::Perturbation => {
                Perturbation::propose(lineage, node, config, rng).map(Self::Perturbation)
            }
            ChangeKind::Split => Split::propose(lineage, node, config, rng).map(Self::Split),
            ChangeKind::Combination => Combination::propose(lineage, node).map(Self::Combination),
            ChangeKind::BackgroundOffset => {
                BackgroundOffset::propose(lineage, frame, config, rng).map(Self::BackgroundOffset)
            }
            ChangeKind::OpacityOffset => {
                OpacityOffset::propose(lineage, frame, config, rng).map(Self::OpacityOffset)
            }
            ChangeKind::CameraShift => {
                CameraShift::propose(lineage, frame, config, rng).map(Self::CameraShift)
            }
        }
    }

    #[must_use]
    pub const fn kind(&self) -> ChangeKind {
        match self {
            Self::Perturbation(_) => ChangeKind::Perturbation,
            Self::Split(_) => ChangeKind::Split,
            Self::Combination(_) => ChangeKind::Combination,
            Self::BackgroundOffset(_) => ChangeKind::BackgroundOffset,
            Self::OpacityOffset(_) => ChangeKind::OpacityOffset,
            Self::CameraShift(_) => ChangeKind::CameraShift,
        }
    }
}

impl Proposal for Change {
    fn is_valid(&self, lineage: &Lineage, config: &AnnealConfig) -> bool {
        match self {
            Self::Perturbation(change) => change.is_valid(lineage, config),
            Self::Split(change) => change.is_valid(lineage, config),
            Self::Combination(change) => change.is_valid(lineage, config),
            Self::BackgroundOffset(change) => change.is_valid(lineage, config),
            Self::OpacityOffset(change) => change.is_valid(lineage, config),
            Self::CameraShift(change) => change.is_valid(lineage, config),
        }
    }

    fn cost_diff(&self, lineage: &Lineage, config: &AnnealConfig) -> f64 {
        match self {
            Self::Perturbation(change) => change.cost_diff(lineage, config),
            Self::Split(change) => change.cost_diff(lineage, config),
            Self::Combination(change) => change.cost_diff(lineage, config),
            Self::BackgroundOffset(change) => change.cost_diff(lineage, config),
            Self::OpacityOffset(change) => change.cost_diff(lineage, config),
            Self::CameraShift(change) => change.cost_diff(lineage, config),
        }
    }

    fn penalty(&self, config: &AnnealConfig) -> f64 {
        match self {
            Self::Split(change) => change.penalty(config),
            Self::Combination(change) => change.penalty(config),
            _ => 0.0,
        }
    }

    fn apply(self, lineage: &mut Lineage) -> Result<(), LineageError> {
        match self {
            Self::Perturbation(change) => change.apply(lineage),
            Self::Split(change) => change.apply(lineage),
            Self::Combination(change) => change.apply(lineage),
            Self::BackgroundOffset(change) => change.apply(lineage),
            Self::OpacityOffset(change) => change.apply(lineage),
            Self::CameraShift(change) => change.apply(lineage),
        }
    }
}

/// Samples `N(mu, sigma)`, falling back to `mu` for an unusable sigma.
pub(crate) fn gaussian<R: Rng + ?Sized>(rng: &mut R, mu: f64, sigma: f64) -> f64 {
    Normal::new(mu, sigma).map_or(mu, |normal| normal.sample(rng))
}

/// Whether a single cell sits inside the image and within the configured size bounds.
#[must_use]
pub fn within_bounds(cell: &Cell, width: usize, height: usize, config: &AnnealConfig) -> bool {
    if !cell.is_renderable() {
        return false;
    }
    let position = cell.position();
    if !(position.x >= 0.0
        && position.x < width as f64
        && position.y >= 0.0
        && position.y < height as f64)
    {
        return false;
    }
    if cell.opacity().is_some_and(|opacity| opacity < 0.0) {
        return false;
    }
    let bounds = config.bounds();
    match cell {
        Cell::Bacilli(rod) => {
            (bounds.min_width..=bounds.max_width).contains(&rod.width)
                && bounds.min_length < rod.length
                && rod.length < bounds.max_length
        }
        Cell::Sphere(sphere) => (bounds.min_radius..=bounds.max_radius).contains(&sphere.radius),
    }
}

/// Whether `next` is a plausible successor of `prior` one frame later.
#[must_use]
pub fn plausible_transition(prior: &Cell, next: &Cell, config: &AnnealConfig) -> bool {
    let bounds = config.bounds();
    let fps = config.global.frames_per_second;
    if prior.position().distance(next.position()) > bounds.max_speed / fps {
        return false;
    }
    if let (Some(a), Some(b)) = (prior.rotation(), next.rotation())
        && wrap_signed_angle(b - a).abs() > bounds.max_spin / fps
    {
        return false;
    }
    let growth = next.size() - prior.size();
    bounds.min_growth < growth && growth < bounds.max_growth
}

/// Checks new cells against the bounds and every (prior, next) pair against the motion limits.
#[must_use]
pub fn check_constraints(
    cells: &[&Cell],
    pairs: &[(Cell, Cell)],
    width: usize,
    height: usize,
    config: &AnnealConfig,
) -> bool {
    cells
        .iter()
        .all(|cell| within_bounds(cell, width, height, config))
        && pairs
            .iter()
            .all(|(prior, next)| plausible_transition(prior, next, config))
}

/// Pairs each of `products` with the cell in `others` carrying the same name.
pub(crate) fn match_by_name(products: &[Cell], others: &[&Cell], pairs: &mut Vec<(Cell, Cell)>) {
    for other in others {
        if let Some(product) = products.iter().find(|p| p.name() == other.name()) {
            pairs.push((product.clone(), (*other).clone()));
        }
    }
}
