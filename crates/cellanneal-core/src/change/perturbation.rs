use super::{Proposal, check_constraints, gaussian, match_by_name};
use crate::cell::Cell;
use crate::config::AnnealConfig;
use crate::lineage::{Lineage, LineageError, NodeId};
use rand::Rng;

/// Gaussian nudge of a few fields of one cell.
#[derive(Debug, Clone)]
pub struct Perturbation {
    node: NodeId,
    frame: usize,
    replacement: Cell,
}

impl Perturbation {
    /// Draws a valid perturbation of `node`, giving up after the retry budget.
    pub fn propose<R: Rng + ?Sized>(
        lineage: &Lineage,
        node: NodeId,
        config: &AnnealConfig,
        rng: &mut R,
    ) -> Option<Self> {
        let target = lineage.node(node)?;
        if target.is_dormant() {
            return None;
        }
        let retries = config.perturbation.max_retries;
        for _ in 0..retries {
            let replacement = Self::sample(target.cell(), config, rng)?;
            let candidate = Self {
                node,
                frame: target.frame(),
                replacement,
            };
            if candidate.is_valid(lineage, config) {
                return Some(candidate);
            }
        }
        None
    }

    /// Builds a perturbation with an explicit replacement value.
    #[must_use]
    pub fn with_replacement(lineage: &Lineage, node: NodeId, replacement: Cell) -> Option<Self> {
        let frame = lineage.node(node)?.frame();
        Some(Self {
            node,
            frame,
            replacement,
        })
    }

    #[must_use]
    pub const fn replacement(&self) -> &Cell {
        &self.replacement
    }

    // Resamples the field gates until at least one field moves.
    fn sample<R: Rng + ?Sized>(cell: &Cell, config: &AnnealConfig, rng: &mut R) -> Option<Cell> {
        let fields = cell.cell_type().fields();
        for _ in 0..config.perturbation.max_retries {
            let mut candidate = cell.clone();
            let mut touched = false;
            for &field in fields {
                let params = config.perturbation.params(field);
                if rng.random::<f64>() < params.prob {
                    candidate = candidate.with_offset(field, gaussian(rng, params.mu, params.sigma));
                    touched = true;
                }
            }
            if touched {
                return Some(candidate);
            }
        }
        None
    }

    // (prior, next) pairs linking the replacement to its neighbours in time.
    fn transitions(&self, lineage: &Lineage) -> Option<Vec<(Cell, Cell)>> {
        let node = lineage.node(self.node)?;
        let mut pairs = Vec::new();

        if let Some(parent) = node.parent().and_then(|id| lineage.node(id)) {
            match parent.children().len() {
                1 => pairs.push((parent.cell().clone(), self.replacement.clone())),
                2 => {
                    if let Some(alpha) = node.cell().split_alpha() {
                        let (a, b) = parent.cell().split(alpha).ok()?;
                        match_by_name(&[a, b], &[&self.replacement], &mut pairs);
                    }
                }
                _ => {}
            }
        }

        let children: Vec<&Cell> = node
            .children()
            .iter()
            .filter_map(|id| lineage.cell(*id))
            .collect();
        match children.as_slice() {
            [child] => pairs.push((self.replacement.clone(), (*child).clone())),
            [first, _] => {
                if let Some(alpha) = first.split_alpha() {
                    let (a, b) = self.replacement.split(alpha).ok()?;
                    match_by_name(&[a, b], &children, &mut pairs);
                }
            }
            _ => {}
        }
        Some(pairs)
    }
}

impl Proposal for Perturbation {
    fn is_valid(&self, lineage: &Lineage, config: &AnnealConfig) -> bool {
        let Some(node) = lineage.node(self.node) else {
            return false;
        };
        let Some(images) = lineage.images(self.frame) else {
            return false;
        };
        if node.is_dormant() || node.frame() != self.frame {
            return false;
        }
        let Some(pairs) = self.transitions(lineage) else {
            return false;
        };
        check_constraints(
            &[&self.replacement],
            &pairs,
            images.width(),
            images.height(),
            config,
        )
    }

    fn cost_diff(&self, lineage: &Lineage, _config: &AnnealConfig) -> f64 {
        let Some(current) = lineage.cell(self.node) else {
            return f64::INFINITY;
        };
        lineage.redraw_delta(self.frame, &[current], &[&self.replacement])
    }

    fn apply(self, lineage: &mut Lineage) -> Result<(), LineageError> {
        let current = lineage
            .cell(self.node)
            .cloned()
            .ok_or(LineageError::MissingNode)?;
        lineage.commit_redraw(self.frame, &[&current], &[&self.replacement])?;
        lineage.push_cell(self.node, self.replacement)
    }
}
