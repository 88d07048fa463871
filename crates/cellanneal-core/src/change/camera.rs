use super::{Proposal, gaussian, within_bounds};
use crate::cell::Cell;
use crate::config::AnnealConfig;
use crate::geometry::Point;
use crate::lineage::{Lineage, LineageError, NodeId};
use rand::Rng;
use std::collections::HashMap;

/// Translates every live cell of a frame by the same offset.
#[derive(Debug, Clone)]
pub struct CameraShift {
    frame: usize,
    offset: Point,
    shifted: Vec<(NodeId, Cell)>,
}

impl CameraShift {
    pub fn propose<R: Rng + ?Sized>(
        lineage: &Lineage,
        frame: usize,
        config: &AnnealConfig,
        rng: &mut R,
    ) -> Option<Self> {
        let camera = &config.camera;
        let offset = Point::new(
            gaussian(rng, camera.x.mu, camera.x.sigma),
            gaussian(rng, camera.y.mu, camera.y.sigma),
        );
        Self::with_offset(lineage, frame, offset)
    }

    /// Shift of `frame` by an explicit offset; `None` for an empty frame.
    #[must_use]
    pub fn with_offset(lineage: &Lineage, frame: usize, offset: Point) -> Option<Self> {
        let shifted: Vec<(NodeId, Cell)> = lineage
            .live_cells(frame)
            .into_iter()
            .map(|(id, cell)| (id, cell.translated(offset)))
            .collect();
        if shifted.is_empty() {
            return None;
        }
        Some(Self {
            frame,
            offset,
            shifted,
        })
    }

    #[must_use]
    pub const fn offset(&self) -> Point {
        self.offset
    }

    fn replacements(&self) -> HashMap<NodeId, Cell> {
        self.shifted.iter().cloned().collect()
    }
}

impl Proposal for CameraShift {
    fn is_valid(&self, lineage: &Lineage, config: &AnnealConfig) -> bool {
        let Some(images) = lineage.images(self.frame) else {
            return false;
        };
        self.shifted.iter().all(|(id, cell)| {
            lineage
                .node(*id)
                .is_some_and(|node| !node.is_dormant() && node.frame() == self.frame)
                && within_bounds(cell, images.width(), images.height(), config)
        })
    }

    fn cost_diff(&self, lineage: &Lineage, _config: &AnnealConfig) -> f64 {
        let Some(render) = lineage.frame(self.frame).map(|frame| *frame.render()) else {
            return f64::INFINITY;
        };
        let Ok((synth, occupancy)) =
            lineage.render_preview(self.frame, render, &self.replacements())
        else {
            return f64::INFINITY;
        };
        match (
            lineage.preview_cost(self.frame, &synth, &occupancy),
            lineage.frame_cost(self.frame),
        ) {
            (Some(after), Some(before)) => after - before,
            _ => f64::INFINITY,
        }
    }

    fn apply(self, lineage: &mut Lineage) -> Result<(), LineageError> {
        let render = *lineage
            .frame(self.frame)
            .ok_or(LineageError::MissingFrame(self.frame))?
            .render();
        let (synth, occupancy) = lineage.render_preview(self.frame, render, &self.replacements())?;
        lineage.commit_render(self.frame, render, synth, occupancy)?;
        for (id, cell) in self.shifted {
            lineage.push_cell(id, cell)?;
        }
        Ok(())
    }
}
