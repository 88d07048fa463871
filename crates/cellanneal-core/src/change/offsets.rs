use super::{ChangeKind, Proposal, gaussian};
use crate::config::AnnealConfig;
use crate::lineage::{Lineage, LineageError};
use crate::render::RenderParams;
use rand::Rng;
use std::collections::HashMap;

// Full-frame objective change from swapping in `render`.
fn render_delta(lineage: &Lineage, frame: usize, render: RenderParams) -> f64 {
    let Ok((synth, occupancy)) = lineage.render_preview(frame, render, &HashMap::new()) else {
        return f64::INFINITY;
    };
    match (
        lineage.preview_cost(frame, &synth, &occupancy),
        lineage.frame_cost(frame),
    ) {
        (Some(after), Some(before)) => after - before,
        _ => f64::INFINITY,
    }
}

fn commit(lineage: &mut Lineage, frame: usize, render: RenderParams) -> Result<(), LineageError> {
    let (synth, occupancy) = lineage.render_preview(frame, render, &HashMap::new())?;
    lineage.commit_render(frame, render, synth, occupancy)
}

/// Shifts a frame's background and cell brightness.
#[derive(Debug, Clone)]
pub struct BackgroundOffset {
    frame: usize,
    render: RenderParams,
}

impl BackgroundOffset {
    pub fn propose<R: Rng + ?Sized>(
        lineage: &Lineage,
        frame: usize,
        config: &AnnealConfig,
        rng: &mut R,
    ) -> Option<Self> {
        let mut render = *lineage.frame(frame)?.render();
        let noise = &config.offsets;
        render.background_color += gaussian(
            rng,
            noise.background_color.mu,
            noise.background_color.sigma,
        );
        render.cell_color += gaussian(rng, noise.cell_color.mu, noise.cell_color.sigma);
        Some(Self { frame, render })
    }

    #[must_use]
    pub const fn render(&self) -> &RenderParams {
        &self.render
    }
}

impl Proposal for BackgroundOffset {
    fn is_valid(&self, lineage: &Lineage, config: &AnnealConfig) -> bool {
        let render = &self.render;
        ChangeKind::BackgroundOffset.is_eligible(lineage, self.frame)
            && render.is_physical()
            && render.background_color > 0.0
            && render.cell_color - render.background_color >= config.offsets.min_contrast
    }

    fn cost_diff(&self, lineage: &Lineage, _config: &AnnealConfig) -> f64 {
        render_delta(lineage, self.frame, self.render)
    }

    fn apply(self, lineage: &mut Lineage) -> Result<(), LineageError> {
        commit(lineage, self.frame, self.render)
    }
}

/// Jitters a frame's opacity and diffraction settings.
#[derive(Debug, Clone)]
pub struct OpacityOffset {
    frame: usize,
    render: RenderParams,
}

impl OpacityOffset {
    pub fn propose<R: Rng + ?Sized>(
        lineage: &Lineage,
        frame: usize,
        config: &AnnealConfig,
        rng: &mut R,
    ) -> Option<Self> {
        let mut render = *lineage.frame(frame)?.render();
        let noise = &config.offsets;
        render.cell_opacity += gaussian(rng, noise.cell_opacity.mu, noise.cell_opacity.sigma);
        render.diffraction_strength += gaussian(
            rng,
            noise.diffraction_strength.mu,
            noise.diffraction_strength.sigma,
        );
        render.diffraction_sigma += gaussian(
            rng,
            noise.diffraction_sigma.mu,
            noise.diffraction_sigma.sigma,
        );
        Some(Self { frame, render })
    }

    #[must_use]
    pub const fn render(&self) -> &RenderParams {
        &self.render
    }
}

impl Proposal for OpacityOffset {
    fn is_valid(&self, lineage: &Lineage, _config: &AnnealConfig) -> bool {
        ChangeKind::OpacityOffset.is_eligible(lineage, self.frame) && self.render.is_physical()
    }

    fn cost_diff(&self, lineage: &Lineage, _config: &AnnealConfig) -> f64 {
        render_delta(lineage, self.frame, self.render)
    }

    fn apply(self, lineage: &mut Lineage) -> Result<(), LineageError> {
        commit(lineage, self.frame, self.render)
    }
}
