//! Pre-search calibration: temperature range and fitted render settings.

use crate::anneal::{AnnealError, Annealer, TemperatureMode, Window};
use crate::config::{AnnealConfig, RenderField, SimulationConfig};
use crate::lineage::{Lineage, LineageError};
use crate::render::RenderParams;
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, info};

/// Pattern-search step below which a fitted value is considered settled.
const FIT_MIN_STEP: f64 = 1e-4;
/// Upper bound on pattern-search passes per frame.
const FIT_MAX_ROUNDS: usize = 200;

/// Errors raised while calibrating.
#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("no cost-increasing moves were proposed at temperature {temperature}")]
    NoBadMoves { temperature: f64 },
    #[error("temperature search did not settle within {steps} steps")]
    Diverged { steps: usize },
    #[error(transparent)]
    Anneal(#[from] AnnealError),
    #[error(transparent)]
    Lineage(#[from] LineageError),
}

/// Start and end temperature found by [`auto_temperature`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Temperatures {
    pub start: f64,
    pub end: f64,
}

// Constant-temperature probes run back to back on one private copy.
struct Prober<'a, R: Rng + ?Sized> {
    lineage: Lineage,
    window: Window,
    config: &'a AnnealConfig,
    rng: &'a mut R,
    steps: usize,
}

impl<R: Rng + ?Sized> Prober<'_, R> {
    fn probe(&mut self, temperature: f64) -> Result<Option<f64>, CalibrationError> {
        let calibration = &self.config.schedule.calibration;
        self.steps += 1;
        if self.steps > calibration.max_steps {
            return Err(CalibrationError::Diverged {
                steps: calibration.max_steps,
            });
        }
        let stats = Annealer::new(self.config, self.window)
            .with_temperature(TemperatureMode::Constant(temperature))
            .with_iterations_per_cell(calibration.iterations_per_cell)
            .run(&mut self.lineage, &mut *self.rng)?;
        debug!(temperature, pbad = ?stats.pbad, "calibration probe");
        Ok(stats.pbad)
    }

    fn probe_required(&mut self, temperature: f64) -> Result<f64, CalibrationError> {
        self.probe(temperature)?
            .ok_or(CalibrationError::NoBadMoves { temperature })
    }
}

/// Finds a start temperature with bad-move acceptance near the target and an
/// end temperature where such moves are practically never accepted.
///
/// Probes run on a copy; `lineage` is untouched.
pub fn auto_temperature<R: Rng + ?Sized>(
    lineage: &Lineage,
    window: Window,
    config: &AnnealConfig,
    rng: &mut R,
) -> Result<Temperatures, CalibrationError> {
    let calibration = &config.schedule.calibration;
    let target = calibration.target_pbad;
    let mut prober = Prober {
        lineage: lineage.clone(),
        window,
        config,
        rng,
        steps: 0,
    };

    let mut temperature = if config.schedule.start_temperature > 0.0 {
        config.schedule.start_temperature
    } else {
        1.0
    };
    let mut pbad = prober.probe_required(temperature)?;
    while pbad < target {
        temperature *= 10.0;
        pbad = prober.probe_required(temperature)?;
    }
    while pbad > target {
        temperature /= 10.0;
        pbad = prober.probe_required(temperature)?;
    }
    while pbad < target {
        temperature *= 1.1;
        pbad = prober.probe_required(temperature)?;
    }
    let start = temperature;

    // A probe without any bad move counts as zero acceptance here.
    while pbad > calibration.end_pbad {
        temperature /= 10.0;
        pbad = prober.probe(temperature)?.unwrap_or(0.0);
    }
    let temperatures = Temperatures {
        start,
        end: temperature,
    };
    info!(
        start = temperatures.start,
        end = temperatures.end,
        probes = prober.steps,
        "calibrated temperatures"
    );
    Ok(temperatures)
}

/// Result of fitting one frame's render settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FitOutcome {
    pub params: RenderParams,
    pub initial_cost: f64,
    pub final_cost: f64,
    pub rounds: usize,
}

fn preview_cost(lineage: &Lineage, frame: usize, params: RenderParams) -> Option<f64> {
    if !params.is_physical() {
        return None;
    }
    let (synth, occupancy) = lineage.render_preview(frame, params, &HashMap::new()).ok()?;
    lineage.preview_cost(frame, &synth, &occupancy)
}

/// Fits every `"auto"` render setting of `frame` by compass search on the
/// full frame objective, then installs the result.
pub fn fit_render_params(
    lineage: &mut Lineage,
    frame: usize,
    simulation: &SimulationConfig,
) -> Result<FitOutcome, CalibrationError> {
    let mut params = *lineage
        .frame(frame)
        .ok_or(LineageError::MissingFrame(frame))?
        .render();
    let fields: Vec<RenderField> = simulation
        .tunables()
        .iter()
        .filter(|(_, value)| value.is_auto())
        .map(|(field, _)| *field)
        .collect();
    let mut best = preview_cost(lineage, frame, params).ok_or(LineageError::MissingFrame(frame))?;
    let initial_cost = best;
    let mut steps: Vec<f64> = fields
        .iter()
        .map(|field| 0.1 * field.get(&params).abs().max(1.0))
        .collect();

    let mut rounds = 0;
    while rounds < FIT_MAX_ROUNDS && steps.iter().any(|step| *step >= FIT_MIN_STEP) {
        rounds += 1;
        let mut improved = false;
        for (field, step) in fields.iter().zip(&steps) {
            let value = field.get(&params);
            for candidate in [value + step, value - step] {
                let mut trial = params;
                field.set(&mut trial, candidate);
                if let Some(cost) = preview_cost(lineage, frame, trial)
                    && cost < best
                {
                    best = cost;
                    params = trial;
                    improved = true;
                    break;
                }
            }
        }
        if !improved {
            for step in &mut steps {
                *step /= 2.0;
            }
        }
    }

    lineage.set_render(frame, params)?;
    debug!(frame, rounds, initial_cost, final_cost = best, "fitted render settings");
    Ok(FitOutcome {
        params,
        initial_cost,
        final_cost: best,
        rounds,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::{Bacilli, Cell};
    use crate::config::{ChangeProbabilities, Tunable};
    use crate::render::{ImageType, render_cells};
    use rand::{SeedableRng, rngs::SmallRng};

    fn gray() -> RenderParams {
        RenderParams {
            image_type: ImageType::GraySynthetic,
            diffraction_sigma: 1.0,
            diffraction_truncate: 2.0,
            ..RenderParams::default()
        }
    }

    fn rod() -> Cell {
        Bacilli::new("a", 12.0, 10.0, 4.0, 10.0, 0.3).into()
    }

    #[test]
    fn fit_recovers_background_and_cell_color() {
        let truth = RenderParams {
            background_color: 0.15,
            cell_color: 0.62,
            ..gray()
        };
        let (real, _) = render_cells([&rod()], 24, 20, &truth).expect("render");
        let mut lineage = Lineage::new(&AnnealConfig::default());
        lineage.forward(real, gray()).expect("frame");
        lineage.add_cell(0, rod()).expect("cell");
        lineage.render_frame(0).expect("render");

        let simulation = SimulationConfig {
            image_type: ImageType::GraySynthetic,
            background_color: Tunable::auto(),
            cell_color: Tunable::auto(),
            diffraction_sigma: 1.0.into(),
            diffraction_truncate: 2.0.into(),
            ..SimulationConfig::default()
        };
        let outcome = fit_render_params(&mut lineage, 0, &simulation).expect("fit");
        assert!(outcome.final_cost < outcome.initial_cost);
        assert!((outcome.params.background_color - 0.15).abs() < 1e-3);
        assert!((outcome.params.cell_color - 0.62).abs() < 1e-3);
        assert_eq!(outcome.params.cell_opacity, gray().cell_opacity);
        assert_eq!(lineage.frame(0).expect("frame").render(), &outcome.params);
    }

    #[test]
    fn fit_without_auto_fields_keeps_params() {
        let mut lineage = Lineage::new(&AnnealConfig::default());
        let (real, _) = render_cells([&rod()], 24, 20, &gray()).expect("render");
        lineage.forward(real, gray()).expect("frame");
        let outcome =
            fit_render_params(&mut lineage, 0, &SimulationConfig::default()).expect("fit");
        assert_eq!(outcome.params, gray());
        assert_eq!(outcome.rounds, 0);
    }

    fn calibration_lineage() -> (Lineage, AnnealConfig) {
        let mut config = AnnealConfig::default();
        config.prob = ChangeProbabilities {
            perturbation: 1.0,
            split: 0.0,
            combination: 0.0,
            ..ChangeProbabilities::default()
        };
        config.schedule.calibration.iterations_per_cell = 200;
        config.schedule.start_temperature = 1.0;
        config.schedule.calibration.end_pbad = 1e-6;
        let (real, _) = render_cells([&rod()], 24, 20, &RenderParams::default()).expect("render");
        let mut lineage = Lineage::new(&config);
        lineage.forward(real, RenderParams::default()).expect("frame");
        lineage.add_cell(0, rod()).expect("cell");
        lineage.render_frame(0).expect("render");
        (lineage, config)
    }

    #[test]
    fn auto_temperature_orders_start_above_end() {
        let (lineage, config) = calibration_lineage();
        let before = lineage.cells(0);
        let mut rng = SmallRng::seed_from_u64(12);
        let temperatures =
            auto_temperature(&lineage, Window::new(0, 1), &config, &mut rng).expect("calibrate");
        assert!(temperatures.start > temperatures.end);
        assert!(temperatures.end > 0.0);
        assert_eq!(lineage.cells(0), before);
    }

    #[test]
    fn auto_temperature_gives_up_after_max_steps() {
        let (lineage, mut config) = calibration_lineage();
        config.schedule.calibration.max_steps = 1;
        let mut rng = SmallRng::seed_from_u64(3);
        let result = auto_temperature(&lineage, Window::new(0, 1), &config, &mut rng);
        assert!(matches!(result, Err(CalibrationError::Diverged { steps: 1 })));
    }
}
