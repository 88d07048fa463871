//! Metropolis search over a window of frames.
//!
//! Each iteration draws a frame weighted by its cell count, a node within
//! it, and a proposal kind. Valid proposals are priced incrementally and
//! accepted with probability `exp(-delta / T)`. The running cost is updated
//! from those deltas and stays authoritative; an optional periodic full
//! recompute only warns when the two drift apart.

use crate::change::{Change, ChangeKind, Proposal};
use crate::config::AnnealConfig;
use crate::lineage::{Lineage, LineageError};
use rand::Rng;
use serde::Serialize;
use std::collections::VecDeque;
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors that abort a search run.
#[derive(Debug, Error)]
pub enum AnnealError {
    #[error(transparent)]
    Lineage(#[from] LineageError),
}

/// Geometric interpolation `a * (b / a)^t`.
#[must_use]
pub fn gerp(a: f64, b: f64, t: f64) -> f64 {
    a * (b / a).powf(t)
}

/// Metropolis acceptance probability for a cost change at `temperature`.
#[must_use]
pub fn acceptance(delta: f64, temperature: f64) -> f64 {
    if delta <= 0.0 {
        1.0
    } else if temperature <= 0.0 || delta.is_nan() {
        0.0
    } else {
        (-delta / temperature).exp()
    }
}

/// Bounded buffer of acceptance probabilities for cost-increasing moves.
#[derive(Debug, Clone)]
pub struct PbadTracker {
    samples: VecDeque<f64>,
    capacity: usize,
    total: f64,
}

impl PbadTracker {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            total: 0.0,
        }
    }

    /// Records one sample, evicting the oldest when full.
    pub fn push(&mut self, probability: f64) {
        if self.samples.len() == self.capacity
            && let Some(evicted) = self.samples.pop_front()
        {
            self.total -= evicted;
        }
        self.samples.push_back(probability);
        self.total += probability;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Mean of the buffered samples, if any.
    #[must_use]
    pub fn mean(&self) -> Option<f64> {
        if self.samples.is_empty() {
            None
        } else {
            Some((self.total / self.samples.len() as f64).max(0.0))
        }
    }
}

/// Half-open range of frames optimized together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Window {
    pub start: usize,
    pub end: usize,
}

impl Window {
    #[must_use]
    pub const fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Window of `size` frames ending at (and including) `last`.
    #[must_use]
    pub const fn ending_at(last: usize, size: usize) -> Self {
        let end = last + 1;
        Self {
            start: end.saturating_sub(size),
            end,
        }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub const fn range(&self) -> Range<usize> {
        self.start..self.end
    }

    /// Restricts the window to the frames that exist.
    #[must_use]
    pub fn clamped(self, frames: usize) -> Self {
        let end = self.end.min(frames);
        Self {
            start: self.start.min(end),
            end,
        }
    }
}

/// Per-frame cooling schedule inside a sliding window.
///
/// Older frames in the window run colder: the frame `k` positions after the
/// window start cools from `gerp(end, start, (k + 1) / size)` to
/// `gerp(end, start, k / size)` as the run progresses.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Schedule {
    pub start_temperature: f64,
    pub end_temperature: f64,
    pub window_size: usize,
}

impl Schedule {
    #[must_use]
    pub fn from_config(config: &AnnealConfig) -> Self {
        Self {
            start_temperature: config.schedule.start_temperature,
            end_temperature: config.schedule.end_temperature,
            window_size: config.schedule.window_size,
        }
    }

    /// Start and end temperature of the frame `offset` positions into the window.
    #[must_use]
    pub fn frame_bounds(&self, offset: usize) -> (f64, f64) {
        let size = self.window_size.max(1) as f64;
        let hot = ((offset + 1) as f64 / size).min(1.0);
        let cold = (offset as f64 / size).min(1.0);
        (
            gerp(self.end_temperature, self.start_temperature, hot),
            gerp(self.end_temperature, self.start_temperature, cold),
        )
    }

    #[must_use]
    pub fn temperature(&self, offset: usize, progress: f64) -> f64 {
        let (start, end) = self.frame_bounds(offset);
        gerp(start, end, progress.clamp(0.0, 1.0))
    }
}

/// How the annealer sets the temperature.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum TemperatureMode {
    Scheduled(Schedule),
    /// Fixed temperature, used by calibration probes.
    Constant(f64),
}

/// Outcome counts for one proposal kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KindStats {
    pub accepted: u64,
    pub rejected: u64,
    /// Proposals that could not be drawn or failed validation.
    pub invalid: u64,
}

/// Counters and costs reported by one run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunStats {
    pub iterations: u64,
    /// Iterations that landed on a dormant node or had no eligible kind.
    pub skipped: u64,
    pub kinds: [KindStats; 6],
    pub initial_cost: f64,
    /// Running objective at the end of the run, excluding structural penalties.
    pub final_cost: f64,
    /// Mean acceptance of cost-increasing moves.
    pub pbad: Option<f64>,
    pub cancelled: bool,
}

impl RunStats {
    #[must_use]
    pub const fn kind(&self, kind: ChangeKind) -> &KindStats {
        &self.kinds[kind.index()]
    }

    fn kind_mut(&mut self, kind: ChangeKind) -> &mut KindStats {
        &mut self.kinds[kind.index()]
    }

    #[must_use]
    pub fn accepted(&self) -> u64 {
        self.kinds.iter().map(|k| k.accepted).sum()
    }

    #[must_use]
    pub fn rejected(&self) -> u64 {
        self.kinds.iter().map(|k| k.rejected).sum()
    }

    #[must_use]
    pub fn invalid(&self) -> u64 {
        self.kinds.iter().map(|k| k.invalid).sum()
    }
}

/// Simulated annealing over one window of a lineage.
#[derive(Debug, Clone)]
pub struct Annealer<'a> {
    config: &'a AnnealConfig,
    window: Window,
    temperature: TemperatureMode,
    iterations_per_cell: usize,
    progress: Range<f64>,
    cancel: Option<Arc<AtomicBool>>,
}

impl<'a> Annealer<'a> {
    /// Annealer using the configured schedule and iteration budget.
    #[must_use]
    pub fn new(config: &'a AnnealConfig, window: Window) -> Self {
        Self {
            config,
            window,
            temperature: TemperatureMode::Scheduled(Schedule::from_config(config)),
            iterations_per_cell: config.schedule.iterations_per_cell,
            progress: 0.0..1.0,
            cancel: None,
        }
    }

    #[must_use]
    pub fn with_temperature(mut self, temperature: TemperatureMode) -> Self {
        self.temperature = temperature;
        self
    }

    #[must_use]
    pub fn with_iterations_per_cell(mut self, iterations_per_cell: usize) -> Self {
        self.iterations_per_cell = iterations_per_cell;
        self
    }

    /// Runs only the `progress` slice of the schedule, with a proportional budget.
    #[must_use]
    pub fn with_progress(mut self, progress: Range<f64>) -> Self {
        self.progress = progress;
        self
    }

    /// Stops the run early once `cancel` is set.
    #[must_use]
    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    #[must_use]
    pub const fn window(&self) -> Window {
        self.window
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }

    fn budget(&self, lineage: &Lineage, window: Window) -> u64 {
        let cells = lineage.count_cells_in(window.start, window.end);
        let share = (self.progress.end - self.progress.start).clamp(0.0, 1.0);
        ((self.iterations_per_cell * cells) as f64 * share).ceil() as u64
    }

    fn temperature_at(&self, frame: usize, window: Window, progress: f64) -> f64 {
        match self.temperature {
            TemperatureMode::Scheduled(schedule) => {
                schedule.temperature(frame.saturating_sub(window.start), progress)
            }
            TemperatureMode::Constant(temperature) => temperature,
        }
    }

    fn check_divergence(&self, lineage: &Lineage, window: Window, running: f64) {
        let full = lineage.total_cost(window.range());
        let tolerance = self.config.schedule.cost_check_tolerance * full.abs().max(1.0);
        if (full - running).abs() > tolerance {
            warn!(
                start = window.start,
                end = window.end,
                running,
                full,
                "incremental cost diverged from full recompute"
            );
        }
    }

    /// Anneals the window in place and flattens node histories afterwards.
    pub fn run<R: Rng + ?Sized>(
        &self,
        lineage: &mut Lineage,
        rng: &mut R,
    ) -> Result<RunStats, AnnealError> {
        let config = self.config;
        let window = self.window.clamped(lineage.len());
        let initial = lineage.total_cost(window.range());
        let mut stats = RunStats {
            initial_cost: initial,
            final_cost: initial,
            ..RunStats::default()
        };
        let mut running = initial;
        let mut pbad = PbadTracker::new(config.schedule.pbad_max_size);
        let mut budget = self.budget(lineage, window);
        let span = self.progress.end - self.progress.start;
        let check_interval = config.schedule.cost_check_interval as u64;
        debug!(
            start = window.start,
            end = window.end,
            budget,
            cost = initial,
            "annealing window"
        );

        let mut done = 0u64;
        while done < budget {
            if self.is_cancelled() {
                stats.cancelled = true;
                break;
            }
            let progress = self.progress.start + span * done as f64 / budget as f64;
            done += 1;
            stats.iterations += 1;
            if check_interval > 0 && stats.iterations % check_interval == 0 {
                self.check_divergence(lineage, window, running);
            }

            let Some(frame) = lineage.choose_random_frame_index(rng, window.start, window.end)
            else {
                break;
            };
            let Some(node) = lineage.choose_random_node(rng, frame) else {
                stats.skipped += 1;
                continue;
            };
            if lineage.node(node).is_none_or(|n| n.is_dormant()) {
                stats.skipped += 1;
                continue;
            }
            let Some(kind) = ChangeKind::choose(rng, lineage, frame, config) else {
                stats.skipped += 1;
                continue;
            };
            let Some(change) = Change::propose(kind, lineage, frame, node, config, rng) else {
                stats.kind_mut(kind).invalid += 1;
                continue;
            };
            if !change.is_valid(lineage, config) {
                stats.kind_mut(kind).invalid += 1;
                continue;
            }
            let delta = change.cost_diff(lineage, config);
            if !delta.is_finite() {
                stats.kind_mut(kind).invalid += 1;
                continue;
            }

            let temperature = self.temperature_at(frame, window, progress);
            let probability = acceptance(delta, temperature);
            if delta > 0.0 {
                pbad.push(probability);
            }
            if probability > rng.random::<f64>() {
                let penalty = change.penalty(config);
                change.apply(lineage)?;
                running += delta - penalty;
                stats.kind_mut(kind).accepted += 1;
                if matches!(kind, ChangeKind::Split | ChangeKind::Combination) {
                    debug!(frame, %kind, delta, "accepted lineage edit");
                    budget = self.budget(lineage, window);
                }
            } else {
                stats.kind_mut(kind).rejected += 1;
            }
        }

        lineage.flatten();
        stats.final_cost = running;
        stats.pbad = pbad.mean();
        debug!(
            start = window.start,
            end = window.end,
            iterations = stats.iterations,
            accepted = stats.accepted(),
            cost = running,
            cancelled = stats.cancelled,
            "window annealed"
        );
        Ok(stats)
    }
}

/// Convenience wrapper: anneals `window` with the configured schedule.
pub fn anneal_window<R: Rng + ?Sized>(
    lineage: &mut Lineage,
    window: Window,
    config: &AnnealConfig,
    rng: &mut R,
) -> Result<RunStats, AnnealError> {
    let stats = Annealer::new(config, window).run(lineage, rng)?;
    info!(
        start = window.start,
        end = window.end,
        initial_cost = stats.initial_cost,
        final_cost = stats.final_cost,
        "window finished"
    );
    Ok(stats)
}
