//! Independent annealing trials run side by side.
//!
//! A window's iteration budget is split into batches. Every batch launches
//! `jobs` trials from the same starting lineage, each on its own copy and
//! RNG stream, and keeps one result according to the selection strategy.
//! The last batch always keeps the best.

use crate::anneal::{AnnealError, Annealer, RunStats, TemperatureMode, Window};
use crate::config::{AnnealConfig, SelectionStrategy};
use crate::lineage::Lineage;
use ordered_float::OrderedFloat;
use rand::{Rng, SeedableRng, rngs::SmallRng};
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors raised while running trials.
#[derive(Debug, Error)]
pub enum TrialError {
    #[error("every trial in batch {batch} was cancelled")]
    AllCancelled { batch: usize },
    #[error("trial worker failed: {0}")]
    Worker(String),
    #[error(transparent)]
    Anneal(#[from] AnnealError),
}

/// Finished trial: its lineage copy and how the run went.
#[derive(Debug, Clone)]
pub struct TrialOutcome {
    pub cost: f64,
    pub lineage: Lineage,
    pub stats: RunStats,
}

/// Runs one trial on a private copy of `lineage`.
pub fn run_trial(
    lineage: &Lineage,
    annealer: &Annealer<'_>,
    seed: u64,
) -> Result<TrialOutcome, AnnealError> {
    let mut lineage = lineage.clone();
    let mut rng = SmallRng::seed_from_u64(seed);
    let stats = annealer.run(&mut lineage, &mut rng)?;
    Ok(TrialOutcome {
        cost: stats.final_cost,
        lineage,
        stats,
    })
}

/// Picks the kept outcome of one batch.
#[must_use]
pub fn select(
    strategy: SelectionStrategy,
    batch: usize,
    last: bool,
    outcomes: Vec<TrialOutcome>,
) -> Option<TrialOutcome> {
    let best = last
        || match strategy {
            SelectionStrategy::BestWins => true,
            SelectionStrategy::WorstWins => false,
            SelectionStrategy::Alternating => batch % 2 == 0,
        };
    let key = |outcome: &TrialOutcome| OrderedFloat(outcome.cost);
    if best {
        outcomes.into_iter().min_by_key(key)
    } else {
        outcomes.into_iter().max_by_key(key)
    }
}

/// Batched parallel trials over one window.
#[derive(Debug, Clone)]
pub struct TrialRunner<'a> {
    config: &'a AnnealConfig,
    window: Window,
    temperature: TemperatureMode,
}

impl<'a> TrialRunner<'a> {
    #[must_use]
    pub fn new(config: &'a AnnealConfig, window: Window, temperature: TemperatureMode) -> Self {
        Self {
            config,
            window,
            temperature,
        }
    }

    fn annealer(&self, progress: Range<f64>, cancel: Arc<AtomicBool>) -> Annealer<'a> {
        Annealer::new(self.config, self.window)
            .with_temperature(self.temperature)
            .with_progress(progress)
            .with_cancel(cancel)
    }

    /// Runs every batch and returns the final kept outcome.
    pub fn run<R: Rng + ?Sized>(
        &self,
        lineage: Lineage,
        rng: &mut R,
    ) -> Result<TrialOutcome, TrialError> {
        let trials = &self.config.trials;
        let batches = trials.batches.max(1);
        let mut current = lineage;
        let mut kept = None;
        for batch in 0..batches {
            let progress = batch as f64 / batches as f64..(batch + 1) as f64 / batches as f64;
            let seeds: Vec<u64> = (0..trials.jobs.max(1)).map(|_| rng.random()).collect();
            let outcomes = self.run_batch(&current, batch, progress, &seeds)?;
            let costs: Vec<f64> = outcomes.iter().map(|o| o.cost).collect();
            let last = batch + 1 == batches;
            let chosen = select(trials.strategy, batch, last, outcomes)
                .ok_or(TrialError::AllCancelled { batch })?;
            info!(
                start = self.window.start,
                end = self.window.end,
                batch,
                ?costs,
                chosen = chosen.cost,
                "trial batch finished"
            );
            current = chosen.lineage.clone();
            kept = Some(chosen);
        }
        kept.ok_or(TrialError::AllCancelled { batch: 0 })
    }

    fn run_batch(
        &self,
        current: &Lineage,
        batch: usize,
        progress: Range<f64>,
        seeds: &[u64],
    ) -> Result<Vec<TrialOutcome>, TrialError> {
        let cancel = Arc::new(AtomicBool::new(false));
        let deadline = self
            .config
            .trials
            .timeout_secs
            .map(|secs| Instant::now() + Duration::from_secs_f64(secs));
        let (tx, rx) = mpsc::channel();

        thread::scope(|scope| {
            for (job, &seed) in seeds.iter().enumerate() {
                let tx = tx.clone();
                let annealer = self.annealer(progress.clone(), Arc::clone(&cancel));
                thread::Builder::new()
                    .name(format!("cellanneal-trial-{job}"))
                    .spawn_scoped(scope, move || {
                        let result = run_trial(current, &annealer, seed);
                        // Results arriving after a timeout are never read.
                        let _ = tx.send((job, result));
                    })
                    .map_err(|err| {
                        cancel.store(true, Ordering::Relaxed);
                        TrialError::Worker(err.to_string())
                    })?;
            }
            drop(tx);

            let mut finished = Vec::with_capacity(seeds.len());
            let mut failure = None;
            for _ in 0..seeds.len() {
                let received = match deadline {
                    Some(deadline) => {
                        rx.recv_timeout(deadline.saturating_duration_since(Instant::now()))
                    }
                    None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
                };
                match received {
                    Ok((job, Ok(outcome))) if !outcome.stats.cancelled => {
                        finished.push((job, outcome));
                    }
                    Ok((job, Ok(_))) => debug!(batch, job, "trial was cancelled"),
                    Ok((job, Err(err))) => {
                        warn!(batch, job, %err, "trial failed");
                        failure = Some(TrialError::Anneal(err));
                        break;
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        warn!(
                            batch,
                            finished = finished.len(),
                            "trial batch timed out; cancelling the rest"
                        );
                        break;
                    }
                    Err(RecvTimeoutError::Disconnected) => {
                        failure = Some(TrialError::Worker(
                            "trial worker exited without reporting".to_string(),
                        ));
                        break;
                    }
                }
            }
            cancel.store(true, Ordering::Relaxed);
            if let Some(err) = failure {
                return Err(err);
            }
            // Completion order varies between runs; selection must not.
            finished.sort_by_key(|(job, _)| *job);
            Ok(finished.into_iter().map(|(_, outcome)| outcome).collect())
        })
    }
}
