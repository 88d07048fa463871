use anyhow::{Context, Result};
use cellanneal_app::{Driver, InputFrame, discover_frames, load_gray};
use cellanneal_core::AnnealConfig;
use cellanneal_core::config::SelectionStrategy;
use cellanneal_storage::{group_by_file, read_cell_table};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "cellanneal",
    version,
    about = "Fit cell lineages to time-lapse microscope images by simulated annealing"
)]
struct Cli {
    /// Input frame pattern with one printf-style `%d`, e.g. `frames/t%03d.png`.
    #[arg(short, long, value_name = "PATTERN")]
    input: String,
    /// Directory receiving `cells.csv`, `windows.jsonl`, and per-frame images.
    #[arg(short, long, value_name = "DIRECTORY")]
    output: PathBuf,
    /// JSON configuration document.
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,
    /// Initial cell table.
    #[arg(short = 'x', long, value_name = "FILE")]
    initial: PathBuf,
    /// Index of the first frame.
    #[arg(long, default_value_t = 0)]
    first_frame: usize,
    /// Index of the last frame; defaults to the last consecutive frame found.
    #[arg(long)]
    last_frame: Option<usize>,
    /// Parallel trials per batch.
    #[arg(short, long)]
    jobs: Option<usize>,
    /// Batches each window's budget is split into.
    #[arg(long)]
    batches: Option<usize>,
    /// Which trial result each batch keeps.
    #[arg(long, value_enum)]
    strategy: Option<Strategy>,
    /// Per-batch wall-clock limit in seconds.
    #[arg(long)]
    timeout: Option<f64>,
    /// Seed for reproducible runs.
    #[arg(long)]
    seed: Option<u64>,
    /// Calibrate the temperature range on every window.
    #[arg(long, conflicts_with_all = ["start_temp", "end_temp"])]
    auto_temp: bool,
    #[arg(long)]
    start_temp: Option<f64>,
    #[arg(long)]
    end_temp: Option<f64>,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum Strategy {
    BestWins,
    WorstWins,
    Alternating,
}

impl From<Strategy> for SelectionStrategy {
    fn from(strategy: Strategy) -> Self {
        match strategy {
            Strategy::BestWins => Self::BestWins,
            Strategy::WorstWins => Self::WorstWins,
            Strategy::Alternating => Self::Alternating,
        }
    }
}

impl Cli {
    fn load_config(&self) -> Result<AnnealConfig> {
        let text = std::fs::read_to_string(&self.config)
            .with_context(|| format!("failed to read {}", self.config.display()))?;
        let mut config: AnnealConfig = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse {}", self.config.display()))?;
        let trials = &mut config.trials;
        if let Some(jobs) = self.jobs {
            trials.jobs = jobs;
        }
        if let Some(batches) = self.batches {
            trials.batches = batches;
        }
        if let Some(strategy) = self.strategy {
            trials.strategy = strategy.into();
        }
        if self.timeout.is_some() {
            trials.timeout_secs = self.timeout;
        }
        let schedule = &mut config.schedule;
        if self.auto_temp {
            schedule.auto_temperature = true;
        }
        if let Some(start) = self.start_temp {
            schedule.start_temperature = start;
            schedule.auto_temperature = false;
        }
        if let Some(end) = self.end_temp {
            schedule.end_temperature = end;
            schedule.auto_temperature = false;
        }
        if self.seed.is_some() {
            config.rng_seed = self.seed;
        }
        config
            .prepared()
            .with_context(|| format!("invalid configuration in {}", self.config.display()))
    }
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = cli.load_config()?;

    let paths = discover_frames(&cli.input, cli.first_frame, cli.last_frame)?;
    let frames = paths
        .into_iter()
        .map(|path| {
            let image = load_gray(&path)?;
            Ok(InputFrame { path, image })
        })
        .collect::<Result<Vec<_>>>()?;

    let (cell_type, records) = read_cell_table(&cli.initial)
        .with_context(|| format!("failed to read {}", cli.initial.display()))?;
    info!(
        frames = frames.len(),
        cells = records.len(),
        %cell_type,
        "Starting cellanneal"
    );

    let mut driver = Driver::new(config, frames, group_by_file(records), &cli.output)?;
    let summary = driver.run()?;
    info!(
        frames = summary.frames,
        windows = summary.windows,
        final_cost = summary.final_cost,
        "Finished"
    );
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}
