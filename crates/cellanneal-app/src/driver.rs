//! Sliding-window fitting over an image sequence.
//!
//! Windows of `windowSize` frames slide one frame at a time. Each step seeds
//! the newest frame from its predecessor, anneals the window, and finalizes
//! the oldest frame once no later window can change it.

use crate::frames::save_gray;
use anyhow::{Context, Result, bail};
use cellanneal_core::{
    AnnealConfig, Cell, Image, Lineage, RunStats, Schedule, TemperatureMode, TrialRunner, Window,
    auto_temperature, fit_render_params,
};
use cellanneal_storage::TablePipeline;
use rand::rngs::SmallRng;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// One input frame: where it came from and its intensities.
#[derive(Debug, Clone)]
pub struct InputFrame {
    pub path: PathBuf,
    pub image: Image<f64>,
}

impl InputFrame {
    /// File name used to key cell tables.
    #[must_use]
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

/// Totals reported after the last frame is written.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Summary {
    pub frames: usize,
    pub windows: usize,
    pub final_cost: f64,
}

/// Owns the lineage and writes each frame as it is finalized.
pub struct Driver {
    config: AnnealConfig,
    frames: Vec<InputFrame>,
    lineage: Lineage,
    output: PathBuf,
    table: TablePipeline,
    log: BufWriter<File>,
    rng: SmallRng,
}

impl Driver {
    /// Builds the starting lineage from the initial cell table.
    ///
    /// Leading frames named in `initial` are seeded with their cells; the
    /// first frame falls back to the table's first group when its name is
    /// absent. Render settings marked `"auto"` are fitted on every seeded frame.
    pub fn new(
        config: AnnealConfig,
        frames: Vec<InputFrame>,
        initial: Vec<(String, Vec<Cell>)>,
        output: &Path,
    ) -> Result<Self> {
        if frames.is_empty() {
            bail!("no input frames");
        }
        if initial.is_empty() {
            bail!("initial cell table is empty");
        }
        if let Some(cell) = initial
            .iter()
            .flat_map(|(_, cells)| cells)
            .find(|cell| cell.cell_type() != config.global.cell_type)
        {
            bail!(
                "cell {} is a {} but the configuration expects {}",
                cell.name(),
                cell.cell_type(),
                config.global.cell_type
            );
        }

        let mut lineage = Lineage::new(&config);
        let params = config.simulation.initial_params();
        for (index, frame) in frames.iter().enumerate() {
            let name = frame.file_name();
            let cells = match initial.iter().find(|(file, _)| *file == name) {
                Some((_, cells)) => cells,
                None if index == 0 => {
                    warn!(
                        frame = %name,
                        table = %initial[0].0,
                        "first frame missing from cell table; using its first entry"
                    );
                    &initial[0].1
                }
                None => break,
            };
            lineage.forward(frame.image.clone(), params)?;
            for cell in cells {
                lineage.add_cell(index, cell.clone())?;
            }
            lineage.render_frame(index)?;
            if config.simulation.needs_fit() {
                let fit = fit_render_params(&mut lineage, index, &config.simulation)?;
                info!(
                    frame = index,
                    rounds = fit.rounds,
                    initial_cost = fit.initial_cost,
                    final_cost = fit.final_cost,
                    "fitted render settings"
                );
            }
        }

        std::fs::create_dir_all(output)
            .with_context(|| format!("failed to create {}", output.display()))?;
        let table = TablePipeline::new(&output.join("cells.csv"), config.global.cell_type)?;
        let log_path = output.join("windows.jsonl");
        let log = BufWriter::new(
            File::create(&log_path)
                .with_context(|| format!("failed to create {}", log_path.display()))?,
        );
        let rng = config.seeded_rng();
        info!(
            frames = frames.len(),
            seeded = lineage.len(),
            cells = lineage.count_cells_in(0, lineage.len()),
            "lineage ready"
        );
        Ok(Self {
            config,
            frames,
            lineage,
            output: output.to_path_buf(),
            table,
            log,
            rng,
        })
    }

    #[must_use]
    pub fn lineage(&self) -> &Lineage {
        &self.lineage
    }

    /// Runs every window and writes every frame.
    pub fn run(&mut self) -> Result<Summary> {
        let frames = self.frames.len();
        let size = self.config.schedule.window_size.max(1);
        let mut summary = Summary {
            frames,
            ..Summary::default()
        };
        for last in 0..frames + size - 1 {
            if last < frames && last >= self.lineage.len() {
                self.lineage.copy_forward(self.frames[last].image.clone())?;
            }
            let window = Window::ending_at(last, size).clamped(self.lineage.len());
            if !window.is_empty() {
                let stats = self.anneal(window)?;
                summary.windows += 1;
                summary.final_cost = stats.final_cost;
            }
            if let Some(done) = (last + 1).checked_sub(size)
                && done < frames
            {
                self.finish_frame(done)?;
            }
        }
        self.table.flush();
        self.log.flush()?;
        Ok(summary)
    }

    fn temperature(&mut self, window: Window) -> Result<TemperatureMode> {
        let mut schedule = Schedule::from_config(&self.config);
        if self.config.schedule.auto_temperature {
            let found = auto_temperature(&self.lineage, window, &self.config, &mut self.rng)
                .with_context(|| format!("temperature calibration failed for frames {window:?}"))?;
            schedule.start_temperature = found.start;
            schedule.end_temperature = found.end;
        }
        Ok(TemperatureMode::Scheduled(schedule))
    }

    fn anneal(&mut self, window: Window) -> Result<RunStats> {
        let temperature = self.temperature(window)?;
        let outcome = TrialRunner::new(&self.config, window, temperature)
            .run(self.lineage.clone(), &mut self.rng)
            .with_context(|| format!("annealing failed for frames {window:?}"))?;
        self.lineage = outcome.lineage;
        let stats = outcome.stats;
        info!(
            start = window.start,
            end = window.end,
            initial_cost = stats.initial_cost,
            final_cost = stats.final_cost,
            accepted = stats.accepted(),
            rejected = stats.rejected(),
            "window finished"
        );
        let record = serde_json::json!({
            "window": window,
            "temperature": temperature,
            "stats": stats,
        });
        writeln!(self.log, "{record}")?;
        Ok(stats)
    }

    fn finish_frame(&mut self, index: usize) -> Result<()> {
        let name = self.frames[index].file_name();
        self.table.append(name.clone(), self.lineage.cells(index));
        let images = self
            .lineage
            .images(index)
            .with_context(|| format!("frame {index} has no images"))?;
        save_gray(&images.real, &self.output.join("real").join(format!("{index}.png")))?;
        save_gray(&images.synth, &self.output.join("synth").join(format!("{index}.png")))?;
        info!(frame = index, file = %name, "frame written");
        Ok(())
    }
}
