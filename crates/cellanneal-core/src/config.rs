//! Run configuration loaded from JSON documents.

use crate::cell::{CellType, Field};
use crate::cost::{Objective, ObjectiveKind};
use crate::render::{ImageType, RenderParams};
use rand::{SeedableRng, rngs::SmallRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Tolerance before a probability table is considered unnormalized.
const PROBABILITY_TOLERANCE: f64 = 1e-9;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Marker for values the driver should fit before searching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Auto {
    #[serde(rename = "auto")]
    Auto,
}

/// A number, or the literal `"auto"`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Tunable {
    Fixed(f64),
    Auto(Auto),
}

impl Tunable {
    #[must_use]
    pub const fn auto() -> Self {
        Self::Auto(Auto::Auto)
    }

    #[must_use]
    pub const fn is_auto(&self) -> bool {
        matches!(self, Self::Auto(_))
    }

    /// Fixed value, or `fallback` when the value is to be fitted.
    #[must_use]
    pub const fn value_or(&self, fallback: f64) -> f64 {
        match self {
            Self::Fixed(value) => *value,
            Self::Auto(_) => fallback,
        }
    }
}

impl From<f64> for Tunable {
    fn from(value: f64) -> Self {
        Self::Fixed(value)
    }
}

/// Frame-independent imaging facts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GlobalConfig {
    pub cell_type: CellType,
    pub pixels_per_micron: f64,
    pub frames_per_second: f64,
    /// Scale of the distance objective's weight map, in microns.
    pub distance_cost_divisor: f64,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            cell_type: CellType::Bacilli,
            pixels_per_micron: 1.0,
            frames_per_second: 1.0,
            distance_cost_divisor: 1.0,
        }
    }
}

/// Physical limits a cell must respect, in pixels and per-second rates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CellBounds {
    pub max_speed: f64,
    pub max_spin: f64,
    pub min_growth: f64,
    pub max_growth: f64,
    pub min_width: f64,
    pub max_width: f64,
    pub min_length: f64,
    pub max_length: f64,
    pub min_radius: f64,
    pub max_radius: f64,
}

impl Default for CellBounds {
    fn default() -> Self {
        Self {
            max_speed: 5.0,
            max_spin: 0.5,
            min_growth: -5.0,
            max_growth: 5.0,
            min_width: 1.0,
            max_width: 20.0,
            min_length: 1.0,
            max_length: 100.0,
            min_radius: 1.0,
            max_radius: 50.0,
        }
    }
}

/// Rendering settings; any numeric entry may be `"auto"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    #[serde(rename = "image.type")]
    pub image_type: ImageType,
    #[serde(rename = "background.color")]
    pub background_color: Tunable,
    #[serde(rename = "cell.color")]
    pub cell_color: Tunable,
    #[serde(rename = "cell.opacity")]
    pub cell_opacity: Tunable,
    #[serde(rename = "light.diffraction.sigma")]
    pub diffraction_sigma: Tunable,
    #[serde(rename = "light.diffraction.strength")]
    pub diffraction_strength: Tunable,
    #[serde(rename = "light.diffraction.truncate")]
    pub diffraction_truncate: Tunable,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        let base = RenderParams::default();
        Self {
            image_type: base.image_type,
            background_color: base.background_color.into(),
            cell_color: base.cell_color.into(),
            cell_opacity: base.cell_opacity.into(),
            diffraction_sigma: base.diffraction_sigma.into(),
            diffraction_strength: base.diffraction_strength.into(),
            diffraction_truncate: base.diffraction_truncate.into(),
        }
    }
}

impl SimulationConfig {
    /// Render parameters with fitted entries set to their starting guesses.
    #[must_use]
    pub fn initial_params(&self) -> RenderParams {
        let base = RenderParams::default();
        RenderParams {
            image_type: self.image_type,
            background_color: self.background_color.value_or(base.background_color),
            cell_color: self.cell_color.value_or(base.cell_color),
            cell_opacity: self.cell_opacity.value_or(base.cell_opacity),
            diffraction_sigma: self.diffraction_sigma.value_or(base.diffraction_sigma),
            diffraction_strength: self.diffraction_strength.value_or(base.diffraction_strength),
            diffraction_truncate: self.diffraction_truncate.value_or(base.diffraction_truncate),
        }
    }

    /// Whether any entry asks for a fit.
    #[must_use]
    pub fn needs_fit(&self) -> bool {
        self.tunables().iter().any(|(_, value)| value.is_auto())
    }

    /// Entries paired with the render parameter they control.
    #[must_use]
    pub fn tunables(&self) -> [(RenderField, Tunable); 6] {
        [
            (RenderField::BackgroundColor, self.background_color),
            (RenderField::CellColor, self.cell_color),
            (RenderField::CellOpacity, self.cell_opacity),
            (RenderField::DiffractionSigma, self.diffraction_sigma),
            (RenderField::DiffractionStrength, self.diffraction_strength),
            (RenderField::DiffractionTruncate, self.diffraction_truncate),
        ]
    }
}

/// Numeric render parameters addressable by the fitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenderField {
    BackgroundColor,
    CellColor,
    CellOpacity,
    DiffractionSigma,
    DiffractionStrength,
    DiffractionTruncate,
}

impl RenderField {
    #[must_use]
    pub fn get(self, params: &RenderParams) -> f64 {
        match self {
            Self::BackgroundColor => params.background_color,
            Self::CellColor => params.cell_color,
            Self::CellOpacity => params.cell_opacity,
            Self::DiffractionSigma => params.diffraction_sigma,
            Self::DiffractionStrength => params.diffraction_strength,
            Self::DiffractionTruncate => params.diffraction_truncate,
        }
    }

    pub fn set(self, params: &mut RenderParams, value: f64) {
        match self {
            Self::BackgroundColor => params.background_color = value,
            Self::CellColor => params.cell_color = value,
            Self::CellOpacity => params.cell_opacity = value,
            Self::DiffractionSigma => params.diffraction_sigma = value,
            Self::DiffractionStrength => params.diffraction_strength = value,
            Self::DiffractionTruncate => params.diffraction_truncate = value,
        }
    }
}

/// Relative frequency of each proposal kind.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChangeProbabilities {
    #[serde(rename = "perturbation")]
    pub perturbation: f64,
    #[serde(rename = "split")]
    pub split: f64,
    #[serde(rename = "combine")]
    pub combination: f64,
    #[serde(rename = "background.offset")]
    pub background_offset: f64,
    #[serde(rename = "opacity.offset")]
    pub opacity_offset: f64,
    #[serde(rename = "camera.shift")]
    pub camera_shift: f64,
}

impl Default for ChangeProbabilities {
    fn default() -> Self {
        Self {
            perturbation: 0.8,
            split: 0.1,
            combination: 0.1,
            background_offset: 0.0,
            opacity_offset: 0.0,
            camera_shift: 0.0,
        }
    }
}

impl ChangeProbabilities {
    #[must_use]
    pub fn as_array(&self) -> [f64; 6] {
        [
            self.perturbation,
            self.split,
            self.combination,
            self.background_offset,
            self.opacity_offset,
            self.camera_shift,
        ]
    }

    /// Rescales the table to sum to one, warning when it did not already.
    pub fn normalized(self) -> Result<Self, ConfigError> {
        let values = self.as_array();
        if values.iter().any(|p| !p.is_finite() || *p < 0.0) {
            return Err(ConfigError::Invalid(
                "change probabilities must be finite and non-negative",
            ));
        }
        let total: f64 = values.iter().sum();
        if !(total > 0.0) {
            return Err(ConfigError::Invalid(
                "change probabilities must not all be zero",
            ));
        }
        if (total - 1.0).abs() <= PROBABILITY_TOLERANCE {
            return Ok(self);
        }
        warn!(total, "change probabilities do not sum to 1; normalizing");
        Ok(Self {
            perturbation: self.perturbation / total,
            split: self.split / total,
            combination: self.combination / total,
            background_offset: self.background_offset / total,
            opacity_offset: self.opacity_offset / total,
            camera_shift: self.camera_shift / total,
        })
    }
}

/// Gaussian offset gated by an inclusion probability.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerturbParams {
    pub prob: f64,
    pub mu: f64,
    pub sigma: f64,
}

impl Default for PerturbParams {
    fn default() -> Self {
        Self {
            prob: 0.2,
            mu: 0.0,
            sigma: 0.5,
        }
    }
}

/// Per-field perturbation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerturbationConfig {
    pub x: PerturbParams,
    pub y: PerturbParams,
    pub z: PerturbParams,
    pub width: PerturbParams,
    pub length: PerturbParams,
    pub rotation: PerturbParams,
    pub radius: PerturbParams,
    /// Attempts spent looking for a valid perturbation before giving up.
    #[serde(rename = "maxRetries")]
    pub max_retries: usize,
}

impl Default for PerturbationConfig {
    fn default() -> Self {
        let small = PerturbParams {
            prob: 0.2,
            mu: 0.0,
            sigma: 0.1,
        };
        Self {
            x: PerturbParams::default(),
            y: PerturbParams::default(),
            z: PerturbParams::default(),
            width: small,
            length: PerturbParams::default(),
            rotation: PerturbParams {
                prob: 0.2,
                mu: 0.0,
                sigma: 0.1,
            },
            radius: small,
            max_retries: 50,
        }
    }
}

impl PerturbationConfig {
    #[must_use]
    pub const fn params(&self, field: Field) -> &PerturbParams {
        match field {
            Field::X => &self.x,
            Field::Y => &self.y,
            Field::Z => &self.z,
            Field::Width => &self.width,
            Field::Length => &self.length,
            Field::Rotation => &self.rotation,
            Field::Radius => &self.radius,
        }
    }
}

/// Gaussian offset without a gate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Gaussian {
    pub mu: f64,
    pub sigma: f64,
}

impl Default for Gaussian {
    fn default() -> Self {
        Self {
            mu: 0.0,
            sigma: 0.01,
        }
    }
}

/// Whole-frame translation noise.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub x: Gaussian,
    pub y: Gaussian,
}

impl Default for CameraConfig {
    fn default() -> Self {
        let shift = Gaussian { mu: 0.0, sigma: 1.0 };
        Self { x: shift, y: shift }
    }
}

/// Noise applied by the render-parameter offsets.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OffsetConfig {
    #[serde(rename = "background.color")]
    pub background_color: Gaussian,
    #[serde(rename = "cell.color")]
    pub cell_color: Gaussian,
    #[serde(rename = "cell.opacity")]
    pub cell_opacity: Gaussian,
    #[serde(rename = "light.diffraction.strength")]
    pub diffraction_strength: Gaussian,
    #[serde(rename = "light.diffraction.sigma")]
    pub diffraction_sigma: Gaussian,
    /// Smallest allowed gap between cell and background brightness.
    #[serde(rename = "minContrast")]
    pub min_contrast: f64,
}

impl Default for OffsetConfig {
    fn default() -> Self {
        Self {
            background_color: Gaussian::default(),
            cell_color: Gaussian::default(),
            cell_opacity: Gaussian::default(),
            diffraction_strength: Gaussian::default(),
            diffraction_sigma: Gaussian::default(),
            min_contrast: 0.01,
        }
    }
}

/// Auto-temperature search settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CalibrationConfig {
    /// Iterations per cell of each constant-temperature probe.
    pub iterations_per_cell: usize,
    /// Bad-move acceptance the start temperature should reach.
    pub target_pbad: f64,
    /// Bad-move acceptance below which the end temperature is accepted.
    pub end_pbad: f64,
    /// Upper bound on temperature adjustments per phase.
    pub max_steps: usize,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            iterations_per_cell: 1_000,
            target_pbad: 0.3,
            end_pbad: 1e-10,
            max_steps: 64,
        }
    }
}

/// Temperature schedule and search sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ScheduleConfig {
    pub iterations_per_cell: usize,
    /// Number of consecutive frames optimized together.
    pub window_size: usize,
    pub start_temperature: f64,
    pub end_temperature: f64,
    /// Calibrate start/end temperatures on each window instead of using the fixed values.
    pub auto_temperature: bool,
    /// Capacity of the bad-move acceptance buffer.
    pub pbad_max_size: usize,
    pub split_alpha_min: f64,
    pub split_alpha_max: f64,
    /// Cells shorter than this are never split; `None` disables the gate.
    pub split_gate_length: Option<f64>,
    /// Iterations between full cost recomputations; 0 disables the check.
    pub cost_check_interval: usize,
    /// Relative divergence tolerated before warning.
    pub cost_check_tolerance: f64,
    pub calibration: CalibrationConfig,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            iterations_per_cell: 6_000,
            window_size: 3,
            start_temperature: 10.0,
            end_temperature: 0.01,
            auto_temperature: false,
            pbad_max_size: 2_000,
            split_alpha_min: 0.2,
            split_alpha_max: 0.8,
            split_gate_length: None,
            cost_check_interval: 0,
            cost_check_tolerance: 1e-6,
            calibration: CalibrationConfig::default(),
        }
    }
}

/// How one result is chosen among parallel trials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum SelectionStrategy {
    #[default]
    BestWins,
    WorstWins,
    /// Best on even batches, worst on odd ones.
    Alternating,
}

/// Parallel trial settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TrialConfig {
    /// Independent trials launched per batch.
    pub jobs: usize,
    /// Number of batches the iteration budget is divided into.
    pub batches: usize,
    pub strategy: SelectionStrategy,
    /// Wall-clock limit per batch, in seconds.
    pub timeout_secs: Option<f64>,
}

impl Default for TrialConfig {
    fn default() -> Self {
        Self {
            jobs: 1,
            batches: 1,
            strategy: SelectionStrategy::BestWins,
            timeout_secs: None,
        }
    }
}

/// Complete configuration for a fitting run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AnnealConfig {
    pub global: GlobalConfig,
    pub bacilli: CellBounds,
    pub sphere: CellBounds,
    pub simulation: SimulationConfig,
    pub prob: ChangeProbabilities,
    pub perturbation: PerturbationConfig,
    pub camera: CameraConfig,
    pub offsets: OffsetConfig,
    pub objective: ObjectiveKind,
    #[serde(rename = "overlap.cost")]
    pub overlap_cost: f64,
    /// Accepted for compatibility with existing configuration files; the
    /// objective does not read it.
    #[serde(rename = "cell.importance")]
    pub cell_importance: f64,
    #[serde(rename = "split.cost")]
    pub split_cost: f64,
    #[serde(rename = "combine.cost")]
    pub combine_cost: f64,
    pub schedule: ScheduleConfig,
    pub trials: TrialConfig,
    /// Optional RNG seed for reproducible runs.
    pub rng_seed: Option<u64>,
}

impl Default for AnnealConfig {
    fn default() -> Self {
        Self {
            global: GlobalConfig::default(),
            bacilli: CellBounds::default(),
            sphere: CellBounds::default(),
            simulation: SimulationConfig::default(),
            prob: ChangeProbabilities::default(),
            perturbation: PerturbationConfig::default(),
            camera: CameraConfig::default(),
            offsets: OffsetConfig::default(),
            objective: ObjectiveKind::Plain,
            overlap_cost: 0.0,
            cell_importance: 1.0,
            split_cost: 0.0,
            combine_cost: 0.0,
            schedule: ScheduleConfig::default(),
            trials: TrialConfig::default(),
            rng_seed: None,
        }
    }
}

fn check_range(min: f64, max: f64) -> bool {
    min.is_finite() && max.is_finite() && min <= max
}

fn check_noise(values: &[f64]) -> bool {
    values.iter().all(|v| v.is_finite() && *v >= 0.0)
}

impl AnnealConfig {
    /// Parses a JSON document, normalizes probabilities, and validates the result.
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.prepared()
    }

    /// Normalizes the probability table and validates every section.
    pub fn prepared(mut self) -> Result<Self, ConfigError> {
        self.prob = self.prob.normalized()?;
        self.validate()?;
        Ok(self)
    }

    /// Bounds for the configured cell type.
    #[must_use]
    pub const fn bounds(&self) -> &CellBounds {
        match self.global.cell_type {
            CellType::Bacilli => &self.bacilli,
            CellType::Sphere => &self.sphere,
        }
    }

    #[must_use]
    pub const fn objective(&self) -> Objective {
        Objective {
            kind: self.objective,
            overlap_cost: self.overlap_cost,
        }
    }

    /// Checks every value that would make a run meaningless.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let global = &self.global;
        if !(global.frames_per_second > 0.0 && global.frames_per_second.is_finite()) {
            return Err(ConfigError::Invalid("framesPerSecond must be positive"));
        }
        if !(global.pixels_per_micron > 0.0 && global.pixels_per_micron.is_finite()) {
            return Err(ConfigError::Invalid("pixelsPerMicron must be positive"));
        }
        if matches!(self.objective, ObjectiveKind::Distance)
            && !(global.distance_cost_divisor > 0.0 && global.distance_cost_divisor.is_finite())
        {
            return Err(ConfigError::Invalid(
                "distanceCostDivisor must be positive for the distance objective",
            ));
        }

        for bounds in [&self.bacilli, &self.sphere] {
            if !(bounds.max_speed >= 0.0 && bounds.max_spin >= 0.0) {
                return Err(ConfigError::Invalid(
                    "maxSpeed and maxSpin must be non-negative",
                ));
            }
            if !check_range(bounds.min_growth, bounds.max_growth)
                || !check_range(bounds.min_width, bounds.max_width)
                || !check_range(bounds.min_length, bounds.max_length)
                || !check_range(bounds.min_radius, bounds.max_radius)
            {
                return Err(ConfigError::Invalid(
                    "cell bounds must be finite with min <= max",
                ));
            }
        }

        let perturbation = &self.perturbation;
        for params in [
            &perturbation.x,
            &perturbation.y,
            &perturbation.z,
            &perturbation.width,
            &perturbation.length,
            &perturbation.rotation,
            &perturbation.radius,
        ] {
            if !(0.0..=1.0).contains(&params.prob) || !params.mu.is_finite() || !check_noise(&[params.sigma]) {
                return Err(ConfigError::Invalid(
                    "perturbation prob must be in [0, 1] with finite mu and non-negative sigma",
                ));
            }
        }
        if perturbation.max_retries == 0 {
            return Err(ConfigError::Invalid("perturbation maxRetries must be non-zero"));
        }

        let offsets = &self.offsets;
        if !check_noise(&[
            self.camera.x.sigma,
            self.camera.y.sigma,
            offsets.background_color.sigma,
            offsets.cell_color.sigma,
            offsets.cell_opacity.sigma,
            offsets.diffraction_strength.sigma,
            offsets.diffraction_sigma.sigma,
            offsets.min_contrast,
        ]) {
            return Err(ConfigError::Invalid(
                "camera and offset sigmas must be non-negative",
            ));
        }

        if !check_noise(&[
            self.overlap_cost,
            self.cell_importance,
            self.split_cost.abs(),
            self.combine_cost.abs(),
        ]) {
            return Err(ConfigError::Invalid(
                "cost weights must be finite and overlap/importance non-negative",
            ));
        }

        let fixed: Vec<f64> = self
            .simulation
            .tunables()
            .iter()
            .filter_map(|(_, value)| match value {
                Tunable::Fixed(v) => Some(*v),
                Tunable::Auto(_) => None,
            })
            .collect();
        if !check_noise(&fixed) {
            return Err(ConfigError::Invalid(
                "simulation values must be non-negative numbers or \"auto\"",
            ));
        }

        let schedule = &self.schedule;
        if schedule.iterations_per_cell == 0 || schedule.window_size == 0 {
            return Err(ConfigError::Invalid(
                "iterationsPerCell and windowSize must be non-zero",
            ));
        }
        if schedule.pbad_max_size == 0 {
            return Err(ConfigError::Invalid("pbadMaxSize must be non-zero"));
        }
        if !schedule.auto_temperature
            && !(schedule.start_temperature > 0.0
                && schedule.end_temperature > 0.0
                && schedule.start_temperature.is_finite()
                && schedule.end_temperature <= schedule.start_temperature)
        {
            return Err(ConfigError::Invalid(
                "temperatures must be positive with end <= start",
            ));
        }
        if !(schedule.split_alpha_min > 0.0
            && schedule.split_alpha_min <= schedule.split_alpha_max
            && schedule.split_alpha_max < 1.0)
        {
            return Err(ConfigError::Invalid(
                "split alpha range must satisfy 0 < min <= max < 1",
            ));
        }
        if !check_noise(&[schedule.cost_check_tolerance]) {
            return Err(ConfigError::Invalid(
                "costCheckTolerance must be non-negative",
            ));
        }
        let calibration = &schedule.calibration;
        if calibration.iterations_per_cell == 0
            || calibration.max_steps == 0
            || !(calibration.target_pbad > 0.0 && calibration.target_pbad < 1.0)
            || !(calibration.end_pbad > 0.0 && calibration.end_pbad < calibration.target_pbad)
        {
            return Err(ConfigError::Invalid(
                "calibration needs non-zero sizes and 0 < endPbad < targetPbad < 1",
            ));
        }

        let trials = &self.trials;
        if trials.jobs == 0 || trials.batches == 0 {
            return Err(ConfigError::Invalid("trial jobs and batches must be non-zero"));
        }
        if let Some(timeout) = trials.timeout_secs
            && !(timeout > 0.0 && timeout.is_finite())
        {
            return Err(ConfigError::Invalid("trial timeout must be positive"));
        }
        Ok(())
    }

    /// Returns the configured RNG, seeded from entropy if no seed is set.
    #[must_use]
    pub fn seeded_rng(&self) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => {
                let seed: u64 = rand::random();
                SmallRng::seed_from_u64(seed)
            }
        }
    }
}
