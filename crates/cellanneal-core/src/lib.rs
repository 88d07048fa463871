//! Cell lineage fitting for time-lapse microscopy.
//!
//! Cells are rods or spheres arranged in a per-frame forest. The annealer
//! edits that forest one local proposal at a time, keeping synthetic images
//! and their cost against the observed frames current without re-rendering
//! whole frames.

pub mod anneal;
pub mod calibrate;
pub mod cell;
pub mod change;
pub mod config;
pub mod cost;
pub mod distance;
pub mod geometry;
pub mod image;
pub mod lineage;
pub mod render;
pub mod trials;

pub use anneal::{AnnealError, Annealer, RunStats, Schedule, TemperatureMode, Window, anneal_window};
pub use calibrate::{CalibrationError, FitOutcome, Temperatures, auto_temperature, fit_render_params};
pub use cell::{Bacilli, Cell, CellError, CellType, Field, Sphere};
pub use change::{Change, ChangeKind, Proposal};
pub use config::{AnnealConfig, ConfigError};
pub use cost::{Objective, ObjectiveKind};
pub use geometry::{Point, Region};
pub use image::{Image, ImageError};
pub use lineage::{CellNode, Frame, Lineage, LineageError, NodeId};
pub use render::{ImageType, RenderParams};
pub use trials::{TrialError, TrialOutcome, TrialRunner, run_trial};
