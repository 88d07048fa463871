//! Command-line driver pieces: frame discovery, image conversion, and the
//! sliding-window loop.

pub mod driver;
pub mod frames;

pub use driver::{Driver, InputFrame, Summary};
pub use frames::{discover_frames, expand_pattern, load_gray, save_gray};
