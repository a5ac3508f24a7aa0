//! # Video-Stylizer
//!
//! Apply artistic styles to long videos without losing work on a crash.
//!
//! The input is cut into keyframe-aligned chunks. Each chunk streams through
//! decode, stylize and encode stages joined by bounded queues, and is
//! checkpointed once its output is durable. A rerun of the same job skips
//! finished chunks and warms the temporal stabilizer back up before carrying on.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::path::{Path, PathBuf};
//! use video_stylizer::{config::Config, pipeline::{Job, JobRunner}};
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let config = Config::preset("balanced")?;
//! let input = Path::new("holiday.mp4");
//! let styles = vec!["cartoon".to_string(), "cinematic".to_string()];
//!
//! let mut job = Job::new(
//!     Job::derive_id(input, &styles),
//!     input.to_path_buf(),
//!     PathBuf::from("holiday_stylized.mp4"),
//!     styles,
//! );
//! let runner = JobRunner::with_ffmpeg(config, input)?;
//! runner.run(&mut job).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`pipeline`] - Planning, staged processing, checkpoints, stitching, jobs
//! - [`styles`] - Style trait, built-in styles and the registry
//! - [`video`] - Frame types and the FFmpeg source, sink and muxer
//! - [`config`] - Configuration and presets
//! - [`error`] - Error taxonomy
//!
//! ## Creating Custom Styles
//!
//! Implement the [`Style`](styles::Style) trait and register a factory:
//!
//! ```rust,no_run
//! use video_stylizer::styles::{Style, StyleConfig, StyleRegistry};
//! use video_stylizer::video::Frame;
//! use video_stylizer::Result;
//!
//! struct Invert;
//!
//! impl Style for Invert {
//!     fn name(&self) -> &str {
//!         "invert"
//!     }
//!
//!     fn description(&self) -> &str {
//!         "Negative image"
//!     }
//!
//!     fn apply_effect(&self, frame: &mut Frame, _config: &StyleConfig) -> Result<()> {
//!         for byte in frame.as_bytes_mut() {
//!             *byte = 255 - *byte;
//!         }
//!         Ok(())
//!     }
//! }
//!
//! let mut registry = StyleRegistry::new();
//! registry.register("invert".to_string(), || Box::new(Invert));
//! ```

pub mod config;
pub mod error;
pub mod pipeline;
pub mod styles;
pub mod video;

#[cfg(test)]
mod test_utils;

// Re-export commonly used types for convenience
pub use crate::{
    config::Config,
    error::{ErrorKind, PipelineError, Result},
    pipeline::{Job, JobQueue, JobRunner, JobStatus},
    styles::{Style, StyleRegistry},
};
