//! Chunked, resumable processing of one video
//!
//! A job is split into keyframe-aligned chunks by the [`planner`]. Each chunk
//! runs through the decode/stylize/encode [`stages`] with bounded queues in
//! between, and is recorded in the [`checkpoint`] once its output is on disk.
//! Temporal smoothing is carried across chunks by the [`stabilizer`]; after
//! the last chunk the [`stitcher`] joins and verifies the result.
//!
//! [`JobRunner`] drives a single job, [`JobQueue`] runs many in the background.

pub mod checkpoint;
pub mod job;
pub mod planner;
pub mod queue;
pub mod runner;
pub mod stabilizer;
pub mod stages;
pub mod stitcher;

pub use checkpoint::{Checkpoint, CheckpointStore, CheckpointWriter};
pub use job::{Job, JobStatus, ProgressCallback, ProgressEvent};
pub use planner::{plan, ChunkPlan, ChunkSpec};
pub use queue::{JobQueue, SourceOpener};
pub use runner::JobRunner;
pub use stabilizer::FrameStabilizer;
pub use stages::{ChunkOutput, FlightGauge, StagedPipeline};
pub use stitcher::{ChunkStitcher, StitchReport};
