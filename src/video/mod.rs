//! # Video I/O Module
//!
//! Frame types and the collaborators the pipeline decodes from, encodes into
//! and stitches with. The FFmpeg implementations shell out to `ffmpeg` and
//! `ffprobe`; tests substitute in-memory versions.

pub mod muxer;
pub mod sink;
pub mod source;
pub mod types;

pub use muxer::{FfmpegMuxer, MediaSummary, Muxer};
pub use sink::{FfmpegEncoder, SinkFactory, VideoSink};
pub use source::{FfmpegSource, FrameIter, VideoSource};
pub use types::{ColorInfo, EncodingConfig, Frame, QueueSlot, VideoInfo};
