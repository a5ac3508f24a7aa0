use thiserror::Error;

/// Main error type for the video-stylizer library
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Planning error: {0}")]
    Planning(#[from] PlanningError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Video processing error: {0}")]
    Video(#[from] VideoError),

    #[error("Style processing error: {0}")]
    Style(#[from] StyleError),

    #[error("Stitch error: {0}")]
    Stitch(#[from] StitchError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Chunk {chunk} exceeded its time budget of {budget_secs}s")]
    Timeout { chunk: usize, budget_secs: u64 },

    #[error("Job cancelled")]
    Cancelled,

    #[error("Generic error: {0}")]
    Generic(String),
}

/// Chunk planning errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlanningError {
    #[error("Input has no frames")]
    EmptyInput,

    #[error("No random-access points for a {total_frames}-frame input spanning several chunks")]
    NoRandomAccessPoints { total_frames: u64 },

    #[error("Invalid planning parameters: {details}")]
    InvalidParameters { details: String },
}

/// Checkpoint store errors
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Job {job_id} is already running (checkpoint lock held)")]
    JobAlreadyRunning { job_id: String },

    #[error("Failed to write checkpoint for job {job_id}: {reason}")]
    WriteFailed { job_id: String, reason: String },

    #[error("Chunk {chunk_index} recorded before chunk {missing} completed")]
    OutOfOrder { chunk_index: usize, missing: usize },

    #[error("Checkpoint directory unusable: {path}")]
    DirectoryUnavailable { path: String },
}

/// Video-specific errors
#[derive(Error, Debug)]
pub enum VideoError {
    #[error("Failed to open video file: {path}")]
    LoadFailed { path: String },

    #[error("Probe failed for {path}: {reason}")]
    ProbeFailed { path: String, reason: String },

    #[error("Video decoding failed at frame {frame}: {reason}")]
    DecodingFailed { frame: u64, reason: String },

    #[error("Video encoding failed: {reason}")]
    EncodingFailed { reason: String },
}

/// Style-specific errors
#[derive(Error, Debug)]
pub enum StyleError {
    #[error("Style not found: {name}")]
    NotFound { name: String },

    #[error("Effect application failed: {effect} - {reason}")]
    EffectFailed { effect: String, reason: String },

    #[error("Style configuration invalid: {details}")]
    InvalidConfig { details: String },
}

/// Stitching errors
#[derive(Error, Debug)]
pub enum StitchError {
    #[error("Chunk outputs do not cover the plan: {reason}")]
    IncompleteChunks { reason: String },

    #[error("Stitched output failed verification: {reason}")]
    VerificationFailed { reason: String },

    #[error("Container operation failed: {reason}")]
    MuxFailed { reason: String },
}

/// Configuration-specific errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse configuration file: {path}")]
    ParseFailed { path: String },

    #[error("Invalid configuration value: {key} = {value}")]
    InvalidValue { key: String, value: String },

    #[error("Unknown preset: {name}")]
    UnknownPreset { name: String },

    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },
}

/// Taxonomy tag attached to failed jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    PlanningError,
    JobAlreadyRunningError,
    DecodeError,
    EncodeError,
    StyleTransformError,
    IncompleteChunksError,
    StitchVerificationError,
    CheckpointWriteError,
    Timeout,
    Cancelled,
    ConfigError,
    IoError,
    Other,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Convenience type alias for Results using PipelineError
pub type Result<T> = std::result::Result<T, PipelineError>;

impl PipelineError {
    /// Create a generic error with a custom message
    pub fn generic<S: Into<String>>(message: S) -> Self {
        Self::Generic(message.into())
    }

    pub fn decode<S: Into<String>>(frame: u64, reason: S) -> Self {
        VideoError::DecodingFailed { frame, reason: reason.into() }.into()
    }

    pub fn encode<S: Into<String>>(reason: S) -> Self {
        VideoError::EncodingFailed { reason: reason.into() }.into()
    }

    /// The taxonomy tag reported on a failed job
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Planning(_) => ErrorKind::PlanningError,
            Self::Checkpoint(CheckpointError::JobAlreadyRunning { .. }) => {
                ErrorKind::JobAlreadyRunningError
            }
            Self::Checkpoint(_) => ErrorKind::CheckpointWriteError,
            Self::Video(VideoError::EncodingFailed { .. }) => ErrorKind::EncodeError,
            Self::Video(_) => ErrorKind::DecodeError,
            Self::Style(_) => ErrorKind::StyleTransformError,
            Self::Stitch(StitchError::IncompleteChunks { .. }) => ErrorKind::IncompleteChunksError,
            Self::Stitch(_) => ErrorKind::StitchVerificationError,
            Self::Config(_) => ErrorKind::ConfigError,
            Self::Io(_) => ErrorKind::IoError,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Generic(_) => ErrorKind::Other,
        }
    }

    /// Check if this error is recoverable by retrying the same chunk
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Video(VideoError::DecodingFailed { .. }) => true,
            Self::Timeout { .. } => true,
            _ => false,
        }
    }

    /// Get a user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            Self::Video(VideoError::LoadFailed { path }) => {
                format!("Could not open video file '{}'. Please check the file exists and is a supported format.", path)
            }
            Self::Style(StyleError::NotFound { name }) => {
                format!("Style '{}' not found. Run `video-stylizer styles` to list available styles.", name)
            }
            Self::Checkpoint(CheckpointError::JobAlreadyRunning { job_id }) => {
                format!("Job '{}' is already being processed by another instance.", job_id)
            }
            Self::Config(ConfigError::FileNotFound { path }) => {
                format!("Configuration file '{}' not found.", path)
            }
            _ => self.to_string(),
        }
    }
}
