use std::{fmt, path::PathBuf, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    config::Config,
    error::{ErrorKind, PipelineError},
};

/// Lifecycle of a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed {
        kind: ErrorKind,
        chunk_index: Option<usize>,
        message: String,
    },
    Cancelled,
}

impl JobStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed { .. } | Self::Cancelled)
    }

    /// Status for a job that stopped on `error`
    pub fn from_error(error: &PipelineError, chunk_index: Option<usize>) -> Self {
        match error {
            PipelineError::Cancelled => Self::Cancelled,
            _ => Self::Failed {
                kind: error.kind(),
                chunk_index,
                message: error.user_message(),
            },
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed {
                kind,
                chunk_index: Some(chunk),
                message,
            } => write!(f, "failed ({} in chunk {}): {}", kind, chunk, message),
            Self::Failed { kind, message, .. } => write!(f, "failed ({}): {}", kind, message),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Progress snapshot emitted by the encode stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: String,
    pub chunk_index: usize,
    /// Frames encoded so far across the whole job, including resumed chunks
    pub frames_done: u64,
    pub total_frames: u64,
    /// Encode rate over the current chunk
    pub estimated_fps: f64,
}

impl ProgressEvent {
    pub fn fraction(&self) -> f64 {
        if self.total_frames == 0 {
            0.0
        } else {
            self.frames_done as f64 / self.total_frames as f64
        }
    }
}

pub type ProgressCallback = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

/// A request to stylize one input into one output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub input: PathBuf,
    pub output: PathBuf,
    /// Applied in this order
    pub styles: Vec<String>,
    /// Processing configuration the job last ran with
    #[serde(default)]
    pub config: Option<Config>,
    /// Fingerprint of `config`, styles and source that keys its checkpoint
    #[serde(default)]
    pub configuration_fingerprint: Option<String>,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_progress: Option<ProgressEvent>,
}

impl Job {
    pub fn new<S: Into<String>>(id: S, input: PathBuf, output: PathBuf, styles: Vec<String>) -> Self {
        Self {
            id: id.into(),
            input,
            output,
            styles,
            config: None,
            configuration_fingerprint: None,
            status: JobStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            last_progress: None,
        }
    }

    /// Stable id derived from the input file stem and the style list
    ///
    /// Re-running the same command picks up the same checkpoint.
    pub fn derive_id(input: &std::path::Path, styles: &[String]) -> String {
        let stem: String = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "job".to_string())
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        if styles.is_empty() {
            stem
        } else {
            format!("{}-{}", stem, styles.join("_"))
        }
    }

    pub(crate) fn mark_started(&mut self) {
        self.status = JobStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub(crate) fn mark_finished(&mut self, status: JobStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }
}
