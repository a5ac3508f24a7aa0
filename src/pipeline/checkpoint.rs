use std::{
    collections::{BTreeMap, BTreeSet},
    fs::{File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::error::{CheckpointError, ConfigError, Result};

/// On-disk record format version
pub const CHECKPOINT_VERSION: u32 = 1;

/// Durable record of which chunks of a job are finished
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub job_id: String,
    pub configuration_fingerprint: String,
    pub completed_chunks: BTreeSet<usize>,
    /// Encoder each completed chunk was written with
    #[serde(default)]
    pub chunk_codecs: BTreeMap<usize, String>,
    pub last_flushed_frame: Option<u64>,
    pub total_chunks: usize,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    fn new(job_id: &str, fingerprint: &str, total_chunks: usize) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            job_id: job_id.to_string(),
            configuration_fingerprint: fingerprint.to_string(),
            completed_chunks: BTreeSet::new(),
            chunk_codecs: BTreeMap::new(),
            last_flushed_frame: None,
            total_chunks,
            updated_at: Utc::now(),
        }
    }

    pub fn is_done(&self, chunk_index: usize) -> bool {
        self.completed_chunks.contains(&chunk_index)
    }

    pub fn codec_of(&self, chunk_index: usize) -> Option<&str> {
        self.chunk_codecs.get(&chunk_index).map(String::as_str)
    }

    /// Completed chunks always form the prefix `0..n`
    fn is_prefix(&self) -> bool {
        self.completed_chunks.iter().enumerate().all(|(i, &c)| i == c)
    }
}

/// Directory of per-job checkpoint records and lock files
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|_| CheckpointError::DirectoryUnavailable {
            path: dir.display().to_string(),
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, job_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", job_id))
    }

    fn lock_path(&self, job_id: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", job_id))
    }

    /// Read the trusted checkpoint for `job_id`, if there is one
    ///
    /// A missing, unreadable or malformed record, or one written under a
    /// different fingerprint, is reported as `None`.
    pub fn load(&self, job_id: &str, fingerprint: &str) -> Result<Option<Checkpoint>> {
        validate_job_id(job_id)?;
        let path = self.record_path(job_id);

        let content = match std::fs::read(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                warn!(job_id, error = %e, "Checkpoint unreadable, starting fresh");
                return Ok(None);
            }
        };

        let record: Checkpoint = match serde_json::from_slice(&content) {
            Ok(record) => record,
            Err(e) => {
                warn!(job_id, error = %e, "Checkpoint corrupt, starting fresh");
                return Ok(None);
            }
        };

        if record.version != CHECKPOINT_VERSION
            || record.job_id != job_id
            || !record.is_prefix()
            || record.completed_chunks.len() > record.total_chunks
        {
            warn!(job_id, version = record.version, "Checkpoint invalid, starting fresh");
            return Ok(None);
        }

        if record.configuration_fingerprint != fingerprint {
            info!(job_id, "Configuration changed since checkpoint, starting fresh");
            return Ok(None);
        }

        Ok(Some(record))
    }

    /// Take the per-job lock and open the checkpoint for writing
    ///
    /// A trusted checkpoint with the same chunk count is picked up; anything
    /// else starts an empty record. Fails fast if another process holds the lock.
    pub fn begin(&self, job_id: &str, fingerprint: &str, total_chunks: usize) -> Result<CheckpointWriter> {
        validate_job_id(job_id)?;

        let lock = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(self.lock_path(job_id))?;
        if lock.try_lock_exclusive().is_err() {
            return Err(CheckpointError::JobAlreadyRunning {
                job_id: job_id.to_string(),
            }
            .into());
        }

        let record = match self.load(job_id, fingerprint)? {
            Some(record) if record.total_chunks == total_chunks => {
                info!(
                    job_id,
                    completed = record.completed_chunks.len(),
                    total_chunks,
                    "Resuming from checkpoint"
                );
                record
            }
            Some(record) => {
                warn!(
                    job_id,
                    recorded = record.total_chunks,
                    total_chunks,
                    "Checkpoint chunk count differs from plan, starting fresh"
                );
                Checkpoint::new(job_id, fingerprint, total_chunks)
            }
            None => Checkpoint::new(job_id, fingerprint, total_chunks),
        };

        Ok(CheckpointWriter {
            dir: self.dir.clone(),
            path: self.record_path(job_id),
            record,
            _lock: lock,
        })
    }

    /// Remove the record of a completed job
    pub fn clear(&self, job_id: &str) -> Result<()> {
        validate_job_id(job_id)?;
        match std::fs::remove_file(self.record_path(job_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Job ids become file names
fn validate_job_id(job_id: &str) -> Result<()> {
    let ok = !job_id.is_empty()
        && job_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        && !job_id.starts_with('.');
    if ok {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue {
            key: "job_id".to_string(),
            value: job_id.to_string(),
        }
        .into())
    }
}

/// Exclusive handle on one job's checkpoint; the lock is held until drop
#[derive(Debug)]
pub struct CheckpointWriter {
    dir: PathBuf,
    path: PathBuf,
    record: Checkpoint,
    _lock: File,
}

impl CheckpointWriter {
    pub fn checkpoint(&self) -> &Checkpoint {
        &self.record
    }

    pub fn is_done(&self, chunk_index: usize) -> bool {
        self.record.is_done(chunk_index)
    }

    pub fn codec_of(&self, chunk_index: usize) -> Option<&str> {
        self.record.codec_of(chunk_index)
    }

    pub fn completed_count(&self) -> usize {
        self.record.completed_chunks.len()
    }

    /// Mark a chunk durable and persist the record
    ///
    /// Every lower-indexed chunk must already be recorded.
    pub fn record_chunk_done(&mut self, chunk_index: usize, last_frame_index: u64, codec: &str) -> Result<()> {
        if chunk_index >= self.record.total_chunks {
            return Err(self.write_failed(format!(
                "chunk {} is outside a {}-chunk plan",
                chunk_index, self.record.total_chunks
            )));
        }
        if let Some(missing) = (0..chunk_index).find(|i| !self.record.is_done(*i)) {
            return Err(CheckpointError::OutOfOrder { chunk_index, missing }.into());
        }

        let mut next = self.record.clone();
        next.completed_chunks.insert(chunk_index);
        next.chunk_codecs.insert(chunk_index, codec.to_string());
        next.last_flushed_frame = Some(next.last_flushed_frame.map_or(last_frame_index, |f| f.max(last_frame_index)));
        next.updated_at = Utc::now();

        self.persist(&next)?;
        self.record = next;
        debug!(job_id = %self.record.job_id, chunk = chunk_index, "Checkpoint updated");
        Ok(())
    }

    /// Forget every completed chunk from `len` on
    ///
    /// Used when a recorded chunk's output has gone missing from disk.
    /// `last_flushed_frame` is the final frame of chunk `len - 1`, and must be
    /// `None` when nothing is kept.
    pub fn truncate(&mut self, len: usize, last_flushed_frame: Option<u64>) -> Result<()> {
        if self.record.completed_chunks.len() <= len {
            return Ok(());
        }
        if (len == 0) != last_flushed_frame.is_none() {
            return Err(self.write_failed(format!(
                "keeping {} chunks with last flushed frame {:?}",
                len, last_flushed_frame
            )));
        }

        let mut next = self.record.clone();
        next.completed_chunks = next.completed_chunks.into_iter().filter(|&c| c < len).collect();
        next.chunk_codecs.retain(|&c, _| c < len);
        next.last_flushed_frame = last_flushed_frame;
        next.updated_at = Utc::now();

        self.persist(&next)?;
        self.record = next;
        Ok(())
    }

    /// Write to a temp file in the same directory, fsync, then rename over the record
    fn persist(&self, record: &Checkpoint) -> Result<()> {
        let body = serde_json::to_vec_pretty(record).map_err(|e| self.write_failed(e.to_string()))?;

        let mut tmp = NamedTempFile::new_in(&self.dir).map_err(|e| self.write_failed(e.to_string()))?;
        tmp.write_all(&body).map_err(|e| self.write_failed(e.to_string()))?;
        tmp.as_file().sync_all().map_err(|e| self.write_failed(e.to_string()))?;
        tmp.persist(&self.path).map_err(|e| self.write_failed(e.error.to_string()))?;

        // Make the rename itself durable
        #[cfg(unix)]
        File::open(&self.dir)
            .and_then(|dir| dir.sync_all())
            .map_err(|e| self.write_failed(e.to_string()))?;

        Ok(())
    }

    fn write_failed(&self, reason: String) -> crate::error::PipelineError {
        CheckpointError::WriteFailed {
            job_id: self.record.job_id.clone(),
            reason,
        }
        .into()
    }
}
