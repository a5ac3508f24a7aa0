use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, Mutex},
};

use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::Config,
    error::{CheckpointError, PipelineError, Result},
    pipeline::{
        job::{Job, JobStatus, ProgressCallback, ProgressEvent},
        runner::JobRunner,
    },
    styles::StyleRegistry,
    video::{FfmpegEncoder, FfmpegMuxer, FfmpegSource, Muxer, SinkFactory, VideoSource},
};

/// Opens the decoder for a job's input
pub type SourceOpener = Arc<dyn Fn(&Path) -> Result<Arc<dyn VideoSource>> + Send + Sync>;

struct Entry {
    job: Job,
    cancel: CancellationToken,
    /// Flips to true once the final state is stored
    done: watch::Receiver<bool>,
}

type Entries = Arc<Mutex<HashMap<String, Entry>>>;

/// Background job queue
///
/// Each submitted job gets its own [`JobRunner`]. At most
/// `pipeline.max_concurrent_jobs` run at once; the rest wait as `Queued`.
/// Must be used from within a tokio runtime.
pub struct JobQueue {
    config: Config,
    open_source: SourceOpener,
    sinks: Arc<dyn SinkFactory>,
    muxer: Arc<dyn Muxer>,
    registry: Arc<StyleRegistry>,
    progress: Option<ProgressCallback>,
    permits: Arc<Semaphore>,
    entries: Entries,
}

impl JobQueue {
    pub fn new(
        config: Config,
        open_source: SourceOpener,
        sinks: Arc<dyn SinkFactory>,
        muxer: Arc<dyn Muxer>,
    ) -> Result<Self> {
        config.validate()?;
        let permits = Arc::new(Semaphore::new(config.pipeline.max_concurrent_jobs.max(1)));

        Ok(Self {
            config,
            open_source,
            sinks,
            muxer,
            registry: Arc::new(StyleRegistry::new()),
            progress: None,
            permits,
            entries: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Queue backed by the `ffmpeg`/`ffprobe` binaries
    pub fn with_ffmpeg(config: Config) -> Result<Self> {
        let open_source: SourceOpener = Arc::new(|path: &Path| {
            let source: Arc<dyn VideoSource> = Arc::new(FfmpegSource::open(path)?);
            Ok(source)
        });
        Self::new(config, open_source, Arc::new(FfmpegEncoder::new()), Arc::new(FfmpegMuxer::new()))
    }

    pub fn with_registry(mut self, registry: Arc<StyleRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Called for every progress event of every job
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Queue `job` and start it as soon as a slot is free
    ///
    /// A job id that is still queued or running is rejected. A finished
    /// entry with the same id is replaced.
    pub fn submit(&self, mut job: Job) -> Result<String> {
        let id = job.id.clone();
        let cancel = CancellationToken::new();
        let (done_tx, done) = watch::channel(false);

        {
            let mut entries = self.lock_entries()?;
            if entries.get(&id).is_some_and(|e| !e.job.status.is_finished()) {
                return Err(CheckpointError::JobAlreadyRunning { job_id: id }.into());
            }
            job.status = JobStatus::Queued;
            entries.insert(
                id.clone(),
                Entry {
                    job: job.clone(),
                    cancel: cancel.clone(),
                    done,
                },
            );
        }
        info!(job_id = %id, "Job queued");

        let task = JobTask {
            config: self.config.clone(),
            open_source: self.open_source.clone(),
            sinks: self.sinks.clone(),
            muxer: self.muxer.clone(),
            registry: self.registry.clone(),
            progress: self.progress.clone(),
            permits: self.permits.clone(),
            entries: self.entries.clone(),
            cancel,
            done: done_tx,
        };
        tokio::spawn(task.run(job));
        Ok(id)
    }

    /// Snapshot of one job
    pub fn get(&self, id: &str) -> Option<Job> {
        self.entries.lock().ok()?.get(id).map(|e| e.job.clone())
    }

    /// Snapshot of every job, oldest first
    pub fn list(&self) -> Vec<Job> {
        let Ok(entries) = self.entries.lock() else {
            return Vec::new();
        };
        let mut jobs: Vec<Job> = entries.values().map(|e| e.job.clone()).collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        jobs
    }

    /// Request cancellation; returns false for unknown or finished jobs
    pub fn cancel(&self, id: &str) -> bool {
        let Ok(entries) = self.entries.lock() else {
            return false;
        };
        match entries.get(id) {
            Some(entry) if !entry.job.status.is_finished() => {
                info!(job_id = %id, "Cancelling job");
                entry.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Wait for a job to finish and return its final state
    ///
    /// Any number of callers may wait on the same job.
    pub async fn wait(&self, id: &str) -> Option<Job> {
        let mut done = self.entries.lock().ok()?.get(id)?.done.clone();
        if done.wait_for(|finished| *finished).await.is_err() {
            warn!(job_id = %id, "Job task ended abnormally");
        }
        self.get(id)
    }

    /// Drop finished jobs from the queue, returning how many were removed
    pub fn clear_finished(&self) -> usize {
        let Ok(mut entries) = self.entries.lock() else {
            return 0;
        };
        let before = entries.len();
        entries.retain(|_, e| !e.job.status.is_finished());
        before - entries.len()
    }

    fn lock_entries(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Entry>>> {
        self.entries
            .lock()
            .map_err(|_| PipelineError::generic("job table lock poisoned"))
    }
}

/// Everything one spawned job needs, detached from the queue
struct JobTask {
    config: Config,
    open_source: SourceOpener,
    sinks: Arc<dyn SinkFactory>,
    muxer: Arc<dyn Muxer>,
    registry: Arc<StyleRegistry>,
    progress: Option<ProgressCallback>,
    permits: Arc<Semaphore>,
    entries: Entries,
    cancel: CancellationToken,
    done: watch::Sender<bool>,
}

impl JobTask {
    async fn run(self, mut job: Job) {
        let permit = tokio::select! {
            permit = self.permits.clone().acquire_owned() => permit,
            _ = self.cancel.cancelled() => {
                job.mark_finished(JobStatus::Cancelled);
                self.finish(job);
                return;
            }
        };
        let Ok(_permit) = permit else {
            warn!(job_id = %job.id, "Job queue closed");
            job.mark_finished(JobStatus::Cancelled);
            self.finish(job);
            return;
        };

        job.mark_started();
        self.store(job.clone());

        let runner = match self.runner(&job) {
            Ok(runner) => runner,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Could not start job");
                job.mark_finished(JobStatus::from_error(&e, None));
                self.finish(job);
                return;
            }
        };

        // The runner reports the final status; errors are already on the job
        let _ = runner.run(&mut job).await;
        debug!(job_id = %job.id, status = %job.status, "Job task finished");
        self.finish(job);
    }

    fn runner(&self, job: &Job) -> Result<JobRunner> {
        let source = (self.open_source)(&job.input)?;
        let entries = self.entries.clone();
        let id = job.id.clone();
        let user = self.progress.clone();
        let progress: ProgressCallback = Arc::new(move |event: ProgressEvent| {
            if let Ok(mut entries) = entries.lock() {
                if let Some(entry) = entries.get_mut(&id) {
                    entry.job.last_progress = Some(event.clone());
                }
            }
            if let Some(callback) = &user {
                callback(event);
            }
        });

        Ok(JobRunner::new(self.config.clone(), source, self.sinks.clone(), self.muxer.clone())?
            .with_registry(self.registry.clone())
            .with_progress(progress)
            .with_cancellation(self.cancel.clone()))
    }

    /// Store the final state, then wake every waiter
    fn finish(&self, job: Job) {
        self.store(job);
        self.done.send_replace(true);
    }

    fn store(&self, job: Job) {
        if let Ok(mut entries) = self.entries.lock() {
            if let Some(entry) = entries.get_mut(&job.id) {
                entry.job = job;
            }
        }
    }
}
