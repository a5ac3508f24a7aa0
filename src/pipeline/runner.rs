use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::Config,
    error::{ErrorKind, PipelineError, Result},
    pipeline::{
        checkpoint::CheckpointStore,
        job::{Job, JobStatus, ProgressCallback, ProgressEvent},
        planner::{self, ChunkSpec},
        stabilizer::FrameStabilizer,
        stages::{ChunkAttempt, ChunkOutput, ChunkRequest, StagedPipeline},
        stitcher::{ChunkStitcher, StitchReport},
    },
    styles::StyleRegistry,
    video::{EncodingConfig, FfmpegEncoder, FfmpegMuxer, FfmpegSource, Muxer, SinkFactory, VideoInfo, VideoSource},
};

/// Runs one job end to end: plan, process chunks, checkpoint, stitch
///
/// Completed chunks recorded by an earlier run under the same configuration
/// fingerprint are skipped.
pub struct JobRunner {
    config: Config,
    source: Arc<dyn VideoSource>,
    sinks: Arc<dyn SinkFactory>,
    muxer: Arc<dyn Muxer>,
    registry: Arc<StyleRegistry>,
    checkpoints: CheckpointStore,
    progress: Option<ProgressCallback>,
    cancel: CancellationToken,
}

impl JobRunner {
    pub fn new(
        config: Config,
        source: Arc<dyn VideoSource>,
        sinks: Arc<dyn SinkFactory>,
        muxer: Arc<dyn Muxer>,
    ) -> Result<Self> {
        config.validate()?;
        let checkpoints = CheckpointStore::new(&config.pipeline.checkpoint_dir)?;

        Ok(Self {
            config,
            source,
            sinks,
            muxer,
            registry: Arc::new(StyleRegistry::new()),
            checkpoints,
            progress: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Runner backed by the `ffmpeg`/`ffprobe` binaries
    pub fn with_ffmpeg(config: Config, input: &Path) -> Result<Self> {
        let source = FfmpegSource::open(input)?;
        Self::new(
            config,
            Arc::new(source),
            Arc::new(FfmpegEncoder::new()),
            Arc::new(FfmpegMuxer::new()),
        )
    }

    pub fn with_registry(mut self, registry: Arc<StyleRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run `job` and leave its final status on it
    pub async fn run(&self, job: &mut Job) -> Result<StitchReport> {
        job.mark_started();
        job.config = Some(self.config.clone());
        info!(job_id = %job.id, input = %job.input.display(), styles = ?job.styles, "Job started");

        let last_progress = Arc::new(Mutex::new(None));
        let mut failed_chunk = None;
        let result = self.execute(job, &last_progress, &mut failed_chunk).await;

        job.last_progress = last_progress.lock().ok().and_then(|p| p.clone());
        match &result {
            Ok(report) => {
                info!(job_id = %job.id, output = %report.output.display(), frames = report.frames, "Job completed");
                job.mark_finished(JobStatus::Completed);
            }
            Err(e) => {
                let status = JobStatus::from_error(e, failed_chunk);
                match status {
                    JobStatus::Cancelled => info!(job_id = %job.id, "Job cancelled"),
                    _ => error!(job_id = %job.id, chunk = ?failed_chunk, error = %e, "Job failed"),
                }
                job.mark_finished(status);
            }
        }
        result
    }

    async fn execute(
        &self,
        job: &mut Job,
        last_progress: &Arc<Mutex<Option<ProgressEvent>>>,
        failed_chunk: &mut Option<usize>,
    ) -> Result<StitchReport> {
        let config = &self.config;

        let info = self.source.probe()?;
        let keyframes = self.source.random_access_points()?;
        let plan = planner::plan(
            info.total_frames,
            info.fps,
            config.pipeline.chunk_duration_secs,
            &keyframes,
        )?;
        info!(
            job_id = %job.id,
            chunks = plan.len(),
            total_frames = plan.total_frames,
            fps = plan.fps,
            "Chunk plan ready"
        );

        let chain = Arc::new(self.registry.chain(&job.styles, &config.style)?);
        let fingerprint = config.fingerprint(&job.styles, &info)?;
        job.configuration_fingerprint = Some(fingerprint.clone());
        let mut writer = self.checkpoints.begin(&job.id, &fingerprint, plan.len())?;

        let work_dir = config.pipeline.work_dir.join(&job.id);
        std::fs::create_dir_all(&work_dir)?;

        // A recorded chunk is only trusted while its output is still on disk
        let recorded = writer.completed_count();
        let trusted = (0..recorded)
            .take_while(|&i| self.chunk_path(&work_dir, i).exists())
            .count();
        if trusted < recorded {
            warn!(job_id = %job.id, recorded, trusted, "Chunk outputs missing, redoing them");
            let last_flushed = trusted.checked_sub(1).map(|i| plan.chunks[i].end_frame - 1);
            writer.truncate(trusted, last_flushed)?;
        }
        if trusted == 0 {
            clear_stale_chunks(&work_dir);
        }

        let progress = self.progress_recorder(last_progress);
        let pipeline =
            StagedPipeline::new(self.source.clone(), self.sinks.clone(), chain.clone()).with_progress(progress);

        let mut stabilizer = FrameStabilizer::from_config(&config.stabilizer);
        if stabilizer.is_enabled() && !chain.is_flicker_prone() {
            debug!(job_id = %job.id, styles = ?job.styles, "No flicker-prone style, stabilizer off");
            stabilizer = stabilizer.disabled();
        }
        let mut encoding = config.encoding.clone();
        // A fallback recorded by an earlier run sticks for the rest of the job
        let fell_back_before = (0..writer.completed_count())
            .any(|i| writer.codec_of(i) == Some(config.encoding.fallback_codec.as_str()));
        if fell_back_before && encoding.codec != encoding.fallback_codec {
            info!(job_id = %job.id, codec = %encoding.fallback_codec, "Resuming on the fallback encoder");
            encoding = encoding.fallback();
        }
        let mut outputs = Vec::with_capacity(plan.len());
        let mut frames_before = 0u64;

        for chunk in &plan.chunks {
            if self.cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }

            let path = self.chunk_path(&work_dir, chunk.index);
            if writer.is_done(chunk.index) {
                debug!(job_id = %job.id, chunk = chunk.index, "Chunk already complete, skipping");
                outputs.push(ChunkOutput {
                    index: chunk.index,
                    bytes: std::fs::metadata(&path)?.len(),
                    path,
                    start_frame: chunk.start_frame,
                    end_frame: chunk.end_frame,
                    frames_written: chunk.len(),
                    codec: writer.codec_of(chunk.index).unwrap_or(&config.encoding.codec).to_string(),
                });
                frames_before += chunk.len();
                continue;
            }

            *failed_chunk = Some(chunk.index);
            let attempt = self
                .process_chunk(
                    &pipeline,
                    job,
                    chunk,
                    path,
                    &info,
                    &stabilizer,
                    &mut encoding,
                    frames_before,
                )
                .await?;

            writer.record_chunk_done(chunk.index, chunk.end_frame - 1, &attempt.output.codec)?;
            info!(
                job_id = %job.id,
                chunk = chunk.index,
                done = chunk.index + 1,
                total = plan.len(),
                "Chunk complete"
            );

            stabilizer = attempt.stabilizer;
            outputs.push(attempt.output);
            frames_before += chunk.len();
        }
        *failed_chunk = None;

        let stitcher = ChunkStitcher::new(self.muxer.clone(), config.stitch.clone(), config.encoding.fallback());
        let report = stitcher.stitch(&plan, &outputs, &job.input, &info, &job.output)?;

        self.checkpoints.clear(&job.id)?;
        drop(writer);
        if !config.stitch.keep_chunks {
            // Only succeeds once the directory is empty
            let _ = std::fs::remove_dir(&work_dir);
        }

        Ok(report)
    }

    /// Run one chunk, retrying per the failure policy
    ///
    /// Decode errors and timeouts retry with the same range up to
    /// `decode_retries` times. An encode error switches to the fallback
    /// encoder once; the switch sticks for the rest of the job.
    #[allow(clippy::too_many_arguments)]
    async fn process_chunk(
        &self,
        pipeline: &StagedPipeline,
        job: &Job,
        chunk: &ChunkSpec,
        path: PathBuf,
        info: &VideoInfo,
        stabilizer: &FrameStabilizer,
        encoding: &mut EncodingConfig,
        frames_before: u64,
    ) -> Result<ChunkAttempt> {
        let config = &self.config;
        let mut decode_failures = 0u32;
        let mut fell_back = encoding.codec == encoding.fallback_codec;

        loop {
            let decode_from = if stabilizer.needs_warmup(chunk.start_frame) {
                chunk.start_frame.saturating_sub(config.stabilizer.warmup())
            } else {
                chunk.start_frame
            };
            if decode_from < chunk.start_frame {
                debug!(
                    job_id = %job.id,
                    chunk = chunk.index,
                    warmup_frames = chunk.start_frame - decode_from,
                    "Warming up stabilizer"
                );
            }

            let request = ChunkRequest {
                job_id: job.id.clone(),
                chunk: chunk.clone(),
                decode_from,
                output_path: path.clone(),
                encoding: encoding.clone(),
                info: info.clone(),
                queue_capacity: config.pipeline.queue_capacity,
                flush_interval_frames: config.pipeline.flush_interval_frames,
                frames_before,
                budget: match config.pipeline.chunk_timeout_secs {
                    0 => None,
                    secs => Some(Duration::from_secs(secs)),
                },
            };

            let error = match pipeline.run_chunk(request, stabilizer.clone(), &self.cancel).await {
                Ok(attempt) => return Ok(attempt),
                Err(e) => e,
            };

            match error.kind() {
                ErrorKind::EncodeError if !fell_back => {
                    warn!(
                        job_id = %job.id,
                        chunk = chunk.index,
                        codec = %encoding.codec,
                        fallback = %encoding.fallback_codec,
                        error = %error,
                        "Encoder failed, retrying with fallback"
                    );
                    *encoding = encoding.fallback();
                    fell_back = true;
                }
                _ if error.is_recoverable() && decode_failures < config.pipeline.decode_retries => {
                    decode_failures += 1;
                    warn!(
                        job_id = %job.id,
                        chunk = chunk.index,
                        attempt = decode_failures,
                        retries = config.pipeline.decode_retries,
                        error = %error,
                        "Chunk failed, retrying"
                    );
                }
                _ => return Err(error),
            }
        }
    }

    fn chunk_path(&self, work_dir: &Path, index: usize) -> PathBuf {
        work_dir.join(format!("chunk_{:05}.{}", index, self.config.encoding.container))
    }

    /// Wraps the user's callback so the job keeps the latest snapshot
    fn progress_recorder(&self, last: &Arc<Mutex<Option<ProgressEvent>>>) -> ProgressCallback {
        let last = last.clone();
        let user = self.progress.clone();
        Arc::new(move |event: ProgressEvent| {
            if let Ok(mut slot) = last.lock() {
                *slot = Some(event.clone());
            }
            if let Some(callback) = &user {
                callback(event);
            }
        })
    }
}

/// Remove chunk files left by a run whose checkpoint was discarded
fn clear_stale_chunks(work_dir: &Path) {
    let Ok(entries) = std::fs::read_dir(work_dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let is_chunk = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with("chunk_"));
        if is_chunk {
            debug!(path = %path.display(), "Removing stale chunk output");
            let _ = std::fs::remove_file(&path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{init_tracing, FailingStyle, RecordingMuxer, RecordingSinkFactory, SyntheticSource};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::{tempdir, TempDir};

    const TOTAL: u64 = 1000;
    const KEYFRAMES: [u64; 4] = [0, 310, 620, 1000];

    struct Harness {
        dir: TempDir,
        sinks: RecordingSinkFactory,
        muxer: RecordingMuxer,
    }

    impl Harness {
        fn new() -> Self {
            init_tracing();
            let sinks = RecordingSinkFactory::new();
            let muxer = RecordingMuxer::new(&sinks);
            Self {
                dir: tempdir().unwrap(),
                sinks,
                muxer,
            }
        }

        fn config(&self) -> Config {
            let mut config = Config::default();
            // 300 frames at 25 fps
            config.pipeline.chunk_duration_secs = 12.0;
            config.pipeline.queue_capacity = 4;
            config.pipeline.work_dir = self.dir.path().join("work");
            config.pipeline.checkpoint_dir = self.dir.path().join("checkpoints");
            config
        }

        fn source(&self) -> SyntheticSource {
            SyntheticSource::new(TOTAL).with_keyframes(&KEYFRAMES)
        }

        fn runner(&self, config: Config, source: &SyntheticSource) -> JobRunner {
            JobRunner::new(
                config,
                Arc::new(source.clone()),
                Arc::new(self.sinks.clone()),
                Arc::new(self.muxer.clone()),
            )
            .unwrap()
        }

        fn job(&self, id: &str, styles: &[&str]) -> Job {
            Job::new(
                id,
                PathBuf::from("input.mp4"),
                self.dir.path().join(format!("{}.mp4", id)),
                styles.iter().map(|s| s.to_string()).collect(),
            )
        }
    }

    fn failure(job: &Job) -> (ErrorKind, Option<usize>) {
        match &job.status {
            JobStatus::Failed { kind, chunk_index, .. } => (*kind, *chunk_index),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_full_job_completes() {
        let h = Harness::new();
        let source = h.source();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let runner = h
            .runner(h.config(), &source)
            .with_progress(Arc::new(move |e: ProgressEvent| sink.lock().unwrap().push(e)));
        let mut job = h.job("full", &["cinematic"]);

        let report = runner.run(&mut job).await.unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.started_at.is_some() && job.finished_at.is_some());
        assert_eq!(report.frames, TOTAL);
        assert_eq!(report.chunks, 3);
        assert_eq!(h.muxer.frames_for(&job.output).len(), TOTAL as usize);
        assert_eq!(source.decode_calls(), vec![(0, 310), (310, 620), (620, 1000)]);

        let events = events.lock().unwrap();
        assert_eq!(events.last().unwrap().frames_done, TOTAL);
        assert!(events.windows(2).all(|w| w[0].frames_done <= w[1].frames_done));
        assert_eq!(job.last_progress.as_ref().unwrap().frames_done, TOTAL);
        assert_eq!(job.config.as_ref(), Some(runner.config()));
        let fingerprint = runner.config().fingerprint(&job.styles, &source.info()).unwrap();
        assert_eq!(job.configuration_fingerprint, Some(fingerprint));

        let store = CheckpointStore::new(h.dir.path().join("checkpoints")).unwrap();
        assert!(store.load("full", "any").unwrap().is_none());
        assert!(!h.dir.path().join("work/full").exists());
    }

    #[tokio::test]
    async fn test_resume_skips_completed_chunks() {
        let h = Harness::new();
        let mut config = h.config();
        config.pipeline.decode_retries = 0;

        // First run dies inside chunk 1
        let crashing = h.source();
        crashing.fail_always_at(400);
        let mut job = h.job("resume", &["cartoon"]);
        assert!(h.runner(config.clone(), &crashing).run(&mut job).await.is_err());
        assert_eq!(failure(&job), (ErrorKind::DecodeError, Some(1)));

        let resumed = h.source();
        let mut job = h.job("resume", &["cartoon"]);
        h.runner(config.clone(), &resumed).run(&mut job).await.unwrap();

        let warmup = config.stabilizer.warmup();
        assert_eq!(resumed.decode_calls(), vec![(310 - warmup, 620), (620, 1000)]);
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(h.muxer.frames_for(&job.output).len(), TOTAL as usize);
    }

    #[tokio::test]
    async fn test_resume_without_flicker_prone_style_skips_warmup() {
        let h = Harness::new();
        let mut config = h.config();
        config.pipeline.decode_retries = 0;

        let crashing = h.source();
        crashing.fail_always_at(400);
        let mut job = h.job("steady", &["cinematic"]);
        assert!(h.runner(config.clone(), &crashing).run(&mut job).await.is_err());

        let resumed = h.source();
        h.runner(config, &resumed).run(&mut job).await.unwrap();

        assert_eq!(resumed.decode_calls(), vec![(310, 620), (620, 1000)]);
        assert_eq!(h.muxer.frames_for(&job.output).len(), TOTAL as usize);
    }

    #[tokio::test]
    async fn test_resumed_output_matches_uninterrupted_within_seam_bound() {
        let h = Harness::new();
        let mut config = h.config();
        config.pipeline.decode_retries = 0;
        let bound = config.stabilizer.seam_bound();

        let mut reference = h.job("reference", &["cartoon"]);
        h.runner(config.clone(), &h.source()).run(&mut reference).await.unwrap();

        let crashing = h.source();
        crashing.fail_always_at(700);
        let mut job = h.job("interrupted", &["cartoon"]);
        assert!(h.runner(config.clone(), &crashing).run(&mut job).await.is_err());
        h.runner(config.clone(), &h.source()).run(&mut job).await.unwrap();

        let expected = h.muxer.frames_for(&reference.output);
        let actual = h.muxer.frames_for(&job.output);
        assert_eq!(actual.len(), expected.len());
        for (a, b) in actual.iter().zip(&expected) {
            for (x, y) in a.as_bytes().iter().zip(b.as_bytes()) {
                assert!((*x as f32 - *y as f32).abs() <= bound + 1.0);
            }
        }
        // Before the interruption the outputs are identical
        assert_eq!(actual[..620], expected[..620]);
    }

    #[tokio::test]
    async fn test_style_failure_on_one_frame_passes_it_through() {
        let h = Harness::new();
        let source = h.source();
        let mut registry = StyleRegistry::new();
        registry.register("flaky".to_string(), || Box::new(FailingStyle::on_frames(&[57])));

        let runner = h.runner(h.config(), &source).with_registry(Arc::new(registry));
        let mut job = h.job("flaky", &["flaky"]);
        runner.run(&mut job).await.unwrap();

        let frames = h.muxer.frames_for(&job.output);
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(frames.len(), TOTAL as usize);
        assert_eq!(frames[57], source.frame(57));
    }

    #[tokio::test]
    async fn test_decode_error_is_retried() {
        let h = Harness::new();
        let source = h.source();
        source.fail_once_at(400);

        let mut job = h.job("retry", &[]);
        h.runner(h.config(), &source).run(&mut job).await.unwrap();

        assert_eq!(
            source.decode_calls(),
            vec![(0, 310), (310, 620), (310, 620), (620, 1000)]
        );
        assert_eq!(h.muxer.frames_for(&job.output).len(), TOTAL as usize);
    }

    #[tokio::test]
    async fn test_timed_out_chunk_is_retried() {
        let h = Harness::new();
        let mut config = h.config();
        config.pipeline.chunk_timeout_secs = 1;
        // Chunk 0 needs about 6s on the first sink, well over budget
        h.sinks.slow_once(Duration::from_millis(20));

        let source = h.source();
        let mut job = h.job("slow", &[]);
        h.runner(config, &source).run(&mut job).await.unwrap();

        assert_eq!(
            source.decode_calls(),
            vec![(0, 310), (0, 310), (310, 620), (620, 1000)]
        );
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(h.muxer.frames_for(&job.output).len(), TOTAL as usize);
    }

    #[tokio::test]
    async fn test_checkpoint_write_failure_fails_job() {
        let h = Harness::new();
        let removed = Arc::new(AtomicBool::new(false));
        let flag = removed.clone();
        let dir = h.dir.path().join("checkpoints");
        let source = h.source();
        let runner = h
            .runner(h.config(), &source)
            .with_progress(Arc::new(move |_: ProgressEvent| {
                if !flag.swap(true, Ordering::SeqCst) {
                    std::fs::remove_dir_all(&dir).unwrap();
                }
            }));

        let mut job = h.job("unwritable", &[]);
        assert!(runner.run(&mut job).await.is_err());

        assert!(removed.load(Ordering::SeqCst));
        assert_eq!(failure(&job), (ErrorKind::CheckpointWriteError, Some(0)));
        // Nothing past the unrecorded chunk was attempted
        assert!(!h.sinks.opened_paths().iter().any(|p| p.ends_with("chunk_00001.mp4")));
        assert_eq!(source.decode_calls(), vec![(0, 310)]);
    }

    #[tokio::test]
    async fn test_decode_retries_exhausted_fails_job_and_keeps_checkpoint() {
        let h = Harness::new();
        let mut config = h.config();
        config.pipeline.decode_retries = 1;
        let source = h.source();
        source.fail_always_at(650);

        let mut job = h.job("doomed", &[]);
        let err = h.runner(config.clone(), &source).run(&mut job).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::DecodeError);
        assert_eq!(failure(&job), (ErrorKind::DecodeError, Some(2)));
        assert_eq!(source.decode_calls().iter().filter(|c| c.0 == 620).count(), 2);

        let fingerprint = config.fingerprint(&job.styles, &source.info()).unwrap();
        let store = CheckpointStore::new(&config.pipeline.checkpoint_dir).unwrap();
        let checkpoint = store.load("doomed", &fingerprint).unwrap().unwrap();
        assert_eq!(checkpoint.completed_chunks.len(), 2);
        assert_eq!(checkpoint.last_flushed_frame, Some(619));
    }

    #[tokio::test]
    async fn test_encoder_falls_back_once() {
        let h = Harness::new();
        h.sinks.fail_codec("h264_nvenc");

        let mut job = h.job("fallback", &[]);
        h.runner(h.config(), &h.source()).run(&mut job).await.unwrap();

        assert_eq!(
            h.sinks.opened_codecs(),
            vec!["h264_nvenc", "libx264", "libx264", "libx264"]
        );
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_resume_after_encoder_change_reencodes_join() {
        let h = Harness::new();
        let mut config = h.config();
        config.pipeline.decode_retries = 0;

        let crashing = h.source();
        crashing.fail_always_at(400);
        let mut job = h.job("mixed", &[]);
        assert!(h.runner(config.clone(), &crashing).run(&mut job).await.is_err());

        // The hardware encoder is gone on the rerun
        h.sinks.fail_codec("h264_nvenc");
        h.runner(config, &h.source()).run(&mut job).await.unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(h.muxer.reencoded(), vec![(job.output.clone(), "libx264".to_string())]);
        assert_eq!(h.muxer.frames_for(&job.output).len(), TOTAL as usize);
    }

    #[tokio::test]
    async fn test_resume_keeps_fallback_encoder() {
        let h = Harness::new();
        let mut config = h.config();
        config.pipeline.decode_retries = 0;
        h.sinks.fail_codec("h264_nvenc");

        let crashing = h.source();
        crashing.fail_always_at(400);
        let mut job = h.job("sticky", &[]);
        assert!(h.runner(config.clone(), &crashing).run(&mut job).await.is_err());
        let first_run = h.sinks.opened_codecs().len();

        h.runner(config, &h.source()).run(&mut job).await.unwrap();

        let rerun = &h.sinks.opened_codecs()[first_run..];
        assert_eq!(rerun, ["libx264", "libx264"]);
        assert!(h.muxer.reencoded().is_empty());
    }

    #[tokio::test]
    async fn test_fallback_failure_fails_job() {
        let h = Harness::new();
        h.sinks.fail_codec("h264_nvenc");
        h.sinks.fail_codec("libx264");

        let mut job = h.job("no-encoder", &[]);
        assert!(h.runner(h.config(), &h.source()).run(&mut job).await.is_err());
        assert_eq!(failure(&job), (ErrorKind::EncodeError, Some(0)));
    }

    #[tokio::test]
    async fn test_configuration_change_starts_over() {
        let h = Harness::new();
        let mut config = h.config();
        config.pipeline.decode_retries = 0;

        let crashing = h.source();
        crashing.fail_always_at(400);
        let mut job = h.job("changed", &[]);
        assert!(h.runner(config.clone(), &crashing).run(&mut job).await.is_err());

        config.encoding.crf = 28;
        let fresh = h.source();
        h.runner(config, &fresh).run(&mut job).await.unwrap();

        assert_eq!(fresh.decode_calls(), vec![(0, 310), (310, 620), (620, 1000)]);
    }

    #[tokio::test]
    async fn test_missing_chunk_file_is_redone() {
        let h = Harness::new();
        let mut config = h.config();
        config.pipeline.decode_retries = 0;

        let crashing = h.source();
        crashing.fail_always_at(700);
        let mut job = h.job("lost", &["pencil"]);
        assert!(h.runner(config.clone(), &crashing).run(&mut job).await.is_err());

        std::fs::remove_file(h.dir.path().join("work/lost/chunk_00001.mp4")).unwrap();
        let source = h.source();
        h.runner(config, &source).run(&mut job).await.unwrap();

        let warmup = Config::default().stabilizer.warmup();
        assert_eq!(source.decode_calls(), vec![(310 - warmup, 620), (620, 1000)]);
    }

    #[tokio::test]
    async fn test_missing_chunk_file_rewinds_checkpoint() {
        let h = Harness::new();
        let mut config = h.config();
        config.pipeline.decode_retries = 0;

        let crashing = h.source();
        crashing.fail_always_at(700);
        let mut job = h.job("rewound", &[]);
        assert!(h.runner(config.clone(), &crashing).run(&mut job).await.is_err());

        std::fs::remove_file(h.dir.path().join("work/rewound/chunk_00001.mp4")).unwrap();
        let crashing_again = h.source();
        crashing_again.fail_always_at(400);
        assert!(h.runner(config.clone(), &crashing_again).run(&mut job).await.is_err());
        assert_eq!(failure(&job), (ErrorKind::DecodeError, Some(1)));

        let fingerprint = config.fingerprint(&job.styles, &crashing_again.info()).unwrap();
        let store = CheckpointStore::new(&config.pipeline.checkpoint_dir).unwrap();
        let checkpoint = store.load("rewound", &fingerprint).unwrap().unwrap();
        assert_eq!(checkpoint.completed_chunks.iter().copied().collect::<Vec<_>>(), vec![0]);
        assert_eq!(checkpoint.last_flushed_frame, Some(309));
        assert_eq!(checkpoint.codec_of(0), Some("h264_nvenc"));
    }

    #[tokio::test]
    async fn test_concurrent_run_of_same_job_is_rejected() {
        let h = Harness::new();
        let config = h.config();
        let store = CheckpointStore::new(&config.pipeline.checkpoint_dir).unwrap();
        let _held = store.begin("busy", "fp", 3).unwrap();

        let mut job = h.job("busy", &[]);
        assert!(h.runner(config, &h.source()).run(&mut job).await.is_err());
        assert_eq!(failure(&job), (ErrorKind::JobAlreadyRunningError, None));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let h = Harness::new();
        let runner = h.runner(h.config(), &h.source());
        runner.cancellation_token().cancel();

        let mut job = h.job("cancelled", &[]);
        assert!(runner.run(&mut job).await.is_err());
        assert_eq!(job.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_unknown_style_fails_before_decoding() {
        let h = Harness::new();
        let source = h.source();
        let mut job = h.job("unknown", &["watercolor"]);

        assert!(h.runner(h.config(), &source).run(&mut job).await.is_err());
        assert_eq!(failure(&job).0, ErrorKind::StyleTransformError);
        assert_eq!(source.decode_calls(), vec![(0, 310)]);
    }
}
