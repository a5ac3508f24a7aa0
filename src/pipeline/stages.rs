//! Decode, stylize and encode for one chunk, as three blocking workers
//! joined by bounded queues.

use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use tokio::{
    runtime::Handle,
    sync::{mpsc, Semaphore},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::{
    error::{PipelineError, Result},
    pipeline::{
        job::{ProgressCallback, ProgressEvent},
        planner::ChunkSpec,
        stabilizer::FrameStabilizer,
    },
    styles::StyleChain,
    video::{EncodingConfig, QueueSlot, SinkFactory, VideoInfo, VideoSource},
};

type SlotResult = Result<QueueSlot>;

/// The encoded file for one chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkOutput {
    pub index: usize,
    pub path: PathBuf,
    pub start_frame: u64,
    pub end_frame: u64,
    pub frames_written: u64,
    pub bytes: u64,
    /// Encoder the chunk was written with
    pub codec: String,
}

/// Counts frames between decode and encode, and remembers the peak
#[derive(Debug, Default)]
pub struct FlightGauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl FlightGauge {
    pub fn new() -> Self {
        Self::default()
    }

    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Admission control for frames between decode and encode
///
/// Decode takes a slot before pulling a frame and the slot comes back when
/// the frame is written or dropped, so at most `limit` frames are ever in
/// flight whatever the queue sizes.
#[derive(Clone)]
struct InFlight {
    gauge: Arc<FlightGauge>,
    slots: Arc<Semaphore>,
}

impl InFlight {
    fn new(gauge: Arc<FlightGauge>, limit: usize) -> Self {
        Self {
            gauge,
            slots: Arc::new(Semaphore::new(limit.max(1))),
        }
    }

    /// Blocks until a frame may enter; false if the limiter was closed
    fn enter(&self, handle: &Handle) -> bool {
        match handle.block_on(self.slots.acquire()) {
            Ok(permit) => {
                permit.forget();
                self.gauge.enter();
                true
            }
            Err(_) => false,
        }
    }

    fn leave(&self) {
        self.gauge.leave();
        self.slots.add_permits(1);
    }
}

/// Everything one attempt at one chunk needs
#[derive(Debug, Clone)]
pub struct ChunkRequest {
    pub job_id: String,
    pub chunk: ChunkSpec,
    /// First frame to decode; earlier than `chunk.start_frame` when warming up
    pub decode_from: u64,
    pub output_path: PathBuf,
    pub encoding: EncodingConfig,
    pub info: VideoInfo,
    pub queue_capacity: usize,
    pub flush_interval_frames: u64,
    /// Frames finished in earlier chunks, for job-wide progress
    pub frames_before: u64,
    /// Wall-clock budget for this attempt
    pub budget: Option<Duration>,
}

/// A finished chunk plus the stabilizer state it left behind
pub struct ChunkAttempt {
    pub output: ChunkOutput,
    pub stabilizer: FrameStabilizer,
}

/// Runs chunks through decode, stylize and encode
///
/// Each stage is a `spawn_blocking` worker. Queues hold at most
/// `queue_capacity` slots, so a slow encoder stalls decoding instead of
/// piling frames up in memory.
pub struct StagedPipeline {
    source: Arc<dyn VideoSource>,
    sinks: Arc<dyn SinkFactory>,
    styles: Arc<StyleChain>,
    progress: Option<ProgressCallback>,
    gauge: Arc<FlightGauge>,
}

impl StagedPipeline {
    pub fn new(source: Arc<dyn VideoSource>, sinks: Arc<dyn SinkFactory>, styles: Arc<StyleChain>) -> Self {
        Self {
            source,
            sinks,
            styles,
            progress: None,
            gauge: Arc::new(FlightGauge::new()),
        }
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn gauge(&self) -> Arc<FlightGauge> {
        self.gauge.clone()
    }

    /// Process one chunk attempt
    ///
    /// The chunk is done only once the sink's `finish` has returned. On any
    /// failure the partial output is removed and the stabilizer passed in is
    /// consumed; callers keep a snapshot to retry from.
    pub async fn run_chunk(
        &self,
        request: ChunkRequest,
        stabilizer: FrameStabilizer,
        cancel: &CancellationToken,
    ) -> Result<ChunkAttempt> {
        let capacity = request.queue_capacity.max(1);
        let token = cancel.child_token();
        let timed_out = Arc::new(AtomicBool::new(false));

        let timer = request.budget.map(|budget| {
            let token = token.clone();
            let timed_out = timed_out.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(budget) => {
                        timed_out.store(true, Ordering::SeqCst);
                        token.cancel();
                    }
                    _ = token.cancelled() => {}
                }
            })
        });

        let (tx_a, rx_a) = mpsc::channel::<SlotResult>(capacity);
        let (tx_b, rx_b) = mpsc::channel::<SlotResult>(capacity);

        debug!(
            job_id = %request.job_id,
            chunk = request.chunk.index,
            start = request.chunk.start_frame,
            end = request.chunk.end_frame,
            decode_from = request.decode_from,
            capacity,
            "Starting chunk"
        );

        let flight = InFlight::new(self.gauge.clone(), 3 * capacity);
        let decode = self.spawn_decode(&request, tx_a, flight.clone(), token.clone());
        let stylize = self.spawn_stylize(&request, stabilizer, rx_a, tx_b, flight.clone(), token.clone());
        let encode = self.spawn_encode(&request, rx_b, flight, token.clone());

        let decoded = decode.await;
        let stylized = stylize.await;
        let encoded = encode.await;

        // Stops the timer if it has not fired
        token.cancel();
        if let Some(timer) = timer {
            let _ = timer.await;
        }

        let encoded = encoded.map_err(|e| join_error("encode", e))?;
        decoded.map_err(|e| join_error("decode", e))?;
        let stabilizer = stylized.map_err(|e| join_error("stylize", e))?;

        match encoded {
            Ok(output) => Ok(ChunkAttempt { output, stabilizer }),
            Err(PipelineError::Cancelled) if timed_out.load(Ordering::SeqCst) && !cancel.is_cancelled() => {
                Err(PipelineError::Timeout {
                    chunk: request.chunk.index,
                    budget_secs: request.budget.map(|b| b.as_secs()).unwrap_or_default(),
                })
            }
            Err(e) => Err(e),
        }
    }

    fn spawn_decode(
        &self,
        request: &ChunkRequest,
        tx: mpsc::Sender<SlotResult>,
        flight: InFlight,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let source = self.source.clone();
        let handle = Handle::current();
        let chunk = request.chunk.clone();
        let from = request.decode_from.min(chunk.start_frame);
        let fps = request.info.fps;

        tokio::task::spawn_blocking(move || {
            let mut frames = match source.decode_range(from, chunk.end_frame) {
                Ok(frames) => frames,
                Err(e) => {
                    let _ = tx.blocking_send(Err(e));
                    return;
                }
            };

            let mut index = from;
            while index < chunk.end_frame {
                if token.is_cancelled() {
                    return;
                }

                // Wait for an in-flight slot and queue room before decoding
                if !flight.enter(&handle) {
                    return;
                }
                let permit = match handle.block_on(tx.reserve()) {
                    Ok(permit) => permit,
                    Err(_) => {
                        flight.leave();
                        return;
                    }
                };

                match frames.next() {
                    Some(Ok(frame)) => {
                        permit.send(Ok(QueueSlot {
                            frame,
                            index,
                            pts: index as f64 / fps,
                            chunk_index: chunk.index,
                            warmup: index < chunk.start_frame,
                        }));
                        index += 1;
                    }
                    Some(Err(e)) => {
                        flight.leave();
                        permit.send(Err(e));
                        return;
                    }
                    None => {
                        flight.leave();
                        permit.send(Err(PipelineError::decode(
                            index,
                            format!("source ended before frame {}", chunk.end_frame),
                        )));
                        return;
                    }
                }
            }
        })
    }

    fn spawn_stylize(
        &self,
        request: &ChunkRequest,
        mut stabilizer: FrameStabilizer,
        mut rx: mpsc::Receiver<SlotResult>,
        tx: mpsc::Sender<SlotResult>,
        flight: InFlight,
        token: CancellationToken,
    ) -> JoinHandle<FrameStabilizer> {
        let styles = self.styles.clone();
        let job_id = request.job_id.clone();
        let chunk_index = request.chunk.index;

        tokio::task::spawn_blocking(move || {
            while let Some(item) = rx.blocking_recv() {
                if token.is_cancelled() {
                    if item.is_ok() {
                        flight.leave();
                    }
                    drain(&mut rx, &flight);
                    break;
                }

                let slot = match item {
                    Ok(slot) => slot,
                    Err(e) => {
                        if tx.blocking_send(Err(e)).is_err() {
                            break;
                        }
                        continue;
                    }
                };

                let frame = match styles.apply(&slot.frame) {
                    Ok(styled) => stabilizer.update(styled, slot.index),
                    Err(e) => {
                        warn!(
                            job_id = %job_id,
                            chunk = chunk_index,
                            frame = slot.index,
                            error = %e,
                            "Style failed, passing original frame through"
                        );
                        stabilizer.mark_skipped(slot.index);
                        slot.frame.clone()
                    }
                };

                if slot.warmup {
                    flight.leave();
                    continue;
                }

                let out = QueueSlot { frame, ..slot };
                if tx.blocking_send(Ok(out)).is_err() {
                    flight.leave();
                    drain(&mut rx, &flight);
                    break;
                }
            }
            stabilizer
        })
    }

    fn spawn_encode(
        &self,
        request: &ChunkRequest,
        mut rx: mpsc::Receiver<SlotResult>,
        flight: InFlight,
        token: CancellationToken,
    ) -> JoinHandle<Result<ChunkOutput>> {
        let sinks = self.sinks.clone();
        let progress = self.progress.clone();
        let request = request.clone();

        tokio::task::spawn_blocking(move || {
            let chunk = &request.chunk;
            let path = &request.output_path;

            let mut sink = match sinks.open(path, &request.info, &request.encoding) {
                Ok(sink) => sink,
                Err(e) => {
                    error!(job_id = %request.job_id, chunk = chunk.index, error = %e, "Could not open chunk sink");
                    drain(&mut rx, &flight);
                    remove_partial(path);
                    return Err(e);
                }
            };

            let started = Instant::now();
            let mut written = 0u64;
            let emit = |written: u64| {
                if let Some(callback) = &progress {
                    let elapsed = started.elapsed().as_secs_f64();
                    callback(ProgressEvent {
                        job_id: request.job_id.clone(),
                        chunk_index: chunk.index,
                        frames_done: request.frames_before + written,
                        total_frames: request.info.total_frames,
                        estimated_fps: if elapsed > 0.0 { written as f64 / elapsed } else { 0.0 },
                    });
                }
            };

            let outcome: Result<()> = loop {
                if token.is_cancelled() {
                    break Err(PipelineError::Cancelled);
                }
                let slot = match rx.blocking_recv() {
                    None => break Ok(()),
                    Some(Err(e)) => break Err(e),
                    Some(Ok(slot)) => slot,
                };

                let result = sink.write(&slot.frame);
                flight.leave();
                if let Err(e) = result {
                    break Err(e);
                }
                written += 1;

                if written % request.flush_interval_frames.max(1) == 0 {
                    if let Err(e) = sink.flush() {
                        break Err(e);
                    }
                    emit(written);
                }
            };

            let outcome = outcome.and_then(|()| {
                if token.is_cancelled() {
                    Err(PipelineError::Cancelled)
                } else if written != chunk.len() {
                    Err(PipelineError::generic(format!(
                        "chunk {} ended after {} of {} frames",
                        chunk.index,
                        written,
                        chunk.len()
                    )))
                } else {
                    Ok(())
                }
            });

            if let Err(e) = outcome {
                drain(&mut rx, &flight);
                drop(sink);
                remove_partial(path);
                return Err(e);
            }

            let bytes = match sink.finish() {
                Ok(bytes) => bytes,
                Err(e) => {
                    remove_partial(path);
                    return Err(e);
                }
            };
            emit(written);

            debug!(job_id = %request.job_id, chunk = chunk.index, frames = written, bytes, "Chunk encoded");
            Ok(ChunkOutput {
                index: chunk.index,
                path: path.clone(),
                start_frame: chunk.start_frame,
                end_frame: chunk.end_frame,
                frames_written: written,
                bytes,
                codec: request.encoding.codec.clone(),
            })
        })
    }
}

/// Close the queue and drop whatever is still in it
fn drain(rx: &mut mpsc::Receiver<SlotResult>, flight: &InFlight) {
    rx.close();
    while let Some(item) = rx.blocking_recv() {
        if item.is_ok() {
            flight.leave();
        }
    }
}

fn remove_partial(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "Removed partial chunk output"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Could not remove partial chunk output"),
    }
}

fn join_error(stage: &str, e: tokio::task::JoinError) -> PipelineError {
    PipelineError::generic(format!("{} stage panicked: {}", stage, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        pipeline::planner::plan,
        styles::{StyleConfig, StyleRegistry},
        test_utils::{init_tracing, FailingStyle, RecordingSinkFactory, SyntheticSource},
    };
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn request(source: &SyntheticSource, dir: &std::path::Path, chunk: ChunkSpec, capacity: usize) -> ChunkRequest {
        ChunkRequest {
            job_id: "job".to_string(),
            output_path: dir.join(format!("chunk_{:04}.mp4", chunk.index)),
            decode_from: chunk.start_frame,
            chunk,
            encoding: EncodingConfig::default(),
            info: source.info(),
            queue_capacity: capacity,
            flush_interval_frames: 10,
            frames_before: 0,
            budget: None,
        }
    }

    fn whole_input(total: u64) -> ChunkSpec {
        plan(total, 25.0, 1000.0, &[0]).unwrap().chunks[0].clone()
    }

    #[tokio::test]
    async fn test_frames_arrive_in_order() {
        init_tracing();
        let dir = tempdir().unwrap();
        let source = SyntheticSource::new(120);
        let sinks = RecordingSinkFactory::new();
        let pipeline = StagedPipeline::new(
            Arc::new(source.clone()),
            Arc::new(sinks.clone()),
            Arc::new(StyleChain::new()),
        );

        let req = request(&source, dir.path(), whole_input(120), 4);
        let attempt = pipeline
            .run_chunk(req, FrameStabilizer::new(1.0), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(attempt.output.frames_written, 120);
        assert_eq!(attempt.stabilizer.last_seen_frame_index(), Some(119));
        let frames = sinks.frames_for(&attempt.output.path);
        assert_eq!(frames.len(), 120);
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame, &source.frame(i as u64));
        }
        assert_eq!(pipeline.gauge().current(), 0);
    }

    #[tokio::test]
    async fn test_style_failure_passes_original_frame() {
        init_tracing();
        let dir = tempdir().unwrap();
        let source = SyntheticSource::new(100);
        let sinks = RecordingSinkFactory::new();

        let mut registry = StyleRegistry::new();
        registry.register("flaky".to_string(), || Box::new(FailingStyle::on_frames(&[57])));
        let chain = registry.chain(&["flaky".to_string()], &BTreeMap::new()).unwrap();

        let pipeline = StagedPipeline::new(Arc::new(source.clone()), Arc::new(sinks.clone()), Arc::new(chain));
        let req = request(&source, dir.path(), whole_input(100), 4);
        let attempt = pipeline
            .run_chunk(req, FrameStabilizer::new(0.3), &CancellationToken::new())
            .await
            .unwrap();

        let frames = sinks.frames_for(&attempt.output.path);
        assert_eq!(frames.len(), 100);
        assert_eq!(frames[57], source.frame(57));
        assert_ne!(frames[58], source.frame(58));
    }

    #[tokio::test]
    async fn test_back_pressure_bounds_in_flight_frames() {
        init_tracing();
        for capacity in [1, 2, 4] {
            let dir = tempdir().unwrap();
            let source = SyntheticSource::new(200);
            let sinks = RecordingSinkFactory::new().with_write_delay(Duration::from_millis(2));

            let mut chain = StyleChain::new();
            chain.push(Box::new(crate::styles::CartoonStyle::new()), StyleConfig::default());
            let pipeline = StagedPipeline::new(Arc::new(source.clone()), Arc::new(sinks.clone()), Arc::new(chain));

            let req = request(&source, dir.path(), whole_input(200), capacity);
            let attempt = pipeline
                .run_chunk(req, FrameStabilizer::new(0.3), &CancellationToken::new())
                .await
                .unwrap();

            let peak = pipeline.gauge().peak();
            assert_eq!(attempt.output.frames_written, 200);
            assert!(peak >= 1);
            assert!(peak <= 3 * capacity, "Q={} peak {} exceeds 3Q", capacity, peak);
            assert_eq!(pipeline.gauge().current(), 0);
        }
    }

    #[tokio::test]
    async fn test_source_ending_early_is_a_decode_error() {
        init_tracing();
        let dir = tempdir().unwrap();
        let source = SyntheticSource::new(50).truncated_at(30);
        let sinks = RecordingSinkFactory::new();
        let pipeline = StagedPipeline::new(Arc::new(source.clone()), Arc::new(sinks), Arc::new(StyleChain::new()));

        let req = request(&source, dir.path(), whole_input(50), 4);
        let path = req.output_path.clone();
        let err = pipeline
            .run_chunk(req, FrameStabilizer::new(0.3), &CancellationToken::new())
            .await
            .err()
            .unwrap();

        assert_eq!(err.kind(), crate::error::ErrorKind::DecodeError);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_cancellation_removes_partial_output() {
        init_tracing();
        let dir = tempdir().unwrap();
        let source = SyntheticSource::new(500);
        let sinks = RecordingSinkFactory::new().with_write_delay(Duration::from_millis(2));
        let pipeline = StagedPipeline::new(Arc::new(source.clone()), Arc::new(sinks), Arc::new(StyleChain::new()));

        let req = request(&source, dir.path(), whole_input(500), 4);
        let path = req.output_path.clone();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        let err = pipeline
            .run_chunk(req, FrameStabilizer::new(0.3), &cancel)
            .await
            .err()
            .unwrap();

        assert!(matches!(err, PipelineError::Cancelled));
        assert!(!path.exists());
        assert_eq!(pipeline.gauge().current(), 0);
    }

    #[tokio::test]
    async fn test_budget_exceeded_is_a_timeout() {
        init_tracing();
        let dir = tempdir().unwrap();
        let source = SyntheticSource::new(500);
        let sinks = RecordingSinkFactory::new().with_write_delay(Duration::from_millis(5));
        let pipeline = StagedPipeline::new(Arc::new(source.clone()), Arc::new(sinks), Arc::new(StyleChain::new()));

        let mut req = request(&source, dir.path(), whole_input(500), 4);
        req.budget = Some(Duration::from_millis(50));
        let err = pipeline
            .run_chunk(req, FrameStabilizer::new(0.3), &CancellationToken::new())
            .await
            .err()
            .unwrap();

        assert!(matches!(err, PipelineError::Timeout { chunk: 0, .. }));
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn test_warmup_frames_are_not_encoded() {
        init_tracing();
        let dir = tempdir().unwrap();
        let source = SyntheticSource::new(100).with_keyframes(&[0, 50]);
        let sinks = RecordingSinkFactory::new();
        let pipeline = StagedPipeline::new(Arc::new(source.clone()), Arc::new(sinks.clone()), Arc::new(StyleChain::new()));

        let chunk = plan(100, 25.0, 2.0, &[0, 50]).unwrap().chunks[1].clone();
        let mut req = request(&source, dir.path(), chunk, 4);
        req.decode_from = 46;

        let attempt = pipeline
            .run_chunk(req, FrameStabilizer::new(0.3), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(attempt.output.frames_written, 50);
        assert_eq!(sinks.frames_for(&attempt.output.path).len(), 50);
        assert_eq!(source.decode_calls(), vec![(46, 100)]);
    }
}
