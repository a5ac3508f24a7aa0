//! In-memory collaborators for pipeline tests: a deterministic source, a
//! recording sink/muxer pair and a style that fails on chosen frames.

use std::{
    collections::{HashMap, HashSet},
    io::Write,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use crate::{
    error::{PipelineError, Result, StitchError, StyleError},
    styles::{Style, StyleConfig},
    video::{
        ColorInfo, EncodingConfig, Frame, FrameIter, MediaSummary, Muxer, SinkFactory, VideoInfo,
        VideoSink, VideoSource,
    },
};

pub const WIDTH: u32 = 16;
pub const HEIGHT: u32 = 8;
pub const FPS: f64 = 25.0;

/// Initialize tracing for tests with appropriate settings
#[inline]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Index stamped into pixel (0, 0) by [`SyntheticSource::frame`]
pub fn stamped_index(frame: &Frame) -> u64 {
    let [lo, hi, _] = frame.get_pixel(0, 0);
    lo as u64 | (hi as u64) << 8
}

#[derive(Default)]
struct SourceState {
    decode_calls: Vec<(u64, u64)>,
    fail_once: HashSet<u64>,
    fail_always: HashSet<u64>,
}

/// Deterministic video of `total` frames at 25 fps
///
/// Every frame differs from its neighbours and carries its own index in
/// pixel (0, 0). Clones share call records and failure injection.
#[derive(Clone)]
pub struct SyntheticSource {
    total: u64,
    available: u64,
    keyframes: Vec<u64>,
    has_audio: bool,
    state: Arc<Mutex<SourceState>>,
}

impl SyntheticSource {
    pub fn new(total: u64) -> Self {
        Self {
            total,
            available: total,
            keyframes: (0..total).step_by(25).collect(),
            has_audio: false,
            state: Arc::new(Mutex::new(SourceState::default())),
        }
    }

    pub fn with_keyframes(mut self, keyframes: &[u64]) -> Self {
        self.keyframes = keyframes.to_vec();
        self
    }

    pub fn with_audio(mut self) -> Self {
        self.has_audio = true;
        self
    }

    /// Probe still reports `total`, but decoding stops at `available`
    pub fn truncated_at(mut self, available: u64) -> Self {
        self.available = available;
        self
    }

    /// The next decode that reaches `frame` yields an error there
    pub fn fail_once_at(&self, frame: u64) {
        self.state.lock().unwrap().fail_once.insert(frame);
    }

    /// Every decode that reaches `frame` yields an error there
    pub fn fail_always_at(&self, frame: u64) {
        self.state.lock().unwrap().fail_always.insert(frame);
    }

    pub fn decode_calls(&self) -> Vec<(u64, u64)> {
        self.state.lock().unwrap().decode_calls.clone()
    }

    pub fn info(&self) -> VideoInfo {
        VideoInfo {
            total_frames: self.total,
            fps: FPS,
            width: WIDTH,
            height: HEIGHT,
            duration: self.total as f64 / FPS,
            codec: "synthetic".to_string(),
            color: ColorInfo::default(),
            has_audio: self.has_audio,
        }
    }

    pub fn frame(&self, index: u64) -> Frame {
        let mut frame = Frame::new_black(WIDTH, HEIGHT);
        for y in 0..HEIGHT {
            for x in 0..WIDTH {
                let base = (x as u64 * 7 + y as u64 * 13 + index * 11) % 256;
                frame.set_pixel(x, y, [base as u8, (base * 3 % 256) as u8, (255 - base) as u8]);
            }
        }
        frame.set_pixel(0, 0, [(index & 0xff) as u8, (index >> 8 & 0xff) as u8, 0x5a]);
        frame
    }
}

impl VideoSource for SyntheticSource {
    fn probe(&self) -> Result<VideoInfo> {
        Ok(self.info())
    }

    fn random_access_points(&self) -> Result<Vec<u64>> {
        Ok(self.keyframes.clone())
    }

    fn decode_range(&self, start: u64, end: u64) -> Result<FrameIter> {
        self.state.lock().unwrap().decode_calls.push((start, end));

        let source = self.clone();
        let stop = end.min(self.available);
        let iter = (start..stop).map(move |index| {
            let mut state = source.state.lock().unwrap();
            if state.fail_always.contains(&index) || state.fail_once.remove(&index) {
                return Err(PipelineError::decode(index, "injected decode failure"));
            }
            drop(state);
            Ok(source.frame(index))
        });
        Ok(Box::new(iter))
    }
}

type FrameStore = Arc<Mutex<HashMap<PathBuf, Vec<Frame>>>>;

/// Sink factory whose sinks write one checksum line per frame and keep the
/// frames in memory, keyed by output path
#[derive(Clone, Default)]
pub struct RecordingSinkFactory {
    store: FrameStore,
    opened: Arc<Mutex<Vec<(PathBuf, String)>>>,
    failing_codecs: Arc<Mutex<HashSet<String>>>,
    write_delay: Option<Duration>,
    slow_next: Arc<Mutex<Option<Duration>>>,
}

impl RecordingSinkFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = Some(delay);
        self
    }

    /// The next sink opened sleeps `delay` on every write
    pub fn slow_once(&self, delay: Duration) {
        *self.slow_next.lock().unwrap() = Some(delay);
    }

    /// Sinks opened with this codec fail on their first write
    pub fn fail_codec(&self, codec: &str) {
        self.failing_codecs.lock().unwrap().insert(codec.to_string());
    }

    pub fn frames_for(&self, path: &Path) -> Vec<Frame> {
        self.store.lock().unwrap().get(path).cloned().unwrap_or_default()
    }

    /// Codecs used for every sink opened so far, in order
    pub fn opened_codecs(&self) -> Vec<String> {
        self.opened.lock().unwrap().iter().map(|(_, c)| c.clone()).collect()
    }

    pub fn opened_paths(&self) -> Vec<PathBuf> {
        self.opened.lock().unwrap().iter().map(|(p, _)| p.clone()).collect()
    }
}

impl SinkFactory for RecordingSinkFactory {
    fn open(&self, path: &Path, _info: &VideoInfo, encoding: &EncodingConfig) -> Result<Box<dyn VideoSink>> {
        self.opened
            .lock()
            .unwrap()
            .push((path.to_path_buf(), encoding.codec.clone()));
        let fail = self.failing_codecs.lock().unwrap().contains(&encoding.codec);

        let file = std::fs::File::create(path)?;
        Ok(Box::new(RecordingSink {
            path: path.to_path_buf(),
            file,
            frames: Vec::new(),
            store: self.store.clone(),
            fail,
            delay: self.slow_next.lock().unwrap().take().or(self.write_delay),
        }))
    }
}

struct RecordingSink {
    path: PathBuf,
    file: std::fs::File,
    frames: Vec<Frame>,
    store: FrameStore,
    fail: bool,
    delay: Option<Duration>,
}

impl VideoSink for RecordingSink {
    fn write(&mut self, frame: &Frame) -> Result<()> {
        if self.fail {
            return Err(PipelineError::encode("injected encoder failure"));
        }
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        let checksum: u64 = frame.as_bytes().iter().map(|&b| b as u64).sum();
        writeln!(self.file, "{}", checksum)?;
        self.frames.push(frame.clone());
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<u64> {
        let this = *self;
        this.file.sync_all()?;
        let bytes = this.file.metadata()?.len();
        this.store.lock().unwrap().insert(this.path, this.frames);
        Ok(bytes)
    }
}

/// Muxer over the frames captured by a [`RecordingSinkFactory`]
#[derive(Clone)]
pub struct RecordingMuxer {
    store: FrameStore,
    audio: Arc<Mutex<HashMap<PathBuf, f64>>>,
    reencoded: Arc<Mutex<Vec<(PathBuf, String)>>>,
    drop_frames: usize,
    audio_skew: f64,
}

impl RecordingMuxer {
    pub fn new(sinks: &RecordingSinkFactory) -> Self {
        Self {
            store: sinks.store.clone(),
            audio: Arc::new(Mutex::new(HashMap::new())),
            reencoded: Arc::new(Mutex::new(Vec::new())),
            drop_frames: 0,
            audio_skew: 0.0,
        }
    }

    /// Remuxed audio ends up `secs` longer than asked for
    pub fn with_audio_skew(mut self, secs: f64) -> Self {
        self.audio_skew = secs;
        self
    }

    /// Outputs joined through `concat_reencode`, with the codec used
    pub fn reencoded(&self) -> Vec<(PathBuf, String)> {
        self.reencoded.lock().unwrap().clone()
    }

    /// Lose `n` frames off the end of every concat, to exercise verification
    pub fn dropping_frames(mut self, n: usize) -> Self {
        self.drop_frames = n;
        self
    }

    pub fn frames_for(&self, path: &Path) -> Vec<Frame> {
        self.store.lock().unwrap().get(path).cloned().unwrap_or_default()
    }

    fn write(&self, output: &Path, frames: Vec<Frame>) -> Result<()> {
        let mut file = std::fs::File::create(output)?;
        for frame in &frames {
            writeln!(file, "{}", stamped_index(frame))?;
        }
        self.store.lock().unwrap().insert(output.to_path_buf(), frames);
        Ok(())
    }
}

impl Muxer for RecordingMuxer {
    fn concat(&self, inputs: &[PathBuf], output: &Path) -> Result<()> {
        let mut frames = Vec::new();
        for input in inputs {
            if !input.exists() {
                return Err(StitchError::MuxFailed {
                    reason: format!("missing input {}", input.display()),
                }
                .into());
            }
            frames.extend(self.frames_for(input));
        }
        let keep = frames.len().saturating_sub(self.drop_frames);
        frames.truncate(keep);
        self.write(output, frames)
    }

    fn concat_reencode(&self, inputs: &[PathBuf], output: &Path, encoding: &EncodingConfig) -> Result<()> {
        self.concat(inputs, output)?;
        self.reencoded
            .lock()
            .unwrap()
            .push((output.to_path_buf(), encoding.codec.clone()));
        Ok(())
    }

    fn remux_with_audio(&self, video: &Path, _audio_source: &Path, duration: f64, output: &Path) -> Result<()> {
        self.write(output, self.frames_for(video))?;
        self.audio
            .lock()
            .unwrap()
            .insert(output.to_path_buf(), duration + self.audio_skew);
        Ok(())
    }

    fn inspect(&self, path: &Path) -> Result<MediaSummary> {
        let frames = self.frames_for(path).len() as u64;
        let audio_duration = self.audio.lock().unwrap().get(path).copied();
        Ok(MediaSummary {
            video_frames: frames,
            video_duration: frames as f64 / FPS,
            has_audio: audio_duration.is_some(),
            audio_duration,
        })
    }
}

/// Identity style that fails on frames whose stamped index is listed
pub struct FailingStyle {
    frames: HashSet<u64>,
}

impl FailingStyle {
    pub fn on_frames(frames: &[u64]) -> Self {
        Self {
            frames: frames.iter().copied().collect(),
        }
    }
}

impl Style for FailingStyle {
    fn name(&self) -> &str {
        "flaky"
    }

    fn description(&self) -> &str {
        "Fails on selected frames"
    }

    fn apply_effect(&self, frame: &mut Frame, _config: &StyleConfig) -> Result<()> {
        let index = stamped_index(frame);
        if self.frames.contains(&index) {
            return Err(StyleError::EffectFailed {
                effect: "flaky".to_string(),
                reason: format!("injected failure on frame {}", index),
            }
            .into());
        }
        Ok(())
    }
}
