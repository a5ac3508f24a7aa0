use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::thread::JoinHandle;

use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};
use crate::video::types::{EncodingConfig, Frame, VideoInfo};

/// Destination for the frames of one chunk
pub trait VideoSink: Send {
    fn write(&mut self, frame: &Frame) -> Result<()>;

    /// Push buffered frames towards storage
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// Flush, close and make the container durable. Returns the bytes written.
    fn finish(self: Box<Self>) -> Result<u64>;
}

/// Opens a sink per chunk
pub trait SinkFactory: Send + Sync {
    fn open(&self, path: &Path, info: &VideoInfo, encoding: &EncodingConfig) -> Result<Box<dyn VideoSink>>;
}

/// Encodes raw RGB frames through an `ffmpeg` child process
#[derive(Debug, Default, Clone)]
pub struct FfmpegEncoder;

impl FfmpegEncoder {
    pub fn new() -> Self {
        Self
    }

    pub fn check_ffmpeg_available() -> bool {
        Command::new("ffmpeg")
            .arg("-version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    /// Video codec, rate control and pixel format arguments for `encoding`
    pub fn codec_args(encoding: &EncodingConfig) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-c:v".into(),
            encoding.codec.clone(),
            "-preset".into(),
            encoding.preset.clone(),
        ];
        if encoding.codec.contains("nvenc") {
            args.extend([
                "-rc".into(),
                "vbr".into(),
                "-cq".into(),
                encoding.crf.to_string(),
                "-b:v".into(),
                "0".into(),
            ]);
        } else {
            args.extend(["-crf".into(), encoding.crf.to_string()]);
        }
        args.extend(["-pix_fmt".into(), encoding.pixel_format.clone()]);
        args
    }

    /// Full argument list for encoding a raw rgb24 stream from stdin into `path`
    pub fn build_args(path: &Path, info: &VideoInfo, encoding: &EncodingConfig) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-y".into(),
            "-v".into(),
            "error".into(),
            "-f".into(),
            "rawvideo".into(),
            "-vcodec".into(),
            "rawvideo".into(),
            "-s".into(),
            format!("{}x{}", info.width, info.height),
            "-pix_fmt".into(),
            "rgb24".into(),
            "-r".into(),
            format!("{}", info.fps),
            "-i".into(),
            "-".into(),
            "-an".into(),
        ];

        args.extend(Self::codec_args(encoding));

        // Keep the source's color description on every chunk
        if let Some(space) = &info.color.space {
            args.extend(["-colorspace".into(), space.clone()]);
        }
        if let Some(transfer) = &info.color.transfer {
            args.extend(["-color_trc".into(), transfer.clone()]);
        }
        if let Some(primaries) = &info.color.primaries {
            args.extend(["-color_primaries".into(), primaries.clone()]);
        }
        if let Some(range) = &info.color.range {
            args.extend(["-color_range".into(), range.clone()]);
        }

        args.push(path.display().to_string());
        args
    }
}

impl SinkFactory for FfmpegEncoder {
    fn open(&self, path: &Path, info: &VideoInfo, encoding: &EncodingConfig) -> Result<Box<dyn VideoSink>> {
        let args = Self::build_args(path, info, encoding);
        debug!("Starting encoder: ffmpeg {}", args.join(" "));

        let mut child = Command::new("ffmpeg")
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| PipelineError::encode(format!("failed to spawn ffmpeg: {}", e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PipelineError::encode("ffmpeg stdin unavailable"))?;

        // Drain stderr on its own thread so a chatty encoder never blocks on a full pipe
        let stderr_reader = child.stderr.take().map(|mut stderr| {
            std::thread::spawn(move || {
                let mut text = String::new();
                let _ = stderr.read_to_string(&mut text);
                text
            })
        });

        Ok(Box::new(FfmpegSink {
            path: path.to_path_buf(),
            child,
            stdin: Some(stdin),
            stderr_reader,
            frames: 0,
        }))
    }
}

struct FfmpegSink {
    path: PathBuf,
    child: Child,
    stdin: Option<ChildStdin>,
    stderr_reader: Option<JoinHandle<String>>,
    frames: u64,
}

impl FfmpegSink {
    fn stderr_text(&mut self) -> String {
        self.stderr_reader
            .take()
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default()
    }
}

impl VideoSink for FfmpegSink {
    fn write(&mut self, frame: &Frame) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| PipelineError::encode("encoder input already closed"))?;
        stdin
            .write_all(frame.as_bytes())
            .map_err(|e| PipelineError::encode(format!("write to encoder failed at frame {}: {}", self.frames, e)))?;
        self.frames += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if let Some(stdin) = self.stdin.as_mut() {
            stdin
                .flush()
                .map_err(|e| PipelineError::encode(format!("encoder flush failed: {}", e)))?;
        }
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<u64> {
        // Closing stdin signals end of stream
        drop(self.stdin.take());

        let status = self
            .child
            .wait()
            .map_err(|e| PipelineError::encode(format!("waiting for encoder failed: {}", e)))?;
        let stderr = self.stderr_text();

        if !status.success() {
            return Err(PipelineError::encode(format!("ffmpeg exited with {}: {}", status, stderr.trim())));
        }

        let file = File::open(&self.path)
            .map_err(|e| PipelineError::encode(format!("encoded chunk missing: {}", e)))?;
        file.sync_all()
            .map_err(|e| PipelineError::encode(format!("fsync of {} failed: {}", self.path.display(), e)))?;
        let bytes = file.metadata()?.len();

        info!("Encoded {} frames into {} ({} bytes)", self.frames, self.path.display(), bytes);
        Ok(bytes)
    }
}

impl Drop for FfmpegSink {
    fn drop(&mut self) {
        drop(self.stdin.take());
        if let Ok(None) = self.child.try_wait() {
            if let Err(e) = self.child.kill() {
                warn!("Failed to stop encoder process: {}", e);
            }
            let _ = self.child.wait();
        }
    }
}
