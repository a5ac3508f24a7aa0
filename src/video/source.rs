use std::io::{ErrorKind as IoErrorKind, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result, VideoError};
use crate::video::types::{ColorInfo, Frame, VideoInfo};

/// Lazy, one-pass sequence of decoded frames
pub type FrameIter = Box<dyn Iterator<Item = Result<Frame>> + Send>;

/// Where frames come from
///
/// `decode_range` must yield exactly the frames `[start, end)` in order, each one
/// decodable independently of earlier calls.
pub trait VideoSource: Send + Sync {
    fn probe(&self) -> Result<VideoInfo>;

    /// Sorted ascending frame indices where decoding can start cleanly
    fn random_access_points(&self) -> Result<Vec<u64>>;

    fn decode_range(&self, start: u64, end: u64) -> Result<FrameIter>;
}

/// `VideoSource` backed by `ffprobe` and a raw-RGB `ffmpeg` pipe
pub struct FfmpegSource {
    path: PathBuf,
    info: VideoInfo,
    start_time: f64,
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    nb_frames: Option<String>,
    duration: Option<String>,
    start_time: Option<String>,
    color_space: Option<String>,
    color_transfer: Option<String>,
    color_primaries: Option<String>,
    color_range: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PacketOutput {
    #[serde(default)]
    packets: Vec<ProbePacket>,
}

#[derive(Debug, Deserialize)]
struct ProbePacket {
    pts_time: Option<String>,
    flags: Option<String>,
}

impl FfmpegSource {
    /// Open and probe a video file
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(VideoError::LoadFailed { path: path.display().to_string() }.into());
        }

        let output = Command::new("ffprobe")
            .args(["-v", "quiet", "-print_format", "json", "-show_format", "-show_streams"])
            .arg(path)
            .output()
            .map_err(|e| VideoError::ProbeFailed {
                path: path.display().to_string(),
                reason: format!("ffprobe could not be started: {}", e),
            })?;

        if !output.status.success() {
            return Err(VideoError::ProbeFailed {
                path: path.display().to_string(),
                reason: String::from_utf8_lossy(&output.stderr).into_owned(),
            }
            .into());
        }

        let probe: ProbeOutput = serde_json::from_slice(&output.stdout).map_err(|e| {
            VideoError::ProbeFailed { path: path.display().to_string(), reason: e.to_string() }
        })?;
        let (info, start_time) = Self::info_from_probe(path, &probe)?;

        info!(
            "Probed {}: {}x{} @ {:.3}fps, {} frames, audio: {}",
            path.display(),
            info.width,
            info.height,
            info.fps,
            info.total_frames,
            info.has_audio
        );

        Ok(Self { path: path.to_path_buf(), info, start_time })
    }

    fn info_from_probe(path: &Path, probe: &ProbeOutput) -> Result<(VideoInfo, f64)> {
        let video = probe
            .streams
            .iter()
            .find(|s| s.codec_type.as_deref() == Some("video"))
            .ok_or_else(|| VideoError::ProbeFailed {
                path: path.display().to_string(),
                reason: "no video stream".to_string(),
            })?;
        let has_audio = probe.streams.iter().any(|s| s.codec_type.as_deref() == Some("audio"));

        let (width, height) = match (video.width, video.height) {
            (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
            _ => {
                return Err(VideoError::ProbeFailed {
                    path: path.display().to_string(),
                    reason: "missing frame dimensions".to_string(),
                }
                .into())
            }
        };

        let fps = video
            .avg_frame_rate
            .as_deref()
            .and_then(parse_rational)
            .or_else(|| video.r_frame_rate.as_deref().and_then(parse_rational))
            .unwrap_or(30.0);

        let duration = video
            .duration
            .as_deref()
            .and_then(|d| d.parse::<f64>().ok())
            .or_else(|| probe.format.as_ref()?.duration.as_deref()?.parse().ok())
            .unwrap_or(0.0);

        let mut total_frames = video
            .nb_frames
            .as_deref()
            .and_then(|n| n.parse::<u64>().ok())
            .unwrap_or(0);
        if total_frames == 0 && duration > 0.0 {
            total_frames = (duration * fps).round() as u64;
        }

        let start_time = video
            .start_time
            .as_deref()
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(0.0);

        let known = |v: &Option<String>| v.clone().filter(|s| s != "unknown");
        let info = VideoInfo {
            total_frames,
            fps,
            width,
            height,
            duration,
            codec: video.codec_name.clone().unwrap_or_else(|| "unknown".to_string()),
            color: ColorInfo {
                space: known(&video.color_space),
                transfer: known(&video.color_transfer),
                primaries: known(&video.color_primaries),
                range: known(&video.color_range),
            },
            has_audio,
        };
        Ok((info, start_time))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl VideoSource for FfmpegSource {
    fn probe(&self) -> Result<VideoInfo> {
        Ok(self.info.clone())
    }

    fn random_access_points(&self) -> Result<Vec<u64>> {
        let output = Command::new("ffprobe")
            .args([
                "-v", "quiet",
                "-select_streams", "v:0",
                "-show_entries", "packet=pts_time,flags",
                "-print_format", "json",
            ])
            .arg(&self.path)
            .output()
            .map_err(|e| VideoError::ProbeFailed {
                path: self.path.display().to_string(),
                reason: format!("ffprobe could not be started: {}", e),
            })?;

        if !output.status.success() {
            return Err(VideoError::ProbeFailed {
                path: self.path.display().to_string(),
                reason: String::from_utf8_lossy(&output.stderr).into_owned(),
            }
            .into());
        }

        let packets: PacketOutput = serde_json::from_slice(&output.stdout).map_err(|e| {
            VideoError::ProbeFailed { path: self.path.display().to_string(), reason: e.to_string() }
        })?;

        let mut points: Vec<u64> = packets
            .packets
            .iter()
            .filter(|p| p.flags.as_deref().is_some_and(|f| f.contains('K')))
            .filter_map(|p| p.pts_time.as_deref()?.parse::<f64>().ok())
            .map(|t| ((t - self.start_time).max(0.0) * self.info.fps).round() as u64)
            .collect();
        points.sort_unstable();
        points.dedup();

        debug!("Found {} random-access points in {}", points.len(), self.path.display());
        Ok(points)
    }

    fn decode_range(&self, start: u64, end: u64) -> Result<FrameIter> {
        if end <= start {
            return Ok(Box::new(std::iter::empty()));
        }

        // Seek half a frame early so the first frame with pts >= target is `start`
        let seek = ((start as f64 - 0.5) / self.info.fps).max(0.0);
        let count = end - start;

        let mut child = Command::new("ffmpeg")
            .args(["-v", "error", "-nostdin"])
            .arg("-ss")
            .arg(format!("{:.6}", seek))
            .arg("-i")
            .arg(&self.path)
            .args(["-map", "0:v:0", "-frames:v"])
            .arg(count.to_string())
            .args(["-f", "rawvideo", "-pix_fmt", "rgb24", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| PipelineError::decode(start, format!("ffmpeg could not be started: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PipelineError::decode(start, "ffmpeg stdout unavailable"))?;

        debug!("Decoding frames {}..{} from {}", start, end, self.path.display());
        Ok(Box::new(RawFrameReader {
            child,
            stdout,
            width: self.info.width,
            height: self.info.height,
            next_index: start,
            end,
            done: false,
        }))
    }
}

/// Reads fixed-size rgb24 frames from an ffmpeg pipe
struct RawFrameReader {
    child: Child,
    stdout: ChildStdout,
    width: u32,
    height: u32,
    next_index: u64,
    end: u64,
    done: bool,
}

impl Iterator for RawFrameReader {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.next_index >= self.end {
            return None;
        }

        let mut buf = vec![0u8; Frame::byte_len(self.width, self.height)];
        match self.stdout.read_exact(&mut buf) {
            Ok(()) => {
                self.next_index += 1;
                Frame::from_rgb_bytes(self.width, self.height, buf).map(Ok)
            }
            Err(e) => {
                self.done = true;
                let reason = if e.kind() == IoErrorKind::UnexpectedEof {
                    "decoder output ended early".to_string()
                } else {
                    e.to_string()
                };
                Some(Err(PipelineError::decode(self.next_index, reason)))
            }
        }
    }
}

impl Drop for RawFrameReader {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            if let Err(e) = self.child.kill() {
                warn!("Failed to stop decoder process: {}", e);
            }
        }
        let _ = self.child.wait();
    }
}

fn parse_rational(value: &str) -> Option<f64> {
    let (num, den) = value.split_once('/')?;
    let num: f64 = num.trim().parse().ok()?;
    let den: f64 = den.trim().parse().ok()?;
    (den != 0.0 && num > 0.0).then(|| num / den)
}
