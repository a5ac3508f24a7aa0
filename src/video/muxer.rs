use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Deserialize;
use tracing::{debug, info};

use crate::{
    error::{Result, StitchError},
    video::{EncodingConfig, FfmpegEncoder},
};

/// What the stitcher needs to know about a finished container
#[derive(Debug, Clone, PartialEq)]
pub struct MediaSummary {
    pub video_frames: u64,
    /// Video stream duration in seconds
    pub video_duration: f64,
    pub has_audio: bool,
    /// Audio stream duration in seconds, when there is one
    pub audio_duration: Option<f64>,
}

/// Container-level operations used to join chunk outputs
pub trait Muxer: Send + Sync {
    /// Join containers in order without re-encoding
    fn concat(&self, inputs: &[PathBuf], output: &Path) -> Result<()>;

    /// Join containers whose video streams were written by different encoders
    ///
    /// Decodes every input and encodes the joined stream once with `encoding`.
    fn concat_reencode(&self, inputs: &[PathBuf], output: &Path, encoding: &EncodingConfig) -> Result<()>;

    /// Re-multiplex `video` with the audio track of `audio_source`
    ///
    /// The audio is padded or cut to `duration` seconds; the video is never trimmed.
    fn remux_with_audio(&self, video: &Path, audio_source: &Path, duration: f64, output: &Path) -> Result<()>;

    fn inspect(&self, path: &Path) -> Result<MediaSummary>;
}

/// `Muxer` built on the ffmpeg concat demuxer and ffprobe
#[derive(Debug, Default, Clone)]
pub struct FfmpegMuxer;

#[derive(Debug, Deserialize)]
struct InspectOutput {
    #[serde(default)]
    streams: Vec<InspectStream>,
}

#[derive(Debug, Deserialize)]
struct InspectStream {
    codec_type: Option<String>,
    nb_read_frames: Option<String>,
    duration: Option<String>,
}

impl FfmpegMuxer {
    pub fn new() -> Self {
        Self
    }

    fn run_ffmpeg(args: &[String]) -> Result<()> {
        debug!("Running: ffmpeg {}", args.join(" "));
        let output = Command::new("ffmpeg").args(args).output().map_err(|e| StitchError::MuxFailed {
            reason: format!("failed to spawn ffmpeg: {}", e),
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(StitchError::MuxFailed { reason: format!("ffmpeg failed: {}", stderr.trim()) }.into());
        }
        Ok(())
    }

    /// `concat` filter graph joining the first video stream of `n` inputs into `[v]`
    pub fn concat_filter(n: usize) -> String {
        let mut graph: String = (0..n).map(|i| format!("[{}:v:0]", i)).collect();
        graph.push_str(&format!("concat=n={}:v=1:a=0[v]", n));
        graph
    }

    /// Arguments muxing the video of `video` with the audio of `audio_source`
    pub fn remux_args(video: &Path, audio_source: &Path, duration: f64, output: &Path) -> Vec<String> {
        vec![
            "-y".to_string(),
            "-v".into(),
            "error".into(),
            "-i".into(),
            video.display().to_string(),
            "-i".into(),
            audio_source.display().to_string(),
            "-map".into(),
            "0:v:0".into(),
            "-map".into(),
            "1:a?".into(),
            "-c:v".into(),
            "copy".into(),
            "-c:a".into(),
            "aac".into(),
            "-b:a".into(),
            "192k".into(),
            // Silence-pad short audio, then cut everything at the video length
            "-af".into(),
            "apad".into(),
            "-t".into(),
            format!("{:.6}", duration),
            output.display().to_string(),
        ]
    }

    /// Concat-demuxer list file contents for the given inputs
    pub fn concat_list(inputs: &[PathBuf]) -> String {
        let mut list = String::new();
        for input in inputs {
            // Absolute paths avoid the demuxer resolving relative to the list file
            let absolute = input.canonicalize().unwrap_or_else(|_| input.clone());
            let escaped = absolute.display().to_string().replace('\'', "'\\''");
            list.push_str(&format!("file '{}'\n", escaped));
        }
        list
    }
}

impl Muxer for FfmpegMuxer {
    fn concat(&self, inputs: &[PathBuf], output: &Path) -> Result<()> {
        let list_path = output.with_extension("concat.txt");
        let mut file = File::create(&list_path)?;
        file.write_all(Self::concat_list(inputs).as_bytes())?;
        file.sync_all()?;
        drop(file);

        let args = vec![
            "-y".to_string(),
            "-v".into(),
            "error".into(),
            "-f".into(),
            "concat".into(),
            "-safe".into(),
            "0".into(),
            "-i".into(),
            list_path.display().to_string(),
            "-c".into(),
            "copy".into(),
            output.display().to_string(),
        ];
        let result = Self::run_ffmpeg(&args);
        let _ = std::fs::remove_file(&list_path);
        result?;

        info!("Concatenated {} chunks into {}", inputs.len(), output.display());
        Ok(())
    }

    fn concat_reencode(&self, inputs: &[PathBuf], output: &Path, encoding: &EncodingConfig) -> Result<()> {
        let mut args = vec!["-y".to_string(), "-v".into(), "error".into()];
        for input in inputs {
            args.extend(["-i".into(), input.display().to_string()]);
        }
        args.extend([
            "-filter_complex".into(),
            Self::concat_filter(inputs.len()),
            "-map".into(),
            "[v]".into(),
        ]);
        args.extend(FfmpegEncoder::codec_args(encoding));
        args.push(output.display().to_string());

        Self::run_ffmpeg(&args)?;
        info!(
            codec = %encoding.codec,
            "Re-encoded {} chunks into {}",
            inputs.len(),
            output.display()
        );
        Ok(())
    }

    fn remux_with_audio(&self, video: &Path, audio_source: &Path, duration: f64, output: &Path) -> Result<()> {
        let args = Self::remux_args(video, audio_source, duration, output);
        Self::run_ffmpeg(&args)?;
        info!("Re-multiplexed audio from {} into {}", audio_source.display(), output.display());
        Ok(())
    }

    fn inspect(&self, path: &Path) -> Result<MediaSummary> {
        let output = Command::new("ffprobe")
            .args(["-v", "quiet", "-count_frames", "-show_streams", "-print_format", "json"])
            .arg(path)
            .output()
            .map_err(|e| StitchError::VerificationFailed { reason: format!("ffprobe failed: {}", e) })?;

        if !output.status.success() {
            return Err(StitchError::VerificationFailed {
                reason: format!("ffprobe could not read {}", path.display()),
            }
            .into());
        }

        let parsed: InspectOutput = serde_json::from_slice(&output.stdout)
            .map_err(|e| StitchError::VerificationFailed { reason: e.to_string() })?;
        let video = parsed
            .streams
            .iter()
            .find(|s| s.codec_type.as_deref() == Some("video"))
            .ok_or_else(|| StitchError::VerificationFailed {
                reason: format!("{} has no video stream", path.display()),
            })?;

        let audio = parsed.streams.iter().find(|s| s.codec_type.as_deref() == Some("audio"));

        Ok(MediaSummary {
            video_frames: video.nb_read_frames.as_deref().and_then(|n| n.parse().ok()).unwrap_or(0),
            video_duration: video.duration.as_deref().and_then(|d| d.parse().ok()).unwrap_or(0.0),
            has_audio: audio.is_some(),
            audio_duration: audio.and_then(|a| a.duration.as_deref()).and_then(|d| d.parse().ok()),
        })
    }
}
