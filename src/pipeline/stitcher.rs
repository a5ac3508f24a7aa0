use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    config::StitchConfig,
    error::{Result, StitchError},
    pipeline::{planner::ChunkPlan, stages::ChunkOutput},
    video::{EncodingConfig, MediaSummary, Muxer, VideoInfo},
};

/// What the final merge produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StitchReport {
    pub output: PathBuf,
    pub chunks: usize,
    pub frames: u64,
    pub duration: f64,
    pub has_audio: bool,
}

/// Joins chunk outputs into the final file and checks the result
///
/// Chunks written by one encoder are joined by stream copy. A mix of
/// encoders is decoded and encoded once more with `encoding`.
pub struct ChunkStitcher {
    muxer: Arc<dyn Muxer>,
    config: StitchConfig,
    encoding: EncodingConfig,
}

impl ChunkStitcher {
    pub fn new(muxer: Arc<dyn Muxer>, config: StitchConfig, encoding: EncodingConfig) -> Self {
        Self { muxer, config, encoding }
    }

    fn join(&self, outputs: &[ChunkOutput], inputs: &[PathBuf], target: &Path) -> Result<()> {
        let mixed = outputs.windows(2).any(|w| w[0].codec != w[1].codec);
        if !mixed {
            return self.muxer.concat(inputs, target);
        }

        let mut codecs: Vec<&str> = outputs.iter().map(|o| o.codec.as_str()).collect();
        codecs.dedup();
        warn!(?codecs, codec = %self.encoding.codec, "Chunks use different encoders, re-encoding the join");
        self.muxer.concat_reencode(inputs, target, &self.encoding)
    }

    /// Merge `outputs` into `output`
    ///
    /// `outputs` must match the plan chunk for chunk. When the source has
    /// audio it is carried over from `input`. The merged file must hold
    /// exactly `total_frames` frames.
    pub fn stitch(
        &self,
        plan: &ChunkPlan,
        outputs: &[ChunkOutput],
        input: &Path,
        info: &VideoInfo,
        output: &Path,
    ) -> Result<StitchReport> {
        verify_outputs(plan, outputs)?;

        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let inputs: Vec<PathBuf> = outputs.iter().map(|o| o.path.clone()).collect();
        let expected_duration = plan.total_frames as f64 / plan.fps;
        if info.has_audio {
            let video_only = video_only_path(output);
            self.join(outputs, &inputs, &video_only)?;
            let remuxed = self.muxer.remux_with_audio(&video_only, input, expected_duration, output);
            if let Err(e) = std::fs::remove_file(&video_only) {
                debug!(path = %video_only.display(), error = %e, "Could not remove intermediate video");
            }
            remuxed?;
        } else {
            self.join(outputs, &inputs, output)?;
        }

        let summary = self.muxer.inspect(output)?;
        let drift_ms = (summary.video_duration - expected_duration).abs() * 1000.0;

        let problem = if summary.video_frames != plan.total_frames {
            Some(format!(
                "expected {} frames, found {}",
                plan.total_frames, summary.video_frames
            ))
        } else if drift_ms > self.config.duration_tolerance_ms {
            Some(format!(
                "duration {:.3}s differs from {:.3}s by {:.2}ms",
                summary.video_duration, expected_duration, drift_ms
            ))
        } else if info.has_audio && !summary.has_audio {
            Some("audio track missing from output".to_string())
        } else if let Some(skew_ms) = audio_skew_ms(&summary).filter(|&ms| ms > self.config.duration_tolerance_ms) {
            Some(format!(
                "audio is {:.2}ms off the {:.3}s video",
                skew_ms, summary.video_duration
            ))
        } else {
            None
        };

        if let Some(reason) = problem {
            warn!(output = %output.display(), %reason, "Stitched output failed verification");
            let _ = std::fs::remove_file(output);
            return Err(StitchError::VerificationFailed { reason }.into());
        }

        if !self.config.keep_chunks {
            for path in &inputs {
                if let Err(e) = std::fs::remove_file(path) {
                    warn!(path = %path.display(), error = %e, "Could not remove chunk output");
                }
            }
        }

        info!(
            output = %output.display(),
            chunks = outputs.len(),
            frames = summary.video_frames,
            "Stitched output verified"
        );

        Ok(StitchReport {
            output: output.to_path_buf(),
            chunks: outputs.len(),
            frames: summary.video_frames,
            duration: summary.video_duration,
            has_audio: summary.has_audio,
        })
    }
}

/// Outputs must line up with the plan one to one, all present on disk
fn verify_outputs(plan: &ChunkPlan, outputs: &[ChunkOutput]) -> Result<()> {
    let incomplete = |reason: String| StitchError::IncompleteChunks { reason };

    if outputs.len() != plan.len() {
        return Err(incomplete(format!("{} outputs for {} chunks", outputs.len(), plan.len())).into());
    }

    for (chunk, output) in plan.chunks.iter().zip(outputs) {
        if output.index != chunk.index
            || output.start_frame != chunk.start_frame
            || output.end_frame != chunk.end_frame
        {
            return Err(incomplete(format!(
                "chunk {} covers {}..{}, output {} covers {}..{}",
                chunk.index,
                chunk.start_frame,
                chunk.end_frame,
                output.index,
                output.start_frame,
                output.end_frame
            ))
            .into());
        }
        if output.frames_written != chunk.len() {
            return Err(incomplete(format!(
                "chunk {} has {} of {} frames",
                chunk.index,
                output.frames_written,
                chunk.len()
            ))
            .into());
        }
        if !output.path.exists() {
            return Err(incomplete(format!(
                "chunk {} output {} is missing",
                chunk.index,
                output.path.display()
            ))
            .into());
        }
    }

    Ok(())
}

fn audio_skew_ms(summary: &MediaSummary) -> Option<f64> {
    summary
        .audio_duration
        .map(|audio| (audio - summary.video_duration).abs() * 1000.0)
}

fn video_only_path(output: &Path) -> PathBuf {
    let ext = output
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_else(|| "mp4".to_string());
    output.with_extension(format!("video.{}", ext))
}
