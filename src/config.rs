use std::{collections::BTreeMap, path::{Path, PathBuf}};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    error::{ConfigError, PipelineError, Result},
    styles::StyleConfig,
    video::{EncodingConfig, VideoInfo},
};

/// Main configuration for a stylization job
///
/// Passed by value into [`JobRunner`](crate::pipeline::JobRunner); nothing in
/// the library reads configuration from globals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Chunking, queueing and retry settings
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Chunk encoder settings
    #[serde(default)]
    pub encoding: EncodingConfig,

    /// Temporal smoothing settings
    #[serde(default)]
    pub stabilizer: StabilizerConfig,

    /// Final merge settings
    #[serde(default)]
    pub stitch: StitchConfig,

    /// Per-style configuration, keyed by style name
    #[serde(default)]
    pub style: BTreeMap<String, StyleConfig>,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|_| ConfigError::FileNotFound { path: path.display().to_string() })?;

        let config: Config = toml::from_str(&content)
            .map_err(|_| ConfigError::ParseFailed { path: path.display().to_string() })?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| ConfigError::InvalidValue {
            key: "config".to_string(),
            value: e.to_string(),
        })?;

        std::fs::write(path, content)?;
        Ok(())
    }

    /// Names accepted by [`Config::preset`]
    pub fn preset_names() -> &'static [&'static str] {
        &["speed", "balanced", "quality"]
    }

    /// Build one of the named processing presets
    ///
    /// Presets trade encode speed against quality and temporal stability.
    pub fn preset(name: &str) -> Result<Self> {
        let mut config = Config::default();
        match name.to_ascii_lowercase().as_str() {
            "speed" => {
                config.encoding.crf = 23;
                config.encoding.preset = "p1".to_string();
                config.pipeline.chunk_duration_secs = 60.0;
                config.stabilizer.enabled = false;
            }
            "balanced" => {
                config.encoding.crf = 18;
                config.encoding.preset = "p4".to_string();
                config.pipeline.chunk_duration_secs = 30.0;
                config.stabilizer.enabled = true;
            }
            "quality" => {
                config.encoding.crf = 15;
                config.encoding.preset = "p7".to_string();
                config.pipeline.chunk_duration_secs = 20.0;
                config.stabilizer.enabled = true;
            }
            _ => return Err(ConfigError::UnknownPreset { name: name.to_string() }.into()),
        }
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.pipeline.validate()?;
        self.stabilizer.validate()?;
        self.stitch.validate()?;

        if self.encoding.codec.is_empty() {
            return Err(invalid("encoding.codec", "<empty>"));
        }
        if self.encoding.crf > 51 {
            return Err(invalid("encoding.crf", self.encoding.crf));
        }

        for (name, style) in &self.style {
            if !(0.0..=1.0).contains(&style.intensity) {
                return Err(invalid(&format!("style.{}.intensity", name), style.intensity));
            }
        }

        Ok(())
    }

    /// Hash of everything that changes the bytes of a chunk output
    ///
    /// A checkpoint written under one fingerprint is never reused under
    /// another. Queue sizes, retries and paths are not part of it.
    pub fn fingerprint(&self, styles: &[String], info: &VideoInfo) -> Result<String> {
        let style_params: BTreeMap<&String, &StyleConfig> =
            self.style.iter().filter(|(name, _)| styles.contains(*name)).collect();

        let canonical = serde_json::json!({
            "chunk_duration_secs": self.pipeline.chunk_duration_secs,
            "encoding": self.encoding,
            "stabilizer": self.stabilizer,
            "styles": styles,
            "style_params": style_params,
            "input": info,
        });
        let bytes = serde_json::to_vec(&canonical)
            .map_err(|e| PipelineError::generic(format!("fingerprint serialization: {}", e)))?;

        Ok(hex::encode(Sha256::digest(&bytes)))
    }
}

fn invalid(key: &str, value: impl ToString) -> PipelineError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
    .into()
}

/// Chunking, queueing and failure-handling configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Target chunk length in seconds; boundaries snap to keyframes
    pub chunk_duration_secs: f64,

    /// Capacity of each inter-stage queue
    pub queue_capacity: usize,

    /// Sink flush and progress cadence, in frames
    pub flush_interval_frames: u64,

    /// Extra attempts for a chunk after a decode error or timeout
    pub decode_retries: u32,

    /// Wall-clock budget per chunk attempt; 0 disables the limit
    pub chunk_timeout_secs: u64,

    /// Where chunk outputs are written before stitching
    pub work_dir: PathBuf,

    /// Where checkpoint records and lock files live
    pub checkpoint_dir: PathBuf,

    /// Jobs the queue runs side by side
    pub max_concurrent_jobs: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunk_duration_secs: 30.0,
            queue_capacity: default_queue_capacity(),
            flush_interval_frames: 30,
            decode_retries: 2,
            chunk_timeout_secs: 600,
            work_dir: PathBuf::from("chunks"),
            checkpoint_dir: PathBuf::from(".checkpoints"),
            max_concurrent_jobs: 1,
        }
    }
}

/// Twice the CPU count, kept within [2, 64]
pub fn default_queue_capacity() -> usize {
    (2 * num_cpus::get()).clamp(2, 64)
}

impl PipelineConfig {
    fn validate(&self) -> Result<()> {
        if !self.chunk_duration_secs.is_finite() || self.chunk_duration_secs <= 0.0 {
            return Err(invalid("pipeline.chunk_duration_secs", self.chunk_duration_secs));
        }
        if self.queue_capacity == 0 {
            return Err(invalid("pipeline.queue_capacity", self.queue_capacity));
        }
        if self.flush_interval_frames == 0 {
            return Err(invalid("pipeline.flush_interval_frames", self.flush_interval_frames));
        }
        if self.max_concurrent_jobs == 0 {
            return Err(invalid("pipeline.max_concurrent_jobs", self.max_concurrent_jobs));
        }
        Ok(())
    }
}

/// Temporal stabilization (EMA) configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilizerConfig {
    pub enabled: bool,

    /// Weight of the newest frame, in (0, 1]
    pub alpha: f32,

    /// Frames replayed before a resumed chunk; defaults to ceil(1 / alpha)
    pub warmup_frames: Option<u64>,
}

impl Default for StabilizerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            alpha: 0.3,
            warmup_frames: None,
        }
    }
}

impl StabilizerConfig {
    /// Effective warm-up window length
    pub fn warmup(&self) -> u64 {
        self.warmup_frames
            .unwrap_or_else(|| (1.0 / self.alpha as f64).ceil() as u64)
    }

    /// Worst-case per-channel difference between a resumed run and an
    /// uninterrupted one at the first frame after the warm-up window
    pub fn seam_bound(&self) -> f32 {
        (1.0 - self.alpha).powi(self.warmup() as i32) * 255.0
    }

    fn validate(&self) -> Result<()> {
        if !(self.alpha > 0.0 && self.alpha <= 1.0) {
            return Err(invalid("stabilizer.alpha", self.alpha));
        }
        Ok(())
    }
}

/// Chunk merge configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StitchConfig {
    /// Allowed gap between stitched duration and total_frames / fps
    pub duration_tolerance_ms: f64,

    /// Leave chunk files in the work directory after a successful stitch
    pub keep_chunks: bool,
}

impl Default for StitchConfig {
    fn default() -> Self {
        Self {
            duration_tolerance_ms: 1.0,
            keep_chunks: false,
        }
    }
}

impl StitchConfig {
    fn validate(&self) -> Result<()> {
        if !self.duration_tolerance_ms.is_finite() || self.duration_tolerance_ms < 0.0 {
            return Err(invalid("stitch.duration_tolerance_ms", self.duration_tolerance_ms));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::ColorInfo;
    use tempfile::tempdir;

    fn sample_info() -> VideoInfo {
        VideoInfo {
            total_frames: 1000,
            fps: 25.0,
            width: 64,
            height: 36,
            duration: 40.0,
            codec: "h264".to_string(),
            color: ColorInfo::default(),
            has_audio: true,
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert!((2..=64).contains(&config.pipeline.queue_capacity));
    }

    #[test]
    fn test_config_roundtrip() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("test_config.toml");

        let mut original = Config::preset("quality").unwrap();
        original
            .style
            .insert("cartoon".to_string(), StyleConfig::default().set("levels", 4));

        original.save_to_file(&file_path).unwrap();
        let loaded = Config::from_file(&file_path).unwrap();

        assert_eq!(original, loaded);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("partial.toml");
        std::fs::write(&file_path, "[pipeline]\nchunk_duration_secs = 12.5\n").unwrap();

        let config = Config::from_file(&file_path).unwrap();
        assert_eq!(config.pipeline.chunk_duration_secs, 12.5);
        assert_eq!(config.encoding, EncodingConfig::default());
    }

    #[test]
    fn test_presets() {
        let speed = Config::preset("Speed").unwrap();
        assert_eq!(speed.encoding.crf, 23);
        assert!(!speed.stabilizer.enabled);

        let quality = Config::preset("quality").unwrap();
        assert_eq!(quality.pipeline.chunk_duration_secs, 20.0);
        assert_eq!(quality.encoding.preset, "p7");

        assert!(Config::preset("ultra").is_err());
        for name in Config::preset_names() {
            assert!(Config::preset(name).unwrap().validate().is_ok());
        }
    }

    #[test]
    fn test_invalid_values() {
        let mut config = Config::default();
        config.pipeline.chunk_duration_secs = 0.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.stabilizer.alpha = 0.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.style.insert("pencil".to_string(), StyleConfig { intensity: 3.0, ..Default::default() });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_warmup_and_seam_bound() {
        let stabilizer = StabilizerConfig::default();
        assert_eq!(stabilizer.warmup(), 4);
        let expected = 0.7f32.powi(4) * 255.0;
        assert!((stabilizer.seam_bound() - expected).abs() < 1e-3);

        let longer = StabilizerConfig { warmup_frames: Some(20), ..stabilizer };
        assert!(longer.seam_bound() < 0.3);
    }

    #[test]
    fn test_fingerprint_tracks_output_affecting_fields() {
        let config = Config::default();
        let styles = vec!["pencil".to_string()];
        let info = sample_info();
        let base = config.fingerprint(&styles, &info).unwrap();

        assert_eq!(base, config.fingerprint(&styles, &info).unwrap());
        assert_eq!(base.len(), 64);

        let mut tweaked = config.clone();
        tweaked.pipeline.queue_capacity += 1;
        tweaked.pipeline.decode_retries = 7;
        assert_eq!(base, tweaked.fingerprint(&styles, &info).unwrap());

        let mut tweaked = config.clone();
        tweaked.encoding.crf = 30;
        assert_ne!(base, tweaked.fingerprint(&styles, &info).unwrap());

        let other_styles = vec!["pencil".to_string(), "cartoon".to_string()];
        assert_ne!(base, config.fingerprint(&other_styles, &info).unwrap());

        let mut other_info = sample_info();
        other_info.total_frames = 999;
        assert_ne!(base, config.fingerprint(&styles, &other_info).unwrap());

        let mut tweaked = config.clone();
        tweaked.style.insert("pencil".to_string(), StyleConfig::with_intensity(0.5));
        assert_ne!(base, tweaked.fingerprint(&styles, &info).unwrap());

        // Parameters for styles the job does not use are ignored
        let mut tweaked = config;
        tweaked.style.insert("cinematic".to_string(), StyleConfig::with_intensity(0.5));
        assert_eq!(base, tweaked.fingerprint(&styles, &info).unwrap());
    }
}
