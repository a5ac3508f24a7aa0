use tracing::debug;

use crate::{config::StabilizerConfig, video::types::Frame};

/// Exponential moving average over frames, to damp per-frame style flicker
///
/// `state = alpha * raw + (1 - alpha) * state`, per channel value. The first
/// frame (and the first after a resolution change) seeds the state and is
/// returned as is. Cloning gives a snapshot that a retried chunk restores.
#[derive(Debug, Clone)]
pub struct FrameStabilizer {
    enabled: bool,
    alpha: f32,
    state: Option<Vec<f32>>,
    resolution: Option<(u32, u32)>,
    map_state: Option<Vec<f32>>,
    last_seen: Option<u64>,
}

impl FrameStabilizer {
    pub fn new(alpha: f32) -> Self {
        Self {
            enabled: true,
            alpha: alpha.clamp(f32::EPSILON, 1.0),
            state: None,
            resolution: None,
            map_state: None,
            last_seen: None,
        }
    }

    pub fn from_config(config: &StabilizerConfig) -> Self {
        Self {
            enabled: config.enabled,
            ..Self::new(config.alpha)
        }
    }

    /// Pass frames through untouched; no warm-up is ever needed
    pub fn disabled(self) -> Self {
        Self { enabled: false, ..self }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn alpha(&self) -> f32 {
        self.alpha
    }

    /// Index of the last frame fed through [`update`](Self::update)
    pub fn last_seen_frame_index(&self) -> Option<u64> {
        self.last_seen
    }

    /// Whether a chunk starting at `chunk_start` needs warm-up frames first
    ///
    /// True unless the stabilizer just saw the frame before the chunk.
    pub fn needs_warmup(&self, chunk_start: u64) -> bool {
        self.enabled && chunk_start > 0 && self.last_seen != Some(chunk_start - 1)
    }

    /// Blend `frame` into the running average and return the smoothed frame
    pub fn update(&mut self, frame: Frame, index: u64) -> Frame {
        self.last_seen = Some(index);
        if !self.enabled {
            return frame;
        }

        let resolution = (frame.width(), frame.height());
        if self.resolution != Some(resolution) || self.state.is_none() {
            if self.resolution.is_some() {
                debug!(frame = index, ?resolution, "Resolution changed, reseeding stabilizer");
            }
            self.resolution = Some(resolution);
            self.state = Some(frame.as_bytes().iter().map(|&v| v as f32).collect());
            return frame;
        }
        let Some(state) = self.state.as_mut() else {
            return frame;
        };

        let alpha = self.alpha;
        let mut out = frame;
        for (acc, value) in state.iter_mut().zip(out.as_bytes_mut().iter_mut()) {
            *acc = alpha * (*value as f32) + (1.0 - alpha) * *acc;
            *value = acc.round().clamp(0.0, 255.0) as u8;
        }
        out
    }

    /// Record a frame that bypassed smoothing (its style failed)
    pub fn mark_skipped(&mut self, index: u64) {
        self.last_seen = Some(index);
    }

    /// Same smoothing for a single-channel signal such as an edge map
    ///
    /// Tracked separately from the frame state; a length change reseeds it.
    pub fn update_map(&mut self, values: &[f32]) -> Vec<f32> {
        if !self.enabled {
            return values.to_vec();
        }

        let alpha = self.alpha;
        if let Some(state) = self.map_state.as_mut().filter(|s| s.len() == values.len()) {
            for (acc, &v) in state.iter_mut().zip(values) {
                *acc = alpha * v + (1.0 - alpha) * *acc;
            }
            return state.clone();
        }

        self.map_state = Some(values.to_vec());
        values.to_vec()
    }

    pub fn reset(&mut self) {
        self.state = None;
        self.resolution = None;
        self.map_state = None;
        self.last_seen = None;
    }
}
