use rayon::prelude::*;

use crate::{
    error::{Result, StyleError},
    styles::traits::StyleMetadata,
    styles::{Style, StyleConfig},
    video::types::Frame,
};

pub const LEVELS: &str = "levels";

/// Flat-shaded cartoon look via per-channel color quantization
pub struct CartoonStyle;

impl CartoonStyle {
    pub fn new() -> Self {
        Self
    }

    fn levels(config: &StyleConfig) -> i32 {
        config.get_i32(LEVELS).unwrap_or(6)
    }
}

impl Default for CartoonStyle {
    fn default() -> Self {
        Self::new()
    }
}

impl Style for CartoonStyle {
    fn name(&self) -> &str {
        "cartoon"
    }

    fn description(&self) -> &str {
        "Posterized flat colors in a limited palette"
    }

    fn apply_effect(&self, frame: &mut Frame, config: &StyleConfig) -> Result<()> {
        let levels = Self::levels(config);
        if levels < 2 {
            return Err(StyleError::EffectFailed {
                effect: "cartoon".to_string(),
                reason: format!("need at least 2 levels, got {}", levels),
            }
            .into());
        }

        let step = 255.0 / (levels - 1) as f32;
        let intensity = config.intensity;

        frame.as_bytes_mut().par_iter_mut().for_each(|value| {
            let v = *value as f32;
            let quantized = (v / step).round() * step;
            *value = (v + (quantized - v) * intensity).round().clamp(0.0, 255.0) as u8;
        });

        Ok(())
    }

    fn validate_config(&self, config: &StyleConfig) -> Result<()> {
        let levels = Self::levels(config);
        if !(2..=64).contains(&levels) {
            return Err(StyleError::InvalidConfig {
                details: format!("cartoon.levels must be within 2..=64, got {}", levels),
            }
            .into());
        }
        Ok(())
    }

    fn metadata(&self) -> StyleMetadata {
        StyleMetadata {
            performance_impact: 0.1,
            flicker_prone: true,
            optional_parameters: vec![(LEVELS.to_string(), "Palette steps per channel (2-64)".to_string())],
        }
    }
}
