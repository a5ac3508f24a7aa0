use rayon::prelude::*;

use crate::{
    error::Result,
    styles::traits::StyleMetadata,
    styles::{Style, StyleConfig},
    video::types::Frame,
};

pub const EDGE_STRENGTH: &str = "edge_strength";

/// Graphite-sketch look: luminance with gradient edges drawn dark on paper
pub struct PencilStyle;

impl PencilStyle {
    pub fn new() -> Self {
        Self
    }

    fn luminance(frame: &Frame) -> Vec<f32> {
        frame
            .as_bytes()
            .chunks_exact(3)
            .map(|p| 0.299 * p[0] as f32 + 0.587 * p[1] as f32 + 0.114 * p[2] as f32)
            .collect()
    }
}

impl Default for PencilStyle {
    fn default() -> Self {
        Self::new()
    }
}

impl Style for PencilStyle {
    fn name(&self) -> &str {
        "pencil"
    }

    fn description(&self) -> &str {
        "Pencil sketch with dark gradient strokes over a light paper tone"
    }

    fn apply_effect(&self, frame: &mut Frame, config: &StyleConfig) -> Result<()> {
        let width = frame.width() as usize;
        let height = frame.height() as usize;
        let strength = config.get_f32_or(EDGE_STRENGTH, 2.0);
        let intensity = config.intensity;
        let luma = Self::luminance(frame);

        frame
            .as_bytes_mut()
            .par_chunks_mut(width * 3)
            .enumerate()
            .for_each(|(y, row)| {
                for x in 0..width {
                    let l = luma[y * width + x];
                    let right = luma[y * width + (x + 1).min(width - 1)];
                    let below = luma[(y + 1).min(height - 1) * width + x];
                    let gradient = (right - l).abs() + (below - l).abs();

                    // Paper tone lifted towards white, strokes where the gradient is strong
                    let paper = 255.0 - (255.0 - l) * 0.35;
                    let sketch = (paper - gradient * strength).clamp(0.0, 255.0);

                    for c in 0..3 {
                        let original = row[x * 3 + c] as f32;
                        row[x * 3 + c] = (original + (sketch - original) * intensity).round() as u8;
                    }
                }
            });

        Ok(())
    }

    fn metadata(&self) -> StyleMetadata {
        StyleMetadata {
            performance_impact: 0.3,
            flicker_prone: true,
            optional_parameters: vec![(
                EDGE_STRENGTH.to_string(),
                "Darkness multiplier for gradient strokes".to_string(),
            )],
        }
    }
}
