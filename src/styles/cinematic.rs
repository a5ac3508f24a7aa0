use rayon::prelude::*;

use crate::{
    error::Result,
    styles::traits::StyleMetadata,
    styles::{Style, StyleConfig},
    video::types::Frame,
};

pub const CONTRAST: &str = "contrast";
pub const SPLIT_TONE: &str = "split_tone";

/// Film-grade look: S-curve contrast with teal shadows and warm highlights
pub struct CinematicStyle;

impl CinematicStyle {
    pub fn new() -> Self {
        Self
    }

    fn s_curve(v: f32, contrast: f32) -> f32 {
        let x = v / 255.0;
        let curved = x + contrast * (x - 0.5) * (1.0 - (2.0 * x - 1.0).abs());
        curved.clamp(0.0, 1.0) * 255.0
    }
}

impl Default for CinematicStyle {
    fn default() -> Self {
        Self::new()
    }
}

impl Style for CinematicStyle {
    fn name(&self) -> &str {
        "cinematic"
    }

    fn description(&self) -> &str {
        "Contrast curve with teal-and-orange split toning"
    }

    fn apply_effect(&self, frame: &mut Frame, config: &StyleConfig) -> Result<()> {
        let contrast = config.get_f32_or(CONTRAST, 0.6);
        let tone = config.get_f32_or(SPLIT_TONE, 12.0);
        let intensity = config.intensity;

        frame.as_bytes_mut().par_chunks_mut(3).for_each(|pixel| {
            let luma = 0.299 * pixel[0] as f32 + 0.587 * pixel[1] as f32 + 0.114 * pixel[2] as f32;
            // -1 in deep shadows, +1 in bright highlights
            let balance = (luma / 127.5) - 1.0;
            let shift = [balance * tone, balance * tone * 0.2, -balance * tone];

            for c in 0..3 {
                let original = pixel[c] as f32;
                let graded = (Self::s_curve(original, contrast) + shift[c]).clamp(0.0, 255.0);
                pixel[c] = (original + (graded - original) * intensity).round() as u8;
            }
        });

        Ok(())
    }

    fn metadata(&self) -> StyleMetadata {
        StyleMetadata {
            performance_impact: 0.2,
            flicker_prone: false,
            optional_parameters: vec![
                (CONTRAST.to_string(), "S-curve strength (0.0-1.0)".to_string()),
                (SPLIT_TONE.to_string(), "Shadow/highlight tint in 8-bit levels".to_string()),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contrast_spreads_midtones() {
        let config = StyleConfig::default().set(SPLIT_TONE, 0.0f32);
        let style = CinematicStyle::new();

        let mut dark = Frame::new_filled(2, 2, [70, 70, 70]);
        let mut bright = Frame::new_filled(2, 2, [185, 185, 185]);
        style.apply_effect(&mut dark, &config).unwrap();
        style.apply_effect(&mut bright, &config).unwrap();

        assert!(dark.get_pixel(0, 0)[0] < 70);
        assert!(bright.get_pixel(0, 0)[0] > 185);
    }

    #[test]
    fn test_highlights_warm_shadows_cool() {
        let config = StyleConfig::default().set(CONTRAST, 0.0f32);
        let style = CinematicStyle::new();

        let mut highlight = Frame::new_filled(1, 1, [230, 230, 230]);
        style.apply_effect(&mut highlight, &config).unwrap();
        let [r, _, b] = highlight.get_pixel(0, 0);
        assert!(r > b);

        let mut shadow = Frame::new_filled(1, 1, [30, 30, 30]);
        style.apply_effect(&mut shadow, &config).unwrap();
        let [r, _, b] = shadow.get_pixel(0, 0);
        assert!(b > r);
    }
}
