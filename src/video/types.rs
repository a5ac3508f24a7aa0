use image::{ImageBuffer, Rgb, RgbImage};
use serde::{Deserialize, Serialize};

/// Represents a single video frame
///
/// This is a simple wrapper around an RGB image buffer that provides
/// convenient methods for pixel manipulation used by styles.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    buffer: RgbImage,
}

impl Frame {
    /// Create a new frame from an RGB image buffer
    pub fn new(buffer: RgbImage) -> Self {
        Self { buffer }
    }

    /// Create a new frame with the given dimensions filled with black
    pub fn new_black(width: u32, height: u32) -> Self {
        let buffer = ImageBuffer::new(width, height);
        Self { buffer }
    }

    /// Create a new frame with the given dimensions filled with the specified color
    pub fn new_filled(width: u32, height: u32, color: [u8; 3]) -> Self {
        let buffer = ImageBuffer::from_fn(width, height, |_, _| Rgb(color));
        Self { buffer }
    }

    pub fn width(&self) -> u32 {
        self.buffer.width()
    }

    pub fn height(&self) -> u32 {
        self.buffer.height()
    }

    /// Get a pixel at the given coordinates (returns RGB array)
    pub fn get_pixel(&self, x: u32, y: u32) -> [u8; 3] {
        let pixel = self.buffer.get_pixel(x, y);
        [pixel[0], pixel[1], pixel[2]]
    }

    /// Set a pixel at the given coordinates
    pub fn set_pixel(&mut self, x: u32, y: u32, color: [u8; 3]) {
        self.buffer.put_pixel(x, y, Rgb(color));
    }

    /// Raw interleaved RGB bytes, row-major
    pub fn as_bytes(&self) -> &[u8] {
        self.buffer.as_raw()
    }

    /// Mutable raw interleaved RGB bytes, row-major
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    /// Number of bytes one frame of this size occupies
    pub fn byte_len(width: u32, height: u32) -> usize {
        width as usize * height as usize * 3
    }

    /// Create a frame from raw RGB bytes
    pub fn from_rgb_bytes(width: u32, height: u32, data: Vec<u8>) -> Option<Self> {
        ImageBuffer::from_raw(width, height, data).map(|buffer| Self { buffer })
    }
}

/// Color metadata carried from the source to every encoded chunk
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColorInfo {
    pub space: Option<String>,
    pub transfer: Option<String>,
    pub primaries: Option<String>,
    /// "tv" (limited) or "pc" (full)
    pub range: Option<String>,
}

/// Probed properties of the input video
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoInfo {
    pub total_frames: u64,
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    /// Duration in seconds
    pub duration: f64,
    pub codec: String,
    pub color: ColorInfo,
    pub has_audio: bool,
}

/// A frame travelling between pipeline stages
///
/// Slots are moved through the stage queues; whoever holds one owns the frame.
#[derive(Debug)]
pub struct QueueSlot {
    pub frame: Frame,
    pub index: u64,
    /// Presentation timestamp in seconds
    pub pts: f64,
    pub chunk_index: usize,
    /// Replayed only to warm the stabilizer; never encoded
    pub warmup: bool,
}

/// Encoder settings for chunk outputs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodingConfig {
    /// Primary video codec (e.g. "h264_nvenc", "libx264")
    pub codec: String,

    /// Software codec used when the primary encoder fails
    pub fallback_codec: String,

    /// Constant quality value (CRF for x264, CQ for NVENC)
    pub crf: u8,

    /// Encoder speed preset
    pub preset: String,

    /// Output pixel format
    pub pixel_format: String,

    /// Container extension for chunk files
    pub container: String,
}

impl Default for EncodingConfig {
    fn default() -> Self {
        Self {
            codec: "h264_nvenc".to_string(),
            fallback_codec: "libx264".to_string(),
            crf: 18,
            preset: "p4".to_string(),
            pixel_format: "yuv420p".to_string(),
            container: "mp4".to_string(),
        }
    }
}

impl EncodingConfig {
    /// The software-encoder variant of this configuration
    pub fn fallback(&self) -> Self {
        Self {
            codec: self.fallback_codec.clone(),
            preset: "medium".to_string(),
            ..self.clone()
        }
    }
}
