use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{error::Result, video::types::Frame};

/// Core trait that all styles must implement
///
/// A style is a pure frame-in/frame-out transform. It knows nothing about
/// chunks, queues or checkpoints; the pipeline calls it once per frame, in order.
pub trait Style: Send + Sync {
    /// Returns the unique name of this style
    fn name(&self) -> &str;

    /// Returns a human-readable description of this style
    fn description(&self) -> &str;

    /// Apply the style to a video frame
    ///
    /// # Arguments
    ///
    /// * `frame` - The video frame to modify in-place
    /// * `config` - Style-specific configuration parameters
    ///
    /// An error leaves the pipeline free to forward the unstyled frame instead.
    fn apply_effect(&self, frame: &mut Frame, config: &StyleConfig) -> Result<()>;

    /// Validate that the given configuration is valid for this style
    ///
    /// Called once when a job starts, before any frame is decoded.
    fn validate_config(&self, config: &StyleConfig) -> Result<()> {
        let _ = config;
        Ok(())
    }

    /// Get style-specific metadata or capabilities
    fn metadata(&self) -> StyleMetadata {
        StyleMetadata::default()
    }
}

/// Configuration for style effects
///
/// Parameters are kept in a sorted map so the serialized form is stable; it
/// feeds the job's configuration fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StyleConfig {
    /// Intensity of the effect (0.0 = none, 1.0 = full intensity)
    pub intensity: f32,

    /// Style-specific parameters
    #[serde(default)]
    pub parameters: BTreeMap<String, ConfigValue>,
}

impl Default for StyleConfig {
    fn default() -> Self {
        Self {
            intensity: 1.0,
            parameters: BTreeMap::new(),
        }
    }
}

impl StyleConfig {
    /// Create a new config with the given intensity
    pub fn with_intensity(intensity: f32) -> Self {
        Self {
            intensity: intensity.clamp(0.0, 1.0),
            parameters: BTreeMap::new(),
        }
    }

    /// Set a parameter value
    pub fn set<K: Into<String>, V: Into<ConfigValue>>(mut self, key: K, value: V) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn get_f32(&self, key: &str) -> Option<f32> {
        self.parameters.get(key).and_then(|v| v.as_f32())
    }

    pub fn get_i32(&self, key: &str) -> Option<i32> {
        self.parameters.get(key).and_then(|v| v.as_i32())
    }

    /// Get a parameter value with a default
    pub fn get_f32_or(&self, key: &str, default: f32) -> f32 {
        self.get_f32(key).unwrap_or(default)
    }
}

/// Flexible configuration value that can hold different types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Integer(i32),
    Float(f32),
    Bool(bool),
    String(String),
}

impl ConfigValue {
    pub fn as_f32(&self) -> Option<f32> {
        match self {
            ConfigValue::Float(f) => Some(*f),
            ConfigValue::Integer(i) => Some(*i as f32),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            ConfigValue::Integer(i) => Some(*i),
            ConfigValue::Float(f) => Some(*f as i32),
            _ => None,
        }
    }
}

impl From<f32> for ConfigValue {
    fn from(value: f32) -> Self {
        ConfigValue::Float(value)
    }
}

impl From<i32> for ConfigValue {
    fn from(value: i32) -> Self {
        ConfigValue::Integer(value)
    }
}

impl From<bool> for ConfigValue {
    fn from(value: bool) -> Self {
        ConfigValue::Bool(value)
    }
}

impl From<&str> for ConfigValue {
    fn from(value: &str) -> Self {
        ConfigValue::String(value.to_string())
    }
}

/// Metadata about a style's capabilities and characteristics
#[derive(Debug, Clone, Default)]
pub struct StyleMetadata {
    /// Estimated per-frame cost (0.0 = minimal, 1.0 = heavy)
    pub performance_impact: f32,

    /// Output flickers between near-identical frames without temporal smoothing
    pub flicker_prone: bool,

    /// List of optional parameters with descriptions
    pub optional_parameters: Vec<(String, String)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_accessors() {
        let config = StyleConfig::with_intensity(2.0).set("levels", 6).set("strength", 0.5f32);

        assert_eq!(config.intensity, 1.0);
        assert_eq!(config.get_i32("levels"), Some(6));
        assert_eq!(config.get_f32("levels"), Some(6.0));
        assert_eq!(config.get_f32_or("missing", 0.25), 0.25);
    }

    #[test]
    fn test_parameters_serialize_in_key_order() {
        let a = StyleConfig::default().set("b", 1).set("a", 2);
        let b = StyleConfig::default().set("a", 2).set("b", 1);
        assert_eq!(toml::to_string(&a).unwrap(), toml::to_string(&b).unwrap());
    }
}
