use std::collections::{BTreeMap, HashMap};

use crate::{
    error::{Result, StyleError},
    styles::{CartoonStyle, CinematicStyle, PencilStyle, Style, StyleChain, StyleConfig},
};

type StyleFactory = Box<dyn Fn() -> Box<dyn Style> + Send + Sync>;

/// Registry for managing available styles
///
/// The registry provides a central place to discover and instantiate styles.
/// Styles are registered by name and can be retrieved for use in a job.
pub struct StyleRegistry {
    styles: HashMap<String, StyleFactory>,
}

impl StyleRegistry {
    /// Create a new style registry with all built-in styles
    pub fn new() -> Self {
        let mut registry = Self {
            styles: HashMap::new(),
        };

        registry.register_builtin_styles();
        registry
    }

    fn register_builtin_styles(&mut self) {
        self.register("pencil".to_string(), || Box::new(PencilStyle::new()));
        self.register("cartoon".to_string(), || Box::new(CartoonStyle::new()));
        self.register("cinematic".to_string(), || Box::new(CinematicStyle::new()));
    }

    /// Register a custom style
    ///
    /// # Arguments
    ///
    /// * `name` - Unique name for the style
    /// * `factory` - Function that creates new instances of the style
    pub fn register<F>(&mut self, name: String, factory: F)
    where
        F: Fn() -> Box<dyn Style> + Send + Sync + 'static,
    {
        self.styles.insert(name, Box::new(factory));
    }

    /// Get a style by name
    ///
    /// Returns a new instance of the requested style, or None if the style
    /// is not registered.
    pub fn get_style(&self, name: &str) -> Option<Box<dyn Style>> {
        self.styles.get(name).map(|factory| factory())
    }

    /// Get all available style names, sorted
    pub fn available_styles(&self) -> Vec<String> {
        let mut names: Vec<String> = self.styles.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has_style(&self, name: &str) -> bool {
        self.styles.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.styles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.styles.is_empty()
    }

    /// Build the ordered chain for a job
    ///
    /// Each style gets its entry from `configs` or the default config, and the
    /// config is validated up front so bad parameters fail before decoding.
    pub fn chain(&self, names: &[String], configs: &BTreeMap<String, StyleConfig>) -> Result<StyleChain> {
        let mut chain = StyleChain::new();
        for name in names {
            let style = self
                .get_style(name)
                .ok_or_else(|| StyleError::NotFound { name: name.clone() })?;
            let config = configs.get(name).cloned().unwrap_or_default();
            style.validate_config(&config)?;
            chain.push(style, config);
        }
        Ok(chain)
    }
}

impl Default for StyleRegistry {
    fn default() -> Self {
        Self::new()
    }
}
