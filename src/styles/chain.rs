use crate::{
    error::Result,
    styles::{Style, StyleConfig},
    video::types::Frame,
};

/// Ordered list of styles applied to each frame, each with its own config
///
/// Built once per job by [`StyleRegistry::chain`](crate::styles::StyleRegistry::chain)
/// and moved into the stylize stage.
pub struct StyleChain {
    stages: Vec<(Box<dyn Style>, StyleConfig)>,
}

impl StyleChain {
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    pub fn push(&mut self, style: Box<dyn Style>, config: StyleConfig) {
        self.stages.push((style, config));
    }

    /// Run every style over a copy of `frame`
    ///
    /// The input is left untouched so the caller can fall back to it when
    /// any style in the chain fails.
    pub fn apply(&self, frame: &Frame) -> Result<Frame> {
        let mut styled = frame.clone();
        for (style, config) in &self.stages {
            style.apply_effect(&mut styled, config)?;
        }
        Ok(styled)
    }

    /// Whether any style in the chain needs temporal smoothing
    pub fn is_flicker_prone(&self) -> bool {
        self.stages.iter().any(|(style, _)| style.metadata().flicker_prone)
    }

    pub fn names(&self) -> Vec<String> {
        self.stages.iter().map(|(s, _)| s.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl Default for StyleChain {
    fn default() -> Self {
        Self::new()
    }
}
