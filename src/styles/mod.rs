//! # Style System
//!
//! Pluggable frame-in/frame-out filters. Each style does one thing; a job
//! lists the styles it wants and they are applied in that order.
//!
//! ## Built-in Styles
//!
//! - **Pencil**: Luminance sketch with dark gradient strokes
//! - **Cartoon**: Posterized flat colors
//! - **Cinematic**: Contrast curve with teal-and-orange split toning
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::collections::BTreeMap;
//! use video_stylizer::styles::StyleRegistry;
//!
//! let registry = StyleRegistry::new();
//! let chain = registry
//!     .chain(&["cartoon".to_string(), "cinematic".to_string()], &BTreeMap::new())
//!     .unwrap();
//! // Hand the chain to the pipeline, or call chain.apply(&frame) directly
//! ```

pub mod chain;
pub mod registry;
pub mod traits;

pub mod cartoon;
pub mod cinematic;
pub mod pencil;

pub use chain::StyleChain;
pub use registry::StyleRegistry;
pub use traits::{ConfigValue, Style, StyleConfig, StyleMetadata};

pub use cartoon::CartoonStyle;
pub use cinematic::CinematicStyle;
pub use pencil::PencilStyle;
