//! Model module using the Burn framework
//!
//! This module provides:
//! - The EfficientNet backbone with frozen batch norm and layer-group freezing
//! - The classification head and the full `TrashClassifier`
//! - The pipeline configuration tree
//!
//! ## Input convention
//!
//! Models take raw 0..255 RGB tensors in NCHW layout and normalize internally.

pub mod classifier;
pub mod config;
pub mod efficientnet;
pub mod layers;

pub use classifier::{ClassifierHead, ClassifierHeadConfig, TrashClassifier, TrashClassifierConfig};
pub use config::{BackboneKind, ExportConfig, HeadConfig, PipelineConfig, StageConfig, TtaConfig};
pub use efficientnet::{EfficientNet, EfficientNetConfig};

/// Default input resolution
pub const DEFAULT_IMAGE_SIZE: usize = 224;
