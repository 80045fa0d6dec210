//! # trash_sort
//!
//! Two-stage transfer learning for sorting trash and recyclables into material
//! categories, built on the Burn framework.
//!
//! ## Modules
//!
//! - `dataset`: directory splitting, image loading, augmentation and MixUp
//! - `model`: EfficientNet backbone with frozen batch norm and the classifier head
//! - `training`: losses, schedules, callbacks and the two-stage driver
//! - `inference`: flip-averaged evaluation and single image prediction
//! - `export`: native weights, ONNX (FP32 / FP16 / INT8) and verification
//! - `pipeline`: the split → train → evaluate → export recipe used by the CLI
//! - `utils`: errors, logging, metrics and SVG charts
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use trash_sort::backend::{default_device, TrainingBackend};
//! use trash_sort::model::PipelineConfig;
//! use trash_sort::pipeline::run_pipeline;
//!
//! let config = PipelineConfig::default();
//! run_pipeline::<TrainingBackend>(&config, "data/raw".as_ref(), "work".as_ref(), None, &default_device())?;
//! ```

pub mod backend;
pub mod dataset;
pub mod export;
pub mod inference;
pub mod model;
pub mod pipeline;
pub mod training;
pub mod utils;

pub use dataset::{AugmentationConfig, ImageFolder, MixUpConfig, SplitConfig, TrashDataset};
pub use inference::{EvaluationReport, Prediction, Predictor};
pub use model::{PipelineConfig, TrashClassifier, TrashClassifierConfig};
pub use training::{run_two_stage, TrainingHistory};
pub use utils::error::{Result, TrashSortError};
pub use utils::metrics::{ConfusionMatrix, Metrics};

/// Version of the library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
