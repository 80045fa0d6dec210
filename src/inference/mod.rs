//! Inference module
//!
//! - Flip-averaged test-time augmentation
//! - Test-set evaluation with reports and charts
//! - Single image prediction from the native model files

pub mod evaluate;
pub mod predictor;
pub mod tta;

pub use evaluate::{evaluate_model, plot_training_history, write_evaluation, EvaluationReport};
pub use predictor::{Prediction, Predictor};
pub use tta::{predict_tta, TtaPredictions};
