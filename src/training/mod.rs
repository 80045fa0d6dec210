//! Training module
//!
//! This module provides:
//! - Soft-target cross-entropy with label smoothing
//! - Per-step learning rate schedules
//! - val_loss callbacks (reduce-on-plateau, early stopping, checkpointing)
//! - The stage runner and the two-stage transfer-learning driver

pub mod callbacks;
pub mod loss;
pub mod scheduler;
pub mod trainer;
pub mod two_stage;

pub use callbacks::{EarlyStopping, ModelCheckpoint, ReduceLROnPlateau};
pub use loss::smoothed_soft_cross_entropy;
pub use scheduler::LRScheduler;
pub use trainer::{evaluate_loss, train_stage, EpochRecord, StageData, StageHistory, StageRun};
pub use two_stage::{run_two_stage, TrainingHistory, TrainingOutcome, HISTORY_FILE};
