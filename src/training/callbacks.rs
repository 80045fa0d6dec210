//! Epoch-end callbacks monitoring validation loss.

use std::path::{Path, PathBuf};

use burn::{
    module::Module,
    record::{FullPrecisionSettings, NamedMpkFileRecorder},
    tensor::backend::Backend,
};
use tracing::debug;

use crate::utils::error::{Result, TrashSortError};

/// Multiplies the scheduled learning rate down when val_loss stalls
#[derive(Debug, Clone)]
pub struct ReduceLROnPlateau {
    factor: f64,
    patience: usize,
    min_delta: f64,
    min_lr: f64,
    best: f64,
    wait: usize,
    multiplier: f64,
}

impl ReduceLROnPlateau {
    pub fn new(factor: f64, patience: usize) -> Self {
        Self {
            factor,
            patience,
            min_delta: 1e-4,
            min_lr: 0.0,
            best: f64::INFINITY,
            wait: 0,
            multiplier: 1.0,
        }
    }

    /// Accumulated factor applied on top of the schedule
    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    /// Effective learning rate for a scheduled value
    pub fn apply(&self, scheduled_lr: f64) -> f64 {
        (scheduled_lr * self.multiplier).max(self.min_lr)
    }

    /// Record an epoch's val_loss; returns true when the LR was reduced
    pub fn step(&mut self, val_loss: f64, current_lr: f64) -> bool {
        if val_loss < self.best - self.min_delta {
            self.best = val_loss;
            self.wait = 0;
            return false;
        }

        self.wait += 1;
        if self.wait < self.patience {
            return false;
        }

        self.wait = 0;
        if current_lr > self.min_lr {
            self.multiplier *= self.factor;
            debug!("ReduceLROnPlateau: multiplier now {:.4}", self.multiplier);
            true
        } else {
            false
        }
    }
}

/// Stops a stage after `patience` epochs without val_loss improvement
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    min_delta: f64,
    best: f64,
    best_epoch: Option<usize>,
    wait: usize,
}

impl EarlyStopping {
    pub fn new(patience: usize) -> Self {
        Self {
            patience,
            min_delta: 0.0,
            best: f64::INFINITY,
            best_epoch: None,
            wait: 0,
        }
    }

    pub fn best(&self) -> f64 {
        self.best
    }

    pub fn best_epoch(&self) -> Option<usize> {
        self.best_epoch
    }

    /// Record an epoch's val_loss; returns true when training should stop
    pub fn step(&mut self, epoch: usize, val_loss: f64) -> bool {
        self.wait += 1;
        if val_loss < self.best - self.min_delta {
            self.best = val_loss;
            self.best_epoch = Some(epoch);
            self.wait = 0;
            return false;
        }
        self.wait >= self.patience && epoch > 0
    }
}

type CheckpointRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

/// Saves the model whenever val_loss improves
#[derive(Debug, Clone)]
pub struct ModelCheckpoint {
    path: PathBuf,
    best: f64,
    saved: bool,
}

impl ModelCheckpoint {
    /// `path` is given without extension; the recorder appends its own
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            best: f64::INFINITY,
            saved: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn has_checkpoint(&self) -> bool {
        self.saved
    }

    /// Save when `val_loss` beats the best so far; returns true when saved.
    /// A NaN loss never counts as an improvement.
    #[allow(clippy::neg_cmp_op_on_partial_ord)]
    pub fn step<B: Backend, M: Module<B>>(&mut self, model: &M, val_loss: f64) -> Result<bool> {
        if !(val_loss < self.best) {
            return Ok(false);
        }
        self.best = val_loss;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        model
            .clone()
            .save_file(self.path.clone(), &CheckpointRecorder::new())
            .map_err(|e| TrashSortError::Training(format!("failed to save checkpoint {:?}: {}", self.path, e)))?;
        self.saved = true;
        Ok(true)
    }

    /// Load the best checkpoint into `model`, or return it unchanged if none was written
    pub fn restore<B: Backend, M: Module<B>>(&self, model: M, device: &B::Device) -> Result<M> {
        if !self.saved {
            return Ok(model);
        }
        model
            .load_file(self.path.clone(), &CheckpointRecorder::new(), device)
            .map_err(|e| TrashSortError::Training(format!("failed to load checkpoint {:?}: {}", self.path, e)))
    }
}
