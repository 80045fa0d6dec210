//! MixUp regularization
//!
//! Blends every sample of a batch with a randomly chosen partner:
//! `x = λ·x + (1−λ)·x[perm]`, `y = λ·y + (1−λ)·y[perm]`, with one
//! `λ ~ Beta(α, α)` per sample. Class weights are folded into a per-sample
//! weight so that the loss can stay a single weighted mean.

use burn::prelude::*;
use rand::seq::SliceRandom;
use rand::Rng;
use rand_distr::{Beta, Distribution};
use serde::{Deserialize, Serialize};

use crate::dataset::burn_dataset::TrashBatch;
use crate::utils::error::{Result, TrashSortError};

/// MixUp settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MixUpConfig {
    /// Beta distribution concentration; values <= 0 disable mixing
    pub alpha: f32,
}

impl Default for MixUpConfig {
    fn default() -> Self {
        Self { alpha: 0.4 }
    }
}

/// A batch after mixing
#[derive(Clone, Debug)]
pub struct MixedBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub soft_targets: Tensor<B, 2>,
    /// `Σ_c y_ic · class_weight_c`, shape [batch_size]
    pub sample_weights: Tensor<B, 1>,
    /// Argmax of the mixed labels, shape [batch_size]
    pub targets: Tensor<B, 1, Int>,
}

/// Per-sample MixUp with class-weighted sample weights
#[derive(Clone, Debug)]
pub struct MixUp {
    alpha: f32,
    beta: Option<Beta<f32>>,
    class_weights: Vec<f32>,
}

impl MixUp {
    pub fn new(config: &MixUpConfig, class_weights: Vec<f32>) -> Result<Self> {
        let beta = if config.alpha > 0.0 {
            Some(
                Beta::new(config.alpha, config.alpha)
                    .map_err(|e| TrashSortError::Config(format!("invalid MixUp alpha {}: {}", config.alpha, e)))?,
            )
        } else {
            None
        };

        Ok(Self {
            alpha: config.alpha,
            beta,
            class_weights,
        })
    }

    pub fn alpha(&self) -> f32 {
        self.alpha
    }

    pub fn class_weights(&self) -> &[f32] {
        &self.class_weights
    }

    /// One λ per sample (all 1.0 when mixing is disabled)
    pub fn sample_lambdas<R: Rng>(&self, batch_size: usize, rng: &mut R) -> Vec<f32> {
        match &self.beta {
            Some(beta) => (0..batch_size).map(|_| beta.sample(rng)).collect(),
            None => vec![1.0; batch_size],
        }
    }

    /// Mix a batch
    pub fn apply<B: Backend, R: Rng>(&self, batch: TrashBatch<B>, rng: &mut R) -> MixedBatch<B> {
        let [batch_size, num_classes] = batch.soft_targets.dims();
        let device = batch.images.device();

        let weights = Tensor::<B, 1>::from_floats(
            TensorData::new(self.padded_weights(num_classes), [num_classes]),
            &device,
        )
        .reshape([1, num_classes]);

        if self.beta.is_none() || batch_size < 2 {
            let sample_weights = (batch.soft_targets.clone() * weights).sum_dim(1).reshape([batch_size]);
            return MixedBatch {
                images: batch.images,
                soft_targets: batch.soft_targets,
                sample_weights,
                targets: batch.targets,
            };
        }

        let mut perm: Vec<usize> = (0..batch_size).collect();
        perm.shuffle(rng);
        let perm_data: Vec<i64> = perm.iter().map(|&i| i as i64).collect();
        let perm = Tensor::<B, 1, Int>::from_data(TensorData::new(perm_data, [batch_size]), &device);

        let lambdas = self.sample_lambdas(batch_size, rng);
        let lam = Tensor::<B, 1>::from_floats(TensorData::new(lambdas, [batch_size]), &device);

        let lam_x = lam.clone().reshape([batch_size, 1, 1, 1]);
        let images = batch.images.clone() * lam_x.clone()
            + batch.images.select(0, perm.clone()) * (lam_x.ones_like() - lam_x);

        let lam_y = lam.reshape([batch_size, 1]);
        let soft_targets = batch.soft_targets.clone() * lam_y.clone()
            + batch.soft_targets.select(0, perm) * (lam_y.ones_like() - lam_y);

        let sample_weights = (soft_targets.clone() * weights).sum_dim(1).reshape([batch_size]);
        let targets = soft_targets.clone().argmax(1).reshape([batch_size]);

        MixedBatch {
            images,
            soft_targets,
            sample_weights,
            targets,
        }
    }

    fn padded_weights(&self, num_classes: usize) -> Vec<f32> {
        (0..num_classes)
            .map(|c| self.class_weights.get(c).copied().unwrap_or(1.0))
            .collect()
    }
}
