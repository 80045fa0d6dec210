//! Stage Runner
//!
//! One transfer-learning stage: a manual Burn training loop with per-batch
//! augmentation and MixUp, Adam stepped at a scheduled learning rate, and the
//! val_loss callbacks (reduce-on-plateau, checkpoint, early stopping).

use std::path::PathBuf;

use burn::{
    data::dataloader::batcher::Batcher,
    module::AutodiffModule,
    optim::{AdamConfig, GradientsParams, Optimizer},
    prelude::*,
    tensor::{backend::AutodiffBackend, ElementConversion},
};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dataset::{
    AugmentationConfig, AugmentingBatcher, EpochIterator, MixUp, MixUpConfig, TrashBatcher, TrashDataset,
};
use crate::model::{StageConfig, TrashClassifier};
use crate::training::callbacks::{EarlyStopping, ModelCheckpoint, ReduceLROnPlateau};
use crate::training::loss::{l2_term, smoothed_soft_cross_entropy};
use crate::training::scheduler::LRScheduler;
use crate::utils::error::{Result, TrashSortError};
use crate::utils::logging::TrainingLogger;
use crate::utils::metrics::{AccuracyTracker, RunningAverage};

/// Datasets shared by both stages
pub struct StageData<'a> {
    pub train: &'a TrashDataset,
    pub validation: &'a TrashDataset,
    pub num_classes: usize,
    pub class_weights: Vec<f32>,
}

/// Everything a single stage needs besides the model and data
#[derive(Debug, Clone)]
pub struct StageRun {
    pub name: String,
    pub stage: StageConfig,
    pub scheduler: LRScheduler,
    pub batch_size: usize,
    pub seed: u64,
    pub label_smoothing: f32,
    pub l2: f64,
    pub augmentation: AugmentationConfig,
    pub mixup: MixUpConfig,
    /// Checkpoint path without extension
    pub checkpoint: PathBuf,
}

/// Metrics of one epoch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
    pub learning_rate: f64,
}

/// Per-stage history
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageHistory {
    pub stage: String,
    pub epochs: Vec<EpochRecord>,
    pub best_epoch: Option<usize>,
    pub best_val_loss: f64,
    pub stopped_early: bool,
}

/// Hard labels of an Int tensor
pub fn labels_of<B: Backend>(tensor: Tensor<B, 1, Int>) -> Result<Vec<usize>> {
    tensor
        .into_data()
        .convert::<i64>()
        .to_vec::<i64>()
        .map(|v| v.into_iter().map(|x| x.max(0) as usize).collect())
        .map_err(|e| TrashSortError::Training(format!("failed to read tensor data: {:?}", e)))
}

/// Validation loss and accuracy without augmentation, mixing or sample weights
pub fn evaluate_loss<B: Backend>(
    model: &TrashClassifier<B>,
    dataset: &TrashDataset,
    num_classes: usize,
    batch_size: usize,
    label_smoothing: f32,
    l2: f64,
    device: &B::Device,
) -> Result<(f64, f64)> {
    use burn::data::dataset::Dataset;

    let batcher = TrashBatcher::new(num_classes, dataset.image_size());
    let mut loss_avg = RunningAverage::new();
    let mut accuracy = AccuracyTracker::new();

    for indices in EpochIterator::sequential(dataset.len(), batch_size) {
        let items = dataset.items_at(&indices);
        if items.is_empty() {
            continue;
        }
        let n = items.len();
        let batch = batcher.batch(items, device);

        let logits = model.forward(batch.images);
        let loss = smoothed_soft_cross_entropy(logits.clone(), batch.soft_targets, label_smoothing, None);
        let loss: f64 = loss.into_scalar().elem();
        loss_avg.add_weighted(loss, n);

        let predictions = labels_of(logits.argmax(1).reshape([n]))?;
        accuracy.add_batch(&predictions, &labels_of(batch.targets)?);
    }

    let penalty: f64 = l2_term(model.head.l2_penalty(), l2).into_scalar().elem();
    Ok((loss_avg.average() + penalty, accuracy.accuracy()))
}

/// Train one stage and return the best-val_loss model with its history
pub fn train_stage<B: AutodiffBackend>(
    model: TrashClassifier<B>,
    data: &StageData<'_>,
    run: &StageRun,
    device: &B::Device,
) -> Result<(TrashClassifier<B>, StageHistory)> {
    use burn::data::dataset::Dataset;

    let train_len = data.train.len();
    if train_len == 0 {
        return Err(TrashSortError::Training("training split is empty".to_string()));
    }
    if data.validation.is_empty() {
        return Err(TrashSortError::Training("validation split is empty".to_string()));
    }

    let batch_size = run.batch_size.max(1);
    let steps_per_epoch = train_len.div_ceil(batch_size);
    let image_size = data.train.image_size();

    println!();
    println!("{}", format!("{}:", run.name).cyan().bold());
    println!("  🔄 Epochs:        {}", run.stage.epochs);
    println!("  📦 Batch size:    {}", batch_size);
    println!("  📈 Schedule:      {}", run.scheduler.description());
    println!("  🧮 Steps/epoch:   {}", steps_per_epoch);

    let mut model = model;
    let mut optimizer = AdamConfig::new()
        .with_beta_1(0.9)
        .with_beta_2(0.999)
        .with_epsilon(1e-7)
        .init();

    let batcher = AugmentingBatcher::new(data.num_classes, image_size, run.augmentation.clone(), run.seed);
    let mixup = MixUp::new(&run.mixup, data.class_weights.clone())?;
    debug!("MixUp alpha {} with class weights {:?}", mixup.alpha(), mixup.class_weights());
    let mut rng = ChaCha8Rng::seed_from_u64(run.seed);

    let mut plateau = ReduceLROnPlateau::new(run.stage.plateau_factor, run.stage.plateau_patience);
    let mut stopper = EarlyStopping::new(run.stage.early_stopping_patience);
    let mut checkpoint = ModelCheckpoint::new(&run.checkpoint);
    let mut logger = TrainingLogger::new(&run.name, run.stage.epochs);

    let mut history = StageHistory {
        stage: run.name.clone(),
        best_val_loss: f64::INFINITY,
        ..Default::default()
    };
    let mut step = 0usize;

    for epoch in 0..run.stage.epochs {
        logger.start_epoch(epoch);

        let pb = ProgressBar::new(steps_per_epoch as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("  {spinner:.green} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
                .map_err(|e| TrashSortError::Training(e.to_string()))?
                .progress_chars("#>-"),
        );

        let mut loss_avg = RunningAverage::new();
        let mut accuracy = AccuracyTracker::new();
        let mut lr = plateau.apply(run.scheduler.get_lr(step, steps_per_epoch));

        for indices in EpochIterator::shuffled(train_len, batch_size, &mut rng) {
            let items = data.train.items_at(&indices);
            if items.is_empty() {
                continue;
            }
            let n = items.len();

            let batch = batcher.batch(items, device);
            let mixed = mixup.apply(batch, &mut rng);

            let logits = model.forward(mixed.images);
            let loss = smoothed_soft_cross_entropy(
                logits.clone(),
                mixed.soft_targets,
                run.label_smoothing,
                Some(mixed.sample_weights),
            ) + l2_term(model.head.l2_penalty(), run.l2);

            let loss_value: f64 = loss.clone().into_scalar().elem();
            loss_avg.add_weighted(loss_value, n);

            let predictions = labels_of(logits.argmax(1).reshape([n]))?;
            accuracy.add_batch(&predictions, &labels_of(mixed.targets)?);

            let grads = loss.backward();
            let grads = GradientsParams::from_grads(grads, &model);

            lr = plateau.apply(run.scheduler.get_lr(step, steps_per_epoch));
            model = optimizer.step(lr, model, grads);
            step += 1;

            pb.set_message(format!("loss {:.4}", loss_avg.average()));
            pb.inc(1);
        }
        pb.finish_and_clear();

        let (val_loss, val_accuracy) = evaluate_loss(
            &model.valid(),
            data.validation,
            data.num_classes,
            batch_size,
            run.label_smoothing,
            run.l2,
            device,
        )?;

        let record = EpochRecord {
            epoch,
            train_loss: loss_avg.average(),
            train_accuracy: accuracy.accuracy(),
            val_loss,
            val_accuracy,
            learning_rate: lr,
        };
        logger.end_epoch(
            record.train_loss,
            record.train_accuracy,
            val_loss,
            val_accuracy,
            lr,
        );

        if plateau.step(val_loss, lr) {
            logger.log_lr_reduced(plateau.multiplier());
        }

        let is_best = checkpoint.step::<B, _>(&model, val_loss)?;
        if is_best {
            logger.log_new_best(val_loss);
            history.best_epoch = Some(epoch);
            history.best_val_loss = val_loss;
        }

        println!(
            "  {} Epoch {:>2}/{} | loss {:.4} acc {:.2}% | val_loss {:.4} val_acc {:.2}% | lr {:.2e}{}",
            "→".cyan(),
            epoch + 1,
            run.stage.epochs,
            record.train_loss,
            record.train_accuracy * 100.0,
            val_loss,
            val_accuracy * 100.0,
            lr,
            if is_best { " (best)".green().to_string() } else { String::new() }
        );
        history.epochs.push(record);

        if stopper.step(epoch, val_loss) {
            logger.log_early_stop(run.stage.early_stopping_patience);
            history.stopped_early = true;
            break;
        }
    }

    logger.log_complete(history.epochs.len(), history.best_val_loss);

    debug!("Restoring best checkpoint {:?}", checkpoint.path());
    let model = checkpoint.restore::<B, _>(model, device)?;

    Ok((model, history))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::TrashItem;
    use crate::model::{EfficientNetConfig, TrashClassifierConfig};
    use burn::backend::Autodiff;
    use burn_ndarray::NdArray;
    use image::{Rgb, RgbImage};

    type TestBackend = NdArray<f32>;
    type TestAutodiff = Autodiff<TestBackend>;

    pub(crate) fn toy_dataset(n_per_class: usize) -> TrashDataset {
        let items = (0..n_per_class * 2)
            .map(|i| {
                let label = i % 2;
                let value = if label == 0 { 20 } else { 230 };
                TrashItem {
                    image: RgbImage::from_pixel(32, 32, Rgb([value, value, value])),
                    label,
                    path: PathBuf::from(format!("{}.png", i)),
                }
            })
            .collect();
        TrashDataset::from_items(items, 32)
    }

    #[test]
    fn test_labels_of() {
        let device = Default::default();
        let t = Tensor::<TestBackend, 1, Int>::from_data(TensorData::new(vec![2i64, 0, 1], [3]), &device);
        assert_eq!(labels_of(t).unwrap(), vec![2, 0, 1]);
    }

    #[test]
    fn test_evaluate_loss_includes_l2() {
        let device = Default::default();
        let data = toy_dataset(2);
        let model = TrashClassifierConfig::new(2, EfficientNetConfig::tiny())
            .with_hidden(4)
            .init::<TestBackend>(&device);

        let (plain, acc) = evaluate_loss(&model, &data, 2, 3, 0.05, 0.0, &device).unwrap();
        let (regularized, _) = evaluate_loss(&model, &data, 2, 3, 0.05, 1.0, &device).unwrap();
        assert!(plain > 0.0);
        assert!(regularized > plain);
        assert!((0.0..=1.0).contains(&acc));
    }

    #[test]
    fn test_train_stage_runs_and_checkpoints() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let train = toy_dataset(4);
        let validation = toy_dataset(1);
        let data = StageData {
            train: &train,
            validation: &validation,
            num_classes: 2,
            class_weights: vec![1.0, 1.0],
        };
        let run = StageRun {
            name: "Stage 1".to_string(),
            stage: StageConfig {
                epochs: 2,
                ..StageConfig::stage1()
            },
            scheduler: LRScheduler::cosine_decay(1e-3, 8),
            batch_size: 4,
            seed: 42,
            label_smoothing: 0.05,
            l2: 1e-5,
            augmentation: AugmentationConfig::default(),
            mixup: MixUpConfig::default(),
            checkpoint: dir.path().join("stage1_best"),
        };

        let model = TrashClassifierConfig::new(2, EfficientNetConfig::tiny())
            .with_hidden(4)
            .init::<TestAutodiff>(&device)
            .freeze_backbone();

        let (_model, history) = train_stage(model, &data, &run, &device).unwrap();
        assert_eq!(history.epochs.len(), 2);
        assert!(history.best_epoch.is_some());
        assert!(history.epochs.iter().all(|e| e.train_loss.is_finite() && e.val_loss.is_finite()));
    }
}
