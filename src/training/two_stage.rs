//! Two-stage transfer learning
//!
//! Stage 1 trains the head on a frozen backbone with a cosine-decayed LR.
//! Stage 2 starts from the best stage-1 weights, unfreezes the backbone from
//! `fine_tune_at` upwards and fine-tunes with a fresh Adam at a low LR.

use std::path::Path;

use burn::{module::Module, tensor::backend::AutodiffBackend};
use chrono::{DateTime, Local};
use colored::Colorize;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::model::{PipelineConfig, TrashClassifier, TrashClassifierConfig};
use crate::training::scheduler::LRScheduler;
use crate::training::trainer::{train_stage, EpochRecord, StageData, StageHistory, StageRun};
use crate::utils::error::Result;

/// File name of the saved training history
pub const HISTORY_FILE: &str = "history.json";

/// History of both stages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub created_at: DateTime<Local>,
    pub stages: Vec<StageHistory>,
}

impl TrainingHistory {
    /// All epochs, stage 1 followed by stage 2
    pub fn concatenated(&self) -> Vec<EpochRecord> {
        self.stages.iter().flat_map(|s| s.epochs.iter().cloned()).collect()
    }

    /// Epoch index (in the concatenated history) where each later stage starts
    pub fn stage_boundaries(&self) -> Vec<usize> {
        self.stages
            .iter()
            .scan(0, |offset, stage| {
                *offset += stage.epochs.len();
                Some(*offset)
            })
            .take(self.stages.len().saturating_sub(1))
            .collect()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}

/// Result of the two-stage run
pub struct TrainingOutcome<B: AutodiffBackend> {
    pub model: TrashClassifier<B>,
    pub history: TrainingHistory,
}

fn stage_scheduler(stage: &crate::model::StageConfig, decay_steps: usize) -> LRScheduler {
    if stage.cosine_decay {
        LRScheduler::cosine_decay(stage.learning_rate, decay_steps)
    } else {
        LRScheduler::constant(stage.learning_rate)
    }
}

/// RNG seed of the zero-based `stage`; each stage draws its own shuffle and
/// augmentation sequence
pub fn stage_seed(base: u64, stage: usize) -> u64 {
    base.wrapping_add(stage as u64)
}

/// Rebuild a stage-1 model for fine-tuning: fresh parameters require
/// gradients, the loaded record keeps that, then groups `< fine_tune_at`
/// are frozen again
pub fn unfreeze_for_fine_tuning<B: AutodiffBackend>(
    model_config: &TrashClassifierConfig,
    model: TrashClassifier<B>,
    fine_tune_at: usize,
    device: &B::Device,
) -> TrashClassifier<B> {
    model_config
        .init(device)
        .load_record(model.into_record())
        .freeze_backbone_below(fine_tune_at)
}

/// Run both stages; checkpoints and `history.json` go to `output_dir`
pub fn run_two_stage<B: AutodiffBackend>(
    config: &PipelineConfig,
    data: &StageData<'_>,
    backbone_weights: Option<&Path>,
    output_dir: &Path,
    device: &B::Device,
) -> Result<TrainingOutcome<B>> {
    use burn::data::dataset::Dataset;

    std::fs::create_dir_all(output_dir)?;
    let checkpoint_dir = output_dir.join("checkpoints");

    let model_config = config.model_config(data.num_classes);
    let steps_per_epoch = data.train.len().div_ceil(config.batch_size.max(1));
    let decay_steps = (config.stage1.epochs + config.stage2.epochs) * steps_per_epoch;

    let run = |index: usize, stage: &crate::model::StageConfig, checkpoint: &str| StageRun {
        name: format!("Stage {}", index + 1),
        stage: stage.clone(),
        scheduler: stage_scheduler(stage, decay_steps),
        batch_size: config.batch_size,
        seed: stage_seed(config.seed, index),
        label_smoothing: config.label_smoothing,
        l2: config.head.l2,
        augmentation: config.augmentation.clone(),
        mixup: config.mixup.clone(),
        checkpoint: checkpoint_dir.join(checkpoint),
    };

    println!("{}", "Stage 1: training head on frozen backbone".green().bold());
    let model: TrashClassifier<B> = model_config
        .init(device)
        .with_backbone_weights(backbone_weights, device)?
        .freeze_backbone();
    model.log_summary();

    let (model, stage1) = train_stage(model, data, &run(0, &config.stage1, "stage1_best"), device)?;

    println!();
    println!(
        "{}",
        format!("Stage 2: fine-tuning backbone groups >= {}", config.fine_tune_at)
            .green()
            .bold()
    );
    let groups = model.backbone.layer_groups();
    info!(
        "Stage 2 trains {} of {} backbone groups (from {:?})",
        groups.len().saturating_sub(config.fine_tune_at),
        groups.len(),
        groups.get(config.fine_tune_at)
    );

    let model = unfreeze_for_fine_tuning(&model_config, model, config.fine_tune_at, device);

    let (model, stage2) = train_stage(model, data, &run(1, &config.stage2, "stage2_best"), device)?;

    let history = TrainingHistory {
        created_at: Local::now(),
        stages: vec![stage1, stage2],
    };
    let history_path = output_dir.join(HISTORY_FILE);
    history.save(&history_path)?;
    info!("Training history saved to {:?}", history_path);

    Ok(TrainingOutcome { model, history })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::EpochIterator;
    use crate::model::EfficientNetConfig;
    use crate::training::trainer::EpochRecord;
    use burn::backend::Autodiff;
    use burn::optim::{AdamConfig, GradientsParams, Optimizer};
    use burn::tensor::Tensor;
    use burn_ndarray::NdArray;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    type TestBackend = NdArray<f32>;
    type TestAutodiff = Autodiff<TestBackend>;

    fn record(epoch: usize) -> EpochRecord {
        EpochRecord {
            epoch,
            train_loss: 1.0,
            train_accuracy: 0.5,
            val_loss: 1.0,
            val_accuracy: 0.5,
            learning_rate: 1e-3,
        }
    }

    fn history() -> TrainingHistory {
        TrainingHistory {
            created_at: Local::now(),
            stages: vec![
                StageHistory {
                    stage: "Stage 1".to_string(),
                    epochs: (0..3).map(record).collect(),
                    ..Default::default()
                },
                StageHistory {
                    stage: "Stage 2".to_string(),
                    epochs: (0..2).map(record).collect(),
                    ..Default::default()
                },
            ],
        }
    }

    #[test]
    fn test_concatenated_and_boundaries() {
        let h = history();
        assert_eq!(h.concatenated().len(), 5);
        assert_eq!(h.stage_boundaries(), vec![3]);
    }

    #[test]
    fn test_history_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(HISTORY_FILE);
        history().save(&path).unwrap();
        let loaded = TrainingHistory::load(&path).unwrap();
        assert_eq!(loaded.stages.len(), 2);
        assert_eq!(loaded.stages[1].stage, "Stage 2");
    }

    #[test]
    fn test_stages_draw_distinct_seeds() {
        assert_eq!(stage_seed(42, 0), 42);
        assert_ne!(stage_seed(42, 0), stage_seed(42, 1));
        assert_eq!(stage_seed(u64::MAX, 1), 0);

        let order = |seed: u64| {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            EpochIterator::shuffled(64, 64, &mut rng).next().unwrap()
        };
        assert_ne!(order(stage_seed(42, 0)), order(stage_seed(42, 1)));
    }

    fn values(tensor: Tensor<TestAutodiff, 1>) -> Vec<f32> {
        tensor.into_data().to_vec().unwrap()
    }

    #[test]
    fn test_fine_tuning_trains_only_upper_groups() {
        let device = Default::default();
        let model_config = TrashClassifierConfig::new(3, EfficientNetConfig::tiny())
            .with_hidden(8)
            .with_image_size(32);
        let stage1 = model_config.init::<TestAutodiff>(&device).freeze_backbone();

        // groups: stem, block1, block2, block3, top
        let model = unfreeze_for_fine_tuning(&model_config, stage1, 2, &device);

        let stem_weight = values(model.backbone.stem.conv.weight.val().flatten(0, 3));
        let block1_weight = values(model.backbone.blocks[0].depthwise.conv.weight.val().flatten(0, 3));
        let stem_mean = values(model.backbone.stem.bn.running_mean.value());
        let top_var = values(model.backbone.top.bn.running_var.value());

        let x = Tensor::<TestAutodiff, 4>::ones([2, 3, 32, 32], &device) * 128.0;
        let grads = model.forward(x).sum().backward();
        let grads = GradientsParams::from_grads(grads, &model);

        let backbone = &model.backbone;
        assert!(grads.get::<TestBackend, 4>(backbone.stem.conv.weight.id).is_none());
        assert!(grads.get::<TestBackend, 1>(backbone.stem.bn.gamma.id).is_none());
        assert!(grads.get::<TestBackend, 4>(backbone.blocks[0].depthwise.conv.weight.id).is_none());
        assert!(grads.get::<TestBackend, 4>(backbone.blocks[1].depthwise.conv.weight.id).is_some());
        assert!(grads.get::<TestBackend, 4>(backbone.blocks[2].project.conv.weight.id).is_some());
        assert!(grads.get::<TestBackend, 4>(backbone.top.conv.weight.id).is_some());
        assert!(grads.get::<TestBackend, 2>(model.head.dense.weight.id).is_some());

        let mut optim = AdamConfig::new().init();
        let model = optim.step(1e-2, model, grads);

        assert_eq!(values(model.backbone.stem.conv.weight.val().flatten(0, 3)), stem_weight);
        assert_eq!(
            values(model.backbone.blocks[0].depthwise.conv.weight.val().flatten(0, 3)),
            block1_weight
        );
        assert_eq!(values(model.backbone.stem.bn.running_mean.value()), stem_mean);
        assert_eq!(values(model.backbone.top.bn.running_var.value()), top_var);
    }
}
