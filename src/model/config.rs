//! Pipeline Configuration Module
//!
//! Every tunable of the pipeline in one serde tree, with defaults matching the
//! reference training recipe. Loaded from JSON with `--config`; CLI flags
//! override individual fields afterwards.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::dataset::{AugmentationConfig, MixUpConfig, SplitConfig};
use crate::model::classifier::TrashClassifierConfig;
use crate::model::efficientnet::EfficientNetConfig;
use crate::utils::error::{Result, TrashSortError};

/// Backbone architecture
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum BackboneKind {
    #[default]
    B0,
    /// Tiny network for smoke tests
    Tiny,
}

impl BackboneKind {
    pub fn config(&self) -> EfficientNetConfig {
        match self {
            Self::B0 => EfficientNetConfig::b0(),
            Self::Tiny => EfficientNetConfig::tiny(),
        }
    }
}

/// Classifier head settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeadConfig {
    pub hidden: usize,
    pub dropout: f64,
    /// L2 factor on the hidden dense kernel
    pub l2: f64,
}

impl Default for HeadConfig {
    fn default() -> Self {
        Self {
            hidden: 192,
            dropout: 0.35,
            l2: 1e-5,
        }
    }
}

/// One training stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    pub epochs: usize,
    pub learning_rate: f64,
    /// Cosine-decay the LR over both stages' optimizer steps instead of holding it
    pub cosine_decay: bool,
    pub plateau_factor: f64,
    pub plateau_patience: usize,
    pub early_stopping_patience: usize,
}

impl StageConfig {
    /// Frozen-backbone head training
    pub fn stage1() -> Self {
        Self {
            epochs: 8,
            learning_rate: 1e-3,
            cosine_decay: true,
            plateau_factor: 0.4,
            plateau_patience: 2,
            early_stopping_patience: 4,
        }
    }

    /// Partial fine-tuning
    pub fn stage2() -> Self {
        Self {
            epochs: 22,
            learning_rate: 1e-5,
            cosine_decay: false,
            plateau_factor: 0.4,
            plateau_patience: 3,
            early_stopping_patience: 6,
        }
    }
}

/// Test-time augmentation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtaConfig {
    pub passes: usize,
}

impl Default for TtaConfig {
    fn default() -> Self {
        Self { passes: 5 }
    }
}

/// Export settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    pub onnx: bool,
    pub fp16: bool,
    pub int8: bool,
    /// Calibration images per class taken from the train split
    pub representative_per_class: usize,
    pub opset: i64,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            onnx: true,
            fp16: true,
            int8: true,
            representative_per_class: 60,
            opset: 13,
        }
    }
}

/// The whole pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub image_size: usize,
    pub batch_size: usize,
    pub seed: u64,
    pub split: SplitConfig,
    pub augmentation: AugmentationConfig,
    pub mixup: MixUpConfig,
    pub class_weight_clip: (f32, f32),
    pub label_smoothing: f32,
    pub backbone: BackboneKind,
    pub head: HeadConfig,
    pub stage1: StageConfig,
    pub stage2: StageConfig,
    /// First backbone layer group trained in stage 2
    pub fine_tune_at: usize,
    pub tta: TtaConfig,
    pub export: ExportConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            image_size: 224,
            batch_size: 32,
            seed: 42,
            split: SplitConfig::default(),
            augmentation: AugmentationConfig::default(),
            mixup: MixUpConfig::default(),
            class_weight_clip: (0.7, 1.6),
            label_smoothing: 0.05,
            backbone: BackboneKind::B0,
            head: HeadConfig::default(),
            stage1: StageConfig::stage1(),
            stage2: StageConfig::stage2(),
            fine_tune_at: 4,
            tta: TtaConfig::default(),
            export: ExportConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Model configuration for `num_classes` outputs
    pub fn model_config(&self, num_classes: usize) -> TrashClassifierConfig {
        TrashClassifierConfig::new(num_classes, self.backbone.config())
            .with_hidden(self.head.hidden)
            .with_dropout(self.head.dropout)
            .with_image_size(self.image_size)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.split.validate()?;

        if self.image_size < 32 {
            return Err(TrashSortError::Config("image_size must be at least 32".to_string()));
        }
        if self.batch_size == 0 {
            return Err(TrashSortError::Config("batch_size must be greater than 0".to_string()));
        }
        if !(0.0..1.0).contains(&self.head.dropout) {
            return Err(TrashSortError::Config("dropout must be in range [0.0, 1.0)".to_string()));
        }
        if !(0.0..1.0).contains(&self.label_smoothing) {
            return Err(TrashSortError::Config("label_smoothing must be in range [0.0, 1.0)".to_string()));
        }
        let (low, high) = self.class_weight_clip;
        if low > high {
            return Err(TrashSortError::Config(format!(
                "class_weight_clip lower bound {} exceeds upper bound {}",
                low, high
            )));
        }
        let groups = self.backbone.config().num_groups();
        if self.fine_tune_at > groups {
            return Err(TrashSortError::Config(format!(
                "fine_tune_at {} exceeds the {} backbone layer groups",
                self.fine_tune_at, groups
            )));
        }

        Ok(())
    }

    /// Save configuration to a JSON file
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(TrashSortError::PathNotFound(path.to_path_buf()));
        }
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_follow_recipe() {
        let config = PipelineConfig::default();
        assert_eq!(config.seed, 42);
        assert_eq!(config.stage1.epochs + config.stage2.epochs, 30);
        assert!(config.stage1.cosine_decay);
        assert_eq!(config.stage2.learning_rate, 1e-5);
        assert_eq!(config.tta.passes, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = PipelineConfig::default();
        config.batch_size = 8;
        config.backbone = BackboneKind::Tiny;
        config.fine_tune_at = 2;
        config.save(&path).unwrap();

        let loaded = PipelineConfig::load(&path).unwrap();
        assert_eq!(loaded.batch_size, 8);
        assert_eq!(loaded.backbone, BackboneKind::Tiny);
    }

    #[test]
    fn test_rejects_fine_tune_beyond_groups() {
        let config = PipelineConfig {
            fine_tune_at: 19,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_model_config_uses_head_settings() {
        let config = PipelineConfig::default();
        let model = config.model_config(6);
        assert_eq!(model.num_classes, 6);
        assert_eq!(model.hidden, 192);
        assert_eq!(model.backbone.num_groups(), 18);
    }
}
