//! Trash classifier: EfficientNet backbone + small dense head.

use std::path::Path;

use burn::{
    config::Config,
    module::Module,
    nn::{Dropout, DropoutConfig, Linear, LinearConfig},
    record::{FullPrecisionSettings, NamedMpkFileRecorder},
    tensor::{
        activation::{silu, softmax},
        backend::Backend,
        Tensor,
    },
};
use tracing::{info, warn};

use crate::model::efficientnet::{EfficientNet, EfficientNetConfig};
use crate::utils::error::TrashSortError;

/// Head hyper-parameters
#[derive(Config, Debug)]
pub struct ClassifierHeadConfig {
    pub in_features: usize,
    pub num_classes: usize,

    #[config(default = "192")]
    pub hidden: usize,

    #[config(default = "0.35")]
    pub dropout: f64,
}

impl ClassifierHeadConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ClassifierHead<B> {
        ClassifierHead {
            dropout: DropoutConfig::new(self.dropout).init(),
            dense: LinearConfig::new(self.in_features, self.hidden).init(device),
            output: LinearConfig::new(self.hidden, self.num_classes).init(device),
        }
    }
}

/// GAP → Dropout → Dense + swish → Dense (logits)
#[derive(Module, Debug)]
pub struct ClassifierHead<B: Backend> {
    pub dropout: Dropout,
    /// The only L2-regularized kernel
    pub dense: Linear<B>,
    pub output: Linear<B>,
}

impl<B: Backend> ClassifierHead<B> {
    pub fn forward(&self, features: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch_size, channels, _, _] = features.dims();
        let x = features.mean_dim(3).mean_dim(2).reshape([batch_size, channels]);
        let x = self.dropout.forward(x);
        let x = silu(self.dense.forward(x));
        self.output.forward(x)
    }

    /// `Σ W²` over the regularized kernel
    pub fn l2_penalty(&self) -> Tensor<B, 1> {
        self.dense.weight.val().powf_scalar(2.0).sum()
    }
}

/// Full model configuration
#[derive(Config, Debug)]
pub struct TrashClassifierConfig {
    pub num_classes: usize,
    pub backbone: EfficientNetConfig,

    #[config(default = "192")]
    pub hidden: usize,

    #[config(default = "0.35")]
    pub dropout: f64,

    #[config(default = "224")]
    pub image_size: usize,
}

impl TrashClassifierConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> TrashClassifier<B> {
        let backbone = self.backbone.init(device);
        let head = ClassifierHeadConfig::new(backbone.out_channels(), self.num_classes)
            .with_hidden(self.hidden)
            .with_dropout(self.dropout)
            .init(device);

        TrashClassifier {
            backbone,
            head,
            num_classes: self.num_classes,
        }
    }
}

/// The classifier trained by the pipeline
#[derive(Module, Debug)]
pub struct TrashClassifier<B: Backend> {
    pub backbone: EfficientNet<B>,
    pub head: ClassifierHead<B>,
    num_classes: usize,
}

impl<B: Backend> TrashClassifier<B> {
    /// Raw 0..255 NCHW images to logits
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.head.forward(self.backbone.forward(images))
    }

    /// Softmax probabilities
    pub fn forward_probs(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward(images), 1)
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Freeze the whole backbone (stage 1)
    pub fn freeze_backbone(self) -> Self {
        Self {
            backbone: self.backbone.freeze_all(),
            head: self.head,
            num_classes: self.num_classes,
        }
    }

    /// Freeze backbone groups `< k` (stage 2)
    pub fn freeze_backbone_below(self, k: usize) -> Self {
        Self {
            backbone: self.backbone.freeze_below(k),
            head: self.head,
            num_classes: self.num_classes,
        }
    }

    /// Load pretrained backbone weights from a named MessagePack record.
    ///
    /// A missing file is not an error: the backbone keeps its random
    /// initialization and a warning is logged.
    pub fn with_backbone_weights(self, path: Option<&Path>, device: &B::Device) -> crate::utils::error::Result<Self> {
        let Some(path) = path else {
            warn!("No backbone weights given; backbone starts from random initialization");
            return Ok(self);
        };
        if !path.exists() {
            warn!(
                "Backbone weights {:?} not found; backbone starts from random initialization",
                path
            );
            return Ok(self);
        }

        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        let backbone = self
            .backbone
            .load_file(path.to_path_buf(), &recorder, device)
            .map_err(|e| TrashSortError::Model(format!("failed to load backbone weights {:?}: {}", path, e)))?;
        info!("Loaded backbone weights from {:?}", path);

        Ok(Self {
            backbone,
            head: self.head,
            num_classes: self.num_classes,
        })
    }

    /// Log a one-line parameter summary
    pub fn log_summary(&self) {
        info!(
            "TrashClassifier: {} classes, {} backbone groups, {} parameters (backbone {}, head {})",
            self.num_classes,
            self.backbone.num_groups(),
            self.num_params(),
            self.backbone.num_params(),
            self.head.num_params()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::Autodiff;
    use burn::optim::GradientsParams;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;
    type TestAutodiff = Autodiff<TestBackend>;

    fn tiny_config() -> TrashClassifierConfig {
        TrashClassifierConfig::new(3, EfficientNetConfig::tiny())
            .with_hidden(8)
            .with_image_size(32)
    }

    #[test]
    fn test_forward_probs_sum_to_one() {
        let device = Default::default();
        let model = tiny_config().init::<TestBackend>(&device);
        let x = Tensor::<TestBackend, 4>::ones([2, 3, 32, 32], &device) * 128.0;

        let probs = model.forward_probs(x);
        assert_eq!(probs.dims(), [2, 3]);
        let sums: Vec<f32> = probs.sum_dim(1).into_data().to_vec().unwrap();
        assert!(sums.iter().all(|s| (s - 1.0).abs() < 1e-5));
    }

    #[test]
    fn test_frozen_backbone_gets_no_gradients() {
        let device = Default::default();
        let model = tiny_config().init::<TestAutodiff>(&device).freeze_backbone();
        let x = Tensor::<TestAutodiff, 4>::ones([1, 3, 32, 32], &device);

        let grads = model.forward(x).sum().backward();
        let grads = GradientsParams::from_grads(grads, &model);

        let stem_weight = model.backbone.stem.conv.weight.id;
        let head_weight = model.head.dense.weight.id;
        assert!(grads.get::<TestBackend, 4>(stem_weight).is_none());
        assert!(grads.get::<TestBackend, 2>(head_weight).is_some());
    }

    #[test]
    fn test_partial_freeze_keeps_top_trainable() {
        let device = Default::default();
        let model = tiny_config().init::<TestAutodiff>(&device).freeze_backbone_below(2);
        let x = Tensor::<TestAutodiff, 4>::ones([1, 3, 32, 32], &device);

        let grads = model.forward(x).sum().backward();
        let grads = GradientsParams::from_grads(grads, &model);

        assert!(grads.get::<TestBackend, 4>(model.backbone.stem.conv.weight.id).is_none());
        assert!(grads.get::<TestBackend, 4>(model.backbone.top.conv.weight.id).is_some());
    }

    #[test]
    fn test_config_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model_config.json");
        tiny_config().with_dropout(0.25).save(&path).unwrap();

        let loaded = TrashClassifierConfig::load(&path).unwrap();
        assert_eq!(loaded.num_classes, 3);
        assert_eq!(loaded.hidden, 8);
        assert_eq!(loaded.image_size, 32);
        assert_eq!(loaded.dropout, 0.25);
        assert_eq!(loaded.backbone.num_blocks(), EfficientNetConfig::tiny().num_blocks());
    }

    #[test]
    fn test_missing_backbone_weights_is_a_warning() {
        let device = Default::default();
        let model = tiny_config().init::<TestBackend>(&device);
        let model = model
            .with_backbone_weights(Some(Path::new("/nonexistent/backbone.mpk")), &device)
            .unwrap();
        assert_eq!(model.num_classes(), 3);
    }
}
