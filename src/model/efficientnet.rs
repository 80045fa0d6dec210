//! EfficientNet backbone
//!
//! Stem conv, a table of MBConv stages, and a 1x1 top conv. The network takes
//! raw 0..255 RGB input and applies ImageNet normalization itself, so every
//! consumer (batchers, predictor, exported graphs) feeds unnormalized pixels.

use burn::{
    config::Config,
    module::Module,
    tensor::{backend::Backend, Tensor},
};

use crate::model::layers::{ConvBnAct, MbConv, StageSpec};

/// ImageNet channel means for inputs scaled to [0, 1]
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// ImageNet channel standard deviations for inputs scaled to [0, 1]
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Backbone hyper-parameters
#[derive(Config, Debug)]
pub struct EfficientNetConfig {
    pub stages: Vec<StageSpec>,

    #[config(default = "32")]
    pub stem_channels: usize,

    #[config(default = "1280")]
    pub top_channels: usize,

    #[config(default = "0.25")]
    pub se_ratio: f64,

    #[config(default = "1e-3")]
    pub bn_eps: f64,
}

impl EfficientNetConfig {
    /// The B0 stage table
    pub fn b0() -> Self {
        let table = [
            (1, 3, 1, 32, 16, 1),
            (6, 3, 2, 16, 24, 2),
            (6, 5, 2, 24, 40, 2),
            (6, 3, 2, 40, 80, 3),
            (6, 5, 1, 80, 112, 3),
            (6, 5, 2, 112, 192, 4),
            (6, 3, 1, 192, 320, 1),
        ];
        Self::new(
            table
                .iter()
                .map(|&(e, k, s, i, o, r)| StageSpec::new(e, k, s, i, o, r))
                .collect(),
        )
    }

    /// A two-stage network small enough for unit tests
    pub fn tiny() -> Self {
        Self::new(vec![StageSpec::new(1, 3, 1, 8, 8, 1), StageSpec::new(2, 3, 2, 8, 12, 2)])
            .with_stem_channels(8)
            .with_top_channels(16)
    }

    /// Number of MBConv blocks after expanding repeats
    pub fn num_blocks(&self) -> usize {
        self.stages.iter().map(|s| s.repeats).sum()
    }

    /// Freezable groups: stem, every block, top
    pub fn num_groups(&self) -> usize {
        self.num_blocks() + 2
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> EfficientNet<B> {
        let stem = ConvBnAct::new(3, self.stem_channels, 3, 2, 1, true, self.bn_eps, device);

        let mut blocks = Vec::with_capacity(self.num_blocks());
        for stage in &self.stages {
            for r in 0..stage.repeats {
                let (in_channels, stride) = if r == 0 {
                    (stage.in_channels, stage.stride)
                } else {
                    (stage.out_channels, 1)
                };
                blocks.push(MbConv::new(
                    in_channels,
                    stage.out_channels,
                    stage.expand_ratio,
                    stage.kernel_size,
                    stride,
                    self.se_ratio,
                    self.bn_eps,
                    device,
                ));
            }
        }

        let last = self.stages.last().map(|s| s.out_channels).unwrap_or(self.stem_channels);
        let top = ConvBnAct::new(last, self.top_channels, 1, 1, 1, true, self.bn_eps, device);

        EfficientNet {
            stem,
            blocks,
            top,
            out_channels: self.top_channels,
        }
    }
}

/// EfficientNet feature extractor producing `[B, top_channels, h, w]`
#[derive(Module, Debug)]
pub struct EfficientNet<B: Backend> {
    pub stem: ConvBnAct<B>,
    pub blocks: Vec<MbConv<B>>,
    pub top: ConvBnAct<B>,
    out_channels: usize,
}

impl<B: Backend> EfficientNet<B> {
    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    /// Number of freezable groups (stem + blocks + top)
    pub fn num_groups(&self) -> usize {
        self.blocks.len() + 2
    }

    /// Human-readable group names in order
    pub fn layer_groups(&self) -> Vec<String> {
        std::iter::once("stem".to_string())
            .chain((0..self.blocks.len()).map(|i| format!("block{}", i + 1)))
            .chain(std::iter::once("top".to_string()))
            .collect()
    }

    /// Make groups `< k` non-trainable
    pub fn freeze_below(self, k: usize) -> Self {
        let stem = if k > 0 { self.stem.no_grad() } else { self.stem };
        let blocks = self
            .blocks
            .into_iter()
            .enumerate()
            .map(|(i, block)| if i + 1 < k { block.no_grad() } else { block })
            .collect::<Vec<_>>();
        let top = if k > blocks.len() + 1 { self.top.no_grad() } else { self.top };

        Self {
            stem,
            blocks,
            top,
            out_channels: self.out_channels,
        }
    }

    pub fn freeze_all(self) -> Self {
        self.no_grad()
    }

    /// Scale 0..255 input to ImageNet-normalized values
    pub fn preprocess(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let device = x.device();
        let mean = Tensor::<B, 1>::from_floats(IMAGENET_MEAN.map(|m| m * 255.0), &device).reshape([1, 3, 1, 1]);
        let std = Tensor::<B, 1>::from_floats(IMAGENET_STD.map(|s| s * 255.0), &device).reshape([1, 3, 1, 1]);
        (x - mean) / std
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = self.stem.forward(self.preprocess(x));
        for block in &self.blocks {
            x = block.forward(x);
        }
        self.top.forward(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::TensorData;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_b0_has_eighteen_groups() {
        let config = EfficientNetConfig::b0();
        assert_eq!(config.num_blocks(), 16);
        assert_eq!(config.num_groups(), 18);
    }

    #[test]
    fn test_tiny_forward_shape() {
        let device = Default::default();
        let net = EfficientNetConfig::tiny().init::<TestBackend>(&device);
        assert_eq!(net.layer_groups(), vec!["stem", "block1", "block2", "block3", "top"]);

        let x = Tensor::<TestBackend, 4>::zeros([2, 3, 32, 32], &device);
        assert_eq!(net.forward(x).dims(), [2, 16, 8, 8]);
    }

    #[test]
    fn test_preprocess_normalizes_mean_pixel() {
        let device = Default::default();
        let net = EfficientNetConfig::tiny().init::<TestBackend>(&device);
        let data: Vec<f32> = IMAGENET_MEAN.iter().map(|m| m * 255.0).collect();
        let x = Tensor::<TestBackend, 4>::from_data(TensorData::new(data, [1, 3, 1, 1]), &device);
        let y: Vec<f32> = net.preprocess(x).into_data().to_vec().unwrap();
        assert!(y.iter().all(|v| v.abs() < 1e-5));
    }
}
