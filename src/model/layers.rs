//! Building blocks of the EfficientNet backbone.

use burn::{
    config::Config,
    module::{Module, Param, RunningState},
    nn::{
        conv::{Conv2d, Conv2dConfig},
        PaddingConfig2d,
    },
    tensor::{
        activation::{sigmoid, silu},
        backend::Backend,
        Tensor,
    },
};

/// Batch normalization that always uses its running statistics.
///
/// The pretrained backbone runs in inference mode even while it is being
/// fine-tuned: γ and β may learn, mean and variance never move.
#[derive(Module, Debug)]
pub struct FrozenBatchNorm<B: Backend> {
    pub gamma: Param<Tensor<B, 1>>,
    pub beta: Param<Tensor<B, 1>>,
    pub running_mean: RunningState<Tensor<B, 1>>,
    pub running_var: RunningState<Tensor<B, 1>>,
    pub epsilon: f64,
}

impl<B: Backend> FrozenBatchNorm<B> {
    pub fn new(channels: usize, epsilon: f64, device: &B::Device) -> Self {
        Self {
            gamma: Param::from_tensor(Tensor::ones([channels], device)),
            beta: Param::from_tensor(Tensor::zeros([channels], device)),
            running_mean: RunningState::new(Tensor::zeros([channels], device)),
            running_var: RunningState::new(Tensor::ones([channels], device)),
            epsilon,
        }
    }

    /// Per-channel `(scale, shift)` so that `bn(x) = x * scale + shift`
    pub fn scale_shift(&self) -> (Tensor<B, 1>, Tensor<B, 1>) {
        let std = (self.running_var.value() + self.epsilon).sqrt();
        let scale = self.gamma.val() / std;
        let shift = self.beta.val() - self.running_mean.value() * scale.clone();
        (scale, shift)
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [channels] = self.gamma.dims();
        let (scale, shift) = self.scale_shift();
        x * scale.reshape([1, channels, 1, 1]) + shift.reshape([1, channels, 1, 1])
    }
}

/// Convolution (no bias) + frozen batch norm + optional swish
#[derive(Module, Debug)]
pub struct ConvBnAct<B: Backend> {
    pub conv: Conv2d<B>,
    pub bn: FrozenBatchNorm<B>,
    pub kernel_size: usize,
    pub stride: usize,
    pub groups: usize,
    pub activation: bool,
}

impl<B: Backend> ConvBnAct<B> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        groups: usize,
        activation: bool,
        bn_eps: f64,
        device: &B::Device,
    ) -> Self {
        let padding = kernel_size / 2;
        let conv = Conv2dConfig::new([in_channels, out_channels], [kernel_size, kernel_size])
            .with_stride([stride, stride])
            .with_groups(groups)
            .with_padding(PaddingConfig2d::Explicit(padding, padding))
            .with_bias(false)
            .init(device);

        Self {
            conv,
            bn: FrozenBatchNorm::new(out_channels, bn_eps, device),
            kernel_size,
            stride,
            groups,
            activation,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.bn.forward(self.conv.forward(x));
        if self.activation {
            silu(x)
        } else {
            x
        }
    }
}

/// Squeeze-and-excitation gate
#[derive(Module, Debug)]
pub struct SqueezeExcite<B: Backend> {
    pub reduce: Conv2d<B>,
    pub expand: Conv2d<B>,
}

impl<B: Backend> SqueezeExcite<B> {
    pub fn new(channels: usize, reduced: usize, device: &B::Device) -> Self {
        Self {
            reduce: Conv2dConfig::new([channels, reduced], [1, 1]).init(device),
            expand: Conv2dConfig::new([reduced, channels], [1, 1]).init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let s = x.clone().mean_dim(3).mean_dim(2);
        let s = silu(self.reduce.forward(s));
        let s = sigmoid(self.expand.forward(s));
        x * s
    }
}

/// One row of the backbone stage table
#[derive(Config, Debug)]
pub struct StageSpec {
    pub expand_ratio: usize,
    pub kernel_size: usize,
    pub stride: usize,
    pub in_channels: usize,
    pub out_channels: usize,
    pub repeats: usize,
}

/// Mobile inverted bottleneck block
#[derive(Module, Debug)]
pub struct MbConv<B: Backend> {
    pub expand: Option<ConvBnAct<B>>,
    pub depthwise: ConvBnAct<B>,
    pub se: SqueezeExcite<B>,
    pub project: ConvBnAct<B>,
    pub residual: bool,
}

impl<B: Backend> MbConv<B> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        expand_ratio: usize,
        kernel_size: usize,
        stride: usize,
        se_ratio: f64,
        bn_eps: f64,
        device: &B::Device,
    ) -> Self {
        let hidden = in_channels * expand_ratio;
        let expand = (expand_ratio != 1)
            .then(|| ConvBnAct::new(in_channels, hidden, 1, 1, 1, true, bn_eps, device));
        let depthwise = ConvBnAct::new(hidden, hidden, kernel_size, stride, hidden, true, bn_eps, device);
        let reduced = ((in_channels as f64 * se_ratio) as usize).max(1);
        let se = SqueezeExcite::new(hidden, reduced, device);
        let project = ConvBnAct::new(hidden, out_channels, 1, 1, 1, false, bn_eps, device);

        Self {
            expand,
            depthwise,
            se,
            project,
            residual: stride == 1 && in_channels == out_channels,
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = match &self.expand {
            Some(expand) => expand.forward(input.clone()),
            None => input.clone(),
        };
        let x = self.depthwise.forward(x);
        let x = self.se.forward(x);
        let x = self.project.forward(x);

        if self.residual {
            x + input
        } else {
            x
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::TensorData;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_frozen_bn_uses_running_stats() {
        let device = Default::default();
        let mut bn = FrozenBatchNorm::<TestBackend>::new(2, 0.0, &device);
        bn.running_mean = RunningState::new(Tensor::from_floats([1.0, -1.0], &device));
        bn.running_var = RunningState::new(Tensor::from_floats([4.0, 1.0], &device));

        let x = Tensor::<TestBackend, 4>::from_data(TensorData::new(vec![3.0f32, 0.0], [1, 2, 1, 1]), &device);
        let y: Vec<f32> = bn.forward(x).into_data().to_vec().unwrap();
        assert!((y[0] - 1.0).abs() < 1e-6);
        assert!((y[1] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_mbconv_shapes_and_residual() {
        let device = Default::default();
        let block = MbConv::<TestBackend>::new(8, 8, 6, 3, 1, 0.25, 1e-3, &device);
        assert!(block.residual);
        assert!(block.expand.is_some());
        let x = Tensor::<TestBackend, 4>::zeros([2, 8, 8, 8], &device);
        assert_eq!(block.forward(x).dims(), [2, 8, 8, 8]);

        let down = MbConv::<TestBackend>::new(8, 16, 1, 5, 2, 0.25, 1e-3, &device);
        assert!(!down.residual);
        assert!(down.expand.is_none());
        let x = Tensor::<TestBackend, 4>::zeros([1, 8, 8, 8], &device);
        assert_eq!(down.forward(x).dims(), [1, 16, 4, 4]);
    }

    #[test]
    fn test_se_reduced_width_from_block_input() {
        let device = Default::default();
        let block = MbConv::<TestBackend>::new(16, 24, 6, 3, 2, 0.25, 1e-3, &device);
        assert_eq!(block.se.reduce.weight.dims(), [4, 96, 1, 1]);
    }
}
