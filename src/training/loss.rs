//! Loss functions for soft (mixed) targets.

use burn::tensor::{activation::log_softmax, backend::Backend, Tensor};

/// Cross-entropy against soft targets with label smoothing.
///
/// Targets are smoothed as `y' = y·(1−ε) + ε/C`. With sample weights the
/// per-sample losses are reduced as `Σ loss_i·w_i / B`, otherwise as the mean.
pub fn smoothed_soft_cross_entropy<B: Backend>(
    logits: Tensor<B, 2>,
    soft_targets: Tensor<B, 2>,
    smoothing: f32,
    sample_weights: Option<Tensor<B, 1>>,
) -> Tensor<B, 1> {
    let [batch_size, num_classes] = logits.dims();
    let targets = soft_targets
        .mul_scalar(1.0 - smoothing)
        .add_scalar(smoothing / num_classes as f32);

    let per_sample = (targets * log_softmax(logits, 1))
        .sum_dim(1)
        .neg()
        .reshape([batch_size]);

    match sample_weights {
        Some(weights) => (per_sample * weights).sum().div_scalar(batch_size as f32),
        None => per_sample.mean(),
    }
}

/// `factor · Σ W²`
pub fn l2_term<B: Backend>(sum_of_squares: Tensor<B, 1>, factor: f64) -> Tensor<B, 1> {
    sum_of_squares.mul_scalar(factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::TensorData;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn scalar(t: Tensor<TestBackend, 1>) -> f32 {
        t.into_data().to_vec::<f32>().unwrap()[0]
    }

    #[test]
    fn test_uniform_logits_give_log_c() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 2>::zeros([2, 4], &device);
        let targets = Tensor::<TestBackend, 2>::from_data(
            TensorData::new(vec![1.0f32, 0.0, 0.0, 0.0, 0.0, 0.5, 0.5, 0.0], [2, 4]),
            &device,
        );
        let loss = scalar(smoothed_soft_cross_entropy(logits, targets, 0.05, None));
        assert!((loss - 4.0f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn test_weighted_reduction_divides_by_batch() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 2>::zeros([2, 2], &device);
        let targets = Tensor::<TestBackend, 2>::from_data(
            TensorData::new(vec![1.0f32, 0.0, 0.0, 1.0], [2, 2]),
            &device,
        );
        let weights = Tensor::<TestBackend, 1>::from_data(TensorData::new(vec![2.0f32, 0.0], [2]), &device);

        let loss = scalar(smoothed_soft_cross_entropy(logits, targets, 0.0, Some(weights)));
        // (2·ln2 + 0) / 2
        assert!((loss - 2.0f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn test_smoothing_raises_confident_loss() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 2>::from_data(TensorData::new(vec![10.0f32, -10.0], [1, 2]), &device);
        let targets = Tensor::<TestBackend, 2>::from_data(TensorData::new(vec![1.0f32, 0.0], [1, 2]), &device);

        let plain = scalar(smoothed_soft_cross_entropy(logits.clone(), targets.clone(), 0.0, None));
        let smoothed = scalar(smoothed_soft_cross_entropy(logits, targets, 0.1, None));
        assert!(smoothed > plain);
    }
}
