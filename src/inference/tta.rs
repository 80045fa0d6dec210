//! Test-time augmentation
//!
//! Averages softmax outputs over several passes of the same, unshuffled data.
//! Odd passes see horizontally flipped images.

use burn::{data::dataloader::batcher::Batcher, prelude::*};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::debug;

use crate::dataset::{EpochIterator, TrashBatcher, TrashDataset};
use crate::model::TrashClassifier;
use crate::utils::error::{Result, TrashSortError};

/// Averaged probabilities with the matching ground truth
#[derive(Debug, Clone)]
pub struct TtaPredictions {
    pub probs: Vec<Vec<f32>>,
    pub labels: Vec<usize>,
}

impl TtaPredictions {
    /// Argmax of each averaged distribution
    pub fn predicted(&self) -> Vec<usize> {
        self.probs
            .iter()
            .map(|row| {
                row.iter()
                    .enumerate()
                    .max_by(|a, b| a.1.total_cmp(b.1))
                    .map(|(i, _)| i)
                    .unwrap_or(0)
            })
            .collect()
    }
}

/// Softmax probabilities averaged over `passes` passes (0 is treated as 1)
pub fn predict_tta<B: Backend>(
    model: &TrashClassifier<B>,
    dataset: &TrashDataset,
    batch_size: usize,
    passes: usize,
    device: &B::Device,
) -> Result<TtaPredictions> {
    use burn::data::dataset::Dataset;

    let passes = passes.max(1);
    let num_classes = model.num_classes();
    let batcher = TrashBatcher::new(num_classes, dataset.image_size());
    let mut sums = vec![0.0f32; dataset.len() * num_classes];

    let pb = ProgressBar::new((passes * dataset.len().div_ceil(batch_size.max(1))) as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("  TTA {bar:30.cyan/blue} {pos}/{len}")
            .map_err(|e| TrashSortError::Inference(e.to_string()))?
            .progress_chars("#>-"),
    );

    for pass in 0..passes {
        let flip = pass % 2 == 1;
        debug!("TTA pass {}/{} (flip: {})", pass + 1, passes, flip);

        let mut offset = 0usize;
        for indices in EpochIterator::sequential(dataset.len(), batch_size) {
            let items = dataset.items_at(&indices);
            let batch = batcher.batch(items, device);
            let images = if flip { batch.images.flip([3]) } else { batch.images };

            let probs = model
                .forward_probs(images)
                .into_data()
                .convert::<f32>()
                .to_vec::<f32>()
                .map_err(|e| TrashSortError::Inference(format!("failed to read probabilities: {:?}", e)))?;

            for (slot, p) in sums[offset..offset + probs.len()].iter_mut().zip(&probs) {
                *slot += p;
            }
            offset += probs.len();
            pb.inc(1);
        }
    }
    pb.finish_and_clear();

    let probs = sums
        .chunks(num_classes.max(1))
        .map(|row| row.iter().map(|v| v / passes as f32).collect())
        .collect();

    Ok(TtaPredictions {
        probs,
        labels: dataset.labels(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::TrashItem;
    use crate::model::{EfficientNetConfig, TrashClassifierConfig};
    use burn_ndarray::NdArray;
    use image::{Rgb, RgbImage};
    use std::path::PathBuf;

    type TestBackend = NdArray<f32>;

    fn dataset() -> TrashDataset {
        let items = (0..5)
            .map(|i| {
                let mut image = RgbImage::from_pixel(32, 32, Rgb([10, 10, 10]));
                // asymmetric so flipping matters
                for y in 0..32 {
                    image.put_pixel(i, y, Rgb([250, 0, 0]));
                }
                TrashItem {
                    image,
                    label: i as usize % 3,
                    path: PathBuf::from(format!("{}.png", i)),
                }
            })
            .collect();
        TrashDataset::from_items(items, 32)
    }

    #[test]
    fn test_tta_rows_are_distributions() {
        let device = Default::default();
        let model = TrashClassifierConfig::new(3, EfficientNetConfig::tiny())
            .with_hidden(4)
            .init::<TestBackend>(&device);

        let preds = predict_tta(&model, &dataset(), 2, 5, &device).unwrap();
        assert_eq!(preds.probs.len(), 5);
        assert_eq!(preds.labels, vec![0, 1, 2, 0, 1]);
        for row in &preds.probs {
            assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-4);
        }
        assert_eq!(preds.predicted().len(), 5);
    }

    #[test]
    fn test_two_passes_average_plain_and_flipped() {
        let device = Default::default();
        let model = TrashClassifierConfig::new(3, EfficientNetConfig::tiny())
            .with_hidden(4)
            .init::<TestBackend>(&device);
        let data = dataset();

        let one = predict_tta(&model, &data, 4, 1, &device).unwrap();
        let zero = predict_tta(&model, &data, 4, 0, &device).unwrap();
        assert_eq!(one.probs, zero.probs);

        let two = predict_tta(&model, &data, 4, 2, &device).unwrap();

        let batcher = TrashBatcher::new(3, 32);
        let batch: crate::dataset::TrashBatch<TestBackend> = batcher.batch(data.items_at(&[0]), &device);
        let flipped: Vec<f32> = model.forward_probs(batch.images.flip([3])).into_data().to_vec().unwrap();
        for c in 0..3 {
            let expected = (one.probs[0][c] + flipped[c]) / 2.0;
            assert!((two.probs[0][c] - expected).abs() < 1e-4);
        }
    }
}
