//! Burn Dataset Integration
//!
//! Implements Burn's `Dataset` and `Batcher` traits for the image folders.
//!
//! - `TrashDataset`: decoded images resized once and cached in memory
//! - `TrashBatcher`: plain batches (validation, test, calibration)
//! - `AugmentingBatcher`: applies on-the-fly augmentation (training)
//!
//! Batches carry raw 0..255 pixels; normalization lives inside the model so
//! exported graphs accept the same raw input.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::prelude::*;
use image::imageops::FilterType;
use image::{ImageReader, RgbImage};
use indicatif::{ProgressBar, ProgressStyle};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use tracing::warn;

use crate::dataset::augmentation::{to_chw_data, AugmentationConfig, Augmenter};
use crate::dataset::loader::ImageFolder;
use crate::utils::error::{Result, TrashSortError};

/// Decode an image and resize it to `image_size` x `image_size` with bilinear filtering
pub fn load_resized(path: &Path, image_size: usize) -> Result<RgbImage> {
    let img = ImageReader::open(path)
        .map_err(|e| TrashSortError::ImageLoad(path.to_path_buf(), e.to_string()))?
        .with_guessed_format()
        .map_err(|e| TrashSortError::ImageLoad(path.to_path_buf(), e.to_string()))?
        .decode()
        .map_err(|e| TrashSortError::ImageLoad(path.to_path_buf(), e.to_string()))?;

    Ok(img
        .resize_exact(image_size as u32, image_size as u32, FilterType::Triangle)
        .to_rgb8())
}

/// A single cached item
#[derive(Clone, Debug)]
pub struct TrashItem {
    /// RGB image already resized to the dataset's image size
    pub image: RgbImage,
    /// Class label
    pub label: usize,
    /// Source path (for logging)
    pub path: PathBuf,
}

/// In-memory dataset of resized images
#[derive(Clone)]
pub struct TrashDataset {
    items: Vec<TrashItem>,
    image_size: usize,
}

impl std::fmt::Debug for TrashDataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrashDataset")
            .field("len", &self.items.len())
            .field("image_size", &self.image_size)
            .finish()
    }
}

impl TrashDataset {
    /// Decode and resize every sample in parallel, skipping unreadable files
    pub fn new_cached(samples: Vec<(PathBuf, usize)>, image_size: usize) -> Result<Self> {
        let total = samples.len();
        println!("  📦 Pre-loading {} images at {}px (parallel)...", total, image_size);

        let pb = ProgressBar::new(total as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("  {spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec})")
                .map_err(|e| TrashSortError::Dataset(e.to_string()))?
                .progress_chars("#>-"),
        );

        let loaded = AtomicUsize::new(0);

        let items: Vec<TrashItem> = samples
            .par_iter()
            .filter_map(|(path, label)| {
                let result = match load_resized(path, image_size) {
                    Ok(image) => Some(TrashItem {
                        image,
                        label: *label,
                        path: path.clone(),
                    }),
                    Err(e) => {
                        warn!("Skipping unreadable image: {}", e);
                        None
                    }
                };
                let count = loaded.fetch_add(1, Ordering::Relaxed);
                if count % 100 == 0 {
                    pb.set_position(count as u64);
                }
                result
            })
            .collect();

        pb.finish_and_clear();
        println!("  ✅ Loaded {}/{} images", items.len(), total);

        Ok(Self { items, image_size })
    }

    /// Load every sample of an image folder
    pub fn from_folder(folder: &ImageFolder, image_size: usize) -> Result<Self> {
        Self::new_cached(folder.pairs(), image_size)
    }

    /// Build directly from items (tests, calibration)
    pub fn from_items(items: Vec<TrashItem>, image_size: usize) -> Self {
        Self { items, image_size }
    }

    pub fn image_size(&self) -> usize {
        self.image_size
    }

    pub fn labels(&self) -> Vec<usize> {
        self.items.iter().map(|item| item.label).collect()
    }

    /// Items at the given indices, in order
    pub fn items_at(&self, indices: &[usize]) -> Vec<TrashItem> {
        indices.iter().filter_map(|&i| self.items.get(i).cloned()).collect()
    }
}

impl Dataset<TrashItem> for TrashDataset {
    fn get(&self, index: usize) -> Option<TrashItem> {
        self.items.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

/// The first `per_class` samples of every class, in file order
pub fn representative_samples(folder: &ImageFolder, per_class: usize) -> Vec<(PathBuf, usize)> {
    let mut taken = vec![0usize; folder.num_classes()];
    folder
        .samples
        .iter()
        .filter(|s| {
            let keep = taken[s.label] < per_class;
            taken[s.label] += 1;
            keep
        })
        .map(|s| (s.path.clone(), s.label))
        .collect()
}

/// Batch index lists for one epoch
pub struct EpochIterator {
    indices: Vec<usize>,
    batch_size: usize,
    position: usize,
}

impl EpochIterator {
    /// Shuffled order, for training
    pub fn shuffled(len: usize, batch_size: usize, rng: &mut ChaCha8Rng) -> Self {
        let mut indices: Vec<usize> = (0..len).collect();
        indices.shuffle(rng);
        Self {
            indices,
            batch_size: batch_size.max(1),
            position: 0,
        }
    }

    /// Dataset order, for evaluation
    pub fn sequential(len: usize, batch_size: usize) -> Self {
        Self {
            indices: (0..len).collect(),
            batch_size: batch_size.max(1),
            position: 0,
        }
    }

    /// Number of batches per epoch (last batch may be partial)
    pub fn num_batches(&self) -> usize {
        self.indices.len().div_ceil(self.batch_size)
    }
}

impl Iterator for EpochIterator {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.indices.len() {
            return None;
        }
        let end = (self.position + self.batch_size).min(self.indices.len());
        let batch = self.indices[self.position..end].to_vec();
        self.position = end;
        Some(batch)
    }
}

/// A batch of images for training or evaluation
#[derive(Clone, Debug)]
pub struct TrashBatch<B: Backend> {
    /// Raw 0..255 images with shape [batch_size, 3, height, width]
    pub images: Tensor<B, 4>,
    /// Class labels with shape [batch_size]
    pub targets: Tensor<B, 1, Int>,
    /// One-hot (or mixed) label distribution with shape [batch_size, num_classes]
    pub soft_targets: Tensor<B, 2>,
}

fn one_hot_data(labels: &[usize], num_classes: usize) -> Vec<f32> {
    let mut data = vec![0.0f32; labels.len() * num_classes];
    for (row, &label) in labels.iter().enumerate() {
        if label < num_classes {
            data[row * num_classes + label] = 1.0;
        }
    }
    data
}

fn build_batch<B: Backend>(
    images_data: Vec<f32>,
    labels: &[usize],
    num_classes: usize,
    image_size: usize,
    device: &B::Device,
) -> TrashBatch<B> {
    let batch_size = labels.len();

    let images = Tensor::<B, 4>::from_floats(
        TensorData::new(images_data, [batch_size, 3, image_size, image_size]),
        device,
    );

    let targets_data: Vec<i64> = labels.iter().map(|&l| l as i64).collect();
    let targets = Tensor::<B, 1, Int>::from_data(TensorData::new(targets_data, [batch_size]), device);

    let soft_targets = Tensor::<B, 2>::from_floats(
        TensorData::new(one_hot_data(labels, num_classes), [batch_size, num_classes]),
        device,
    );

    TrashBatch {
        images,
        targets,
        soft_targets,
    }
}

/// Batcher without augmentation
#[derive(Clone, Debug)]
pub struct TrashBatcher {
    num_classes: usize,
    image_size: usize,
}

impl TrashBatcher {
    pub fn new(num_classes: usize, image_size: usize) -> Self {
        Self {
            num_classes,
            image_size,
        }
    }
}

impl<B: Backend> Batcher<B, TrashItem, TrashBatch<B>> for TrashBatcher {
    fn batch(&self, items: Vec<TrashItem>, device: &B::Device) -> TrashBatch<B> {
        let labels: Vec<usize> = items.iter().map(|item| item.label).collect();
        let images_data: Vec<f32> = items.iter().flat_map(|item| to_chw_data(&item.image)).collect();

        build_batch(images_data, &labels, self.num_classes, self.image_size, device)
    }
}

/// Batcher that applies on-the-fly augmentation
///
/// Each call derives a fresh ChaCha8 stream from the base seed and a batch
/// counter, so a run is reproducible without sharing an RNG across threads.
pub struct AugmentingBatcher {
    num_classes: usize,
    image_size: usize,
    augmenter: Augmenter,
    seed: u64,
    batch_counter: AtomicU64,
}

impl std::fmt::Debug for AugmentingBatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AugmentingBatcher")
            .field("num_classes", &self.num_classes)
            .field("image_size", &self.image_size)
            .field("seed", &self.seed)
            .finish()
    }
}

impl Clone for AugmentingBatcher {
    fn clone(&self) -> Self {
        Self {
            num_classes: self.num_classes,
            image_size: self.image_size,
            augmenter: self.augmenter.clone(),
            seed: self.seed,
            batch_counter: AtomicU64::new(self.batch_counter.load(Ordering::Relaxed)),
        }
    }
}

impl AugmentingBatcher {
    pub fn new(num_classes: usize, image_size: usize, config: AugmentationConfig, seed: u64) -> Self {
        Self {
            num_classes,
            image_size,
            augmenter: Augmenter::new(config),
            seed,
            batch_counter: AtomicU64::new(0),
        }
    }
}

impl<B: Backend> Batcher<B, TrashItem, TrashBatch<B>> for AugmentingBatcher {
    fn batch(&self, items: Vec<TrashItem>, device: &B::Device) -> TrashBatch<B> {
        let batch_idx = self.batch_counter.fetch_add(1, Ordering::Relaxed);
        let batch_seed = self
            .seed
            .wrapping_mul(0x9E37_79B9_7F4A_7C15)
            .wrapping_add(batch_idx);

        // one stream per item keeps the parallel map deterministic
        let images_data: Vec<f32> = items
            .par_iter()
            .enumerate()
            .flat_map_iter(|(i, item)| {
                let mut rng = ChaCha8Rng::seed_from_u64(batch_seed ^ ((i as u64) << 32));
                to_chw_data(&self.augmenter.augment(&item.image, &mut rng))
            })
            .collect();

        let labels: Vec<usize> = items.iter().map(|item| item.label).collect();
        build_batch(images_data, &labels, self.num_classes, self.image_size, device)
    }
}
