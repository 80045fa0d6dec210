//! Dataset handling: split directories, image folders, augmentation,
//! Burn batching and MixUp.

pub mod augmentation;
pub mod burn_dataset;
pub mod loader;
pub mod mixup;
pub mod split;

pub use augmentation::{AugmentationConfig, Augmenter};
pub use burn_dataset::{
    representative_samples, AugmentingBatcher, EpochIterator, TrashBatch, TrashBatcher, TrashDataset, TrashItem,
};
pub use loader::{class_weights, discover_classes, DatasetStats, ImageFolder};
pub use mixup::{MixUp, MixUpConfig, MixedBatch};
pub use split::{split_directory, SplitConfig, SplitSummary};
