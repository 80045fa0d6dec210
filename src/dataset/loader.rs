//! Image folder loader
//!
//! Discovers classes and image files in a class-per-directory split
//! (`train/`, `validation/` or `test/`) and derives the balancing class weights.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::utils::error::{Result, TrashSortError};
use crate::utils::format_number;

/// File extensions accepted as images
pub const IMAGE_EXTENSIONS: [&str; 7] = ["png", "jpg", "jpeg", "bmp", "ppm", "tif", "tiff"];

/// Class directories starting with this prefix are not trained on
pub const EXCLUDED_CLASS_PREFIX: &str = "trash";

/// A single image sample with its label
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageSample {
    /// Path to the image file
    pub path: PathBuf,
    /// Class label index
    pub label: usize,
}

/// Returns true if the path has one of the accepted image extensions
pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false)
}

/// Sorted subdirectory names of `dir`
pub fn list_class_dirs(dir: &Path) -> Result<Vec<String>> {
    if !dir.is_dir() {
        return Err(TrashSortError::PathNotFound(dir.to_path_buf()));
    }

    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
    }
    names.sort();

    Ok(names)
}

/// Sorted class names of a split directory, without the excluded `trash*` classes
pub fn discover_classes(dir: &Path) -> Result<Vec<String>> {
    let classes: Vec<String> = list_class_dirs(dir)?
        .into_iter()
        .filter(|name| !name.starts_with(EXCLUDED_CLASS_PREFIX))
        .collect();

    if classes.is_empty() {
        return Err(TrashSortError::Dataset(format!(
            "no class directories found in {:?}",
            dir
        )));
    }

    info!("Found {} classes: {:?}", classes.len(), classes);
    Ok(classes)
}

/// Sorted image files directly inside `dir`
pub fn list_images(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| is_image_file(p))
        .collect();
    files.sort();
    files
}

/// A split directory resolved against a fixed class list
#[derive(Debug, Clone)]
pub struct ImageFolder {
    /// Root of the split
    pub root_dir: PathBuf,
    /// Class names, index = label
    pub classes: Vec<String>,
    /// All samples, grouped by class in class order
    pub samples: Vec<ImageSample>,
}

impl ImageFolder {
    /// Load a split using the given class list
    ///
    /// A class missing from this split simply contributes zero samples, so
    /// validation and test folders always share the training label indices.
    pub fn new<P: AsRef<Path>>(root_dir: P, classes: &[String]) -> Result<Self> {
        let root_dir = root_dir.as_ref().to_path_buf();
        if !root_dir.is_dir() {
            return Err(TrashSortError::PathNotFound(root_dir));
        }

        let mut samples = Vec::new();
        for (label, class_name) in classes.iter().enumerate() {
            let files = list_images(&root_dir.join(class_name));
            debug!("{:?}/{}: {} images", root_dir, class_name, files.len());
            samples.extend(files.into_iter().map(|path| ImageSample { path, label }));
        }

        info!("Loaded {} samples from {:?}", samples.len(), root_dir);

        Ok(Self {
            root_dir,
            classes: classes.to_vec(),
            samples,
        })
    }

    /// Discover classes in `root_dir` and load it
    pub fn discover<P: AsRef<Path>>(root_dir: P) -> Result<Self> {
        let classes = discover_classes(root_dir.as_ref())?;
        Self::new(root_dir, &classes)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    /// Number of samples per class, in class order
    pub fn class_counts(&self) -> Vec<usize> {
        let mut counts = vec![0usize; self.num_classes()];
        for sample in &self.samples {
            counts[sample.label] += 1;
        }
        counts
    }

    /// (path, label) pairs for the Burn dataset
    pub fn pairs(&self) -> Vec<(PathBuf, usize)> {
        self.samples
            .iter()
            .map(|s| (s.path.clone(), s.label))
            .collect()
    }

    pub fn stats(&self) -> DatasetStats {
        DatasetStats {
            root_dir: self.root_dir.clone(),
            total_samples: self.len(),
            class_names: self.classes.clone(),
            class_counts: self.class_counts(),
        }
    }
}

/// Inverse-frequency class weights: `total / (C * max(1, count))`, clipped
pub fn class_weights(counts: &[usize], clip: (f32, f32)) -> Vec<f32> {
    let total: usize = counts.iter().sum();
    let num_classes = counts.len().max(1) as f32;

    counts
        .iter()
        .map(|&c| {
            let w = total as f32 / (num_classes * c.max(1) as f32);
            w.clamp(clip.0, clip.1)
        })
        .collect()
}

/// Statistics about a split directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetStats {
    pub root_dir: PathBuf,
    pub total_samples: usize,
    pub class_names: Vec<String>,
    pub class_counts: Vec<usize>,
}

impl DatasetStats {
    /// Print statistics to console
    pub fn print(&self) {
        println!("\n📊 Dataset Statistics: {:?}", self.root_dir);
        println!("  Total samples: {}", format_number(self.total_samples));
        println!("  Number of classes: {}", self.class_names.len());
        println!("\n  Samples per class:");

        for (idx, (name, count)) in self.class_names.iter().zip(&self.class_counts).enumerate() {
            let bar_len = if self.total_samples > 0 {
                (*count as f32 / self.total_samples as f32 * 40.0) as usize
            } else {
                0
            };
            println!("    {:3}. {:24} {:5} {}", idx, name, count, "█".repeat(bar_len));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"x").unwrap();
    }

    #[test]
    fn test_discover_classes_sorted_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["plastic", "glass", "trash", "trash_misc", "cardboard"] {
            fs::create_dir_all(dir.path().join(name)).unwrap();
        }
        fs::write(dir.path().join("README.txt"), b"not a class").unwrap();

        let classes = discover_classes(dir.path()).unwrap();
        assert_eq!(classes, vec!["cardboard", "glass", "plastic"]);
    }

    #[test]
    fn test_discover_classes_empty_is_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("trash")).unwrap();
        assert!(discover_classes(dir.path()).is_err());
        assert!(discover_classes(&dir.path().join("missing")).is_err());
    }

    #[test]
    fn test_image_folder_labels_and_extensions() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("glass/b.jpg"));
        touch(&dir.path().join("glass/a.PNG"));
        touch(&dir.path().join("glass/notes.txt"));
        touch(&dir.path().join("metal/c.tiff"));

        let classes = vec!["glass".to_string(), "metal".to_string(), "paper".to_string()];
        let folder = ImageFolder::new(dir.path(), &classes).unwrap();

        assert_eq!(folder.len(), 3);
        assert_eq!(folder.class_counts(), vec![2, 1, 0]);
        assert!(folder.samples[0].path.ends_with("a.PNG"));
        assert_eq!(folder.samples[2].label, 1);
    }

    #[test]
    fn test_class_weights_formula_and_clip() {
        // total 100, C = 3
        let weights = class_weights(&[50, 40, 10], (0.7, 1.6));
        assert!((weights[0] - 0.7).abs() < 1e-6); // 0.667 clipped up
        assert!((weights[1] - 100.0 / 120.0).abs() < 1e-6);
        assert!((weights[2] - 1.6).abs() < 1e-6); // 3.33 clipped down
    }

    #[test]
    fn test_class_weights_empty_class() {
        let weights = class_weights(&[10, 0], (0.0, 100.0));
        assert!((weights[1] - 5.0).abs() < 1e-6);
    }
}
