//! Train / validation / test directory split
//!
//! Copies a class-per-directory source tree into
//!
//! ```text
//! dest/
//! ├── train/<class>/...
//! ├── validation/<class>/...
//! ├── test/<class>/...
//! └── split_manifest.json
//! ```
//!
//! Each class is split independently: its files are sorted, shuffled with a
//! seeded ChaCha8 RNG and cut at `floor(train * n)` and
//! `floor(train * n) + floor(validation * n)`. The remainder is the test set.
//! Any previous `dest` is removed first so stale files never mix in.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::dataset::loader::list_class_dirs;
use crate::utils::error::{Result, TrashSortError};

/// Names of the split subdirectories
pub const TRAIN_DIR: &str = "train";
pub const VALIDATION_DIR: &str = "validation";
pub const TEST_DIR: &str = "test";

/// Manifest written next to the split
pub const MANIFEST_FILE: &str = "split_manifest.json";

/// Configuration for dataset splitting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitConfig {
    /// Fraction of each class copied to `train/`
    pub train_fraction: f64,
    /// Fraction of each class copied to `validation/`
    pub validation_fraction: f64,
    /// Random seed for reproducibility
    pub seed: u64,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            train_fraction: 0.70,
            validation_fraction: 0.15,
            seed: 42,
        }
    }
}

impl SplitConfig {
    /// Create a validated split configuration
    pub fn new(train_fraction: f64, validation_fraction: f64, seed: u64) -> Result<Self> {
        let config = Self {
            train_fraction,
            validation_fraction,
            seed,
        };
        config.validate()?;
        Ok(config)
    }

    /// Test fraction implied by the other two
    pub fn test_fraction(&self) -> f64 {
        (1.0 - self.train_fraction - self.validation_fraction).max(0.0)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("train", self.train_fraction),
            ("validation", self.validation_fraction),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(TrashSortError::Config(format!(
                    "{} fraction must be between 0.0 and 1.0, got {}",
                    name, value
                )));
            }
        }

        if self.train_fraction + self.validation_fraction > 1.0 + 1e-9 {
            return Err(TrashSortError::Config(
                "train + validation fractions must not exceed 1.0".to_string(),
            ));
        }

        Ok(())
    }

    /// Cut points `(a, b)` for a class with `n` files
    pub fn cut_points(&self, n: usize) -> (usize, usize) {
        let a = (self.train_fraction * n as f64).floor() as usize;
        let b = a + (self.validation_fraction * n as f64).floor() as usize;
        (a.min(n), b.min(n))
    }
}

/// Per-class file counts of a finished split
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClassSplitCounts {
    pub train: usize,
    pub validation: usize,
    pub test: usize,
}

impl ClassSplitCounts {
    pub fn total(&self) -> usize {
        self.train + self.validation + self.test
    }
}

/// Summary of a split, persisted as `split_manifest.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitSummary {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub config: SplitConfig,
    pub created_at: DateTime<Local>,
    pub classes: BTreeMap<String, ClassSplitCounts>,
}

impl SplitSummary {
    pub fn totals(&self) -> ClassSplitCounts {
        self.classes.values().fold(ClassSplitCounts::default(), |acc, c| ClassSplitCounts {
            train: acc.train + c.train,
            validation: acc.validation + c.validation,
            test: acc.test + c.test,
        })
    }

    /// Load a previously written manifest
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn print(&self) {
        println!("{}", "Split summary:".cyan().bold());
        println!(
            "  {:24} {:>7} {:>10} {:>6}",
            "class", "train", "validation", "test"
        );
        for (name, c) in &self.classes {
            println!("  {:24} {:>7} {:>10} {:>6}", name, c.train, c.validation, c.test);
        }
        let t = self.totals();
        println!(
            "  {:24} {:>7} {:>10} {:>6}",
            "total",
            t.train,
            t.validation,
            t.test
        );
    }
}

/// Regular files directly inside `dir`, sorted by name
fn list_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

/// Split `source` into `dest/{train,validation,test}/<class>` by copying files
pub fn split_directory(source: &Path, dest: &Path, config: &SplitConfig) -> Result<SplitSummary> {
    config.validate()?;

    let classes = list_class_dirs(source)?;
    if classes.is_empty() {
        return Err(TrashSortError::Dataset(format!(
            "source {:?} contains no class directories",
            source
        )));
    }
    info!("Splitting {} classes from {:?} into {:?}", classes.len(), source, dest);

    if dest.exists() {
        warn!("Removing existing split at {:?}", dest);
        fs::remove_dir_all(dest)?;
    }

    for split in [TRAIN_DIR, VALIDATION_DIR, TEST_DIR] {
        for class in &classes {
            fs::create_dir_all(dest.join(split).join(class))?;
        }
    }

    let mut plan: Vec<(PathBuf, PathBuf)> = Vec::new();
    let mut counts = BTreeMap::new();
    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);

    for class in &classes {
        let mut files = list_files(&source.join(class))?;
        files.shuffle(&mut rng);

        let (a, b) = config.cut_points(files.len());
        for (i, file) in files.iter().enumerate() {
            let split = if i < a {
                TRAIN_DIR
            } else if i < b {
                VALIDATION_DIR
            } else {
                TEST_DIR
            };
            if let Some(name) = file.file_name() {
                plan.push((file.clone(), dest.join(split).join(class).join(name)));
            }
        }

        counts.insert(
            class.clone(),
            ClassSplitCounts {
                train: a,
                validation: b - a,
                test: files.len() - b,
            },
        );
    }

    let pb = ProgressBar::new(plan.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("  {spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} files")
            .map_err(|e| TrashSortError::Dataset(e.to_string()))?
            .progress_chars("#>-"),
    );
    for (from, to) in &plan {
        fs::copy(from, to)?;
        pb.inc(1);
    }
    pb.finish_and_clear();

    let summary = SplitSummary {
        source: source.to_path_buf(),
        destination: dest.to_path_buf(),
        config: config.clone(),
        created_at: Local::now(),
        classes: counts,
    };
    summary.save(&dest.join(MANIFEST_FILE))?;

    let totals = summary.totals();
    info!(
        "Split done: {} train / {} validation / {} test files",
        totals.train, totals.validation, totals.test
    );

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_source(root: &Path, classes: &[(&str, usize)]) {
        for (class, n) in classes {
            let dir = root.join(class);
            fs::create_dir_all(&dir).unwrap();
            for i in 0..*n {
                fs::write(dir.join(format!("img_{:03}.jpg", i)), format!("{}-{}", class, i)).unwrap();
            }
        }
    }

    #[test]
    fn test_cut_points_floor() {
        let config = SplitConfig::default();
        assert_eq!(config.cut_points(10), (7, 8));
        assert_eq!(config.cut_points(3), (2, 2));
        assert_eq!(config.cut_points(0), (0, 0));
        assert_eq!(config.cut_points(100), (70, 85));
    }

    #[test]
    fn test_invalid_config() {
        assert!(SplitConfig::new(0.9, 0.2, 1).is_err());
        assert!(SplitConfig::new(-0.1, 0.2, 1).is_err());
        assert!(SplitConfig::new(0.8, 0.2, 1).is_ok());
    }

    #[test]
    fn test_split_copies_every_file_once() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("source");
        let dest = tmp.path().join("split");
        make_source(&source, &[("glass", 20), ("paper", 7), ("trash", 3)]);

        let summary = split_directory(&source, &dest, &SplitConfig::default()).unwrap();

        assert_eq!(summary.classes["glass"], ClassSplitCounts { train: 14, validation: 3, test: 3 });
        assert_eq!(summary.classes["paper"], ClassSplitCounts { train: 4, validation: 1, test: 2 });
        // not filtered at split time
        assert_eq!(summary.classes["trash"].total(), 3);

        let mut seen = Vec::new();
        for split in [TRAIN_DIR, VALIDATION_DIR, TEST_DIR] {
            for entry in fs::read_dir(dest.join(split).join("glass")).unwrap() {
                seen.push(entry.unwrap().file_name());
            }
        }
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 20);

        // source untouched
        assert_eq!(fs::read_dir(source.join("glass")).unwrap().count(), 20);
        assert!(dest.join(MANIFEST_FILE).exists());
        let loaded = SplitSummary::load(&dest.join(MANIFEST_FILE)).unwrap();
        assert_eq!(loaded.totals(), summary.totals());
    }

    #[test]
    fn test_split_is_deterministic_and_replaces_dest() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("source");
        make_source(&source, &[("metal", 12)]);

        let dest = tmp.path().join("split");
        fs::create_dir_all(dest.join("train/stale")).unwrap();

        split_directory(&source, &dest, &SplitConfig::default()).unwrap();
        assert!(!dest.join("train/stale").exists());
        let first = list_files(&dest.join("test/metal")).unwrap();

        split_directory(&source, &dest, &SplitConfig::default()).unwrap();
        let second = list_files(&dest.join("test/metal")).unwrap();
        assert_eq!(first, second);
    }
}
