//! End-to-end pipeline
//!
//! Glue between the CLI and the library: split → train → evaluate → export.
//! Every step can also run on its own from previously written artifacts.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use burn::module::AutodiffModule;
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use colored::Colorize;
use tracing::{info, warn};

use crate::dataset::split::{MANIFEST_FILE, TEST_DIR, TRAIN_DIR, VALIDATION_DIR};
use crate::dataset::{class_weights, split_directory, ImageFolder, SplitSummary, TrashDataset};
use crate::export::{export_all, load_native, ArtifactSummary};
use crate::inference::{evaluate_model, plot_training_history, write_evaluation, EvaluationReport, Predictor};
use crate::model::{PipelineConfig, TrashClassifier, TrashClassifierConfig};
use crate::training::{run_two_stage, StageData, TrainingHistory};
use crate::utils::format_duration;

/// Subdirectory of the work dir holding the split
pub const SPLIT_SUBDIR: &str = "split";
/// Subdirectory of the work dir holding checkpoints, reports and exports
pub const ARTIFACTS_SUBDIR: &str = "artifacts";

/// The three splits of a split directory, decoded into memory
pub struct SplitData {
    pub classes: Vec<String>,
    pub train_folder: ImageFolder,
    pub train: TrashDataset,
    pub validation: TrashDataset,
    pub test: TrashDataset,
}

/// A trained model moved off the autodiff backend
pub struct TrainedModel<B: Backend> {
    pub model: TrashClassifier<B>,
    pub model_config: TrashClassifierConfig,
    pub history: TrainingHistory,
}

/// Default configuration, or the JSON file at `path`
pub fn load_pipeline_config(path: Option<&Path>) -> Result<PipelineConfig> {
    let config = match path {
        Some(p) => PipelineConfig::load(p).with_context(|| format!("Failed to load config {:?}", p))?,
        None => PipelineConfig::default(),
    };
    config.validate().context("Invalid pipeline configuration")?;
    Ok(config)
}

/// Split `source` into `dest` and print the per-class counts
pub fn split(source: &Path, dest: &Path, config: &PipelineConfig) -> Result<SplitSummary> {
    if !source.is_dir() {
        bail!("Source directory not found: {:?}", source);
    }
    let summary = split_directory(source, dest, &config.split)
        .with_context(|| format!("Failed to split {:?} into {:?}", source, dest))?;
    summary.print();
    println!(
        "{} {:?}",
        "Manifest written to".green(),
        dest.join(MANIFEST_FILE)
    );
    Ok(summary)
}

/// Load `train/`, `validation/` and `test/` with the training class order
pub fn load_splits(data_dir: &Path, image_size: usize) -> Result<SplitData> {
    let train_folder = ImageFolder::discover(data_dir.join(TRAIN_DIR))
        .with_context(|| format!("Failed to read training split in {:?}", data_dir))?;
    if train_folder.is_empty() {
        bail!("Training split in {:?} contains no images", data_dir);
    }
    let classes = train_folder.classes.clone();

    let load = |name: &str| -> Result<TrashDataset> {
        let folder = ImageFolder::new(data_dir.join(name), &classes)
            .with_context(|| format!("Failed to read {} split in {:?}", name, data_dir))?;
        TrashDataset::from_folder(&folder, image_size).with_context(|| format!("Failed to decode {} images", name))
    };

    println!("{}", "Loading images...".cyan());
    let train = TrashDataset::from_folder(&train_folder, image_size).context("Failed to decode train images")?;
    let validation = load(VALIDATION_DIR)?;
    let test = load(TEST_DIR)?;

    info!(
        "Loaded {} train / {} validation / {} test images over {} classes",
        burn::data::dataset::Dataset::len(&train),
        burn::data::dataset::Dataset::len(&validation),
        burn::data::dataset::Dataset::len(&test),
        classes.len()
    );

    Ok(SplitData {
        classes,
        train_folder,
        train,
        validation,
        test,
    })
}

/// Two-stage training; returns the best model on the inner backend
pub fn train<B: AutodiffBackend>(
    config: &PipelineConfig,
    data: &SplitData,
    backbone_weights: Option<&Path>,
    output_dir: &Path,
    device: &B::Device,
) -> Result<TrainedModel<B::InnerBackend>> {
    let counts = data.train_folder.class_counts();
    let weights = class_weights(&counts, config.class_weight_clip);
    for ((name, count), w) in data.classes.iter().zip(&counts).zip(&weights) {
        info!("class {:<16} {:>5} images, weight {:.3}", name, count, w);
    }

    let stage_data = StageData {
        train: &data.train,
        validation: &data.validation,
        num_classes: data.classes.len(),
        class_weights: weights,
    };

    let start = Instant::now();
    let outcome = run_two_stage::<B>(config, &stage_data, backbone_weights, output_dir, device)
        .context("Training failed")?;
    println!(
        "{} {}",
        "Training finished in".green().bold(),
        format_duration(start.elapsed().as_secs_f64())
    );

    let chart = plot_training_history(&outcome.history, output_dir).context("Failed to write accuracy chart")?;
    info!("Accuracy chart written to {:?}", chart);

    Ok(TrainedModel {
        model: outcome.model.valid(),
        model_config: config.model_config(data.classes.len()),
        history: outcome.history,
    })
}

/// Flip-averaged evaluation on `test`, writing the report into `output_dir`
pub fn evaluate<B: Backend>(
    model: &TrashClassifier<B>,
    classes: &[String],
    test: &TrashDataset,
    batch_size: usize,
    tta_passes: usize,
    output_dir: &Path,
    device: &B::Device,
) -> Result<EvaluationReport> {
    if burn::data::dataset::Dataset::len(test) == 0 {
        bail!("Test split contains no images");
    }
    println!("{}", format!("Evaluating with {} TTA passes", tta_passes.max(1)).cyan());
    let metrics = evaluate_model(model, test, classes, batch_size, tta_passes, device).context("Evaluation failed")?;
    let report = write_evaluation(&metrics, classes, tta_passes, output_dir).context("Failed to write evaluation")?;
    Ok(report)
}

/// Write every export format into `output_dir`
pub fn export<B: Backend>(
    model: &TrashClassifier<B>,
    model_config: &TrashClassifierConfig,
    classes: &[String],
    train_folder: Option<&ImageFolder>,
    config: &PipelineConfig,
    output_dir: &Path,
    device: &B::Device,
) -> Result<Vec<ArtifactSummary>> {
    println!("{}", "Exporting model...".cyan());
    let summaries = export_all(model, model_config, classes, train_folder, &config.export, output_dir, device)
        .context("Export failed")?;
    Ok(summaries)
}

/// The whole recipe: split `source` into `work/split`, then train, evaluate and
/// export into `work/artifacts`
pub fn run_pipeline<B: AutodiffBackend>(
    config: &PipelineConfig,
    source: &Path,
    work: &Path,
    backbone_weights: Option<&Path>,
    device: &B::Device,
) -> Result<PathBuf> {
    let split_dir = work.join(SPLIT_SUBDIR);
    let artifacts = work.join(ARTIFACTS_SUBDIR);
    std::fs::create_dir_all(&artifacts).with_context(|| format!("Failed to create {:?}", artifacts))?;
    config
        .save(&artifacts.join("pipeline_config.json"))
        .context("Failed to save pipeline configuration")?;

    println!("{}", "[1/4] Splitting dataset".green().bold());
    split(source, &split_dir, config)?;

    println!("\n{}", "[2/4] Training".green().bold());
    let data = load_splits(&split_dir, config.image_size)?;
    let trained = train::<B>(config, &data, backbone_weights, &artifacts, device)?;

    println!("\n{}", "[3/4] Evaluating on test split".green().bold());
    evaluate(
        &trained.model,
        &data.classes,
        &data.test,
        config.batch_size,
        config.tta.passes,
        &artifacts,
        device,
    )?;

    println!("\n{}", "[4/4] Exporting".green().bold());
    export(
        &trained.model,
        &trained.model_config,
        &data.classes,
        Some(&data.train_folder),
        config,
        &artifacts,
        device,
    )?;

    println!("\n{} {:?}", "All artifacts written to".green().bold(), artifacts);
    Ok(artifacts)
}

/// Evaluate saved native model files against `data_dir/test`
pub fn evaluate_saved<B: Backend>(
    data_dir: &Path,
    model_path: &Path,
    labels_path: &Path,
    config: &PipelineConfig,
    tta_passes: usize,
    device: &B::Device,
) -> Result<EvaluationReport> {
    let (model, labels, model_config) =
        load_native::<B>(model_path, labels_path, device).context("Failed to load model")?;
    let folder = ImageFolder::new(data_dir.join(TEST_DIR), &labels)
        .with_context(|| format!("Failed to read test split in {:?}", data_dir))?;
    let test = TrashDataset::from_folder(&folder, model_config.image_size).context("Failed to decode test images")?;

    let output_dir = model_path.parent().unwrap_or_else(|| Path::new("."));
    evaluate(&model, &labels, &test, config.batch_size, tta_passes, output_dir, device)
}

/// Re-export saved native model files; the train split is the calibration source
pub fn export_saved<B: Backend>(
    model_path: &Path,
    labels_path: &Path,
    data_dir: &Path,
    output_dir: &Path,
    config: &PipelineConfig,
    device: &B::Device,
) -> Result<Vec<ArtifactSummary>> {
    let (model, labels, model_config) =
        load_native::<B>(model_path, labels_path, device).context("Failed to load model")?;

    let train_folder = match ImageFolder::new(data_dir.join(TRAIN_DIR), &labels) {
        Ok(folder) => Some(folder),
        Err(e) => {
            warn!("No calibration images available ({}); INT8 export will be skipped", e);
            None
        }
    };

    export(&model, &model_config, &labels, train_folder.as_ref(), config, output_dir, device)
}

/// Classify one image and print the ranked scores
pub fn infer<B: Backend>(model_path: &Path, labels_path: &Path, input: &Path, device: &B::Device) -> Result<()> {
    if !input.exists() {
        bail!("Input image not found: {:?}", input);
    }
    let predictor = Predictor::<B>::load(model_path, labels_path, device).context("Failed to load model")?;
    let prediction = predictor
        .predict(input)
        .with_context(|| format!("Failed to classify {:?}", input))?;

    println!("{}", prediction.display(5));
    println!(
        "{} {} ({:.1}%)",
        "Result:".green().bold(),
        prediction.class_name.yellow().bold(),
        prediction.confidence * 100.0
    );
    Ok(())
}

/// Print class statistics for a split directory or a plain class folder
pub fn stats(data_dir: &Path) -> Result<()> {
    if !data_dir.is_dir() {
        bail!("Data directory not found: {:?}", data_dir);
    }

    let manifest = data_dir.join(MANIFEST_FILE);
    if manifest.exists() {
        let summary = SplitSummary::load(&manifest).context("Failed to read split manifest")?;
        summary.print();
        return Ok(());
    }

    let train_dir = data_dir.join(TRAIN_DIR);
    if train_dir.is_dir() {
        for name in [TRAIN_DIR, VALIDATION_DIR, TEST_DIR] {
            let dir = data_dir.join(name);
            if dir.is_dir() {
                ImageFolder::discover(&dir)
                    .with_context(|| format!("Failed to read {:?}", dir))?
                    .stats()
                    .print();
            }
        }
    } else {
        ImageFolder::discover(data_dir)
            .with_context(|| format!("Failed to read {:?}", data_dir))?
            .stats()
            .print();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::{LABELS_FILE, MODEL_FILE, ONNX_FILE};
    use crate::inference::evaluate::REPORT_FILE;
    use crate::model::{BackboneKind, StageConfig};
    use crate::training::HISTORY_FILE;
    use burn::backend::Autodiff;
    use burn_ndarray::NdArray;
    use image::{Rgb, RgbImage};

    type TestBackend = Autodiff<NdArray<f32>>;

    fn tiny_config() -> PipelineConfig {
        let mut config = PipelineConfig {
            image_size: 32,
            batch_size: 4,
            backbone: BackboneKind::Tiny,
            fine_tune_at: 2,
            ..PipelineConfig::default()
        };
        config.head.hidden = 4;
        config.stage1 = StageConfig {
            epochs: 1,
            ..StageConfig::stage1()
        };
        config.stage2 = StageConfig {
            epochs: 1,
            ..StageConfig::stage2()
        };
        config.tta.passes = 2;
        config.export.representative_per_class = 2;
        config
    }

    fn make_source(root: &Path) {
        for (c, class) in ["glass", "paper"].iter().enumerate() {
            let dir = root.join(class);
            std::fs::create_dir_all(&dir).unwrap();
            for i in 0..8 {
                let shade = (c * 150 + i * 10) as u8;
                RgbImage::from_pixel(40, 36, Rgb([shade, 255 - shade, 90]))
                    .save(dir.join(format!("{}_{}.png", class, i)))
                    .unwrap();
            }
        }
    }

    #[test]
    fn test_load_pipeline_config_default_and_file() {
        let config = load_pipeline_config(None).unwrap();
        assert_eq!(config.batch_size, 32);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        tiny_config().save(&path).unwrap();
        assert_eq!(load_pipeline_config(Some(&path)).unwrap().image_size, 32);

        assert!(load_pipeline_config(Some(&dir.path().join("missing.json"))).is_err());
    }

    #[test]
    fn test_stats_reports_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(stats(&dir.path().join("nope")).is_err());
        make_source(dir.path());
        assert!(stats(dir.path()).is_ok());
    }

    #[test]
    fn test_run_pipeline_writes_all_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source");
        make_source(&source);
        let work = dir.path().join("work");
        let device = Default::default();
        let config = tiny_config();

        let artifacts = run_pipeline::<TestBackend>(&config, &source, &work, None, &device).unwrap();

        for file in [HISTORY_FILE, REPORT_FILE, MODEL_FILE, LABELS_FILE, ONNX_FILE] {
            assert!(artifacts.join(file).exists(), "missing {}", file);
        }
        assert!(work.join(SPLIT_SUBDIR).join(MANIFEST_FILE).exists());

        let report = evaluate_saved::<NdArray<f32>>(
            &work.join(SPLIT_SUBDIR),
            &artifacts.join(MODEL_FILE),
            &artifacts.join(LABELS_FILE),
            &config,
            1,
            &device,
        )
        .unwrap();
        assert_eq!(report.per_class.len(), 2);

        let image = source.join("glass").join("glass_0.png");
        infer::<NdArray<f32>>(&artifacts.join(MODEL_FILE), &artifacts.join(LABELS_FILE), &image, &device).unwrap();
    }
}
