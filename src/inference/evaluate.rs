//! Test-set evaluation
//!
//! Runs flip-averaged predictions over the test split, prints the
//! classification report and writes the report, confusion matrix and charts.

use std::path::{Path, PathBuf};

use burn::{data::dataset::Dataset, prelude::*};
use chrono::{DateTime, Local};
use colored::Colorize;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::tta::predict_tta;
use crate::dataset::TrashDataset;
use crate::model::TrashClassifier;
use crate::training::TrainingHistory;
use crate::utils::charts::{
    generate_confusion_heatmap, generate_line_chart, DataSeries, Marker, COLOR_PRIMARY, COLOR_SECONDARY,
};
use crate::utils::error::{Result, TrashSortError};
use crate::utils::metrics::{ClassMetrics, Metrics};

pub const REPORT_FILE: &str = "evaluation_report.json";
pub const CONFUSION_CSV_FILE: &str = "confusion_matrix.csv";
pub const CONFUSION_SVG_FILE: &str = "confusion_matrix.svg";
pub const HISTORY_CHART_FILE: &str = "training_accuracy.svg";

/// Summary of a test-set evaluation, saved as JSON
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub created_at: DateTime<Local>,
    pub num_samples: usize,
    pub test_accuracy: f64,
    pub macro_f1: f64,
    pub weighted_f1: f64,
    pub tta_passes: usize,
    pub per_class: Vec<ClassMetrics>,
}

impl EvaluationReport {
    pub fn from_metrics(metrics: &Metrics, tta_passes: usize) -> Self {
        Self {
            created_at: Local::now(),
            num_samples: metrics.total_samples,
            test_accuracy: metrics.accuracy,
            macro_f1: metrics.macro_f1,
            weighted_f1: metrics.weighted_f1,
            tta_passes,
            per_class: metrics.per_class.clone(),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?)
    }
}

/// Evaluate `model` on `dataset` with `tta_passes` flip-averaged passes
pub fn evaluate_model<B: Backend>(
    model: &TrashClassifier<B>,
    dataset: &TrashDataset,
    class_names: &[String],
    batch_size: usize,
    tta_passes: usize,
    device: &B::Device,
) -> Result<Metrics> {
    if class_names.len() != model.num_classes() {
        return Err(TrashSortError::Inference(format!(
            "model has {} outputs but {} class names were given",
            model.num_classes(),
            class_names.len()
        )));
    }

    info!("Evaluating {} test images with {} TTA passes", dataset.len(), tta_passes.max(1));
    let predictions = predict_tta(model, dataset, batch_size, tta_passes, device)?;
    let metrics = Metrics::from_predictions(&predictions.predicted(), &predictions.labels, class_names.len())
        .with_class_names(class_names);

    Ok(metrics)
}

/// Print the report and confusion matrix, then write the JSON report, CSV and heatmap
pub fn write_evaluation(
    metrics: &Metrics,
    class_names: &[String],
    tta_passes: usize,
    output_dir: &Path,
) -> Result<EvaluationReport> {
    std::fs::create_dir_all(output_dir)?;

    println!("\n{}", "Classification report".green().bold());
    println!("{}", metrics.classification_report());
    println!("{}", metrics.confusion_matrix.display(Some(class_names)));
    println!(
        "Test accuracy: {}   Weighted F1: {}",
        format!("{:.2}%", metrics.accuracy * 100.0).green().bold(),
        format!("{:.4}", metrics.weighted_f1).green().bold()
    );

    let report = EvaluationReport::from_metrics(metrics, tta_passes.max(1));
    report.save(&output_dir.join(REPORT_FILE))?;

    metrics
        .confusion_matrix
        .save_csv(&output_dir.join(CONFUSION_CSV_FILE), Some(class_names))?;

    let cm = &metrics.confusion_matrix;
    let counts: Vec<Vec<usize>> = (0..cm.num_classes)
        .map(|row| (0..cm.num_classes).map(|col| cm.get(row, col)).collect())
        .collect();
    generate_confusion_heatmap(
        "Confusion Matrix (test, TTA)",
        class_names,
        &counts,
        &cm.normalize_rows(),
        &output_dir.join(CONFUSION_SVG_FILE),
    )?;

    info!("Evaluation artifacts written to {:?}", output_dir);
    Ok(report)
}

/// Accuracy chart over both stages with a marker where fine-tuning starts
pub fn plot_training_history(history: &TrainingHistory, output_dir: &Path) -> Result<PathBuf> {
    let epochs = history.concatenated();
    let train: Vec<f64> = epochs.iter().map(|e| e.train_accuracy).collect();
    let val: Vec<f64> = epochs.iter().map(|e| e.val_accuracy).collect();

    let markers: Vec<Marker> = history
        .stage_boundaries()
        .into_iter()
        .map(|b| Marker {
            x: b as f64 + 0.5,
            label: "fine-tune".to_string(),
        })
        .collect();

    std::fs::create_dir_all(output_dir)?;
    let path = output_dir.join(HISTORY_CHART_FILE);
    generate_line_chart(
        "Training Accuracy (frozen + fine-tune)",
        "Epoch",
        "Accuracy (%)",
        &[
            DataSeries::from_fractions("train_acc", &train, COLOR_PRIMARY),
            DataSeries::from_fractions("val_acc", &val, COLOR_SECONDARY),
        ],
        &markers,
        &path,
    )?;
    Ok(path)
}
