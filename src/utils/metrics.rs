//! Metrics Module for Model Evaluation
//!
//! Accuracy, per-class precision/recall/F1, weighted F1 and the confusion
//! matrix, plus an sklearn-style text classification report.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Evaluation metrics over a labelled set
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metrics {
    /// Total number of samples evaluated
    pub total_samples: usize,

    /// Number of correct predictions
    pub correct_predictions: usize,

    /// Overall accuracy (correct / total)
    pub accuracy: f64,

    /// Macro-averaged precision over all classes; a class without support
    /// counts as 0, as in scikit-learn
    pub macro_precision: f64,

    /// Macro-averaged recall
    pub macro_recall: f64,

    /// Macro-averaged F1-score
    pub macro_f1: f64,

    /// Support-weighted precision
    pub weighted_precision: f64,

    /// Support-weighted recall
    pub weighted_recall: f64,

    /// Support-weighted F1-score
    pub weighted_f1: f64,

    /// Per-class metrics
    pub per_class: Vec<ClassMetrics>,

    /// Confusion matrix
    pub confusion_matrix: ConfusionMatrix,
}

impl Metrics {
    /// Build metrics from predicted and true class indices
    pub fn from_predictions(
        predictions: &[usize],
        ground_truth: &[usize],
        num_classes: usize,
    ) -> Self {
        debug_assert_eq!(predictions.len(), ground_truth.len());

        let total_samples = predictions.len().min(ground_truth.len());
        if total_samples == 0 {
            return Self {
                confusion_matrix: ConfusionMatrix::new(num_classes),
                ..Self::default()
            };
        }

        let confusion_matrix =
            ConfusionMatrix::from_predictions(predictions, ground_truth, num_classes);

        let correct_predictions = confusion_matrix.correct();
        let accuracy = correct_predictions as f64 / total_samples as f64;

        let per_class: Vec<ClassMetrics> = (0..num_classes)
            .map(|class_idx| ClassMetrics::from_confusion_matrix(&confusion_matrix, class_idx))
            .collect();

        let macro_avg = |f: fn(&ClassMetrics) -> f64| {
            if per_class.is_empty() {
                0.0
            } else {
                per_class.iter().map(f).sum::<f64>() / per_class.len() as f64
            }
        };

        let total_support: usize = per_class.iter().map(|m| m.support).sum();
        let weighted_avg = |f: fn(&ClassMetrics) -> f64| {
            if total_support > 0 {
                per_class
                    .iter()
                    .map(|m| f(m) * m.support as f64)
                    .sum::<f64>()
                    / total_support as f64
            } else {
                0.0
            }
        };

        Self {
            total_samples,
            correct_predictions,
            accuracy,
            macro_precision: macro_avg(|m| m.precision),
            macro_recall: macro_avg(|m| m.recall),
            macro_f1: macro_avg(|m| m.f1),
            weighted_precision: weighted_avg(|m| m.precision),
            weighted_recall: weighted_avg(|m| m.recall),
            weighted_f1: weighted_avg(|m| m.f1),
            per_class,
            confusion_matrix,
        }
    }

    /// Attach class names to the per-class entries
    pub fn with_class_names(mut self, class_names: &[String]) -> Self {
        for m in &mut self.per_class {
            m.class_name = class_names.get(m.class_idx).cloned();
        }
        self
    }

    /// Render an sklearn-style classification report
    pub fn classification_report(&self) -> String {
        let name_width = self
            .per_class
            .iter()
            .map(|m| m.display_name().len())
            .chain(std::iter::once("weighted avg".len()))
            .max()
            .unwrap_or(12);

        let mut out = String::new();
        out.push_str(&format!(
            "{:>w$}  {:>9} {:>9} {:>9} {:>9}\n\n",
            "",
            "precision",
            "recall",
            "f1-score",
            "support",
            w = name_width
        ));

        for m in &self.per_class {
            out.push_str(&format!(
                "{:>w$}  {:>9.4} {:>9.4} {:>9.4} {:>9}\n",
                m.display_name(),
                m.precision,
                m.recall,
                m.f1,
                m.support,
                w = name_width
            ));
        }

        out.push('\n');
        out.push_str(&format!(
            "{:>w$}  {:>9} {:>9} {:>9.4} {:>9}\n",
            "accuracy",
            "",
            "",
            self.accuracy,
            self.total_samples,
            w = name_width
        ));
        out.push_str(&format!(
            "{:>w$}  {:>9.4} {:>9.4} {:>9.4} {:>9}\n",
            "macro avg",
            self.macro_precision,
            self.macro_recall,
            self.macro_f1,
            self.total_samples,
            w = name_width
        ));
        out.push_str(&format!(
            "{:>w$}  {:>9.4} {:>9.4} {:>9.4} {:>9}\n",
            "weighted avg",
            self.weighted_precision,
            self.weighted_recall,
            self.weighted_f1,
            self.total_samples,
            w = name_width
        ));

        out
    }
}

impl std::fmt::Display for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Accuracy:    {:6.2}%", self.accuracy * 100.0)?;
        writeln!(f, "Macro F1:    {:6.2}%", self.macro_f1 * 100.0)?;
        writeln!(f, "Weighted F1: {:6.2}%", self.weighted_f1 * 100.0)?;
        write!(f, "Samples:     {}", self.total_samples)
    }
}

/// Per-class metrics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClassMetrics {
    /// Class index
    pub class_idx: usize,

    /// Class name (if available)
    pub class_name: Option<String>,

    pub true_positives: usize,
    pub false_positives: usize,
    pub false_negatives: usize,

    /// Precision = TP / (TP + FP)
    pub precision: f64,

    /// Recall = TP / (TP + FN)
    pub recall: f64,

    /// F1 = 2 * (precision * recall) / (precision + recall)
    pub f1: f64,

    /// Support = number of actual samples of this class
    pub support: usize,
}

impl ClassMetrics {
    /// Calculate metrics for a class from confusion matrix
    pub fn from_confusion_matrix(cm: &ConfusionMatrix, class_idx: usize) -> Self {
        let true_positives = cm.get(class_idx, class_idx);

        // predicted as this class, actually another
        let false_positives: usize = (0..cm.num_classes)
            .filter(|&i| i != class_idx)
            .map(|i| cm.get(i, class_idx))
            .sum();

        // actually this class, predicted as another
        let false_negatives: usize = (0..cm.num_classes)
            .filter(|&i| i != class_idx)
            .map(|i| cm.get(class_idx, i))
            .sum();

        let support = true_positives + false_negatives;

        let precision = if true_positives + false_positives > 0 {
            true_positives as f64 / (true_positives + false_positives) as f64
        } else {
            0.0
        };

        let recall = if support > 0 {
            true_positives as f64 / support as f64
        } else {
            0.0
        };

        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };

        Self {
            class_idx,
            class_name: None,
            true_positives,
            false_positives,
            false_negatives,
            precision,
            recall,
            f1,
            support,
        }
    }

    fn display_name(&self) -> String {
        self.class_name
            .clone()
            .unwrap_or_else(|| self.class_idx.to_string())
    }
}

/// Confusion Matrix for multi-class classification
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    /// Number of classes
    pub num_classes: usize,

    /// Row-major counts (row = actual, column = predicted)
    pub matrix: Vec<usize>,
}

impl ConfusionMatrix {
    /// Create a new empty confusion matrix
    pub fn new(num_classes: usize) -> Self {
        Self {
            num_classes,
            matrix: vec![0; num_classes * num_classes],
        }
    }

    /// Create confusion matrix from predictions and ground truth
    pub fn from_predictions(
        predictions: &[usize],
        ground_truth: &[usize],
        num_classes: usize,
    ) -> Self {
        let mut cm = Self::new(num_classes);

        for (&pred, &actual) in predictions.iter().zip(ground_truth.iter()) {
            cm.add(actual, pred);
        }

        cm
    }

    /// Add a single prediction to the matrix
    pub fn add(&mut self, actual: usize, predicted: usize) {
        if actual < self.num_classes && predicted < self.num_classes {
            let idx = actual * self.num_classes + predicted;
            self.matrix[idx] += 1;
        }
    }

    /// Get the count at (actual, predicted)
    pub fn get(&self, actual: usize, predicted: usize) -> usize {
        if actual < self.num_classes && predicted < self.num_classes {
            self.matrix[actual * self.num_classes + predicted]
        } else {
            0
        }
    }

    /// Get the total count
    pub fn total(&self) -> usize {
        self.matrix.iter().sum()
    }

    /// Get the number of correct predictions (diagonal sum)
    pub fn correct(&self) -> usize {
        (0..self.num_classes).map(|i| self.get(i, i)).sum()
    }

    /// Get overall accuracy
    pub fn accuracy(&self) -> f64 {
        let total = self.total();
        if total > 0 {
            self.correct() as f64 / total as f64
        } else {
            0.0
        }
    }

    /// Row-normalized matrix (each actual class sums to 1)
    pub fn normalize_rows(&self) -> Vec<Vec<f64>> {
        (0..self.num_classes)
            .map(|row| {
                let sum: usize = (0..self.num_classes).map(|col| self.get(row, col)).sum();
                (0..self.num_classes)
                    .map(|col| {
                        if sum > 0 {
                            self.get(row, col) as f64 / sum as f64
                        } else {
                            0.0
                        }
                    })
                    .collect()
            })
            .collect()
    }

    /// Pretty print the confusion matrix
    pub fn display(&self, class_names: Option<&[String]>) -> String {
        let mut output = String::new();

        output.push_str("\nConfusion Matrix (rows=actual, cols=predicted):\n\n");

        let short = |idx: usize, width: usize| -> String {
            match class_names.and_then(|names| names.get(idx)) {
                Some(name) => name.chars().take(width).collect(),
                None => idx.to_string(),
            }
        };

        output.push_str("          ");
        for col in 0..self.num_classes {
            output.push_str(&format!("{:>6}", short(col, 6)));
        }
        output.push('\n');

        for row in 0..self.num_classes {
            output.push_str(&format!("{:>8} ", short(row, 8)));

            for col in 0..self.num_classes {
                let count = self.get(row, col);
                if row == col {
                    output.push_str(&format!("[{:>4}]", count));
                } else if count > 0 {
                    output.push_str(&format!(" {:>4} ", count));
                } else {
                    output.push_str("    . ");
                }
            }
            output.push('\n');
        }

        output.push_str(&format!("\nAccuracy: {:.2}%\n", self.accuracy() * 100.0));

        output
    }

    /// Save confusion matrix to CSV, with class names as headers when given
    pub fn save_csv(&self, path: &Path, class_names: Option<&[String]>) -> std::io::Result<()> {
        let label = |idx: usize| -> String {
            class_names
                .and_then(|names| names.get(idx).cloned())
                .unwrap_or_else(|| idx.to_string())
        };

        let mut content = String::from("actual\\predicted");
        for col in 0..self.num_classes {
            content.push_str(&format!(",{}", label(col)));
        }
        content.push('\n');

        for row in 0..self.num_classes {
            content.push_str(&label(row));
            for col in 0..self.num_classes {
                content.push_str(&format!(",{}", self.get(row, col)));
            }
            content.push('\n');
        }

        std::fs::write(path, content)
    }
}

impl std::fmt::Display for ConfusionMatrix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display(None))
    }
}

/// Running average for tracking losses during training
#[derive(Debug, Clone, Default)]
pub struct RunningAverage {
    sum: f64,
    count: usize,
}

impl RunningAverage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a value with a weight (e.g. batch size)
    pub fn add_weighted(&mut self, value: f64, weight: usize) {
        self.sum += value * weight as f64;
        self.count += weight;
    }

    pub fn average(&self) -> f64 {
        if self.count > 0 {
            self.sum / self.count as f64
        } else {
            0.0
        }
    }
}

/// Accuracy tracker for training
#[derive(Debug, Clone, Default)]
pub struct AccuracyTracker {
    correct: usize,
    total: usize,
}

impl AccuracyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a batch of predictions
    pub fn add_batch(&mut self, predictions: &[usize], ground_truth: &[usize]) {
        for (pred, gt) in predictions.iter().zip(ground_truth.iter()) {
            self.total += 1;
            if pred == gt {
                self.correct += 1;
            }
        }
    }

    pub fn accuracy(&self) -> f64 {
        if self.total > 0 {
            self.correct as f64 / self.total as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // predictions vs truth: 7 of 10 correct
    const PREDICTIONS: [usize; 10] = [0, 1, 2, 0, 1, 2, 0, 0, 2, 2];
    const GROUND_TRUTH: [usize; 10] = [0, 1, 2, 0, 2, 2, 1, 0, 1, 2];

    #[test]
    fn test_confusion_matrix() {
        let cm = ConfusionMatrix::from_predictions(&PREDICTIONS, &GROUND_TRUTH, 3);

        assert_eq!(cm.get(0, 0), 3);
        assert_eq!(cm.get(1, 1), 1);
        assert_eq!(cm.get(2, 2), 3);
        assert_eq!(cm.get(1, 0), 1);
        assert_eq!(cm.total(), 10);
        assert_eq!(cm.correct(), 7);
        assert!((cm.accuracy() - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_metrics_from_predictions() {
        let metrics = Metrics::from_predictions(&PREDICTIONS, &GROUND_TRUTH, 3);

        assert_eq!(metrics.total_samples, 10);
        assert_eq!(metrics.correct_predictions, 7);

        // class 1: TP 1, FP 1, FN 2
        let c1 = &metrics.per_class[1];
        assert_eq!(c1.support, 3);
        assert!((c1.precision - 0.5).abs() < 1e-9);
        assert!((c1.recall - 1.0 / 3.0).abs() < 1e-9);

        let expected_weighted: f64 = metrics
            .per_class
            .iter()
            .map(|m| m.f1 * m.support as f64)
            .sum::<f64>()
            / 10.0;
        assert!((metrics.weighted_f1 - expected_weighted).abs() < 1e-9);
    }

    #[test]
    fn test_macro_average_counts_unsupported_classes() {
        // class 2 is predicted once but never true, class 3 never occurs
        let metrics = Metrics::from_predictions(&[0, 1, 2, 0], &[0, 1, 1, 0], 4);

        assert_eq!(metrics.per_class[2].support, 0);
        assert!((metrics.macro_precision - 2.0 / 4.0).abs() < 1e-9);
        assert!((metrics.macro_recall - 1.5 / 4.0).abs() < 1e-9);
        assert!((metrics.macro_f1 - (1.0 + 2.0 / 3.0) / 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_predictions() {
        let metrics = Metrics::from_predictions(&[], &[], 4);
        assert_eq!(metrics.total_samples, 0);
        assert_eq!(metrics.confusion_matrix.num_classes, 4);
        assert_eq!(metrics.weighted_f1, 0.0);
    }

    #[test]
    fn test_classification_report_rows() {
        let names: Vec<String> = ["glass", "metal", "paper"].iter().map(|s| s.to_string()).collect();
        let report = Metrics::from_predictions(&PREDICTIONS, &GROUND_TRUTH, 3)
            .with_class_names(&names)
            .classification_report();

        assert!(report.contains("precision"));
        assert!(report.contains("metal"));
        assert!(report.contains("accuracy"));
        assert!(report.contains("macro avg"));
        assert!(report.contains("weighted avg"));
    }

    #[test]
    fn test_normalize_rows() {
        let cm = ConfusionMatrix::from_predictions(&PREDICTIONS, &GROUND_TRUTH, 3);
        for row in cm.normalize_rows() {
            let sum: f64 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_save_csv_uses_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cm.csv");
        let names: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        let cm = ConfusionMatrix::from_predictions(&PREDICTIONS, &GROUND_TRUTH, 3);
        cm.save_csv(&path, Some(&names)).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("actual\\predicted,a,b,c"));
        assert_eq!(content.lines().count(), 4);
    }

    #[test]
    fn test_running_average_weighted() {
        let mut avg = RunningAverage::new();
        avg.add_weighted(1.0, 3);
        avg.add_weighted(2.0, 1);
        assert!((avg.average() - 1.25).abs() < 1e-9);
    }
}
