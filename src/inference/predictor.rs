//! Inference Predictor Module
//!
//! Single-image classification with a native model file and its labels.

use std::path::{Path, PathBuf};
use std::time::Instant;

use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::dataset::augmentation::to_chw_data;
use crate::dataset::burn_dataset::load_resized;
use crate::export::native::load_native;
use crate::model::TrashClassifier;
use crate::utils::error::{Result, ResultExt, TrashSortError};

/// Result of a single prediction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction {
    pub class_name: String,
    pub class_index: usize,
    pub confidence: f32,
    /// Every class with its probability, most likely first
    pub scores: Vec<(String, f32)>,
    pub inference_time_ms: f64,
}

impl Prediction {
    pub fn from_probabilities(probabilities: &[f32], labels: &[String], inference_time_ms: f64) -> Result<Self> {
        if probabilities.len() != labels.len() {
            return Err(TrashSortError::Inference(format!(
                "{} probabilities for {} labels",
                probabilities.len(),
                labels.len()
            )));
        }

        let mut scores: Vec<(String, f32)> = labels.iter().cloned().zip(probabilities.iter().copied()).collect();
        scores.sort_by(|a, b| b.1.total_cmp(&a.1));

        let (class_index, confidence) = probabilities
            .iter()
            .copied()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .context("empty prediction")?;

        Ok(Self {
            class_name: labels[class_index].clone(),
            class_index,
            confidence,
            scores,
            inference_time_ms,
        })
    }

    pub fn display(&self, top: usize) -> String {
        let mut output = format!(
            "Prediction: {} (class {})\nConfidence: {:.2}%\nInference time: {:.2} ms\n",
            self.class_name,
            self.class_index,
            self.confidence * 100.0,
            self.inference_time_ms
        );
        output.push_str(&format!("\nTop-{} predictions:\n", top.min(self.scores.len())));
        for (i, (name, prob)) in self.scores.iter().take(top).enumerate() {
            output.push_str(&format!("  {}. {:<16} {:>6.2}%\n", i + 1, name, prob * 100.0));
        }
        output
    }
}

/// Loaded model ready for single-image inference
pub struct Predictor<B: Backend> {
    model: TrashClassifier<B>,
    labels: Vec<String>,
    image_size: usize,
    device: B::Device,
}

impl<B: Backend> Predictor<B> {
    pub fn load(model_path: &Path, labels_path: &Path, device: &B::Device) -> Result<Self> {
        let (model, labels, config) = load_native::<B>(model_path, labels_path, device)?;
        Ok(Self::new(model, labels, config.image_size, device))
    }

    pub fn new(model: TrashClassifier<B>, labels: Vec<String>, image_size: usize, device: &B::Device) -> Self {
        Self {
            model,
            labels,
            image_size,
            device: device.clone(),
        }
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn predict(&self, image_path: &Path) -> Result<Prediction> {
        let image = load_resized(image_path, self.image_size)?;
        let start = Instant::now();

        let x = Tensor::<B, 4>::from_data(
            TensorData::new(to_chw_data(&image), [1, 3, self.image_size, self.image_size]),
            &self.device,
        );
        let probs = self
            .model
            .forward_probs(x)
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| TrashSortError::Inference(format!("failed to read probabilities: {:?}", e)))?;

        Prediction::from_probabilities(&probs, &self.labels, start.elapsed().as_secs_f64() * 1000.0)
    }

    /// Predict several files, keeping failures per file
    pub fn predict_many(&self, paths: &[PathBuf]) -> Vec<(PathBuf, Result<Prediction>)> {
        paths.iter().map(|p| (p.clone(), self.predict(p))).collect()
    }
}
