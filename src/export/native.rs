//! Native Burn model files
//!
//! The native artifact is the module record only (no optimizer state), written
//! with the named MessagePack recorder at full precision, next to the label
//! list and the network configuration needed to rebuild the module.

use std::path::{Path, PathBuf};

use burn::{
    config::Config,
    module::Module,
    record::{FullPrecisionSettings, NamedMpkFileRecorder},
    tensor::backend::Backend,
};
use tracing::info;

use crate::model::{EfficientNetConfig, TrashClassifier, TrashClassifierConfig, DEFAULT_IMAGE_SIZE};
use crate::utils::error::{Result, TrashSortError};

pub const MODEL_FILE: &str = "model_effb0_mixup.mpk";
pub const LABELS_FILE: &str = "labels.txt";
pub const MODEL_CONFIG_FILE: &str = "model_config.json";

/// Paths written by `save_native`
#[derive(Debug, Clone)]
pub struct NativeArtifacts {
    pub model: PathBuf,
    pub labels: PathBuf,
    pub config: PathBuf,
}

/// One class name per line, in index order
pub fn write_labels(path: &Path, classes: &[String]) -> Result<()> {
    let mut text = classes.join("\n");
    text.push('\n');
    std::fs::write(path, text)?;
    Ok(())
}

pub fn read_labels(path: &Path) -> Result<Vec<String>> {
    if !path.exists() {
        return Err(TrashSortError::PathNotFound(path.to_path_buf()));
    }
    let labels: Vec<String> = std::fs::read_to_string(path)?
        .lines()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect();
    if labels.is_empty() {
        return Err(TrashSortError::InvalidInput(format!("{:?} contains no labels", path)));
    }
    Ok(labels)
}

pub fn save_native<B: Backend>(
    model: &TrashClassifier<B>,
    config: &TrashClassifierConfig,
    classes: &[String],
    dir: &Path,
) -> Result<NativeArtifacts> {
    if classes.len() != model.num_classes() {
        return Err(TrashSortError::Export(format!(
            "{} labels for a {}-class model",
            classes.len(),
            model.num_classes()
        )));
    }
    std::fs::create_dir_all(dir)?;

    let model_path = dir.join(MODEL_FILE);
    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    model
        .clone()
        .save_file(model_path.clone(), &recorder)
        .map_err(|e| TrashSortError::Export(format!("failed to save model: {}", e)))?;

    let labels_path = dir.join(LABELS_FILE);
    write_labels(&labels_path, classes)?;

    let config_path = dir.join(MODEL_CONFIG_FILE);
    config
        .save(&config_path)
        .map_err(|e| TrashSortError::Export(format!("failed to save model config: {}", e)))?;

    info!("Native model saved to {:?}", model_path);
    Ok(NativeArtifacts {
        model: model_path,
        labels: labels_path,
        config: config_path,
    })
}

/// Load a native model and its labels.
///
/// The network configuration is read from `model_config.json` next to the
/// model file when present, otherwise B0 with one output per label is assumed.
pub fn load_native<B: Backend>(
    model_path: &Path,
    labels_path: &Path,
    device: &B::Device,
) -> Result<(TrashClassifier<B>, Vec<String>, TrashClassifierConfig)> {
    if !model_path.exists() {
        return Err(TrashSortError::PathNotFound(model_path.to_path_buf()));
    }
    let labels = read_labels(labels_path)?;

    let config_path = model_path.with_file_name(MODEL_CONFIG_FILE);
    let config = if config_path.exists() {
        TrashClassifierConfig::load(&config_path)
            .map_err(|e| TrashSortError::Config(format!("failed to read {:?}: {}", config_path, e)))?
    } else {
        TrashClassifierConfig::new(labels.len(), EfficientNetConfig::b0()).with_image_size(DEFAULT_IMAGE_SIZE)
    };

    if config.num_classes != labels.len() {
        return Err(TrashSortError::InvalidInput(format!(
            "model has {} classes but {:?} lists {}",
            config.num_classes,
            labels_path,
            labels.len()
        )));
    }

    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    let model = config
        .init::<B>(device)
        .load_file(model_path.to_path_buf(), &recorder, device)
        .map_err(|e| TrashSortError::Model(format!("failed to load {:?}: {}", model_path, e)))?;

    Ok((model, labels, config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn classes() -> Vec<String> {
        vec!["cardboard".to_string(), "glass".to_string()]
    }

    #[test]
    fn test_labels_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LABELS_FILE);
        write_labels(&path, &classes()).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "cardboard\nglass\n");
        assert_eq!(read_labels(&path).unwrap(), classes());
    }

    #[test]
    fn test_save_and_load_native() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let config = TrashClassifierConfig::new(2, EfficientNetConfig::tiny())
            .with_hidden(4)
            .with_image_size(32);
        let model = config.init::<TestBackend>(&device);

        let artifacts = save_native(&model, &config, &classes(), dir.path()).unwrap();
        assert!(artifacts.model.exists());

        let (loaded, labels, loaded_config) =
            load_native::<TestBackend>(&artifacts.model, &artifacts.labels, &device).unwrap();
        assert_eq!(labels, classes());
        assert_eq!(loaded_config.image_size, 32);

        let a: Vec<f32> = model.head.dense.weight.val().into_data().to_vec().unwrap();
        let b: Vec<f32> = loaded.head.dense.weight.val().into_data().to_vec().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_label_count_mismatch() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let config = TrashClassifierConfig::new(2, EfficientNetConfig::tiny()).with_hidden(4);
        let model = config.init::<TestBackend>(&device);
        let artifacts = save_native(&model, &config, &classes(), dir.path()).unwrap();

        write_labels(&artifacts.labels, &["only".to_string()]).unwrap();
        assert!(load_native::<TestBackend>(&artifacts.model, &artifacts.labels, &device).is_err());
        assert!(save_native(&model, &config, &["a".to_string()], dir.path()).is_err());
    }
}
