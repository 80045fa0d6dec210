//! Model export
//!
//! This module provides:
//! - The native Burn artifact (weights only) with `labels.txt`
//! - ONNX graphs (opset 13) in FP32, FP16-weight and full-INT8 variants
//! - Verification: re-decoding, structural checks, a numeric check and an
//!   I/O summary for every written file

pub mod builder;
pub mod graph;
pub mod native;
pub mod proto;
pub mod quantize;
pub mod runtime;
pub mod verify;

use std::path::Path;

use burn::prelude::*;
use colored::Colorize;
use prost::Message;
use tracing::{debug, info, warn};

pub use builder::WeightFormat;
pub use graph::{build_model_graph, GraphOptions, INPUT_NAME, OUTPUT_NAME};
pub use native::{load_native, read_labels, save_native, LABELS_FILE, MODEL_FILE};
pub use quantize::QuantParams;
pub use verify::{ArtifactSummary, IoSpec};

use crate::dataset::{burn_dataset::load_resized, representative_samples, ImageFolder};
use crate::model::{ExportConfig, TrashClassifier, TrashClassifierConfig};
use crate::utils::error::{Result, TrashSortError};

pub const ONNX_FILE: &str = "model_effb0_mixup.onnx";
pub const ONNX_FP16_FILE: &str = "model_effb0_mixup_fp16.onnx";
pub const ONNX_INT8_FILE: &str = "model_effb0_mixup_int8.onnx";

/// A check image in NHWC raw pixels: the first calibration image, or a gradient
fn check_input(samples: &[(std::path::PathBuf, usize)], image_size: usize) -> Vec<f32> {
    if let Some(img) = samples.iter().find_map(|(p, _)| load_resized(p, image_size).ok()) {
        return img.as_raw().iter().map(|&v| v as f32).collect();
    }
    (0..image_size * image_size * 3)
        .map(|i| ((i * 7) % 256) as f32)
        .collect()
}

fn model_probs<B: Backend>(
    model: &TrashClassifier<B>,
    nhwc: &[f32],
    image_size: usize,
    device: &B::Device,
) -> Result<Vec<f32>> {
    let x = Tensor::<B, 4>::from_data(TensorData::new(nhwc.to_vec(), [1, image_size, image_size, 3]), device)
        .permute([0, 3, 1, 2]);
    graph::values(model.forward_probs(x))
}

fn write_onnx<B: Backend>(
    model: &TrashClassifier<B>,
    label: &str,
    path: &Path,
    options: &GraphOptions,
    check: &[f32],
    expected: &[f32],
    device: &B::Device,
) -> Result<ArtifactSummary> {
    let proto = build_model_graph(model, options)?;
    debug!(
        "{}: {} nodes, {} initializers",
        label,
        proto.graph.as_ref().map(|g| g.node.len()).unwrap_or(0),
        proto.graph.as_ref().map(|g| g.initializer.len()).unwrap_or(0)
    );
    std::fs::write(path, proto.encode_to_vec())?;

    let (decoded, mut summary) = verify::verify_onnx_file(label, path, options.opset)?;

    let size = options.image_size;
    let (input, dequantize_output) = match (options.format, options.input_quant) {
        (WeightFormat::Int8, Some(q)) => (check.iter().map(|&v| q.quantize(v) as f32).collect(), true),
        _ => (check.to_vec(), false),
    };
    let (output, _) = runtime::run_graph::<B>(&decoded, input, &[1, size, size, 3], device)?;
    let output: Vec<f32> = if dequantize_output {
        let q = QuantParams::probabilities();
        output.iter().map(|&v| q.dequantize(v as i8)).collect()
    } else {
        output
    };

    let diff = output
        .iter()
        .zip(expected)
        .map(|(a, b)| (a - b).abs())
        .fold(0.0f32, f32::max);
    summary.max_abs_diff = Some(diff);
    Ok(summary)
}

/// Write every enabled artifact to `output_dir` and print their signatures
pub fn export_all<B: Backend>(
    model: &TrashClassifier<B>,
    model_config: &TrashClassifierConfig,
    classes: &[String],
    train_folder: Option<&ImageFolder>,
    config: &ExportConfig,
    output_dir: &Path,
    device: &B::Device,
) -> Result<Vec<ArtifactSummary>> {
    std::fs::create_dir_all(output_dir)?;
    let image_size = model_config.image_size;
    let num_classes = model.num_classes().to_string();
    let mut summaries = Vec::new();

    println!("{}", "Exporting Model...".cyan().bold());

    let native = save_native(model, model_config, classes, output_dir)?;
    summaries.push(ArtifactSummary {
        label: "native (Burn MessagePack)".to_string(),
        size_bytes: std::fs::metadata(&native.model).map(|m| m.len()).unwrap_or(0),
        path: native.model,
        inputs: vec![IoSpec {
            name: "images".to_string(),
            elem_type: "float32".to_string(),
            dims: vec!["N".to_string(), "3".to_string(), image_size.to_string(), image_size.to_string()],
        }],
        outputs: vec![IoSpec {
            name: "probabilities".to_string(),
            elem_type: "float32".to_string(),
            dims: vec!["N".to_string(), num_classes],
        }],
        max_abs_diff: None,
    });

    let representative = train_folder
        .map(|f| representative_samples(f, config.representative_per_class))
        .unwrap_or_default();
    let check = check_input(&representative, image_size);
    let expected = model_probs(model, &check, image_size, device)?;

    let base = GraphOptions {
        format: WeightFormat::Fp32,
        image_size,
        opset: config.opset,
        input_quant: None,
    };

    if config.onnx {
        let path = output_dir.join(ONNX_FILE);
        summaries.push(write_onnx(model, "ONNX (fp32)", &path, &base, &check, &expected, device)?);
    }

    if config.fp16 {
        let path = output_dir.join(ONNX_FP16_FILE);
        let options = GraphOptions {
            format: WeightFormat::Fp16,
            ..base.clone()
        };
        summaries.push(write_onnx(model, "mobile FP16", &path, &options, &check, &expected, device)?);
    }

    if config.int8 {
        let path = output_dir.join(ONNX_INT8_FILE);
        let result = quantize::calibrate_input(&representative, image_size).and_then(|quant| {
            info!(
                "INT8 calibration over {} images: scale {:.4}, zero point {}",
                representative.len(),
                quant.scale,
                quant.zero_point
            );
            let options = GraphOptions {
                format: WeightFormat::Int8,
                input_quant: Some(quant),
                ..base.clone()
            };
            write_onnx(model, "mobile INT8", &path, &options, &check, &expected, device)
        });

        match result {
            Ok(summary) => summaries.push(summary),
            Err(e) => warn!("INT8 export skipped: {}", e),
        }
    }

    println!();
    println!("{}", "Exported Artifacts:".cyan().bold());
    for summary in &summaries {
        summary.print();
    }
    println!("  🏷️  labels: {:?}", native.labels);

    if summaries.is_empty() {
        return Err(TrashSortError::Export("nothing was exported".to_string()));
    }
    Ok(summaries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::ImageFolder;
    use crate::model::EfficientNetConfig;
    use burn_ndarray::NdArray;
    use image::{Rgb, RgbImage};

    type TestBackend = NdArray<f32>;

    fn train_folder(root: &Path) -> ImageFolder {
        let train = root.join("train");
        for (class, value) in [("glass", 40u8), ("paper", 210u8)] {
            std::fs::create_dir_all(train.join(class)).unwrap();
            for i in 0..3 {
                RgbImage::from_pixel(40, 40, Rgb([value, value / 2, i * 10]))
                    .save(train.join(class).join(format!("{}.png", i)))
                    .unwrap();
            }
        }
        ImageFolder::discover(&train).unwrap()
    }

    #[test]
    fn test_export_all_writes_every_format() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let folder = train_folder(dir.path());

        let config = TrashClassifierConfig::new(2, EfficientNetConfig::tiny())
            .with_hidden(4)
            .with_image_size(32);
        let model = config.init::<TestBackend>(&device);
        let out = dir.path().join("export");

        let summaries = export_all(
            &model,
            &config,
            &folder.classes,
            Some(&folder),
            &ExportConfig::default(),
            &out,
            &device,
        )
        .unwrap();

        assert_eq!(summaries.len(), 4);
        assert!(out.join(MODEL_FILE).exists());
        assert!(out.join(LABELS_FILE).exists());
        assert!(out.join(ONNX_INT8_FILE).exists());
        assert!(summaries[1].max_abs_diff.unwrap() < 1e-3);
        assert_eq!(summaries[3].inputs[0].elem_type, "int8");
    }

    #[test]
    fn test_int8_skipped_without_representative_set() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let config = TrashClassifierConfig::new(2, EfficientNetConfig::tiny())
            .with_hidden(4)
            .with_image_size(32);
        let model = config.init::<TestBackend>(&device);
        let classes = vec!["a".to_string(), "b".to_string()];

        let summaries =
            export_all(&model, &config, &classes, None, &ExportConfig::default(), dir.path(), &device).unwrap();
        assert_eq!(summaries.len(), 3);
        assert!(!dir.path().join(ONNX_INT8_FILE).exists());
    }

    #[test]
    fn test_mobile_exports_match_model_within_tolerance() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let folder = train_folder(dir.path());
        let config = TrashClassifierConfig::new(2, EfficientNetConfig::tiny())
            .with_hidden(4)
            .with_image_size(32);
        let model = config.init::<TestBackend>(&device);

        let summaries = export_all(
            &model,
            &config,
            &folder.classes,
            Some(&folder),
            &ExportConfig::default(),
            &dir.path().join("export"),
            &device,
        )
        .unwrap();

        let diff = |label: &str| {
            summaries
                .iter()
                .find(|s| s.label == label)
                .and_then(|s| s.max_abs_diff)
                .unwrap_or_else(|| panic!("{} has no numeric check", label))
        };
        assert!(diff("ONNX (fp32)") < 1e-3);
        assert!(diff("mobile FP16") < 1e-2);
        assert!(diff("mobile INT8") < 0.2);
    }
}
