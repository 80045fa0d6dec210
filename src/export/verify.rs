//! Verification and I/O summaries of exported artifacts.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use colored::Colorize;
use prost::Message;
use tracing::debug;

use crate::export::proto::ModelProto;
use crate::utils::error::{Result, TrashSortError};
use crate::utils::format_bytes;

/// One input or output of an artifact
#[derive(Debug, Clone, PartialEq)]
pub struct IoSpec {
    pub name: String,
    pub elem_type: String,
    pub dims: Vec<String>,
}

impl std::fmt::Display for IoSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} [{}]", self.name, self.elem_type, self.dims.join(", "))
    }
}

/// What was written, with its signature
#[derive(Debug, Clone)]
pub struct ArtifactSummary {
    pub label: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub inputs: Vec<IoSpec>,
    pub outputs: Vec<IoSpec>,
    /// Largest absolute difference to the in-memory model on the check image
    pub max_abs_diff: Option<f32>,
}

impl ArtifactSummary {
    pub fn print(&self) {
        println!(
            "  {} {} ({})",
            "📦".cyan(),
            self.label.bold(),
            format_bytes(self.size_bytes)
        );
        println!("     path:   {:?}", self.path);
        for input in &self.inputs {
            println!("     input:  {}", input);
        }
        for output in &self.outputs {
            println!("     output: {}", output);
        }
        if let Some(diff) = self.max_abs_diff {
            println!("     max |Δ| vs model: {:.2e}", diff);
        }
    }
}

/// Structural checks on a decoded model
pub fn check_model(model: &ModelProto, expected_opset: i64) -> Result<()> {
    let opset = model
        .opset_import
        .iter()
        .find(|o| o.domain.as_deref().unwrap_or("").is_empty())
        .and_then(|o| o.version);
    if opset != Some(expected_opset) {
        return Err(TrashSortError::Export(format!(
            "expected opset {}, found {:?}",
            expected_opset, opset
        )));
    }

    let graph = model
        .graph
        .as_ref()
        .ok_or_else(|| TrashSortError::Export("model has no graph".to_string()))?;

    let mut available: HashSet<&str> = graph
        .initializer
        .iter()
        .filter_map(|t| t.name.as_deref())
        .chain(graph.input.iter().filter_map(|i| i.name.as_deref()))
        .collect();

    for (index, node) in graph.node.iter().enumerate() {
        for input in node.input.iter().filter(|i| !i.is_empty()) {
            if !available.contains(input.as_str()) {
                return Err(TrashSortError::Export(format!(
                    "node {} ({}) reads {} before it is produced",
                    index,
                    node.op_type.as_deref().unwrap_or("?"),
                    input
                )));
            }
        }
        available.extend(node.output.iter().map(String::as_str));
    }

    for output in &graph.output {
        let name = output.name.as_deref().unwrap_or_default();
        if !available.contains(name) {
            return Err(TrashSortError::Export(format!("graph output {} is never produced", name)));
        }
    }

    debug!(
        "Verified graph: {} nodes, {} initializers",
        graph.node.len(),
        graph.initializer.len()
    );
    Ok(())
}

fn io_specs(values: &[crate::export::proto::ValueInfoProto]) -> Vec<IoSpec> {
    values
        .iter()
        .map(|v| {
            let (elem_type, dims) = v.signature();
            IoSpec {
                name: v.name.clone().unwrap_or_default(),
                elem_type,
                dims,
            }
        })
        .collect()
}

/// Re-read a written ONNX file, check it and summarize its I/O
pub fn verify_onnx_file(label: &str, path: &Path, expected_opset: i64) -> Result<(ModelProto, ArtifactSummary)> {
    let bytes = std::fs::read(path)?;
    let model = ModelProto::decode(bytes.as_slice())
        .map_err(|e| TrashSortError::Export(format!("failed to decode {:?}: {}", path, e)))?;
    check_model(&model, expected_opset)?;

    let (inputs, outputs) = model
        .graph
        .as_ref()
        .map(|g| (io_specs(&g.input), io_specs(&g.output)))
        .unwrap_or_default();

    let summary = ArtifactSummary {
        label: label.to_string(),
        path: path.to_path_buf(),
        size_bytes: bytes.len() as u64,
        inputs,
        outputs,
        max_abs_diff: None,
    };
    Ok((model, summary))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::builder::{GraphBuilder, WeightFormat};
    use crate::export::proto::{TensorDataType, ValueInfoProto};

    fn relu_model(reads: &str) -> ModelProto {
        let mut g = GraphBuilder::new(WeightFormat::Fp32);
        g.node("Relu", &[reads], &["output"], vec![]);
        g.finish(
            "g",
            vec![ValueInfoProto::tensor("input", TensorDataType::Float, &[None, Some(2)])],
            vec![ValueInfoProto::tensor("output", TensorDataType::Float, &[None, Some(2)])],
            13,
        )
    }

    #[test]
    fn test_valid_graph_passes() {
        assert!(check_model(&relu_model("input"), 13).is_ok());
    }

    #[test]
    fn test_wrong_opset_fails() {
        assert!(check_model(&relu_model("input"), 12).is_err());
    }

    #[test]
    fn test_dangling_input_fails() {
        assert!(check_model(&relu_model("nowhere"), 13).is_err());
    }

    #[test]
    fn test_verify_file_summarizes_io() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.onnx");
        std::fs::write(&path, relu_model("input").encode_to_vec()).unwrap();

        let (_, summary) = verify_onnx_file("relu", &path, 13).unwrap();
        assert_eq!(summary.inputs[0].to_string(), "input float32 [N, 2]");
        assert!(summary.size_bytes > 0);
    }
}
