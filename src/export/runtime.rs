//! Reference evaluator for exported graphs
//!
//! Executes the small operator set the exporter emits on a Burn backend, so a
//! written file can be checked against the in-memory model without an
//! external runtime. Every value is held as a rank-4 tensor padded with
//! leading unit dimensions; `rank` remembers the logical rank.

use std::collections::HashMap;

use burn::{
    prelude::*,
    tensor::{
        activation::{sigmoid, softmax},
        module::conv2d,
        ops::ConvOptions,
    },
};
use half::f16;

use crate::export::proto::{AttributeProto, ModelProto, NodeProto, TensorDataType, TensorProto};
use crate::utils::error::{Result, TrashSortError};

#[derive(Clone, Debug)]
struct Value<B: Backend> {
    tensor: Tensor<B, 4>,
    rank: usize,
}

impl<B: Backend> Value<B> {
    fn new(data: Vec<f32>, dims: &[usize], device: &B::Device) -> Result<Self> {
        if dims.len() > 4 {
            return Err(TrashSortError::Export(format!("rank {} is not supported", dims.len())));
        }
        let mut padded = [1usize; 4];
        padded[4 - dims.len()..].copy_from_slice(dims);
        Ok(Self {
            tensor: Tensor::from_data(TensorData::new(data, padded), device),
            rank: dims.len(),
        })
    }

    fn with_rank(tensor: Tensor<B, 4>, rank: usize) -> Self {
        Self { tensor, rank }
    }

    /// Logical dims
    fn dims(&self) -> Vec<usize> {
        self.tensor.dims()[4 - self.rank..].to_vec()
    }
}

fn err(msg: impl Into<String>) -> TrashSortError {
    TrashSortError::Export(msg.into())
}

fn attr<'a>(node: &'a NodeProto, name: &str) -> Option<&'a AttributeProto> {
    node.attribute.iter().find(|a| a.name.as_deref() == Some(name))
}

fn attr_i(node: &NodeProto, name: &str, default: i64) -> i64 {
    attr(node, name).and_then(|a| a.i).unwrap_or(default)
}

fn attr_is(node: &NodeProto, name: &str) -> Option<Vec<i64>> {
    attr(node, name).map(|a| a.ints.clone())
}

/// Decode an initializer into float values
fn decode_initializer(tensor: &TensorProto) -> Result<(Vec<f32>, Vec<usize>)> {
    let dims: Vec<usize> = tensor.dims.iter().map(|&d| d as usize).collect();
    let raw = tensor.raw_data.as_deref().unwrap_or(&[]);
    let data_type = tensor
        .data_type
        .and_then(|t| TensorDataType::try_from(t).ok())
        .unwrap_or(TensorDataType::Undefined);

    let data = match data_type {
        TensorDataType::Float => raw
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
        TensorDataType::Float16 => raw
            .chunks_exact(2)
            .map(|b| f16::from_le_bytes([b[0], b[1]]).to_f32())
            .collect(),
        TensorDataType::Int8 => raw.iter().map(|&b| b as i8 as f32).collect(),
        other => return Err(err(format!("initializer type {:?} is not supported", other))),
    };
    Ok((data, dims))
}

/// Reshape a per-axis parameter so it broadcasts along `axis` of a value with `rank`
fn along_axis<B: Backend>(param: &Value<B>, axis: usize, rank: usize) -> Tensor<B, 4> {
    if param.rank == 0 {
        return param.tensor.clone();
    }
    let n = param.dims()[0];
    let mut shape = [1usize; 4];
    shape[4 - rank + axis] = n;
    param.tensor.clone().reshape(shape)
}

fn run_node<B: Backend>(node: &NodeProto, inputs: &[&Value<B>]) -> Result<Value<B>> {
    let op = node.op_type.as_deref().unwrap_or_default();
    let input = |i: usize| {
        inputs
            .get(i)
            .copied()
            .ok_or_else(|| err(format!("{} is missing input {}", op, i)))
    };
    let binary_rank = |a: &Value<B>, b: &Value<B>| a.rank.max(b.rank);

    let value = match op {
        "Cast" => input(0)?.clone(),
        "Transpose" => {
            let x = input(0)?;
            let perm = attr_is(node, "perm").unwrap_or_else(|| vec![0, 3, 1, 2]);
            if x.rank != 4 || perm != [0, 3, 1, 2] {
                return Err(err("only NHWC to NCHW transposes are supported"));
            }
            Value::with_rank(x.tensor.clone().permute([0, 3, 1, 2]), 4)
        }
        "Add" | "Sub" | "Mul" | "Div" => {
            let (a, b) = (input(0)?, input(1)?);
            let (x, y) = (a.tensor.clone(), b.tensor.clone());
            let t = match op {
                "Add" => x + y,
                "Sub" => x - y,
                "Mul" => x * y,
                _ => x / y,
            };
            Value::with_rank(t, binary_rank(a, b))
        }
        "Sigmoid" => {
            let x = input(0)?;
            Value::with_rank(sigmoid(x.tensor.clone()), x.rank)
        }
        "Conv" => {
            let (x, w) = (input(0)?, input(1)?);
            let bias = inputs.get(2).map(|b| b.tensor.clone().reshape([b.dims()[0]]));
            let strides = attr_is(node, "strides").unwrap_or_else(|| vec![1, 1]);
            let pads = attr_is(node, "pads").unwrap_or_else(|| vec![0, 0, 0, 0]);
            let group = attr_i(node, "group", 1) as usize;
            let options = ConvOptions::new(
                [strides[0] as usize, strides[1] as usize],
                [pads[0] as usize, pads[1] as usize],
                [1, 1],
                group,
            );
            Value::with_rank(conv2d(x.tensor.clone(), w.tensor.clone(), bias, options), 4)
        }
        "GlobalAveragePool" => {
            let x = input(0)?;
            Value::with_rank(x.tensor.clone().mean_dim(3).mean_dim(2), 4)
        }
        "Flatten" => {
            let x = input(0)?;
            let [n, c, h, w] = x.tensor.dims();
            Value::with_rank(x.tensor.clone().reshape([1, 1, n, c * h * w]), 2)
        }
        "Gemm" => {
            let (a, b) = (input(0)?, input(1)?);
            let [_, _, n, k] = a.tensor.dims();
            let [_, _, k2, m] = b.tensor.dims();
            if k != k2 {
                return Err(err(format!("Gemm shape mismatch: {} vs {}", k, k2)));
            }
            let a2: Tensor<B, 2> = a.tensor.clone().reshape([n, k]);
            let b2: Tensor<B, 2> = b.tensor.clone().reshape([k, m]);
            let mut y = a2.matmul(b2);
            if let Some(c) = inputs.get(2) {
                y = y + c.tensor.clone().reshape([1, m]);
            }
            Value::with_rank(y.reshape([1, 1, n, m]), 2)
        }
        "Softmax" => {
            let x = input(0)?;
            let axis = attr_i(node, "axis", -1);
            let axis = (if axis < 0 { x.rank as i64 + axis } else { axis }) as usize;
            Value::with_rank(softmax(x.tensor.clone(), 4 - x.rank + axis), x.rank)
        }
        "DequantizeLinear" => {
            let (x, scale, zp) = (input(0)?, input(1)?, input(2)?);
            let axis = attr_i(node, "axis", 1) as usize;
            let t = (x.tensor.clone() - along_axis(zp, axis, x.rank)) * along_axis(scale, axis, x.rank);
            Value::with_rank(t, x.rank)
        }
        "QuantizeLinear" => {
            let (x, scale, zp) = (input(0)?, input(1)?, input(2)?);
            let t = (x.tensor.clone() / scale.tensor.clone()).round() + zp.tensor.clone();
            Value::with_rank(t.clamp(-128.0, 127.0), x.rank)
        }
        other => return Err(err(format!("operator {} is not supported", other))),
    };

    Ok(value)
}

/// Run `model` on one input; returns the graph output values and dims
pub fn run_graph<B: Backend>(
    model: &ModelProto,
    input: Vec<f32>,
    input_dims: &[usize],
    device: &B::Device,
) -> Result<(Vec<f32>, Vec<usize>)> {
    let graph = model.graph.as_ref().ok_or_else(|| err("model has no graph"))?;
    let mut env: HashMap<String, Value<B>> = HashMap::new();

    for init in &graph.initializer {
        let (data, dims) = decode_initializer(init)?;
        env.insert(init.name.clone().unwrap_or_default(), Value::new(data, &dims, device)?);
    }
    let input_name = graph
        .input
        .first()
        .and_then(|i| i.name.clone())
        .ok_or_else(|| err("graph has no input"))?;
    env.insert(input_name, Value::new(input, input_dims, device)?);

    for node in &graph.node {
        let inputs = node
            .input
            .iter()
            .map(|name| env.get(name).ok_or_else(|| err(format!("value {} is undefined", name))))
            .collect::<Result<Vec<_>>>()?;
        let value = run_node(node, &inputs)?;
        if let Some(out) = node.output.first() {
            env.insert(out.clone(), value);
        }
    }

    let output_name = graph
        .output
        .first()
        .and_then(|o| o.name.clone())
        .ok_or_else(|| err("graph has no output"))?;
    let output = env
        .remove(&output_name)
        .ok_or_else(|| err(format!("output {} was never produced", output_name)))?;

    let dims = output.dims();
    let data = output
        .tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| err(format!("failed to read output: {:?}", e)))?;
    Ok((data, dims))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::builder::WeightFormat;
    use crate::export::graph::{build_model_graph, GraphOptions};
    use crate::export::quantize::QuantParams;
    use crate::model::{EfficientNetConfig, TrashClassifier, TrashClassifierConfig};
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn model() -> TrashClassifier<TestBackend> {
        TrashClassifierConfig::new(3, EfficientNetConfig::tiny())
            .with_hidden(6)
            .init::<TestBackend>(&Default::default())
    }

    /// Deterministic NHWC pixels and the matching NCHW tensor
    fn sample() -> (Vec<f32>, Tensor<TestBackend, 4>) {
        let nhwc: Vec<f32> = (0..32 * 32 * 3).map(|i| ((i * 37) % 256) as f32).collect();
        let tensor = Tensor::<TestBackend, 4>::from_data(TensorData::new(nhwc.clone(), [1, 32, 32, 3]), &Default::default())
            .permute([0, 3, 1, 2]);
        (nhwc, tensor)
    }

    fn options(format: WeightFormat) -> GraphOptions {
        GraphOptions {
            format,
            image_size: 32,
            opset: 13,
            input_quant: Some(QuantParams::from_range(0.0, 255.0)),
        }
    }

    #[test]
    fn test_fp32_graph_matches_forward_probs() {
        let model = model();
        let (nhwc, nchw) = sample();
        let expected: Vec<f32> = model.forward_probs(nchw).into_data().to_vec().unwrap();

        let proto = build_model_graph(&model, &options(WeightFormat::Fp32)).unwrap();
        let (out, dims) = run_graph::<TestBackend>(&proto, nhwc, &[1, 32, 32, 3], &Default::default()).unwrap();

        assert_eq!(dims, vec![1, 3]);
        for (a, b) in out.iter().zip(&expected) {
            assert!((a - b).abs() < 1e-4, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_fp16_graph_is_close() {
        let model = model();
        let (nhwc, nchw) = sample();
        let expected: Vec<f32> = model.forward_probs(nchw).into_data().to_vec().unwrap();

        let proto = build_model_graph(&model, &options(WeightFormat::Fp16)).unwrap();
        let (out, _) = run_graph::<TestBackend>(&proto, nhwc, &[1, 32, 32, 3], &Default::default()).unwrap();
        for (a, b) in out.iter().zip(&expected) {
            assert!((a - b).abs() < 1e-2);
        }
    }

    #[test]
    fn test_int8_graph_outputs_quantized_probabilities() {
        let model = model();
        let (nhwc, _) = sample();
        let quant = QuantParams::from_range(0.0, 255.0);
        let q_input: Vec<f32> = nhwc.iter().map(|&v| quant.quantize(v) as f32).collect();

        let proto = build_model_graph(&model, &options(WeightFormat::Int8)).unwrap();
        let (out, _) = run_graph::<TestBackend>(&proto, q_input, &[1, 32, 32, 3], &Default::default()).unwrap();

        let out_q = QuantParams::probabilities();
        let total: f32 = out.iter().map(|&q| out_q.dequantize(q as i8)).sum();
        assert!(out.iter().all(|&q| (-128.0..=127.0).contains(&q)));
        assert!((total - 1.0).abs() < 0.05);
    }
}
