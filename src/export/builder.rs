//! ONNX graph builder
//!
//! Accumulates nodes and initializers in topological order and stores weights
//! in the requested format. FP16 and INT8 weights are converted back to float
//! inside the graph, so every consumer sees float32 tensors.

use crate::export::proto::{
    AttributeProto, AttributeType, GraphProto, ModelProto, NodeProto, OperatorSetIdProto, TensorDataType, TensorProto,
    ValueInfoProto, IR_VERSION,
};
use crate::export::quantize::{quantize_per_channel, to_f16_bytes, to_f32_bytes};

/// How weight initializers are stored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightFormat {
    Fp32,
    /// float16 storage followed by `Cast(to=FLOAT)`
    Fp16,
    /// Conv/Gemm kernels as per-channel int8 + `DequantizeLinear`; other constants as FP32
    Int8,
}

pub fn attr_int(name: &str, value: i64) -> AttributeProto {
    AttributeProto {
        name: Some(name.to_string()),
        i: Some(value),
        r#type: Some(AttributeType::Int as i32),
        ..Default::default()
    }
}

pub fn attr_ints(name: &str, values: &[i64]) -> AttributeProto {
    AttributeProto {
        name: Some(name.to_string()),
        ints: values.to_vec(),
        r#type: Some(AttributeType::Ints as i32),
        ..Default::default()
    }
}

pub fn attr_float(name: &str, value: f32) -> AttributeProto {
    AttributeProto {
        name: Some(name.to_string()),
        f: Some(value),
        r#type: Some(AttributeType::Float as i32),
        ..Default::default()
    }
}

pub struct GraphBuilder {
    format: WeightFormat,
    nodes: Vec<NodeProto>,
    initializers: Vec<TensorProto>,
    counter: usize,
}

impl GraphBuilder {
    pub fn new(format: WeightFormat) -> Self {
        Self {
            format,
            nodes: Vec::new(),
            initializers: Vec::new(),
            counter: 0,
        }
    }

    pub fn format(&self) -> WeightFormat {
        self.format
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// A fresh value name
    pub fn fresh(&mut self, prefix: &str) -> String {
        self.counter += 1;
        format!("{}_{}", prefix, self.counter)
    }

    fn raw_initializer(&mut self, name: &str, dims: &[usize], data_type: TensorDataType, raw: Vec<u8>) {
        self.initializers.push(TensorProto {
            dims: dims.iter().map(|&d| d as i64).collect(),
            data_type: Some(data_type as i32),
            name: Some(name.to_string()),
            raw_data: Some(raw),
        });
    }

    /// Float32 constant regardless of the weight format
    pub fn constant_f32(&mut self, prefix: &str, dims: &[usize], data: &[f32]) -> String {
        let name = self.fresh(prefix);
        self.raw_initializer(&name, dims, TensorDataType::Float, to_f32_bytes(data));
        name
    }

    /// Scalar int8 constant (quantization zero points)
    pub fn constant_i8(&mut self, prefix: &str, dims: &[usize], data: &[i8]) -> String {
        let name = self.fresh(prefix);
        self.raw_initializer(&name, dims, TensorDataType::Int8, data.iter().map(|&v| v as u8).collect());
        name
    }

    /// Float tensor that follows the FP16 format; returns the float32 value name
    pub fn parameter(&mut self, prefix: &str, dims: &[usize], data: &[f32]) -> String {
        match self.format {
            WeightFormat::Fp16 => {
                let stored = self.fresh(&format!("{}_f16", prefix));
                self.raw_initializer(&stored, dims, TensorDataType::Float16, to_f16_bytes(data));
                let out = self.fresh(prefix);
                self.node("Cast", &[&stored], &[&out], vec![attr_int("to", TensorDataType::Float as i64)]);
                out
            }
            WeightFormat::Fp32 | WeightFormat::Int8 => self.constant_f32(prefix, dims, data),
        }
    }

    /// Conv or Gemm kernel; per-channel int8 along `channel_axis` in the INT8 format
    pub fn kernel(&mut self, prefix: &str, dims: &[usize], data: &[f32], channel_axis: usize) -> String {
        if self.format != WeightFormat::Int8 {
            return self.parameter(prefix, dims, data);
        }

        let (quantized, scales) = quantize_per_channel(data, dims, channel_axis);
        let channels = scales.len();

        let q_name = self.fresh(&format!("{}_q", prefix));
        self.raw_initializer(
            &q_name,
            dims,
            TensorDataType::Int8,
            quantized.iter().map(|&v| v as u8).collect(),
        );
        let scale = self.constant_f32(&format!("{}_scale", prefix), &[channels], &scales);
        let zero_point = self.constant_i8(&format!("{}_zp", prefix), &[channels], &vec![0; channels]);

        let out = self.fresh(prefix);
        self.node(
            "DequantizeLinear",
            &[&q_name, &scale, &zero_point],
            &[&out],
            vec![attr_int("axis", channel_axis as i64)],
        );
        out
    }

    pub fn node(&mut self, op_type: &str, inputs: &[&str], outputs: &[&str], attributes: Vec<AttributeProto>) {
        let name = format!("{}_{}", op_type, self.nodes.len());
        self.nodes.push(NodeProto {
            input: inputs.iter().map(|s| s.to_string()).collect(),
            output: outputs.iter().map(|s| s.to_string()).collect(),
            name: Some(name),
            op_type: Some(op_type.to_string()),
            attribute: attributes,
        });
    }

    /// Single-output node with a fresh output name
    pub fn op(&mut self, op_type: &str, inputs: &[&str], attributes: Vec<AttributeProto>) -> String {
        let out = self.fresh(&op_type.to_lowercase());
        self.node(op_type, inputs, &[&out], attributes);
        out
    }

    /// `x * sigmoid(x)`
    pub fn swish(&mut self, x: &str) -> String {
        let s = self.op("Sigmoid", &[x], vec![]);
        self.op("Mul", &[x, &s], vec![])
    }

    pub fn finish(
        self,
        graph_name: &str,
        inputs: Vec<ValueInfoProto>,
        outputs: Vec<ValueInfoProto>,
        opset: i64,
    ) -> ModelProto {
        ModelProto {
            ir_version: Some(IR_VERSION),
            producer_name: Some(env!("CARGO_PKG_NAME").to_string()),
            producer_version: Some(env!("CARGO_PKG_VERSION").to_string()),
            doc_string: None,
            graph: Some(GraphProto {
                node: self.nodes,
                name: Some(graph_name.to_string()),
                initializer: self.initializers,
                input: inputs,
                output: outputs,
            }),
            opset_import: vec![OperatorSetIdProto {
                domain: Some(String::new()),
                version: Some(opset),
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fp16_parameter_adds_cast() {
        let mut builder = GraphBuilder::new(WeightFormat::Fp16);
        let name = builder.parameter("w", &[2], &[1.0, 2.0]);
        assert_eq!(builder.num_nodes(), 1);

        let model = builder.finish("g", vec![], vec![], 13);
        let graph = model.graph.unwrap();
        assert_eq!(graph.initializer[0].data_type, Some(TensorDataType::Float16 as i32));
        assert_eq!(graph.initializer[0].raw_data.as_ref().map(|r| r.len()), Some(4));
        assert_eq!(graph.node[0].op_type.as_deref(), Some("Cast"));
        assert_eq!(graph.node[0].output[0], name);
    }

    #[test]
    fn test_int8_kernel_dequantizes_per_channel() {
        let mut builder = GraphBuilder::new(WeightFormat::Int8);
        builder.kernel("conv", &[2, 1, 1, 1], &[0.5, -2.0], 0);
        let bias = builder.parameter("bias", &[2], &[0.1, 0.2]);

        let graph = builder.finish("g", vec![], vec![], 13).graph.unwrap();
        assert_eq!(graph.node.len(), 1);
        assert_eq!(graph.node[0].op_type.as_deref(), Some("DequantizeLinear"));
        assert_eq!(graph.node[0].attribute[0].i, Some(0));
        assert_eq!(graph.initializer[0].data_type, Some(TensorDataType::Int8 as i32));
        // biases stay float32
        let bias_init = graph.initializer.iter().find(|t| t.name.as_deref() == Some(bias.as_str()));
        assert_eq!(bias_init.and_then(|t| t.data_type), Some(TensorDataType::Float as i32));
    }

    #[test]
    fn test_finish_sets_opset_and_ir() {
        let model = GraphBuilder::new(WeightFormat::Fp32).finish("g", vec![], vec![], 13);
        assert_eq!(model.ir_version, Some(IR_VERSION));
        assert_eq!(model.opset_import[0].version, Some(13));
    }
}
