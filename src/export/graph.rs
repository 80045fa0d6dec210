//! Lowering of a trained `TrashClassifier` into an ONNX inference graph.
//!
//! Graph input is NHWC raw pixels, as mobile image pipelines deliver them.
//! Frozen batch norm is folded into the preceding convolution.

use burn::{
    nn::{conv::Conv2d, Linear},
    prelude::*,
};

use crate::export::builder::{attr_int, attr_ints, GraphBuilder, WeightFormat};
use crate::export::proto::{ModelProto, TensorDataType, ValueInfoProto};
use crate::export::quantize::QuantParams;
use crate::model::efficientnet::{IMAGENET_MEAN, IMAGENET_STD};
use crate::model::layers::{ConvBnAct, MbConv};
use crate::model::TrashClassifier;
use crate::utils::error::{Result, TrashSortError};

/// Graph input name
pub const INPUT_NAME: &str = "input";
/// Graph output name
pub const OUTPUT_NAME: &str = "output";

#[derive(Debug, Clone)]
pub struct GraphOptions {
    pub format: WeightFormat,
    pub image_size: usize,
    pub opset: i64,
    /// Required for `WeightFormat::Int8`
    pub input_quant: Option<QuantParams>,
}

pub(crate) fn values<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| TrashSortError::Export(format!("failed to read weights: {:?}", e)))
}

fn conv_bn_act<B: Backend>(g: &mut GraphBuilder, layer: &ConvBnAct<B>, x: &str) -> Result<String> {
    let weight = layer.conv.weight.val();
    let dims = weight.dims();
    let mut folded = values(weight)?;
    let (scale, shift) = layer.bn.scale_shift();
    let scale = values(scale)?;
    let shift = values(shift)?;

    let inner = dims[1] * dims[2] * dims[3];
    for (i, w) in folded.iter_mut().enumerate() {
        *w *= scale[i / inner];
    }

    let w = g.kernel("conv_w", &dims, &folded, 0);
    let b = g.parameter("conv_b", &[dims[0]], &shift);
    let pad = (layer.kernel_size / 2) as i64;
    let k = layer.kernel_size as i64;
    let s = layer.stride as i64;

    let y = g.op(
        "Conv",
        &[x, &w, &b],
        vec![
            attr_int("group", layer.groups as i64),
            attr_ints("kernel_shape", &[k, k]),
            attr_ints("pads", &[pad, pad, pad, pad]),
            attr_ints("strides", &[s, s]),
        ],
    );

    Ok(if layer.activation { g.swish(&y) } else { y })
}

fn conv_1x1<B: Backend>(g: &mut GraphBuilder, conv: &Conv2d<B>, x: &str) -> Result<String> {
    let weight = conv.weight.val();
    let dims = weight.dims();
    let bias = match &conv.bias {
        Some(bias) => values(bias.val())?,
        None => vec![0.0; dims[0]],
    };

    let w = g.kernel("se_w", &dims, &values(weight)?, 0);
    let b = g.parameter("se_b", &[dims[0]], &bias);
    Ok(g.op("Conv", &[x, &w, &b], vec![attr_ints("kernel_shape", &[1, 1])]))
}

fn mbconv<B: Backend>(g: &mut GraphBuilder, block: &MbConv<B>, input: &str) -> Result<String> {
    let x = match &block.expand {
        Some(expand) => conv_bn_act(g, expand, input)?,
        None => input.to_string(),
    };
    let x = conv_bn_act(g, &block.depthwise, &x)?;

    let s = g.op("GlobalAveragePool", &[&x], vec![]);
    let s = conv_1x1(g, &block.se.reduce, &s)?;
    let s = g.swish(&s);
    let s = conv_1x1(g, &block.se.expand, &s)?;
    let s = g.op("Sigmoid", &[&s], vec![]);
    let x = g.op("Mul", &[&x, &s], vec![]);

    let x = conv_bn_act(g, &block.project, &x)?;
    Ok(if block.residual { g.op("Add", &[&x, input], vec![]) } else { x })
}

fn gemm<B: Backend>(g: &mut GraphBuilder, linear: &Linear<B>, x: &str) -> Result<String> {
    let weight = linear.weight.val();
    let dims = weight.dims();
    let bias = match &linear.bias {
        Some(bias) => values(bias.val())?,
        None => vec![0.0; dims[1]],
    };

    // Burn stores [in, out]; quantize per output column
    let w = g.kernel("dense_w", &dims, &values(weight)?, 1);
    let b = g.parameter("dense_b", &[dims[1]], &bias);
    Ok(g.op("Gemm", &[x, &w, &b], vec![]))
}

/// Build the inference graph for `model`
pub fn build_model_graph<B: Backend>(model: &TrashClassifier<B>, options: &GraphOptions) -> Result<ModelProto> {
    let size = options.image_size as i64;
    let num_classes = model.num_classes() as i64;
    let mut g = GraphBuilder::new(options.format);

    let (input_info, x) = match options.format {
        WeightFormat::Int8 => {
            let quant = options
                .input_quant
                .ok_or_else(|| TrashSortError::Export("INT8 export needs calibrated input parameters".to_string()))?;
            let info = ValueInfoProto::tensor(INPUT_NAME, TensorDataType::Int8, &[None, Some(size), Some(size), Some(3)]);
            let scale = g.constant_f32("input_scale", &[], &[quant.scale]);
            let zp = g.constant_i8("input_zp", &[], &[quant.zero_point]);
            let x = g.op("DequantizeLinear", &[INPUT_NAME, &scale, &zp], vec![]);
            (info, x)
        }
        WeightFormat::Fp32 | WeightFormat::Fp16 => (
            ValueInfoProto::tensor(INPUT_NAME, TensorDataType::Float, &[None, Some(size), Some(size), Some(3)]),
            INPUT_NAME.to_string(),
        ),
    };

    let x = g.op("Transpose", &[&x], vec![attr_ints("perm", &[0, 3, 1, 2])]);
    let mean = g.constant_f32("mean", &[1, 3, 1, 1], &IMAGENET_MEAN.map(|m| m * 255.0));
    let std = g.constant_f32("std", &[1, 3, 1, 1], &IMAGENET_STD.map(|s| s * 255.0));
    let x = g.op("Sub", &[&x, &mean], vec![]);
    let mut x = g.op("Div", &[&x, &std], vec![]);

    let backbone = &model.backbone;
    x = conv_bn_act(&mut g, &backbone.stem, &x)?;
    for block in &backbone.blocks {
        x = mbconv(&mut g, block, &x)?;
    }
    x = conv_bn_act(&mut g, &backbone.top, &x)?;

    let x = g.op("GlobalAveragePool", &[&x], vec![]);
    let x = g.op("Flatten", &[&x], vec![attr_int("axis", 1)]);
    let x = gemm(&mut g, &model.head.dense, &x)?;
    let x = g.swish(&x);
    let logits = gemm(&mut g, &model.head.output, &x)?;

    let output_info = match options.format {
        WeightFormat::Int8 => {
            let probs = g.op("Softmax", &[&logits], vec![attr_int("axis", 1)]);
            let out = QuantParams::probabilities();
            let scale = g.constant_f32("output_scale", &[], &[out.scale]);
            let zp = g.constant_i8("output_zp", &[], &[out.zero_point]);
            g.node("QuantizeLinear", &[&probs, &scale, &zp], &[OUTPUT_NAME], vec![]);
            ValueInfoProto::tensor(OUTPUT_NAME, TensorDataType::Int8, &[None, Some(num_classes)])
        }
        WeightFormat::Fp32 | WeightFormat::Fp16 => {
            g.node("Softmax", &[&logits], &[OUTPUT_NAME], vec![attr_int("axis", 1)]);
            ValueInfoProto::tensor(OUTPUT_NAME, TensorDataType::Float, &[None, Some(num_classes)])
        }
    };

    Ok(g.finish("trash_classifier", vec![input_info], vec![output_info], options.opset))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EfficientNetConfig, TrashClassifierConfig};
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn options(format: WeightFormat) -> GraphOptions {
        GraphOptions {
            format,
            image_size: 32,
            opset: 13,
            input_quant: Some(QuantParams::from_range(0.0, 255.0)),
        }
    }

    fn op_types(model: &ModelProto) -> Vec<String> {
        model
            .graph
            .as_ref()
            .map(|g| g.node.iter().filter_map(|n| n.op_type.clone()).collect())
            .unwrap_or_default()
    }

    #[test]
    fn test_fp32_graph_layout() {
        let device = Default::default();
        let model = TrashClassifierConfig::new(3, EfficientNetConfig::tiny())
            .with_hidden(4)
            .init::<TestBackend>(&device);

        let proto = build_model_graph(&model, &options(WeightFormat::Fp32)).unwrap();
        let ops = op_types(&proto);
        assert_eq!(&ops[..3], &["Transpose", "Sub", "Div"]);
        assert_eq!(ops.last().map(String::as_str), Some("Softmax"));
        assert_eq!(ops.iter().filter(|o| *o == "Gemm").count(), 2);
        // block1 and block3 are residual
        assert_eq!(ops.iter().filter(|o| *o == "Add").count(), 2);
        assert!(!ops.iter().any(|o| o == "Cast" || o == "DequantizeLinear"));

        let graph = proto.graph.unwrap();
        assert_eq!(graph.input[0].signature().1, vec!["N", "32", "32", "3"]);
        assert_eq!(graph.output[0].signature(), ("float32".to_string(), vec!["N".to_string(), "3".to_string()]));
    }

    #[test]
    fn test_int8_graph_quantizes_io() {
        let device = Default::default();
        let model = TrashClassifierConfig::new(2, EfficientNetConfig::tiny())
            .with_hidden(4)
            .init::<TestBackend>(&device);

        let proto = build_model_graph(&model, &options(WeightFormat::Int8)).unwrap();
        let ops = op_types(&proto);
        assert_eq!(ops.first().map(String::as_str), Some("DequantizeLinear"));
        assert_eq!(ops.last().map(String::as_str), Some("QuantizeLinear"));

        let graph = proto.graph.unwrap();
        assert_eq!(graph.input[0].signature().0, "int8");
        assert_eq!(graph.output[0].signature().0, "int8");
    }

    #[test]
    fn test_int8_requires_calibration() {
        let device = Default::default();
        let model = TrashClassifierConfig::new(2, EfficientNetConfig::tiny())
            .with_hidden(4)
            .init::<TestBackend>(&device);
        let mut opts = options(WeightFormat::Int8);
        opts.input_quant = None;
        assert!(build_model_graph(&model, &opts).is_err());
    }
}
