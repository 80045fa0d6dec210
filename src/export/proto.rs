//! ONNX protobuf messages
//!
//! The subset of `onnx.proto` needed to write and re-read inference graphs,
//! declared by hand with prost derives. Field tags follow the upstream schema.

use prost::{Enumeration, Message};

/// IR version written to every model
pub const IR_VERSION: i64 = 7;

#[derive(Clone, PartialEq, Message)]
pub struct ModelProto {
    #[prost(int64, optional, tag = "1")]
    pub ir_version: Option<i64>,

    #[prost(string, optional, tag = "2")]
    pub producer_name: Option<String>,

    #[prost(string, optional, tag = "3")]
    pub producer_version: Option<String>,

    #[prost(string, optional, tag = "6")]
    pub doc_string: Option<String>,

    #[prost(message, optional, tag = "7")]
    pub graph: Option<GraphProto>,

    #[prost(message, repeated, tag = "8")]
    pub opset_import: Vec<OperatorSetIdProto>,
}

/// Nodes must be stored in topological order
#[derive(Clone, PartialEq, Message)]
pub struct GraphProto {
    #[prost(message, repeated, tag = "1")]
    pub node: Vec<NodeProto>,

    #[prost(string, optional, tag = "2")]
    pub name: Option<String>,

    #[prost(message, repeated, tag = "5")]
    pub initializer: Vec<TensorProto>,

    #[prost(message, repeated, tag = "11")]
    pub input: Vec<ValueInfoProto>,

    #[prost(message, repeated, tag = "12")]
    pub output: Vec<ValueInfoProto>,
}

#[derive(Clone, PartialEq, Message)]
pub struct NodeProto {
    #[prost(string, repeated, tag = "1")]
    pub input: Vec<String>,

    #[prost(string, repeated, tag = "2")]
    pub output: Vec<String>,

    #[prost(string, optional, tag = "3")]
    pub name: Option<String>,

    #[prost(string, optional, tag = "4")]
    pub op_type: Option<String>,

    #[prost(message, repeated, tag = "5")]
    pub attribute: Vec<AttributeProto>,
}

/// Initializer data is always written as little-endian `raw_data`
#[derive(Clone, PartialEq, Message)]
pub struct TensorProto {
    #[prost(int64, repeated, packed = "false", tag = "1")]
    pub dims: Vec<i64>,

    #[prost(int32, optional, tag = "2")]
    pub data_type: Option<i32>,

    #[prost(string, optional, tag = "8")]
    pub name: Option<String>,

    #[prost(bytes = "vec", optional, tag = "9")]
    pub raw_data: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ValueInfoProto {
    #[prost(string, optional, tag = "1")]
    pub name: Option<String>,

    #[prost(message, optional, tag = "2")]
    pub r#type: Option<TypeProto>,
}

#[derive(Clone, PartialEq, Message)]
pub struct TypeProto {
    #[prost(oneof = "type_proto::Value", tags = "1")]
    pub value: Option<type_proto::Value>,
}

pub mod type_proto {
    use prost::{Message, Oneof};

    #[derive(Clone, PartialEq, Oneof)]
    pub enum Value {
        #[prost(message, tag = "1")]
        TensorType(Tensor),
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct Tensor {
        #[prost(int32, optional, tag = "1")]
        pub elem_type: Option<i32>,

        #[prost(message, optional, tag = "2")]
        pub shape: Option<super::TensorShapeProto>,
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct TensorShapeProto {
    #[prost(message, repeated, tag = "1")]
    pub dim: Vec<tensor_shape_proto::Dimension>,
}

pub mod tensor_shape_proto {
    use prost::{Message, Oneof};

    #[derive(Clone, PartialEq, Message)]
    pub struct Dimension {
        #[prost(oneof = "dimension::Value", tags = "1, 2")]
        pub value: Option<dimension::Value>,
    }

    pub mod dimension {
        use prost::Oneof;

        #[derive(Clone, PartialEq, Oneof)]
        pub enum Value {
            #[prost(int64, tag = "1")]
            DimValue(i64),
            #[prost(string, tag = "2")]
            DimParam(String),
        }
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct AttributeProto {
    #[prost(string, optional, tag = "1")]
    pub name: Option<String>,

    #[prost(float, optional, tag = "2")]
    pub f: Option<f32>,

    #[prost(int64, optional, tag = "3")]
    pub i: Option<i64>,

    #[prost(int64, repeated, packed = "false", tag = "8")]
    pub ints: Vec<i64>,

    #[prost(enumeration = "AttributeType", optional, tag = "20")]
    pub r#type: Option<i32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct OperatorSetIdProto {
    #[prost(string, optional, tag = "1")]
    pub domain: Option<String>,

    #[prost(int64, optional, tag = "2")]
    pub version: Option<i64>,
}

/// Element types used by the exported graphs
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Enumeration)]
#[repr(i32)]
pub enum TensorDataType {
    Undefined = 0,
    Float = 1,
    Uint8 = 2,
    Int8 = 3,
    Int32 = 6,
    Int64 = 7,
    Float16 = 10,
}

impl TensorDataType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Float => "float32",
            Self::Uint8 => "uint8",
            Self::Int8 => "int8",
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::Float16 => "float16",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Enumeration)]
#[repr(i32)]
pub enum AttributeType {
    Undefined = 0,
    Float = 1,
    Int = 2,
    Ints = 7,
}

impl ValueInfoProto {
    /// Tensor value info; `None` dimensions become the symbolic batch `N`
    pub fn tensor(name: &str, elem_type: TensorDataType, dims: &[Option<i64>]) -> Self {
        use tensor_shape_proto::{dimension::Value as Dim, Dimension};

        let dim = dims
            .iter()
            .map(|d| Dimension {
                value: Some(match d {
                    Some(v) => Dim::DimValue(*v),
                    None => Dim::DimParam("N".to_string()),
                }),
            })
            .collect();

        Self {
            name: Some(name.to_string()),
            r#type: Some(TypeProto {
                value: Some(type_proto::Value::TensorType(type_proto::Tensor {
                    elem_type: Some(elem_type as i32),
                    shape: Some(TensorShapeProto { dim }),
                })),
            }),
        }
    }

    /// `(element type, dims)` with symbolic dimensions rendered as their name
    pub fn signature(&self) -> (String, Vec<String>) {
        use tensor_shape_proto::dimension::Value as Dim;

        let Some(TypeProto {
            value: Some(type_proto::Value::TensorType(tensor)),
        }) = &self.r#type
        else {
            return ("unknown".to_string(), Vec::new());
        };

        let elem = tensor
            .elem_type
            .and_then(|t| TensorDataType::try_from(t).ok())
            .map(|t| t.name().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let dims = tensor
            .shape
            .as_ref()
            .map(|s| {
                s.dim
                    .iter()
                    .map(|d| match &d.value {
                        Some(Dim::DimValue(v)) => v.to_string(),
                        Some(Dim::DimParam(p)) => p.clone(),
                        None => "?".to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        (elem, dims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_info_signature() {
        let info = ValueInfoProto::tensor("input", TensorDataType::Float, &[None, Some(224), Some(224), Some(3)]);
        let (elem, dims) = info.signature();
        assert_eq!(elem, "float32");
        assert_eq!(dims, vec!["N", "224", "224", "3"]);
    }

    #[test]
    fn test_model_encodes_and_decodes() {
        let model = ModelProto {
            ir_version: Some(IR_VERSION),
            producer_name: Some("trash_sort".to_string()),
            opset_import: vec![OperatorSetIdProto {
                domain: Some(String::new()),
                version: Some(13),
            }],
            graph: Some(GraphProto {
                name: Some("g".to_string()),
                node: vec![NodeProto {
                    input: vec!["x".to_string()],
                    output: vec!["y".to_string()],
                    op_type: Some("Relu".to_string()),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        };

        let bytes = model.encode_to_vec();
        let decoded = ModelProto::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded, model);
    }
}
