//! ONNX graph construction and serialization for policy networks.
//!
//! The graph is rebuilt from the checkpoint weights rather than traced: one
//! `Gemm` per linear layer with the activation between hidden layers, the
//! learned parameters embedded as initializers, and the batch axis of the
//! named input/output tensors declared dynamic.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use candle_core::{DType, Tensor};
use prost::Message;

use crate::onnx::{
    AttributeProto, GraphProto, ModelProto, NodeProto, OperatorSetIdProto,
    StringStringEntryProto, TensorProto, TensorShapeProto, TypeProto, ValueInfoProto,
    attribute_proto::AttributeType, tensor_proto, tensor_shape_proto, type_proto,
};
use crate::policy::PolicyNet;

pub const OPSET_VERSION: i64 = 11;
pub const BATCH_DIM_PARAM: &str = "batch_size";

const IR_VERSION: i64 = 8;
const METADATA_KEY: &str = "policy_onnx_metadata";

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("policy has no layers to export")]
    EmptyGraph,
    #[error("sample input is [{got:?}] but the policy expects [1, {expected}]")]
    SampleShape { expected: usize, got: Vec<usize> },
    #[error("failed to extract weight data: {0}")]
    Weights(#[from] candle_core::Error),
    #[error("failed to encode model metadata: {0}")]
    Metadata(#[from] serde_json::Error),
    #[error("failed to write {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Exporter invocation parameters, all defaulted to the conversion
/// pipeline's contract: opset 11, parameters embedded, constant folding on,
/// tensors named `observations`/`actions` with a dynamic batch axis.
#[derive(Clone, Debug)]
pub struct ExportOptions {
    pub opset_version: i64,
    pub embed_params: bool,
    pub constant_folding: bool,
    pub input_name: String,
    pub output_name: String,
    pub dynamic_batch: bool,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            opset_version: OPSET_VERSION,
            embed_params: true,
            constant_folding: true,
            input_name: "observations".to_string(),
            output_name: "actions".to_string(),
            dynamic_batch: true,
        }
    }
}

#[derive(serde::Serialize)]
struct GraphMetadata {
    observation_size: usize,
    action_size: usize,
    hidden_layers: usize,
    activation: crate::policy::Activation,
}

/// Build the model and write it to `output_path` in a single filesystem
/// write, so a failed export leaves no partial artifact behind.
pub fn export_policy(
    policy: &PolicyNet,
    sample: &Tensor,
    output_path: &Path,
    options: &ExportOptions,
) -> Result<(), ExportError> {
    let model = build_model_proto(policy, sample, options)?;
    std::fs::write(output_path, model.encode_to_vec()).map_err(|source| ExportError::Io {
        path: output_path.to_path_buf(),
        source,
    })?;
    Ok(())
}

pub fn build_model_proto(
    policy: &PolicyNet,
    sample: &Tensor,
    options: &ExportOptions,
) -> Result<ModelProto, ExportError> {
    if policy.layers().is_empty() {
        return Err(ExportError::EmptyGraph);
    }
    if sample.dims() != [1, policy.observation_size()] {
        return Err(ExportError::SampleShape {
            expected: policy.observation_size(),
            got: sample.dims().to_vec(),
        });
    }

    let last = policy.layers().len() - 1;
    let mut nodes = Vec::new();
    let mut initializers = Vec::new();
    let mut value_info = Vec::new();

    let mut upstream = options.input_name.clone();
    for (i, layer) in policy.layers().iter().enumerate() {
        let weight_name = format!("layers.{i}.weight");
        initializers.push(initializer(&weight_name, &layer.weight, options.embed_params)?);
        let mut inputs = vec![upstream.clone(), weight_name];
        if let Some(bias) = &layer.bias {
            let bias_name = format!("layers.{i}.bias");
            initializers.push(initializer(&bias_name, bias, options.embed_params)?);
            inputs.push(bias_name);
        }

        let out_features = layer.weight.dims()[0];
        let gemm_out = if i == last {
            options.output_name.clone()
        } else {
            format!("gemm_{i}")
        };
        nodes.push(NodeProto {
            input: inputs,
            output: vec![gemm_out.clone()],
            name: format!("layers.{i}.gemm"),
            op_type: "Gemm".to_string(),
            attribute: vec![
                float_attr("alpha", 1.0),
                float_attr("beta", 1.0),
                int_attr("transB", 1),
            ],
            ..Default::default()
        });

        if i == last {
            break;
        }
        value_info.push(value_info_proto(&gemm_out, out_features, options));
        let act_out = format!("act_{i}");
        let op = policy.activation().onnx_op();
        nodes.push(NodeProto {
            input: vec![gemm_out],
            output: vec![act_out.clone()],
            name: format!("layers.{i}.act"),
            op_type: op.to_string(),
            attribute: if op == "Elu" {
                vec![float_attr("alpha", 1.0)]
            } else {
                vec![]
            },
            ..Default::default()
        });
        value_info.push(value_info_proto(&act_out, out_features, options));
        upstream = act_out;
    }

    let mut graph = GraphProto {
        node: nodes,
        name: "policy".to_string(),
        initializer: initializers,
        input: vec![value_info_proto(
            &options.input_name,
            policy.observation_size(),
            options,
        )],
        output: vec![value_info_proto(
            &options.output_name,
            policy.action_size(),
            options,
        )],
        value_info,
        ..Default::default()
    };

    if options.constant_folding {
        let folded = fold_constants(&mut graph);
        if folded > 0 {
            log::info!("constant folding removed {folded} nodes");
        }
    }

    let metadata = GraphMetadata {
        observation_size: policy.observation_size(),
        action_size: policy.action_size(),
        hidden_layers: policy.layers().len() - 1,
        activation: policy.activation(),
    };

    Ok(ModelProto {
        ir_version: IR_VERSION,
        producer_name: env!("CARGO_PKG_NAME").to_string(),
        producer_version: env!("CARGO_PKG_VERSION").to_string(),
        graph: Some(graph),
        opset_import: vec![OperatorSetIdProto {
            domain: String::new(),
            version: options.opset_version,
        }],
        metadata_props: vec![StringStringEntryProto {
            key: METADATA_KEY.to_string(),
            value: serde_json::to_string(&metadata)?,
        }],
        ..Default::default()
    })
}

fn initializer(name: &str, tensor: &Tensor, embed: bool) -> Result<TensorProto, ExportError> {
    let dims: Vec<i64> = tensor.dims().iter().map(|d| *d as i64).collect();
    let raw_data = if embed {
        let values = tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let mut raw = Vec::with_capacity(values.len() * 4);
        for v in values {
            raw.extend_from_slice(&v.to_le_bytes());
        }
        raw
    } else {
        Vec::new()
    };
    Ok(TensorProto {
        dims,
        data_type: tensor_proto::DataType::Float as i32,
        name: name.to_string(),
        raw_data,
        ..Default::default()
    })
}

fn value_info_proto(name: &str, features: usize, options: &ExportOptions) -> ValueInfoProto {
    let batch_dim = if options.dynamic_batch {
        tensor_shape_proto::Dimension {
            denotation: "DATA_BATCH".to_string(),
            value: Some(tensor_shape_proto::dimension::Value::DimParam(
                BATCH_DIM_PARAM.to_string(),
            )),
        }
    } else {
        tensor_shape_proto::Dimension {
            denotation: String::new(),
            value: Some(tensor_shape_proto::dimension::Value::DimValue(1)),
        }
    };
    ValueInfoProto {
        name: name.to_string(),
        r#type: Some(TypeProto {
            denotation: String::new(),
            value: Some(type_proto::Value::TensorType(type_proto::Tensor {
                elem_type: tensor_proto::DataType::Float as i32,
                shape: Some(TensorShapeProto {
                    dim: vec![
                        batch_dim,
                        tensor_shape_proto::Dimension {
                            denotation: String::new(),
                            value: Some(tensor_shape_proto::dimension::Value::DimValue(
                                features as i64,
                            )),
                        },
                    ],
                }),
            })),
        }),
        ..Default::default()
    }
}

fn float_attr(name: &str, value: f32) -> AttributeProto {
    AttributeProto {
        name: name.to_string(),
        f: value,
        r#type: AttributeType::Float as i32,
        ..Default::default()
    }
}

fn int_attr(name: &str, value: i64) -> AttributeProto {
    AttributeProto {
        name: name.to_string(),
        i: value,
        r#type: AttributeType::Int as i32,
        ..Default::default()
    }
}

/// Evaluate activation nodes whose input is an embedded initializer and
/// replace them with the computed tensor. Returns the number of nodes folded.
pub(crate) fn fold_constants(graph: &mut GraphProto) -> usize {
    let mut folded = 0;
    loop {
        let constants: HashSet<String> = graph
            .initializer
            .iter()
            .filter(|t| !t.raw_data.is_empty())
            .map(|t| t.name.clone())
            .collect();
        let Some(pos) = graph.node.iter().position(|n| {
            matches!(n.op_type.as_str(), "Elu" | "Relu" | "Tanh")
                && n.input.len() == 1
                && n.output.len() == 1
                && constants.contains(&n.input[0])
        }) else {
            break;
        };
        let node = graph.node.remove(pos);
        let Some(source) = graph.initializer.iter().find(|t| t.name == node.input[0]) else {
            break;
        };
        let alpha = node
            .attribute
            .iter()
            .find(|a| a.name == "alpha")
            .map(|a| a.f)
            .unwrap_or(1.0);
        let values = source
            .raw_data
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .map(|v| match node.op_type.as_str() {
                "Elu" => {
                    if v > 0.0 {
                        v
                    } else {
                        alpha * (v.exp() - 1.0)
                    }
                }
                "Relu" => v.max(0.0),
                _ => v.tanh(),
            });
        let mut raw_data = Vec::with_capacity(source.raw_data.len());
        for v in values {
            raw_data.extend_from_slice(&v.to_le_bytes());
        }
        graph.initializer.push(TensorProto {
            dims: source.dims.clone(),
            data_type: tensor_proto::DataType::Float as i32,
            name: node.output[0].clone(),
            raw_data,
            ..Default::default()
        });
        folded += 1;
    }
    folded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{Activation, PolicyNet};
    use candle_core::Device;

    fn tiny_policy(activation: Activation) -> PolicyNet {
        let dev = Device::Cpu;
        let tensors = vec![
            (
                "actor.0.weight".to_string(),
                Tensor::ones((5, 4), DType::F32, &dev).unwrap(),
            ),
            (
                "actor.0.bias".to_string(),
                Tensor::zeros(5, DType::F32, &dev).unwrap(),
            ),
            (
                "actor.2.weight".to_string(),
                Tensor::ones((3, 5), DType::F32, &dev).unwrap(),
            ),
            (
                "actor.2.bias".to_string(),
                Tensor::zeros(3, DType::F32, &dev).unwrap(),
            ),
        ];
        PolicyNet::from_tensors(tensors, activation).unwrap()
    }

    fn sample(width: usize) -> Tensor {
        Tensor::randn(0f32, 1f32, (1, width), &Device::Cpu).unwrap()
    }

    #[test]
    fn builds_gemm_activation_chain() {
        let policy = tiny_policy(Activation::Elu);
        let model =
            build_model_proto(&policy, &sample(4), &ExportOptions::default()).unwrap();
        let graph = model.graph.unwrap();
        let ops: Vec<&str> = graph.node.iter().map(|n| n.op_type.as_str()).collect();
        assert_eq!(ops, ["Gemm", "Elu", "Gemm"]);
        assert_eq!(graph.input[0].name, "observations");
        assert_eq!(graph.output[0].name, "actions");
        assert_eq!(graph.initializer.len(), 4);
        assert_eq!(model.opset_import[0].version, OPSET_VERSION);
    }

    #[test]
    fn dynamic_batch_axis_is_declared_on_both_ends() {
        let policy = tiny_policy(Activation::Relu);
        let model =
            build_model_proto(&policy, &sample(4), &ExportOptions::default()).unwrap();
        let graph = model.graph.unwrap();
        for vi in [&graph.input[0], &graph.output[0]] {
            let Some(type_proto::Value::TensorType(t)) =
                &vi.r#type.as_ref().unwrap().value
            else {
                panic!("missing tensor type on {}", vi.name);
            };
            let dim = &t.shape.as_ref().unwrap().dim[0];
            assert_eq!(
                dim.value,
                Some(tensor_shape_proto::dimension::Value::DimParam(
                    BATCH_DIM_PARAM.to_string()
                ))
            );
        }
    }

    #[test]
    fn sample_width_mismatch_is_rejected() {
        let policy = tiny_policy(Activation::Elu);
        let err =
            build_model_proto(&policy, &sample(9), &ExportOptions::default()).unwrap_err();
        assert!(matches!(err, ExportError::SampleShape { expected: 4, .. }));
    }

    #[test]
    fn embed_params_false_strips_payloads() {
        let policy = tiny_policy(Activation::Elu);
        let options = ExportOptions {
            embed_params: false,
            ..Default::default()
        };
        let model = build_model_proto(&policy, &sample(4), &options).unwrap();
        assert!(
            model
                .graph
                .unwrap()
                .initializer
                .iter()
                .all(|t| t.raw_data.is_empty())
        );
    }

    #[test]
    fn folds_activation_over_initializer() {
        let mut graph = GraphProto {
            node: vec![NodeProto {
                input: vec!["const".to_string()],
                output: vec!["folded".to_string()],
                op_type: "Relu".to_string(),
                ..Default::default()
            }],
            initializer: vec![TensorProto {
                dims: vec![2],
                data_type: tensor_proto::DataType::Float as i32,
                name: "const".to_string(),
                raw_data: [-1.0f32, 2.0]
                    .iter()
                    .flat_map(|v| v.to_le_bytes())
                    .collect(),
                ..Default::default()
            }],
            ..Default::default()
        };
        assert_eq!(fold_constants(&mut graph), 1);
        assert!(graph.node.is_empty());
        let folded = graph.initializer.iter().find(|t| t.name == "folded").unwrap();
        assert_eq!(&folded.raw_data[..4], &0.0f32.to_le_bytes());
        assert_eq!(&folded.raw_data[4..], &2.0f32.to_le_bytes());
    }

    #[test]
    fn exported_graphs_never_fold_in_practice() {
        let policy = tiny_policy(Activation::Elu);
        let model =
            build_model_proto(&policy, &sample(4), &ExportOptions::default()).unwrap();
        assert_eq!(model.graph.unwrap().node.len(), 3);
    }
}
