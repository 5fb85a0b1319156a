//! Best-effort structural checking of exported artifacts.
//!
//! The checker is diagnostic only: its outcome is attached to the
//! conversion result but never turns a successful export into a failure.
//! Builds without the `verify` feature lack the capability entirely and
//! report it as unavailable.

use std::fmt;
use std::path::Path;

#[derive(Clone, Debug)]
pub struct VerifyReport {
    pub node_count: usize,
    pub initializer_count: usize,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

impl fmt::Display for VerifyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} nodes, {} initializers, inputs [{}], outputs [{}]",
            self.node_count,
            self.initializer_count,
            self.inputs.join(", "),
            self.outputs.join(", ")
        )
    }
}

/// Outcome of the post-export check. Deliberately not an error type: the
/// conversion's success/failure channel never carries one of these.
#[derive(Clone, Debug)]
pub enum VerifyOutcome {
    Passed(VerifyReport),
    Failed(String),
    Unavailable(String),
}

impl VerifyOutcome {
    pub fn is_passed(&self) -> bool {
        matches!(self, VerifyOutcome::Passed(_))
    }
}

#[cfg(feature = "verify")]
pub fn check_artifact(path: &Path) -> VerifyOutcome {
    match enabled::check_model_file(path) {
        Ok(report) => VerifyOutcome::Passed(report),
        Err(reason) => VerifyOutcome::Failed(reason),
    }
}

#[cfg(not(feature = "verify"))]
pub fn check_artifact(_path: &Path) -> VerifyOutcome {
    VerifyOutcome::Unavailable(
        "this build does not include the artifact checker (`verify` feature disabled)".to_string(),
    )
}

#[cfg(feature = "verify")]
mod enabled {
    use std::collections::HashSet;
    use std::path::Path;

    use prost::Message;

    use super::VerifyReport;
    use crate::onnx::{ModelProto, TensorProto, tensor_proto};

    pub(super) fn check_model_file(path: &Path) -> Result<VerifyReport, String> {
        let bytes =
            std::fs::read(path).map_err(|e| format!("cannot read {}: {e}", path.display()))?;
        let model = ModelProto::decode(bytes.as_slice())
            .map_err(|e| format!("not a valid ONNX protobuf: {e}"))?;
        check_model(&model)
    }

    pub(super) fn check_model(model: &ModelProto) -> Result<VerifyReport, String> {
        let graph = model.graph.as_ref().ok_or("model has no graph")?;
        if !model
            .opset_import
            .iter()
            .any(|o| o.domain.is_empty() && o.version > 0)
        {
            return Err("model declares no default-domain opset".to_string());
        }
        if graph.input.is_empty() {
            return Err("graph has no inputs".to_string());
        }
        if graph.output.is_empty() {
            return Err("graph has no outputs".to_string());
        }

        let mut known: HashSet<&str> = graph.input.iter().map(|v| v.name.as_str()).collect();
        for init in &graph.initializer {
            check_initializer(init)?;
            if !known.insert(init.name.as_str()) && !graph.input.iter().any(|v| v.name == init.name)
            {
                return Err(format!("duplicate initializer name {}", init.name));
            }
        }

        // Nodes are required to be topologically sorted, so a single pass
        // catches dangling references.
        for node in &graph.node {
            if node.op_type.is_empty() {
                return Err(format!("node {} has no op_type", node.name));
            }
            for input in &node.input {
                if !known.contains(input.as_str()) {
                    return Err(format!(
                        "node {} reads undefined tensor {input}",
                        node.name
                    ));
                }
            }
            for output in &node.output {
                known.insert(output.as_str());
            }
        }
        for output in &graph.output {
            if !known.contains(output.name.as_str()) {
                return Err(format!("graph output {} is never produced", output.name));
            }
        }

        Ok(VerifyReport {
            node_count: graph.node.len(),
            initializer_count: graph.initializer.len(),
            inputs: graph.input.iter().map(|v| v.name.clone()).collect(),
            outputs: graph.output.iter().map(|v| v.name.clone()).collect(),
        })
    }

    fn check_initializer(init: &TensorProto) -> Result<(), String> {
        if init.name.is_empty() {
            return Err("unnamed initializer".to_string());
        }
        if init.data_type == tensor_proto::DataType::Float as i32 {
            let elements: i64 = init.dims.iter().product();
            let expected = elements as usize * 4;
            // An empty payload is a deliberately weight-stripped export.
            if !init.raw_data.is_empty() && init.raw_data.len() != expected {
                return Err(format!(
                    "initializer {} holds {} bytes, expected {expected}",
                    init.name,
                    init.raw_data.len()
                ));
            }
        }
        Ok(())
    }

}
