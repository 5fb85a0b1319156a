//! Conversion of trained legged-robot policy checkpoints into ONNX
//! interchange artifacts.
//!
//! The pipeline loads a checkpoint through candle, rebuilds the actor MLP,
//! validates it with one forward pass on a synthetic observation, serializes
//! the graph as ONNX with named `observations`/`actions` tensors and a
//! dynamic batch axis, and finishes with a best-effort structural check of
//! the written artifact.

pub mod convert;
pub mod export;
pub mod onnx;
pub mod policy;
pub mod verify;

pub use convert::{
    BatchSummary, COMMON_OBSERVATION_SIZES, ConversionRequest, ConversionResult, ConvertError,
    DEFAULT_OBSERVATION_SIZE, POLICY_EXTENSIONS, convert, convert_batch, convert_with_check,
    derive_output_path,
};
pub use export::{
    BATCH_DIM_PARAM, ExportError, ExportOptions, OPSET_VERSION, build_model_proto, export_policy,
};
pub use policy::{Activation, Linear, PolicyNet};
pub use verify::{VerifyOutcome, VerifyReport, check_artifact};
