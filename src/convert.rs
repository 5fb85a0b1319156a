//! The conversion pipeline: resolve defaults, load the checkpoint, run one
//! validation forward pass, export, then best-effort verification.
//!
//! Every failure is caught at the single-file boundary and rendered into a
//! [`ConversionResult`]; nothing propagates to the batch loop or the CLI
//! beyond that struct.

use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};

use crate::export::{ExportError, ExportOptions, export_policy};
use crate::policy::{Activation, PolicyNet};
use crate::verify::{self, VerifyOutcome};

/// Fallback observation dimensionality when none is requested.
pub const DEFAULT_OBSERVATION_SIZE: usize = 48;
/// Observation sizes seen across the supported robot configurations.
pub const COMMON_OBSERVATION_SIZES: [usize; 5] = [45, 48, 51, 57, 87];
/// Checkpoint extensions recognized by batch discovery.
pub const POLICY_EXTENSIONS: [&str; 3] = ["pt", "pth", "safetensors"];

const OUTPUT_EXTENSION: &str = "onnx";

#[derive(Clone, Debug)]
pub struct ConversionRequest {
    pub source: PathBuf,
    /// Observation vector width; `None` selects [`DEFAULT_OBSERVATION_SIZE`].
    pub input_size: Option<usize>,
    /// Artifact destination; `None` derives it from the source path.
    pub output: Option<PathBuf>,
    pub activation: Activation,
}

impl ConversionRequest {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            input_size: None,
            output: None,
            activation: Activation::default(),
        }
    }
}

#[derive(Debug)]
pub struct ConversionResult {
    pub succeeded: bool,
    pub output: Option<PathBuf>,
    pub message: String,
    /// Post-export diagnostic, populated only when the export itself
    /// succeeded. Never influences `succeeded`.
    pub verification: Option<VerifyOutcome>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("{} not found", .0.display())]
    NotFound(PathBuf),
    #[error("failed to load policy from {}: {cause:#}", .path.display())]
    Load { path: PathBuf, cause: anyhow::Error },
    #[error(
        "forward pass failed for input size {input_size}, retry with --input_size set to one of {COMMON_OBSERVATION_SIZES:?}: {source}"
    )]
    ShapeMismatch {
        input_size: usize,
        #[source]
        source: candle_core::Error,
    },
    #[error("export failed: {0}")]
    Export(#[from] ExportError),
}

/// Default output path: the source path with its extension swapped for
/// `.onnx`.
pub fn derive_output_path(source: &Path) -> PathBuf {
    source.with_extension(OUTPUT_EXTENSION)
}

pub fn convert(request: &ConversionRequest) -> ConversionResult {
    convert_with_check(request, verify::check_artifact)
}

/// Like [`convert`], with the post-export check supplied by the caller. The
/// check runs only after a successful export and its outcome is reported,
/// never escalated.
pub fn convert_with_check(
    request: &ConversionRequest,
    check: impl Fn(&Path) -> VerifyOutcome,
) -> ConversionResult {
    match run_single(request, check) {
        Ok((output, verification)) => ConversionResult {
            succeeded: true,
            message: format!(
                "successfully converted {} to {}",
                request.source.display(),
                output.display()
            ),
            output: Some(output),
            verification: Some(verification),
        },
        Err(err) => ConversionResult {
            succeeded: false,
            output: None,
            message: err.to_string(),
            verification: None,
        },
    }
}

fn run_single(
    request: &ConversionRequest,
    check: impl Fn(&Path) -> VerifyOutcome,
) -> Result<(PathBuf, VerifyOutcome), ConvertError> {
    if !request.source.is_file() {
        return Err(ConvertError::NotFound(request.source.clone()));
    }
    let output = request
        .output
        .clone()
        .unwrap_or_else(|| derive_output_path(&request.source));

    log::info!("loading policy checkpoint {}", request.source.display());
    let policy =
        PolicyNet::load(&request.source, request.activation).map_err(|cause| ConvertError::Load {
            path: request.source.clone(),
            cause,
        })?;
    log::info!(
        "reconstructed policy: {} linear layers, {} observations -> {} actions",
        policy.layers().len(),
        policy.observation_size(),
        policy.action_size()
    );

    let input_size = match request.input_size {
        Some(size) => size,
        None => {
            log::warn!("input size not specified, using default {DEFAULT_OBSERVATION_SIZE}");
            log::warn!(
                "if the forward pass fails, retry with --input_size set to one of {COMMON_OBSERVATION_SIZES:?}"
            );
            DEFAULT_OBSERVATION_SIZE
        }
    };

    let sample = Tensor::randn(0f32, 1f32, (1, input_size), &Device::Cpu)
        .map_err(|source| ConvertError::ShapeMismatch { input_size, source })?;
    let actions = policy
        .forward(&sample)
        .map_err(|source| ConvertError::ShapeMismatch { input_size, source })?;
    log::info!(
        "forward pass ok: input [1, {input_size}], output {:?}",
        actions.dims()
    );

    log::info!("exporting to {}", output.display());
    export_policy(&policy, &sample, &output, &ExportOptions::default())?;

    let verification = check(&output);
    match &verification {
        VerifyOutcome::Passed(report) => log::info!("artifact check passed: {report}"),
        VerifyOutcome::Failed(reason) => {
            log::warn!("artifact check failed: {reason} (the export itself succeeded)");
        }
        VerifyOutcome::Unavailable(reason) => log::warn!("artifact check skipped: {reason}"),
    }

    Ok((output, verification))
}

/// Convert every checkpoint under `root`, one at a time, each with a derived
/// output path. Individual failures are counted, never propagated.
pub fn convert_batch(
    root: &Path,
    input_size: Option<usize>,
    activation: Activation,
) -> Result<BatchSummary, ConvertError> {
    if !root.is_dir() {
        return Err(ConvertError::NotFound(root.to_path_buf()));
    }
    let mut candidates = Vec::new();
    collect_policy_files(root, &mut candidates);

    let mut summary = BatchSummary::default();
    for path in candidates {
        log::info!("--- converting {} ---", path.display());
        summary.total += 1;
        let request = ConversionRequest {
            source: path,
            input_size,
            output: None,
            activation,
        };
        let result = convert(&request);
        if result.succeeded {
            summary.succeeded += 1;
        } else {
            log::error!("{}", result.message);
        }
    }
    Ok(summary)
}

fn collect_policy_files(dir: &Path, out: &mut Vec<PathBuf>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            log::warn!("skipping unreadable directory {}: {err}", dir.display());
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_policy_files(&path, out);
        } else if path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| POLICY_EXTENSIONS.contains(&ext))
        {
            out.push(path);
        }
    }
}
