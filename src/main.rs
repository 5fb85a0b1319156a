use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;

use policy_onnx::{Activation, ConversionRequest, convert, convert_batch};

/// Convert trained policy checkpoints to ONNX interchange artifacts.
#[derive(Parser, Debug)]
#[command(name = "policy-onnx", version)]
struct Args {
    /// Path to the policy checkpoint (.pt, .pth or .safetensors)
    #[arg(required_unless_present = "batch_convert")]
    model_path: Option<PathBuf>,

    /// Observation vector size (defaults to 48)
    #[arg(long = "input_size")]
    input_size: Option<usize>,

    /// Output artifact path (derived from the source path when omitted)
    #[arg(long = "output_path")]
    output_path: Option<PathBuf>,

    /// Convert every checkpoint under the policy directory next to the
    /// executable instead of a single file
    #[arg(long = "batch_convert")]
    batch_convert: bool,

    /// Hidden-layer activation of the policy network
    #[arg(long, value_enum, default_value_t = Activation::Elu)]
    activation: Activation,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    if args.batch_convert {
        let root = match default_policy_root() {
            Ok(root) => root,
            Err(err) => {
                log::error!("{err:#}");
                return ExitCode::FAILURE;
            }
        };
        match convert_batch(&root, args.input_size, args.activation) {
            Ok(summary) => {
                println!(
                    "Batch conversion completed: {}/{} models converted successfully",
                    summary.succeeded, summary.total
                );
                ExitCode::SUCCESS
            }
            Err(err) => {
                log::error!("{err}");
                ExitCode::FAILURE
            }
        }
    } else {
        let Some(model_path) = args.model_path else {
            log::error!("model_path is required unless --batch_convert is set");
            return ExitCode::FAILURE;
        };
        let request = ConversionRequest {
            source: model_path,
            input_size: args.input_size,
            output: args.output_path,
            activation: args.activation,
        };
        let result = convert(&request);
        if result.succeeded {
            println!("{}", result.message);
            ExitCode::SUCCESS
        } else {
            log::error!("{}", result.message);
            ExitCode::FAILURE
        }
    }
}

fn default_policy_root() -> anyhow::Result<PathBuf> {
    let exe = std::env::current_exe().context("cannot locate the running executable")?;
    Ok(exe
        .parent()
        .context("executable has no parent directory")?
        .join("policy"))
}
