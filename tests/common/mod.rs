use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};

fn checkpoint_tensors(dims: &[usize]) -> HashMap<String, Tensor> {
    let dev = Device::Cpu;
    let mut tensors = HashMap::new();
    for (i, pair) in dims.windows(2).enumerate() {
        let (fan_in, fan_out) = (pair[0], pair[1]);
        let weight = Tensor::ones((fan_out, fan_in), DType::F32, &dev)
            .unwrap()
            .affine(1.0 / fan_in as f64, 0.0)
            .unwrap();
        tensors.insert(format!("actor.{}.weight", 2 * i), weight);
        tensors.insert(
            format!("actor.{}.bias", 2 * i),
            Tensor::zeros(fan_out, DType::F32, &dev).unwrap(),
        );
    }
    // Gaussian policies carry an action log-std the loader must ignore.
    tensors.insert(
        "std".to_string(),
        Tensor::ones(*dims.last().unwrap(), DType::F32, &dev).unwrap(),
    );
    tensors
}

pub fn write_checkpoint(dir: &Path, name: &str, dims: &[usize]) -> PathBuf {
    let path = dir.join(name);
    candle_core::safetensors::save(&checkpoint_tensors(dims), &path).unwrap();
    path
}
