//! Reconstruction of a trained control policy from its checkpoint.
//!
//! RL training pipelines save the actor as a flat tensor map. The rank-2
//! `*.weight` entries, taken in their natural module order, fully determine
//! the MLP topology; everything else in the checkpoint (optimizer state,
//! action log-std, running statistics) is training-only and dropped here.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, bail};
use candle_core::pickle::PthTensors;
use candle_core::{DType, Device, Tensor};

/// Hidden-layer nonlinearity of the policy network.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    serde::Serialize,
    strum_macros::Display,
    clap::ValueEnum,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    #[default]
    Elu,
    Relu,
    Tanh,
}

impl Activation {
    pub fn apply(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Activation::Elu => x.elu(1.0),
            Activation::Relu => x.relu(),
            Activation::Tanh => x.tanh(),
        }
    }

    pub fn onnx_op(&self) -> &'static str {
        match self {
            Activation::Elu => "Elu",
            Activation::Relu => "Relu",
            Activation::Tanh => "Tanh",
        }
    }
}

#[derive(Debug)]
pub struct Linear {
    pub weight: Tensor,
    pub bias: Option<Tensor>,
}

#[derive(Debug)]
pub struct PolicyNet {
    layers: Vec<Linear>,
    activation: Activation,
}

impl PolicyNet {
    /// Load a policy checkpoint from disk. `.safetensors` files go through
    /// the safetensors reader, anything else through the pickle reader.
    pub fn load(path: &Path, activation: Activation) -> anyhow::Result<Self> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
        let tensors: Vec<(String, Tensor)> = if ext == "safetensors" {
            candle_core::safetensors::load(path, &Device::Cpu)
                .context("failed to read safetensors checkpoint")?
                .into_iter()
                .collect()
        } else {
            let pth = PthTensors::new(path, None).context("failed to read pickle checkpoint")?;
            let names: Vec<String> = pth.tensor_infos().keys().cloned().collect();
            let mut out = Vec::with_capacity(names.len());
            for name in names {
                if let Some(tensor) = pth
                    .get(&name)
                    .with_context(|| format!("failed to read tensor {name}"))?
                {
                    out.push((name, tensor));
                }
            }
            out
        };
        Self::from_tensors(tensors, activation)
    }

    /// Rebuild the actor MLP from a checkpoint tensor map.
    pub fn from_tensors(tensors: Vec<(String, Tensor)>, activation: Activation) -> anyhow::Result<Self> {
        let by_name: HashMap<String, Tensor> = tensors.into_iter().collect();

        let mut weight_names: Vec<&str> = by_name
            .iter()
            .filter(|(name, tensor)| {
                name.rsplit('.').next() == Some("weight")
                    && tensor.dims().len() == 2
                    && is_float(tensor.dtype())
            })
            .map(|(name, _)| name.as_str())
            .collect();
        if weight_names.is_empty() {
            bail!("checkpoint contains no rank-2 weight tensors");
        }
        weight_names.sort_by_key(|name| natural_key(name));

        let mut layers = Vec::with_capacity(weight_names.len());
        for name in &weight_names {
            let weight = by_name[*name].to_dtype(DType::F32)?;
            let stem = &name[..name.len() - "weight".len()];
            let bias = match by_name.get(&format!("{stem}bias")) {
                Some(b) if b.dims().len() == 1 && b.dim(0)? == weight.dim(0)? => {
                    Some(b.to_dtype(DType::F32)?)
                }
                _ => None,
            };
            layers.push(Linear { weight, bias });
        }

        for (i, pair) in layers.windows(2).enumerate() {
            let (out_features, in_features) = (pair[0].weight.dim(0)?, pair[1].weight.dim(1)?);
            if in_features != out_features {
                bail!(
                    "cannot chain linear layers {} ({out_features} outputs) and {} ({in_features} inputs)",
                    weight_names[i],
                    weight_names[i + 1],
                );
            }
        }

        Ok(Self { layers, activation })
    }

    pub fn layers(&self) -> &[Linear] {
        &self.layers
    }

    pub fn activation(&self) -> Activation {
        self.activation
    }

    pub fn observation_size(&self) -> usize {
        self.layers[0].weight.dims()[1]
    }

    pub fn action_size(&self) -> usize {
        self.layers[self.layers.len() - 1].weight.dims()[0]
    }

    /// One inference pass. Fails when the trailing input dimension does not
    /// match the first layer's input features.
    pub fn forward(&self, input: &Tensor) -> candle_core::Result<Tensor> {
        let last = self.layers.len() - 1;
        let mut x = input.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            x = x.matmul(&layer.weight.t()?)?;
            if let Some(bias) = &layer.bias {
                x = x.broadcast_add(bias)?;
            }
            if i != last {
                x = self.activation.apply(&x)?;
            }
        }
        Ok(x)
    }
}

fn is_float(dtype: DType) -> bool {
    matches!(dtype, DType::F16 | DType::BF16 | DType::F32 | DType::F64)
}

#[derive(PartialEq, Eq, PartialOrd, Ord)]
enum KeyPart {
    Number(u64),
    Text(String),
}

/// Split a tensor name so that numeric segments compare numerically,
/// keeping `blocks.2` ahead of `blocks.10`.
fn natural_key(name: &str) -> Vec<KeyPart> {
    let mut parts = Vec::new();
    let mut text = String::new();
    let mut number = String::new();
    for c in name.chars() {
        if c.is_ascii_digit() {
            if !text.is_empty() {
                parts.push(KeyPart::Text(std::mem::take(&mut text)));
            }
            number.push(c);
        } else {
            if !number.is_empty() {
                parts.push(KeyPart::Number(std::mem::take(&mut number).parse().unwrap_or(u64::MAX)));
            }
            text.push(c);
        }
    }
    if !number.is_empty() {
        parts.push(KeyPart::Number(number.parse().unwrap_or(u64::MAX)));
    }
    if !text.is_empty() {
        parts.push(KeyPart::Text(text));
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkpoint(dims: &[usize]) -> Vec<(String, Tensor)> {
        let dev = Device::Cpu;
        let mut tensors = Vec::new();
        for (i, pair) in dims.windows(2).enumerate() {
            let (fan_in, fan_out) = (pair[0], pair[1]);
            // nn.Sequential-style indices: activations occupy the odd slots
            tensors.push((
                format!("actor.{}.weight", 2 * i),
                Tensor::ones((fan_out, fan_in), DType::F32, &dev).unwrap(),
            ));
            tensors.push((
                format!("actor.{}.bias", 2 * i),
                Tensor::zeros(fan_out, DType::F32, &dev).unwrap(),
            ));
        }
        tensors
    }

    #[test]
    fn numeric_segments_order_numerically() {
        assert!(natural_key("actor.2.weight") < natural_key("actor.10.weight"));
        assert!(natural_key("blocks.9.ffn") < natural_key("blocks.11.att"));
    }

    #[test]
    fn rebuilds_layers_in_module_order() {
        let net = PolicyNet::from_tensors(checkpoint(&[48, 64, 32, 12]), Activation::Elu).unwrap();
        assert_eq!(net.layers().len(), 3);
        assert_eq!(net.observation_size(), 48);
        assert_eq!(net.action_size(), 12);
    }

    #[test]
    fn ignores_training_only_tensors() {
        let mut tensors = checkpoint(&[8, 4]);
        tensors.push((
            "std".to_string(),
            Tensor::ones(4, DType::F32, &Device::Cpu).unwrap(),
        ));
        tensors.push((
            "obs_rms.running_mean".to_string(),
            Tensor::zeros(8, DType::F32, &Device::Cpu).unwrap(),
        ));
        let net = PolicyNet::from_tensors(tensors, Activation::Elu).unwrap();
        assert_eq!(net.layers().len(), 1);
    }

    #[test]
    fn rejects_unchainable_layers() {
        let dev = Device::Cpu;
        let tensors = vec![
            (
                "actor.0.weight".to_string(),
                Tensor::ones((16, 8), DType::F32, &dev).unwrap(),
            ),
            (
                "actor.2.weight".to_string(),
                Tensor::ones((4, 32), DType::F32, &dev).unwrap(),
            ),
        ];
        let err = PolicyNet::from_tensors(tensors, Activation::Elu).unwrap_err();
        assert!(err.to_string().contains("chain"));
    }

    #[test]
    fn forward_produces_action_shaped_output() {
        let net = PolicyNet::from_tensors(checkpoint(&[6, 5, 3]), Activation::Tanh).unwrap();
        let input = Tensor::randn(0f32, 1f32, (1, 6), &Device::Cpu).unwrap();
        let output = net.forward(&input).unwrap();
        assert_eq!(output.dims(), &[1, 3]);
    }

    #[test]
    fn forward_rejects_wrong_input_width() {
        let net = PolicyNet::from_tensors(checkpoint(&[6, 5, 3]), Activation::Elu).unwrap();
        let input = Tensor::randn(0f32, 1f32, (1, 7), &Device::Cpu).unwrap();
        assert!(net.forward(&input).is_err());
    }
}
