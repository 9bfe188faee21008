//! Weight naming and the loading seam between checkpoints and the model.
//!
//! Names follow the HF LLaMA layout (`model.layers.{i}.self_attn.q_proj`, ...).
//! A linear named `name` reads `{name}.weight` and, when present,
//! `{name}.bias`.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use layers::{Linear, LinearConfig};

use crate::{config::ModelConfig, ModelError, ModelResult};

pub const EMBED_TOKENS: &str = "model.embed_tokens.weight";
pub const FINAL_NORM: &str = "model.norm.weight";
pub const LM_HEAD: &str = "lm_head";

/// Projections of one decoder block, relative to `model.layers.{i}`.
pub const BLOCK_LINEARS: [&str; 7] = [
    "self_attn.q_proj",
    "self_attn.k_proj",
    "self_attn.v_proj",
    "self_attn.o_proj",
    "mlp.gate_proj",
    "mlp.up_proj",
    "mlp.down_proj",
];

pub fn layer_prefix(layer: usize) -> String {
    format!("model.layers.{layer}")
}

/// `(in_dim, out_dim)` of a block projection.
pub fn block_linear_dims(config: &ModelConfig, relative: &str) -> Option<(usize, usize)> {
    let hidden = config.hidden_size;
    let inner = config.intermediate_size;
    match relative {
        "self_attn.q_proj" | "self_attn.k_proj" | "self_attn.v_proj" | "self_attn.o_proj" => {
            Some((hidden, hidden))
        }
        "mlp.gate_proj" | "mlp.up_proj" => Some((hidden, inner)),
        "mlp.down_proj" => Some((inner, hidden)),
        _ => None,
    }
}

/// Every quantizable linear of the model as `(name, in_dim, out_dim)`.
///
/// The lm head is not listed: it always stays dense.
pub fn quantizable_linears(config: &ModelConfig) -> Vec<(String, usize, usize)> {
    let mut linears = Vec::with_capacity(config.num_hidden_layers * BLOCK_LINEARS.len());
    for layer in 0..config.num_hidden_layers {
        let prefix = layer_prefix(layer);
        for relative in BLOCK_LINEARS {
            if let Some((input, output)) = block_linear_dims(config, relative) {
                linears.push((format!("{prefix}.{relative}"), input, output));
            }
        }
    }
    linears
}

/// Source of named model parameters.
pub trait WeightSource {
    fn contains(&self, name: &str) -> bool;

    fn tensor(&self, name: &str) -> ModelResult<Tensor>;

    /// Builds the projection `name` mapping `in_dim` to `out_dim` features.
    fn linear(&self, name: &str, in_dim: usize, out_dim: usize) -> ModelResult<Linear> {
        let weight = self.tensor(&format!("{name}.weight"))?;
        let bias_name = format!("{name}.bias");
        let bias = if self.contains(&bias_name) {
            Some(self.tensor(&bias_name)?)
        } else {
            None
        };
        let config = LinearConfig::new(in_dim, out_dim).with_bias(bias.is_some());
        Ok(Linear::new(config, weight, bias)?)
    }
}

/// Float parameters held in memory, typically read from a safetensors file.
#[derive(Debug, Clone, Default)]
pub struct DenseWeights {
    tensors: HashMap<String, Tensor>,
}

impl DenseWeights {
    pub fn new(tensors: HashMap<String, Tensor>) -> Self {
        Self { tensors }
    }

    pub fn load(path: impl AsRef<Path>, device: &Device) -> ModelResult<Self> {
        let path = path.as_ref();
        let tensors = candle_core::safetensors::load(path, device)?;
        log::info!("loaded {} tensors from {}", tensors.len(), path.display());
        Ok(Self { tensors })
    }

    pub fn save(&self, path: impl AsRef<Path>) -> ModelResult<()> {
        candle_core::safetensors::save(&self.tensors, path.as_ref())?;
        Ok(())
    }

    /// Random parameters for `config`: normal weights with standard deviation
    /// `std` and unit norm scales.
    pub fn random(config: &ModelConfig, std: f32, dtype: DType, device: &Device) -> ModelResult<Self> {
        config.validate()?;
        let hidden = config.hidden_size;
        let normal = |rows: usize, cols: usize| -> ModelResult<Tensor> {
            Ok(Tensor::randn(0f32, std, (rows, cols), device)?.to_dtype(dtype)?)
        };
        let mut tensors = HashMap::new();
        tensors.insert(EMBED_TOKENS.to_string(), normal(config.vocab_size, hidden)?);
        tensors.insert(FINAL_NORM.to_string(), Tensor::ones(hidden, dtype, device)?);
        if !config.tie_word_embeddings {
            tensors.insert(format!("{LM_HEAD}.weight"), normal(config.vocab_size, hidden)?);
        }
        for layer in 0..config.num_hidden_layers {
            let prefix = layer_prefix(layer);
            for norm in ["input_layernorm", "post_attention_layernorm"] {
                tensors.insert(
                    format!("{prefix}.{norm}.weight"),
                    Tensor::ones(hidden, dtype, device)?,
                );
            }
        }
        for (name, input, output) in quantizable_linears(config) {
            tensors.insert(format!("{name}.weight"), normal(output, input)?);
        }
        Ok(Self { tensors })
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.tensors.insert(name.into(), tensor);
    }

    pub fn tensors(&self) -> &HashMap<String, Tensor> {
        &self.tensors
    }

    pub fn into_tensors(self) -> HashMap<String, Tensor> {
        self.tensors
    }
}

impl WeightSource for DenseWeights {
    fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    fn tensor(&self, name: &str) -> ModelResult<Tensor> {
        self.tensors
            .get(name)
            .cloned()
            .ok_or_else(|| ModelError::MissingWeight(name.to_string()))
    }
}
