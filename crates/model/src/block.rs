use attention::{AttentionMode, FusedAttention, KvCacheEntry};
use candle_core::Tensor;
use embedding::RotaryEmbedding;
use layers::{
    checks, dtypes::PrecisionPolicy, FeedForwardConfig, GatedMlp, Linear, LinearLayer, NormConfig,
    NormalizationLayer, RmsNorm,
};

use crate::{
    config::ModelConfig,
    weights::{block_linear_dims, layer_prefix, WeightSource},
    ModelError, ModelResult,
};

/// Pre-norm decoder block: attention and gated MLP, each wrapped in a
/// residual connection.
#[derive(Debug, Clone)]
pub struct DecoderBlock {
    index: usize,
    hidden_size: usize,
    heads: usize,
    head_dim: usize,
    input_norm: RmsNorm,
    post_attention_norm: RmsNorm,
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    mlp: GatedMlp,
}

/// What one block hands back besides the hidden state.
#[derive(Debug)]
pub struct BlockOutput {
    pub hidden: Tensor,
    pub present: Option<KvCacheEntry>,
    pub attention_weights: Option<Tensor>,
}

impl DecoderBlock {
    pub fn load(index: usize, config: &ModelConfig, weights: &dyn WeightSource) -> ModelResult<Self> {
        let prefix = layer_prefix(index);
        let norm_config = NormConfig::from_attributes(config.hidden_size, &config.epsilon_attributes())?;
        let norm = |name: &str| -> ModelResult<RmsNorm> {
            let weight = weights.tensor(&format!("{prefix}.{name}.weight"))?;
            Ok(RmsNorm::new(weight, norm_config.clone())?)
        };
        let linear = |relative: &str| -> ModelResult<Linear> {
            let (input, output) = block_linear_dims(config, relative)
                .ok_or_else(|| ModelError::Config(format!("unknown projection {relative}")))?;
            weights.linear(&format!("{prefix}.{relative}"), input, output)
        };

        let mlp = GatedMlp::new(
            FeedForwardConfig {
                hidden_size: config.hidden_size,
                intermediate_size: config.intermediate_size,
                activation: config.hidden_act,
            },
            linear("mlp.gate_proj")?,
            linear("mlp.up_proj")?,
            linear("mlp.down_proj")?,
        )?;

        Ok(Self {
            index,
            hidden_size: config.hidden_size,
            heads: config.num_attention_heads,
            head_dim: config.head_dim(),
            input_norm: norm("input_layernorm")?,
            post_attention_norm: norm("post_attention_layernorm")?,
            q_proj: linear("self_attn.q_proj")?,
            k_proj: linear("self_attn.k_proj")?,
            v_proj: linear("self_attn.v_proj")?,
            o_proj: linear("self_attn.o_proj")?,
            mlp,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Projections keyed by their name relative to the block prefix.
    pub fn linears(&self) -> Vec<(&'static str, &Linear)> {
        let mut linears = vec![
            ("self_attn.q_proj", &self.q_proj),
            ("self_attn.k_proj", &self.k_proj),
            ("self_attn.v_proj", &self.v_proj),
            ("self_attn.o_proj", &self.o_proj),
        ];
        for (name, linear) in self.mlp.linears() {
            linears.push((mlp_name(name), linear));
        }
        linears
    }

    pub fn linears_mut(&mut self) -> Vec<(&'static str, &mut Linear)> {
        let mut linears = vec![
            ("self_attn.q_proj", &mut self.q_proj),
            ("self_attn.k_proj", &mut self.k_proj),
            ("self_attn.v_proj", &mut self.v_proj),
            ("self_attn.o_proj", &mut self.o_proj),
        ];
        for (name, linear) in self.mlp.linears_mut() {
            linears.push((mlp_name(name), linear));
        }
        linears
    }

    /// Norm scales keyed by their full parameter name.
    pub fn norm_weights(&self) -> [(String, &Tensor); 2] {
        let prefix = layer_prefix(self.index);
        [
            (format!("{prefix}.input_layernorm.weight"), self.input_norm.weight()),
            (
                format!("{prefix}.post_attention_layernorm.weight"),
                self.post_attention_norm.weight(),
            ),
        ]
    }

    /// Runs the block over `[rows, seq, hidden]` states.
    ///
    /// `seq_len` is the total context length including cached positions.
    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &self,
        hidden: &Tensor,
        position_ids: &Tensor,
        seq_len: usize,
        rope: &RotaryEmbedding,
        executor: &FusedAttention,
        past: Option<KvCacheEntry>,
        mode: AttentionMode<'_>,
        policy: &PrecisionPolicy,
    ) -> ModelResult<BlockOutput> {
        checks::expect_last_dim("block.input", hidden, self.hidden_size)?;
        let (rows, seq, _) = hidden.dims3()?;

        let normed = self.input_norm.forward(hidden, policy)?;
        let qkv = Tensor::cat(
            &[
                &self.q_proj.forward(&normed, policy)?,
                &self.k_proj.forward(&normed, policy)?,
                &self.v_proj.forward(&normed, policy)?,
            ],
            2,
        )?;
        let (query, key, value) = rope
            .apply(
                &qkv,
                position_ids,
                self.heads,
                self.head_dim,
                self.head_dim / 2,
                self.head_dim,
                Some(seq_len),
                true,
            )?
            .into_split()?;

        let scale_attn = (self.head_dim as f32).sqrt();
        let attended = executor.forward(&query, &key, &value, scale_attn, past, mode)?;
        let merged = attended
            .output
            .transpose(1, 2)?
            .reshape((rows, seq, self.hidden_size))?;
        let after_attention = (hidden + self.o_proj.forward(&merged, policy)?)?;

        let normed = self.post_attention_norm.forward(&after_attention, policy)?;
        let hidden = (&after_attention + self.mlp.forward(&normed, policy)?)?;
        Ok(BlockOutput {
            hidden,
            present: attended.present,
            attention_weights: attended.weights,
        })
    }
}

fn mlp_name(name: &'static str) -> &'static str {
    match name {
        "gate_proj" => "mlp.gate_proj",
        "up_proj" => "mlp.up_proj",
        _ => "mlp.down_proj",
    }
}
