use attention::{
    masks::{additive_from_attention_mask, causal_with_attention_mask},
    AttentionMode, ExecutorConfig, FusedAttention, KeyValueCache, KvCacheEntry,
};
use candle_core::{DType, Device, Tensor};
use embedding::{RopeConfig, RotaryEmbedding, TokenEmbedding};
use layers::{
    dtypes::PrecisionPolicy, Linear, LinearConfig, LinearLayer, NormConfig, NormalizationLayer,
    RmsNorm,
};

use crate::{
    block::DecoderBlock,
    config::ModelConfig,
    weights::{layer_prefix, WeightSource, EMBED_TOKENS, FINAL_NORM, LM_HEAD},
    ModelError, ModelResult,
};

/// How the decoder treats its key/value caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    /// Recompute over the whole input every call; no cache is kept.
    None,
    /// Keep every position.
    #[default]
    Full,
    /// Keep at most `cutoff` past positions per layer.
    SlidingWindow { cutoff: usize },
}

#[derive(Debug)]
pub struct ModelOutput {
    /// `[rows, seq, vocab]` in the model dtype.
    pub logits: Tensor,
    /// One cache per layer, absent for [`CacheMode::None`].
    pub present: Option<Vec<KvCacheEntry>>,
    /// Per-layer attention probabilities, only for [`CacheMode::Full`].
    pub attentions: Vec<Tensor>,
}

/// Decoder-only transformer assembled from the shared crates.
#[derive(Debug)]
pub struct Model {
    config: ModelConfig,
    policy: PrecisionPolicy,
    embedding: TokenEmbedding,
    blocks: Vec<DecoderBlock>,
    final_norm: RmsNorm,
    lm_head: Linear,
    rope: RotaryEmbedding,
    executor: FusedAttention,
}

impl Model {
    /// Builds the model from named weights. The embedding table decides the
    /// storage dtype and device.
    pub fn load(config: ModelConfig, weights: &dyn WeightSource) -> ModelResult<Self> {
        config.validate()?;
        let embedding = TokenEmbedding::new(weights.tensor(EMBED_TOKENS)?)?;
        if embedding.vocab_size() != config.vocab_size || embedding.hidden_dim() != config.hidden_size {
            return Err(ModelError::Config(format!(
                "embedding table {:?} does not match vocab {} x hidden {}",
                embedding.weight().dims(),
                config.vocab_size,
                config.hidden_size
            )));
        }
        let dtype = embedding.weight().dtype();
        let device = embedding.weight().device().clone();
        let policy = PrecisionPolicy::from_parameter_dtype(dtype);

        let blocks = (0..config.num_hidden_layers)
            .map(|index| DecoderBlock::load(index, &config, weights))
            .collect::<ModelResult<Vec<_>>>()?;
        let final_norm = RmsNorm::new(
            weights.tensor(FINAL_NORM)?,
            NormConfig::from_attributes(config.hidden_size, &config.epsilon_attributes())?,
        )?;
        let lm_head_weight = format!("{LM_HEAD}.weight");
        let lm_head = if weights.contains(&lm_head_weight) {
            weights.linear(LM_HEAD, config.hidden_size, config.vocab_size)?
        } else if config.tie_word_embeddings {
            Linear::new(
                LinearConfig::new(config.hidden_size, config.vocab_size),
                embedding.weight().clone(),
                None,
            )?
        } else {
            return Err(ModelError::MissingWeight(lm_head_weight));
        };

        let rope = RotaryEmbedding::new(
            RopeConfig::new(config.max_position_embeddings, config.head_dim()).with_base(config.rope_theta),
            &device,
        )?;
        let executor = FusedAttention::new(ExecutorConfig {
            text_max_length: config.max_position_embeddings,
            ..ExecutorConfig::default()
        });
        log::info!(
            "model: layers={} hidden={} heads={} vocab={} dtype={:?}",
            config.num_hidden_layers,
            config.hidden_size,
            config.num_attention_heads,
            config.vocab_size,
            dtype
        );

        Ok(Self {
            config,
            policy,
            embedding,
            blocks,
            final_norm,
            lm_head,
            rope,
            executor,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn dtype(&self) -> DType {
        self.embedding.weight().dtype()
    }

    pub fn device(&self) -> &Device {
        self.embedding.weight().device()
    }

    /// Sets the number of beams sharing a batch item and the cache capacity
    /// used by subsequent cached calls.
    pub fn configure_cache(&mut self, beam_width: usize, text_max_length: usize) {
        let current = self.executor.config();
        if current.beam_width == beam_width && current.text_max_length == text_max_length {
            return;
        }
        self.executor = FusedAttention::new(ExecutorConfig {
            beam_width,
            text_max_length,
            ..current.clone()
        });
    }

    pub fn executor_config(&self) -> &ExecutorConfig {
        self.executor.config()
    }

    /// Quantizable projections keyed by full name, in layer order.
    pub fn linears(&self) -> Vec<(String, &Linear)> {
        self.blocks
            .iter()
            .flat_map(|block| {
                let prefix = layer_prefix(block.index());
                block
                    .linears()
                    .into_iter()
                    .map(move |(name, linear)| (format!("{prefix}.{name}"), linear))
            })
            .collect()
    }

    pub fn linears_mut(&mut self) -> Vec<(String, &mut Linear)> {
        self.blocks
            .iter_mut()
            .flat_map(|block| {
                let prefix = layer_prefix(block.index());
                block
                    .linears_mut()
                    .into_iter()
                    .map(move |(name, linear)| (format!("{prefix}.{name}"), linear))
            })
            .collect()
    }

    /// Parameters outside the quantizable projections: embeddings, norm
    /// scales and the lm head.
    pub fn dense_parameters(&self) -> ModelResult<Vec<(String, Tensor)>> {
        let mut params = vec![
            (EMBED_TOKENS.to_string(), self.embedding.weight().clone()),
            (FINAL_NORM.to_string(), self.final_norm.weight().clone()),
            (format!("{LM_HEAD}.weight"), self.lm_head.dense_weight()?),
        ];
        for block in &self.blocks {
            for (name, weight) in block.norm_weights() {
                params.push((name, weight.clone()));
            }
        }
        Ok(params)
    }

    /// Runs the decoder over `input_ids` (`[rows, seq]`).
    ///
    /// * `attention_mask`: `[rows, past + seq]` 0/1 keep mask; ignored in
    ///   [`CacheMode::None`].
    /// * `position_ids`: `[seq]` or `[rows, seq]`; defaults to consecutive
    ///   positions after the cached ones.
    /// * `past`: one cache per layer from the previous call.
    /// * `beam_selection`: parent row of every row, applied to the caches before
    ///   the new positions are appended.
    pub fn forward(
        &self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
        position_ids: Option<&Tensor>,
        past: Option<Vec<KvCacheEntry>>,
        mode: CacheMode,
        beam_selection: Option<&[u32]>,
    ) -> ModelResult<ModelOutput> {
        let (_, seq) = input_ids
            .dims2()
            .map_err(|_| ModelError::Input(format!("input_ids must be [rows, seq], got {:?}", input_ids.dims())))?;
        let mut pasts: Vec<Option<KvCacheEntry>> = match past {
            Some(entries) if entries.len() != self.blocks.len() => {
                return Err(ModelError::Input(format!(
                    "expected {} cache entries, got {}",
                    self.blocks.len(),
                    entries.len()
                )))
            }
            Some(entries) => entries.into_iter().map(Some).collect(),
            None => self.blocks.iter().map(|_| None).collect(),
        };
        if mode == CacheMode::None && pasts.iter().any(Option::is_some) {
            log::warn!("past caches are ignored without a cache mode");
            pasts.iter_mut().for_each(|entry| *entry = None);
        }
        let past_len = pasts
            .first()
            .and_then(|entry| entry.as_ref())
            .map_or(0, |entry| entry.seq_len());
        let total = past_len + seq;

        let positions = match position_ids {
            Some(ids) => ids.clone(),
            None => Tensor::arange(past_len as u32, total as u32, self.device())?,
        };
        let mask = match (attention_mask, mode) {
            (_, CacheMode::SlidingWindow { .. }) => Some(causal_with_attention_mask(
                self.device(),
                attention_mask,
                seq,
                total,
            )?),
            (Some(mask), CacheMode::Full) => Some(additive_from_attention_mask(mask)?),
            _ => None,
        };

        let mut hidden = self.embedding.forward(input_ids)?;
        let mut present = Vec::with_capacity(self.blocks.len());
        let mut attentions = Vec::new();
        for (block, past) in self.blocks.iter().zip(pasts.iter_mut()) {
            let attention_mode = match mode {
                CacheMode::None => AttentionMode::Causal,
                CacheMode::Full => AttentionMode::Cached {
                    mask: mask.as_ref(),
                    head_mask: None,
                    add_causal_mask: true,
                    beam_selection,
                },
                CacheMode::SlidingWindow { cutoff } => AttentionMode::SlidingWindow {
                    cutoff,
                    mask: mask.as_ref(),
                    beam_selection,
                },
            };
            let output = block.forward(
                &hidden,
                &positions,
                total,
                &self.rope,
                &self.executor,
                past.take(),
                attention_mode,
                &self.policy,
            )?;
            hidden = output.hidden;
            if let Some(entry) = output.present {
                present.push(entry);
            }
            if let Some(weights) = output.attention_weights {
                attentions.push(weights);
            }
        }

        let normed = self.final_norm.forward(&hidden, &self.policy)?;
        let logits = self.lm_head.forward(&normed, &self.policy)?;
        Ok(ModelOutput {
            logits,
            present: if mode == CacheMode::None { None } else { Some(present) },
            attentions,
        })
    }
}
