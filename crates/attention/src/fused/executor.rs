//! Cache-aware attention executor used by every decoder layer.
//!
//! Inputs arrive sequence-major from the projections, `[batch * beams, seq,
//! heads, head_dim]`, and the output is head-major `[batch * beams, heads,
//! seq, head_dim]`. The executor owns no cache state: the previous
//! [`KvCacheEntry`] is passed in by value and the updated one is handed back.

use candle_core::Tensor;

use crate::core::{
    config::PrecisionPolicy, errors::shape_err, Attention, AttentionError, Config, SdpaParams,
};
use crate::fused::flash::FlashAttention;
use crate::kv_cache::{CacheLayout, KeyValueCache, KvCacheEntry};
use crate::reference::ExactAttention;

/// Static configuration of the executor.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorConfig {
    /// Cache capacity in positions.
    pub text_max_length: usize,
    /// Hypotheses per batch item; rows of the same item are adjacent.
    pub beam_width: usize,
    pub precision: PrecisionPolicy,
    pub flash_block_size: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        let kernel = Config::default();
        Self {
            text_max_length: 2048,
            beam_width: 1,
            precision: kernel.precision,
            flash_block_size: kernel.flash_block_size,
        }
    }
}

/// How one attention call treats the cache.
#[derive(Debug, Clone, Copy)]
pub enum AttentionMode<'a> {
    /// No cache; causal flash attention over the given tokens.
    Causal,
    /// Full history: append, then exact attention returning probabilities.
    Cached {
        mask: Option<&'a Tensor>,
        head_mask: Option<&'a Tensor>,
        add_causal_mask: bool,
        beam_selection: Option<&'a [u32]>,
    },
    /// Attend to at most `cutoff` cached positions plus the new tokens; the
    /// returned cache keeps only that window. No causal mask is added: the
    /// caller's `mask` carries causality, and its trailing key columns are
    /// applied to the window.
    SlidingWindow {
        cutoff: usize,
        mask: Option<&'a Tensor>,
        beam_selection: Option<&'a [u32]>,
    },
}

impl AttentionMode<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            AttentionMode::Causal => "causal",
            AttentionMode::Cached { .. } => "cached",
            AttentionMode::SlidingWindow { .. } => "sliding_window",
        }
    }
}

/// Result of [`FusedAttention::forward`].
#[derive(Debug)]
pub struct AttentionOutput {
    /// `[batch * beams, heads, seq, head_dim]` in the input dtype.
    pub output: Tensor,
    /// Attention probabilities, only produced by [`AttentionMode::Cached`].
    pub weights: Option<Tensor>,
    pub present: Option<KvCacheEntry>,
}

#[derive(Debug, Clone)]
pub struct FusedAttention {
    config: ExecutorConfig,
    kernel: Config,
    exact: ExactAttention,
    flash: FlashAttention,
}

impl FusedAttention {
    pub fn new(config: ExecutorConfig) -> Self {
        let kernel = Config {
            precision: config.precision,
            flash_block_size: config.flash_block_size,
        };
        log::info!(
            "fused attention: text_max_length={} beam_width={} precision={:?} block={}",
            config.text_max_length,
            config.beam_width,
            config.precision,
            config.flash_block_size
        );
        Self {
            flash: FlashAttention::from_config(&kernel),
            exact: ExactAttention::new(),
            kernel,
            config,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Runs one attention step. `scale_attn` divides `q·kᵀ` in every mode.
    pub fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        scale_attn: f32,
        past: Option<KvCacheEntry>,
        mode: AttentionMode<'_>,
    ) -> Result<AttentionOutput, AttentionError> {
        let layout = self.layout_for(query, key, value)?;
        let q = query.transpose(1, 2)?.contiguous()?;
        let k = key.transpose(1, 2)?.contiguous()?;
        let v = value.transpose(1, 2)?.contiguous()?;
        let new_tokens = q.dims()[2];
        log::debug!(
            "attention step: mode={} rows={} new={new_tokens} past={}",
            mode.name(),
            layout.rows(),
            past.as_ref().map_or(0, |entry| entry.seq_len())
        );

        match mode {
            AttentionMode::Causal => {
                let params = SdpaParams {
                    scale_attn,
                    causal: true,
                };
                let output = self.flash.attend(&q, &k, &v, None, &params, &self.kernel)?;
                Ok(AttentionOutput {
                    output,
                    weights: None,
                    present: None,
                })
            }
            AttentionMode::Cached {
                mask,
                head_mask,
                add_causal_mask,
                beam_selection,
            } => {
                let mut cache = self.resolve_past(past, layout, &k)?;
                cache.append(&k, &v, beam_selection)?;
                let (keys, values) = cache.materialize()?;
                let params = SdpaParams {
                    scale_attn,
                    causal: add_causal_mask,
                };
                let (output, weights) = self.exact.attend_with_probs(
                    &q,
                    &keys,
                    &values,
                    mask,
                    head_mask,
                    &params,
                    &self.kernel,
                )?;
                Ok(AttentionOutput {
                    output,
                    weights: Some(weights),
                    present: Some(cache),
                })
            }
            AttentionMode::SlidingWindow {
                cutoff,
                mask,
                beam_selection,
            } => {
                let cache = self.resolve_past(past, layout, &k)?;
                let (mut window_k, mut window_v) = cache.window(cutoff)?;
                if let Some(selection) = beam_selection {
                    layout.validate_selection(selection)?;
                    let index = Tensor::new(selection, k.device())?;
                    window_k = window_k.index_select(&index, 0)?;
                    window_v = window_v.index_select(&index, 0)?;
                }
                let keys = Tensor::cat(&[&window_k, &k], 2)?;
                let values = Tensor::cat(&[&window_v, &v], 2)?;
                let total = keys.dims()[2];
                let mask = match mask {
                    Some(mask) => Some(trailing_columns(mask, total)?),
                    None => None,
                };
                let params = SdpaParams {
                    scale_attn,
                    causal: false,
                };
                let output = self
                    .flash
                    .attend(&q, &keys, &values, mask.as_ref(), &params, &self.kernel)?;
                let present =
                    KvCacheEntry::from_history(layout, &keys, &values, cache.seq_len() + new_tokens)?;
                Ok(AttentionOutput {
                    output,
                    weights: None,
                    present: Some(present),
                })
            }
        }
    }

    fn layout_for(&self, query: &Tensor, key: &Tensor, value: &Tensor) -> Result<CacheLayout, AttentionError> {
        let (rows, seq, heads, head_dim) = query
            .dims4()
            .map_err(|_| shape_err("query must be [batch * beams, seq, heads, head_dim]"))?;
        for (name, tensor) in [("key", key), ("value", value)] {
            if tensor.dims() != query.dims() {
                return Err(shape_err(format!(
                    "{name} shape {:?} does not match query [{rows}, {seq}, {heads}, {head_dim}]",
                    tensor.dims()
                )));
            }
        }
        let beam_width = self.config.beam_width.max(1);
        if rows % beam_width != 0 {
            return Err(shape_err(format!(
                "{rows} rows are not a multiple of beam_width {beam_width}"
            )));
        }
        Ok(CacheLayout {
            batch: rows / beam_width,
            num_heads: heads,
            head_dim,
            beam_width,
            capacity: self.config.text_max_length,
        })
    }

    fn resolve_past(
        &self,
        past: Option<KvCacheEntry>,
        layout: CacheLayout,
        keys: &Tensor,
    ) -> Result<KvCacheEntry, AttentionError> {
        match past {
            Some(entry) => {
                let stored = entry.layout();
                if (stored.rows(), stored.num_heads, stored.head_dim)
                    != (layout.rows(), layout.num_heads, layout.head_dim)
                {
                    return Err(shape_err(format!(
                        "past cache layout {stored:?} does not match inputs {layout:?}"
                    )));
                }
                Ok(entry)
            }
            None => KvCacheEntry::init_empty(layout, keys.dtype(), keys.device()),
        }
    }
}

/// Keeps the last `len` key columns of a mask built for a longer history.
fn trailing_columns(mask: &Tensor, len: usize) -> Result<Tensor, AttentionError> {
    let columns = mask
        .dims()
        .last()
        .copied()
        .ok_or_else(|| shape_err("mask must have a key axis"))?;
    if columns > len {
        Ok(mask.narrow(mask.rank() - 1, columns - len, len)?)
    } else {
        Ok(mask.clone())
    }
}
