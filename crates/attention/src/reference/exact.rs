//! Materialized-softmax attention kernel.
//!
//! Scores are computed for the full `[q_len, k_len]` matrix, masked, and
//! normalised in `f32`. Masked entries are clamped to `f32::MIN` before the
//! softmax so a fully masked row degrades to a uniform distribution instead of
//! NaN.

use candle_core::{DType, Tensor};
use candle_nn::ops::softmax_last_dim;

use crate::core::{
    errors::shape_err, validate_params, validate_qkv, working_tensors, Attention, AttentionError,
    Config, SdpaParams,
};
use crate::masks::{causal_block, prepare_mask};

/// Numerically stable, portable attention kernel.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExactAttention;

impl ExactAttention {
    pub fn new() -> Self {
        Self
    }

    /// Attention that also returns the `[batch, heads, q_len, k_len]`
    /// probabilities (after the optional head mask), in the dtype of `q`.
    ///
    /// `head_mask` multiplies the probabilities and is either `[heads]` or
    /// broadcastable to `[batch, heads, 1, 1]`.
    #[allow(clippy::too_many_arguments)]
    pub fn attend_with_probs(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
        head_mask: Option<&Tensor>,
        params: &SdpaParams,
        config: &Config,
    ) -> Result<(Tensor, Tensor), AttentionError> {
        let geometry = validate_qkv(q, k, v)?;
        validate_params(params, &geometry)?;
        let (batch, heads, q_len, k_len) =
            (geometry.batch, geometry.heads, geometry.q_len, geometry.k_len);
        let dtype = q.dtype();
        let (q_work, k_work, v_work) = working_tensors(q, k, v, config)?;

        let scores = q_work
            .contiguous()?
            .matmul(&k_work.contiguous()?.transpose(2, 3)?)?
            .to_dtype(DType::F32)?;
        let mut scores = (scores / params.scale_attn as f64)?;

        if params.causal {
            let causal = causal_block(q.device(), q_len, k_len, 0, k_len)?;
            scores = scores.broadcast_add(&causal.reshape((1, 1, q_len, k_len))?)?;
        }
        if let Some(mask) = mask {
            let additive = prepare_mask(mask, batch, heads, q_len, k_len)?;
            scores = scores.broadcast_add(&additive)?;
        }

        let scores = scores.maximum(f32::MIN)?;
        let mut probs = softmax_last_dim(&scores)?;
        if let Some(head_mask) = head_mask {
            let head_mask = match head_mask.dims() {
                [h] if *h == heads => head_mask.reshape((1, heads, 1, 1))?,
                [_, _, _, _] => head_mask.clone(),
                dims => {
                    return Err(shape_err(format!(
                        "head_mask must be [{heads}] or rank 4, got {dims:?}"
                    )))
                }
            };
            probs = probs.broadcast_mul(&head_mask.to_dtype(DType::F32)?)?;
        }

        let output = probs
            .to_dtype(v_work.dtype())?
            .matmul(&v_work.contiguous()?)?
            .to_dtype(dtype)?;
        Ok((output, probs.to_dtype(dtype)?))
    }
}

impl Attention for ExactAttention {
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
        params: &SdpaParams,
        config: &Config,
    ) -> Result<Tensor, AttentionError> {
        self.attend_with_probs(q, k, v, mask, None, params, config)
            .map(|(output, _)| output)
    }
}
