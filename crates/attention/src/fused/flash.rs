//! Key-block tiled attention with an online softmax.
//!
//! Keys and values are consumed `block_size` positions at a time. Each query
//! row keeps a running maximum `m`, normaliser `l` and unnormalised output
//! `acc`; a block with a larger maximum rescales the running state by
//! `exp(m_old - m_new)`. The full `[q_len, k_len]` score matrix is never
//! materialized. Masked scores are clamped to `f32::MIN` like in the exact
//! kernel, so a block with no visible key is wiped as soon as a visible one
//! arrives and both kernels agree on fully masked rows.

use candle_core::{DType, Tensor};

use crate::core::{
    validate_params, validate_qkv, working_tensors, Attention, AttentionError, Config, SdpaParams,
};
use crate::masks::{causal_block, prepare_mask};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashAttention {
    block_size: usize,
}

impl FlashAttention {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size: block_size.max(1),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.flash_block_size)
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }
}

impl Default for FlashAttention {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl Attention for FlashAttention {
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
        params: &SdpaParams,
        config: &Config,
    ) -> Result<Tensor, AttentionError> {
        let geometry = validate_qkv(q, k, v)?;
        validate_params(params, &geometry)?;
        let (batch, heads, q_len, k_len, head_dim) = (
            geometry.batch,
            geometry.heads,
            geometry.q_len,
            geometry.k_len,
            geometry.head_dim,
        );
        let dtype = q.dtype();
        let device = q.device();
        if k_len == 0 {
            return Ok(Tensor::zeros((batch, heads, q_len, head_dim), dtype, device)?);
        }
        let mask = match mask {
            Some(mask) => Some(prepare_mask(mask, batch, heads, q_len, k_len)?),
            None => None,
        };
        let (q_work, k_work, v_work) = working_tensors(q, k, v, config)?;
        let q_work = q_work.contiguous()?;

        let mut running_max = Tensor::full(f32::MIN, (batch, heads, q_len, 1), device)?;
        let mut normaliser = Tensor::zeros((batch, heads, q_len, 1), DType::F32, device)?;
        let mut acc = Tensor::zeros((batch, heads, q_len, head_dim), DType::F32, device)?;

        for start in (0..k_len).step_by(self.block_size) {
            let len = self.block_size.min(k_len - start);
            let k_block = k_work.narrow(2, start, len)?.contiguous()?;
            let v_block = v_work.narrow(2, start, len)?.contiguous()?;

            let scores = q_work
                .matmul(&k_block.transpose(2, 3)?)?
                .to_dtype(DType::F32)?;
            let mut scores = (scores / params.scale_attn as f64)?;
            if params.causal {
                let causal = causal_block(device, q_len, k_len, start, len)?;
                scores = scores.broadcast_add(&causal.reshape((1, 1, q_len, len))?)?;
            }
            if let Some(mask) = &mask {
                scores = scores.broadcast_add(&mask.narrow(3, start, len)?)?;
            }
            let scores = scores.maximum(f32::MIN)?;

            let block_max = scores.max_keepdim(3)?;
            let new_max = running_max.maximum(&block_max)?;
            let probs = scores.broadcast_sub(&new_max)?.exp()?;
            let correction = (&running_max - &new_max)?.exp()?;

            normaliser = ((&normaliser * &correction)? + probs.sum_keepdim(3)?)?;
            let update = probs
                .to_dtype(v_block.dtype())?
                .matmul(&v_block)?
                .to_dtype(DType::F32)?;
            acc = (acc.broadcast_mul(&correction)? + update)?;
            running_max = new_max;
        }

        Ok(acc.broadcast_div(&normaliser)?.to_dtype(dtype)?)
    }
}
