//! Core traits and types shared across attention implementations.
//!
//! Kernels operate on head-major tensors `[batch, n_heads, seq_len,
//! head_dim]`; the output mirrors the layout and dtype of `q`. Scores are
//! `q·kᵀ / scale_attn`, and softmax always accumulates in `f32`.

pub mod config;
pub mod errors;

use candle_core::{DType, Tensor};

pub use config::{Config, PrecisionPolicy, SdpaParams};
pub use errors::AttentionError;

use errors::shape_err;

/// Unified interface for attention kernels.
///
/// * `q` is `[batch, heads, q_len, head_dim]`; `k` and `v` are
///   `[batch, heads, k_len, head_dim]` with `k_len >= q_len` when causal.
/// * Masks are additive `f32` (or boolean `u8`) tensors broadcastable to
///   `[batch, heads, q_len, k_len]` with a batch of `batch` or 1, a head axis of
///   1 or `heads` and a query axis of 1 or `q_len`.
/// * With [`SdpaParams::causal`], query `i` sees keys up to
///   `i + k_len - q_len`.
pub trait Attention {
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
        params: &SdpaParams,
        config: &Config,
    ) -> Result<Tensor, AttentionError>;
}

/// Validated geometry of an attention call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Geometry {
    pub batch: usize,
    pub heads: usize,
    pub q_len: usize,
    pub k_len: usize,
    pub head_dim: usize,
}

pub(crate) fn validate_qkv(q: &Tensor, k: &Tensor, v: &Tensor) -> Result<Geometry, AttentionError> {
    let device = q.device();
    if !device.same_device(k.device()) || !device.same_device(v.device()) {
        return Err(shape_err("q, k, v must reside on the same device"));
    }
    let dtype = q.dtype();
    if dtype != k.dtype() || dtype != v.dtype() {
        return Err(shape_err("q, k, v must share the same dtype"));
    }
    if !matches!(dtype, DType::F32 | DType::F16 | DType::BF16) {
        return Err(AttentionError::UnsupportedDType { dtype });
    }
    let (batch, heads, q_len, head_dim) = q
        .dims4()
        .map_err(|_| shape_err("q must have shape [batch, heads, seq_len, head_dim]"))?;
    let (kb, kh, k_len, kd) = k
        .dims4()
        .map_err(|_| shape_err("k must have shape [batch, heads, seq_len, head_dim]"))?;
    let (vb, vh, vk, vd) = v
        .dims4()
        .map_err(|_| shape_err("v must have shape [batch, heads, seq_len, head_dim]"))?;
    if kb != batch || kh != heads || kd != head_dim {
        return Err(shape_err(format!(
            "k shape mismatch: expected [{batch}, {heads}, ?, {head_dim}] got [{kb}, {kh}, {k_len}, {kd}]"
        )));
    }
    if vb != batch || vh != heads || vk != k_len || vd != head_dim {
        return Err(shape_err(format!(
            "v shape mismatch: expected [{batch}, {heads}, {k_len}, {head_dim}] got [{vb}, {vh}, {vk}, {vd}]"
        )));
    }
    Ok(Geometry {
        batch,
        heads,
        q_len,
        k_len,
        head_dim,
    })
}

pub(crate) fn validate_params(params: &SdpaParams, geometry: &Geometry) -> Result<(), AttentionError> {
    if !params.scale_attn.is_finite() || params.scale_attn <= 0.0 {
        return Err(shape_err(format!(
            "scale_attn must be a positive divisor, got {}",
            params.scale_attn
        )));
    }
    if params.causal && geometry.k_len < geometry.q_len {
        return Err(shape_err(format!(
            "causal attention needs k_len >= q_len, got {} < {}",
            geometry.k_len, geometry.q_len
        )));
    }
    Ok(())
}

/// Casts `q`, `k`, `v` to the working dtype selected by `config`.
pub(crate) fn working_tensors(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    config: &Config,
) -> Result<(Tensor, Tensor, Tensor), AttentionError> {
    match config.precision {
        PrecisionPolicy::ForceF32 => Ok((
            q.to_dtype(DType::F32)?,
            k.to_dtype(DType::F32)?,
            v.to_dtype(DType::F32)?,
        )),
        PrecisionPolicy::Inherit => {
            // The CPU backend has no bf16 matmul.
            let dtype = match q.dtype() {
                DType::BF16 => DType::F32,
                other => other,
            };
            Ok((q.to_dtype(dtype)?, k.to_dtype(dtype)?, v.to_dtype(dtype)?))
        }
    }
}
