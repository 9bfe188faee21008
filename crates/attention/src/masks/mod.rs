//! Additive masks for the attention kernels.
//!
//! A mask entry is `0.0` to keep a key and `f32::NEG_INFINITY` to drop it.
//! Boolean `u8` masks (1 keep, 0 drop) are accepted wherever a mask is and
//! converted by [`to_additive`].
//!
//! Causal masks are aligned bottom-right: with `q_len` new tokens appended
//! after `k_len - q_len` cached ones, query `i` sees keys `0..=i + k_len -
//! q_len`. This is what lets a decode step attend to its whole history and a
//! sliding window attend to the retained tail.

use candle_core::{DType, Device, Result, Tensor};

use crate::core::{errors::shape_err, AttentionError};

/// Dtype shared by all additive masks.
pub const MASK_DTYPE: DType = DType::F32;

/// Boolean keep-masks become additive; additive masks are cast to
/// [`MASK_DTYPE`].
pub fn to_additive(mask: &Tensor) -> Result<Tensor> {
    if mask.dtype() != DType::U8 {
        return mask.to_dtype(MASK_DTYPE);
    }
    let keep = Tensor::zeros(mask.shape(), MASK_DTYPE, mask.device())?;
    let drop = Tensor::full(f32::NEG_INFINITY, mask.shape(), mask.device())?;
    mask.where_cond(&keep, &drop)
}

/// Columns `start..start + len` of the `[q_len, k_len]` causal mask. The
/// flash kernel asks for one key block at a time.
pub fn causal_block(
    device: &Device,
    q_len: usize,
    k_len: usize,
    start: usize,
    len: usize,
) -> Result<Tensor> {
    let history = k_len.saturating_sub(q_len);
    let data: Vec<f32> = (0..q_len)
        .flat_map(|q| {
            (start..start + len).map(move |k| if k <= q + history { 0.0 } else { f32::NEG_INFINITY })
        })
        .collect();
    Tensor::from_vec(data, (q_len, len), device)
}

/// Full `[batch, heads, q_len, k_len]` causal mask.
pub fn build_causal_mask(
    device: &Device,
    batch: usize,
    num_heads: usize,
    q_len: usize,
    k_len: usize,
) -> Result<Tensor> {
    causal_block(device, q_len, k_len, 0, k_len)?
        .reshape((1, 1, q_len, k_len))?
        .broadcast_as((batch, num_heads, q_len, k_len))?
        .contiguous()
}

/// `[batch, heads, q_len, k_len]` mask dropping keys at or past each row's
/// valid length (right padding). Lengths above `k_len` keep every key.
pub fn padding_mask_from_lengths(
    device: &Device,
    key_lengths: &[usize],
    num_heads: usize,
    q_len: usize,
    k_len: usize,
) -> Result<Tensor> {
    let batch = key_lengths.len();
    let lengths: Vec<u32> = key_lengths.iter().map(|&l| l.min(k_len) as u32).collect();
    let lengths = Tensor::from_vec(lengths, (batch, 1), device)?;
    let positions = Tensor::arange(0u32, k_len as u32, device)?.reshape((1, k_len))?;
    let keep = positions.broadcast_lt(&lengths)?;
    to_additive(&keep)?
        .reshape((batch, 1, 1, k_len))?
        .broadcast_as((batch, num_heads, q_len, k_len))?
        .contiguous()
}

/// Turns a `[rows, k_len]` 0/1 attention mask of any numeric dtype, as fed
/// to the model, into an additive `[rows, 1, 1, k_len]` mask.
pub fn additive_from_attention_mask(attention_mask: &Tensor) -> Result<Tensor> {
    let (rows, k_len) = attention_mask.dims2()?;
    let keep = attention_mask.to_dtype(DType::F32)?.gt(0.0)?;
    to_additive(&keep)?.reshape((rows, 1, 1, k_len))
}

/// Causal mask for `q_len` new tokens over `k_len` keys, with the model's
/// `[rows, k_len]` attention mask folded in when given. The result is
/// `[rows|1, 1, q_len, k_len]`.
pub fn causal_with_attention_mask(
    device: &Device,
    attention_mask: Option<&Tensor>,
    q_len: usize,
    k_len: usize,
) -> Result<Tensor> {
    let causal = build_causal_mask(device, 1, 1, q_len, k_len)?;
    match attention_mask {
        Some(mask) => additive_from_attention_mask(mask)?.broadcast_add(&causal),
        None => Ok(causal),
    }
}

/// Validates a mask against `[batch, heads, q_len, k_len]` and returns its
/// additive form. Batch, head and query axes may be 1 for broadcasting.
pub(crate) fn prepare_mask(
    mask: &Tensor,
    batch: usize,
    heads: usize,
    q_len: usize,
    k_len: usize,
) -> std::result::Result<Tensor, AttentionError> {
    let (mb, mh, mq, mk) = mask
        .dims4()
        .map_err(|_| shape_err("mask must have shape [batch, heads|1, q_len|1, k_len]"))?;
    let fits = |got: usize, want: usize| got == want || got == 1;
    if !fits(mb, batch) || !fits(mh, heads) || !fits(mq, q_len) || mk != k_len {
        return Err(shape_err(format!(
            "mask shape [{mb}, {mh}, {mq}, {mk}] incompatible with [{batch}, {heads}, {q_len}, {k_len}]"
        )));
    }
    Ok(to_additive(mask)?)
}

#[cfg(test)]
mod tests;
