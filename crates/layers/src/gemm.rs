//! Integer matrix multiplication for quantized linear kernels.
//!
//! Activations are quantized to symmetric int8 (either with one static scale
//! calibrated ahead of time or with a dynamic scale per row) and multiplied
//! against a [`QuantizedTensor`] with `i32` accumulation. Each parameter group
//! of the weight contributes `w_scale * sum(a_q * (w_q - zero))`, and the row
//! total is rescaled by the activation scale. Rows are distributed over the
//! rayon pool; every output element is produced by exactly one task so the
//! result does not depend on the thread count.

use candle_core::{DType, Error, Result, Tensor};
use rayon::prelude::*;

use crate::quant::QuantizedTensor;

/// How activations are brought into the int8 domain.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ActivationQuant {
    /// One scale per row computed from the row's absolute maximum.
    Dynamic,
    /// A calibrated per-tensor scale.
    Static(f32),
}

/// Quantizes each row of a `[rows, cols]` buffer with its own absmax scale.
pub fn quantize_rows_i8(data: &[f32], rows: usize, cols: usize) -> (Vec<i8>, Vec<f32>) {
    let mut values = Vec::with_capacity(rows * cols);
    let mut scales = Vec::with_capacity(rows);
    for row in data.chunks(cols.max(1)).take(rows) {
        let abs_max = row.iter().fold(0.0f32, |acc, v| acc.max(v.abs()));
        let scale = if abs_max > 0.0 { abs_max / 127.0 } else { 1.0 };
        let inv = 1.0 / scale;
        values.extend(row.iter().map(|v| (v * inv).round().clamp(-127.0, 127.0) as i8));
        scales.push(scale);
    }
    (values, scales)
}

/// Quantizes a buffer with a fixed scale, saturating at `±127`.
pub fn quantize_static_i8(data: &[f32], scale: f32) -> Vec<i8> {
    let inv = 1.0 / scale;
    data.iter()
        .map(|v| (v * inv).round().clamp(-127.0, 127.0) as i8)
        .collect()
}

/// Computes `a · wᵀ` for int8 activations `a` (`[rows, k]`) and a quantized
/// weight `w` (`[n, k]`), returning `[rows, n]` floats in row-major order.
///
/// `a_scales` holds either one scale per row or a single shared scale.
pub fn gemm_i8(
    a: &[i8],
    a_scales: &[f32],
    rows: usize,
    weight: &QuantizedTensor,
) -> Result<Vec<f32>> {
    let (n, k) = weight.dims();
    if a.len() != rows * k {
        return Err(Error::Msg(format!(
            "gemm_i8: expected {} activation values for [{rows}, {k}], got {}",
            rows * k,
            a.len()
        )));
    }
    if a_scales.len() != rows && a_scales.len() != 1 {
        return Err(Error::Msg(format!(
            "gemm_i8: expected 1 or {rows} activation scales, got {}",
            a_scales.len()
        )));
    }
    let mut out = vec![0f32; rows * n];
    if rows == 0 || n == 0 {
        return Ok(out);
    }

    let group = weight.config().scheme().group_width(k).max(1);
    let w = weight.values();
    out.par_chunks_mut(n).enumerate().for_each(|(r, out_row)| {
        let a_row = &a[r * k..(r + 1) * k];
        let a_scale = if a_scales.len() == 1 {
            a_scales[0]
        } else {
            a_scales[r]
        };
        for (j, slot) in out_row.iter_mut().enumerate() {
            let w_row = &w[j * k..(j + 1) * k];
            let mut total = 0f32;
            for start in (0..k).step_by(group) {
                let end = (start + group).min(k);
                let (w_scale, zero) = weight.params_at(j, start);
                let acc: i32 = a_row[start..end]
                    .iter()
                    .zip(&w_row[start..end])
                    .map(|(x, q)| *x as i32 * (*q as i32 - zero))
                    .sum();
                total += acc as f32 * w_scale;
            }
            *slot = total * a_scale;
        }
    });
    Ok(out)
}

/// Tensor front end of [`gemm_i8`]: maps `(.., k)` inputs to `(.., n)` `f32`
/// outputs.
pub fn int8_matmul(
    input: &Tensor,
    weight: &QuantizedTensor,
    activation: ActivationQuant,
) -> Result<Tensor> {
    let (n, k) = weight.dims();
    let dims = input.dims().to_vec();
    match dims.last() {
        Some(&last) if last == k => {}
        _ => {
            return Err(Error::Msg(format!(
                "int8_matmul: expected (.., {k}) input, got {dims:?}"
            )))
        }
    }
    let rows = input.elem_count() / k.max(1);
    let data = input
        .to_dtype(DType::F32)?
        .flatten_all()?
        .to_vec1::<f32>()?;
    let (values, scales) = match activation {
        ActivationQuant::Dynamic => quantize_rows_i8(&data, rows, k),
        ActivationQuant::Static(scale) => (quantize_static_i8(&data, scale), vec![scale]),
    };
    let out = gemm_i8(&values, &scales, rows, weight)?;
    let mut out_dims = dims;
    if let Some(last) = out_dims.last_mut() {
        *last = n;
    }
    Tensor::from_vec(out, out_dims, input.device())
}
