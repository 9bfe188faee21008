//! Smooth-quant conversion of the decoder projections.
//!
//! The pipeline runs in three steps over a loaded [`Model`]:
//!
//! 1. [`prepare`] attaches an activation observer to every quantizable linear;
//! 2. [`calibrate`] runs the model over calibration batches so the observers
//!    record per-channel input ranges;
//! 3. [`convert`] derives the smoothing factors
//!    `s_j = max|X_j|^α / max|W_j|^(1-α)`, quantizes `W · diag(s)` per output
//!    channel to symmetric INT8 and swaps in the smooth-quant kernel, whose
//!    static activation scale covers the smoothed calibration range.

use candle_core::{DType, Device, Tensor};
use layers::{linear, ActivationObserver, Linear, QScheme, QuantDType, QuantizedTensor};
use model::{CacheMode, Model};

use crate::{
    calibration::{CalibrationBatch, MAX_CALIBRATION_BATCHES},
    error::{QuantizationError, QuantizationResult},
};

/// Floor applied to smoothing factors and to the ranges feeding them.
pub const MIN_SMOOTHING: f32 = 1e-5;

/// Attaches observers to every quantizable linear; returns how many.
pub fn prepare(model: &mut Model) -> usize {
    let mut count = 0;
    for (_, layer) in model.linears_mut() {
        layer.attach_observer();
        count += 1;
    }
    log::info!("smooth-quant: observing {count} linears");
    count
}

/// Runs up to [`MAX_CALIBRATION_BATCHES`] batches through the prepared model.
pub fn calibrate(model: &Model, batches: &[CalibrationBatch]) -> QuantizationResult<usize> {
    if batches.is_empty() {
        return Err(QuantizationError::config("calibration needs at least one batch"));
    }
    let mut seen = 0;
    for (index, batch) in batches.iter().take(MAX_CALIBRATION_BATCHES).enumerate() {
        model.forward(
            &batch.input_ids,
            Some(&batch.attention_mask),
            Some(&batch.position_ids),
            None,
            CacheMode::None,
            None,
        )?;
        seen += 1;
        log::debug!("calibration batch {} of {}", index + 1, batches.len());
    }
    if batches.len() > MAX_CALIBRATION_BATCHES {
        log::warn!(
            "calibration stopped after {MAX_CALIBRATION_BATCHES} of {} batches",
            batches.len()
        );
    }
    log::info!("smooth-quant: calibrated on {seen} batches");
    Ok(seen)
}

/// Per-input-channel smoothing factors for activations `x_abs_max` and a
/// `[out, in]` weight.
pub fn smoothing_factors(
    x_abs_max: &[f32],
    weight: &Tensor,
    alpha: f32,
) -> QuantizationResult<Vec<f32>> {
    let (_, in_dim) = weight.dims2()?;
    if x_abs_max.len() != in_dim {
        return Err(QuantizationError::Backend(format!(
            "activation statistics cover {} channels, weight has {in_dim}",
            x_abs_max.len()
        )));
    }
    let w_abs_max = weight
        .to_dtype(DType::F32)?
        .abs()?
        .max(0)?
        .to_vec1::<f32>()?;
    Ok(x_abs_max
        .iter()
        .zip(&w_abs_max)
        .map(|(x, w)| {
            let x = x.max(MIN_SMOOTHING);
            let w = w.max(MIN_SMOOTHING);
            let s = x.powf(alpha) / w.powf(1.0 - alpha);
            if s.is_finite() {
                s.max(MIN_SMOOTHING)
            } else {
                1.0
            }
        })
        .collect())
}

/// Replaces every observed linear with its smooth-quant kernel.
pub fn convert(model: &mut Model, alpha: f32) -> QuantizationResult<usize> {
    let mut converted = 0;
    for (name, layer) in model.linears_mut() {
        let observer = layer.detach_observer().ok_or_else(|| {
            QuantizationError::config(format!("{name} was not prepared for calibration"))
        })?;
        convert_linear(&name, layer, &observer, alpha)?;
        converted += 1;
    }
    log::info!("smooth-quant: converted {converted} linears (alpha={alpha})");
    Ok(converted)
}

fn convert_linear(
    name: &str,
    layer: &mut Linear,
    observer: &ActivationObserver,
    alpha: f32,
) -> QuantizationResult<()> {
    if observer.batches() == 0 {
        return Err(QuantizationError::config(format!(
            "{name} saw no calibration data"
        )));
    }
    let weight = layer.dense_weight()?.to_dtype(DType::F32)?.to_device(&Device::Cpu)?;
    let smoothing = smoothing_factors(&observer.abs_max(), &weight, alpha)?;
    let in_dim = smoothing.len();
    let smoothing_tensor = Tensor::from_vec(smoothing.clone(), in_dim, &Device::Cpu)?;
    let smoothed = weight.broadcast_mul(&smoothing_tensor.unsqueeze(0)?)?;
    let quantized = QuantizedTensor::quantize(&smoothed, QuantDType::Int8, QScheme::PerChannel)?;

    let act_max = observer.smoothed_abs_max(&smoothing);
    let input_scale = if act_max > 0.0 { act_max / 127.0 } else { 1.0 };
    log::debug!("{name}: input_scale={input_scale:.6}");
    layer.replace_kernel(linear::smooth_quant(quantized, smoothing_tensor, input_scale)?)?;
    Ok(())
}
