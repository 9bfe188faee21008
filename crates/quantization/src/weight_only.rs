//! Weight-only conversion: the projections keep float activations and store
//! INT8 (symmetric, per output channel) or INT4 (asymmetric, per group)
//! weights, executed in the resolved lowp mode.

use layers::{linear, LinearLayer, LowpMode, QScheme, QuantDType, QuantizedTensor};
use model::Model;

use crate::{checkpoint::LowPrecisionCheckpoint, error::QuantizationResult};

/// Parameter granularity for a weight dtype. INT4 without a group size uses
/// one group per row.
pub fn scheme_for(dtype: QuantDType, group_size: Option<usize>) -> QScheme {
    match (dtype, group_size) {
        (QuantDType::Int4, Some(group_size)) => QScheme::PerGroup { group_size },
        _ => QScheme::PerChannel,
    }
}

/// Quantizes every projection of `model` from its float weights.
pub fn quantize(
    model: &mut Model,
    dtype: QuantDType,
    group_size: Option<usize>,
    lowp: LowpMode,
) -> QuantizationResult<usize> {
    let scheme = scheme_for(dtype, group_size);
    let device = model.device().clone();
    let mut converted = 0;
    for (name, layer) in model.linears_mut() {
        let weight = layer.dense_weight()?;
        let quantized = QuantizedTensor::quantize(&weight, dtype, scheme)?;
        layer.replace_kernel(linear::weight_only(quantized, lowp, &device)?)?;
        log::debug!("{name}: weight-only {dtype} ({scheme:?})");
        converted += 1;
    }
    log::info!("weight-only: quantized {converted} linears to {dtype} (lowp {lowp})");
    Ok(converted)
}

/// Installs the pre-quantized INT4 weights of `checkpoint`; every projection
/// must be present.
pub fn load_from_checkpoint(
    model: &mut Model,
    checkpoint: &LowPrecisionCheckpoint,
    lowp: LowpMode,
) -> QuantizationResult<usize> {
    let device = model.device().clone();
    let mut converted = 0;
    for (name, layer) in model.linears_mut() {
        let (in_dim, out_dim) = (layer.config().input_dim, layer.config().output_dim);
        let quantized = checkpoint.quantized(&name, in_dim, out_dim)?;
        layer.replace_kernel(linear::weight_only(quantized, lowp, &device)?)?;
        converted += 1;
    }
    log::info!("weight-only: loaded {converted} INT4 linears from checkpoint (lowp {lowp})");
    Ok(converted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int4_groups_only_when_requested() {
        assert_eq!(
            scheme_for(QuantDType::Int4, Some(32)),
            QScheme::PerGroup { group_size: 32 }
        );
        assert_eq!(scheme_for(QuantDType::Int4, None), QScheme::PerChannel);
        assert_eq!(scheme_for(QuantDType::Int8, Some(32)), QScheme::PerChannel);
    }
}
