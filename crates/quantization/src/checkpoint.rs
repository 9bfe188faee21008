//! Low-precision checkpoints holding pre-quantized INT4 weights.
//!
//! Every quantizable linear `name` contributes three tensors:
//!
//! * `{name}.qweight`: `U8 [out, ceil(in / 2)]`, two values per byte, low
//!   nibble first;
//! * `{name}.scales`: float `[out, groups]`;
//! * `{name}.qzeros`: integer `[out, groups]` zero points in `[0, 15]`.
//!
//! One group spans the whole row; more groups split the input dimension into
//! equal spans of `ceil(in / groups)` columns.

use std::{collections::HashMap, path::Path};

use candle_core::{DType, Device, Tensor};
use layers::{QScheme, QuantDType, QuantizationConfig, QuantizedTensor};

use crate::error::{QuantizationError, QuantizationResult};

pub const QWEIGHT_SUFFIX: &str = "qweight";
pub const SCALES_SUFFIX: &str = "scales";
pub const QZEROS_SUFFIX: &str = "qzeros";

#[derive(Debug, Clone, Default)]
pub struct LowPrecisionCheckpoint {
    tensors: HashMap<String, Tensor>,
}

impl LowPrecisionCheckpoint {
    pub fn load(path: impl AsRef<Path>) -> QuantizationResult<Self> {
        let path = path.as_ref();
        let tensors = candle_core::safetensors::load(path, &Device::Cpu).map_err(|err| {
            QuantizationError::checkpoint(format!("failed to read {}: {err}", path.display()))
        })?;
        log::info!(
            "low-precision checkpoint: {} tensors from {}",
            tensors.len(),
            path.display()
        );
        Ok(Self { tensors })
    }

    /// Packs INT4 tensors into checkpoint form.
    pub fn from_quantized<'a>(
        entries: impl IntoIterator<Item = (&'a str, &'a QuantizedTensor)>,
    ) -> QuantizationResult<Self> {
        let mut tensors = HashMap::new();
        for (name, weight) in entries {
            let config = weight.config();
            if config.dtype() != QuantDType::Int4 {
                return Err(QuantizationError::checkpoint(format!(
                    "{name}: checkpoints hold INT4 weights, got {}",
                    config.dtype()
                )));
            }
            let (rows, cols) = weight.dims();
            let groups = match config.scheme() {
                QScheme::PerChannel => 1,
                QScheme::PerGroup { group_size } => cols.div_ceil(group_size),
                QScheme::PerTensor => {
                    return Err(QuantizationError::checkpoint(format!(
                        "{name}: per-tensor parameters cannot be stored per row"
                    )))
                }
            };
            let zeros: Vec<i64> = config.zero_points().iter().map(|z| *z as i64).collect();
            tensors.insert(
                field(name, QWEIGHT_SUFFIX),
                weight.packed_tensor(&Device::Cpu)?,
            );
            tensors.insert(
                field(name, SCALES_SUFFIX),
                Tensor::from_slice(config.scales(), (rows, groups), &Device::Cpu)?,
            );
            tensors.insert(
                field(name, QZEROS_SUFFIX),
                Tensor::from_vec(zeros, (rows, groups), &Device::Cpu)?,
            );
        }
        Ok(Self { tensors })
    }

    pub fn save(&self, path: impl AsRef<Path>) -> QuantizationResult<()> {
        candle_core::safetensors::save(&self.tensors, path.as_ref())?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Rebuilds the quantized weight of linear `name` (`in_dim -> out_dim`).
    pub fn quantized(
        &self,
        name: &str,
        in_dim: usize,
        out_dim: usize,
    ) -> QuantizationResult<QuantizedTensor> {
        let qweight = self.field(name, QWEIGHT_SUFFIX)?;
        let scales = self.field(name, SCALES_SUFFIX)?;
        let qzeros = self.field(name, QZEROS_SUFFIX)?;

        let packed_cols = QuantizedTensor::packed_cols(QuantDType::Int4, in_dim);
        if qweight.dtype() != DType::U8 || qweight.dims() != [out_dim, packed_cols] {
            return Err(QuantizationError::checkpoint(format!(
                "{name}.{QWEIGHT_SUFFIX}: expected U8 [{out_dim}, {packed_cols}], got {:?} {:?}",
                qweight.dtype(),
                qweight.dims()
            )));
        }
        let (scale_rows, groups) = scales.dims2().map_err(|_| {
            QuantizationError::checkpoint(format!(
                "{name}.{SCALES_SUFFIX}: expected [out, groups], got {:?}",
                scales.dims()
            ))
        })?;
        if scale_rows != out_dim || groups == 0 || groups > in_dim {
            return Err(QuantizationError::checkpoint(format!(
                "{name}.{SCALES_SUFFIX}: {:?} does not fit [{out_dim}, 1..={in_dim}]",
                scales.dims()
            )));
        }
        if qzeros.dims() != scales.dims() {
            return Err(QuantizationError::checkpoint(format!(
                "{name}.{QZEROS_SUFFIX}: {:?} does not match scales {:?}",
                qzeros.dims(),
                scales.dims()
            )));
        }

        let scheme = if groups == 1 {
            QScheme::PerChannel
        } else {
            let group_size = in_dim.div_ceil(groups);
            if in_dim.div_ceil(group_size) != groups {
                return Err(QuantizationError::checkpoint(format!(
                    "{name}: {groups} groups cannot split {in_dim} input channels evenly"
                )));
            }
            QScheme::PerGroup { group_size }
        };

        let bytes = qweight.flatten_all()?.to_vec1::<u8>()?;
        let values = QuantizedTensor::unpack(QuantDType::Int4, &bytes, out_dim, in_dim)?;
        let scales = scales.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let zeros = qzeros
            .to_dtype(DType::I64)?
            .flatten_all()?
            .to_vec1::<i64>()?
            .into_iter()
            .map(|z| z as i32)
            .collect();
        let config = QuantizationConfig::new(QuantDType::Int4, scheme, scales, zeros)
            .map_err(|err| QuantizationError::checkpoint(format!("{name}: {err}")))?;
        QuantizedTensor::from_parts(config, out_dim, in_dim, values)
            .map_err(|err| QuantizationError::checkpoint(format!("{name}: {err}")))
    }

    fn field(&self, name: &str, suffix: &str) -> QuantizationResult<&Tensor> {
        let key = field(name, suffix);
        self.tensors
            .get(&key)
            .ok_or_else(|| QuantizationError::checkpoint(format!("missing `{key}`")))
    }
}

fn field(name: &str, suffix: &str) -> String {
    format!("{name}.{suffix}")
}
