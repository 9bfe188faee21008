//! Storage, compute and reduction dtypes for a forward pass.
//!
//! Checkpoints may hold `f16`/`bf16` parameters. Dense matmuls and
//! activations then run in `f32`, norm statistics always accumulate in `f32`,
//! and layer outputs are cast back to the storage dtype so the residual
//! stream keeps the checkpoint precision. Quantized projections choose their
//! own matmul dtype from [`LowpMode`](crate::LowpMode) and only use the
//! policy for the final cast.

use candle_core::{DType, Result, Tensor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrecisionPolicy {
    storage: DType,
    compute: DType,
}

impl PrecisionPolicy {
    /// Half-precision storage computes in `f32`; anything else computes in
    /// its own dtype.
    pub fn from_parameter_dtype(storage: DType) -> Self {
        let compute = match storage {
            DType::F16 | DType::BF16 => DType::F32,
            other => other,
        };
        Self { storage, compute }
    }

    pub fn storage(&self) -> DType {
        self.storage
    }

    pub fn compute(&self) -> DType {
        self.compute
    }

    /// Norm statistics are never accumulated below `f32`.
    pub fn reduction(&self) -> DType {
        match self.compute {
            DType::F64 => DType::F64,
            _ => DType::F32,
        }
    }

    pub fn cast_for_matmul(&self, tensor: &Tensor) -> Result<Tensor> {
        cast(tensor, self.compute)
    }

    pub fn cast_for_reduction(&self, tensor: &Tensor) -> Result<Tensor> {
        cast(tensor, self.reduction())
    }

    pub fn cast_to_storage(&self, tensor: &Tensor) -> Result<Tensor> {
        cast(tensor, self.storage)
    }
}

/// `to_dtype` that skips the copy when the dtype already matches.
pub fn cast(tensor: &Tensor, dtype: DType) -> Result<Tensor> {
    if tensor.dtype() == dtype {
        Ok(tensor.clone())
    } else {
        tensor.to_dtype(dtype)
    }
}

/// Dtype a matmul over `dtype` operands runs in. The CPU backend has no
/// `bf16` matmul, so those operands are widened to `f32`.
pub fn matmul_dtype(dtype: DType) -> DType {
    match dtype {
        DType::BF16 => DType::F32,
        other => other,
    }
}

/// Rounds `tensor` to `dtype` precision and returns it in
/// [`matmul_dtype`]`(dtype)`, ready for a matmul.
pub fn round_for_matmul(tensor: &Tensor, dtype: DType) -> Result<Tensor> {
    cast(&cast(tensor, dtype)?, matmul_dtype(dtype))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn half_precision_checkpoints_compute_in_f32() {
        for storage in [DType::F16, DType::BF16] {
            let policy = PrecisionPolicy::from_parameter_dtype(storage);
            assert_eq!(policy.storage(), storage);
            assert_eq!(policy.compute(), DType::F32);
            assert_eq!(policy.reduction(), DType::F32);
        }
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F64);
        assert_eq!(policy.compute(), DType::F64);
        assert_eq!(policy.reduction(), DType::F64);
    }

    #[test]
    fn outputs_return_to_storage_dtype() -> Result<()> {
        let policy = PrecisionPolicy::from_parameter_dtype(DType::BF16);
        let hidden = Tensor::from_vec(vec![0.125f32, -0.75, 3.5], (3,), &Device::Cpu)?
            .to_dtype(DType::BF16)?;
        let widened = policy.cast_for_matmul(&hidden)?;
        assert_eq!(widened.dtype(), DType::F32);
        let restored = policy.cast_to_storage(&widened)?;
        assert_eq!(restored.dtype(), DType::BF16);
        // These values are exact in bf16.
        assert_eq!(
            restored.to_dtype(DType::F32)?.to_vec1::<f32>()?,
            vec![0.125, -0.75, 3.5]
        );
        Ok(())
    }

    #[test]
    fn bf16_operands_are_rounded_then_widened() -> Result<()> {
        // 1 + 2^-10 is not representable in bf16 and rounds to 1.
        let t = Tensor::from_vec(vec![1.0f32 + 1.0 / 1024.0, 0.5], (2,), &Device::Cpu)?;
        let rounded = round_for_matmul(&t, DType::BF16)?;
        assert_eq!(rounded.dtype(), DType::F32);
        assert_eq!(rounded.to_vec1::<f32>()?, vec![1.0, 0.5]);
        assert_eq!(round_for_matmul(&t, DType::F16)?.dtype(), DType::F16);
        assert_eq!(round_for_matmul(&t, DType::F32)?.id(), t.id());
        Ok(())
    }

    #[test]
    fn matching_dtype_is_not_copied() -> Result<()> {
        let t = Tensor::zeros((2, 2), DType::F32, &Device::Cpu)?;
        assert_eq!(cast(&t, DType::F32)?.id(), t.id());
        Ok(())
    }
}
