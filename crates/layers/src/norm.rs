//! Root-mean-square normalisation for LLaMA-style decoder blocks.
//!
//! Inputs follow the `(.., hidden)` convention and are normalised along the
//! last axis: `x * rsqrt(mean(x^2) + eps) * weight`. Statistics are promoted to
//! [`PrecisionPolicy::reduction`] before the result is cast back to storage.
//!
//! Checkpoints name the stabiliser differently (`variance_epsilon`, `epsilon`,
//! `eps`, or `rms_norm_eps` in model configs). [`EpsilonAttributes`] resolves
//! those spellings once at load time so [`NormConfig`] always carries a
//! single value.

use candle_core::{Result, Tensor, D};
use serde::{Deserialize, Serialize};

use crate::{checks, dtypes::PrecisionPolicy, LayerError};

/// Raw epsilon attributes as found in a model configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EpsilonAttributes {
    #[serde(default, alias = "rms_norm_eps", skip_serializing_if = "Option::is_none")]
    pub variance_epsilon: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epsilon: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eps: Option<f64>,
}

impl EpsilonAttributes {
    /// Picks the first attribute present, in `variance_epsilon`, `epsilon`,
    /// `eps` order.
    pub fn resolve(&self) -> std::result::Result<f64, LayerError> {
        let value = self
            .variance_epsilon
            .or(self.epsilon)
            .or(self.eps)
            .ok_or_else(|| {
                LayerError::Config(
                    "normalisation requires one of `variance_epsilon`, `epsilon` or `eps`".into(),
                )
            })?;
        if !value.is_finite() || value < 0.0 {
            return Err(LayerError::Config(format!(
                "normalisation epsilon must be a finite non-negative number, got {value}"
            )));
        }
        Ok(value)
    }
}

/// Configuration for an RMS normalisation layer.
#[derive(Debug, Clone, PartialEq)]
pub struct NormConfig {
    /// Size of the hidden dimension being normalised.
    pub hidden_size: usize,
    /// Numeric stabiliser added to the mean square.
    pub epsilon: f64,
}

impl NormConfig {
    pub fn new(hidden_size: usize, epsilon: f64) -> Self {
        Self {
            hidden_size,
            epsilon,
        }
    }

    /// Builds a configuration from the epsilon spellings of a model config.
    pub fn from_attributes(
        hidden_size: usize,
        attributes: &EpsilonAttributes,
    ) -> std::result::Result<Self, LayerError> {
        Ok(Self::new(hidden_size, attributes.resolve()?))
    }
}

/// Shared interface for normalisation layers used inside decoder blocks.
pub trait NormalizationLayer: Send + Sync {
    /// Returns the configuration so callers can check shape compatibility.
    fn config(&self) -> &NormConfig;

    /// Applies the normalisation to a hidden state tensor.
    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor>;
}

/// RMSNorm with a learned per-channel scale.
#[derive(Debug, Clone)]
pub struct RmsNorm {
    config: NormConfig,
    weight: Tensor,
}

impl RmsNorm {
    pub fn new(weight: Tensor, config: NormConfig) -> Result<Self> {
        checks::expect_shape("norm.weight", &weight, &[config.hidden_size])?;
        checks::expect_dtype_in("norm.weight", &weight, checks::FLOAT_DTYPES)?;
        checks::expect_contiguous("norm.weight", &weight)?;
        Ok(Self { config, weight })
    }

    /// Returns the scale vector.
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }
}

impl NormalizationLayer for RmsNorm {
    fn config(&self) -> &NormConfig {
        &self.config
    }

    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_last_dim("norm.input", hidden, self.config.hidden_size)?;

        let compute = policy.cast_for_reduction(hidden)?;
        let mean_square = compute.sqr()?.mean_keepdim(D::Minus1)?;
        let inv_rms = (mean_square + self.config.epsilon)?.sqrt()?.recip()?;
        let normalized = compute.broadcast_mul(&inv_rms)?;

        let weight = self.weight.to_dtype(normalized.dtype())?;
        let scaled = normalized.broadcast_mul(&weight)?;
        policy.cast_to_storage(&scaled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::ops;

    fn build_input(device: &Device, dtype: DType, shape: (usize, usize, usize)) -> Result<Tensor> {
        let total = shape.0 * shape.1 * shape.2;
        let data = (0..total)
            .map(|i| (i as f32 * 0.25_f32) - 1.5_f32)
            .collect::<Vec<_>>();
        Tensor::from_vec(data, shape, device)?.to_dtype(dtype)
    }

    fn max_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
        a.to_dtype(DType::F32)?
            .sub(&b.to_dtype(DType::F32)?)?
            .abs()?
            .max_all()?
            .to_vec0::<f32>()
    }

    #[test]
    fn rms_norm_matches_candle_reference_across_dtypes() -> Result<()> {
        let device = Device::Cpu;
        let hidden = 4;
        let config = NormConfig::new(hidden, 1e-6);
        let weight_f32 = Tensor::from_vec(vec![1.0f32, 0.5, -0.25, 1.5], (hidden,), &device)?;

        for &dtype in &[DType::F32, DType::F16, DType::BF16] {
            let input = build_input(&device, dtype, (2, 3, hidden))?;
            let weight = weight_f32.to_dtype(dtype)?;
            let layer = RmsNorm::new(weight.clone(), config.clone())?;
            let policy = PrecisionPolicy::from_parameter_dtype(dtype);
            let output = layer.forward(&input, &policy)?;

            assert_eq!(output.dims(), input.dims());
            assert_eq!(output.dtype(), dtype);

            let reference = ops::rms_norm(
                &input.to_dtype(DType::F32)?,
                &weight_f32,
                config.epsilon as f32,
            )?;
            let tol = match dtype {
                DType::F16 => 5e-3,
                DType::BF16 => 3e-2,
                _ => 1e-5,
            };
            let diff = max_diff(&output, &reference)?;
            assert!(diff < tol, "max diff {} for dtype {:?}", diff, dtype);
        }
        Ok(())
    }

    #[test]
    fn constant_input_returns_weight() -> Result<()> {
        let device = Device::Cpu;
        let weight = Tensor::from_vec(vec![0.5f32, 2.0, -1.0, 3.0, 0.25, 1.0], (6,), &device)?;
        let layer = RmsNorm::new(weight.clone(), NormConfig::new(6, 1e-6))?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);

        for value in [3.0f32, 0.75, 12.0] {
            let input = Tensor::full(value, (1, 2, 6), &device)?;
            let output = layer.forward(&input, &policy)?;
            let expected = weight.reshape((1, 1, 6))?.broadcast_as((1, 2, 6))?;
            assert!(max_diff(&output, &expected)? < 1e-4);
        }
        Ok(())
    }

    #[test]
    fn epsilon_resolution_prefers_variance_epsilon() {
        let attrs = EpsilonAttributes {
            variance_epsilon: Some(1e-6),
            epsilon: Some(1e-5),
            eps: Some(1e-4),
        };
        assert_eq!(attrs.resolve().unwrap(), 1e-6);

        let attrs = EpsilonAttributes {
            eps: Some(1e-4),
            ..Default::default()
        };
        assert_eq!(attrs.resolve().unwrap(), 1e-4);
    }

    #[test]
    fn missing_epsilon_is_config_error() {
        let err = NormConfig::from_attributes(8, &EpsilonAttributes::default()).unwrap_err();
        assert!(matches!(err, LayerError::Config(_)));
    }

    #[test]
    fn hf_spelling_is_accepted() {
        let attrs: EpsilonAttributes =
            serde_json::from_str(r#"{"rms_norm_eps": 1e-5, "hidden_size": 8}"#).unwrap();
        assert_eq!(attrs.resolve().unwrap(), 1e-5);
    }

    #[test]
    fn rejects_mismatched_hidden_size() -> Result<()> {
        let device = Device::Cpu;
        let layer = RmsNorm::new(Tensor::ones(4, DType::F32, &device)?, NormConfig::new(4, 1e-6))?;
        let input = Tensor::ones((1, 2, 5), DType::F32, &device)?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        assert!(layer.forward(&input, &policy).is_err());
        Ok(())
    }
}
