//! Linear projections with dense and quantized execution kernels.
//!
//! Inputs are shaped `(.., in_dim)` and produce `(.., out_dim)`. A [`Linear`]
//! owns one [`LinearKernel`]:
//!
//! * `Dense` multiplies in [`PrecisionPolicy::compute`] like any float layer.
//! * `WeightOnly` keeps an INT8 or INT4 weight and executes in the selected
//!   [`LowpMode`]: float modes round activations and the dequantized weight
//!   to that dtype and multiply them (`bf16` operands widened to `f32`),
//!   `Int8` quantizes activations per row and runs the integer GEMM.
//! * `SmoothQuant` divides activations by the per-channel smoothing factors,
//!   quantizes them with the calibrated static scale and runs the integer
//!   GEMM against the pre-scaled int8 weight.
//!
//! Every kernel returns in [`PrecisionPolicy::storage`]. An optional
//! [`ActivationObserver`] records the raw inputs seen by `forward`, which is
//! how calibration collects statistics without a separate code path.

use std::sync::{Arc, Mutex};

use candle_core::{DType, Device, Error, Result, Tensor};
use serde::{Deserialize, Serialize};

use crate::{
    checks,
    dtypes::{self, PrecisionPolicy},
    gemm::{self, ActivationQuant},
    quant::{ActivationObserver, QuantizedTensor},
};

/// Configuration shared by projection layers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinearConfig {
    /// Incoming feature dimension.
    pub input_dim: usize,
    /// Output feature dimension.
    pub output_dim: usize,
    /// Whether a bias vector is applied.
    pub bias: bool,
}

impl LinearConfig {
    /// Creates a bias-free projection configuration.
    pub fn new(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim,
            bias: false,
        }
    }

    pub fn with_bias(mut self, bias: bool) -> Self {
        self.bias = bias;
        self
    }
}

/// Execution precision of a weight-only quantized linear.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LowpMode {
    Fp32,
    Fp16,
    Bf16,
    Int8,
}

impl LowpMode {
    /// Float precision of the matmul operands, `None` for the integer path.
    pub fn float_dtype(self) -> Option<DType> {
        match self {
            LowpMode::Fp32 => Some(DType::F32),
            LowpMode::Fp16 => Some(DType::F16),
            LowpMode::Bf16 => Some(DType::BF16),
            LowpMode::Int8 => None,
        }
    }
}

impl std::fmt::Display for LowpMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LowpMode::Fp32 => "FP32",
            LowpMode::Fp16 => "FP16",
            LowpMode::Bf16 => "BF16",
            LowpMode::Int8 => "INT8",
        };
        f.write_str(name)
    }
}

/// Shared interface for affine projections.
pub trait LinearLayer: Send + Sync {
    /// Returns the static configuration used to validate inputs.
    fn config(&self) -> &LinearConfig;

    /// Applies the projection under `policy`.
    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor>;
}

/// Weight representation and the matching execution strategy.
#[derive(Debug, Clone)]
pub enum LinearKernel {
    Dense {
        weight: Tensor,
    },
    WeightOnly {
        weight: QuantizedTensor,
        lowp: LowpMode,
        /// Dequantized weight rounded to the lowp dtype, for the float modes.
        dequantized: Option<Tensor>,
    },
    SmoothQuant {
        weight: QuantizedTensor,
        /// Per-input-channel divisor applied to activations, `[in_dim]` f32.
        smoothing: Tensor,
        /// Static per-tensor activation scale.
        input_scale: f32,
    },
}

impl LinearKernel {
    /// Short name used in logs and execution plans.
    pub fn name(&self) -> &'static str {
        match self {
            LinearKernel::Dense { .. } => "dense",
            LinearKernel::WeightOnly { .. } => "weight_only",
            LinearKernel::SmoothQuant { .. } => "smooth_quant",
        }
    }

    pub fn is_quantized(&self) -> bool {
        !matches!(self, LinearKernel::Dense { .. })
    }
}

/// Supported weight initialisation policies for randomly built models.
#[derive(Debug, Clone, Copy)]
pub enum LinearInit {
    /// Zero-mean normal with the given standard deviation.
    Normal { std: f64 },
    /// Xavier/Glorot uniform initialisation.
    XavierUniform,
}

impl LinearInit {
    fn sample(&self, shape: (usize, usize), device: &Device, dtype: DType) -> Result<Tensor> {
        let (out_dim, in_dim) = shape;
        let weight = match self {
            LinearInit::Normal { std } => Tensor::randn(0f32, *std as f32, shape, device)?,
            LinearInit::XavierUniform => {
                let bound = (6.0f64 / (in_dim + out_dim) as f64).sqrt() as f32;
                Tensor::rand(-bound, bound, shape, device)?
            }
        };
        weight.to_dtype(dtype)
    }
}

/// Affine projection with an optional bias and a swappable kernel.
#[derive(Debug, Clone)]
pub struct Linear {
    config: LinearConfig,
    kernel: LinearKernel,
    bias: Option<Tensor>,
    observer: Option<Arc<Mutex<ActivationObserver>>>,
}

impl Linear {
    /// Constructs a dense linear layer from `[out, in]` weights.
    pub fn new(config: LinearConfig, weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        validate_dense_weight(&config, &weight)?;
        validate_bias(&config, bias.as_ref())?;
        Ok(Self {
            config,
            kernel: LinearKernel::Dense { weight },
            bias,
            observer: None,
        })
    }

    /// Builds a dense layer with randomly initialised weights following `init`.
    pub fn with_init(
        config: LinearConfig,
        init: &LinearInit,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let weight = init.sample((config.output_dim, config.input_dim), device, dtype)?;
        let bias = if config.bias {
            Some(Tensor::zeros(config.output_dim, dtype, device)?)
        } else {
            None
        };
        Self::new(config, weight, bias)
    }

    /// Builds a weight-only quantized layer.
    pub fn weight_only(
        config: LinearConfig,
        weight: QuantizedTensor,
        bias: Option<Tensor>,
        lowp: LowpMode,
        device: &Device,
    ) -> Result<Self> {
        validate_bias(&config, bias.as_ref())?;
        let kernel = weight_only(weight, lowp, device)?;
        validate_kernel(&config, &kernel)?;
        Ok(Self {
            config,
            kernel,
            bias,
            observer: None,
        })
    }

    /// Builds a smooth-quant layer from a weight already multiplied by the
    /// smoothing factors.
    pub fn smooth_quant(
        config: LinearConfig,
        weight: QuantizedTensor,
        smoothing: Tensor,
        input_scale: f32,
        bias: Option<Tensor>,
    ) -> Result<Self> {
        validate_bias(&config, bias.as_ref())?;
        let kernel = smooth_quant(weight, smoothing, input_scale)?;
        validate_kernel(&config, &kernel)?;
        Ok(Self {
            config,
            kernel,
            bias,
            observer: None,
        })
    }

    pub fn kernel(&self) -> &LinearKernel {
        &self.kernel
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    /// Float weight equivalent to the current kernel, `[out, in]` f32 for
    /// quantized kernels.
    ///
    /// For smooth-quant the smoothing is folded back out of the weight.
    pub fn dense_weight(&self) -> Result<Tensor> {
        match &self.kernel {
            LinearKernel::Dense { weight } => Ok(weight.clone()),
            LinearKernel::WeightOnly { weight, .. } => weight.dequantize(&Device::Cpu),
            LinearKernel::SmoothQuant {
                weight, smoothing, ..
            } => weight
                .dequantize(smoothing.device())?
                .broadcast_div(&smoothing.unsqueeze(0)?),
        }
    }

    /// Swaps the kernel after checking it covers the same geometry.
    pub fn replace_kernel(&mut self, kernel: LinearKernel) -> Result<()> {
        validate_kernel(&self.config, &kernel)?;
        log::debug!(
            "linear [{}x{}]: {} -> {}",
            self.config.output_dim,
            self.config.input_dim,
            self.kernel.name(),
            kernel.name()
        );
        self.kernel = kernel;
        Ok(())
    }

    /// Starts recording input statistics; replaces any previous observer.
    pub fn attach_observer(&mut self) {
        self.observer = Some(Arc::new(Mutex::new(ActivationObserver::new(
            self.config.input_dim,
        ))));
    }

    /// Stops recording and returns the collected statistics.
    pub fn detach_observer(&mut self) -> Option<ActivationObserver> {
        let observer = self.observer.take()?;
        match Arc::try_unwrap(observer) {
            Ok(mutex) => mutex.into_inner().ok(),
            Err(shared) => shared.lock().ok().map(|guard| guard.clone()),
        }
    }

    pub fn is_observed(&self) -> bool {
        self.observer.is_some()
    }

    fn observe(&self, hidden: &Tensor) -> Result<()> {
        if let Some(observer) = &self.observer {
            let mut guard = observer
                .lock()
                .map_err(|_| Error::Msg("linear: activation observer poisoned".into()))?;
            guard.observe(hidden)?;
        }
        Ok(())
    }

    fn project(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        match &self.kernel {
            LinearKernel::Dense { weight } => {
                let input = policy.cast_for_matmul(hidden)?;
                let weight = policy.cast_for_matmul(weight)?;
                matmul_last(&input, &weight)
            }
            LinearKernel::WeightOnly {
                weight,
                lowp,
                dequantized,
            } => match lowp.float_dtype() {
                Some(dtype) => {
                    let w = match dequantized {
                        Some(w) => w.clone(),
                        None => dtypes::round_for_matmul(&weight.dequantize(hidden.device())?, dtype)?,
                    };
                    matmul_last(&dtypes::round_for_matmul(hidden, dtype)?, &w)
                }
                None => gemm::int8_matmul(hidden, weight, ActivationQuant::Dynamic),
            },
            LinearKernel::SmoothQuant {
                weight,
                smoothing,
                input_scale,
            } => {
                let scaled = hidden.to_dtype(DType::F32)?.broadcast_div(smoothing)?;
                gemm::int8_matmul(&scaled, weight, ActivationQuant::Static(*input_scale))
            }
        }
    }
}

impl LinearLayer for Linear {
    fn config(&self) -> &LinearConfig {
        &self.config
    }

    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_last_dim("linear.input", hidden, self.config.input_dim)?;
        self.observe(hidden)?;

        let mut output = self.project(hidden, policy)?;
        if let Some(bias) = &self.bias {
            output = output.broadcast_add(&bias.to_dtype(output.dtype())?)?;
        }
        policy.cast_to_storage(&output)
    }
}

/// Weight-only kernel; the float lowp modes dequantize once up front.
pub fn weight_only(
    weight: QuantizedTensor,
    lowp: LowpMode,
    device: &Device,
) -> Result<LinearKernel> {
    let dequantized = match lowp.float_dtype() {
        Some(dtype) => Some(dtypes::round_for_matmul(&weight.dequantize(device)?, dtype)?),
        None => None,
    };
    Ok(LinearKernel::WeightOnly {
        weight,
        lowp,
        dequantized,
    })
}

/// Smooth-quant kernel over a weight that already carries the smoothing.
pub fn smooth_quant(
    weight: QuantizedTensor,
    smoothing: Tensor,
    input_scale: f32,
) -> Result<LinearKernel> {
    if !input_scale.is_finite() || input_scale <= 0.0 {
        return Err(Error::Msg(format!(
            "smooth-quant input scale must be positive, got {input_scale}"
        )));
    }
    let smoothing = smoothing.to_dtype(DType::F32)?;
    checks::expect_shape("linear.smoothing", &smoothing, &[weight.dims().1])?;
    Ok(LinearKernel::SmoothQuant {
        weight,
        smoothing,
        input_scale,
    })
}

/// Multiplies `(.., in)` by a `[out, in]` weight through a flattened 2-D matmul.
fn matmul_last(input: &Tensor, weight: &Tensor) -> Result<Tensor> {
    let mut dims = input.dims().to_vec();
    let in_dim = dims.last().copied().unwrap_or(0);
    let rows = input.elem_count() / in_dim.max(1);
    let out = input.reshape((rows, in_dim))?.matmul(&weight.t()?)?;
    if let Some(last) = dims.last_mut() {
        *last = weight.dim(0)?;
    }
    out.reshape(dims)
}

fn validate_dense_weight(config: &LinearConfig, weight: &Tensor) -> Result<()> {
    checks::expect_shape(
        "linear.weight",
        weight,
        &[config.output_dim, config.input_dim],
    )?;
    checks::expect_dtype_in("linear.weight", weight, checks::FLOAT_DTYPES)?;
    checks::expect_contiguous("linear.weight", weight)
}

fn validate_kernel(config: &LinearConfig, kernel: &LinearKernel) -> Result<()> {
    match kernel {
        LinearKernel::Dense { weight } => validate_dense_weight(config, weight),
        LinearKernel::WeightOnly { weight, .. } | LinearKernel::SmoothQuant { weight, .. } => {
            let expected = (config.output_dim, config.input_dim);
            if weight.dims() == expected {
                Ok(())
            } else {
                Err(Error::Msg(format!(
                    "linear.weight: expected quantized shape {:?}, got {:?}",
                    expected,
                    weight.dims()
                )))
            }
        }
    }
}

fn validate_bias(config: &LinearConfig, bias: Option<&Tensor>) -> Result<()> {
    match (config.bias, bias) {
        (true, Some(tensor)) => {
            checks::expect_shape("linear.bias", tensor, &[config.output_dim])?;
            checks::expect_dtype_in("linear.bias", tensor, checks::FLOAT_DTYPES)
        }
        (false, Some(_)) => Err(Error::Msg("bias provided but config disables bias".into())),
        (true, None) => Err(Error::Msg("config expects bias but none supplied".into())),
        (false, None) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quant::{QScheme, QuantDType};

    fn reference_linear(input: &Tensor, weight: &Tensor, bias: Option<&Tensor>) -> Result<Tensor> {
        let mut out = matmul_last(input, weight)?;
        if let Some(bias) = bias {
            out = out.broadcast_add(bias)?;
        }
        Ok(out)
    }

    fn max_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
        a.to_dtype(DType::F32)?
            .sub(&b.to_dtype(DType::F32)?)?
            .abs()?
            .max_all()?
            .to_vec0::<f32>()
    }

    fn fixture(rows: usize, cols: usize, step: f32, device: &Device) -> Result<Tensor> {
        let data: Vec<f32> = (0..rows * cols)
            .map(|i| ((i * 7 % 19) as f32 - 9.0) * step)
            .collect();
        Tensor::from_vec(data, (rows, cols), device)
    }

    #[test]
    fn dense_forward_matches_reference_across_dtypes() -> Result<()> {
        let device = Device::Cpu;
        let config = LinearConfig::new(8, 12).with_bias(true);
        let weight = fixture(12, 8, 0.01, &device)?;
        let bias = fixture(1, 12, 0.02, &device)?.squeeze(0)?;

        for &dtype in &[DType::F32, DType::F16, DType::BF16] {
            let linear = Linear::new(
                config.clone(),
                weight.to_dtype(dtype)?,
                Some(bias.to_dtype(dtype)?),
            )?;
            let input = fixture(10, 8, 0.1, &device)?.reshape((2, 5, 8))?.to_dtype(dtype)?;
            let policy = PrecisionPolicy::from_parameter_dtype(dtype);
            let output = linear.forward(&input, &policy)?;

            assert_eq!(output.dims(), &[2, 5, 12]);
            assert_eq!(output.dtype(), dtype);

            let reference = reference_linear(&input.to_dtype(DType::F32)?, &weight, Some(&bias))?;
            let tol = match dtype {
                DType::F16 => 1e-2,
                DType::BF16 => 2e-2,
                _ => 1e-5,
            };
            let max = max_diff(&output, &reference)?;
            assert!(max <= tol, "max diff {} for {:?}", max, dtype);
        }
        Ok(())
    }

    #[test]
    fn weight_only_modes_track_dequantized_reference() -> Result<()> {
        let device = Device::Cpu;
        let config = LinearConfig::new(16, 6);
        let weight = fixture(6, 16, 0.02, &device)?;
        let input = fixture(3, 16, 0.1, &device)?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);

        for (dtype, scheme) in [
            (QuantDType::Int8, QScheme::PerChannel),
            (QuantDType::Int4, QScheme::PerGroup { group_size: 8 }),
        ] {
            let q = QuantizedTensor::quantize(&weight, dtype, scheme)?;
            let reference = reference_linear(&input, &q.dequantize(&device)?, None)?;
            for (lowp, tol) in [
                (LowpMode::Fp32, 1e-5),
                (LowpMode::Bf16, 5e-2),
                (LowpMode::Int8, 2e-2),
            ] {
                let linear = Linear::weight_only(config.clone(), q.clone(), None, lowp, &device)?;
                let out = linear.forward(&input, &policy)?;
                let max = max_diff(&out, &reference)?;
                assert!(max <= tol, "{dtype} weights with {lowp} lowp: diff {max}");
            }
        }
        Ok(())
    }

    #[test]
    fn every_lowp_mode_runs_forward() -> Result<()> {
        let device = Device::Cpu;
        let config = LinearConfig::new(16, 5);
        let weight = fixture(5, 16, 0.03, &device)?;
        let q = QuantizedTensor::quantize(&weight, QuantDType::Int8, QScheme::PerChannel)?;
        let reference = reference_linear(&fixture(4, 16, 0.1, &device)?, &q.dequantize(&device)?, None)?;

        for storage in [DType::F32, DType::BF16] {
            let policy = PrecisionPolicy::from_parameter_dtype(storage);
            let input = fixture(4, 16, 0.1, &device)?.reshape((2, 2, 16))?.to_dtype(storage)?;
            for lowp in [LowpMode::Fp32, LowpMode::Fp16, LowpMode::Bf16, LowpMode::Int8] {
                let linear = Linear::weight_only(config.clone(), q.clone(), None, lowp, &device)?;
                let out = linear.forward(&input, &policy)?;
                assert_eq!(out.dims(), &[2, 2, 5]);
                assert_eq!(out.dtype(), storage);
                let max = max_diff(&out.reshape((4, 5))?, &reference)?;
                assert!(max <= 5e-2, "{storage:?} storage with {lowp} lowp: diff {max}");
            }
        }
        Ok(())
    }

    #[test]
    fn smooth_quant_close_to_float_output() -> Result<()> {
        let device = Device::Cpu;
        let config = LinearConfig::new(8, 4);
        let weight = fixture(4, 8, 0.05, &device)?;
        let input = fixture(6, 8, 0.2, &device)?;
        let smoothing = Tensor::from_vec(vec![1.0f32, 2.0, 0.5, 1.0, 1.5, 1.0, 0.75, 1.0], 8, &device)?;

        let smoothed = weight.broadcast_mul(&smoothing.unsqueeze(0)?)?;
        let q = QuantizedTensor::quantize(&smoothed, QuantDType::Int8, QScheme::PerChannel)?;
        let x_max = input
            .broadcast_div(&smoothing)?
            .abs()?
            .max_all()?
            .to_vec0::<f32>()?;
        let linear = Linear::smooth_quant(config, q, smoothing, x_max / 127.0, None)?;

        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        let out = linear.forward(&input, &policy)?;
        let reference = reference_linear(&input, &weight, None)?;
        assert!(max_diff(&out, &reference)? < 0.25);

        let restored = linear.dense_weight()?;
        assert!(max_diff(&restored, &weight)? < 0.01);
        Ok(())
    }

    #[test]
    fn observer_sees_forward_inputs() -> Result<()> {
        let device = Device::Cpu;
        let mut linear = Linear::new(LinearConfig::new(4, 2), fixture(2, 4, 0.1, &device)?, None)?;
        linear.attach_observer();
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        let input = Tensor::from_vec(vec![1.0f32, -2.0, 0.5, 3.0], (1, 1, 4), &device)?;
        linear.forward(&input, &policy)?;
        linear.forward(&input.affine(-2.0, 0.0)?, &policy)?;

        let observer = linear.detach_observer().expect("observer attached");
        assert_eq!(observer.batches(), 2);
        assert_eq!(observer.abs_max(), vec![2.0, 4.0, 1.0, 6.0]);
        assert!(!linear.is_observed());
        Ok(())
    }

    #[test]
    fn replace_kernel_rejects_other_geometry() -> Result<()> {
        let device = Device::Cpu;
        let mut linear = Linear::new(LinearConfig::new(4, 2), fixture(2, 4, 0.1, &device)?, None)?;
        let wrong = QuantizedTensor::quantize(&fixture(4, 4, 0.1, &device)?, QuantDType::Int8, QScheme::PerChannel)?;
        let kernel = weight_only(wrong, LowpMode::Int8, &device)?;
        assert!(linear.replace_kernel(kernel).is_err());
        assert_eq!(linear.kernel().name(), "dense");
        Ok(())
    }

    #[test]
    fn filled_weights_need_a_contiguous_copy() -> Result<()> {
        let device = Device::Cpu;
        let filled = Tensor::full(0.5f32, (2, 3), &device)?;
        assert!(Linear::new(LinearConfig::new(3, 2), filled.clone(), None).is_err());

        let linear = Linear::new(LinearConfig::new(3, 2), filled.contiguous()?, None)?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        let input = Tensor::ones((1, 1, 3), DType::F32, &device)?;
        let out = linear.forward(&input, &policy)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(out, vec![1.5, 1.5]);
        Ok(())
    }

    #[test]
    fn xavier_uniform_respects_bound() -> Result<()> {
        let device = Device::Cpu;
        let linear = Linear::with_init(LinearConfig::new(64, 32), &LinearInit::XavierUniform, &device, DType::F32)?;
        let bound = (6.0f32 / 96.0).sqrt();
        let max = linear.dense_weight()?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(max <= bound);
        Ok(())
    }
}
