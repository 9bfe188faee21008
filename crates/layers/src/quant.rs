//! Quantized weight containers and activation observers.
//!
//! Weights are quantized row-major with one parameter set per tensor, per
//! output channel, or per group of input channels:
//!
//! * **INT8** is symmetric: `scale = max|w| / 127`, `q = round(w / scale)` in
//!   `[-127, 127]`, zero point `0`.
//! * **INT4** is asymmetric: `scale = (max - min) / 15`,
//!   `zero = round(-min / scale)`, `q = round(w / scale) + zero` in `[0, 15]`.
//!
//! Dequantisation is always `(q - zero) * scale`. The tensor library has no
//! signed 8-bit dtype, so quantized payloads live in plain vectors and are
//! packed into bytes (`U8`) only when serialised.

use candle_core::{DType, Device, Error, Result, Tensor};
use serde::{Deserialize, Serialize};

/// Integer width of a quantized payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuantDType {
    Int8,
    Int4,
}

impl QuantDType {
    /// Inclusive range of stored integer values.
    pub fn range(self) -> (i32, i32) {
        match self {
            QuantDType::Int8 => (-127, 127),
            QuantDType::Int4 => (0, 15),
        }
    }

    pub fn bits(self) -> usize {
        match self {
            QuantDType::Int8 => 8,
            QuantDType::Int4 => 4,
        }
    }
}

impl std::fmt::Display for QuantDType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuantDType::Int8 => f.write_str("INT8"),
            QuantDType::Int4 => f.write_str("INT4"),
        }
    }
}

/// Granularity of quantization parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QScheme {
    PerTensor,
    PerChannel,
    PerGroup { group_size: usize },
}

impl QScheme {
    /// Number of parameter sets required for a `[rows, cols]` matrix.
    pub fn param_count(self, rows: usize, cols: usize) -> usize {
        match self {
            QScheme::PerTensor => 1,
            QScheme::PerChannel => rows,
            QScheme::PerGroup { group_size } => rows * cols.div_ceil(group_size.max(1)),
        }
    }

    /// Width of the input-channel span sharing one parameter set.
    pub fn group_width(self, cols: usize) -> usize {
        match self {
            QScheme::PerTensor | QScheme::PerChannel => cols,
            QScheme::PerGroup { group_size } => group_size.max(1).min(cols.max(1)),
        }
    }
}

/// Immutable scale / zero-point parameters attached to a quantized tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantizationConfig {
    dtype: QuantDType,
    scheme: QScheme,
    scales: Vec<f32>,
    zero_points: Vec<i32>,
}

impl QuantizationConfig {
    pub fn new(
        dtype: QuantDType,
        scheme: QScheme,
        scales: Vec<f32>,
        zero_points: Vec<i32>,
    ) -> Result<Self> {
        if scales.is_empty() || scales.len() != zero_points.len() {
            return Err(Error::Msg(format!(
                "quantization config needs matching scales/zero points, got {} and {}",
                scales.len(),
                zero_points.len()
            )));
        }
        if let QScheme::PerGroup { group_size: 0 } = scheme {
            return Err(Error::Msg("group_size must be greater than zero".into()));
        }
        if let Some(bad) = scales.iter().find(|s| !s.is_finite() || **s <= 0.0) {
            return Err(Error::Msg(format!(
                "quantization scales must be finite and positive, found {bad}"
            )));
        }
        let (lo, hi) = dtype.range();
        if let Some(bad) = zero_points.iter().find(|z| **z < lo || **z > hi) {
            return Err(Error::Msg(format!(
                "zero point {bad} outside the {dtype} range [{lo}, {hi}]"
            )));
        }
        Ok(Self {
            dtype,
            scheme,
            scales,
            zero_points,
        })
    }

    pub fn dtype(&self) -> QuantDType {
        self.dtype
    }

    pub fn scheme(&self) -> QScheme {
        self.scheme
    }

    pub fn scales(&self) -> &[f32] {
        &self.scales
    }

    pub fn zero_points(&self) -> &[i32] {
        &self.zero_points
    }

    pub fn is_symmetric(&self) -> bool {
        self.zero_points.iter().all(|z| *z == 0)
    }

    fn param_index(&self, row: usize, col: usize, cols: usize) -> usize {
        match self.scheme {
            QScheme::PerTensor => 0,
            QScheme::PerChannel => row,
            QScheme::PerGroup { group_size } => {
                row * cols.div_ceil(group_size) + col / group_size
            }
        }
    }
}

/// A `[rows, cols]` matrix of quantized values with its parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedTensor {
    config: QuantizationConfig,
    rows: usize,
    cols: usize,
    values: Vec<i8>,
}

impl QuantizedTensor {
    /// Quantizes a rank-2 float tensor.
    pub fn quantize(weight: &Tensor, dtype: QuantDType, scheme: QScheme) -> Result<Self> {
        let (rows, cols) = weight.dims2()?;
        let data = weight.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let width = scheme.group_width(cols);
        let spans: Vec<(usize, usize, usize)> = match scheme {
            QScheme::PerTensor => vec![(0, rows, 0)],
            QScheme::PerChannel => (0..rows).map(|r| (r, r + 1, 0)).collect(),
            QScheme::PerGroup { .. } => (0..rows)
                .flat_map(|r| (0..cols).step_by(width).map(move |c| (r, r + 1, c)))
                .collect(),
        };

        let mut scales = Vec::with_capacity(spans.len());
        let mut zero_points = Vec::with_capacity(spans.len());
        for &(row_start, row_end, col_start) in &spans {
            let col_end = (col_start + width).min(cols);
            let (mut lo, mut hi) = (f32::INFINITY, f32::NEG_INFINITY);
            for r in row_start..row_end {
                for &v in &data[r * cols + col_start..r * cols + col_end] {
                    lo = lo.min(v);
                    hi = hi.max(v);
                }
            }
            let (scale, zero) = choose_params(dtype, lo, hi);
            scales.push(scale);
            zero_points.push(zero);
        }

        let config = QuantizationConfig::new(dtype, scheme, scales, zero_points)?;
        let (qmin, qmax) = dtype.range();
        let mut values = Vec::with_capacity(rows * cols);
        for r in 0..rows {
            for c in 0..cols {
                let idx = config.param_index(r, c, cols);
                let scale = config.scales[idx];
                let zero = config.zero_points[idx];
                let q = (data[r * cols + c] / scale).round() as i32 + zero;
                values.push(q.clamp(qmin, qmax) as i8);
            }
        }
        Ok(Self {
            config,
            rows,
            cols,
            values,
        })
    }

    /// Assembles a tensor from already quantized values.
    pub fn from_parts(
        config: QuantizationConfig,
        rows: usize,
        cols: usize,
        values: Vec<i8>,
    ) -> Result<Self> {
        if values.len() != rows * cols {
            return Err(Error::Msg(format!(
                "expected {} quantized values for [{rows}, {cols}], got {}",
                rows * cols,
                values.len()
            )));
        }
        let expected = config.scheme.param_count(rows, cols);
        if config.scales.len() != expected {
            return Err(Error::Msg(format!(
                "expected {expected} parameter sets for [{rows}, {cols}], got {}",
                config.scales.len()
            )));
        }
        let (qmin, qmax) = config.dtype.range();
        if values.iter().any(|v| (*v as i32) < qmin || (*v as i32) > qmax) {
            return Err(Error::Msg(format!(
                "quantized values fall outside the {} range",
                config.dtype
            )));
        }
        Ok(Self {
            config,
            rows,
            cols,
            values,
        })
    }

    pub fn config(&self) -> &QuantizationConfig {
        &self.config
    }

    pub fn dims(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn values(&self) -> &[i8] {
        &self.values
    }

    /// Scale and zero point covering element `(row, col)`.
    pub fn params_at(&self, row: usize, col: usize) -> (f32, i32) {
        let idx = self.config.param_index(row, col, self.cols);
        (self.config.scales[idx], self.config.zero_points[idx])
    }

    /// Reconstructs the float matrix as an `f32` tensor.
    pub fn dequantize(&self, device: &Device) -> Result<Tensor> {
        let mut data = Vec::with_capacity(self.values.len());
        for r in 0..self.rows {
            for c in 0..self.cols {
                let (scale, zero) = self.params_at(r, c);
                let q = self.values[r * self.cols + c] as i32;
                data.push((q - zero) as f32 * scale);
            }
        }
        Tensor::from_vec(data, (self.rows, self.cols), device)
    }

    /// Number of bytes per row once packed.
    pub fn packed_cols(dtype: QuantDType, cols: usize) -> usize {
        match dtype {
            QuantDType::Int8 => cols,
            QuantDType::Int4 => cols.div_ceil(2),
        }
    }

    /// Packs the payload into bytes: INT8 as two's complement, INT4 as two
    /// values per byte with the low nibble first.
    pub fn pack(&self) -> Vec<u8> {
        match self.config.dtype {
            QuantDType::Int8 => self.values.iter().map(|v| *v as u8).collect(),
            QuantDType::Int4 => {
                let packed_cols = Self::packed_cols(QuantDType::Int4, self.cols);
                let mut out = Vec::with_capacity(self.rows * packed_cols);
                for row in self.values.chunks(self.cols.max(1)) {
                    for pair in row.chunks(2) {
                        let low = pair[0] as u8 & 0x0f;
                        let high = pair.get(1).map(|v| *v as u8 & 0x0f).unwrap_or(0);
                        out.push(low | (high << 4));
                    }
                }
                out
            }
        }
    }

    /// Inverse of [`QuantizedTensor::pack`].
    pub fn unpack(dtype: QuantDType, bytes: &[u8], rows: usize, cols: usize) -> Result<Vec<i8>> {
        let packed_cols = Self::packed_cols(dtype, cols);
        if bytes.len() != rows * packed_cols {
            return Err(Error::Msg(format!(
                "expected {} packed bytes for [{rows}, {cols}] {dtype}, got {}",
                rows * packed_cols,
                bytes.len()
            )));
        }
        Ok(match dtype {
            QuantDType::Int8 => bytes.iter().map(|b| *b as i8).collect(),
            QuantDType::Int4 => {
                let mut out = Vec::with_capacity(rows * cols);
                for row in bytes.chunks(packed_cols.max(1)) {
                    for c in 0..cols {
                        let byte = row[c / 2];
                        let nibble = if c % 2 == 0 { byte & 0x0f } else { byte >> 4 };
                        out.push(nibble as i8);
                    }
                }
                out
            }
        })
    }

    /// Packed payload as a `U8` tensor shaped `[rows, packed_cols]`.
    pub fn packed_tensor(&self, device: &Device) -> Result<Tensor> {
        let packed_cols = Self::packed_cols(self.config.dtype, self.cols);
        Tensor::from_vec(self.pack(), (self.rows, packed_cols), device)
    }
}

fn choose_params(dtype: QuantDType, lo: f32, hi: f32) -> (f32, i32) {
    match dtype {
        QuantDType::Int8 => {
            let abs_max = lo.abs().max(hi.abs());
            let scale = if abs_max > 0.0 { abs_max / 127.0 } else { 1.0 };
            (scale, 0)
        }
        QuantDType::Int4 => {
            let lo = lo.min(0.0);
            let hi = hi.max(0.0);
            let span = hi - lo;
            if span <= 0.0 {
                return (1.0, 0);
            }
            let scale = span / 15.0;
            let zero = (-lo / scale).round().clamp(0.0, 15.0) as i32;
            (scale, zero)
        }
    }
}

/// Running per-channel statistics of the activations entering a linear layer.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivationObserver {
    channels: usize,
    min: Vec<f32>,
    max: Vec<f32>,
    batches: usize,
}

impl ActivationObserver {
    pub fn new(channels: usize) -> Self {
        Self {
            channels,
            min: vec![f32::INFINITY; channels],
            max: vec![f32::NEG_INFINITY; channels],
            batches: 0,
        }
    }

    /// Folds a `(.., channels)` activation tensor into the statistics.
    pub fn observe(&mut self, activations: &Tensor) -> Result<()> {
        let dims = activations.dims();
        if dims.last() != Some(&self.channels) {
            return Err(Error::Msg(format!(
                "observer expects {} channels, got shape {:?}",
                self.channels, dims
            )));
        }
        let rows = activations.elem_count() / self.channels.max(1);
        if rows == 0 {
            return Ok(());
        }
        let flat = activations
            .to_dtype(DType::F32)?
            .reshape((rows, self.channels))?;
        let mins = flat.min(0)?.to_vec1::<f32>()?;
        let maxs = flat.max(0)?.to_vec1::<f32>()?;
        for c in 0..self.channels {
            self.min[c] = self.min[c].min(mins[c]);
            self.max[c] = self.max[c].max(maxs[c]);
        }
        self.batches += 1;
        Ok(())
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Number of activation tensors folded in so far.
    pub fn batches(&self) -> usize {
        self.batches
    }

    /// Per-channel `max |x|`; zero for channels never observed.
    pub fn abs_max(&self) -> Vec<f32> {
        self.min
            .iter()
            .zip(&self.max)
            .map(|(lo, hi)| {
                if lo.is_finite() && hi.is_finite() {
                    lo.abs().max(hi.abs())
                } else {
                    0.0
                }
            })
            .collect()
    }

    /// Tensor-wide `max |x / s|` after dividing channel `j` by `smoothing[j]`.
    pub fn smoothed_abs_max(&self, smoothing: &[f32]) -> f32 {
        self.abs_max()
            .iter()
            .zip(smoothing)
            .map(|(m, s)| m / s)
            .fold(0.0f32, f32::max)
    }
}
