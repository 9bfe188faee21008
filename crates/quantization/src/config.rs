//! Pipeline configuration read from TOML or JSON.
//!
//! Relative paths are resolved against the directory of the config file.
//! [`PipelineConfig::read`] only parses; [`PipelineConfig::validate`] collects
//! every problem into a single [`QuantizationError::Validation`].

use std::{
    fs,
    path::{Path, PathBuf},
};

use clap::ValueEnum;
use layers::QuantDType;
use serde::{Deserialize, Serialize};

use crate::{
    calibration::{MAX_CALIBRATION_BATCHES, PAD_MAX},
    error::{QuantizationError, QuantizationResult},
};

pub const DEFAULT_ALPHA: f32 = 0.8;
pub const DEFAULT_OUTPUT_DIR: &str = "saved_results";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum QuantMode {
    #[default]
    SmoothQuant,
    WeightOnly,
}

/// Requested execution precision of weight-only linears. `Auto` is resolved
/// against the weight dtype, see [`crate::recipe::resolve_lowp_mode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LowpSetting {
    #[default]
    Auto,
    Fp32,
    Fp16,
    Bf16,
    /// Integer GEMM with dynamic activation quantization. Rejected with
    /// INT8 weights.
    Int8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub model: ModelPaths,
    #[serde(default)]
    pub quantization: QuantizationSettings,
    #[serde(default)]
    pub calibration: CalibrationSettings,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPaths {
    /// HF-style `config.json`.
    pub config: PathBuf,
    /// Dense safetensors weights.
    pub weights: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantizationSettings {
    #[serde(default)]
    pub mode: QuantMode,
    /// Defaults to INT8, or INT4 when a low-precision checkpoint is given.
    #[serde(default)]
    pub weight_dtype: Option<QuantDType>,
    #[serde(default)]
    pub lowp_mode: LowpSetting,
    #[serde(default = "default_alpha")]
    pub alpha: f32,
    /// INT4 group width along the input dimension; whole rows when absent.
    #[serde(default)]
    pub group_size: Option<usize>,
    #[serde(default)]
    pub low_precision_checkpoint: Option<PathBuf>,
}

impl Default for QuantizationSettings {
    fn default() -> Self {
        Self {
            mode: QuantMode::default(),
            weight_dtype: None,
            lowp_mode: LowpSetting::default(),
            alpha: DEFAULT_ALPHA,
            group_size: None,
            low_precision_checkpoint: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSettings {
    /// JSON-lines file of pre-tokenized samples.
    #[serde(default)]
    pub data: Option<PathBuf>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_batches")]
    pub max_batches: usize,
    #[serde(default = "default_pad_max")]
    pub pad_max: usize,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            data: None,
            batch_size: default_batch_size(),
            max_batches: default_max_batches(),
            pad_max: default_pad_max(),
        }
    }
}

impl PipelineConfig {
    /// Reads and validates a config file.
    pub fn from_path(path: impl AsRef<Path>) -> QuantizationResult<Self> {
        let config = Self::read(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Parses a config file without validating it, so callers can apply
    /// overrides first.
    pub fn read(path: impl AsRef<Path>) -> QuantizationResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: PipelineConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(QuantizationError::Format(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        Ok(config)
    }

    pub fn validate(&self) -> QuantizationResult<()> {
        let mut errors = Vec::new();

        if self.model.config.as_os_str().is_empty() {
            errors.push("model.config must not be empty".to_string());
        }
        if self.model.weights.as_os_str().is_empty() {
            errors.push("model.weights must not be empty".to_string());
        }
        if self.output_dir.as_os_str().is_empty() {
            errors.push("output_dir must not be empty".to_string());
        }

        let quant = &self.quantization;
        if !(0.0..=1.0).contains(&quant.alpha) {
            errors.push("quantization.alpha must be in [0, 1]".to_string());
        }
        if let Some(0) = quant.group_size {
            errors.push("quantization.group_size must be greater than 0".to_string());
        }
        if quant.mode == QuantMode::SmoothQuant {
            if self.calibration.data.is_none() {
                errors.push("smooth-quant needs calibration.data".to_string());
            }
            if quant.low_precision_checkpoint.is_some() {
                errors.push(
                    "quantization.low_precision_checkpoint only applies to weight-only mode"
                        .to_string(),
                );
            }
        }

        let calibration = &self.calibration;
        if calibration.batch_size == 0 {
            errors.push("calibration.batch_size must be greater than 0".to_string());
        }
        if calibration.max_batches == 0 || calibration.max_batches > MAX_CALIBRATION_BATCHES {
            errors.push(format!(
                "calibration.max_batches must be in 1..={}",
                MAX_CALIBRATION_BATCHES
            ));
        }
        if calibration.pad_max == 0 {
            errors.push("calibration.pad_max must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            return Err(QuantizationError::validation(errors));
        }
        Ok(())
    }

    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.model.config, base);
        absolutize_in_place(&mut self.model.weights, base);
        absolutize_in_place(&mut self.output_dir, base);
        for path in [
            self.quantization.low_precision_checkpoint.as_mut(),
            self.calibration.data.as_mut(),
        ]
        .into_iter()
        .flatten()
        {
            absolutize_in_place(path, base);
        }
    }
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() && !path.as_os_str().is_empty() {
        *path = base.join(&*path);
    }
}

fn default_alpha() -> f32 {
    DEFAULT_ALPHA
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(DEFAULT_OUTPUT_DIR)
}

fn default_batch_size() -> usize {
    1
}

fn default_max_batches() -> usize {
    MAX_CALIBRATION_BATCHES
}

fn default_pad_max() -> usize {
    PAD_MAX
}
