//! Resolution of the user-facing settings into a concrete quantization recipe.
//!
//! Weight dtype defaults to INT8, or INT4 when a low-precision checkpoint is
//! supplied. `lowp_mode = auto` selects INT8 for INT4 weights and for
//! checkpoints, BF16 otherwise. The recipe is hashed into the artifact so a
//! stale or edited manifest is rejected on load.

use layers::{LowpMode, QuantDType};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    config::{LowpSetting, PipelineConfig, QuantMode},
    error::{QuantizationError, QuantizationResult},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantRecipe {
    pub mode: QuantMode,
    pub weight_dtype: QuantDType,
    /// Execution precision of weight-only linears; `None` for smooth-quant.
    pub lowp_mode: Option<LowpMode>,
    /// Migration strength; only meaningful for smooth-quant.
    pub alpha: Option<f32>,
    pub group_size: Option<usize>,
    pub from_checkpoint: bool,
}

impl QuantRecipe {
    pub fn resolve(config: &PipelineConfig) -> QuantizationResult<Self> {
        let settings = &config.quantization;
        let has_checkpoint = settings.low_precision_checkpoint.is_some();
        let weight_dtype = resolve_weight_dtype(settings.weight_dtype, has_checkpoint)?;
        match settings.mode {
            QuantMode::SmoothQuant => {
                if weight_dtype == QuantDType::Int4 {
                    return Err(QuantizationError::config(
                        "smooth-quant only supports INT8 weights",
                    ));
                }
                if has_checkpoint {
                    return Err(QuantizationError::config(
                        "a low-precision checkpoint requires weight-only mode",
                    ));
                }
                Ok(Self {
                    mode: QuantMode::SmoothQuant,
                    weight_dtype,
                    lowp_mode: None,
                    alpha: Some(settings.alpha),
                    group_size: None,
                    from_checkpoint: false,
                })
            }
            QuantMode::WeightOnly => {
                let lowp = resolve_lowp_mode(settings.lowp_mode, weight_dtype, has_checkpoint)?;
                let group_size = match (weight_dtype, settings.group_size) {
                    (QuantDType::Int8, Some(group)) => {
                        log::warn!("group_size {group} ignored for INT8 weights");
                        None
                    }
                    (_, group) => group,
                };
                Ok(Self {
                    mode: QuantMode::WeightOnly,
                    weight_dtype,
                    lowp_mode: Some(lowp),
                    alpha: None,
                    group_size: if has_checkpoint { None } else { group_size },
                    from_checkpoint: has_checkpoint,
                })
            }
        }
    }

    /// Hex SHA-256 of the recipe's JSON form.
    pub fn fingerprint(&self) -> QuantizationResult<String> {
        let json = serde_json::to_vec(self)?;
        Ok(hex::encode(Sha256::digest(json)))
    }
}

impl std::fmt::Display for QuantRecipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.mode {
            QuantMode::SmoothQuant => write!(
                f,
                "smooth-quant {} alpha={}",
                self.weight_dtype,
                self.alpha.unwrap_or_default()
            ),
            QuantMode::WeightOnly => {
                write!(f, "weight-only {}", self.weight_dtype)?;
                if let Some(lowp) = self.lowp_mode {
                    write!(f, " lowp={lowp}")?;
                }
                if let Some(group) = self.group_size {
                    write!(f, " group={group}")?;
                }
                if self.from_checkpoint {
                    f.write_str(" (checkpoint)")?;
                }
                Ok(())
            }
        }
    }
}

/// A checkpoint always carries INT4 weights.
pub fn resolve_weight_dtype(
    requested: Option<QuantDType>,
    has_checkpoint: bool,
) -> QuantizationResult<QuantDType> {
    match (requested, has_checkpoint) {
        (Some(QuantDType::Int8), true) => Err(QuantizationError::config(
            "a low-precision checkpoint holds INT4 weights, INT8 was requested",
        )),
        (_, true) => Ok(QuantDType::Int4),
        (Some(dtype), false) => Ok(dtype),
        (None, false) => Ok(QuantDType::Int8),
    }
}

pub fn resolve_lowp_mode(
    setting: LowpSetting,
    weight_dtype: QuantDType,
    has_checkpoint: bool,
) -> QuantizationResult<LowpMode> {
    let lowp = match setting {
        LowpSetting::Auto => {
            if has_checkpoint || weight_dtype == QuantDType::Int4 {
                LowpMode::Int8
            } else {
                LowpMode::Bf16
            }
        }
        LowpSetting::Fp32 => LowpMode::Fp32,
        LowpSetting::Fp16 => LowpMode::Fp16,
        LowpSetting::Bf16 => LowpMode::Bf16,
        LowpSetting::Int8 => LowpMode::Int8,
    };
    if setting == LowpSetting::Int8 && weight_dtype == QuantDType::Int8 {
        return Err(QuantizationError::config(
            "lowp_mode INT8 is not supported with INT8 weights",
        ));
    }
    Ok(lowp)
}
