//! End-to-end conversion: dense model in, frozen artifact out.

use std::path::PathBuf;

use candle_core::Device;
use model::{DenseWeights, Model, ModelConfig};

use crate::{
    artifact,
    calibration::CalibrationSet,
    checkpoint::LowPrecisionCheckpoint,
    config::{PipelineConfig, QuantMode},
    error::{QuantizationError, QuantizationResult},
    recipe::QuantRecipe,
    smooth_quant, weight_only,
};

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineReport {
    pub recipe: QuantRecipe,
    pub converted: usize,
    pub artifact: PathBuf,
}

/// Loads the dense model named by `config`, quantizes it and writes the
/// artifact into `config.output_dir`.
pub fn run(config: &PipelineConfig, device: &Device) -> QuantizationResult<PipelineReport> {
    config.validate()?;
    let recipe = QuantRecipe::resolve(config)?;
    log::info!("quantization recipe: {recipe}");

    let model_config = ModelConfig::from_file(&config.model.config)?;
    let mut model = {
        let weights = DenseWeights::load(&config.model.weights, device)?;
        Model::load(model_config, &weights)?
    };
    let converted = quantize_model(&mut model, &recipe, config)?;
    let artifact = artifact::save(&model, &recipe, &config.output_dir)?;
    Ok(PipelineReport {
        recipe,
        converted,
        artifact,
    })
}

/// Applies `recipe` to a loaded model in place; returns the number of
/// converted projections.
pub fn quantize_model(
    model: &mut Model,
    recipe: &QuantRecipe,
    config: &PipelineConfig,
) -> QuantizationResult<usize> {
    match recipe.mode {
        QuantMode::SmoothQuant => {
            let calibration = &config.calibration;
            let data = calibration
                .data
                .as_ref()
                .ok_or_else(|| QuantizationError::config("smooth-quant needs calibration data"))?;
            let set = CalibrationSet::from_jsonl(data, calibration.pad_max)?;
            let batches = set.batches(
                calibration.batch_size,
                calibration.max_batches,
                model.config().vocab_size,
                model.device(),
            )?;
            smooth_quant::prepare(model);
            smooth_quant::calibrate(model, &batches)?;
            let alpha = recipe.alpha.unwrap_or(config.quantization.alpha);
            smooth_quant::convert(model, alpha)
        }
        QuantMode::WeightOnly => {
            let lowp = recipe
                .lowp_mode
                .ok_or_else(|| QuantizationError::config("weight-only recipe without lowp mode"))?;
            match &config.quantization.low_precision_checkpoint {
                Some(path) => {
                    let checkpoint = LowPrecisionCheckpoint::load(path)?;
                    weight_only::load_from_checkpoint(model, &checkpoint, lowp)
                }
                None => weight_only::quantize(model, recipe.weight_dtype, recipe.group_size, lowp),
            }
        }
    }
}
