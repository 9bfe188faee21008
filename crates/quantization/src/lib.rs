//! Post-training quantization of the decoder projections.
//!
//! A [`PipelineConfig`] names a dense model and a recipe. Smooth-quant
//! calibrates activation ranges and converts every projection to INT8 weights
//! and activations; weight-only mode stores INT8 or INT4 weights, quantized
//! here or read from a low-precision checkpoint. The result is frozen into a
//! single safetensors [`artifact`] that reloads without recalibration.

pub mod artifact;
pub mod benchmark;
pub mod calibration;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod recipe;
pub mod smooth_quant;
pub mod weight_only;

pub use artifact::{ArtifactManifest, ArtifactWeights, KernelPlan, LinearPlan, LoadedArtifact};
pub use benchmark::BenchmarkOptions;
pub use calibration::{CalibrationBatch, CalibrationSet, MAX_CALIBRATION_BATCHES};
pub use checkpoint::LowPrecisionCheckpoint;
pub use config::{LowpSetting, PipelineConfig, QuantMode};
pub use error::{QuantizationError, QuantizationResult};
pub use pipeline::PipelineReport;
pub use recipe::{resolve_lowp_mode, resolve_weight_dtype, QuantRecipe};
