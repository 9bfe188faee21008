//! Building blocks for CPU inference layers.
//!
//! The crate hosts the precision policy shared by every kernel, RMS
//! normalisation, quantized weight containers and the linear projections that
//! dispatch between dense, weight-only and smooth-quant execution.

pub mod activations;
pub mod checks;
pub mod dtypes;
pub mod gemm;
pub mod linear;
pub mod mlp;
pub mod norm;
pub mod quant;

use thiserror::Error;

pub use activations::ActivationKind;
pub use dtypes::PrecisionPolicy;
pub use linear::{Linear, LinearConfig, LinearInit, LinearKernel, LinearLayer, LowpMode};
pub use mlp::{FeedForwardConfig, GatedMlp};
pub use norm::{EpsilonAttributes, NormConfig, NormalizationLayer, RmsNorm};
pub use quant::{ActivationObserver, QScheme, QuantDType, QuantizationConfig, QuantizedTensor};

/// Errors raised while assembling layers from external configuration.
#[derive(Debug, Error)]
pub enum LayerError {
    /// A required configuration value is missing or invalid.
    #[error("configuration error: {0}")]
    Config(String),
    /// Failure reported by the tensor backend.
    #[error(transparent)]
    Backend(#[from] candle_core::Error),
}
