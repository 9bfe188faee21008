//! Minimal LLaMA-style decoder that drives the attention executor.
//!
//! The model exists to feed [`attention::FusedAttention`] and its per-layer
//! caches: token embedding, pre-norm decoder blocks with RoPE and a gated MLP,
//! a final RMS norm and a dense lm head. Weights come through the
//! [`WeightSource`] seam so quantized artifacts can rebuild the same graph with
//! different linear kernels.

pub mod block;
pub mod config;
pub mod generation;
pub mod model;
pub mod weights;

use attention::AttentionError;
use embedding::RopeError;
use layers::LayerError;
use thiserror::Error;

pub use block::DecoderBlock;
pub use config::ModelConfig;
pub use generation::{generate, GenerationConfig, GenerationOutput, LatencySummary};
pub use model::{CacheMode, Model, ModelOutput};
pub use weights::{DenseWeights, WeightSource};

/// Errors raised while loading or running the model.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model config: {0}")]
    Config(String),
    #[error("missing weight `{0}`")]
    MissingWeight(String),
    #[error("invalid input: {0}")]
    Input(String),
    #[error(transparent)]
    Layer(#[from] LayerError),
    #[error(transparent)]
    Attention(#[from] AttentionError),
    #[error(transparent)]
    Rope(#[from] RopeError),
    #[error(transparent)]
    Backend(#[from] candle_core::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type ModelResult<T> = std::result::Result<T, ModelError>;

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(Model: Send, Sync);
    assert_impl_all!(ModelError: std::error::Error, Send, Sync);
}
