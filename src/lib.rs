//! CPU inference kernels for decoder LLMs.
//!
//! The member crates are re-exported under their own names; the most used
//! types are also available from [`prelude`].

pub use attention;
pub use embedding;
pub use layers;
pub use model;
pub use quantization;

pub mod prelude {
    pub use attention::{
        AttentionError, AttentionMode, ExecutorConfig, FusedAttention, KeyValueCache, KvCacheEntry,
    };
    pub use embedding::{RopeConfig, RotaryEmbedding};
    pub use layers::{Linear, LowpMode, QuantDType, RmsNorm};
    pub use model::{generate, CacheMode, DenseWeights, GenerationConfig, Model, ModelConfig};
    pub use quantization::{PipelineConfig, QuantRecipe, QuantizationError};
}

use candle_core::Device;

/// Inference runs on the host CPU; logs the platform once for benchmark
/// reports.
pub fn setup_device() -> Device {
    log::info!(
        "cpu backend: {} {} ({} rayon threads)",
        std::env::consts::OS,
        std::env::consts::ARCH,
        rayon::current_num_threads()
    );
    Device::Cpu
}
