//! Fused attention: the tiled flash kernel and the cache-aware executor.

pub mod executor;
pub mod flash;

pub use executor::{AttentionMode, AttentionOutput, ExecutorConfig, FusedAttention};
pub use flash::FlashAttention;
