//! Attention kernels and key/value cache management for CPU decoding.
//!
//! Kernels work on head-major tensors `[batch, n_heads, seq_len, head_dim]`
//! and return the dtype of the query; reductions run in `f32`. Two kernels
//! implement [`Attention`]: [`reference::ExactAttention`], which materializes
//! the probabilities, and [`fused::FlashAttention`], which tiles keys with an
//! online softmax.
//!
//! Decoder layers call [`fused::FusedAttention`], which takes sequence-major
//! projections and a per-layer [`kv_cache::KvCacheEntry`] and runs one of
//! three [`fused::AttentionMode`]s: plain causal attention, cached attention
//! with beam reindexing, or a sliding window over the most recent positions.

pub mod core;
pub mod fused;
pub mod kv_cache;
pub mod masks;
pub mod reference;

pub use crate::core::{Attention, AttentionError, Config, SdpaParams};
pub use fused::{AttentionMode, AttentionOutput, ExecutorConfig, FusedAttention};
pub use kv_cache::{CacheLayout, KeyValueCache, KvCacheEntry};

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(FusedAttention: Send, Sync);
    assert_impl_all!(AttentionError: std::error::Error, Send, Sync);
}
