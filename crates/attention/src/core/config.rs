//! Configuration options shared by all attention implementations.

/// Dtype used for score and softmax computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrecisionPolicy {
    /// Promote `q`, `k`, `v` to `f32` before any arithmetic.
    #[default]
    ForceF32,
    /// Keep matmuls in the input dtype (`bf16` widens to `f32`); softmax
    /// still runs in `f32`.
    Inherit,
}

/// Configuration driving attention kernels.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub precision: PrecisionPolicy,
    /// Number of keys processed per block by the flash kernel.
    pub flash_block_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            precision: PrecisionPolicy::ForceF32,
            flash_block_size: 64,
        }
    }
}

/// Per-call parameters of a scaled dot-product attention.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SdpaParams {
    /// Divisor applied to `q·kᵀ`.
    pub scale_attn: f32,
    /// Apply a causal mask aligned to the most recent keys.
    pub causal: bool,
}

impl SdpaParams {
    /// Causal attention with the conventional `sqrt(head_dim)` divisor.
    pub fn causal(head_dim: usize) -> Self {
        Self {
            scale_attn: (head_dim as f32).sqrt(),
            causal: true,
        }
    }
}
