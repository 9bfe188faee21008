//! Gated feed-forward block of LLaMA-style decoders.
//!
//! `down(act(gate(x)) * up(x))` over hidden states shaped `(.., hidden)`.
//! The three projections are ordinary [`Linear`] layers so quantization can
//! swap their kernels like any other projection.

use candle_core::{Result, Tensor};

use crate::{
    activations::ActivationKind,
    dtypes::PrecisionPolicy,
    linear::{Linear, LinearLayer},
};

/// Sizes and activation of a gated MLP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedForwardConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub activation: ActivationKind,
}

#[derive(Debug, Clone)]
pub struct GatedMlp {
    config: FeedForwardConfig,
    gate: Linear,
    up: Linear,
    down: Linear,
}

impl GatedMlp {
    pub fn new(config: FeedForwardConfig, gate: Linear, up: Linear, down: Linear) -> Result<Self> {
        let hidden = config.hidden_size;
        let inner = config.intermediate_size;
        for (name, layer, expected) in [
            ("mlp.gate_proj", &gate, (hidden, inner)),
            ("mlp.up_proj", &up, (hidden, inner)),
            ("mlp.down_proj", &down, (inner, hidden)),
        ] {
            let cfg = layer.config();
            if (cfg.input_dim, cfg.output_dim) != expected {
                return Err(candle_core::Error::Msg(format!(
                    "{name}: expected [{} -> {}], got [{} -> {}]",
                    expected.0, expected.1, cfg.input_dim, cfg.output_dim
                )));
            }
        }
        Ok(Self {
            config,
            gate,
            up,
            down,
        })
    }

    pub fn config(&self) -> &FeedForwardConfig {
        &self.config
    }

    /// Named projections in `gate`, `up`, `down` order.
    pub fn linears(&self) -> [(&'static str, &Linear); 3] {
        [
            ("gate_proj", &self.gate),
            ("up_proj", &self.up),
            ("down_proj", &self.down),
        ]
    }

    pub fn linears_mut(&mut self) -> [(&'static str, &mut Linear); 3] {
        [
            ("gate_proj", &mut self.gate),
            ("up_proj", &mut self.up),
            ("down_proj", &mut self.down),
        ]
    }

    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let gate = self.config.activation.forward(&self.gate.forward(hidden, policy)?, policy)?;
        let up = self.up.forward(hidden, policy)?;
        self.down.forward(&gate.mul(&up)?, policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linear::LinearConfig;
    use candle_core::{DType, Device};

    fn constant(out: usize, inp: usize, value: f32, device: &Device) -> Result<Linear> {
        Linear::new(
            LinearConfig::new(inp, out),
            Tensor::full(value, (out, inp), device)?.contiguous()?,
            None,
        )
    }

    #[test]
    fn gated_forward_matches_manual_composition() -> Result<()> {
        let device = Device::Cpu;
        let config = FeedForwardConfig {
            hidden_size: 2,
            intermediate_size: 3,
            activation: ActivationKind::Silu,
        };
        let mlp = GatedMlp::new(
            config,
            constant(3, 2, 0.5, &device)?,
            constant(3, 2, 1.0, &device)?,
            constant(2, 3, 0.25, &device)?,
        )?;
        let input = Tensor::from_vec(vec![1.0f32, 1.0], (1, 1, 2), &device)?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        let out = mlp.forward(&input, &policy)?.flatten_all()?.to_vec1::<f32>()?;

        // gate = silu(1.0), up = 2.0, down sums three equal terms.
        let silu_one = 1.0 / (1.0 + (-1.0f32).exp());
        let expected = 0.25 * 3.0 * silu_one * 2.0;
        for v in out {
            assert!((v - expected).abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn rejects_swapped_projection() -> Result<()> {
        let device = Device::Cpu;
        let config = FeedForwardConfig {
            hidden_size: 2,
            intermediate_size: 3,
            activation: ActivationKind::Gelu,
        };
        let result = GatedMlp::new(
            config,
            constant(3, 2, 0.5, &device)?,
            constant(2, 3, 1.0, &device)?,
            constant(2, 3, 0.25, &device)?,
        );
        assert!(result.is_err());
        Ok(())
    }
}
