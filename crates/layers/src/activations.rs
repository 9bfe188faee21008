//! Gate non-linearities, selected by the model config's `hidden_act`.

use candle_core::{Result, Tensor};
use serde::{Deserialize, Serialize};

use crate::dtypes::PrecisionPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationKind {
    #[default]
    #[serde(alias = "swish")]
    Silu,
    /// Exact erf form.
    Gelu,
    /// Tanh approximation, as used by GPT-J style checkpoints.
    #[serde(alias = "gelu_pytorch_tanh")]
    GeluNew,
}

impl ActivationKind {
    /// Evaluates in the compute dtype and returns in storage.
    pub fn forward(self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let x = policy.cast_for_matmul(input)?;
        let y = match self {
            ActivationKind::Silu => x.silu()?,
            ActivationKind::Gelu => x.gelu_erf()?,
            ActivationKind::GeluNew => x.gelu()?,
        };
        policy.cast_to_storage(&y)
    }
}
