//! HF-style model hyper-parameters (`config.json`).

use std::path::Path;

use layers::{ActivationKind, EpsilonAttributes};
use serde::{Deserialize, Serialize};

use crate::{ModelError, ModelResult};

fn default_max_position_embeddings() -> usize {
    2048
}

fn default_rope_theta() -> f32 {
    10_000.0
}

/// Decoder hyper-parameters. Field names follow LLaMA configs; GPT-style
/// spellings are accepted as aliases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub vocab_size: usize,
    #[serde(alias = "n_embd")]
    pub hidden_size: usize,
    #[serde(alias = "n_inner")]
    pub intermediate_size: usize,
    #[serde(alias = "n_layer")]
    pub num_hidden_layers: usize,
    #[serde(alias = "n_head")]
    pub num_attention_heads: usize,
    #[serde(default = "default_max_position_embeddings", alias = "n_positions")]
    pub max_position_embeddings: usize,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f32,
    #[serde(default)]
    pub hidden_act: ActivationKind,
    #[serde(default)]
    pub tie_word_embeddings: bool,
    #[serde(default, alias = "rms_norm_eps", skip_serializing_if = "Option::is_none")]
    pub variance_epsilon: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epsilon: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eps: Option<f64>,
}

impl ModelConfig {
    /// Reads and validates a `config.json`.
    pub fn from_file(path: impl AsRef<Path>) -> ModelResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads.max(1)
    }

    /// The epsilon spellings found in the file.
    pub fn epsilon_attributes(&self) -> EpsilonAttributes {
        EpsilonAttributes {
            variance_epsilon: self.variance_epsilon,
            epsilon: self.epsilon,
            eps: self.eps,
        }
    }

    /// Resolved RMS norm epsilon.
    pub fn rms_norm_eps(&self) -> ModelResult<f64> {
        Ok(self.epsilon_attributes().resolve()?)
    }

    pub fn validate(&self) -> ModelResult<()> {
        let mut problems = Vec::new();
        if self.vocab_size == 0 {
            problems.push("vocab_size must be greater than zero".to_string());
        }
        if self.num_hidden_layers == 0 {
            problems.push("num_hidden_layers must be greater than zero".to_string());
        }
        if self.intermediate_size == 0 {
            problems.push("intermediate_size must be greater than zero".to_string());
        }
        if self.num_attention_heads == 0 || self.hidden_size % self.num_attention_heads != 0 {
            problems.push(format!(
                "hidden_size ({}) must be a multiple of num_attention_heads ({})",
                self.hidden_size, self.num_attention_heads
            ));
        } else if self.head_dim() % 2 != 0 {
            problems.push(format!("head_dim {} must be even for RoPE", self.head_dim()));
        }
        if let Err(err) = self.epsilon_attributes().resolve() {
            problems.push(err.to_string());
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(ModelError::Config(problems.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_llama_config_json() {
        let json = r#"{
            "architectures": ["LlamaForCausalLM"],
            "vocab_size": 32000,
            "hidden_size": 4096,
            "intermediate_size": 11008,
            "num_hidden_layers": 32,
            "num_attention_heads": 32,
            "max_position_embeddings": 4096,
            "hidden_act": "silu",
            "rms_norm_eps": 1e-6
        }"#;
        let config: ModelConfig = serde_json::from_str(json).unwrap();
        config.validate().unwrap();
        assert_eq!(config.head_dim(), 128);
        assert_eq!(config.rms_norm_eps().unwrap(), 1e-6);
        assert_eq!(config.rope_theta, 10_000.0);
        assert!(!config.tie_word_embeddings);
    }

    #[test]
    fn gpt_aliases_and_eps_spelling() {
        let json = r#"{
            "vocab_size": 16, "n_embd": 8, "n_inner": 16, "n_layer": 1, "n_head": 2,
            "n_positions": 64, "hidden_act": "gelu", "eps": 1e-5
        }"#;
        let config: ModelConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.max_position_embeddings, 64);
        assert_eq!(config.hidden_act, ActivationKind::Gelu);
        assert_eq!(config.rms_norm_eps().unwrap(), 1e-5);
    }

    #[test]
    fn missing_epsilon_is_a_config_error() {
        let json = r#"{
            "vocab_size": 16, "hidden_size": 8, "intermediate_size": 16,
            "num_hidden_layers": 1, "num_attention_heads": 2
        }"#;
        let config: ModelConfig = serde_json::from_str(json).unwrap();
        assert!(matches!(config.validate(), Err(ModelError::Config(_))));
    }

    #[test]
    fn manifest_round_trip_keeps_epsilon() {
        let json = r#"{
            "vocab_size": 16, "hidden_size": 8, "intermediate_size": 16,
            "num_hidden_layers": 1, "num_attention_heads": 2, "rms_norm_eps": 1e-6
        }"#;
        let config: ModelConfig = serde_json::from_str(json).unwrap();
        let back: ModelConfig = serde_json::from_str(&serde_json::to_string(&config).unwrap()).unwrap();
        assert_eq!(back, config);
    }
}
