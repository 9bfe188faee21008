use std::fmt;

use layers::LayerError;
use model::ModelError;

/// Failures of the quantization pipeline and of artifact loading.
#[derive(Debug)]
pub enum QuantizationError {
    Io(std::io::Error),
    /// A config, manifest or calibration file could not be parsed.
    Format(String),
    Validation(Vec<String>),
    /// The requested dtype / lowp / mode combination is not supported.
    Config(String),
    /// The low-precision checkpoint is missing data or malformed.
    Checkpoint(String),
    /// The frozen artifact is unreadable, stale or inconsistent.
    Artifact(String),
    Model(ModelError),
    Backend(String),
}

impl QuantizationError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn checkpoint(message: impl Into<String>) -> Self {
        Self::Checkpoint(message.into())
    }

    pub fn artifact(message: impl Into<String>) -> Self {
        Self::Artifact(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }
}

impl fmt::Display for QuantizationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuantizationError::Io(err) => write!(f, "i/o error: {}", err),
            QuantizationError::Format(err) => write!(f, "failed to parse input: {}", err),
            QuantizationError::Validation(messages) => {
                write!(f, "invalid configuration: {}", messages.join("; "))
            }
            QuantizationError::Config(msg) => write!(f, "unsupported quantization setup: {}", msg),
            QuantizationError::Checkpoint(msg) => {
                write!(f, "low-precision checkpoint error: {}", msg)
            }
            QuantizationError::Artifact(msg) => write!(f, "artifact error: {}", msg),
            QuantizationError::Model(err) => write!(f, "model error: {}", err),
            QuantizationError::Backend(msg) => write!(f, "tensor backend error: {}", msg),
        }
    }
}

impl std::error::Error for QuantizationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            QuantizationError::Io(err) => Some(err),
            QuantizationError::Model(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for QuantizationError {
    fn from(value: std::io::Error) -> Self {
        QuantizationError::Io(value)
    }
}

impl From<toml::de::Error> for QuantizationError {
    fn from(value: toml::de::Error) -> Self {
        QuantizationError::Format(value.to_string())
    }
}

impl From<serde_json::Error> for QuantizationError {
    fn from(value: serde_json::Error) -> Self {
        QuantizationError::Format(value.to_string())
    }
}

impl From<candle_core::Error> for QuantizationError {
    fn from(value: candle_core::Error) -> Self {
        QuantizationError::Backend(value.to_string())
    }
}

impl From<ModelError> for QuantizationError {
    fn from(value: ModelError) -> Self {
        QuantizationError::Model(value)
    }
}

impl From<LayerError> for QuantizationError {
    fn from(value: LayerError) -> Self {
        QuantizationError::Model(ModelError::Layer(value))
    }
}

impl From<safetensors::SafeTensorError> for QuantizationError {
    fn from(value: safetensors::SafeTensorError) -> Self {
        QuantizationError::Artifact(value.to_string())
    }
}

pub type QuantizationResult<T> = Result<T, QuantizationError>;
