use std::fmt;

use candle_core::DType;

/// Failures of the attention kernels and the key/value cache.
#[derive(Debug)]
pub enum AttentionError {
    InvalidShape { context: String },
    /// Kernels run on `f32`, `f16` and `bf16` only.
    UnsupportedDType { dtype: DType },
    /// An append would grow the cache past `text_max_length`.
    Capacity { required: usize, capacity: usize },
    /// A beam selection picked a parent row of another batch item.
    BeamSelection { row: usize, parent: usize },
    Backend(candle_core::Error),
}

impl fmt::Display for AttentionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttentionError::InvalidShape { context } => write!(f, "invalid tensor shape: {context}"),
            AttentionError::UnsupportedDType { dtype } => {
                write!(f, "attention does not support {dtype:?} inputs")
            }
            AttentionError::Capacity { required, capacity } => write!(
                f,
                "kv cache needs {required} positions but text_max_length is {capacity}"
            ),
            AttentionError::BeamSelection { row, parent } => write!(
                f,
                "beam selection maps row {row} to row {parent} outside its batch item"
            ),
            AttentionError::Backend(err) => write!(f, "tensor backend: {err}"),
        }
    }
}

impl std::error::Error for AttentionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AttentionError::Backend(err) => Some(err),
            _ => None,
        }
    }
}

impl From<candle_core::Error> for AttentionError {
    fn from(err: candle_core::Error) -> Self {
        AttentionError::Backend(err)
    }
}

pub(crate) fn shape_err(context: impl Into<String>) -> AttentionError {
    AttentionError::InvalidShape {
        context: context.into(),
    }
}
